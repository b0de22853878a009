//! Connected TCP peer
//!
//! A [`Peer`] owns one socket, one [`PeerBuffer`] and the idle timeout used
//! for every wait. It is either created unconnected and brought up with
//! [`Peer::connect`], or adopted from an already accepted descriptor.
//!
//! Any failed read or write closes the peer. After that every transfer fails
//! with [`Error::NotConnected`] without touching the old descriptor.

use std::net::TcpStream;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use socket2::Socket;
use tracing::debug;

use super::buffer::{PeerBuffer, DEFAULT_BUFFER_SEGMENTS, DEFAULT_SEGMENT_SIZE};
use super::poll::IdleTimeout;
use super::tcp::{tune_socket, Target, TcpConnector};
use super::{io, Error, Result, SockAddr};

/// Builder for [`Peer`].
#[derive(Debug, Clone)]
pub struct PeerBuilder {
    target: Target,
    connector: TcpConnector,
    timeout: IdleTimeout,
    segment_size: usize,
    buffer_segments: usize,
    close_on_usage_error: bool,
}

impl PeerBuilder {
    fn new(target: Target) -> Self {
        PeerBuilder {
            target,
            connector: TcpConnector::new(),
            timeout: IdleTimeout::default(),
            segment_size: DEFAULT_SEGMENT_SIZE,
            buffer_segments: DEFAULT_BUFFER_SEGMENTS,
            close_on_usage_error: true,
        }
    }

    /// Idle timeout for connect and every later read or write wait
    pub fn timeout(mut self, timeout: impl Into<IdleTimeout>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// Local interface (name or IP, optionally `:port`) to bind before connecting
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.connector = self.connector.interface(interface);
        self
    }

    /// Local port to bind, overriding any port in the interface descriptor
    pub fn local_port(mut self, port: u16) -> Self {
        self.connector = self.connector.local_port(port);
        self
    }

    /// Allow or forbid IPv4
    pub fn ipv4(mut self, enabled: bool) -> Self {
        self.connector = self.connector.ipv4(enabled);
        self
    }

    /// Allow or forbid IPv6
    pub fn ipv6(mut self, enabled: bool) -> Self {
        self.connector = self.connector.ipv6(enabled);
        self
    }

    /// Prefer IPv4 when both families resolve
    pub fn prefer_ipv4(mut self, prefer: bool) -> Self {
        self.connector = self.connector.prefer_ipv4(prefer);
        self
    }

    /// Set TCP_NODELAY on the connected socket
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.connector = self.connector.nodelay(nodelay);
        self
    }

    /// Segment size the buffer is a multiple of
    pub fn segment_size(mut self, bytes: usize) -> Self {
        self.segment_size = bytes;
        self
    }

    /// Number of segments in the buffer
    pub fn buffer_segments(mut self, segments: usize) -> Self {
        self.buffer_segments = segments;
        self
    }

    /// Whether an empty write, zero-length read or empty separator also
    /// closes the connection (default: true).
    pub fn close_on_usage_error(mut self, close: bool) -> Self {
        self.close_on_usage_error = close;
        self
    }

    /// Create the unconnected peer
    pub fn build(self) -> Peer {
        Peer {
            target: Some(self.target),
            connector: self.connector,
            timeout: self.timeout,
            socket: None,
            local: None,
            remote: None,
            buffer: PeerBuffer::new(self.segment_size, self.buffer_segments),
            close_on_usage_error: self.close_on_usage_error,
        }
    }
}

/// A blocking TCP endpoint with deadline-bounded I/O.
///
/// Not meant to be shared: one operation at a time per peer.
#[derive(Debug)]
pub struct Peer {
    target: Option<Target>,
    connector: TcpConnector,
    timeout: IdleTimeout,
    socket: Option<Socket>,
    local: Option<SockAddr>,
    remote: Option<SockAddr>,
    buffer: PeerBuffer,
    close_on_usage_error: bool,
}

impl Peer {
    /// Builder for a peer that connects to `host:port`
    pub fn builder(host: impl Into<String>, port: u16) -> PeerBuilder {
        PeerBuilder::new(Target::host(host, port))
    }

    /// Builder for a peer that connects to an already resolved address
    pub fn builder_for_addr(addr: SockAddr) -> PeerBuilder {
        PeerBuilder::new(Target::Addr(addr))
    }

    /// Unconnected peer for `host:port` with the default timeout
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::builder(host, port).build()
    }

    /// Unconnected peer for `host:port` with the given timeout
    pub fn with_timeout(host: impl Into<String>, port: u16, timeout: impl Into<IdleTimeout>) -> Self {
        Self::builder(host, port).timeout(timeout).build()
    }

    /// Unconnected peer for a resolved address
    pub fn from_addr(addr: SockAddr) -> Self {
        Self::builder_for_addr(addr).build()
    }

    /// Adopt an already connected descriptor, typically from accept(2).
    ///
    /// The descriptor is switched to non-blocking mode and gets the same
    /// socket options as an outgoing connection.
    pub fn from_fd(fd: OwnedFd, timeout: impl Into<IdleTimeout>) -> Result<Self> {
        let socket = Socket::from(fd);
        let buffer = PeerBuffer::default();
        socket.set_nonblocking(true)?;
        tune_socket(&socket, true, Some(buffer.capacity()))?;

        let remote = socket
            .peer_addr()
            .ok()
            .and_then(|addr| SockAddr::try_from(&addr).ok());
        debug!(fd = socket.as_raw_fd(), remote = ?remote, "adopted descriptor");

        Ok(Peer {
            target: None,
            connector: TcpConnector::new(),
            timeout: timeout.into(),
            socket: Some(socket),
            local: None,
            remote,
            buffer,
            close_on_usage_error: true,
        })
    }

    /// Adopt an accepted [`TcpStream`]
    pub fn from_stream(stream: TcpStream, timeout: impl Into<IdleTimeout>) -> Result<Self> {
        Self::from_fd(OwnedFd::from(stream), timeout)
    }

    /// Connect to the configured target.
    ///
    /// Fails without side effects if already connected. Any other failure
    /// leaves the peer closed.
    pub fn connect(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Err(Error::Config("already connected".to_string()));
        }
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| Error::Config("peer has no connect target".to_string()))?;

        let result = self
            .connector
            .clone()
            .timeout(self.timeout)
            .recv_buffer_size(self.buffer.capacity())
            .connect(target);

        match result {
            Ok(conn) => {
                self.socket = Some(conn.socket);
                self.local = conn.local;
                self.remote = Some(conn.remote);
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Whether the socket exists and still has a peer.
    pub fn is_connected(&self) -> bool {
        self.socket.as_ref().is_some_and(|s| s.peer_addr().is_ok())
    }

    /// Close the connection. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            debug!(fd = socket.as_raw_fd(), "closing");
        }
        self.local = None;
        self.remote = None;
    }

    fn socket(&self) -> Result<&Socket> {
        self.socket.as_ref().ok_or(Error::NotConnected)
    }

    fn fail<T>(&mut self, err: Error) -> Result<T> {
        if self.close_on_usage_error || !matches!(err, Error::Config(_)) {
            self.close();
        }
        Err(err)
    }

    /// Send all of `data`.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;
        match io::write_all(socket, &self.buffer, data, self.timeout) {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e),
        }
    }

    /// Send the first `len` bytes of the internal buffer.
    pub fn write_from_buffer(&mut self, len: usize) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;
        match io::write_buffered(socket, &self.buffer, len, self.timeout) {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e),
        }
    }

    /// Receive exactly `len` bytes.
    pub fn read_to_length(&mut self, len: usize) -> Result<&[u8]> {
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;
        match io::read_exact(socket, &mut self.buffer, len, self.timeout) {
            Ok(()) => Ok(&self.buffer[..len]),
            Err(e) => self.fail(e),
        }
    }

    /// Receive up to and including `separator`.
    pub fn read_to_delimiter(&mut self, separator: &[u8]) -> Result<&[u8]> {
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;
        match io::read_until(socket, &mut self.buffer, separator, self.timeout) {
            Ok(len) => Ok(&self.buffer[..len]),
            Err(e) => self.fail(e),
        }
    }

    /// The internal page-aligned buffer, for staging outgoing data.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Size of the internal buffer in bytes
    pub fn buffer_capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Current idle timeout
    pub fn timeout(&self) -> IdleTimeout {
        self.timeout
    }

    /// Change the idle timeout for subsequent operations.
    pub fn set_timeout(&mut self, timeout: impl Into<IdleTimeout>) {
        self.timeout = timeout.into();
    }

    /// Current TCP maximum segment size.
    pub fn segment_size(&self) -> Result<u32> {
        Ok(self.socket()?.mss()?)
    }

    /// Set the TCP maximum segment size
    pub fn set_segment_size(&self, bytes: u32) -> Result<()> {
        Ok(self.socket()?.set_mss(bytes)?)
    }

    /// Configured target host, if this peer was created to connect out
    pub fn host(&self) -> Option<&str> {
        match &self.target {
            Some(Target::Host { host, .. }) => Some(host),
            _ => None,
        }
    }

    /// Configured target port, if this peer was created to connect out
    pub fn port(&self) -> Option<u16> {
        match &self.target {
            Some(Target::Host { port, .. }) => Some(*port),
            Some(Target::Addr(addr)) => Some(addr.port()),
            None => None,
        }
    }

    /// Descriptor of the open socket, if any
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }

    /// Local address the kernel reports for the socket.
    pub fn local_addr(&self) -> Option<SockAddr> {
        let addr = self.socket.as_ref()?.local_addr().ok()?;
        SockAddr::try_from(&addr).ok()
    }

    /// Remote address the kernel reports for the socket.
    pub fn remote_addr(&self) -> Option<SockAddr> {
        let addr = self.socket.as_ref()?.peer_addr().ok()?;
        SockAddr::try_from(&addr).ok()
    }

    /// Local address requested through the interface option, if any
    pub fn bound_addr(&self) -> Option<SockAddr> {
        self.local
    }

    /// Remote address chosen at connect or adopt time
    pub fn connected_addr(&self) -> Option<SockAddr> {
        self.remote
    }

    /// Local address as text
    pub fn local_host(&self) -> Option<String> {
        self.local_addr().map(|a| a.addr_string())
    }

    /// Local port
    pub fn local_port(&self) -> Option<u16> {
        self.local_addr().map(|a| a.port())
    }

    /// Remote address as text
    pub fn remote_host(&self) -> Option<String> {
        self.remote_addr().map(|a| a.addr_string())
    }

    /// Remote port
    pub fn remote_port(&self) -> Option<u16> {
        self.remote_addr().map(|a| a.port())
    }

    /// True for IPv4 sockets and for IPv6 sockets carrying a mapped IPv4 peer.
    pub fn is_ipv4(&self) -> bool {
        match self.local_addr() {
            Some(SockAddr::V4(_)) => true,
            Some(SockAddr::V6(_)) => self.remote_addr().is_some_and(|a| a.is_ipv4_mapped()),
            None => false,
        }
    }

    /// True for IPv6 sockets whose peer is not a mapped IPv4 address
    pub fn is_ipv6(&self) -> bool {
        self.local_addr().is_some_and(|a| a.is_ipv6())
    }
}

impl AsRawFd for Peer {
    /// Returns -1 once closed.
    fn as_raw_fd(&self) -> RawFd {
        self.raw_fd().unwrap_or(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    fn connected_pair() -> (Peer, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut peer = Peer::builder("127.0.0.1", port)
            .timeout(Duration::from_secs(5))
            .build();
        peer.connect().unwrap();
        let (server, _) = listener.accept().unwrap();
        (peer, server)
    }

    #[test]
    fn test_unconnected_peer() {
        let mut peer = Peer::new("localhost", 80);
        assert!(!peer.is_connected());
        assert_eq!(peer.host(), Some("localhost"));
        assert_eq!(peer.port(), Some(80));
        assert_eq!(peer.timeout(), IdleTimeout::default());
        assert!(matches!(peer.write(b"x"), Err(Error::NotConnected)));
        assert!(matches!(peer.read_to_length(1), Err(Error::NotConnected)));
        assert!(matches!(peer.read_to_delimiter(b"\n"), Err(Error::NotConnected)));
        assert!(peer.local_addr().is_none());
        assert_eq!(peer.as_raw_fd(), -1);
    }

    #[test]
    fn test_connect_twice_keeps_connection() {
        let (mut peer, _server) = connected_pair();
        assert!(matches!(peer.connect(), Err(Error::Config(_))));
        assert!(peer.is_connected());
    }

    #[test]
    fn test_diagnostics() {
        let (peer, server) = connected_pair();
        assert!(peer.is_ipv4());
        assert!(!peer.is_ipv6());
        assert_eq!(peer.remote_host().as_deref(), Some("127.0.0.1"));
        assert_eq!(peer.remote_port(), Some(server.local_addr().unwrap().port()));
        assert_eq!(peer.local_port(), Some(server.peer_addr().unwrap().port()));
        assert_eq!(peer.connected_addr(), peer.remote_addr());
        assert!(peer.bound_addr().is_none());
        assert!(peer.segment_size().unwrap() > 0);
    }

    #[test]
    fn test_read_to_length() {
        let (mut peer, mut server) = connected_pair();
        server.write_all(b"hello world").unwrap();
        assert_eq!(peer.read_to_length(5).unwrap(), b"hello");
        assert_eq!(peer.read_to_length(6).unwrap(), b" world");
    }

    #[test]
    fn test_write_from_buffer() {
        let (mut peer, mut server) = connected_pair();
        peer.buffer_mut()[..4].copy_from_slice(b"ping");
        peer.write_from_buffer(4).unwrap();
        let mut got = [0u8; 4];
        server.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ping");
    }

    #[test]
    fn test_empty_write_closes_by_default() {
        let (mut peer, _server) = connected_pair();
        assert!(matches!(peer.write(b""), Err(Error::Config(_))));
        assert!(!peer.is_connected());
        assert!(matches!(peer.write(b"x"), Err(Error::NotConnected)));
    }

    #[test]
    fn test_empty_write_can_keep_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut peer = Peer::builder("127.0.0.1", port)
            .close_on_usage_error(false)
            .build();
        peer.connect().unwrap();
        let (mut server, _) = listener.accept().unwrap();

        assert!(matches!(peer.write(b""), Err(Error::Config(_))));
        assert!(matches!(peer.read_to_length(0), Err(Error::Config(_))));
        assert!(matches!(peer.read_to_delimiter(b""), Err(Error::Config(_))));
        assert!(peer.is_connected());

        peer.write(b"ok").unwrap();
        let mut got = [0u8; 2];
        server.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ok");
    }

    #[test]
    fn test_read_past_capacity() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut peer = Peer::builder("127.0.0.1", port)
            .segment_size(4)
            .buffer_segments(2)
            .build();
        assert_eq!(peer.buffer_capacity(), 8);
        peer.connect().unwrap();
        let _first = listener.accept().unwrap();

        assert!(matches!(peer.read_to_length(9), Err(Error::Capacity { capacity: 8 })));
        assert!(!peer.is_connected());

        let mut peer = Peer::builder("127.0.0.1", port)
            .segment_size(4)
            .buffer_segments(2)
            .build();
        peer.connect().unwrap();
        let (mut server, _) = listener.accept().unwrap();
        server.write_all(b"0123456789\n").unwrap();
        assert!(matches!(
            peer.read_to_delimiter(b"\n"),
            Err(Error::Capacity { capacity: 8 })
        ));
        assert!(!peer.is_connected());
    }

    #[test]
    fn test_from_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        let mut peer = Peer::from_stream(accepted, Duration::from_secs(5)).unwrap();
        assert!(peer.is_connected());
        assert!(peer.host().is_none());

        client.write_all(b"line\r\n").unwrap();
        assert_eq!(peer.read_to_delimiter(b"\r\n").unwrap(), b"line\r\n");

        assert!(peer.connected_addr().is_some());

        peer.close();
        assert!(!peer.is_connected());
        assert!(peer.connected_addr().is_none());
        assert!(peer.local_addr().is_none());
        assert!(peer.remote_addr().is_none());
        assert!(matches!(peer.connect(), Err(Error::Config(_))));
    }
}
