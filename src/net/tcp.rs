//! TCP connection establishment
//!
//! [`TcpConnector`] resolves a target, picks one address family, tunes and
//! optionally binds a fresh socket, then connects without blocking past the
//! configured timeout. Only one family is tried per call.

use std::io;
use std::os::fd::AsRawFd;

use socket2::{Protocol, Socket, Type};
use tracing::{debug, warn};

use super::interface::{InterfaceSpec, LocalAddrs};
use super::poll::{wait_ready, IdleTimeout, Interest};
use super::resolver::{CandidatePair, Resolver};
use super::{AddressFamily, Error, Result, SockAddr};

/// Which address families may be used, and which one wins when both resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectConfig {
    pub ipv4_enabled: bool,
    pub ipv6_enabled: bool,
    pub prefer_ipv4: bool,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        ConnectConfig {
            ipv4_enabled: true,
            ipv6_enabled: true,
            prefer_ipv4: true,
        }
    }
}

impl ConnectConfig {
    /// Fail with `Error::Config` when both families are disabled
    pub fn validate(&self) -> Result<()> {
        if !self.ipv4_enabled && !self.ipv6_enabled {
            return Err(Error::Config("both IPv4 and IPv6 are disabled".to_string()));
        }
        Ok(())
    }

    /// Remove candidates whose family is disabled.
    pub fn filter(&self, mut pair: CandidatePair) -> CandidatePair {
        if !self.ipv4_enabled {
            pair = pair.without(AddressFamily::Ipv4);
        }
        if !self.ipv6_enabled {
            pair = pair.without(AddressFamily::Ipv6);
        }
        pair
    }
}

/// Pick the family to connect with.
///
/// IPv4 wins when it is enabled and either preferred with a candidate
/// present, or the only family with a candidate. Otherwise IPv6, if it has
/// an enabled candidate.
pub fn select_family(config: &ConnectConfig, candidates: &CandidatePair) -> Option<AddressFamily> {
    let has_v4 = config.ipv4_enabled && candidates.v4.is_some();
    let has_v6 = config.ipv6_enabled && candidates.v6.is_some();

    if has_v4 && (config.prefer_ipv4 || !has_v6) {
        Some(AddressFamily::Ipv4)
    } else if has_v6 {
        Some(AddressFamily::Ipv6)
    } else {
        None
    }
}

/// What to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A host name or literal IP, resolved at connect time
    Host { host: String, port: u16 },
    /// An already resolved remote address
    Addr(SockAddr),
}

impl Target {
    /// Target a host name or literal IP
    pub fn host(host: impl Into<String>, port: u16) -> Self {
        Target::Host {
            host: host.into(),
            port,
        }
    }

    /// Target a raw `sockaddr_in`/`sockaddr_in6` byte blob.
    pub fn from_raw_bytes(bytes: &[u8]) -> Result<Self> {
        SockAddr::from_raw_bytes(bytes).map(Target::Addr)
    }

    fn candidates(&self) -> Result<CandidatePair> {
        match self {
            Target::Host { host, port } => Resolver::resolve_pair(host, *port),
            Target::Addr(addr) => Ok(CandidatePair::from_addrs([*addr])),
        }
    }
}

/// A freshly connected socket and the addresses it was set up with.
#[derive(Debug)]
pub struct Connection {
    pub socket: Socket,
    /// Local address bound before connecting, if an interface was requested
    pub local: Option<SockAddr>,
    pub remote: SockAddr,
}

/// TCP connection builder with timeout support
#[derive(Debug, Clone)]
pub struct TcpConnector {
    config: ConnectConfig,
    timeout: IdleTimeout,
    nodelay: bool,
    interface: Option<String>,
    local_port: Option<u16>,
    recv_buffer_size: Option<usize>,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpConnector {
    /// Create a new TCP connector with default settings
    pub fn new() -> Self {
        TcpConnector {
            config: ConnectConfig::default(),
            timeout: IdleTimeout::default(),
            nodelay: true,
            interface: None,
            local_port: None,
            recv_buffer_size: None,
        }
    }

    /// Set connection timeout
    pub fn timeout(mut self, timeout: impl Into<IdleTimeout>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// Set TCP_NODELAY option
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Replace the whole family configuration
    pub fn config(mut self, config: ConnectConfig) -> Self {
        self.config = config;
        self
    }

    /// Allow or forbid IPv4
    pub fn ipv4(mut self, enabled: bool) -> Self {
        self.config.ipv4_enabled = enabled;
        self
    }

    /// Allow or forbid IPv6
    pub fn ipv6(mut self, enabled: bool) -> Self {
        self.config.ipv6_enabled = enabled;
        self
    }

    /// Prefer IPv4 when both families resolve
    pub fn prefer_ipv4(mut self, prefer: bool) -> Self {
        self.config.prefer_ipv4 = prefer;
        self
    }

    /// Bind to this interface (name or IP, optionally `:port`) before connecting
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Local port to bind, overriding any port in the interface descriptor
    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    /// Ask for a receive buffer of this size (best effort)
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    /// Current family configuration
    pub fn connect_config(&self) -> &ConnectConfig {
        &self.config
    }

    /// Current connect timeout
    pub fn connect_timeout(&self) -> IdleTimeout {
        self.timeout
    }

    /// Connect to a host name and port
    pub fn connect_host(&self, host: &str, port: u16) -> Result<Connection> {
        self.connect(&Target::host(host, port))
    }

    /// Connect to a target
    pub fn connect(&self, target: &Target) -> Result<Connection> {
        self.config.validate()?;

        let local = self.local_candidates()?;

        let remote = self.config.filter(target.candidates()?);
        if remote.is_empty() {
            return Err(Error::Config(format!(
                "{:?} resolved only to disabled address families",
                target
            )));
        }

        let family = select_family(&self.config, &remote)
            .ok_or_else(|| Error::Config("no usable address family".to_string()))?;
        let remote_addr = remote
            .get(family)
            .ok_or_else(|| Error::Config(format!("no {} candidate", family)))?;

        let local_addr = match &local {
            Some(addrs) => Some(addrs.get(family).ok_or_else(|| {
                Error::Interface(format!(
                    "{} has no {} address",
                    self.interface.as_deref().unwrap_or_default(),
                    family
                ))
            })?),
            None => None,
        };

        debug!(remote = %remote_addr, local = ?local_addr, %family, "connecting");

        // From here on the socket is closed by drop on every error path.
        let socket = Socket::new(family.domain(), Type::STREAM, Some(Protocol::TCP))?;
        tune_socket(&socket, self.nodelay, self.recv_buffer_size)?;

        if let Some(local) = &local_addr {
            bind_local(&socket, local)?;
        }

        self.connect_with_deadline(&socket, &remote_addr)?;

        debug!(fd = socket.as_raw_fd(), remote = %remote_addr, "connected");
        Ok(Connection {
            socket,
            local: local_addr,
            remote: remote_addr,
        })
    }

    fn local_candidates(&self) -> Result<Option<LocalAddrs>> {
        let descriptor = match (&self.interface, self.local_port) {
            (Some(iface), _) => iface.as_str(),
            (None, Some(_)) => "",
            (None, None) => return Ok(None),
        };

        let spec = InterfaceSpec::parse(descriptor, self.local_port);
        let addrs = self.config.filter(spec.resolve()?);
        if addrs.is_empty() {
            return Err(Error::Interface(format!(
                "{} has no address in an enabled family",
                descriptor
            )));
        }
        Ok(Some(addrs))
    }

    /// Non-blocking connect bounded by the timeout. The socket is left in
    /// non-blocking mode.
    fn connect_with_deadline(&self, socket: &Socket, addr: &SockAddr) -> Result<()> {
        socket.set_nonblocking(true)?;

        match socket.connect(&addr.to_socket2()) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {
                wait_ready(socket.as_raw_fd(), Interest::Connect, self.timeout)?;
                if let Some(err) = socket.take_error()? {
                    return Err(Error::Io(err));
                }
            }
            Err(e) => return Err(Error::Io(e)),
        }
        Ok(())
    }
}

fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || matches!(e.raw_os_error(), Some(libc::EINPROGRESS) | Some(libc::EINTR))
}

/// Apply the per-socket options every peer gets.
///
/// Broken-pipe suppression is mandatory; TCP_NODELAY and the receive buffer
/// size are best effort.
pub(crate) fn tune_socket(socket: &Socket, nodelay: bool, recv_buffer_size: Option<usize>) -> Result<()> {
    #[cfg(target_vendor = "apple")]
    socket.set_nosigpipe(true)?;

    if nodelay {
        if let Err(e) = socket.set_nodelay(true) {
            warn!(fd = socket.as_raw_fd(), error = %e, "failed to set TCP_NODELAY");
        }
    }

    if let Some(size) = recv_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size) {
            debug!(fd = socket.as_raw_fd(), size, error = %e, "receive buffer size not applied");
        }
    }
    Ok(())
}

fn bind_local(socket: &Socket, local: &SockAddr) -> Result<()> {
    if local.port() != 0 {
        socket.set_reuse_address(true)?;
        #[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
        if let Err(e) = socket.set_reuse_port(true) {
            debug!(fd = socket.as_raw_fd(), error = %e, "SO_REUSEPORT not applied");
        }
    }
    socket.bind(&local.to_socket2())?;
    debug!(fd = socket.as_raw_fd(), local = %local, "bound");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    fn pair_both() -> CandidatePair {
        CandidatePair::loopback(80)
    }

    fn config(v4: bool, v6: bool, prefer_v4: bool) -> ConnectConfig {
        ConnectConfig {
            ipv4_enabled: v4,
            ipv6_enabled: v6,
            prefer_ipv4: prefer_v4,
        }
    }

    #[test]
    fn test_select_family() {
        let both = pair_both();
        let v4_only = both.without(AddressFamily::Ipv6);
        let v6_only = both.without(AddressFamily::Ipv4);

        assert_eq!(select_family(&config(true, true, true), &both), Some(AddressFamily::Ipv4));
        assert_eq!(select_family(&config(true, true, false), &both), Some(AddressFamily::Ipv6));
        assert_eq!(select_family(&config(true, true, false), &v4_only), Some(AddressFamily::Ipv4));
        assert_eq!(select_family(&config(true, true, true), &v6_only), Some(AddressFamily::Ipv6));
        assert_eq!(select_family(&config(false, true, true), &both), Some(AddressFamily::Ipv6));
        assert_eq!(select_family(&config(true, false, false), &both), Some(AddressFamily::Ipv4));
        assert_eq!(select_family(&config(false, true, true), &v4_only), None);
        assert_eq!(select_family(&config(true, false, true), &v6_only), None);
    }

    #[test]
    fn test_both_families_disabled() {
        let connector = TcpConnector::new().ipv4(false).ipv6(false);
        // An unresolvable name proves no lookup happens first.
        let err = connector.connect_host("name.that.does.not.exist.invalid", 80).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_only_resolved_family_disabled() {
        let connector = TcpConnector::new().ipv4(false);
        let err = connector.connect_host("127.0.0.1", 80).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpConnector::new()
            .timeout(Duration::from_secs(5))
            .connect(&Target::Addr(addr.into()))
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED));
    }

    #[test]
    fn test_connect_and_tune() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let conn = TcpConnector::new()
            .timeout(Duration::from_secs(5))
            .connect_host("localhost", addr.port())
            .unwrap();
        assert_eq!(conn.remote, SockAddr::from(addr));
        assert!(conn.local.is_none());
        assert!(conn.socket.nodelay().unwrap());
        assert!(conn.socket.nonblocking().unwrap());
        listener.accept().unwrap();
    }

    #[test]
    fn test_bind_local_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let spare = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = spare.local_addr().unwrap().port();
        drop(spare);

        let conn = TcpConnector::new()
            .interface("127.0.0.1")
            .local_port(port)
            .connect(&Target::Addr(addr.into()))
            .unwrap();
        assert_eq!(conn.local, Some(SockAddr::loopback_v4(port)));
        let bound = SockAddr::try_from(&conn.socket.local_addr().unwrap()).unwrap();
        assert_eq!(bound.port(), port);
        listener.accept().unwrap();
    }

    #[test]
    fn test_interface_family_mismatch() {
        let err = TcpConnector::new()
            .interface("127.0.0.1")
            .connect(&Target::Addr(SockAddr::loopback_v6(1)))
            .unwrap_err();
        assert!(matches!(err, Error::Interface(_)));
    }

    #[test]
    fn test_no_wait_timeout_fails_fast() {
        let start = Instant::now();
        let result = TcpConnector::new()
            .timeout(IdleTimeout::NoWait)
            .connect_host("192.0.2.1", 80);
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
