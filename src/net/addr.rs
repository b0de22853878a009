//! Socket address handling
//!
//! This module wraps IPv4 and IPv6 transport addresses and converts them to
//! and from the platform's raw `sockaddr` layout, so address lists obtained
//! elsewhere (service discovery, accept, getifaddrs) can be used directly.

use std::fmt;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ptr;

use socket2::SockAddr as Socket2Addr;

use super::{Error, Result};

/// Address family of a [`SockAddr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// The `AF_*` constant for this family.
    pub fn as_raw(self) -> libc::c_int {
        match self {
            AddressFamily::Ipv4 => libc::AF_INET,
            AddressFamily::Ipv6 => libc::AF_INET6,
        }
    }

    /// Map an `AF_*` constant back to a family.
    pub fn from_raw(family: libc::c_int) -> Option<Self> {
        match family {
            libc::AF_INET => Some(AddressFamily::Ipv4),
            libc::AF_INET6 => Some(AddressFamily::Ipv6),
            _ => None,
        }
    }

    pub(crate) fn domain(self) -> socket2::Domain {
        match self {
            AddressFamily::Ipv4 => socket2::Domain::IPV4,
            AddressFamily::Ipv6 => socket2::Domain::IPV6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => f.write_str("IPv4"),
            AddressFamily::Ipv6 => f.write_str("IPv6"),
        }
    }
}

/// An IPv4 or IPv6 endpoint address.
///
/// Immutable once produced; use [`SockAddr::with_port`] to derive a copy with
/// another port burned in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SockAddr {
    /// IPv4 socket address
    V4(SocketAddrV4),
    /// IPv6 socket address
    V6(SocketAddrV6),
}

impl SockAddr {
    /// Create a new IPv4 socket address
    pub fn new_v4(ip: Ipv4Addr, port: u16) -> Self {
        SockAddr::V4(SocketAddrV4::new(ip, port))
    }

    /// Create a new IPv6 socket address
    pub fn new_v6(ip: Ipv6Addr, port: u16) -> Self {
        SockAddr::V6(SocketAddrV6::new(ip, port, 0, 0))
    }

    /// 127.0.0.1 with the given port
    pub fn loopback_v4(port: u16) -> Self {
        SockAddr::new_v4(Ipv4Addr::LOCALHOST, port)
    }

    /// ::1 with the given port
    pub fn loopback_v6(port: u16) -> Self {
        SockAddr::new_v6(Ipv6Addr::LOCALHOST, port)
    }

    /// 0.0.0.0 with the given port
    pub fn any_v4(port: u16) -> Self {
        SockAddr::new_v4(Ipv4Addr::UNSPECIFIED, port)
    }

    /// :: with the given port
    pub fn any_v6(port: u16) -> Self {
        SockAddr::new_v6(Ipv6Addr::UNSPECIFIED, port)
    }

    /// Convert from a std socket address
    pub fn from_std(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => SockAddr::V4(v4),
            SocketAddr::V6(v6) => SockAddr::V6(v6),
        }
    }

    /// Convert to a std socket address
    pub fn to_std(&self) -> SocketAddr {
        match self {
            SockAddr::V4(v4) => SocketAddr::V4(*v4),
            SockAddr::V6(v6) => SocketAddr::V6(*v6),
        }
    }

    /// Import an address from the raw `sockaddr_in`/`sockaddr_in6` byte layout.
    ///
    /// Only the family tag decides how the bytes are read; the slice must be
    /// at least as long as the structure for that family.
    pub fn from_raw_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < mem::size_of::<libc::sockaddr>() {
            return Err(Error::InvalidAddress(format!(
                "raw address of {} bytes is too short",
                bytes.len()
            )));
        }
        // SAFETY: the slice is valid for `bytes.len()` bytes and `from_raw_parts`
        // copies at most that many.
        unsafe { Self::from_raw_parts(bytes.as_ptr().cast(), bytes.len() as libc::socklen_t) }
    }

    /// Import an address from a raw `sockaddr` pointer and length.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for reads of `len` bytes.
    pub unsafe fn from_raw_parts(addr: *const libc::sockaddr, len: libc::socklen_t) -> Result<Self> {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let len = (len as usize).min(mem::size_of::<libc::sockaddr_storage>());
        ptr::copy_nonoverlapping(
            addr.cast::<u8>(),
            (&mut storage as *mut libc::sockaddr_storage).cast::<u8>(),
            len,
        );

        let family = storage.ss_family as libc::c_int;
        let needed = match AddressFamily::from_raw(family) {
            Some(AddressFamily::Ipv4) => mem::size_of::<libc::sockaddr_in>(),
            Some(AddressFamily::Ipv6) => mem::size_of::<libc::sockaddr_in6>(),
            None => return Err(Error::UnsupportedFamily(format!("address family {}", family))),
        };
        if len < needed {
            return Err(Error::InvalidAddress(format!(
                "raw address of {} bytes is too short for its family",
                len
            )));
        }

        let raw = Socket2Addr::new(storage, len as libc::socklen_t);
        raw.as_socket()
            .map(SockAddr::from_std)
            .ok_or_else(|| Error::UnsupportedFamily(format!("address family {}", family)))
    }

    /// Export the address in the platform's raw `sockaddr` byte layout
    /// (family tag, port and address in network byte order).
    pub fn to_raw_bytes(&self) -> Vec<u8> {
        let raw = self.to_socket2();
        // SAFETY: socket2 guarantees `as_ptr` is valid for `len` bytes.
        unsafe { std::slice::from_raw_parts(raw.as_ptr().cast::<u8>(), raw.len() as usize) }.to_vec()
    }

    pub(crate) fn to_socket2(&self) -> Socket2Addr {
        Socket2Addr::from(self.to_std())
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            SockAddr::V4(v4) => v4.port(),
            SockAddr::V6(v6) => v6.port(),
        }
    }

    /// Copy of this address with the port replaced
    pub fn with_port(&self, port: u16) -> Self {
        let mut addr = *self;
        match &mut addr {
            SockAddr::V4(v4) => v4.set_port(port),
            SockAddr::V6(v6) => v6.set_port(port),
        }
        addr
    }

    /// Get the IP address
    pub fn ip(&self) -> IpAddr {
        match self {
            SockAddr::V4(v4) => IpAddr::V4(*v4.ip()),
            SockAddr::V6(v6) => IpAddr::V6(*v6.ip()),
        }
    }

    /// Get the address family
    pub fn family(&self) -> AddressFamily {
        match self {
            SockAddr::V4(_) => AddressFamily::Ipv4,
            SockAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    /// Check if this is an IPv4 address
    pub fn is_ipv4(&self) -> bool {
        matches!(self, SockAddr::V4(_))
    }

    /// Check if this is an IPv6 address
    pub fn is_ipv6(&self) -> bool {
        matches!(self, SockAddr::V6(_))
    }

    /// Whether this is an IPv6 address carrying an IPv4 one (::ffff:a.b.c.d).
    pub fn is_ipv4_mapped(&self) -> bool {
        match self {
            SockAddr::V4(_) => false,
            SockAddr::V6(v6) => v6.ip().to_ipv4_mapped().is_some(),
        }
    }

    /// Format address as string (without port)
    pub fn addr_string(&self) -> String {
        match self {
            SockAddr::V4(v4) => v4.ip().to_string(),
            SockAddr::V6(v6) => {
                let ip = v6.ip();
                // Handle IPv4-mapped IPv6 addresses (::ffff:x.x.x.x)
                if let Some(ipv4) = ip.to_ipv4_mapped() {
                    ipv4.to_string()
                } else {
                    ip.to_string()
                }
            }
        }
    }

    /// Host text, port and family in one go
    pub fn host_port(&self) -> (String, u16, AddressFamily) {
        (self.addr_string(), self.port(), self.family())
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SockAddr::V4(v4) => write!(f, "{}", v4),
            SockAddr::V6(v6) => write!(f, "{}", v6),
        }
    }
}

impl From<SocketAddr> for SockAddr {
    fn from(addr: SocketAddr) -> Self {
        SockAddr::from_std(addr)
    }
}

impl From<SocketAddrV4> for SockAddr {
    fn from(addr: SocketAddrV4) -> Self {
        SockAddr::V4(addr)
    }
}

impl From<SocketAddrV6> for SockAddr {
    fn from(addr: SocketAddrV6) -> Self {
        SockAddr::V6(addr)
    }
}

impl From<SockAddr> for SocketAddr {
    fn from(addr: SockAddr) -> Self {
        addr.to_std()
    }
}

impl TryFrom<&Socket2Addr> for SockAddr {
    type Error = Error;

    fn try_from(addr: &Socket2Addr) -> Result<Self> {
        addr.as_socket()
            .map(SockAddr::from_std)
            .ok_or_else(|| Error::UnsupportedFamily(format!("address family {}", addr.family())))
    }
}
