//! Host name resolution
//!
//! Turns a host name and port into candidate endpoint addresses using
//! getaddrinfo(3) restricted to TCP stream sockets. The names `localhost` and
//! `loopback` never hit the system resolver.

use std::ffi::{CStr, CString};
use std::ptr;

use tracing::debug;

use super::{AddressFamily, Error, Result, SockAddr};

/// Host names answered without a lookup.
pub fn is_loopback_name(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost") || host.eq_ignore_ascii_case("loopback")
}

/// At most one IPv4 and one IPv6 candidate for a single target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidatePair {
    pub v4: Option<SockAddr>,
    pub v6: Option<SockAddr>,
}

impl CandidatePair {
    /// Keep the first address of each family, in the order given.
    pub fn from_addrs<I>(addrs: I) -> Self
    where
        I: IntoIterator<Item = SockAddr>,
    {
        let mut pair = CandidatePair::default();
        for addr in addrs {
            match addr.family() {
                AddressFamily::Ipv4 if pair.v4.is_none() => pair.v4 = Some(addr),
                AddressFamily::Ipv6 if pair.v6.is_none() => pair.v6 = Some(addr),
                _ => {}
            }
        }
        pair
    }

    /// Loopback addresses of both families
    pub fn loopback(port: u16) -> Self {
        CandidatePair {
            v4: Some(SockAddr::loopback_v4(port)),
            v6: Some(SockAddr::loopback_v6(port)),
        }
    }

    /// True when neither family has a candidate
    pub fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }

    /// Candidate for one family
    pub fn get(&self, family: AddressFamily) -> Option<SockAddr> {
        match family {
            AddressFamily::Ipv4 => self.v4,
            AddressFamily::Ipv6 => self.v6,
        }
    }

    /// Drop the candidate of a family that may not be used.
    pub fn without(mut self, family: AddressFamily) -> Self {
        match family {
            AddressFamily::Ipv4 => self.v4 = None,
            AddressFamily::Ipv6 => self.v6 = None,
        }
        self
    }
}

/// Owns a getaddrinfo result list.
struct AddrInfoList(*mut libc::addrinfo);

impl Drop for AddrInfoList {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { libc::freeaddrinfo(self.0) };
        }
    }
}

fn gai_message(code: libc::c_int) -> String {
    if code == libc::EAI_SYSTEM {
        return std::io::Error::last_os_error().to_string();
    }
    unsafe { CStr::from_ptr(libc::gai_strerror(code)) }
        .to_string_lossy()
        .into_owned()
}

/// Name resolver for connect targets.
pub struct Resolver;

impl Resolver {
    /// Resolve `host` and `port` to IPv4 and IPv6 addresses in lookup order.
    ///
    /// # Examples
    /// ```
    /// use tcpeer::net::Resolver;
    ///
    /// let addrs = Resolver::resolve("localhost", 8080).unwrap();
    /// assert_eq!(addrs.len(), 2);
    /// assert!(addrs.iter().all(|a| a.port() == 8080));
    /// ```
    pub fn resolve(host: &str, port: u16) -> Result<Vec<SockAddr>> {
        if host.is_empty() {
            return Err(Error::Config("empty host".to_string()));
        }

        if is_loopback_name(host) {
            return Ok(vec![SockAddr::loopback_v4(port), SockAddr::loopback_v6(port)]);
        }

        let c_host = CString::new(host)
            .map_err(|_| Error::Config(format!("host contains a NUL byte: {:?}", host)))?;
        let c_port = CString::new(port.to_string())
            .map_err(|_| Error::Config("invalid port".to_string()))?;

        let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
        hints.ai_family = libc::AF_UNSPEC;
        hints.ai_socktype = libc::SOCK_STREAM;
        hints.ai_protocol = libc::IPPROTO_TCP;

        let mut res: *mut libc::addrinfo = ptr::null_mut();
        let code = unsafe { libc::getaddrinfo(c_host.as_ptr(), c_port.as_ptr(), &hints, &mut res) };
        let list = AddrInfoList(res);
        if code != 0 {
            return Err(Error::Resolution {
                code,
                message: gai_message(code),
            });
        }

        let mut addrs = Vec::new();
        let mut cur = list.0;
        while !cur.is_null() {
            // SAFETY: cur points into the list owned by `list`.
            let info = unsafe { &*cur };
            if !info.ai_addr.is_null() && AddressFamily::from_raw(info.ai_family).is_some() {
                if let Ok(addr) = unsafe { SockAddr::from_raw_parts(info.ai_addr, info.ai_addrlen) } {
                    addrs.push(addr);
                }
            }
            cur = info.ai_next;
        }

        if addrs.is_empty() {
            return Err(Error::Resolution {
                code: libc::EAI_NONAME,
                message: format!("no IPv4 or IPv6 addresses for {}", host),
            });
        }

        debug!(host, port, count = addrs.len(), "resolved");
        Ok(addrs)
    }

    /// Resolve and keep the first address of each family.
    pub fn resolve_pair(host: &str, port: u16) -> Result<CandidatePair> {
        Self::resolve(host, port).map(CandidatePair::from_addrs)
    }
}
