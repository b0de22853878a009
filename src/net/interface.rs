//! Local interface resolution
//!
//! Maps an interface descriptor such as `en0`, `192.168.1.5`, `lo:8080` or
//! `:9000` to the local addresses a socket should bind to before connecting.

use std::ffi::CStr;
use std::mem;
use std::ptr;

use tracing::debug;

use super::resolver::{is_loopback_name, CandidatePair};
use super::{AddressFamily, Error, Result, SockAddr};

/// Local bind addresses, at most one per family.
pub type LocalAddrs = CandidatePair;

/// A parsed interface descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSpec {
    /// Interface name or literal IP; `None` means the wildcard address
    pub interface: Option<String>,
    /// Local port to bind, 0 for an ephemeral one
    pub port: u16,
}

impl InterfaceSpec {
    /// Parse `descriptor`, splitting on the first colon.
    ///
    /// A port after the colon is used only when `port` is `None`; numbers
    /// outside 1..=65535 or that fail to parse are ignored.
    pub fn parse(descriptor: &str, port: Option<u16>) -> Self {
        let (iface, suffix) = match descriptor.split_once(':') {
            Some((iface, suffix)) => (iface, Some(suffix)),
            None => (descriptor, None),
        };

        let port = port.unwrap_or_else(|| {
            suffix
                .and_then(|s| s.parse::<u32>().ok())
                .filter(|p| (1..=65535).contains(p))
                .map_or(0, |p| p as u16)
        });

        InterfaceSpec {
            interface: (!iface.is_empty()).then(|| iface.to_string()),
            port,
        }
    }

    /// Resolve to bindable local addresses with the port burned in.
    pub fn resolve(&self) -> Result<LocalAddrs> {
        let iface = match self.interface.as_deref() {
            None => {
                return Ok(LocalAddrs {
                    v4: Some(SockAddr::any_v4(self.port)),
                    v6: Some(SockAddr::any_v6(self.port)),
                })
            }
            Some(iface) => iface,
        };

        if is_loopback_name(iface) {
            return Ok(LocalAddrs::loopback(self.port));
        }

        let mut found = LocalAddrs::default();
        for (name, addr) in InterfaceAddrs::load()?.iter() {
            if name != iface && addr.ip().to_string() != iface {
                continue;
            }
            let slot = match addr.family() {
                AddressFamily::Ipv4 => &mut found.v4,
                AddressFamily::Ipv6 => &mut found.v6,
            };
            if slot.is_none() {
                *slot = Some(addr.with_port(self.port));
            }
        }

        if found.is_empty() {
            return Err(Error::Interface(iface.to_string()));
        }
        debug!(interface = iface, v4 = ?found.v4, v6 = ?found.v6, "interface resolved");
        Ok(found)
    }
}

/// Parse and resolve an interface descriptor in one step.
pub fn resolve_interface(descriptor: &str, port: Option<u16>) -> Result<LocalAddrs> {
    InterfaceSpec::parse(descriptor, port).resolve()
}

/// Owns a getifaddrs(3) list.
struct InterfaceAddrs(*mut libc::ifaddrs);

impl InterfaceAddrs {
    fn load() -> Result<Self> {
        let mut head: *mut libc::ifaddrs = ptr::null_mut();
        if unsafe { libc::getifaddrs(&mut head) } != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(InterfaceAddrs(head))
    }

    /// Interface name and address of every IPv4/IPv6 entry, in list order.
    fn iter(&self) -> impl Iterator<Item = (String, SockAddr)> + '_ {
        let mut cur = self.0;
        std::iter::from_fn(move || {
            while !cur.is_null() {
                // SAFETY: cur points into the list owned by self.
                let ifa = unsafe { &*cur };
                cur = ifa.ifa_next;

                if ifa.ifa_addr.is_null() || ifa.ifa_name.is_null() {
                    continue;
                }
                let family = unsafe { (*ifa.ifa_addr).sa_family } as libc::c_int;
                let len = match AddressFamily::from_raw(family) {
                    Some(AddressFamily::Ipv4) => mem::size_of::<libc::sockaddr_in>(),
                    Some(AddressFamily::Ipv6) => mem::size_of::<libc::sockaddr_in6>(),
                    None => continue,
                };
                let addr = match unsafe { SockAddr::from_raw_parts(ifa.ifa_addr, len as libc::socklen_t) } {
                    Ok(addr) => addr,
                    Err(_) => continue,
                };
                let name = unsafe { CStr::from_ptr(ifa.ifa_name) }
                    .to_string_lossy()
                    .into_owned();
                return Some((name, addr));
            }
            None
        })
    }
}

impl Drop for InterfaceAddrs {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { libc::freeifaddrs(self.0) };
        }
    }
}
