//! Network layer for tcpeer
//!
//! This module provides the address handling, name and interface resolution,
//! deadline-bounded connect and the buffered blocking I/O used by [`Peer`].

pub mod addr;
pub mod buffer;
pub mod interface;
pub mod io;
pub mod peer;
pub mod poll;
pub mod resolver;
pub mod tcp;

pub use addr::{AddressFamily, SockAddr};
pub use buffer::PeerBuffer;
pub use interface::{InterfaceSpec, LocalAddrs};
pub use io::{DelimiterScan, CR, CRLF, LF, ZERO};
pub use peer::{Peer, PeerBuilder};
pub use poll::{IdleTimeout, Interest};
pub use resolver::{CandidatePair, Resolver};
pub use tcp::{ConnectConfig, Connection, Target, TcpConnector};

/// Result type for network operations
pub type Result<T> = std::result::Result<T, Error>;

/// Network operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Address resolution failed ({code}): {message}")]
    Resolution { code: i32, message: String },

    #[error("No such interface: {0}")]
    Interface(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Connection closed by peer")]
    PeerClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Buffer capacity of {capacity} bytes exhausted")]
    Capacity { capacity: usize },

    #[error("Invalid address format: {0}")]
    InvalidAddress(String),

    #[error("Unsupported address family: {0}")]
    UnsupportedFamily(String),
}

impl Error {
    /// Whether this error is a deadline expiry, either ours or the kernel's.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Platform error code for this error, if it has one.
    ///
    /// Timeouts map to `ETIMEDOUT` so callers can treat them like the
    /// kernel's own "operation timed out".
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Timeout => Some(libc::ETIMEDOUT),
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
