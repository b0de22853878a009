//! Blocking TCP peer with deadline-bounded I/O
//!
//! `tcpeer` connects to a remote host (or adopts an already accepted
//! connection) and then performs exact-length reads, delimiter-terminated
//! reads and fully flushed writes. Every wait on the kernel is bounded by a
//! single idle timeout.
//!
//! ```no_run
//! use std::time::Duration;
//! use tcpeer::net::{Peer, CRLF};
//!
//! let mut peer = Peer::builder("localhost", 7)
//!     .timeout(Duration::from_secs(5))
//!     .build();
//! peer.connect()?;
//! peer.write(b"PING\r\n")?;
//! let line = peer.read_to_delimiter(CRLF)?;
//! assert_eq!(line, b"PING\r\n");
//! # Ok::<(), tcpeer::net::Error>(())
//! ```

pub mod net;
