//! Deadline-bounded transfer loops
//!
//! These functions move bytes between a connected socket and a
//! [`PeerBuffer`]. Each readiness wait is bounded by the same
//! [`IdleTimeout`]; a transfer that keeps making progress never times out.
//! Callers are responsible for tearing the connection down on error.

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::AsRawFd;

use socket2::Socket;
use tracing::trace;

use super::buffer::PeerBuffer;
use super::poll::{wait_ready, IdleTimeout, Interest};
use super::{Error, Result};

/// CR LF line terminator
pub const CRLF: &[u8] = b"\r\n";
/// Carriage return
pub const CR: &[u8] = b"\r";
/// Line feed
pub const LF: &[u8] = b"\n";
/// A single NUL byte
pub const ZERO: &[u8] = b"\0";

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
const SEND_FLAGS: libc::c_int = 0;

/// Incremental delimiter matcher.
///
/// On a mismatch the match position drops back to zero without re-examining
/// the mismatching byte, so a separator such as `AAB` is not found in `AAAB`.
/// Protocols built on this type rely on that exact acceptance behaviour.
#[derive(Debug, Clone)]
pub struct DelimiterScan<'a> {
    separator: &'a [u8],
    matched: usize,
}

impl<'a> DelimiterScan<'a> {
    /// Start matching `separator`
    pub fn new(separator: &'a [u8]) -> Self {
        DelimiterScan { separator, matched: 0 }
    }

    /// Feed one byte; returns true once the whole separator has been seen.
    pub fn push(&mut self, byte: u8) -> bool {
        match self.separator.get(self.matched) {
            Some(&expected) if expected == byte => self.matched += 1,
            _ => self.matched = 0,
        }
        self.is_complete()
    }

    /// Whether the separator has been seen
    pub fn is_complete(&self) -> bool {
        !self.separator.is_empty() && self.matched == self.separator.len()
    }
}

/// Run `op` until it stops failing with EINTR, mapping WouldBlock to `None`.
fn retry<F>(mut op: F) -> Result<Option<usize>>
where
    F: FnMut() -> io::Result<usize>,
{
    loop {
        match op() {
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

fn recv_into(socket: &Socket, dst: &mut [u8]) -> Result<Option<usize>> {
    // SAFETY: u8 and MaybeUninit<u8> share a layout and recv only writes
    // initialised bytes into the slice.
    let dst = unsafe { &mut *(dst as *mut [u8] as *mut [MaybeUninit<u8>]) };
    retry(|| socket.recv(dst))
}

fn send_from(socket: &Socket, src: &[u8]) -> Result<Option<usize>> {
    retry(|| socket.send_with_flags(src, SEND_FLAGS))
}

/// Send all of `data`, staging at most one buffer's worth per send.
pub fn write_all(socket: &Socket, buf: &PeerBuffer, data: &[u8], timeout: IdleTimeout) -> Result<()> {
    if data.is_empty() {
        return Err(Error::Config("write of zero bytes".to_string()));
    }

    let fd = socket.as_raw_fd();
    let mut sent = 0;
    while sent < data.len() {
        wait_ready(fd, Interest::Write, timeout)?;

        let chunk = (data.len() - sent).min(buf.capacity());
        let n = match send_from(socket, &data[sent..sent + chunk])? {
            Some(0) => return Err(Error::PeerClosed),
            Some(n) => n,
            None => continue,
        };
        sent += n;
        trace!(fd, sent, total = data.len(), "write progress");
    }
    Ok(())
}

/// Send the first `len` bytes already staged in `buf`.
pub fn write_buffered(socket: &Socket, buf: &PeerBuffer, len: usize, timeout: IdleTimeout) -> Result<()> {
    if len == 0 {
        return Err(Error::Config("write of zero bytes".to_string()));
    }
    let data = buf.get(..len).ok_or(Error::Capacity { capacity: buf.capacity() })?;

    let fd = socket.as_raw_fd();
    let mut sent = 0;
    while sent < len {
        wait_ready(fd, Interest::Write, timeout)?;
        match send_from(socket, &data[sent..])? {
            Some(0) => return Err(Error::PeerClosed),
            Some(n) => sent += n,
            None => continue,
        }
        trace!(fd, sent, total = len, "buffered write progress");
    }
    Ok(())
}

/// Receive exactly `len` bytes into the front of `buf`.
pub fn read_exact(socket: &Socket, buf: &mut PeerBuffer, len: usize, timeout: IdleTimeout) -> Result<()> {
    if len == 0 {
        return Err(Error::Config("read of zero bytes".to_string()));
    }
    if len > buf.capacity() {
        return Err(Error::Capacity { capacity: buf.capacity() });
    }

    let fd = socket.as_raw_fd();
    let mut filled = 0;
    while filled < len {
        wait_ready(fd, Interest::Read, timeout)?;
        match recv_into(socket, &mut buf[filled..len])? {
            Some(0) => return Err(Error::PeerClosed),
            Some(n) => filled += n,
            None => continue,
        }
        trace!(fd, filled, total = len, "read progress");
    }
    Ok(())
}

/// Receive one byte at a time until `separator` has been seen. Returns the
/// number of bytes now at the front of `buf`, separator included.
///
/// Reading byte-wise guarantees nothing past the separator is taken off the
/// stream.
pub fn read_until(socket: &Socket, buf: &mut PeerBuffer, separator: &[u8], timeout: IdleTimeout) -> Result<usize> {
    if separator.is_empty() {
        return Err(Error::Config("empty separator".to_string()));
    }

    let fd = socket.as_raw_fd();
    let mut scan = DelimiterScan::new(separator);
    let mut cursor = 0;
    loop {
        if cursor >= buf.capacity() {
            return Err(Error::Capacity { capacity: buf.capacity() });
        }

        wait_ready(fd, Interest::Read, timeout)?;
        match recv_into(socket, &mut buf[cursor..cursor + 1])? {
            Some(0) => return Err(Error::PeerClosed),
            Some(_) => {}
            None => continue,
        }

        let found = scan.push(buf[cursor]);
        cursor += 1;
        if found {
            trace!(fd, len = cursor, "separator found");
            return Ok(cursor);
        }
    }
}
