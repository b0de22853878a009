//! Single-descriptor readiness polling
//!
//! Every blocking point in the crate goes through [`wait_ready`], a thin
//! wrapper over poll(2) bounded by an [`IdleTimeout`].

use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use super::{Error, Result};

/// The idle timeout budget applied to each readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleTimeout {
    /// Block until the descriptor is ready
    Never,
    /// Do not wait at all; fail if the descriptor is not ready right now
    NoWait,
    /// Wait at most this long
    After(Duration),
}

impl IdleTimeout {
    /// Build a timeout from signed seconds: zero blocks forever, negative
    /// never waits.
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs == 0.0 || secs.is_nan() {
            IdleTimeout::Never
        } else if secs < 0.0 {
            IdleTimeout::NoWait
        } else {
            let d = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
            IdleTimeout::After(d.max(Duration::from_nanos(1)))
        }
    }

    /// The signed-seconds form of this timeout.
    pub fn as_secs_f64(&self) -> f64 {
        match self {
            IdleTimeout::Never => 0.0,
            IdleTimeout::NoWait => -1.0,
            IdleTimeout::After(d) => d.as_secs_f64(),
        }
    }

    /// poll(2) timeout in milliseconds for a wait that has already used
    /// `elapsed`. Sub-millisecond remainders round up so a finite wait never
    /// degrades into a non-blocking check. A zero `After` blocks, like `Never`.
    fn poll_millis(&self, elapsed: Duration) -> libc::c_int {
        match self {
            IdleTimeout::Never => -1,
            IdleTimeout::After(d) if d.is_zero() => -1,
            IdleTimeout::NoWait => 0,
            IdleTimeout::After(d) => {
                let left = d.saturating_sub(elapsed);
                if left.is_zero() {
                    return 0;
                }
                let millis = left.as_nanos().div_ceil(1_000_000);
                millis.min(libc::c_int::MAX as u128) as libc::c_int
            }
        }
    }
}

impl Default for IdleTimeout {
    fn default() -> Self {
        IdleTimeout::After(Duration::from_secs(30))
    }
}

impl From<Duration> for IdleTimeout {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            IdleTimeout::Never
        } else {
            IdleTimeout::After(d)
        }
    }
}

impl From<Option<Duration>> for IdleTimeout {
    fn from(d: Option<Duration>) -> Self {
        d.map_or(IdleTimeout::Never, IdleTimeout::from)
    }
}

/// What to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    /// Either direction; used while a connect is in flight.
    Connect,
}

impl Interest {
    fn events(self) -> libc::c_short {
        match self {
            Interest::Read => libc::POLLIN,
            Interest::Write => libc::POLLOUT,
            Interest::Connect => libc::POLLIN | libc::POLLOUT,
        }
    }
}

/// Wait until `fd` is ready for `interest` or the timeout elapses.
///
/// Returns `Err(Error::Timeout)` when nothing became ready in time. Error and
/// hang-up conditions count as ready; the following syscall reports them.
pub fn wait_ready(fd: RawFd, interest: Interest, timeout: IdleTimeout) -> Result<()> {
    let start = Instant::now();
    loop {
        let mut pfd = libc::pollfd {
            fd,
            events: interest.events(),
            revents: 0,
        };

        let ret = unsafe { libc::poll(&mut pfd, 1, timeout.poll_millis(start.elapsed())) };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }

        if ret == 0 {
            return Err(Error::Timeout);
        }

        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(Error::Io(io::Error::from_raw_os_error(libc::EBADF)));
        }

        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_signed_seconds() {
        assert_eq!(IdleTimeout::from_secs_f64(0.0), IdleTimeout::Never);
        assert_eq!(IdleTimeout::from_secs_f64(-2.5), IdleTimeout::NoWait);
        assert_eq!(
            IdleTimeout::from_secs_f64(1.5),
            IdleTimeout::After(Duration::from_millis(1500))
        );
        assert_eq!(IdleTimeout::from(Duration::ZERO), IdleTimeout::Never);
        assert_eq!(IdleTimeout::NoWait.as_secs_f64(), -1.0);
    }

    #[test]
    fn test_tiny_positive_seconds_still_wait() {
        assert_eq!(
            IdleTimeout::from_secs_f64(1e-10),
            IdleTimeout::After(Duration::from_nanos(1))
        );
        assert_eq!(IdleTimeout::from_secs_f64(1e-10).poll_millis(Duration::ZERO), 1);
    }

    #[test]
    fn test_zero_after_blocks() {
        assert_eq!(IdleTimeout::After(Duration::ZERO).poll_millis(Duration::ZERO), -1);
        assert_eq!(IdleTimeout::After(Duration::ZERO).poll_millis(Duration::from_secs(5)), -1);

        let (a, mut b) = UnixStream::pair().unwrap();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            b.write_all(b"x").unwrap();
            b
        });
        let start = Instant::now();
        wait_ready(a.as_raw_fd(), Interest::Read, IdleTimeout::After(Duration::ZERO)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(90));
        writer.join().unwrap();
    }

    #[test]
    fn test_poll_millis_rounds_up() {
        let t = IdleTimeout::After(Duration::from_micros(1500));
        assert_eq!(t.poll_millis(Duration::ZERO), 2);
        assert_eq!(t.poll_millis(Duration::from_secs(1)), 0);
        assert_eq!(IdleTimeout::Never.poll_millis(Duration::ZERO), -1);
        assert_eq!(IdleTimeout::NoWait.poll_millis(Duration::ZERO), 0);
    }

    #[test]
    fn test_default_is_finite() {
        assert!(matches!(IdleTimeout::default(), IdleTimeout::After(d) if !d.is_zero()));
    }

    #[test]
    fn test_wait_read_timeout_and_ready() {
        let (a, mut b) = UnixStream::pair().unwrap();

        let start = Instant::now();
        let err = wait_ready(a.as_raw_fd(), Interest::Read, IdleTimeout::After(Duration::from_millis(50)))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(40));

        assert!(matches!(
            wait_ready(a.as_raw_fd(), Interest::Read, IdleTimeout::NoWait),
            Err(Error::Timeout)
        ));

        b.write_all(b"x").unwrap();
        wait_ready(a.as_raw_fd(), Interest::Read, IdleTimeout::Never).unwrap();
        wait_ready(a.as_raw_fd(), Interest::Write, IdleTimeout::NoWait).unwrap();
    }
}
