//! Deadline-enforcing stream wrapper.
//!
//! Every read and write shares one deadline armed at command entry, so a
//! sequence of partial reads sees a shrinking budget relative to the first
//! call rather than a fresh timeout per I/O call. When the deadline fires it
//! is disabled, so the failure surfaces exactly once.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

/// The raw bidirectional byte stream under the framing: plain TCP, or TLS
/// over TCP once the handshake upgrades it.
pub enum NetStream {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl NetStream {
    /// The TCP socket underneath, for socket-level options and shutdown.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            NetStream::Tcp(s) => s,
            #[cfg(feature = "tls")]
            NetStream::Tls(s) => &s.sock,
        }
    }
}

impl Read for NetStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NetStream::Tcp(s) => s.read(buf),
            #[cfg(feature = "tls")]
            NetStream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for NetStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            NetStream::Tcp(s) => s.write(buf),
            #[cfg(feature = "tls")]
            NetStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            NetStream::Tcp(s) => s.flush(),
            #[cfg(feature = "tls")]
            NetStream::Tls(s) => s.flush(),
        }
    }
}

/// A `NetStream` with a single shared read/write deadline.
pub struct TimedStream {
    inner: NetStream,
    deadline: Option<Instant>,
    socket_armed: bool,
}

impl TimedStream {
    pub fn new(inner: NetStream) -> Self {
        Self {
            inner,
            deadline: None,
            socket_armed: false,
        }
    }

    /// Arm (or with `0` disarm) the deadline, measured from now.
    pub fn reset_timeout(&mut self, timeout_ms: u64) {
        self.deadline = if timeout_ms == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(timeout_ms))
        };
    }

    /// Whether a deadline is currently armed.
    pub fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }

    /// Shut the socket down in both directions.
    pub fn close(&mut self) {
        let _ = self.inner.tcp().shutdown(Shutdown::Both);
    }

    /// Unwrap the raw stream (used for the in-place TLS upgrade).
    pub fn into_inner(self) -> NetStream {
        self.inner
    }

    /// Remaining budget, or an already-fired timeout. Disables the deadline
    /// when it reports expiry so the error is produced exactly once.
    fn budget(&mut self) -> io::Result<Option<Duration>> {
        match self.deadline {
            None => Ok(None),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    self.deadline = None;
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "operation deadline exceeded",
                    ));
                }
                Ok(Some(deadline - now))
            }
        }
    }

    fn arm_socket(&mut self, budget: Option<Duration>) -> io::Result<()> {
        match budget {
            Some(remaining) => {
                // Sub-millisecond leftovers still need a non-zero socket
                // timeout; zero would mean "block forever".
                let t = remaining.max(Duration::from_millis(1));
                self.inner.tcp().set_read_timeout(Some(t))?;
                self.inner.tcp().set_write_timeout(Some(t))?;
                self.socket_armed = true;
            }
            None => {
                if self.socket_armed {
                    self.inner.tcp().set_read_timeout(None)?;
                    self.inner.tcp().set_write_timeout(None)?;
                    self.socket_armed = false;
                }
            }
        }
        Ok(())
    }
}

impl Read for TimedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let budget = self.budget()?;
        self.arm_socket(budget)?;
        match self.inner.read(buf) {
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                self.deadline = None;
                Err(io::Error::new(io::ErrorKind::TimedOut, e))
            }
            other => other,
        }
    }
}

impl Write for TimedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let budget = self.budget()?;
        self.arm_socket(budget)?;
        match self.inner.write(buf) {
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                self.deadline = None;
                Err(io::Error::new(io::ErrorKind::TimedOut, e))
            }
            other => other,
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl std::fmt::Debug for TimedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedStream")
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (TimedStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (TimedStream::new(NetStream::Tcp(client)), server)
    }

    #[test]
    fn read_times_out_once_then_disarms() {
        let (mut timed, _server) = pair();
        timed.reset_timeout(50);
        let mut buf = [0u8; 1];

        let err = timed.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(!timed.has_deadline(), "deadline disabled after firing");
    }

    #[test]
    fn expired_deadline_fails_without_blocking() {
        let (mut timed, _server) = pair();
        timed.reset_timeout(1);
        std::thread::sleep(Duration::from_millis(10));
        let start = Instant::now();
        let mut buf = [0u8; 1];
        let err = timed.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn read_within_deadline_succeeds() {
        let (mut timed, mut server) = pair();
        timed.reset_timeout(2_000);
        server.write_all(b"ok").unwrap();
        let mut buf = [0u8; 2];
        timed.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok");
        assert!(timed.has_deadline(), "deadline survives successful I/O");
    }

    #[test]
    fn zero_disables_deadline() {
        let (mut timed, mut server) = pair();
        timed.reset_timeout(500);
        timed.reset_timeout(0);
        assert!(!timed.has_deadline());
        server.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        timed.read_exact(&mut buf).unwrap();
    }
}
