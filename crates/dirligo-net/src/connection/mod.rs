//! The abstract bidirectional byte pipe.
//!
//! Ownership is explicit `Arc<dyn Connection>` rather than the original's
//! manual add-ref/release plus a process-wide live-instance set: a
//! `Connection` is borrowed everywhere except its lifetime anchor, so
//! use-after-free is a compile-time impossibility and the live-instance
//! set simply disappears.

#[cfg(feature = "dtls")]
pub mod secure;
pub mod tcp;

use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{NetError, Result};

pub use tcp::TcpConnection;

/// Which half of a bidirectional pipe to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownDirection {
    Read,
    Write,
    Both,
}

/// The connection state machine: state only moves toward
/// [`ConnectionState::Dead`], never backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Pending = 0,
    Listening = 1,
    Established = 2,
    Dead = 3,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Pending => "PENDING",
            ConnectionState::Listening => "LISTENING",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::Dead => "DEAD",
        };
        f.write_str(s)
    }
}

/// Shared state-machine cell used by every `Connection` implementation.
///
/// `wait_for_state` polls at 100 ms granularity rather than relying
/// solely on the condvar notification —
/// this keeps behaviour identical whether the target state is reached by
/// a `set` call this cell knows about or by some other path.
pub struct StateCell {
    state: Mutex<ConnectionState>,
    cond: Condvar,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(ConnectionState::Pending)
    }
}

impl StateCell {
    pub fn new(initial: ConnectionState) -> Self {
        Self {
            state: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// Moves to `next`. A no-op if already `Dead` — shutdown is idempotent,
    /// so further shutdowns are no-ops.
    pub fn set(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Dead {
            return;
        }
        *state = next;
        self.cond.notify_all();
    }

    /// Polls at 100 ms granularity for up to `timeout`. Returns `Ok(())`
    /// iff `target` was reached before `Dead` was observed and before the
    /// timeout elapsed.
    pub fn wait_for(&self, target: ConnectionState, timeout: Duration) -> Result<()> {
        const POLL: Duration = Duration::from_millis(100);
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if *state == target {
                return Ok(());
            }
            if *state == ConnectionState::Dead {
                return Err(NetError::Dead);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(NetError::Timeout(timeout));
            }
            let wait = POLL.min(deadline - now);
            let (guard, _) = self.cond.wait_timeout(state, wait).unwrap();
            state = guard;
        }
    }
}

/// The abstract bidirectional byte pipe.
///
/// `write`/`read` return `Ok(0)` on a clean EOF/cancel, matching the
/// original's `0`-on-cancel convention, and an error for anything else —
/// the `−1` sentinel of the source becomes `Err` in idiomatic Rust.
pub trait Connection: Send + Sync {
    /// Writes up to `buf.len()` bytes, blocking until the deadline if the
    /// socket isn't immediately writable. Returns the number of bytes
    /// written, or `Err` for a fatal connection failure.
    fn write(&self, buf: &[u8], timeout: Option<Duration>) -> Result<usize>;

    /// Reads up to `buf.len()` bytes. Returns `Ok(0)` on clean EOF or
    /// cancellation, `Ok(n>0)` on data, `Err` on a fatal error.
    fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize>;

    /// Wakes any in-flight `read` and causes future reads to return `Ok(0)`
    /// until another read is explicitly posted. Idempotent.
    fn cancel(&self);

    /// Transitions to [`ConnectionState::Dead`] exactly once.
    fn shutdown(&self, direction: ShutdownDirection) -> Result<()>;

    fn state(&self) -> ConnectionState;

    fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> Result<()>;

    fn set_no_delay(&self, enabled: bool) -> Result<()>;

    /// `None` disables keepalive; `Some(seconds)` sets the idle interval.
    fn set_keepalive(&self, seconds: Option<u32>) -> Result<()>;

    fn peer_description(&self) -> Option<String>;

    /// The text-protocol request/response exchange.
    ///
    /// Writes `cmd` followed by a trailing NUL, then reads exactly 5
    /// bytes expected to be three decimal digits followed by `"> "`,
    /// parses the digits as the numeric status code, then reads bytes
    /// into `out` until a NUL or `out` is full. If `out` fills before the
    /// NUL arrives, remaining bytes up to the NUL are drained so the
    /// stream stays framed for the next exchange. The whole exchange is
    /// bounded by `timeout` (default 10 s); a blown deadline cancels I/O
    /// on both ends, modelling the whole exchange as a single task with a
    /// deadline and cooperative cancellation.
    fn request(&self, cmd: &str, out: &mut [u8], timeout: Duration) -> Result<(u32, usize)> {
        let deadline = Instant::now() + timeout;

        let mut payload = cmd.as_bytes().to_vec();
        payload.push(0);
        write_all_deadline(self, &payload, deadline)?;

        let mut header = [0u8; 5];
        read_exact_deadline(self, &mut header, deadline)?;
        if header[3] != b'>' || header[4] != b' ' {
            self.cancel();
            return Err(NetError::Protocol(format!(
                "malformed request reply header {header:?}"
            )));
        }
        let code_str = std::str::from_utf8(&header[0..3])
            .map_err(|_| NetError::Protocol("non-ascii status code".into()))?;
        let code: u32 = code_str
            .parse()
            .map_err(|_| NetError::Protocol(format!("non-numeric status code {code_str:?}")))?;

        let mut filled = 0usize;
        loop {
            let mut byte = [0u8; 1];
            let n = read_some_deadline(self, &mut byte, deadline)?;
            if n == 0 {
                self.cancel();
                return Err(NetError::Protocol("connection closed mid-reply".into()));
            }
            if byte[0] == 0 {
                return Ok((code, filled));
            }
            if filled < out.len() {
                out[filled] = byte[0];
                filled += 1;
            }
            // else: caller buffer is full, keep draining to the NUL.
        }
    }

    fn join(&self) {}
}

fn write_all_deadline(conn: &(impl Connection + ?Sized), buf: &[u8], deadline: Instant) -> Result<()> {
    let mut off = 0;
    while off < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            conn.cancel();
            return Err(NetError::Timeout(Duration::ZERO));
        }
        let n = conn.write(&buf[off..], Some(remaining))?;
        if n == 0 {
            conn.cancel();
            return Err(NetError::Protocol("write returned 0".into()));
        }
        off += n;
    }
    Ok(())
}

fn read_exact_deadline(conn: &(impl Connection + ?Sized), buf: &mut [u8], deadline: Instant) -> Result<()> {
    let mut off = 0;
    while off < buf.len() {
        let n = read_some_deadline(conn, &mut buf[off..], deadline)?;
        if n == 0 {
            conn.cancel();
            return Err(NetError::Protocol("connection closed mid-read".into()));
        }
        off += n;
    }
    Ok(())
}

fn read_some_deadline(conn: &(impl Connection + ?Sized), buf: &mut [u8], deadline: Instant) -> Result<usize> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        conn.cancel();
        return Err(NetError::Timeout(Duration::ZERO));
    }
    conn.read(buf, Some(remaining))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_moves_only_forward_to_dead() {
        let cell = StateCell::new(ConnectionState::Pending);
        cell.set(ConnectionState::Established);
        assert_eq!(cell.get(), ConnectionState::Established);
        cell.set(ConnectionState::Dead);
        assert_eq!(cell.get(), ConnectionState::Dead);
        // Further transitions are no-ops once dead.
        cell.set(ConnectionState::Established);
        assert_eq!(cell.get(), ConnectionState::Dead);
    }

    #[test]
    fn wait_for_state_times_out() {
        let cell = StateCell::new(ConnectionState::Pending);
        let err = cell
            .wait_for(ConnectionState::Established, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, NetError::Timeout(_)));
    }

    #[test]
    fn wait_for_state_fails_fast_on_dead() {
        let cell = StateCell::new(ConnectionState::Pending);
        cell.set(ConnectionState::Dead);
        let err = cell
            .wait_for(ConnectionState::Established, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, NetError::Dead));
    }
}
