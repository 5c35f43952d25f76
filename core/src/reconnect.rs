//! Resolve and connect retry policy
//!
//! Pure counter state for one connection's retry cycle: how many times
//! the current candidate address has been attempted, when to advance to
//! the next candidate, and when the cycle is exhausted. The connection
//! task owns the timers; this type only decides what happens next.

use std::net::SocketAddr;

/// Default number of attempts per candidate (and per resolve cycle).
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;
/// Default delay before each connect attempt, in seconds.
pub const DEFAULT_CONNECT_DELAY: u64 = 20;
/// Default connect (and resolve-retry) timeout, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 10;
/// Default idle-receive timeout, in seconds. Effectively unbounded.
pub const DEFAULT_RECEIVE_TIMEOUT: u64 = i32::MAX as u64;

/// Retry state machine over the resolved candidate list.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Maximum attempts per candidate address.
    pub connect_attempts: u32,
    /// Seconds to wait before each connect attempt.
    pub connect_delay: u64,
    /// Seconds before an in-flight connect (or a failed resolve retry)
    /// is abandoned.
    pub connect_timeout: u64,
    /// Seconds of receive silence before the stream is torn down.
    pub receive_timeout: u64,
    /// Whether to restart from resolve after a disconnect.
    pub respawn: bool,

    candidates: Vec<SocketAddr>,
    cursor: usize,
    attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_delay: DEFAULT_CONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            respawn: true,
            candidates: Vec::new(),
            cursor: 0,
            attempts: 1,
        }
    }
}

impl ReconnectPolicy {
    /// Load a fresh candidate list after a successful resolve. Resets
    /// the attempt counter so the first candidate gets a full cycle.
    pub fn begin(&mut self, candidates: Vec<SocketAddr>) {
        self.candidates = candidates;
        self.cursor = 0;
        self.attempts = 0;
    }

    /// Pick the address for the next connect attempt.
    ///
    /// The current candidate is retried until it has been attempted
    /// `connect_attempts` times; then the counter resets to 1 and the
    /// cursor advances. `None` means every candidate is exhausted, and
    /// the cycle ends with no further notice.
    pub fn next_attempt(&mut self) -> Option<SocketAddr> {
        if self.attempts < self.connect_attempts {
            self.attempts += 1;
        } else {
            self.attempts = 1;
            self.cursor += 1;
        }
        self.candidates.get(self.cursor).copied()
    }

    /// Account for one failed resolve. Returns false once the bounded
    /// retries are used up and the connection should terminate.
    pub fn retry_resolve(&mut self) -> bool {
        if self.attempts < self.connect_attempts {
            self.attempts += 1;
            true
        } else {
            false
        }
    }
}
