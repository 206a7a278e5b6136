//! Reference clock and event ordering
//!
//! All peers in a session are assumed to share a server-disciplined clock;
//! the [`ReferenceClock`] trait exists so tests and embedders can substitute
//! their own source. Ordering of concurrent events is decided by
//! [`EventStamp`], the single total-order key used by every last-writer-wins
//! register in the coordinator.

use std::cmp::Ordering;
use std::fmt;

use chrono::Utc;

/// Monotonic reference-time provider shared by all peers.
pub trait ReferenceClock: Send + Sync {
    /// Current reference time in integer milliseconds.
    fn now_ms(&self) -> u64;
}

/// Wall-clock reference time (epoch milliseconds, UTC).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl ReferenceClock for SystemClock {
    fn now_ms(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Fresh correlation id for an outbound event envelope.
pub fn correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Total-order key for last-writer-wins merges.
///
/// Higher timestamps win. On a timestamp collision the lexicographically
/// smaller sender id wins, so two peers that saw the same events agree on
/// the winner without a central sequencer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStamp {
    pub timestamp: u64,
    pub sender: String,
}

impl EventStamp {
    pub fn new(timestamp: u64, sender: impl Into<String>) -> Self {
        Self {
            timestamp,
            sender: sender.into(),
        }
    }

    /// True when an event carrying `self` replaces state carrying `other`.
    pub fn supersedes(&self, other: &EventStamp) -> bool {
        self > other
    }
}

impl Ord for EventStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        // Sender comparison is inverted: the smaller id wins ties.
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| other.sender.cmp(&self.sender))
    }
}

impl PartialOrd for EventStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EventStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.timestamp, self.sender)
    }
}
