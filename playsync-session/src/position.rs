//! Per-peer playback position records and projection
//!
//! Each live peer has at most one record, replaced under last-writer-wins
//! ordering. A record's current position is a projection: the reported
//! position advanced by the reference time elapsed since the report, scaled
//! by the reported rate, while the peer was playing.

use std::collections::HashMap;

use playsync_common::{EventStamp, PlaybackState, WaitPoint};

/// Last observed state of one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionRecord {
    pub playback_state: PlaybackState,
    /// `track_identity` the report was made against, when a track was loaded.
    pub track: Option<String>,
    /// Playback offset in seconds at `stamp.timestamp`.
    pub position: f64,
    pub playback_rate: f64,
    pub stamp: EventStamp,
    /// Set while the peer is holding at a wait point.
    pub waiting_at: Option<WaitPoint>,
}

impl PositionRecord {
    pub fn is_playing(&self) -> bool {
        self.playback_state == PlaybackState::Playing
    }

    pub fn is_waiting(&self) -> bool {
        self.playback_state == PlaybackState::Waiting || self.waiting_at.is_some()
    }

    /// Estimated position at `now_ms`, clamped to `[0, ∞)`.
    pub fn projected_position(&self, now_ms: u64) -> f64 {
        if self.is_playing() {
            let elapsed = now_ms.saturating_sub(self.stamp.timestamp) as f64 / 1000.0;
            (self.position + elapsed * self.playback_rate).max(0.0)
        } else {
            self.position.max(0.0)
        }
    }
}

/// Insert `record` for `peer` unless an existing record supersedes it.
/// Returns `true` when the map changed.
pub fn upsert(
    records: &mut HashMap<String, PositionRecord>,
    peer: &str,
    record: PositionRecord,
) -> bool {
    match records.get(peer) {
        Some(existing) if !record.stamp.supersedes(&existing.stamp) => false,
        _ => {
            records.insert(peer.to_string(), record);
            true
        }
    }
}

/// Median of a set of positions; even-sized sets average the two middle
/// values. `None` for an empty set.
pub fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}
