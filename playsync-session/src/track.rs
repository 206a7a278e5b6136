//! Current-track register
//!
//! Tracks the group's selected track, its wait points, and which wait
//! points have been consumed since the track was loaded. Acceptance of a
//! new `setTrack` is decided by the last-writer-wins stamp so every peer
//! lands on the track carried by the most recent event, regardless of
//! delivery order.

use serde_json::Value;
use tracing::debug;

use playsync_common::{EventStamp, TrackMetadata, WaitPoint};

/// What a `setTrack` application did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackChange {
    /// Stale or identical; nothing changed.
    Unchanged,
    /// Same track, newer event; the static wait points were replaced.
    WaitPointsReplaced,
    /// A different track (or "no track") was installed.
    Loaded,
}

#[derive(Debug, Clone, PartialEq)]
struct WaitPointSlot {
    point: WaitPoint,
    consumed: bool,
    dynamic: bool,
}

/// The currently selected track plus its wait-point bookkeeping.
#[derive(Debug, Default)]
pub struct PlaybackTrack {
    metadata: Option<TrackMetadata>,
    slots: Vec<WaitPointSlot>,
    stamp: Option<EventStamp>,
    track_data: Option<Value>,
    track_data_stamp: Option<EventStamp>,
}

impl PlaybackTrack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata(&self) -> Option<&TrackMetadata> {
        self.metadata.as_ref()
    }

    pub fn identity(&self) -> Option<&str> {
        self.metadata.as_ref().map(|m| m.track_identity.as_str())
    }

    pub fn stamp(&self) -> Option<&EventStamp> {
        self.stamp.as_ref()
    }

    /// A `track_ref` matches when it names the current track (or when both
    /// sides agree there is no track).
    pub fn matches_ref(&self, track_ref: Option<&str>) -> bool {
        self.identity() == track_ref
    }

    /// Apply a `setTrack` event.
    ///
    /// Only an event whose stamp supersedes the installing event is
    /// accepted; replays and out-of-order stragglers are ignored. A same-
    /// identity event replaces the static wait points but preserves
    /// consumed flags for points that stay at the same position, so a
    /// courtesy re-broadcast cannot re-arm an already released hold.
    pub fn set_current(
        &mut self,
        metadata: Option<TrackMetadata>,
        wait_points: Vec<WaitPoint>,
        stamp: EventStamp,
    ) -> TrackChange {
        if let Some(current) = &self.stamp {
            if !stamp.supersedes(current) {
                debug!(stamp = %stamp, "ignoring stale setTrack");
                return TrackChange::Unchanged;
            }
        }

        let same_track = match (&self.metadata, &metadata) {
            (Some(a), Some(b)) => a.track_identity == b.track_identity,
            (None, None) => true,
            _ => false,
        };

        if same_track {
            self.stamp = Some(stamp);
            let dynamics: Vec<WaitPointSlot> =
                self.slots.iter().filter(|s| s.dynamic).cloned().collect();
            let old = std::mem::take(&mut self.slots);
            self.slots = wait_points
                .into_iter()
                .map(|point| WaitPointSlot {
                    consumed: old
                        .iter()
                        .any(|s| !s.dynamic && s.point.position == point.position && s.consumed),
                    point,
                    dynamic: false,
                })
                .chain(dynamics)
                .collect();
            self.sort_slots();
            TrackChange::WaitPointsReplaced
        } else {
            self.metadata = metadata;
            self.stamp = Some(stamp);
            self.slots = wait_points
                .into_iter()
                .map(|point| WaitPointSlot {
                    point,
                    consumed: false,
                    dynamic: false,
                })
                .collect();
            self.sort_slots();
            self.track_data = None;
            self.track_data_stamp = None;
            TrackChange::Loaded
        }
    }

    /// Merge a runtime wait point; it persists only until the track changes.
    pub fn add_dynamic_wait_point(&mut self, point: WaitPoint) {
        if self.metadata.is_none() {
            return;
        }
        if self.slots.iter().any(|s| s.point.position == point.position) {
            return;
        }
        self.slots.push(WaitPointSlot {
            point,
            consumed: false,
            dynamic: true,
        });
        self.sort_slots();
    }

    /// Lowest-position unconsumed wait point strictly beyond `after`.
    pub fn find_next_wait_point(&self, after: f64) -> Option<WaitPoint> {
        self.slots
            .iter()
            .find(|s| !s.consumed && s.point.position > after)
            .map(|s| s.point)
    }

    /// Lowest-position unconsumed wait point at or before `position`, i.e.
    /// the hold a player advancing to `position` must honor.
    pub fn reached_wait_point(&self, position: f64) -> Option<WaitPoint> {
        self.slots
            .iter()
            .find(|s| !s.consumed && s.point.position <= position)
            .map(|s| s.point)
    }

    /// True while the wait point at `position` has not been released.
    pub fn is_pending_wait_point(&self, position: f64) -> bool {
        self.slots
            .iter()
            .any(|s| !s.consumed && s.point.position == position)
    }

    /// Mark the wait point at `position` as released.
    pub fn consume(&mut self, position: f64) {
        for slot in &mut self.slots {
            if slot.point.position == position {
                slot.consumed = true;
            }
        }
    }

    /// The static wait points, as they would be re-broadcast.
    pub fn static_wait_points(&self) -> Vec<WaitPoint> {
        self.slots
            .iter()
            .filter(|s| !s.dynamic)
            .map(|s| s.point)
            .collect()
    }

    /// The first unreleased dynamic wait point, for sharing with peers that
    /// joined after it was announced.
    pub fn pending_dynamic_wait_point(&self) -> Option<WaitPoint> {
        self.slots
            .iter()
            .find(|s| s.dynamic && !s.consumed)
            .map(|s| s.point)
    }

    pub fn track_data(&self) -> Option<&Value> {
        self.track_data.as_ref()
    }

    /// Last-writer-wins update of the shared track data blob. Returns
    /// `true` when the stored value actually changed.
    pub fn set_track_data(&mut self, data: Option<Value>, stamp: EventStamp) -> bool {
        if let Some(current) = &self.track_data_stamp {
            if !stamp.supersedes(current) {
                return false;
            }
        }
        self.track_data_stamp = Some(stamp);
        if self.track_data == data {
            return false;
        }
        self.track_data = data;
        true
    }

    fn sort_slots(&mut self) {
        self.slots
            .sort_by(|a, b| a.point.position.total_cmp(&b.point.position));
    }
}
