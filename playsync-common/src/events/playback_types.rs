//! Playback-related type definitions
//!
//! Supporting types for playback state, track identity, and wait points.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Playback state reported by a media element or recorded for a peer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    /// No track loaded
    #[default]
    None,
    Paused,
    Playing,
    Ended,
    /// Locally detached from group synchronization
    Suspended,
    /// Holding at a wait point
    Waiting,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::None => write!(f, "none"),
            PlaybackState::Paused => write!(f, "paused"),
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Ended => write!(f, "ended"),
            PlaybackState::Suspended => write!(f, "suspended"),
            PlaybackState::Waiting => write!(f, "waiting"),
        }
    }
}

/// Track metadata, opaque to the coordinator beyond its identity key.
///
/// Everything except `track_identity` round-trips untouched in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackMetadata {
    pub track_identity: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl TrackMetadata {
    pub fn new(track_identity: impl Into<String>) -> Self {
        Self {
            track_identity: track_identity.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Two tracks are the same track iff their identity keys match.
impl PartialEq for TrackMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.track_identity == other.track_identity
    }
}

impl Eq for TrackMetadata {}

/// A playback offset at which participants hold until released.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaitPoint {
    /// Playback offset in seconds
    pub position: f64,

    /// When set, the wait releases as soon as this many peers hold at the
    /// point, instead of waiting for every live peer to reach it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_clients: Option<u32>,
}

impl WaitPoint {
    pub fn at(position: f64) -> Self {
        Self {
            position,
            max_clients: None,
        }
    }
}

/// A position sample taken from the media element.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PositionState {
    /// Playback offset in seconds
    pub position: f64,
    pub playback_rate: f64,
    /// Reference time of the sample in milliseconds
    pub timestamp: u64,
}

impl PositionState {
    /// Extrapolate the sample to `now_ms`, assuming playback continued at
    /// the sampled rate. Frozen samples project to themselves.
    pub fn projected(&self, now_ms: u64, playing: bool) -> f64 {
        if playing {
            let elapsed = now_ms.saturating_sub(self.timestamp) as f64 / 1000.0;
            (self.position + elapsed * self.playback_rate).max(0.0)
        } else {
            self.position.max(0.0)
        }
    }
}

/// Snapshot reported by the local media element.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub metadata: Option<TrackMetadata>,
    pub track_data: Option<Value>,
    pub playback_state: PlaybackState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<PositionState>,
}
