//! Event types for the session broadcast channel
//!
//! Wire protocol events are JSON-compatible and travel inside an
//! [`EventEnvelope`] stamped by the event channel at send time. Local player
//! actions never leave the process; they ride the [`ActionBus`].

mod actions;
mod playback_types;

pub use actions::{ActionBus, PlayerAction};
pub use playback_types::{PlaybackState, PlayerState, PositionState, TrackMetadata, WaitPoint};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time::EventStamp;

/// Payload of the `play`, `pause`, and `seekTo` transport commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportCommand {
    pub track: TrackMetadata,
    /// Playback offset in seconds
    pub position: f64,
}

/// Payload of `setTrack`. `metadata: None` means "no track loaded".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SetTrackPayload {
    pub metadata: Option<TrackMetadata>,
    #[serde(default)]
    pub wait_points: Vec<WaitPoint>,

    /// Runtime wait point announced by a suspending peer; valid only for
    /// the remainder of the current track.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_wait_point: Option<WaitPoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SetTrackDataPayload {
    pub data: Option<Value>,
}

/// Periodic per-peer state report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpdatePayload {
    pub playback_state: PlaybackState,
    /// Playback offset in seconds
    pub position: f64,
    pub playback_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_data: Option<Value>,

    /// Present while the sender is holding at a wait point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_point: Option<WaitPoint>,
}

/// Join ping from a newly connected peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JoinedPayload {}

/// Session events as they travel on the broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "name", content = "data", rename_all = "camelCase")]
pub enum SessionEvent {
    Play(TransportCommand),
    Pause(TransportCommand),
    SeekTo(TransportCommand),
    SetTrack(SetTrackPayload),
    SetTrackData(SetTrackDataPayload),
    PositionUpdate(PositionUpdatePayload),
    Joined(JoinedPayload),
}

impl SessionEvent {
    /// Events in the restricted scope require the sender to hold an allowed
    /// transport role; position updates and join pings do not.
    pub fn requires_role(&self) -> bool {
        !matches!(
            self,
            SessionEvent::PositionUpdate(_) | SessionEvent::Joined(_)
        )
    }

    /// Wire name of the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Play(_) => "play",
            SessionEvent::Pause(_) => "pause",
            SessionEvent::SeekTo(_) => "seekTo",
            SessionEvent::SetTrack(_) => "setTrack",
            SessionEvent::SetTrackData(_) => "setTrackData",
            SessionEvent::PositionUpdate(_) => "positionUpdate",
            SessionEvent::Joined(_) => "joined",
        }
    }
}

/// Envelope added by the event channel at send time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub client_id: String,
    /// Reference time at send, in milliseconds
    pub timestamp: u64,
    pub correlation_id: String,

    /// `track_identity` of the sender's current track, when it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_ref: Option<String>,

    #[serde(flatten)]
    pub event: SessionEvent,
}

impl EventEnvelope {
    /// The last-writer-wins ordering key of this event.
    pub fn stamp(&self) -> EventStamp {
        EventStamp::new(self.timestamp, self.client_id.clone())
    }
}
