//! # PlaySync Session Coordinator
//!
//! A distributed state machine that keeps playback of a media element
//! synchronized across a group of participants connected through a
//! best-effort, ordered broadcast channel with server-provided timestamps.
//!
//! Every participant runs an identical [`SessionCoordinator`] against its
//! local media player. The coordinator ingests transport events, maintains
//! the authoritative group view locally, and emits [`PlayerAction`]s the
//! local player binding should perform so that all players converge on the
//! same track, play/pause state, and logical position.
//!
//! [`PlayerAction`]: playsync_common::PlayerAction

pub mod channel;
pub mod group;
pub mod player;
pub mod position;
pub mod session;
pub mod suspension;
pub mod track;
pub mod transport;

pub use channel::{ChannelStats, ChannelStatsSnapshot, EventChannel};
pub use group::{GroupState, IngestOutcome};
pub use player::MediaPlayer;
pub use position::PositionRecord;
pub use session::SessionCoordinator;
pub use suspension::Suspension;
pub use track::{PlaybackTrack, TrackChange};
pub use transport::{HubConnection, InProcessHub, MessageTransport, TransportMessage};
