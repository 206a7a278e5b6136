//! Local player actions and their delivery bus

use serde_json::Value;
use tokio::sync::broadcast;

use super::playback_types::TrackMetadata;

/// Action the local media player binding should perform.
///
/// The coordinator never touches the media element directly; it emits these
/// and the binding maps them onto the element's API.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerAction {
    Play {
        position: f64,
    },
    Pause {
        position: f64,
    },
    SeekTo {
        position: f64,
    },
    /// Corrective re-alignment with the group projection, delivered as a
    /// precise seek target. Bindings should seek and keep the current
    /// play/pause state; adaptive-bitrate bindings may rate-adjust instead.
    Catchup {
        position: f64,
    },
    /// `None` means unload the current track.
    LoadTrack {
        metadata: Option<TrackMetadata>,
    },
    TrackDataChanged {
        data: Option<Value>,
    },
    /// One-shot reconciliation after a suspension ends or a seek fails:
    /// load `metadata` if it differs, seek to `position`, then play or pause.
    SyncLocal {
        metadata: Option<TrackMetadata>,
        position: f64,
        play: bool,
    },
}

/// Broadcast bus carrying [`PlayerAction`]s to the media player binding.
///
/// Backed by `tokio::sync::broadcast`: non-blocking emit, any number of
/// subscribers, and lagged subscribers drop old actions rather than stalling
/// the coordinator's event loop.
#[derive(Debug, Clone)]
pub struct ActionBus {
    tx: broadcast::Sender<PlayerAction>,
}

impl ActionBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerAction> {
        self.tx.subscribe()
    }

    /// Emit an action, ignoring the case where no binding is listening yet.
    pub fn emit_lossy(&self, action: PlayerAction) {
        let _ = self.tx.send(action);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
