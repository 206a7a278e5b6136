//! Media player seam
//!
//! The coordinator never drives a media element directly. It samples the
//! element through [`MediaPlayer::state`] and emits [`PlayerAction`]s on the
//! action bus; the binding subscribes via
//! [`SessionCoordinator::subscribe_actions`] and maps each action onto the
//! element (`play`, `pause`, `seek`, `load`).
//!
//! [`PlayerAction`]: playsync_common::PlayerAction
//! [`SessionCoordinator::subscribe_actions`]: crate::SessionCoordinator::subscribe_actions

use playsync_common::PlayerState;

/// Read access to the local media element.
///
/// `state` is called from the position ticker and from facade methods; it
/// should be a cheap snapshot, not an I/O operation.
pub trait MediaPlayer: Send + Sync {
    fn state(&self) -> PlayerState;
}
