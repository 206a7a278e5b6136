//! Common error types for PlaySync

use thiserror::Error;

/// Common result type for PlaySync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the session coordinator and its collaborators
#[derive(Error, Debug)]
pub enum Error {
    #[error("Coordinator is not initialized")]
    NotInitialized,

    #[error("No track is loaded")]
    NoTrack,

    #[error("Blocked by playback policy: {0}")]
    Blocked(String),

    #[error("Role denied: {0}")]
    RoleDenied(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
