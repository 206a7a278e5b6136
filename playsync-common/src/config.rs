//! Coordinator configuration
//!
//! Defaults are compiled in; embedders may override from a TOML fragment.
//! Values are validated after load so a bad config fails fast instead of
//! producing a coordinator that never converges.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// Tunables for the group coordinator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Largest tolerated gap between the local position and the group
    /// projection before a catchup is issued. Must be positive.
    pub max_playback_drift_seconds: f64,

    /// Cadence of the periodic position-update broadcast. Must be positive.
    pub position_update_interval_seconds: f64,

    /// Roles allowed to issue transport commands. Empty means unrestricted.
    pub allowed_transport_roles: BTreeSet<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_playback_drift_seconds: 1.0,
            position_update_interval_seconds: 2.0,
            allowed_transport_roles: BTreeSet::new(),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.max_playback_drift_seconds.is_finite() || self.max_playback_drift_seconds <= 0.0 {
            return Err(Error::Config(format!(
                "max_playback_drift_seconds must be positive, got {}",
                self.max_playback_drift_seconds
            )));
        }
        if !self.position_update_interval_seconds.is_finite()
            || self.position_update_interval_seconds <= 0.0
        {
            return Err(Error::Config(format!(
                "position_update_interval_seconds must be positive, got {}",
                self.position_update_interval_seconds
            )));
        }
        Ok(())
    }

    /// Parse and validate a TOML fragment.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid coordinator config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn max_playback_drift(&self) -> Duration {
        Duration::from_secs_f64(self.max_playback_drift_seconds)
    }

    pub fn position_update_interval(&self) -> Duration {
        Duration::from_secs_f64(self.position_update_interval_seconds)
    }
}

/// Advisory capability flags bound at `initialize()`.
///
/// These gate what the local user interface may ask for; they are not a
/// security boundary. The authoritative check is the transport role gate.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlaybackPolicy {
    pub can_play_pause: bool,
    pub can_seek: bool,
    pub can_set_track: bool,
    pub can_set_track_data: bool,
    pub can_send_position_updates: bool,
}

impl Default for PlaybackPolicy {
    fn default() -> Self {
        Self {
            can_play_pause: true,
            can_seek: true,
            can_set_track: true,
            can_set_track_data: true,
            can_send_position_updates: true,
        }
    }
}
