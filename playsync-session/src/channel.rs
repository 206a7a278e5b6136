//! Typed, role-gated event channel
//!
//! Outbound events are stamped with the sender id and reference time at
//! send time. Inbound events pass through the role gate: restricted-scope
//! events from senders holding none of the allowed roles are dropped
//! silently (a telemetry counter increments). Malformed events are logged
//! and dropped; neither case terminates the coordinator.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use playsync_common::events::{PositionUpdatePayload, TransportCommand};
use playsync_common::roles::{holds_any, CachedRoleProvider, RoleProvider};
use playsync_common::time::correlation_id;
use playsync_common::{Error, EventEnvelope, ReferenceClock, Result, SessionEvent};

use crate::transport::{MessageTransport, TransportMessage};

/// Telemetry counters for the channel. All counters are monotonic.
#[derive(Debug, Default)]
pub struct ChannelStats {
    sent: AtomicU64,
    received: AtomicU64,
    dropped_role_denied: AtomicU64,
    dropped_protocol: AtomicU64,
}

/// Point-in-time copy of [`ChannelStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub dropped_role_denied: u64,
    pub dropped_protocol: u64,
}

impl ChannelStats {
    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped_role_denied: self.dropped_role_denied.load(Ordering::Relaxed),
            dropped_protocol: self.dropped_protocol.load(Ordering::Relaxed),
        }
    }
}

/// Publish/subscribe facade over the broadcast transport.
pub struct EventChannel {
    transport: Arc<dyn MessageTransport>,
    clock: Arc<dyn ReferenceClock>,
    roles: CachedRoleProvider,
    allowed_roles: BTreeSet<String>,
    stats: Arc<ChannelStats>,
}

impl EventChannel {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        clock: Arc<dyn ReferenceClock>,
        roles: Arc<dyn RoleProvider>,
        allowed_roles: BTreeSet<String>,
    ) -> Self {
        Self {
            transport,
            clock,
            roles: CachedRoleProvider::new(roles),
            allowed_roles,
            stats: Arc::new(ChannelStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ChannelStats> {
        Arc::clone(&self.stats)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportMessage> {
        self.transport.subscribe()
    }

    pub async fn wait_until_connected(&self) -> Result<String> {
        self.transport.wait_until_connected().await
    }

    pub fn local_client_id(&self) -> Option<String> {
        self.transport.local_client_id()
    }

    /// Stamp and send one event.
    ///
    /// Restricted-scope events are refused with `RoleDenied` when the local
    /// sender holds none of the allowed roles. A failed or cancelled send
    /// leaves no partial local state behind.
    pub async fn send(&self, event: SessionEvent, track_ref: Option<String>) -> Result<()> {
        let client_id = self
            .transport
            .local_client_id()
            .ok_or_else(|| Error::Transport("not connected".to_string()))?;

        if event.requires_role() {
            let roles = self.roles.roles_of(&client_id).await?;
            if !holds_any(&roles, &self.allowed_roles) {
                return Err(Error::RoleDenied(format!(
                    "{} requires one of {:?}",
                    event.name(),
                    self.allowed_roles
                )));
            }
        }

        let envelope = EventEnvelope {
            client_id,
            timestamp: self.clock.now_ms(),
            correlation_id: correlation_id(),
            track_ref,
            event,
        };
        self.transport.send(envelope).await?;
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Apply the inbound gate to one envelope: protocol validation, then
    /// the role check for restricted-scope events. Returns `true` when the
    /// event should reach the group state.
    pub async fn admit(&self, envelope: &EventEnvelope) -> bool {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        if let Some(problem) = protocol_problem(envelope) {
            self.stats.dropped_protocol.fetch_add(1, Ordering::Relaxed);
            warn!(
                correlation = %envelope.correlation_id,
                "dropping malformed {} event: {problem}",
                envelope.event.name()
            );
            return false;
        }

        if envelope.event.requires_role() {
            let roles = match self.roles.roles_of(&envelope.client_id).await {
                Ok(roles) => roles,
                Err(e) => {
                    self.stats.dropped_role_denied.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        sender = %envelope.client_id,
                        "role lookup failed, dropping {} event: {e}",
                        envelope.event.name()
                    );
                    return false;
                }
            };
            if !holds_any(&roles, &self.allowed_roles) {
                self.stats.dropped_role_denied.fetch_add(1, Ordering::Relaxed);
                debug!(
                    sender = %envelope.client_id,
                    "sender lacks an allowed role, dropping {} event",
                    envelope.event.name()
                );
                return false;
            }
        }

        true
    }

    /// Forget cached roles for a departed connection.
    pub async fn peer_left(&self, client_id: &str) {
        self.roles.invalidate(client_id).await;
    }
}

fn bad_float(value: f64, what: &str) -> Option<String> {
    if !value.is_finite() {
        Some(format!("{what} is not finite"))
    } else if value < 0.0 {
        Some(format!("{what} is negative"))
    } else {
        None
    }
}

fn command_problem(command: &TransportCommand) -> Option<String> {
    bad_float(command.position, "position")
}

fn position_update_problem(payload: &PositionUpdatePayload) -> Option<String> {
    bad_float(payload.position, "position")
        .or_else(|| {
            if payload.playback_rate.is_finite() {
                None
            } else {
                Some("playback rate is not finite".to_string())
            }
        })
        .or_else(|| {
            payload
                .wait_point
                .and_then(|wp| bad_float(wp.position, "wait point position"))
        })
}

/// Structural validation of an inbound envelope. Deeper semantic checks
/// (stale track refs, outdated stamps) belong to the group state.
fn protocol_problem(envelope: &EventEnvelope) -> Option<String> {
    if envelope.client_id.is_empty() {
        return Some("empty client id".to_string());
    }
    match &envelope.event {
        SessionEvent::Play(cmd) | SessionEvent::Pause(cmd) | SessionEvent::SeekTo(cmd) => {
            command_problem(cmd)
        }
        SessionEvent::SetTrack(payload) => payload
            .wait_points
            .iter()
            .find_map(|wp| bad_float(wp.position, "wait point position"))
            .or_else(|| {
                payload
                    .dynamic_wait_point
                    .and_then(|wp| bad_float(wp.position, "dynamic wait point position"))
            }),
        SessionEvent::PositionUpdate(payload) => position_update_problem(payload),
        SessionEvent::SetTrackData(_) | SessionEvent::Joined(_) => None,
    }
}
