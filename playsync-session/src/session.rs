//! Session facade
//!
//! The public entry point of the coordinator. Owns the group state behind a
//! mutex, runs the inbound dispatch task and the periodic position ticker,
//! and performs the role-gated sends that back each public method.
//!
//! All state mutation is synchronous and happens under the lock; sends and
//! role lookups happen outside it, so the lock is never held across an
//! `.await`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use playsync_common::events::{
    JoinedPayload, SetTrackDataPayload, SetTrackPayload, TransportCommand,
};
use playsync_common::roles::RoleProvider;
use playsync_common::{
    ActionBus, CoordinatorConfig, Error, PlaybackPolicy, PlaybackState, PlayerAction, Result,
    ReferenceClock, SessionEvent, TrackMetadata, WaitPoint,
};

use crate::channel::{ChannelStatsSnapshot, EventChannel};
use crate::group::{GroupState, IngestOutcome};
use crate::player::MediaPlayer;
use crate::suspension::Suspension;
use crate::transport::{MessageTransport, TransportMessage};

/// One participant's coordinator instance.
///
/// Created detached; [`initialize`](Self::initialize) binds the connection,
/// announces the join, and starts the background tasks. Dropping the
/// coordinator (or calling [`dispose`](Self::dispose)) halts them.
pub struct SessionCoordinator {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    pub(crate) state: Mutex<GroupState>,
    pub(crate) channel: EventChannel,
    pub(crate) clock: Arc<dyn ReferenceClock>,
    player: Arc<dyn MediaPlayer>,
    actions: ActionBus,
    policy: PlaybackPolicy,
    config: CoordinatorConfig,
    initialized: AtomicBool,
    disposed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionCoordinator {
    pub fn new(
        player: Arc<dyn MediaPlayer>,
        transport: Arc<dyn MessageTransport>,
        clock: Arc<dyn ReferenceClock>,
        roles: Arc<dyn RoleProvider>,
        config: CoordinatorConfig,
        policy: PlaybackPolicy,
    ) -> Result<Self> {
        config.validate()?;
        let actions = ActionBus::new(256);
        let channel = EventChannel::new(
            transport,
            Arc::clone(&clock),
            roles,
            config.allowed_transport_roles.clone(),
        );
        let state = GroupState::new(
            String::new(),
            config.clone(),
            policy.clone(),
            actions.clone(),
        );
        Ok(Self {
            inner: Arc::new(SessionInner {
                state: Mutex::new(state),
                channel,
                clock,
                player,
                actions,
                policy,
                config,
                initialized: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// One-shot startup: bind the connection id, start the dispatch and
    /// ticker tasks, and announce the join. Subsequent calls are no-ops.
    pub async fn initialize(&self) -> Result<()> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            debug!("coordinator already initialized");
            return Ok(());
        }

        let startup = self.startup().await;
        if startup.is_err() {
            for task in self.inner.tasks.lock().unwrap().drain(..) {
                task.abort();
            }
            self.inner.initialized.store(false, Ordering::SeqCst);
        }
        startup
    }

    async fn startup(&self) -> Result<()> {
        let client_id = self.inner.channel.wait_until_connected().await?;
        info!(client_id = %client_id, "session coordinator connected");
        self.inner.state.lock().unwrap().set_local_id(&client_id);

        // Subscribe before announcing so the replies to our join are seen.
        let rx = self.inner.channel.subscribe();
        let dispatch = tokio::spawn(run_dispatch(Arc::clone(&self.inner), rx));
        let ticker = tokio::spawn(run_ticker(Arc::clone(&self.inner)));
        self.inner.tasks.lock().unwrap().extend([dispatch, ticker]);

        self.inner
            .channel
            .send(SessionEvent::Joined(JoinedPayload {}), None)
            .await
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.state.lock().unwrap().is_suspended()
    }

    pub fn current_track(&self) -> Option<TrackMetadata> {
        self.inner.state.lock().unwrap().current_track()
    }

    /// The authoritative group playback state, as this peer sees it.
    pub fn group_playback_state(&self) -> PlaybackState {
        self.inner.state.lock().unwrap().group_playback_state()
    }

    /// Receiver for the local player actions this coordinator emits.
    pub fn subscribe_actions(&self) -> broadcast::Receiver<PlayerAction> {
        self.inner.actions.subscribe()
    }

    /// Snapshot of the per-peer position records, local peer included.
    pub fn peer_records(&self) -> std::collections::HashMap<String, crate::PositionRecord> {
        self.inner.state.lock().unwrap().records_snapshot()
    }

    pub fn stats(&self) -> ChannelStatsSnapshot {
        self.inner.channel.stats().snapshot()
    }

    pub fn max_playback_drift_seconds(&self) -> f64 {
        self.inner.config.max_playback_drift_seconds
    }

    pub fn position_update_interval_seconds(&self) -> f64 {
        self.inner.config.position_update_interval_seconds
    }

    pub fn can_play_pause(&self) -> bool {
        self.inner.policy.can_play_pause
    }

    pub fn can_seek(&self) -> bool {
        self.inner.policy.can_seek
    }

    pub fn can_set_track(&self) -> bool {
        self.inner.policy.can_set_track
    }

    pub fn can_set_track_data(&self) -> bool {
        self.inner.policy.can_set_track_data
    }

    pub fn can_send_position_updates(&self) -> bool {
        self.inner.policy.can_send_position_updates
    }

    /// Ask the group to play from the locally projected position.
    pub async fn play(&self) -> Result<()> {
        self.ensure_initialized()?;
        let track = self.require_track()?;
        if !self.inner.policy.can_play_pause {
            return Err(Error::Blocked("can_play_pause".to_string()));
        }
        let position = self.inner.projected_player_position();
        let track_ref = Some(track.track_identity.clone());
        self.inner
            .channel
            .send(SessionEvent::Play(TransportCommand { track, position }), track_ref)
            .await
    }

    /// Ask the group to pause at the locally projected position.
    pub async fn pause(&self) -> Result<()> {
        self.ensure_initialized()?;
        let track = self.require_track()?;
        if !self.inner.policy.can_play_pause {
            return Err(Error::Blocked("can_play_pause".to_string()));
        }
        let position = self.inner.projected_player_position();
        let track_ref = Some(track.track_identity.clone());
        self.inner
            .channel
            .send(SessionEvent::Pause(TransportCommand { track, position }), track_ref)
            .await
    }

    /// Ask the group to seek. A failed seek re-syncs the local player to
    /// the group state before the error is surfaced.
    pub async fn seek_to(&self, position: f64) -> Result<()> {
        self.ensure_initialized()?;
        self.require_track()?;
        self.inner.seek_group(position).await
    }

    /// Select a track for the whole group. `None` unloads the current one.
    pub async fn set_track(
        &self,
        metadata: Option<TrackMetadata>,
        wait_points: Vec<WaitPoint>,
    ) -> Result<()> {
        self.ensure_initialized()?;
        if !self.inner.policy.can_set_track {
            return Err(Error::Blocked("can_set_track".to_string()));
        }
        let track_ref = metadata.as_ref().map(|m| m.track_identity.clone());
        self.inner
            .channel
            .send(
                SessionEvent::SetTrack(SetTrackPayload {
                    metadata,
                    wait_points,
                    dynamic_wait_point: None,
                }),
                track_ref,
            )
            .await
    }

    /// Replace the shared track data blob (last writer wins).
    pub async fn set_track_data(&self, data: Option<serde_json::Value>) -> Result<()> {
        self.ensure_initialized()?;
        let track = self.require_track()?;
        if !self.inner.policy.can_set_track_data {
            return Err(Error::Blocked("can_set_track_data".to_string()));
        }
        self.inner
            .channel
            .send(
                SessionEvent::SetTrackData(SetTrackDataPayload { data }),
                Some(track.track_identity),
            )
            .await
    }

    /// Detach this peer from group synchronization.
    ///
    /// With a wait point, the point is announced to the group and holds the
    /// other participants when they reach it. The group reattaches when the
    /// returned handle (and every other outstanding one) has ended.
    pub async fn begin_suspension(&self, wait_point: Option<WaitPoint>) -> Result<Suspension> {
        self.ensure_initialized()?;
        if wait_point.is_some() {
            self.require_track()?;
        }

        self.inner.state.lock().unwrap().begin_suspension();

        if let Some(wp) = wait_point {
            let (payload, track_ref) = {
                let state = self.inner.state.lock().unwrap();
                (
                    SetTrackPayload {
                        metadata: state.current_track(),
                        wait_points: state.static_wait_points(),
                        dynamic_wait_point: Some(wp),
                    },
                    state.current_track_identity(),
                )
            };
            if let Err(e) = self
                .inner
                .channel
                .send(SessionEvent::SetTrack(payload), track_ref)
                .await
            {
                self.inner.state.lock().unwrap().abort_suspension();
                return Err(e);
            }
        }

        Ok(Suspension::new(Arc::clone(&self.inner)))
    }

    /// Stop the background tasks. In-flight sends complete on their own;
    /// the group state is left as-is.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("disposing session coordinator");
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    fn require_track(&self) -> Result<TrackMetadata> {
        self.current_track().ok_or(Error::NoTrack)
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl SessionInner {
    /// Position the local player is at right now, projected to the
    /// reference clock.
    fn projected_player_position(&self) -> f64 {
        let now = self.clock.now_ms();
        let state = self.player.state();
        match &state.position {
            Some(sample) => {
                sample.projected(now, state.playback_state == PlaybackState::Playing)
            }
            None => 0.0,
        }
    }

    /// The group seek used by `seek_to` and by post-suspension resumes.
    pub(crate) async fn seek_group(&self, position: f64) -> Result<()> {
        let result = self.try_seek(position).await;
        if result.is_err() {
            // Do not let a rejected command leave the player adrift.
            let now = self.clock.now_ms();
            let action = self.state.lock().unwrap().sync_local_action(now);
            self.actions.emit_lossy(action);
        }
        result
    }

    async fn try_seek(&self, position: f64) -> Result<()> {
        if !self.policy.can_seek {
            return Err(Error::Blocked("can_seek".to_string()));
        }
        let track = self
            .state
            .lock()
            .unwrap()
            .current_track()
            .ok_or(Error::NoTrack)?;
        let track_ref = Some(track.track_identity.clone());
        self.channel
            .send(
                SessionEvent::SeekTo(TransportCommand { track, position }),
                track_ref,
            )
            .await
    }

    /// Sample the player, fold it into the group state, and broadcast the
    /// resulting position update. The local record is refreshed even when
    /// the outbound send is denied, so the coordinator stays
    /// self-consistent.
    async fn broadcast_position_update(&self) {
        let now = self.clock.now_ms();
        let player_state = self.player.state();
        let (outcome, track_ref) = {
            let mut state = self.state.lock().unwrap();
            let outcome = state.tick(&player_state, now);
            (outcome, state.current_track_identity())
        };

        if let Some(position) = outcome.resume_seek {
            if let Err(e) = self.seek_group(position).await {
                warn!("deferred resume seek failed: {e}");
            }
        }

        let Some(payload) = outcome.payload else {
            return;
        };
        if !self.policy.can_send_position_updates {
            return;
        }
        match self
            .channel
            .send(SessionEvent::PositionUpdate(payload), track_ref)
            .await
        {
            Ok(()) => {}
            Err(Error::RoleDenied(_)) => {
                debug!("position update withheld by role gate");
            }
            Err(e) => warn!("position update failed: {e}"),
        }
    }

    async fn run_followups(&self, outcome: IngestOutcome) {
        if outcome.rebroadcast_track {
            let (payload, track_ref) = {
                let state = self.state.lock().unwrap();
                (
                    SetTrackPayload {
                        metadata: state.current_track(),
                        wait_points: state.static_wait_points(),
                        // A hold announced before the newcomer joined still
                        // applies to it.
                        dynamic_wait_point: state.pending_dynamic_wait_point(),
                    },
                    state.current_track_identity(),
                )
            };
            // A courtesy share for a newcomer; peers without the role stay
            // quiet and let a privileged peer answer.
            if let Err(e) = self
                .channel
                .send(SessionEvent::SetTrack(payload), track_ref)
                .await
            {
                debug!("track re-broadcast skipped: {e}");
            }
        }

        if outcome.broadcast_position {
            self.broadcast_position_update().await;
        }

        if let Some(position) = outcome.resume_seek {
            if let Err(e) = self.seek_group(position).await {
                warn!("deferred resume seek failed: {e}");
            }
        }
    }
}

async fn run_dispatch(
    inner: Arc<SessionInner>,
    mut rx: broadcast::Receiver<TransportMessage>,
) {
    loop {
        match rx.recv().await {
            Ok(TransportMessage::Event(envelope)) => {
                if !inner.channel.admit(&envelope).await {
                    continue;
                }
                let now = inner.clock.now_ms();
                let outcome = inner.state.lock().unwrap().apply(&envelope, now);
                inner.run_followups(outcome).await;
            }
            Ok(TransportMessage::PeerLeft { client_id }) => {
                inner.channel.peer_left(&client_id).await;
                let now = inner.clock.now_ms();
                let outcome = inner.state.lock().unwrap().peer_left(&client_id, now);
                inner.run_followups(outcome).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "transport subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_ticker(inner: Arc<SessionInner>) {
    let mut tick = interval(inner.config.position_update_interval());
    loop {
        tick.tick().await;
        if inner.disposed.load(Ordering::SeqCst) {
            break;
        }
        let has_track = inner
            .state
            .lock()
            .unwrap()
            .current_track_identity()
            .is_some();
        if !has_track {
            continue;
        }
        inner.broadcast_position_update().await;
    }
}
