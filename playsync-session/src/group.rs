//! Group coordinator state machine
//!
//! Merges inbound transport, track, and position events into the
//! authoritative group view and decides the local action. Every register in
//! here converges under last-writer-wins `(timestamp, sender)` ordering, so
//! two peers that have seen the same set of events expose the same current
//! track, group playback state, and peer-record map regardless of delivery
//! order.

use std::collections::HashMap;

use tracing::{debug, info};

use playsync_common::events::{
    PositionUpdatePayload, SetTrackDataPayload, SetTrackPayload, TransportCommand,
};
use playsync_common::{
    ActionBus, CoordinatorConfig, EventEnvelope, EventStamp, PlaybackPolicy, PlaybackState,
    PlayerAction, PlayerState, SessionEvent, TrackMetadata, WaitPoint,
};

use crate::position::{median, upsert, PositionRecord};
use crate::track::{PlaybackTrack, TrackChange};

/// Follow-up work an ingest step asks the session facade to perform.
///
/// The facade executes these outside the state lock: broadcasts require an
/// async send, and the state machine never awaits.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestOutcome {
    /// Broadcast a fresh position update (a newcomer needs current state).
    pub broadcast_position: bool,
    /// Re-broadcast the current track so a newcomer can load it.
    pub rebroadcast_track: bool,
    /// A deferred post-suspension seek became due (its wait released).
    pub resume_seek: Option<f64>,
}

/// Result of folding one local player sample into the group state.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickOutcome {
    /// The position update to broadcast, when a track is loaded.
    pub payload: Option<PositionUpdatePayload>,
    pub resume_seek: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Play,
    Pause,
    Seek,
}

/// The coordinator's mutable core. Owned by the session facade behind a
/// mutex; all methods are synchronous and never block.
pub struct GroupState {
    local_id: String,
    records: HashMap<String, PositionRecord>,
    track: PlaybackTrack,
    suspension_count: u32,
    waiting_at: Option<WaitPoint>,
    pending_resume_seek: Option<f64>,
    last_command_stamp: Option<EventStamp>,
    last_catchup_ms: Option<u64>,
    config: CoordinatorConfig,
    policy: PlaybackPolicy,
    actions: ActionBus,
}

impl GroupState {
    pub fn new(
        local_id: impl Into<String>,
        config: CoordinatorConfig,
        policy: PlaybackPolicy,
        actions: ActionBus,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            records: HashMap::new(),
            track: PlaybackTrack::new(),
            suspension_count: 0,
            waiting_at: None,
            pending_resume_seek: None,
            last_command_stamp: None,
            last_catchup_ms: None,
            config,
            policy,
            actions,
        }
    }

    /// Bind the connection id once the transport handshake completes.
    pub fn set_local_id(&mut self, id: impl Into<String>) {
        self.local_id = id.into();
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn is_suspended(&self) -> bool {
        self.suspension_count > 0
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting_at.is_some()
    }

    pub fn current_track(&self) -> Option<TrackMetadata> {
        self.track.metadata().cloned()
    }

    pub fn current_track_identity(&self) -> Option<String> {
        self.track.identity().map(str::to_string)
    }

    pub fn static_wait_points(&self) -> Vec<WaitPoint> {
        self.track.static_wait_points()
    }

    /// An announced dynamic wait point that has not released yet.
    pub fn pending_dynamic_wait_point(&self) -> Option<WaitPoint> {
        self.track.pending_dynamic_wait_point()
    }

    pub fn records_snapshot(&self) -> HashMap<String, PositionRecord> {
        self.records.clone()
    }

    /// The authoritative group playback state, computed locally.
    pub fn group_playback_state(&self) -> PlaybackState {
        if self.track.identity().is_none() {
            return PlaybackState::None;
        }
        if self.active_wait_point().is_some() {
            return PlaybackState::Paused;
        }
        if self.majority_playing() {
            PlaybackState::Playing
        } else {
            PlaybackState::Paused
        }
    }

    /// Ingest one gated transport event.
    pub fn apply(&mut self, envelope: &EventEnvelope, now_ms: u64) -> IngestOutcome {
        let stamp = envelope.stamp();
        let mut outcome = IngestOutcome::default();
        match &envelope.event {
            SessionEvent::Play(cmd) => self.handle_command(Command::Play, cmd, &stamp, now_ms),
            SessionEvent::Pause(cmd) => self.handle_command(Command::Pause, cmd, &stamp, now_ms),
            SessionEvent::SeekTo(cmd) => self.handle_command(Command::Seek, cmd, &stamp, now_ms),
            SessionEvent::SetTrack(payload) => {
                self.handle_set_track(payload, &stamp, now_ms);
            }
            SessionEvent::SetTrackData(payload) => self.handle_set_track_data(payload, &stamp),
            SessionEvent::PositionUpdate(payload) => {
                self.handle_position_update(
                    &envelope.client_id,
                    envelope.track_ref.as_deref(),
                    payload,
                    &stamp,
                    now_ms,
                    &mut outcome,
                );
            }
            SessionEvent::Joined(_) => self.handle_joined(&envelope.client_id, &mut outcome),
        }
        outcome
    }

    /// Reap a departed peer and re-evaluate wait release.
    pub fn peer_left(&mut self, client_id: &str, now_ms: u64) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();
        if self.records.remove(client_id).is_some() {
            debug!(peer = client_id, "reaped group position record");
            self.recompute(now_ms, &mut outcome);
        }
        outcome
    }

    /// Fold a local player sample into the state and produce the periodic
    /// position update.
    pub fn tick(&mut self, player: &PlayerState, now_ms: u64) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let Some(identity) = self.track.identity().map(str::to_string) else {
            return outcome;
        };

        let (sampled_position, rate) = match &player.position {
            Some(sample) => (
                sample.projected(now_ms, player.playback_state == PlaybackState::Playing),
                sample.playback_rate,
            ),
            None => (0.0, 1.0),
        };

        let reported_state = if self.is_suspended() {
            PlaybackState::Suspended
        } else if self.waiting_at.is_some() {
            PlaybackState::Waiting
        } else {
            player.playback_state
        };
        let reported_position = match self.waiting_at {
            Some(wp) => wp.position,
            None => sampled_position,
        };

        // The player sample is ground truth for the local record.
        self.records.insert(
            self.local_id.clone(),
            PositionRecord {
                playback_state: reported_state,
                track: Some(identity),
                position: reported_position,
                playback_rate: rate,
                stamp: EventStamp::new(now_ms, self.local_id.clone()),
                waiting_at: self.waiting_at,
            },
        );

        // Arriving at a pending wait point holds the local player there.
        if !self.is_suspended()
            && self.waiting_at.is_none()
            && player.playback_state == PlaybackState::Playing
        {
            if let Some(wp) = self.track.reached_wait_point(sampled_position) {
                self.enter_waiting(wp, sampled_position, now_ms);
            }
        }

        let mut ingest = IngestOutcome::default();
        self.recompute(now_ms, &mut ingest);
        outcome.resume_seek = ingest.resume_seek;

        if let Some(record) = self.records.get(&self.local_id) {
            outcome.payload = Some(PositionUpdatePayload {
                playback_state: record.playback_state,
                position: record.position,
                playback_rate: record.playback_rate,
                track_data: self.track.track_data().cloned(),
                wait_point: record.waiting_at,
            });
        }
        outcome
    }

    /// Detach from group synchronization. Returns the new depth.
    pub fn begin_suspension(&mut self) -> u32 {
        self.suspension_count += 1;
        info!(depth = self.suspension_count, "suspension began");
        self.suspension_count
    }

    /// Reattach one suspension level. On the last level the authoritative
    /// group state is re-applied to the player in a single action.
    pub fn end_suspension(&mut self, now_ms: u64) -> bool {
        debug_assert!(self.suspension_count > 0);
        self.suspension_count = self.suspension_count.saturating_sub(1);
        if self.suspension_count > 0 {
            return false;
        }
        info!("last suspension ended, reconciling with group state");
        self.actions.emit_lossy(self.sync_local_action(now_ms));
        true
    }

    /// Roll back a `begin_suspension` whose announcement failed to send,
    /// without the reconciliation a real resume performs.
    pub(crate) fn abort_suspension(&mut self) {
        self.suspension_count = self.suspension_count.saturating_sub(1);
    }

    /// Remember a seek to run once the group is neither suspended nor
    /// waiting (deferred from `Suspension::end`).
    pub fn defer_resume_seek(&mut self, position: f64) {
        self.pending_resume_seek = Some(position);
    }

    /// The one-shot reconciliation action: track if changed, position, then
    /// play or pause.
    pub fn sync_local_action(&self, now_ms: u64) -> PlayerAction {
        let play = !self.is_suspended() && self.group_playback_state() == PlaybackState::Playing;
        PlayerAction::SyncLocal {
            metadata: self.track.metadata().cloned(),
            position: self.group_position(now_ms),
            play,
        }
    }

    /// Median projected position of the playing peers, falling back to the
    /// median of everyone on the current track.
    pub fn group_position(&self, now_ms: u64) -> f64 {
        let playing: Vec<f64> = self
            .on_track_records()
            .filter(|(_, r)| r.is_playing())
            .map(|(_, r)| r.projected_position(now_ms))
            .collect();
        if let Some(value) = median(playing) {
            return value;
        }
        median(
            self.on_track_records()
                .map(|(_, r)| r.projected_position(now_ms))
                .collect(),
        )
        .unwrap_or(0.0)
    }

    fn handle_command(
        &mut self,
        command: Command,
        cmd: &TransportCommand,
        stamp: &EventStamp,
        now_ms: u64,
    ) {
        if !self.track.matches_ref(Some(cmd.track.track_identity.as_str())) {
            debug!(
                track = %cmd.track.track_identity,
                "dropping transport command for a stale track"
            );
            return;
        }
        if self.is_suspended() {
            debug!("suspended, rejecting transport command");
            return;
        }

        let from_self = stamp.sender == self.local_id;
        let local_projection = self
            .records
            .get(&self.local_id)
            .map(|r| r.projected_position(now_ms))
            .unwrap_or(0.0);

        // A seek away from the held position abandons the wait.
        if command == Command::Seek {
            if let Some(wp) = self.waiting_at {
                if cmd.position != wp.position {
                    self.waiting_at = None;
                }
            }
        }

        let identity = Some(cmd.track.track_identity.clone());
        let state_for = |existing: Option<&PositionRecord>| match command {
            Command::Play => PlaybackState::Playing,
            Command::Pause => PlaybackState::Paused,
            Command::Seek => existing
                .map(|r| r.playback_state)
                .unwrap_or(PlaybackState::Paused),
        };
        let rate_for =
            |existing: Option<&PositionRecord>| existing.map(|r| r.playback_rate).unwrap_or(1.0);

        for peer in [stamp.sender.clone(), self.local_id.clone()] {
            let existing = self.records.get(&peer);
            let record = PositionRecord {
                playback_state: state_for(existing),
                track: identity.clone(),
                position: cmd.position,
                playback_rate: rate_for(existing),
                stamp: stamp.clone(),
                waiting_at: if peer == self.local_id {
                    self.waiting_at
                } else {
                    existing.and_then(|r| r.waiting_at)
                },
            };
            upsert(&mut self.records, &peer, record);
        }

        // A command that lost the `(timestamp, sender)` race against an
        // already applied command must not move the player; the winner's
        // action already did. Replays tie and lose too.
        let fresh = self
            .last_command_stamp
            .as_ref()
            .map_or(true, |last| stamp.supersedes(last));
        if !fresh {
            debug!(stamp = %stamp, "superseded transport command, no action");
            return;
        }
        self.last_command_stamp = Some(stamp.clone());

        match command {
            Command::Play => {
                if self.active_wait_point().is_some() {
                    debug!("wait point pending, suppressing play action");
                } else if !from_self
                    && cmd.position - local_projection > self.config.max_playback_drift_seconds
                {
                    self.last_catchup_ms = Some(now_ms);
                    self.emit(PlayerAction::Catchup {
                        position: cmd.position,
                    });
                } else {
                    self.emit(PlayerAction::Play {
                        position: cmd.position,
                    });
                }
            }
            Command::Pause => self.emit(PlayerAction::Pause {
                position: cmd.position,
            }),
            Command::Seek => self.emit(PlayerAction::SeekTo {
                position: cmd.position,
            }),
        }
    }

    fn handle_set_track(&mut self, payload: &SetTrackPayload, stamp: &EventStamp, now_ms: u64) {
        let change = self.track.set_current(
            payload.metadata.clone(),
            payload.wait_points.clone(),
            stamp.clone(),
        );

        if change == TrackChange::Loaded {
            self.waiting_at = None;
            self.last_command_stamp = None;
            self.last_catchup_ms = None;

            match self.track.identity().map(str::to_string) {
                Some(identity) => {
                    info!(track = %identity, "group track changed");
                    // Everyone reloads paused at the start; the sender's and
                    // our own records reflect that immediately.
                    for peer in [stamp.sender.clone(), self.local_id.clone()] {
                        upsert(
                            &mut self.records,
                            &peer,
                            PositionRecord {
                                playback_state: PlaybackState::Paused,
                                track: Some(identity.clone()),
                                position: 0.0,
                                playback_rate: 1.0,
                                stamp: stamp.clone(),
                                waiting_at: None,
                            },
                        );
                    }
                    self.emit(PlayerAction::LoadTrack {
                        metadata: self.track.metadata().cloned(),
                    });
                    self.emit(PlayerAction::Pause { position: 0.0 });
                }
                None => {
                    info!("group track cleared");
                    let held = self
                        .records
                        .get(&self.local_id)
                        .map(|r| r.projected_position(now_ms))
                        .unwrap_or(0.0);
                    for peer in [stamp.sender.clone(), self.local_id.clone()] {
                        upsert(
                            &mut self.records,
                            &peer,
                            PositionRecord {
                                playback_state: PlaybackState::None,
                                track: None,
                                position: 0.0,
                                playback_rate: 1.0,
                                stamp: stamp.clone(),
                                waiting_at: None,
                            },
                        );
                    }
                    self.emit(PlayerAction::Pause { position: held });
                    self.emit(PlayerAction::LoadTrack { metadata: None });
                }
            }
        }

        if let Some(wp) = payload.dynamic_wait_point {
            let applies = match (&payload.metadata, self.track.identity()) {
                (Some(meta), Some(current)) => meta.track_identity == current,
                _ => false,
            };
            if applies {
                debug!(position = wp.position, "dynamic wait point announced");
                self.track.add_dynamic_wait_point(wp);
                // Peers already past the point hold immediately.
                if !self.is_suspended() && self.waiting_at.is_none() {
                    let local_projection = self
                        .records
                        .get(&self.local_id)
                        .map(|r| r.projected_position(now_ms))
                        .unwrap_or(0.0);
                    if local_projection >= wp.position
                        && self.track.is_pending_wait_point(wp.position)
                    {
                        self.enter_waiting(wp, local_projection, now_ms);
                    }
                }
            }
        }
    }

    fn handle_set_track_data(&mut self, payload: &SetTrackDataPayload, stamp: &EventStamp) {
        if self.track.set_track_data(payload.data.clone(), stamp.clone()) {
            self.emit(PlayerAction::TrackDataChanged {
                data: self.track.track_data().cloned(),
            });
        }
    }

    fn handle_position_update(
        &mut self,
        sender: &str,
        track_ref: Option<&str>,
        payload: &PositionUpdatePayload,
        stamp: &EventStamp,
        now_ms: u64,
        outcome: &mut IngestOutcome,
    ) {
        if !self.track.matches_ref(track_ref) {
            debug!(
                sender,
                track = track_ref.unwrap_or("<none>"),
                "dropping position update for a different track"
            );
            return;
        }

        upsert(
            &mut self.records,
            sender,
            PositionRecord {
                playback_state: payload.playback_state,
                track: track_ref.map(str::to_string),
                position: payload.position,
                playback_rate: payload.playback_rate,
                stamp: stamp.clone(),
                waiting_at: payload.wait_point,
            },
        );

        // Track data piggybacks on updates; absence is not a clear.
        if payload.track_data.is_some()
            && self
                .track
                .set_track_data(payload.track_data.clone(), stamp.clone())
        {
            self.emit(PlayerAction::TrackDataChanged {
                data: self.track.track_data().cloned(),
            });
        }

        self.recompute(now_ms, outcome);
    }

    fn handle_joined(&mut self, sender: &str, outcome: &mut IngestOutcome) {
        if sender == self.local_id {
            return;
        }
        debug!(peer = sender, "peer joined, sharing current state");
        outcome.broadcast_position = true;
        outcome.rebroadcast_track = self.track.metadata().is_some();
    }

    /// Re-derive the group view after the record map changed: wait-point
    /// holds and releases, majority play, and the drift check.
    fn recompute(&mut self, now_ms: u64, outcome: &mut IngestOutcome) {
        if self.is_suspended() {
            return;
        }

        if let Some(wp) = self.active_wait_point() {
            let mut total = 0usize;
            let mut reached = 0usize;
            let mut holding = 0usize;
            for (_, record) in self.sync_participants() {
                total += 1;
                let holds = record.waiting_at.map(|w| w.position) == Some(wp.position);
                if holds {
                    holding += 1;
                }
                if holds || record.projected_position(now_ms) >= wp.position {
                    reached += 1;
                }
            }

            let released = (total > 0 && reached == total)
                || wp
                    .max_clients
                    .map_or(false, |max| holding >= max as usize);

            if released {
                info!(position = wp.position, "wait point released");
                self.track.consume(wp.position);
                self.waiting_at = None;
                // Everyone held at the point resumes from it; their own
                // reports will confirm shortly.
                for (peer, record) in self.records.iter_mut() {
                    if record.waiting_at.map(|w| w.position) == Some(wp.position) {
                        record.playback_state = PlaybackState::Playing;
                        record.position = wp.position;
                        record.playback_rate = 1.0;
                        record.stamp = EventStamp::new(now_ms, peer.clone());
                        record.waiting_at = None;
                    }
                }
                self.records.insert(
                    self.local_id.clone(),
                    PositionRecord {
                        playback_state: PlaybackState::Playing,
                        track: self.current_track_identity(),
                        position: wp.position,
                        playback_rate: 1.0,
                        stamp: EventStamp::new(now_ms, self.local_id.clone()),
                        waiting_at: None,
                    },
                );
                self.emit(PlayerAction::Play {
                    position: wp.position,
                });
                outcome.resume_seek = self.pending_resume_seek.take();
            } else {
                // Group holds paused. If we have already passed the point,
                // fall back onto it and hold too.
                if self.waiting_at.is_none() {
                    let local_projection = self
                        .records
                        .get(&self.local_id)
                        .map(|r| r.projected_position(now_ms))
                        .unwrap_or(0.0);
                    if local_projection >= wp.position {
                        self.enter_waiting(wp, local_projection, now_ms);
                    }
                }
                return;
            }
        }

        if self.majority_playing() {
            let local_playing = self
                .records
                .get(&self.local_id)
                .map(|r| r.is_playing())
                .unwrap_or(false);
            if !local_playing && self.policy.can_play_pause {
                let target = self.group_position(now_ms);
                debug!(position = target, "majority playing, joining playback");
                self.emit(PlayerAction::Play { position: target });
            }
        }

        self.drift_check(now_ms);
    }

    fn drift_check(&mut self, now_ms: u64) {
        let Some(local) = self.records.get(&self.local_id) else {
            return;
        };
        if !local.is_playing() {
            return;
        }
        let local_projection = local.projected_position(now_ms);

        let peer_projections: Vec<f64> = self
            .on_track_records()
            .filter(|(id, r)| **id != self.local_id && r.is_playing())
            .map(|(_, r)| r.projected_position(now_ms))
            .collect();
        let Some(group_projection) = median(peer_projections) else {
            return;
        };

        if (local_projection - group_projection).abs() <= self.config.max_playback_drift_seconds {
            return;
        }

        let interval_ms = (self.config.position_update_interval_seconds * 1000.0) as u64;
        let debounced = self
            .last_catchup_ms
            .map_or(false, |last| now_ms.saturating_sub(last) < interval_ms);
        if debounced {
            return;
        }

        info!(
            local = local_projection,
            group = group_projection,
            "playback drift exceeds bound, catching up"
        );
        self.last_catchup_ms = Some(now_ms);
        self.emit(PlayerAction::Catchup {
            position: group_projection,
        });
    }

    fn enter_waiting(&mut self, wp: WaitPoint, local_projection: f64, now_ms: u64) {
        info!(position = wp.position, "holding at wait point");
        self.waiting_at = Some(wp);
        self.records.insert(
            self.local_id.clone(),
            PositionRecord {
                playback_state: PlaybackState::Waiting,
                track: self.current_track_identity(),
                position: wp.position,
                playback_rate: 1.0,
                stamp: EventStamp::new(now_ms, self.local_id.clone()),
                waiting_at: Some(wp),
            },
        );
        if local_projection > wp.position {
            self.emit(PlayerAction::SeekTo {
                position: wp.position,
            });
        }
        self.emit(PlayerAction::Pause {
            position: wp.position,
        });
    }

    /// The lowest-position unconsumed wait point somebody is holding at.
    fn active_wait_point(&self) -> Option<WaitPoint> {
        let mut candidate: Option<WaitPoint> = None;
        let locals = self.waiting_at.into_iter();
        let remotes = self.records.values().filter_map(|r| r.waiting_at);
        for wp in locals.chain(remotes) {
            if !self.track.is_pending_wait_point(wp.position) {
                continue;
            }
            if candidate.map_or(true, |c| wp.position < c.position) {
                candidate = Some(wp);
            }
        }
        candidate
    }

    fn majority_playing(&self) -> bool {
        let mut playing = 0usize;
        let mut total = 0usize;
        for (_, record) in self.sync_participants() {
            total += 1;
            if record.is_playing() {
                playing += 1;
            }
        }
        playing * 2 > total
    }

    fn on_track_records(&self) -> impl Iterator<Item = (&String, &PositionRecord)> {
        let identity = self.track.identity();
        self.records
            .iter()
            .filter(move |(_, r)| r.track.as_deref() == identity && identity.is_some())
    }

    /// Records that take part in group synchronization: on the current
    /// track and not detached by a suspension.
    fn sync_participants(&self) -> impl Iterator<Item = (&String, &PositionRecord)> {
        self.on_track_records()
            .filter(|(_, r)| r.playback_state != PlaybackState::Suspended)
    }

    /// Actions are suppressed for the whole of a suspension.
    fn emit(&self, action: PlayerAction) {
        if self.suspension_count == 0 {
            self.actions.emit_lossy(action);
        }
    }
}
