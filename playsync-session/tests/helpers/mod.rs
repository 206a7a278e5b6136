//! Shared harness for the coordinator integration tests
//!
//! A scriptable media element, a manually advanced reference clock, a
//! static role provider, and a `Peer` bundle that wires one coordinator
//! onto the in-process hub.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use playsync_common::roles::RoleProvider;
use playsync_common::{
    CoordinatorConfig, PlaybackPolicy, PlaybackState, PlayerAction, PlayerState, PositionState,
    ReferenceClock, Result, TrackMetadata,
};
use playsync_session::{InProcessHub, MediaPlayer, SessionCoordinator};

/// Manually advanced reference clock shared by every peer in a test.
pub struct TestClock {
    ms: AtomicU64,
}

impl TestClock {
    pub fn at(start_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            ms: AtomicU64::new(start_ms),
        })
    }

    pub fn set(&self, ms: u64) {
        self.ms.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl ReferenceClock for TestClock {
    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::SeqCst)
    }
}

/// Scriptable media element; tests set what it reports.
pub struct ScriptedPlayer {
    state: Mutex<PlayerState>,
}

impl ScriptedPlayer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PlayerState::default()),
        })
    }

    /// Track loaded, paused at the start.
    pub fn load(&self, identity: &str) {
        let mut state = self.state.lock().unwrap();
        state.metadata = Some(TrackMetadata::new(identity));
        state.playback_state = PlaybackState::Paused;
        state.position = Some(PositionState {
            position: 0.0,
            playback_rate: 1.0,
            timestamp: 0,
        });
    }

    pub fn playing_at(&self, position: f64, sampled_ms: u64) {
        let mut state = self.state.lock().unwrap();
        state.playback_state = PlaybackState::Playing;
        state.position = Some(PositionState {
            position,
            playback_rate: 1.0,
            timestamp: sampled_ms,
        });
    }

    pub fn paused_at(&self, position: f64, sampled_ms: u64) {
        let mut state = self.state.lock().unwrap();
        state.playback_state = PlaybackState::Paused;
        state.position = Some(PositionState {
            position,
            playback_rate: 1.0,
            timestamp: sampled_ms,
        });
    }
}

impl MediaPlayer for ScriptedPlayer {
    fn state(&self) -> PlayerState {
        self.state.lock().unwrap().clone()
    }
}

/// Role provider backed by a static map; unknown ids hold no roles.
pub struct StaticRoles {
    map: HashMap<String, Vec<String>>,
}

impl StaticRoles {
    pub fn new(pairs: &[(&str, &str)]) -> Arc<Self> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for (client, role) in pairs {
            map.entry(client.to_string())
                .or_default()
                .push(role.to_string());
        }
        Arc::new(Self { map })
    }
}

#[async_trait]
impl RoleProvider for StaticRoles {
    async fn roles_of(&self, client_id: &str) -> Result<Vec<String>> {
        Ok(self.map.get(client_id).cloned().unwrap_or_default())
    }
}

/// One participant: coordinator, scripted player, and its action stream.
pub struct Peer {
    pub session: SessionCoordinator,
    pub player: Arc<ScriptedPlayer>,
    pub actions: broadcast::Receiver<PlayerAction>,
}

impl Peer {
    /// Everything the coordinator has emitted since the last drain.
    pub fn drain_actions(&mut self) -> Vec<PlayerAction> {
        let mut actions = Vec::new();
        loop {
            match self.actions.try_recv() {
                Ok(action) => actions.push(action),
                Err(TryRecvError::Empty) => break,
                Err(e) => panic!("action stream broken: {e}"),
            }
        }
        actions
    }
}

/// Config with a ticker fast enough for tests that rely on it, and slow
/// enough not to flood the ones that do not.
pub fn test_config(position_update_interval_seconds: f64) -> CoordinatorConfig {
    CoordinatorConfig {
        position_update_interval_seconds,
        ..Default::default()
    }
}

/// Route coordinator logs into the test output when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Connect one coordinator to the hub and initialize it.
pub async fn spawn_peer(
    hub: &Arc<InProcessHub>,
    client_id: &str,
    clock: &Arc<TestClock>,
    roles: Arc<dyn RoleProvider>,
    config: CoordinatorConfig,
) -> anyhow::Result<Peer> {
    init_tracing();
    let player = ScriptedPlayer::new();
    let session = SessionCoordinator::new(
        player.clone(),
        hub.connect(client_id),
        clock.clone(),
        roles,
        config,
        PlaybackPolicy::default(),
    )
    .with_context(|| format!("building coordinator for {client_id}"))?;
    let actions = session.subscribe_actions();
    session
        .initialize()
        .await
        .with_context(|| format!("initializing {client_id}"))?;
    Ok(Peer {
        session,
        player,
        actions,
    })
}

/// Let the dispatch tasks and tickers run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

/// Wait until the peer emits an action matching `pred`, panicking after a
/// generous timeout. Non-matching actions are discarded.
pub async fn wait_for_action<F>(peer: &mut Peer, what: &str, mut pred: F) -> PlayerAction
where
    F: FnMut(&PlayerAction) -> bool,
{
    let deadline = Duration::from_secs(5);
    let fut = async {
        loop {
            match peer.actions.recv().await {
                Ok(action) if pred(&action) => return action,
                Ok(_) => continue,
                Err(e) => panic!("action stream broken while waiting for {what}: {e}"),
            }
        }
    };
    tokio::time::timeout(deadline, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}
