//! End-to-end coordinator scenarios over the in-process hub
//!
//! Each test wires real coordinators onto one loopback transport, scripts
//! the media elements, and observes the action streams. The reference clock
//! is advanced manually so timestamps are deterministic.

mod helpers;

use std::sync::Arc;

use playsync_common::events::{SessionEvent, TransportCommand};
use playsync_common::roles::EveryoneAllowed;
use playsync_common::{
    CoordinatorConfig, Error, EventEnvelope, PlaybackState, PlayerAction, TrackMetadata, WaitPoint,
};
use playsync_session::{InProcessHub, MessageTransport};

use helpers::{settle, spawn_peer, test_config, wait_for_action, StaticRoles, TestClock};

fn is_play_at(action: &PlayerAction, position: f64) -> bool {
    matches!(action, PlayerAction::Play { position: p } if (*p - position).abs() < 0.01)
}

#[tokio::test]
async fn two_peer_play() -> anyhow::Result<()> {
    let clock = TestClock::at(1_000);
    let hub = InProcessHub::new(256);
    let roles = Arc::new(EveryoneAllowed);

    let mut a = spawn_peer(&hub, "peer-a", &clock, roles.clone(), test_config(30.0)).await?;
    a.player.load("track-t");
    a.session
        .set_track(Some(TrackMetadata::new("track-t")), vec![])
        .await?;
    settle().await;
    a.drain_actions();

    // A late joiner learns the track and holds paused at the start.
    clock.set(2_000);
    let mut b = spawn_peer(&hub, "peer-b", &clock, roles.clone(), test_config(30.0)).await?;
    wait_for_action(&mut b, "load of track-t", |action| {
        matches!(
            action,
            PlayerAction::LoadTrack { metadata: Some(m) } if m.track_identity == "track-t"
        )
    })
    .await;
    wait_for_action(&mut b, "pause at start", |action| {
        matches!(action, PlayerAction::Pause { position } if *position == 0.0)
    })
    .await;
    assert_eq!(b.session.group_playback_state(), PlaybackState::Paused);

    // A presses play; B follows from the same position.
    clock.set(3_000);
    a.session.play().await?;
    wait_for_action(&mut b, "play at 0", |action| is_play_at(action, 0.0)).await;
    wait_for_action(&mut a, "play at 0", |action| is_play_at(action, 0.0)).await;
    Ok(())
}

#[tokio::test]
async fn seek_race_converges_on_the_smaller_sender() -> anyhow::Result<()> {
    let clock = TestClock::at(1_000);
    let hub = InProcessHub::new(256);
    let roles = Arc::new(EveryoneAllowed);

    let mut alpha = spawn_peer(&hub, "alpha", &clock, roles.clone(), test_config(30.0)).await?;
    let mut beta = spawn_peer(&hub, "beta", &clock, roles.clone(), test_config(30.0)).await?;

    alpha
        .session
        .set_track(Some(TrackMetadata::new("track-t")), vec![])
        .await?;
    settle().await;
    alpha.drain_actions();
    beta.drain_actions();

    // Both seek in the same reference millisecond; "alpha" sorts smaller
    // and wins the tie on every peer.
    clock.set(5_000);
    alpha.session.seek_to(30.0).await?;
    beta.session.seek_to(10.0).await?;
    settle().await;

    for (name, peer) in [("alpha", &mut alpha), ("beta", &mut beta)] {
        let actions = peer.drain_actions();
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, PlayerAction::SeekTo { position } if *position == 30.0)),
            "{name} missed the winning seek: {actions:?}"
        );
        let last_seek = actions
            .iter()
            .rev()
            .find(|a| matches!(a, PlayerAction::SeekTo { .. }));
        assert!(
            matches!(last_seek, Some(PlayerAction::SeekTo { position }) if *position == 30.0),
            "{name} ended on the losing seek: {actions:?}"
        );
        let records = peer.session.peer_records();
        assert_eq!(records[name].position, 30.0, "{name} record diverged");
    }
    Ok(())
}

#[tokio::test]
async fn drift_beyond_bound_triggers_catchup() -> anyhow::Result<()> {
    let clock = TestClock::at(1_000);
    let hub = InProcessHub::new(256);
    let roles = Arc::new(EveryoneAllowed);

    let mut a = spawn_peer(&hub, "peer-a", &clock, roles.clone(), test_config(0.1)).await?;
    let mut b = spawn_peer(&hub, "peer-b", &clock, roles.clone(), test_config(0.1)).await?;

    a.session
        .set_track(Some(TrackMetadata::new("track-t")), vec![])
        .await?;
    settle().await;

    // The group starts playing from 0 at t=10s.
    clock.set(10_000);
    a.player.playing_at(0.0, 10_000);
    b.player.playing_at(0.0, 10_000);
    b.session.play().await?;
    settle().await;
    a.drain_actions();
    b.drain_actions();

    // Three seconds later the local player is still stuck at 0 while the
    // remote reports 3.0: well past the 1s drift bound.
    clock.set(13_000);
    a.player.playing_at(0.0, 13_000);
    b.player.playing_at(3.0, 13_000);
    let action = wait_for_action(&mut a, "catchup near 3.0", |action| {
        matches!(action, PlayerAction::Catchup { .. })
    })
    .await;
    match action {
        PlayerAction::Catchup { position } => {
            assert!((position - 3.0).abs() < 0.5, "catchup target {position}");
        }
        other => panic!("unexpected action {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn wait_point_holds_until_enough_peers_arrive() -> anyhow::Result<()> {
    let clock = TestClock::at(1_000);
    let hub = InProcessHub::new(256);
    let roles = Arc::new(EveryoneAllowed);

    let mut a = spawn_peer(&hub, "peer-a", &clock, roles.clone(), test_config(0.1)).await?;
    let mut b = spawn_peer(&hub, "peer-b", &clock, roles.clone(), test_config(0.1)).await?;

    a.session
        .set_track(
            Some(TrackMetadata::new("track-t")),
            vec![WaitPoint {
                position: 10.0,
                max_clients: Some(2),
            }],
        )
        .await?;
    settle().await;

    clock.set(15_000);
    a.player.playing_at(5.0, 15_000);
    b.player.playing_at(5.0, 15_000);
    a.session.play().await?;
    settle().await;
    a.drain_actions();
    b.drain_actions();

    // A reaches the wait point first and holds there.
    clock.set(20_000);
    a.player.playing_at(10.0, 20_000);
    b.player.playing_at(5.0, 20_000);
    wait_for_action(&mut a, "hold at the wait point", |action| {
        matches!(action, PlayerAction::Pause { position } if *position == 10.0)
    })
    .await;
    settle().await;
    assert_eq!(a.session.group_playback_state(), PlaybackState::Paused);
    assert_eq!(b.session.group_playback_state(), PlaybackState::Paused);
    let premature = b.drain_actions();
    assert!(
        !premature.iter().any(|x| matches!(x, PlayerAction::Play { .. })),
        "play emitted while the wait was pending: {premature:?}"
    );

    // B arrives; with max_clients = 2 the hold releases for everyone.
    clock.set(20_600);
    b.player.playing_at(10.0, 20_600);
    wait_for_action(&mut a, "release play", |action| is_play_at(action, 10.0)).await;
    wait_for_action(&mut b, "release play", |action| is_play_at(action, 10.0)).await;
    Ok(())
}

#[tokio::test]
async fn late_joiner_learns_dynamic_wait_point() -> anyhow::Result<()> {
    let clock = TestClock::at(1_000);
    let hub = InProcessHub::new(256);
    let roles = Arc::new(EveryoneAllowed);

    let mut a = spawn_peer(&hub, "peer-a", &clock, roles.clone(), test_config(0.1)).await?;
    let mut b = spawn_peer(&hub, "peer-b", &clock, roles.clone(), test_config(0.1)).await?;

    a.session
        .set_track(Some(TrackMetadata::new("track-t")), vec![])
        .await?;
    settle().await;

    // A detaches for an ad break and asks the group to hold at 12s.
    clock.set(2_000);
    let suspension = a.session.begin_suspension(Some(WaitPoint::at(12.0))).await?;
    settle().await;
    a.drain_actions();
    b.drain_actions();

    // A peer that joins after the announcement still learns the hold.
    clock.set(3_000);
    let mut c = spawn_peer(&hub, "peer-c", &clock, roles.clone(), test_config(0.1)).await?;
    wait_for_action(&mut c, "load of track-t", |action| {
        matches!(
            action,
            PlayerAction::LoadTrack { metadata: Some(m) } if m.track_identity == "track-t"
        )
    })
    .await;

    // When the newcomer's player runs past the point, it holds there.
    clock.set(4_000);
    c.player.playing_at(12.5, 4_000);
    wait_for_action(&mut c, "seek back to the hold", |action| {
        matches!(action, PlayerAction::SeekTo { position } if *position == 12.0)
    })
    .await;
    wait_for_action(&mut c, "hold at the dynamic wait point", |action| {
        matches!(action, PlayerAction::Pause { position } if *position == 12.0)
    })
    .await;

    suspension.end(None).await?;
    Ok(())
}

#[tokio::test]
async fn suspension_detaches_until_ended() -> anyhow::Result<()> {
    let clock = TestClock::at(1_000);
    let hub = InProcessHub::new(256);
    let roles = Arc::new(EveryoneAllowed);

    let mut a = spawn_peer(&hub, "peer-a", &clock, roles.clone(), test_config(0.2)).await?;
    let mut b = spawn_peer(&hub, "peer-b", &clock, roles.clone(), test_config(0.2)).await?;

    a.session
        .set_track(Some(TrackMetadata::new("track-t")), vec![])
        .await?;
    settle().await;

    clock.set(15_000);
    a.player.playing_at(15.0, 15_000);
    b.player.playing_at(15.0, 15_000);
    a.session.play().await?;
    settle().await;
    a.drain_actions();
    b.drain_actions();

    // While suspended, group commands no longer reach A's player.
    let suspension = a.session.begin_suspension(None).await?;
    assert!(a.session.is_suspended());

    clock.set(16_000);
    b.session.seek_to(18.0).await?;
    wait_for_action(&mut b, "seek to 18", |action| {
        matches!(action, PlayerAction::SeekTo { position } if *position == 18.0)
    })
    .await;
    settle().await;
    assert!(
        a.drain_actions().is_empty(),
        "suspended player received actions"
    );

    // Ending the suspension reconciles in one action, then runs the
    // requested resume seek as a group command.
    clock.set(17_000);
    suspension.end(Some(20.0)).await?;
    assert!(!a.session.is_suspended());
    let action = wait_for_action(&mut a, "sync-local", |action| {
        matches!(action, PlayerAction::SyncLocal { .. })
    })
    .await;
    match action {
        PlayerAction::SyncLocal { metadata, play, .. } => {
            assert_eq!(
                metadata.map(|m| m.track_identity),
                Some("track-t".to_string())
            );
            assert!(play, "group kept playing while A was away");
        }
        other => panic!("unexpected action {other:?}"),
    }
    wait_for_action(&mut a, "resume seek", |action| {
        matches!(action, PlayerAction::SeekTo { position } if *position == 20.0)
    })
    .await;
    wait_for_action(&mut b, "resume seek", |action| {
        matches!(action, PlayerAction::SeekTo { position } if *position == 20.0)
    })
    .await;
    Ok(())
}

#[tokio::test]
async fn role_gate_blocks_unprivileged_transport() -> anyhow::Result<()> {
    let clock = TestClock::at(1_000);
    let hub = InProcessHub::new(256);
    let roles = StaticRoles::new(&[("presenter-1", "presenter"), ("guest-1", "guest")]);
    let config = CoordinatorConfig {
        allowed_transport_roles: ["presenter".to_string()].into_iter().collect(),
        ..test_config(30.0)
    };

    let mut presenter =
        spawn_peer(&hub, "presenter-1", &clock, roles.clone(), config.clone()).await?;
    let mut guest = spawn_peer(&hub, "guest-1", &clock, roles.clone(), config.clone()).await?;

    presenter
        .session
        .set_track(Some(TrackMetadata::new("track-t")), vec![])
        .await?;
    settle().await;
    presenter.drain_actions();
    guest.drain_actions();

    // Outbound: the guest's own send is refused before it reaches the wire.
    let result = guest.session.play().await;
    assert!(matches!(result, Err(Error::RoleDenied(_))));

    // Inbound: a play event injected straight onto the transport by an
    // unprivileged sender is dropped without an action or a record.
    let rogue = hub.connect("guest-1");
    rogue
        .send(EventEnvelope {
            client_id: "guest-1".to_string(),
            timestamp: 6_000,
            correlation_id: "rogue-1".to_string(),
            track_ref: Some("track-t".to_string()),
            event: SessionEvent::Play(TransportCommand {
                track: TrackMetadata::new("track-t"),
                position: 0.0,
            }),
        })
        .await?;
    settle().await;

    assert!(
        presenter.drain_actions().is_empty(),
        "a guest command produced actions"
    );
    assert!(
        !presenter.session.peer_records().contains_key("guest-1"),
        "a guest command created a record"
    );
    assert!(presenter.session.stats().dropped_role_denied >= 1);
    assert_eq!(
        presenter.session.group_playback_state(),
        PlaybackState::Paused
    );
    Ok(())
}
