//! Integration tests for multi-party session lifecycle over the loopback
//! transport: joining, admission, removal and leaving.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use session_core::errors::SessionError;
use session_core::meeting_control::{ControlOutcome, JoinDecision};
use session_core::router::TileSource;
use session_test_utils::{
    alice, bob, carol, wait_for_diagnostics, wait_for_state, SessionHarness, TestSession,
    WAIT_TIMEOUT,
};

/// Loopback ends share an id up to their `-out`/`-in` suffix.
fn link_id(connection_id: &str) -> String {
    connection_id
        .trim_end_matches("-out")
        .trim_end_matches("-in")
        .to_string()
}

// ============================================================================
// Connecting
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_two_parties_connect_and_exchange_media() {
    let mut harness =
        SessionHarness::new(TestSession::new("s-two").organizer(alice()).invitee(bob()).build());
    let a = harness.join(alice()).await.unwrap();
    let b = harness.join(bob()).await.unwrap();

    harness.wait_fully_connected().await.unwrap();

    let stream = a.handle.stream_for(b.key().clone()).await.unwrap();
    let stream = stream.expect("alice should have bob's stream");
    assert!(stream
        .tracks()
        .iter()
        .any(|track| track.label() == "default:camera"));

    let a_state = a.handle.get_state().await.unwrap();
    assert_eq!(a_state.connections.len(), 1);

    // Both ends settle on the same physical connection
    let pair_id = link_id(&a_state.connections[0].connection_id);
    wait_for_state(&b.handle, WAIT_TIMEOUT, |state| {
        state.connections.len() == 1 && link_id(&state.connections[0].connection_id) == pair_id
    })
    .await
    .unwrap();

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_render_tiles_cover_every_member() {
    let mut harness =
        SessionHarness::new(TestSession::new("s-tiles").organizer(alice()).invitee(bob()).build());
    let a = harness.join(alice()).await.unwrap();
    let b = harness.join(bob()).await.unwrap();
    harness.wait_fully_connected().await.unwrap();

    let tiles = a.handle.render_tiles().await.unwrap();
    assert_eq!(tiles.len(), 2);

    let local = tiles.iter().find(|tile| tile.is_local).unwrap();
    assert_eq!(&local.key, a.key());
    assert_eq!(local.source, TileSource::Camera);

    let remote = tiles.iter().find(|tile| !tile.is_local).unwrap();
    assert_eq!(&remote.key, b.key());
    assert_eq!(remote.source, TileSource::Remote);
    assert!(remote.stream.is_some());

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_connects_to_everyone() {
    let mut harness = SessionHarness::new(
        TestSession::new("s-late")
            .organizer(alice())
            .invitee(bob())
            .participant(carol())
            .build(),
    );
    harness.join(alice()).await.unwrap();
    harness.join(bob()).await.unwrap();
    harness.settle().await;

    let c = harness.join(carol()).await.unwrap();
    harness.wait_fully_connected().await.unwrap();

    let snapshot = c.handle.diagnostics().await.unwrap();
    assert_eq!(snapshot.expected_count, 2);
    assert_eq!(snapshot.connected_count, 2);
    assert!(snapshot.retrying_keys.is_empty());

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_invite_adds_participant_for_everyone() {
    let mut harness =
        SessionHarness::new(TestSession::new("s-invite").organizer(alice()).invitee(bob()).build());
    let a = harness.join(alice()).await.unwrap();
    let b = harness.join(bob()).await.unwrap();

    let carol_key = a.handle.invite(carol()).await.unwrap();
    assert_eq!(carol_key.as_str(), "email:carol@example.com");

    wait_for_state(&b.handle, WAIT_TIMEOUT, |state| {
        state.members.contains(&carol_key)
    })
    .await
    .unwrap();

    let c = harness.join(carol()).await.unwrap();
    assert_eq!(c.key(), &carol_key);
    harness.wait_fully_connected().await.unwrap();

    harness.shutdown().await;
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_lobby_holds_joiner_until_admitted() {
    let mut harness =
        SessionHarness::new(TestSession::new("s-lobby").organizer(alice()).with_lobby().build());
    let a = harness.join(alice()).await.unwrap();

    let (c, decision) = harness.try_join(carol()).await.unwrap();
    assert_eq!(decision, JoinDecision::Waiting);

    let state = wait_for_state(&a.handle, WAIT_TIMEOUT, |state| {
        state.control.waiting_room.contains(c.key())
    })
    .await
    .unwrap();
    assert!(!state.members.contains(c.key()));
    assert!(state.connections.is_empty(), "waiting joiner must not be dialed");

    // Only the host may admit
    assert_eq!(c.handle.admit_all().await.unwrap(), ControlOutcome::Ignored);

    assert_eq!(a.handle.admit_all().await.unwrap(), ControlOutcome::Applied);
    assert_eq!(a.handle.admit_all().await.unwrap(), ControlOutcome::Unchanged);

    harness.wait_fully_connected().await.unwrap();
    let state = c.handle.get_state().await.unwrap();
    assert!(state.members.contains(c.key()));
    assert!(state.control.waiting_room.is_empty());

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lobby_rejoin_after_leave_waits_for_admission() {
    let mut harness = SessionHarness::new(
        TestSession::new("s-rejoin")
            .organizer(alice())
            .participant(carol())
            .build(),
    );
    let a = harness.join(alice()).await.unwrap();
    let c = harness.join(carol()).await.unwrap();
    harness.wait_fully_connected().await.unwrap();

    c.handle.leave().await.unwrap();
    wait_for_state(&a.handle, WAIT_TIMEOUT, |state| {
        !state.members.contains(c.key()) && state.connections.is_empty()
    })
    .await
    .unwrap();
    assert_eq!(a.handle.toggle_lobby().await.unwrap(), ControlOutcome::Applied);
    harness.settle().await;

    let (c, decision) = harness.try_join(carol()).await.unwrap();
    assert_eq!(decision, JoinDecision::Waiting);
    let state = c.handle.get_state().await.unwrap();
    assert!(state.control.waiting_room.contains(c.key()));

    wait_for_state(&a.handle, WAIT_TIMEOUT, |state| {
        state.control.waiting_room.contains(c.key())
    })
    .await
    .unwrap();
    assert_eq!(
        a.handle.admit(c.key().clone()).await.unwrap(),
        ControlOutcome::Applied
    );

    harness.wait_fully_connected().await.unwrap();
    let state = a.handle.get_state().await.unwrap();
    assert!(state.members.contains(c.key()));
    assert!(state.control.waiting_room.is_empty());

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_locked_meeting_refuses_new_joiner() {
    let mut harness =
        SessionHarness::new(TestSession::new("s-lock").organizer(alice()).invitee(bob()).build());
    let a = harness.join(alice()).await.unwrap();
    assert_eq!(a.handle.toggle_lock().await.unwrap(), ControlOutcome::Applied);
    harness.settle().await;

    // Existing members still get in
    harness.join(bob()).await.unwrap();

    let (c, decision) = harness.try_join(carol()).await.unwrap();
    assert_eq!(decision, JoinDecision::Refused);

    let notices = c.handle.notices().await.unwrap();
    assert_eq!(notices.len(), 1);
    assert!(c.handle.dismiss_notice(notices[0].id).await.unwrap());
    assert!(c.handle.notices().await.unwrap().is_empty());

    let snapshot = c.handle.diagnostics().await.unwrap();
    assert!(!snapshot.peer_ready);
    assert_eq!(snapshot.expected_count, 0);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_non_host_cannot_toggle_controls() {
    let mut harness =
        SessionHarness::new(TestSession::new("s-ctl").organizer(alice()).invitee(bob()).build());
    harness.join(alice()).await.unwrap();
    let b = harness.join(bob()).await.unwrap();

    assert_eq!(b.handle.toggle_lobby().await.unwrap(), ControlOutcome::Ignored);
    assert_eq!(b.handle.toggle_lock().await.unwrap(), ControlOutcome::Ignored);

    let state = b.handle.get_state().await.unwrap();
    assert!(!state.control.lobby_enabled);
    assert!(!state.control.meeting_locked);

    harness.shutdown().await;
}

// ============================================================================
// Removal and leaving
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_host_removal_disconnects_participant() {
    let mut harness = SessionHarness::new(
        TestSession::new("s-remove")
            .organizer(alice())
            .invitee(bob())
            .participant(carol())
            .build(),
    );
    let a = harness.join(alice()).await.unwrap();
    let b = harness.join(bob()).await.unwrap();
    let c = harness.join(carol()).await.unwrap();
    harness.wait_fully_connected().await.unwrap();

    assert_eq!(b.handle.remove_participant(c.key().clone()).await.unwrap(), ControlOutcome::Ignored);
    assert_eq!(
        a.handle.remove_participant(c.key().clone()).await.unwrap(),
        ControlOutcome::Applied
    );

    for handle in [&a.handle, &b.handle] {
        let carol_key = c.key().clone();
        wait_for_state(handle, WAIT_TIMEOUT, move |state| {
            !state.members.contains(&carol_key)
                && state.connections.iter().all(|conn| conn.key != carol_key)
        })
        .await
        .unwrap();
    }

    // The removed participant expects nobody
    let snapshot = wait_for_diagnostics(&c.handle, WAIT_TIMEOUT, |snapshot| {
        snapshot.expected_count == 0 && snapshot.connected_count == 0
    })
    .await
    .unwrap();
    assert!(!snapshot.peer_ready);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_leave_closes_connections_and_ends_session() {
    let mut harness =
        SessionHarness::new(TestSession::new("s-leave").organizer(alice()).invitee(bob()).build());
    let a = harness.join(alice()).await.unwrap();
    let b = harness.join(bob()).await.unwrap();
    harness.wait_fully_connected().await.unwrap();

    b.handle.leave().await.unwrap();

    let state = b.handle.get_state().await.unwrap();
    assert!(!state.active);
    assert!(state.connections.is_empty());
    let snapshot = b.handle.diagnostics().await.unwrap();
    assert_eq!(snapshot.local_audio_track_count, 0);
    assert_eq!(snapshot.local_video_track_count, 0);

    let bob_key = b.key().clone();
    wait_for_state(&a.handle, WAIT_TIMEOUT, move |state| {
        state.connections.is_empty() && !state.members.contains(&bob_key)
    })
    .await
    .unwrap();

    // Mutations after leave are refused, queries still answer
    assert!(matches!(
        b.handle.set_muted(true).await,
        Err(SessionError::SessionEnded)
    ));
    assert!(matches!(
        b.handle.start().await,
        Err(SessionError::SessionEnded)
    ));
    assert!(b.handle.notices().await.is_ok());

    // Leaving twice is harmless
    b.handle.leave().await.unwrap();

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_session_rejects_requests() {
    let mut harness =
        SessionHarness::new(TestSession::new("s-cancel").organizer(alice()).build());
    let a = harness.join(alice()).await.unwrap();

    a.handle.cancel();
    harness.settle().await;

    assert!(a.handle.is_cancelled());
    assert!(matches!(
        a.handle.get_state().await,
        Err(SessionError::SessionEnded)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_mute_applies_before_and_after_connect() {
    let mut harness =
        SessionHarness::new(TestSession::new("s-mute").organizer(alice()).invitee(bob()).build());
    let a = harness.join(alice()).await.unwrap();
    a.handle.set_muted(true).await.unwrap();
    assert!(a.handle.get_state().await.unwrap().muted);

    harness.join(bob()).await.unwrap();
    harness.wait_fully_connected().await.unwrap();
    assert!(a.handle.get_state().await.unwrap().muted);

    a.handle.set_muted(false).await.unwrap();
    assert!(!a.handle.get_state().await.unwrap().muted);

    harness.shutdown().await;
}
