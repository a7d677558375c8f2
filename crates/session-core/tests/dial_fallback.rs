//! Integration tests for the dial ladder, reconnect sweeps and local media
//! handling against a scripted transport.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use session_core::actors::{NoticeKind, SessionHandle};
use session_core::config::SessionSettings;
use session_core::connection::ConnectionState;
use session_core::errors::{MediaError, SessionError};
use session_core::media::TrackKind;
use session_core::metadata::SessionDocument;
use session_test_utils::{
    alice, bob, default_address, key_of, spawn_session, wait_for_diagnostics, wait_for_state,
    DialScript, RecordingMetadata, ScriptedMedia, ScriptedTransport, TestSession, WAIT_TIMEOUT,
};
use std::sync::Arc;
use std::time::Duration;

const BOB_LEGACY: &str = "dt-legacy-bob";

fn two_party() -> SessionDocument {
    TestSession::new("s-dial")
        .organizer(alice())
        .invitee(bob())
        .build()
}

fn bob_address() -> String {
    default_address(&bob()).as_str().to_string()
}

/// Alice's session over the given transport and media.
fn spawn_alice(
    settings: SessionSettings,
    transport: &Arc<ScriptedTransport>,
    media: &Arc<ScriptedMedia>,
) -> SessionHandle {
    let (handle, _incoming) = spawn_session(
        settings,
        alice(),
        two_party(),
        transport.clone(),
        media.clone(),
        Arc::new(RecordingMetadata::new()),
    );
    handle
}

async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
}

// ============================================================================
// Candidate ladder
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_hanging_candidate_falls_back_to_legacy_address() {
    let transport = Arc::new(
        ScriptedTransport::builder()
            .hang(&bob_address())
            .answer(BOB_LEGACY)
            .build(),
    );
    let media = Arc::new(ScriptedMedia::default());
    let handle = spawn_alice(SessionSettings::default(), &transport, &media);

    let started = tokio::time::Instant::now();
    handle.start().await.unwrap();
    wait_for_state(&handle, WAIT_TIMEOUT, |state| state.connections.len() == 1)
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(2500));
    let dials: Vec<String> = transport
        .dials()
        .iter()
        .map(|address| address.as_str().to_string())
        .collect();
    assert_eq!(dials, vec![bob_address(), BOB_LEGACY.to_string()]);

    let stream = handle.stream_for(key_of("bob@example.com")).await.unwrap().unwrap();
    assert!(stream
        .tracks()
        .iter()
        .any(|track| track.label() == "dt-legacy-bob:camera"));
}

#[tokio::test(start_paused = true)]
async fn test_candidate_closing_before_media_is_skipped() {
    let transport = Arc::new(
        ScriptedTransport::builder()
            .close_before_media(&bob_address())
            .answer(BOB_LEGACY)
            .build(),
    );
    let media = Arc::new(ScriptedMedia::default());
    let handle = spawn_alice(SessionSettings::default(), &transport, &media);

    handle.start().await.unwrap();
    wait_for_state(&handle, WAIT_TIMEOUT, |state| state.connections.len() == 1)
        .await
        .unwrap();

    let connections = transport.connections();
    assert_eq!(connections.len(), 2);
    assert!(connections[0].is_closed());
    assert_eq!(transport.open_connections(BOB_LEGACY).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_peer_is_retried_on_next_sweep() {
    let transport = Arc::new(ScriptedTransport::default());
    let media = Arc::new(ScriptedMedia::default());
    let handle = spawn_alice(SessionSettings::default(), &transport, &media);
    let bob_key = key_of("bob@example.com");

    handle.start().await.unwrap();
    let expected = vec![bob_key.clone()];
    wait_for_diagnostics(&handle, WAIT_TIMEOUT, move |snapshot| {
        snapshot.retrying_keys == expected
    })
    .await
    .unwrap();

    let state = handle.get_state().await.unwrap();
    assert!(state.connections.is_empty());
    assert!(state.metrics.dials_exhausted >= 1);
    assert_eq!(transport.dial_count(&bob_address()), 1);
    assert_eq!(transport.dial_count(BOB_LEGACY), 1);

    // Bob comes online; the interval sweep finds him
    transport.script(&bob_address(), DialScript::Answer);
    wait_for_state(&handle, WAIT_TIMEOUT, |state| state.connections.len() == 1)
        .await
        .unwrap();

    let snapshot = handle.diagnostics().await.unwrap();
    assert!(snapshot.retrying_keys.is_empty());
    assert!(snapshot.missing_keys.is_empty());
    assert_eq!(snapshot.connected_count, 1);
    assert_eq!(
        snapshot.peer_states.get(&bob_key),
        Some(&ConnectionState::Connected)
    );
}

// ============================================================================
// Sweeps
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_sweep_skips_peer_with_dial_in_flight() {
    let transport = Arc::new(ScriptedTransport::builder().hang(&bob_address()).build());
    let media = Arc::new(ScriptedMedia::default());
    let mut settings = SessionSettings::default();
    settings.retry.per_candidate_timeout = Duration::from_secs(60);
    let handle = spawn_alice(settings, &transport, &media);
    let bob_key = key_of("bob@example.com");

    handle.start().await.unwrap();
    settle().await;

    let report = handle.run_sweep().await.unwrap();
    assert!(report.dialed.is_empty());
    assert!(report.closed.is_empty());
    assert_eq!(report.skipped_in_flight, vec![bob_key.clone()]);
    assert_eq!(transport.dial_count(&bob_address()), 1);

    let snapshot = handle.diagnostics().await.unwrap();
    assert_eq!(
        snapshot.peer_states.get(&bob_key),
        Some(&ConnectionState::Dialing)
    );
    assert_eq!(snapshot.dialing_keys, vec![bob_key]);
    assert!(snapshot.retrying_keys.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sweep_before_start_does_nothing() {
    let transport = Arc::new(ScriptedTransport::builder().answer(&bob_address()).build());
    let media = Arc::new(ScriptedMedia::default());
    let handle = spawn_alice(SessionSettings::default(), &transport, &media);

    let report = handle.run_sweep().await.unwrap();
    assert!(report.dialed.is_empty());
    assert!(transport.dials().is_empty());
    assert!(!handle.diagnostics().await.unwrap().peer_ready);
}

#[tokio::test(start_paused = true)]
async fn test_leave_during_dial_closes_late_connection() {
    let transport = Arc::new(ScriptedTransport::builder().silent(&bob_address()).build());
    let media = Arc::new(ScriptedMedia::default());
    let handle = spawn_alice(SessionSettings::default(), &transport, &media);

    handle.start().await.unwrap();
    settle().await;
    let connections = transport.connections();
    assert_eq!(connections.len(), 1);
    assert!(!connections[0].is_closed());

    handle.leave().await.unwrap();
    settle().await;

    assert!(connections[0].is_closed());
    let state = handle.get_state().await.unwrap();
    assert!(state.connections.is_empty());
    assert!(state.dialing.is_empty());
}

// ============================================================================
// Local media
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_switch_device_replaces_tracks_on_live_connections() {
    let transport = Arc::new(ScriptedTransport::builder().answer(&bob_address()).build());
    let media = Arc::new(ScriptedMedia::default());
    let handle = spawn_alice(SessionSettings::default(), &transport, &media);

    handle.start().await.unwrap();
    wait_for_state(&handle, WAIT_TIMEOUT, |state| state.connections.len() == 1)
        .await
        .unwrap();

    let replaced = handle
        .switch_device(Some("usb-camera".to_string()))
        .await
        .unwrap();
    assert_eq!(replaced, 1);
    assert_eq!(media.camera_captures(), 2);

    let connection = transport.open_connections(&bob_address()).remove(0);
    assert_eq!(
        connection.replaced_tracks(),
        vec![
            (TrackKind::Audio, Some("usb-camera:microphone:2".to_string())),
            (TrackKind::Video, Some("usb-camera:camera:2".to_string())),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_switch_to_unlisted_device_keeps_current_tracks() {
    let transport = Arc::new(ScriptedTransport::builder().answer(&bob_address()).build());
    let media = Arc::new(ScriptedMedia::default());
    let handle = spawn_alice(SessionSettings::default(), &transport, &media);

    handle.start().await.unwrap();
    wait_for_state(&handle, WAIT_TIMEOUT, |state| state.connections.len() == 1)
        .await
        .unwrap();

    let result = handle.switch_device(Some("missing-camera".to_string())).await;
    assert!(matches!(
        result,
        Err(SessionError::MediaUnavailable(MediaError::NoDevice))
    ));
    assert_eq!(media.camera_captures(), 1);

    let connection = transport.open_connections(&bob_address()).remove(0);
    assert!(connection.replaced_tracks().is_empty());
    assert!(handle
        .notices()
        .await
        .unwrap()
        .iter()
        .any(|notice| notice.kind == NoticeKind::MediaUnavailable));
}

#[tokio::test(start_paused = true)]
async fn test_refused_track_replacement_redials_peer() {
    let transport = Arc::new(ScriptedTransport::builder().answer(&bob_address()).build());
    let media = Arc::new(ScriptedMedia::default());
    let handle = spawn_alice(SessionSettings::default(), &transport, &media);

    handle.start().await.unwrap();
    wait_for_state(&handle, WAIT_TIMEOUT, |state| state.connections.len() == 1)
        .await
        .unwrap();

    let connection = transport.open_connections(&bob_address()).remove(0);
    connection.refuse_tracks();
    assert_eq!(handle.switch_device(None).await.unwrap(), 0);
    assert!(connection.is_closed());

    wait_for_state(&handle, WAIT_TIMEOUT, |state| {
        state.connections.len() == 1 && state.metrics.dials_connected >= 2
    })
    .await
    .unwrap();
    assert!(transport.dial_count(&bob_address()) >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_denied_camera_raises_notice_and_still_connects() {
    let transport = Arc::new(ScriptedTransport::builder().answer(&bob_address()).build());
    let media = Arc::new(
        ScriptedMedia::builder()
            .deny_camera(MediaError::PermissionDenied)
            .build(),
    );
    let handle = spawn_alice(SessionSettings::default(), &transport, &media);

    assert!(handle.start().await.is_ok());

    let notices = handle.notices().await.unwrap();
    assert!(notices
        .iter()
        .any(|notice| notice.kind == NoticeKind::MediaUnavailable));

    wait_for_state(&handle, WAIT_TIMEOUT, |state| state.connections.len() == 1)
        .await
        .unwrap();
    let snapshot = handle.diagnostics().await.unwrap();
    assert_eq!(snapshot.local_audio_track_count, 0);
    assert_eq!(snapshot.local_video_track_count, 0);

    // A failed switch reports the error and keeps the session going
    assert!(handle.switch_device(None).await.is_err());
    assert!(handle.get_state().await.unwrap().active);
}

#[tokio::test(start_paused = true)]
async fn test_blocked_playback_resumes_after_user_interaction() {
    let transport = Arc::new(ScriptedTransport::builder().answer(&bob_address()).build());
    let media = Arc::new(ScriptedMedia::builder().block_autoplay().build());
    let handle = spawn_alice(SessionSettings::default(), &transport, &media);

    handle.start().await.unwrap();
    wait_for_diagnostics(&handle, WAIT_TIMEOUT, |snapshot| {
        snapshot.audio_playback_blocked
    })
    .await
    .unwrap();
    let notices = handle.notices().await.unwrap();
    assert_eq!(
        notices
            .iter()
            .filter(|notice| notice.kind == NoticeKind::AudioBlocked)
            .count(),
        1
    );

    // A gesture while the platform still refuses changes nothing
    assert!(!handle.user_interaction().await.unwrap());
    assert_eq!(media.plays(), 0);

    media.set_autoplay_blocked(false);
    assert!(handle.user_interaction().await.unwrap());
    assert!(media.plays() >= 1);
    assert!(!handle.diagnostics().await.unwrap().audio_playback_blocked);
    assert!(handle
        .notices()
        .await
        .unwrap()
        .iter()
        .all(|notice| notice.kind != NoticeKind::AudioBlocked));
}
