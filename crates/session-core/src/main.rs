//! Session Core demo
//!
//! Runs a two-party session over the in-process loopback transport and
//! serves the local participant's diagnostics.
//!
//! # Servers
//!
//! - HTTP server for health, diagnostics and metrics (default: 0.0.0.0:8085)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Spawn the local and remote session actors on a loopback network
//! 4. Start the diagnostics HTTP server
//! 5. Wait for shutdown signal, then leave the session

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use session_core::actors::{SessionActor, SessionDeps, SessionHandle};
use session_core::config::{Config, SessionSettings};
use session_core::identity::{IdentityResolver, ParticipantRef, StaticDirectory};
use session_core::metadata::SessionDocument;
use session_core::observability::{diagnostics_router, init_metrics_recorder, DiagnosticsState};
use session_core::transport::loopback::{LoopbackDocument, LoopbackNetwork, SyntheticMedia};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time allowed for both sessions to leave on shutdown.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "session_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Session Core demo");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        session_id = %config.session_id,
        dial_timeout_ms = config.dial_timeout_ms,
        max_candidates = config.max_candidates,
        sweep_interval_ms = config.sweep_interval_ms,
        diagnostics_bind_address = %config.diagnostics_bind_address,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder
    // This must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let shutdown_token = CancellationToken::new();
    let settings = config.session_settings();

    let alice = ParticipantRef::from_email("alice@example.com").with_name("Alice");
    let bob = ParticipantRef::from_email("bob@example.com").with_name("Bob");
    let document = SessionDocument::new(config.session_id.clone())
        .with_organizer(alice.clone())
        .with_invitee(bob.clone());

    let network = LoopbackNetwork::new();
    let shared = LoopbackDocument::new(document.clone());

    let local = spawn_participant(
        &settings,
        &network,
        &shared,
        alice,
        document.clone(),
        shutdown_token.child_token(),
    )
    .await;
    let remote = spawn_participant(
        &settings,
        &network,
        &shared,
        bob,
        document,
        shutdown_token.child_token(),
    )
    .await;

    for handle in [&local, &remote] {
        match handle.start().await {
            Ok(decision) => info!(
                local = %handle.local_key(),
                decision = ?decision,
                "Participant joined"
            ),
            Err(e) => warn!(local = %handle.local_key(), error = %e, "Participant failed to join"),
        }
    }

    // Start diagnostics HTTP server (MUST succeed - fail startup if it doesn't)
    let diagnostics_addr: SocketAddr = config.diagnostics_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.diagnostics_bind_address, "Invalid diagnostics bind address");
        format!("Invalid diagnostics bind address: {e}")
    })?;

    let diagnostics = diagnostics_router(Arc::new(DiagnosticsState::new(local.clone())));

    // Add /metrics endpoint served by Prometheus exporter
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );

    let app = diagnostics.merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(diagnostics_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %diagnostics_addr, "Failed to bind diagnostics server");
            format!("Failed to bind diagnostics server to {diagnostics_addr}: {e}")
        })?;
    info!(addr = %diagnostics_addr, "Diagnostics server bound successfully");

    let server_shutdown_token = shutdown_token.child_token();
    let server = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_shutdown_token.cancelled().await;
            info!("Diagnostics server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Diagnostics server failed");
        }
    });

    info!("Session Core running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, leaving session...");
    for handle in [&local, &remote] {
        match tokio::time::timeout(LEAVE_TIMEOUT, handle.leave()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(local = %handle.local_key(), error = %e, "Leave failed"),
            Err(_) => warn!(local = %handle.local_key(), "Leave timed out"),
        }
    }

    shutdown_token.cancel();
    if let Err(e) = server.await {
        warn!(error = %e, "Diagnostics server task failed");
    }

    info!("Session Core shutdown complete");
    Ok(())
}

/// Spawn one participant listening on its deterministic address.
async fn spawn_participant(
    settings: &SessionSettings,
    network: &LoopbackNetwork,
    shared: &LoopbackDocument,
    participant: ParticipantRef,
    document: SessionDocument,
    cancel_token: CancellationToken,
) -> SessionHandle {
    let directory = Arc::new(StaticDirectory::default());
    let resolver = IdentityResolver::new(
        directory.clone(),
        settings.address_prefix.clone(),
        settings.legacy_address_prefix.clone(),
    );
    let address = resolver.to_address(&resolver.resolve(&participant));
    let incoming = network.listen([address.clone()]).await;

    let deps = SessionDeps {
        transport: network.transport(address),
        devices: Arc::new(SyntheticMedia::new()),
        metadata: Arc::new(shared.clone()),
        directory,
        incoming,
    };
    let (handle, _task) =
        SessionActor::spawn(settings.clone(), participant, document, deps, cancel_token);
    shared.subscribe(handle.clone()).await;
    handle
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
