//! Metrics definitions for the session core.
//!
//! All metrics follow Prometheus naming conventions:
//! - `session_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by enums in code. Identity keys, addresses and
//! session ids are never used as labels.
//! - `outcome` (dial): connected, exhausted, cancelled, rejected
//! - `trigger`: interval, on_demand, membership_change
//! - `outcome` (screen share): granted, owned_by_other, in_flight, cooling_down, capture_failed
//! - `action`: toggle_lobby, toggle_lock, admit, admit_all, remove
//! - `kind` (media): bounded by `MediaError::kind`

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Dial duration spans several candidate timeouts
        .set_buckets_for_metric(
            Matcher::Prefix("session_dial".to_string()),
            &[
                0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 7.500, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set dial duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Record one pass over the dial ladder.
///
/// Metric: `session_dial_attempts_total`, `session_dial_duration_seconds`
/// Labels: `outcome`
pub fn record_dial(outcome: &str, duration: Duration) {
    counter!("session_dial_attempts_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("session_dial_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

/// Set the number of live peer connections.
///
/// Metric: `session_live_connections`
pub fn set_live_connections(count: usize) {
    // usize to f64 conversion is safe for realistic peer counts
    #[allow(clippy::cast_precision_loss)]
    gauge!("session_live_connections").set(count as f64);
}

/// Record an executed reconnect sweep.
///
/// Metric: `session_sweeps_total`
/// Labels: `trigger`
pub fn record_sweep(trigger: &str, dialed: usize) {
    counter!("session_sweeps_total", "trigger" => trigger.to_string()).increment(1);
    if dialed > 0 {
        counter!("session_sweep_dials_total").increment(dialed as u64);
    }
}

/// Record a screen-share start request.
///
/// Metric: `session_screen_share_requests_total`
/// Labels: `outcome`
pub fn record_screen_share_request(outcome: &str) {
    counter!("session_screen_share_requests_total", "outcome" => outcome.to_string())
        .increment(1);
}

/// Record a host control action.
///
/// Metric: `session_control_actions_total`
/// Labels: `action`, `outcome`
pub fn record_control_action(action: &str, outcome: &str) {
    counter!("session_control_actions_total",
        "action" => action.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a local media failure.
///
/// Metric: `session_media_errors_total`
/// Labels: `kind`
pub fn record_media_error(kind: &str) {
    counter!("session_media_errors_total", "kind" => kind.to_string()).increment(1);
}

/// Set the session actor's mailbox depth.
///
/// Metric: `session_mailbox_depth`
pub fn set_mailbox_depth(depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("session_mailbox_depth").set(depth as f64);
}
