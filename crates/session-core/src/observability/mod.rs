//! Observability for the session core.
//!
//! # Privacy by Default
//!
//! Actor methods use `#[instrument(skip_all)]` with an explicit `session_id`
//! field. Identity keys and addresses appear in log fields but never in
//! metric labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `session_dial_attempts_total` | Counter | `outcome` | Dial ladder results |
//! | `session_dial_duration_seconds` | Histogram | `outcome` | Time to connect or give up |
//! | `session_live_connections` | Gauge | none | Current peer connections |
//! | `session_sweeps_total` | Counter | `trigger` | Reconciliation passes |
//! | `session_sweep_dials_total` | Counter | none | Dials started by sweeps |
//! | `session_screen_share_requests_total` | Counter | `outcome` | Start requests |
//! | `session_control_actions_total` | Counter | `action`, `outcome` | Host controls |
//! | `session_media_errors_total` | Counter | `kind` | Capture and playback failures |
//! | `session_mailbox_depth` | Gauge | none | Backpressure indicator |

pub mod diagnostics;
pub mod metrics;

// Re-exports for convenience
pub use diagnostics::{diagnostics_router, DiagnosticsState};
pub use metrics::{
    init_metrics_recorder, record_control_action, record_dial, record_media_error,
    record_screen_share_request, record_sweep, set_live_connections, set_mailbox_depth,
};
