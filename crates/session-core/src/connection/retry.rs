//! Candidate-address dial ladder.
//!
//! Candidates are tried in order. Each gets a bounded wait for the first
//! inbound media; the first candidate to deliver media wins and the ladder
//! stops. Connections that fail or time out are closed before moving on.

use crate::config::{DEFAULT_DIAL_TIMEOUT_MS, DEFAULT_MAX_CANDIDATES};
use crate::identity::TransportAddress;
use crate::media::MediaStream;
use crate::transport::{PeerEvent, PeerLink, PeerTransport};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Dial retry parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait for first inbound media per candidate.
    pub per_candidate_timeout: Duration,
    /// Candidates tried per dial.
    pub max_candidates: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            per_candidate_timeout: Duration::from_millis(DEFAULT_DIAL_TIMEOUT_MS),
            max_candidates: DEFAULT_MAX_CANDIDATES,
        }
    }
}

/// Result of one pass over the candidate ladder.
#[derive(Debug)]
pub enum DialOutcome {
    Connected {
        address: TransportAddress,
        link: PeerLink,
        remote_stream: MediaStream,
        attempts: usize,
    },
    Exhausted {
        attempts: usize,
        last_error: Option<String>,
    },
    Cancelled,
}

impl DialOutcome {
    /// Bounded label for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            DialOutcome::Connected { .. } => "connected",
            DialOutcome::Exhausted { .. } => "exhausted",
            DialOutcome::Cancelled => "cancelled",
        }
    }
}

/// Wait for the first remote stream on a connection's event channel.
pub async fn wait_for_media(events: &mut mpsc::Receiver<PeerEvent>) -> Result<MediaStream, String> {
    match events.recv().await {
        Some(PeerEvent::Stream(stream)) => Ok(stream),
        Some(PeerEvent::Closed) => Err("closed before media".to_string()),
        Some(PeerEvent::Error(reason)) => Err(reason),
        None => Err("event channel closed".to_string()),
    }
}

/// Try each candidate until one delivers media.
pub async fn dial_with_fallback(
    transport: &dyn PeerTransport,
    candidates: &[TransportAddress],
    local: &MediaStream,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> DialOutcome {
    let mut attempts = 0;
    let mut last_error = None;

    for address in candidates.iter().take(policy.max_candidates.max(1)) {
        attempts += 1;
        let deadline = Instant::now() + policy.per_candidate_timeout;

        let dialed = tokio::select! {
            () = cancel.cancelled() => return DialOutcome::Cancelled,
            dialed = tokio::time::timeout_at(deadline, transport.dial(address, local)) => dialed,
        };
        let mut link = match dialed {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                debug!(target: "session.dial", address = %address, error = %e, "Candidate dial failed");
                last_error = Some(e.to_string());
                continue;
            }
            Err(_) => {
                debug!(target: "session.dial", address = %address, "Candidate dial timed out");
                last_error = Some("timed out".to_string());
                continue;
            }
        };

        let waited = tokio::select! {
            () = cancel.cancelled() => {
                link.connection.close();
                return DialOutcome::Cancelled;
            }
            waited = tokio::time::timeout_at(deadline, wait_for_media(&mut link.events)) => waited,
        };
        match waited {
            Ok(Ok(remote_stream)) => {
                return DialOutcome::Connected {
                    address: address.clone(),
                    link,
                    remote_stream,
                    attempts,
                };
            }
            Ok(Err(reason)) => {
                debug!(target: "session.dial", address = %address, reason = %reason, "Candidate closed before media");
                link.connection.close();
                last_error = Some(reason);
            }
            Err(_) => {
                debug!(target: "session.dial", address = %address, "No media before timeout");
                link.connection.close();
                last_error = Some("no media before timeout".to_string());
            }
        }
    }

    DialOutcome::Exhausted {
        attempts,
        last_error,
    }
}
