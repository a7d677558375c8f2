//! Session core error types.
//!
//! Every failure in the session core is recoverable: errors are surfaced as
//! notices or retried by the sweeper, and never terminate the session.
//! Internal details are logged but not exposed through `client_message`.

use thiserror::Error;

/// Failures from local capture devices and playback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    /// The user or platform refused device access.
    #[error("Permission denied")]
    PermissionDenied,

    /// Capture requires a secure context.
    #[error("Insecure context")]
    InsecureContext,

    /// No matching capture device exists.
    #[error("No capture device found")]
    NoDevice,

    /// The user dismissed the capture picker.
    #[error("Capture cancelled")]
    Cancelled,

    /// Playback requires a prior user gesture.
    #[error("Autoplay blocked")]
    AutoplayBlocked,

    /// Any other device failure.
    #[error("Capture failed: {0}")]
    Capture(String),
}

impl MediaError {
    /// Bounded label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            MediaError::PermissionDenied => "permission_denied",
            MediaError::InsecureContext => "insecure_context",
            MediaError::NoDevice => "no_device",
            MediaError::Cancelled => "cancelled",
            MediaError::AutoplayBlocked => "autoplay_blocked",
            MediaError::Capture(_) => "capture",
        }
    }
}

/// Failures reported by a peer transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No peer is listening at the address.
    #[error("Address unreachable: {0}")]
    Unreachable(String),

    /// The remote side refused the call.
    #[error("Call rejected: {0}")]
    Rejected(String),

    /// The connection was already closed.
    #[error("Connection closed")]
    Closed,

    /// Any other transport failure.
    #[error("Transport failure: {0}")]
    Failed(String),
}

/// Session core error type.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Camera, microphone or display capture could not be acquired.
    #[error("Media unavailable: {0}")]
    MediaUnavailable(MediaError),

    /// Every candidate address for a participant failed.
    #[error("Dial failed for {key}: {reason}")]
    DialFailed { key: String, reason: String },

    /// Remote audio is waiting on a user gesture.
    #[error("Autoplay blocked")]
    AutoplayBlocked,

    /// Screen share is owned by someone else or a claim is in flight.
    #[error("Screen share conflict: {0}")]
    OwnershipConflict(String),

    /// A non-host attempted a host-only action.
    #[error("Unauthorized control action: {0}")]
    UnauthorizedControlAction(String),

    /// Transport operation failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Session document could not be encoded or decoded.
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// The session actor is no longer running.
    #[error("Session has ended")]
    SessionEnded,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Bounded label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::MediaUnavailable(_) => "media_unavailable",
            SessionError::DialFailed { .. } => "dial_failed",
            SessionError::AutoplayBlocked => "autoplay_blocked",
            SessionError::OwnershipConflict(_) => "ownership_conflict",
            SessionError::UnauthorizedControlAction(_) => "unauthorized",
            SessionError::Transport(_) => "transport",
            SessionError::Metadata(_) => "metadata",
            SessionError::SessionEnded => "session_ended",
            SessionError::Internal(_) => "internal",
        }
    }

    /// Returns a user-facing message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            SessionError::MediaUnavailable(MediaError::PermissionDenied) => {
                "Camera or microphone access was denied".to_string()
            }
            SessionError::MediaUnavailable(MediaError::NoDevice) => {
                "No camera or microphone was found".to_string()
            }
            SessionError::MediaUnavailable(_) => "Camera or microphone is unavailable".to_string(),
            SessionError::DialFailed { .. } => "Still trying to connect".to_string(),
            SessionError::AutoplayBlocked => "Click to enable audio".to_string(),
            SessionError::OwnershipConflict(_) => "Someone else is already presenting".to_string(),
            SessionError::UnauthorizedControlAction(_) => {
                "Only the host can do that".to_string()
            }
            SessionError::SessionEnded => "You have left the session".to_string(),
            SessionError::Transport(_)
            | SessionError::Metadata(_)
            | SessionError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}

impl From<MediaError> for SessionError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::AutoplayBlocked => SessionError::AutoplayBlocked,
            other => SessionError::MediaUnavailable(other),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_media_error_converts_to_session_error() {
        let err: SessionError = MediaError::PermissionDenied.into();
        assert!(matches!(
            err,
            SessionError::MediaUnavailable(MediaError::PermissionDenied)
        ));

        let err: SessionError = MediaError::AutoplayBlocked.into();
        assert!(matches!(err, SessionError::AutoplayBlocked));
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let err = SessionError::Internal("actor mailbox closed at 0x7f".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");

        let err = SessionError::Transport(TransportError::Failed("ice failure".to_string()));
        assert!(!err.client_message().contains("ice"));

        let err = SessionError::DialFailed {
            key: "email:bob@example.com".to_string(),
            reason: "timeout".to_string(),
        };
        assert_eq!(err.client_message(), "Still trying to connect");
    }

    #[test]
    fn test_kind_labels_are_bounded() {
        assert_eq!(MediaError::Capture("x".to_string()).kind(), "capture");
        assert_eq!(MediaError::Cancelled.kind(), "cancelled");
        assert_eq!(SessionError::SessionEnded.kind(), "session_ended");
        assert_eq!(
            SessionError::OwnershipConflict("owned".to_string()).kind(),
            "ownership_conflict"
        );
    }

    #[test]
    fn test_transport_error_from() {
        let err: SessionError = TransportError::Closed.into();
        assert_eq!(err.to_string(), "Transport error: Connection closed");
    }
}
