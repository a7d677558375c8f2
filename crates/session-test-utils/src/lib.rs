//! # Session Test Utilities
//!
//! Shared test utilities for the Session Core.
//!
//! This crate provides scripted capability implementations and fixtures for
//! testing sessions without a real network or capture devices.
//!
//! ## Modules
//!
//! - `mock_transport` - Scripted `PeerTransport` with per-address behaviour and a dial log
//! - `mock_media` - Scripted `MediaDevices` (denials, autoplay blocking, capture counts)
//! - `mock_metadata` - `MetadataChannel` that records every published patch
//! - `fixtures` - Pre-configured participants and session documents
//! - `harness` - Multi-party sessions over the loopback transport
//!
//! ## Usage
//!
//! ```rust,ignore
//! use session_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     // First candidate hangs, second answers
//!     let transport = ScriptedTransport::builder()
//!         .hang("dt-legacy-bob")
//!         .answer("dt-observed-bob")
//!         .build();
//!
//!     let media = ScriptedMedia::builder().build();
//!     let metadata = RecordingMetadata::new();
//!
//!     // Spawn a session with these and run your test...
//! }
//! ```
//!
//! ## Test Patterns
//!
//! ### Multi-party sessions
//!
//! ```rust,ignore
//! let mut harness = SessionHarness::new(TestSession::new("s-1").organizer(alice()).invitee(bob()).build());
//! let a = harness.join(alice()).await?;
//! let b = harness.join(bob()).await?;
//! harness.settle().await;
//! ```

pub mod fixtures;
pub mod harness;
pub mod mock_media;
pub mod mock_metadata;
pub mod mock_transport;

// Re-export commonly used items
pub use fixtures::*;
pub use harness::*;
pub use mock_media::*;
pub use mock_metadata::*;
pub use mock_transport::*;
