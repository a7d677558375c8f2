//! Session Core Library
//!
//! Session and connection-lifecycle layer for Dark Tower multi-party calls:
//!
//! - Identity-to-transport addressing for participants known by several
//!   equivalent identifiers (account id, email, display name)
//! - Connection dial/answer/retry over a candidate address ladder
//! - Stream routing to render tiles
//! - Single-owner screen-share arbitration
//! - Lobby/lock admission control
//! - A reconnect sweep with an operator diagnostics snapshot
//!
//! # Architecture
//!
//! Each local participant runs one [`actors::SessionActor`]. There is no
//! central broker: every participant derives membership from a shared
//! [`metadata::SessionDocument`] and dials the peers it expects to see.
//!
//! ```text
//! SessionHandle ──mpsc──▶ SessionActor
//!                         ├── IdentityResolver   (keys, addresses)
//!                         ├── ConnectionManager  (live connections, dial tickets)
//!                         ├── LocalMediaController
//!                         ├── ScreenShareArbiter
//!                         ├── MeetingControlState
//!                         └── ReconnectSweeper
//! ```
//!
//! Platform capabilities are traits: [`transport::PeerTransport`],
//! [`media::MediaDevices`], [`metadata::MetadataChannel`] and
//! [`identity::Directory`]. [`transport::loopback`] implements them in-process.
//!
//! # Modules
//!
//! - [`actors`] - Session actor, handle and messages
//! - [`config`] - Configuration from environment
//! - [`connection`] - Connection registry and dial ladder
//! - [`errors`] - Error types
//! - [`identity`] - Identity keys and transport addresses
//! - [`media`] - Local capture
//! - [`meeting_control`] - Lobby, lock and host actions
//! - [`membership`] - Membership derived from the session document
//! - [`metadata`] - Shared session document and patches
//! - [`observability`] - Metrics and diagnostics endpoints
//! - [`router`] - Stream routing to render tiles
//! - [`screen_share`] - Screen-share ownership
//! - [`sweeper`] - Reconnect sweep and diagnostics snapshot
//! - [`transport`] - Peer transport seam

pub mod actors;
pub mod config;
pub mod connection;
pub mod errors;
pub mod identity;
pub mod media;
pub mod meeting_control;
pub mod membership;
pub mod metadata;
pub mod observability;
pub mod router;
pub mod screen_share;
pub mod sweeper;
pub mod transport;
