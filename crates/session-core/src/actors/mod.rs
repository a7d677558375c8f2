//! Actor implementation for the session core.
//!
//! One [`SessionActor`] runs per local participant per session:
//!
//! ```text
//! SessionActor (one per local participant)
//! ├── owns membership, controls and the shared session document
//! ├── owns the ConnectionManager (one live connection per peer)
//! ├── spawns dial tasks (candidate ladder per peer)
//! ├── spawns connection watchers (forward PeerEvents to the mailbox)
//! └── runs the reconnect sweep on an interval
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer**: all state changes happen on the actor; spawned tasks
//!   only report results through the mailbox
//! - **Tickets and generations**: late dial and answer results are rejected
//!   instead of overwriting newer state
//! - **CancellationToken propagation**: every spawned task holds a child token
//!   of the session token
//! - **Mailbox monitoring**: depth thresholds (100/500) with metrics
//!
//! # Modules
//!
//! - [`session`] - `SessionActor` and its `SessionHandle`
//! - [`messages`] - Message types for the session mailbox
//! - [`metrics`] - Mailbox monitoring and per-session counters

pub mod messages;
pub mod metrics;
pub mod session;

// Re-export primary types
pub use messages::*;
pub use metrics::{MailboxMonitor, SessionMetrics, SessionMetricsSnapshot};
pub use session::{SessionActor, SessionDeps, SessionHandle};
