//! nodeforge-monitor: deployment tracking for NodeForge.
//!
//! Every provisioned node gets a background task that watches it until it
//! is deployed, failed or cleaned. Two signal sources feed the same phase
//! state machine: provider lifecycle polling and phase reports the node
//! sends while it installs itself.
//!
//! # Architecture
//!
//! ```text
//! DeploymentMonitor
//!   ├── Per-node background task
//!   │   ├── provider poll (server_requested → server_running)
//!   │   ├── phase timeout check
//!   │   ├── dns_registration / health_validation finalisation
//!   │   └── NodeProbe → ProbeResult
//!   ├── PhaseTracker (history append + monotonic cache update)
//!   └── Optional failure / ready callbacks
//! ```
//!
//! # Ordering
//!
//! A signal moves a node only if its phase index is not below the current
//! one. Rejected signals are still appended to the history. Cleanup may
//! race a poll; the tracker re-checks the phase inside the write
//! transaction, so a cleaned node is never resurrected.

pub mod error;
pub mod monitor;
pub mod probe;
pub mod tracker;

pub use error::{MonitorError, MonitorResult};
pub use monitor::{
    BoxFuture, DeploymentMonitor, FailureCallback, FailureReason, NodeFailure, ReadyCallback,
    TickOutcome,
};
pub use probe::{HttpProbe, NodeProbe, ProbeResult, http_probe};
pub use tracker::{PhaseTracker, Transition};
