//! nodeforge-state: embedded state store for NodeForge.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for nodes, reserved addresses, DNS records, network attachments,
//! the append-only deployment event history, and clusters.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{subnet}/{address}`, `{node}:{seq}`) enable uniqueness
//! checks and prefix scans for related records.
//!
//! redb serializes write transactions, so every read-modify-write helper on
//! [`StateStore`] is atomic: address claims are check-then-insert, and phase
//! transitions append history and update the cached node in one commit.

pub mod error;
pub mod phase;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use phase::{EventStatus, Phase, PhaseParseError};
pub use store::{StateStore, Updated};
pub use types::*;
