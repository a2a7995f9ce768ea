//! nodeforge-cluster: forming hyperconverged clusters from ready nodes.
//!
//! Nodes that finish installing with a cluster intent wait in
//! `cluster_formation`. The [`ClusterCoordinator`] fires once the cluster's
//! minimum member count is ready: it picks an entry point, issues one
//! create call to that member's management interface through the
//! [`ClusterApi`], and polls cluster health until the cluster is up or the
//! formation timeout elapses. Nodes that become ready after formation are
//! joined through the same entry point.

pub mod api;
pub mod coordinator;
pub mod error;

pub use api::{ClusterApi, ClusterHealth, CreateClusterRequest, HttpClusterApi, MemberSpec};
pub use coordinator::{ClusterCoordinator, FormationOutcome};
pub use error::{ClusterError, ClusterResult};
