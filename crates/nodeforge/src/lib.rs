//! nodeforge: bare-metal node provisioning and cluster formation.
//!
//! The [`Orchestrator`] wires the state store, provider client, deployment
//! monitor, provisioner, boot config generator, cluster coordinator and
//! cleanup service together and exposes every operation of the system:
//!
//! ```text
//! create_node ──▶ NodeProvisioner ──▶ DeploymentMonitor (per node)
//!                                        │ failure ─▶ CleanupService (policy)
//!                                        │ ready   ─▶ ClusterCoordinator
//! boot_pointer / install_config ──▶ BootConfigGenerator
//! report_phase ──▶ PhaseTracker
//! cleanup_* ──▶ CleanupService
//! ```
//!
//! Nothing here speaks HTTP to clients; a front end maps its routes onto
//! these methods.

pub mod error;
pub mod orchestrator;
pub mod status;
pub mod sweeper;

pub use error::{ForgeError, ForgeResult};
pub use orchestrator::{ClusterRequest, FormationMode, Orchestrator, OrchestratorBuilder};
pub use status::{ClusterOverview, DeploymentCleanup, DeploymentSummary, NodeStatus, PhaseAck};
pub use sweeper::OrphanSweeper;

pub use nodeforge_boot::{BootPointer, InstallConfig};
pub use nodeforge_cloud::{CloudOp, CloudProvider, FaultKind, RetryConfig, SimulatedCloud};
pub use nodeforge_cluster::{
    ClusterApi, ClusterError, ClusterHealth, ClusterResult, CreateClusterRequest, MemberSpec,
};
pub use nodeforge_core::ForgeConfig;
pub use nodeforge_monitor::{NodeProbe, ProbeResult};
pub use nodeforge_provision::{
    CleanupOutcome, CleanupStatus, CleanupSummary, CleanupValidation, ProvisionError,
    ProvisionReceipt, ProvisionRequest,
};
pub use nodeforge_state::{
    AddressRole, Cluster, ClusterAssociation, ClusterIntent, ClusterRole, ClusterStatus,
    DeploymentEvent, EventStatus, MemberKind, Node, Phase, StateStore,
};
