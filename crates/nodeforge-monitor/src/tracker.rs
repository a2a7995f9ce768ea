//! Phase state machine.
//!
//! All phase changes go through [`PhaseTracker`]. It appends the history row
//! and updates the cached node in one store transaction, applying a signal
//! only when the node may move to the signalled phase.

use nodeforge_state::*;
use tracing::{debug, info, warn};

use crate::error::{MonitorError, MonitorResult};

/// A recorded signal and the node as it stands afterwards.
#[derive(Debug, Clone)]
pub struct Transition {
    pub event: DeploymentEvent,
    pub node: Node,
}

impl Transition {
    /// Whether the signal moved the cached state.
    pub fn applied(&self) -> bool {
        self.event.applied
    }
}

/// Applies signals to nodes.
#[derive(Clone)]
pub struct PhaseTracker {
    store: StateStore,
}

/// Phase a signal asks the node to be in.
fn target_phase(phase: Phase, status: EventStatus) -> Phase {
    if status == EventStatus::Failed {
        Phase::Failed
    } else {
        phase
    }
}

fn apply_signal(node: &mut Node, target: Phase, event: &DeploymentEvent) -> bool {
    if !node.status.can_advance_to(target) {
        return false;
    }
    if target == Phase::Failed {
        node.failure = Some(if event.message.is_empty() {
            format!("{} failed", event.phase)
        } else {
            event.message.clone()
        });
    }
    node.enter_phase(target, event.timestamp);
    true
}

impl PhaseTracker {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Record a signal for `node`. See the module docs for the rules.
    pub fn record(
        &self,
        node: &str,
        phase: Phase,
        status: EventStatus,
        source: EventSource,
        message: impl Into<String>,
    ) -> MonitorResult<Transition> {
        let event = DeploymentEvent::new(node, phase, status, source, message);
        let target = target_phase(phase, status);
        let (event, current) = self
            .store
            .record_event(event, |n, ev| apply_signal(n, target, ev))?
            .ok_or_else(|| MonitorError::NodeNotFound(node.to_string()))?;

        self.log(&event, &current, target);
        let transition = Transition {
            event,
            node: current,
        };

        if transition.applied() && phase == Phase::Installation && status == EventStatus::Completed {
            return self.finish_install(&transition.node);
        }
        Ok(transition)
    }

    /// Like [`record`](Self::record), but a repeat of an already applied
    /// phase is dropped without a history row.
    pub fn record_once(
        &self,
        node: &str,
        phase: Phase,
        status: EventStatus,
        source: EventSource,
        message: impl Into<String>,
    ) -> MonitorResult<Transition> {
        let event = DeploymentEvent::new(node, phase, status, source, message);
        let target = target_phase(phase, status);
        let (event, current) = self
            .store
            .record_event_once(event, |n, ev| apply_signal(n, target, ev))?
            .ok_or_else(|| MonitorError::NodeNotFound(node.to_string()))?;
        self.log(&event, &current, target);
        Ok(Transition {
            event,
            node: current,
        })
    }

    /// A phase report sent by the node itself.
    pub fn report(
        &self,
        node: &str,
        phase: Phase,
        status: EventStatus,
        message: impl Into<String>,
    ) -> MonitorResult<Transition> {
        if !phase.is_node_reported() {
            return Err(MonitorError::InvalidReport(format!(
                "nodes may not report phase {phase}"
            )));
        }
        self.record(node, phase, status, EventSource::Node, message)
    }

    /// Enter `phase` on behalf of `source`.
    pub fn enter(
        &self,
        node: &str,
        phase: Phase,
        source: EventSource,
        message: impl Into<String>,
    ) -> MonitorResult<Transition> {
        self.record(node, phase, EventStatus::Started, source, message)
    }

    /// Mark the node failed while it is in its current phase.
    pub fn fail(
        &self,
        node: &str,
        source: EventSource,
        message: impl Into<String>,
    ) -> MonitorResult<Transition> {
        let current = self
            .store
            .get_node(node)?
            .ok_or_else(|| MonitorError::NodeNotFound(node.to_string()))?;
        self.record(node, current.status, EventStatus::Failed, source, message)
    }

    /// Move a node that finished installing to its first post-install phase.
    fn finish_install(&self, node: &Node) -> MonitorResult<Transition> {
        let next = if node.cluster.is_some() {
            Phase::ClusterFormation
        } else {
            Phase::DnsRegistration
        };
        self.enter(&node.name, next, EventSource::Monitor, "installation complete")
    }

    fn log(&self, event: &DeploymentEvent, node: &Node, target: Phase) {
        if !event.applied {
            debug!(
                node = %event.node,
                phase = %event.phase,
                status = %event.status,
                current = %node.status,
                "signal recorded without applying"
            );
        } else if target == Phase::Failed {
            warn!(
                node = %event.node,
                phase = %event.phase,
                message = %event.message,
                "node failed"
            );
        } else {
            info!(
                node = %event.node,
                phase = %node.status,
                status = %event.status,
                progress = node.progress,
                "phase transition"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(cluster: bool) -> PhaseTracker {
        let store = StateStore::open_in_memory().unwrap();
        let mut node = Node::new("node-1", "bx2d-metal-96x384", ClusterRole::ComputeStorage);
        node.status = Phase::ServerRunning;
        if cluster {
            node.cluster = Some(ClusterAssociation {
                cluster: "hci-a".to_string(),
                intent: ClusterIntent::Create,
            });
        }
        store.create_node(&node).unwrap();
        PhaseTracker::new(store)
    }

    #[test]
    fn out_of_order_reports_are_history_only() {
        let tracker = setup(false);
        tracker
            .report("node-1", Phase::StorageDiscovery, EventStatus::Started, "")
            .unwrap();
        let late = tracker
            .report("node-1", Phase::ConfigDownload, EventStatus::Completed, "late")
            .unwrap();

        assert!(!late.applied());
        assert_eq!(late.node.status, Phase::StorageDiscovery);
        assert_eq!(tracker.store().list_events_for_node("node-1").unwrap().len(), 2);
    }

    #[test]
    fn duplicate_reports_do_not_regress() {
        let tracker = setup(false);
        for _ in 0..3 {
            tracker
                .report("node-1", Phase::ImageDownload, EventStatus::InProgress, "50%")
                .unwrap();
        }
        let node = tracker.store().get_node("node-1").unwrap().unwrap();
        assert_eq!(node.status, Phase::ImageDownload);
        assert_eq!(node.progress, Phase::ImageDownload.progress());
    }

    #[test]
    fn reported_failure_marks_node_failed() {
        let tracker = setup(false);
        let t = tracker
            .report("node-1", Phase::Installation, EventStatus::Failed, "disk /dev/nvme3n1 missing")
            .unwrap();
        assert!(t.applied());
        assert_eq!(t.node.status, Phase::Failed);
        assert_eq!(t.node.failure.as_deref(), Some("disk /dev/nvme3n1 missing"));

        // Nothing moves a failed node forward again.
        let after = tracker
            .report("node-1", Phase::Installation, EventStatus::Completed, "")
            .unwrap();
        assert!(!after.applied());
        assert_eq!(after.node.status, Phase::Failed);
    }

    #[test]
    fn install_completion_without_cluster_goes_to_dns() {
        let tracker = setup(false);
        let t = tracker
            .report("node-1", Phase::Installation, EventStatus::Completed, "")
            .unwrap();
        assert_eq!(t.node.status, Phase::DnsRegistration);
    }

    #[test]
    fn install_completion_with_cluster_waits_for_formation() {
        let tracker = setup(true);
        let t = tracker
            .report("node-1", Phase::Installation, EventStatus::Completed, "")
            .unwrap();
        assert_eq!(t.node.status, Phase::ClusterFormation);
        assert!(t.node.status.is_ready());
    }

    #[test]
    fn nodes_cannot_report_control_plane_phases() {
        let tracker = setup(false);
        let err = tracker
            .report("node-1", Phase::Deployed, EventStatus::Completed, "")
            .unwrap_err();
        assert!(matches!(err, MonitorError::InvalidReport(_)));
    }

    #[test]
    fn unknown_node() {
        let tracker = setup(false);
        let err = tracker
            .report("ghost", Phase::IpxeBoot, EventStatus::Started, "")
            .unwrap_err();
        assert!(matches!(err, MonitorError::NodeNotFound(_)));
    }

    #[test]
    fn cleaned_node_is_never_resurrected() {
        let tracker = setup(false);
        tracker
            .record("node-1", Phase::Cleaned, EventStatus::Completed, EventSource::Cleanup, "")
            .unwrap();
        let t = tracker
            .record("node-1", Phase::ServerRunning, EventStatus::Started, EventSource::Provider, "")
            .unwrap();
        assert!(!t.applied());
        assert_eq!(t.node.status, Phase::Cleaned);
    }

    #[test]
    fn record_once_drops_repeats() {
        let tracker = setup(false);
        let first = tracker
            .record_once("node-1", Phase::IpxeBoot, EventStatus::Started, EventSource::Node, "")
            .unwrap();
        let second = tracker
            .record_once("node-1", Phase::IpxeBoot, EventStatus::Started, EventSource::Node, "")
            .unwrap();
        assert!(first.applied());
        assert!(!second.applied());
        assert_eq!(tracker.store().list_events_for_node("node-1").unwrap().len(), 1);
    }
}
