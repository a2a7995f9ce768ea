//! Shared harness: orchestrator over the simulated provider, an always
//! healthy probe and a scripted cluster management API.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nodeforge::*;

pub struct AlwaysHealthy;

#[async_trait]
impl NodeProbe for AlwaysHealthy {
    async fn probe(&self, _address: &str) -> ProbeResult {
        ProbeResult::Healthy
    }
}

/// Records every management API call and reports the cluster up at once.
#[derive(Default)]
pub struct ScriptedApi {
    calls: Mutex<Vec<String>>,
    failing_creates: Mutex<usize>,
}

impl ScriptedApi {
    /// Fail the next `n` cluster create calls.
    pub fn fail_creates(&self, n: usize) {
        *self.failing_creates.lock().unwrap() = n;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[async_trait]
impl ClusterApi for ScriptedApi {
    async fn create_cluster(&self, entry_point: &str, request: &CreateClusterRequest) -> ClusterResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("create {} via {entry_point}", request.name));
        let mut failing = self.failing_creates.lock().unwrap();
        if *failing > 0 {
            *failing -= 1;
            return Err(ClusterError::Api {
                status: 503,
                message: "cluster service not ready".to_string(),
            });
        }
        Ok(())
    }

    async fn join_cluster(&self, entry_point: &str, cluster: &str, member: &MemberSpec) -> ClusterResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("join {} to {cluster} via {entry_point}", member.node));
        Ok(())
    }

    async fn cluster_health(&self, _entry_point: &str, _cluster: &str) -> ClusterResult<ClusterHealth> {
        Ok(ClusterHealth {
            up: true,
            members_up: 3,
            message: None,
        })
    }
}

pub struct Harness {
    pub orch: Orchestrator,
    pub sim: Arc<SimulatedCloud>,
    pub api: Arc<ScriptedApi>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(mutate: impl FnOnce(&mut ForgeConfig)) -> Self {
        Self::build(Duration::from_millis(10), mutate)
    }

    /// Monitors that never tick on their own; tests drive them with
    /// `monitor().evaluate`.
    pub fn manual(mutate: impl FnOnce(&mut ForgeConfig)) -> Self {
        Self::build(Duration::from_secs(3600), mutate)
    }

    fn build(poll: Duration, mutate: impl FnOnce(&mut ForgeConfig)) -> Self {
        let mut config = ForgeConfig::sample();
        config.cluster.formation_timeout_secs = 5;
        mutate(&mut config);

        let sim = Arc::new(SimulatedCloud::new());
        let api = Arc::new(ScriptedApi::default());
        let orch = Orchestrator::builder(StateStore::open_in_memory().unwrap(), config)
            .provider(sim.clone())
            .retry(RetryConfig::none())
            .probe(Arc::new(AlwaysHealthy))
            .cluster_api(api.clone())
            .poll_interval(poll)
            .health_poll_interval(Duration::from_millis(10))
            .build()
            .unwrap();
        Self { orch, sim, api }
    }

    pub fn phase(&self, node: &str) -> Phase {
        self.orch.get_node(node).unwrap().status
    }

    pub fn management_address(&self, node: &str) -> String {
        self.orch
            .get_node(node)
            .unwrap()
            .addresses
            .management
            .unwrap()
    }

    /// Poll until `node` is in `phase`, failing after five seconds.
    pub async fn wait_for(&self, node: &str, phase: Phase) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let current = self.phase(node);
            if current == phase {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{node} stuck in {current}, expected {phase}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until cluster `name` is in `status`, failing after five seconds.
    pub async fn wait_for_cluster(&self, name: &str, status: ClusterStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let current = self.orch.get_cluster(name).unwrap().status;
            if current == status {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{name} is {current:?}, expected {status:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Play the node's side of the install: boot, fetch config, report
    /// every install phase.
    pub async fn install(&self, node: &str) {
        self.wait_for(node, Phase::ServerRunning).await;
        let address = self.management_address(node);
        self.orch.boot_pointer(&address).unwrap();
        self.orch.install_config(&address).unwrap();
        for phase in [
            Phase::FoundationStart,
            Phase::StorageDiscovery,
            Phase::ImageDownload,
        ] {
            self.orch
                .report_phase(&address, phase, EventStatus::InProgress, "")
                .unwrap();
        }
        self.orch
            .report_phase(&address, Phase::Installation, EventStatus::Completed, "installed")
            .unwrap();
    }

    /// Nothing left at the provider.
    pub fn provider_is_empty(&self) -> bool {
        self.sim.reservation_count() == 0
            && self.sim.dns_record_count() == 0
            && self.sim.attachment_count() == 0
            && self.sim.server_count() == 0
    }

    /// Nothing left tracked in the store.
    pub fn store_is_empty(&self) -> bool {
        let store = self.orch.store();
        store.list_addresses().unwrap().is_empty()
            && store.list_dns_records().unwrap().is_empty()
            && store.list_attachments().unwrap().is_empty()
    }
}

pub fn request(name: &str) -> ProvisionRequest {
    ProvisionRequest::new(name, "bx2d-metal-96x384", ClusterRole::ComputeStorage)
}
