//! Deployment monitor: a background task per node.
//!
//! Each task wakes up every poll interval and evaluates its node once:
//! stop if the node is settled, enforce the phase timeout, reconcile the
//! provider's server status, and drive the post-install phases. The task
//! ends on its own once the node is deployed, failed or cleaned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nodeforge_cloud::{CloudClient, ServerStatus};
use nodeforge_core::ForgeConfig;
use nodeforge_state::*;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::MonitorResult;
use crate::probe::{NodeProbe, ProbeResult};
use crate::tracker::PhaseTracker;

pub type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Why the monitor failed a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The phase timer expired.
    Timeout,
    /// The provider reported the server as failed or gone.
    Provider,
    /// The node's published DNS records disappeared.
    Dns,
}

/// Passed to the failure callback after a node became `failed`.
#[derive(Debug, Clone)]
pub struct NodeFailure {
    pub node: String,
    /// Phase the node was in when it failed.
    pub phase: Phase,
    pub reason: FailureReason,
    pub message: String,
}

/// Invoked after the monitor fails a node. The orchestrator decides
/// whether to roll it back.
pub type FailureCallback = Arc<dyn Fn(NodeFailure) -> BoxFuture + Send + Sync>;

/// Invoked on every tick a node spends in `cluster_formation`.
pub type ReadyCallback = Arc<dyn Fn(String) -> BoxFuture + Send + Sync>;

/// What a single evaluation decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep watching.
    Continue,
    /// Node is settled or gone.
    Stop,
}

/// Per-node monitor state.
struct MonitorSlot {
    /// Handle to the background task.
    handle: JoinHandle<()>,
    /// Shutdown signal for this monitor.
    shutdown_tx: watch::Sender<bool>,
}

struct MonitorInner {
    store: StateStore,
    cloud: CloudClient,
    config: Arc<ForgeConfig>,
    tracker: PhaseTracker,
    probe: Arc<dyn NodeProbe>,
    on_failure: Option<FailureCallback>,
    on_ready: Option<ReadyCallback>,
}

/// Watches provisioned nodes until they settle.
#[derive(Clone)]
pub struct DeploymentMonitor {
    inner: Arc<MonitorInner>,
    /// Active monitors: node name → slot.
    monitors: Arc<RwLock<HashMap<String, MonitorSlot>>>,
    interval: Duration,
}

impl DeploymentMonitor {
    pub fn new(
        store: StateStore,
        cloud: CloudClient,
        config: Arc<ForgeConfig>,
        probe: Arc<dyn NodeProbe>,
    ) -> Self {
        let interval = config.poll_interval();
        Self {
            inner: Arc::new(MonitorInner {
                tracker: PhaseTracker::new(store.clone()),
                store,
                cloud,
                config,
                probe,
                on_failure: None,
                on_ready: None,
            }),
            monitors: Arc::new(RwLock::new(HashMap::new())),
            interval,
        }
    }

    /// Set the callback invoked after the monitor fails a node.
    ///
    /// Must be called before any monitor is started.
    pub fn with_failure_callback(mut self, callback: FailureCallback) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.on_failure = Some(callback);
        } else {
            warn!("failure callback set after monitors started, ignoring");
        }
        self
    }

    /// Set the callback invoked while a node waits in `cluster_formation`.
    pub fn with_ready_callback(mut self, callback: ReadyCallback) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.on_ready = Some(callback);
        } else {
            warn!("ready callback set after monitors started, ignoring");
        }
        self
    }

    /// Override the poll interval (tests use a few milliseconds).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn tracker(&self) -> &PhaseTracker {
        &self.inner.tracker
    }

    /// Start watching a node. Replaces an existing watcher for the same node.
    pub async fn start(&self, node: &str) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let name = node.to_string();
        let inner = self.inner.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            run_monitor_loop(&name, inner, interval, shutdown_rx).await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            node.to_string(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(%node, interval_ms = interval.as_millis() as u64, "deployment monitor started");
    }

    /// Stop watching a node.
    pub async fn stop(&self, node: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(node) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%node, "deployment monitor stopped");
        }
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (node, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%node, "deployment monitor stopped");
        }
        info!("all deployment monitors stopped");
    }

    /// Node names with a running monitor task. Finished tasks are pruned.
    pub async fn active_monitors(&self) -> Vec<String> {
        let mut monitors = self.monitors.write().await;
        monitors.retain(|_, slot| !slot.handle.is_finished());
        monitors.keys().cloned().collect()
    }

    pub async fn is_monitoring(&self, node: &str) -> bool {
        let monitors = self.monitors.read().await;
        monitors
            .get(node)
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    /// Start a monitor for every node that has not settled yet.
    /// Used when the daemon starts on an existing store.
    pub async fn resume_all(&self) -> MonitorResult<usize> {
        let nodes = self.inner.store.list_nodes()?;
        let mut resumed = 0;
        for node in nodes.iter().filter(|n| !n.status.is_settled()) {
            self.start(&node.name).await;
            resumed += 1;
        }
        info!(resumed, "deployment monitors resumed");
        Ok(resumed)
    }

    /// Evaluate one node once, as its background task would.
    pub async fn evaluate(&self, node: &str, now: u64) -> MonitorResult<TickOutcome> {
        self.inner.evaluate(node, now).await
    }

    /// Evaluate every unsettled node once.
    pub async fn sweep_once(&self, now: u64) -> MonitorResult<()> {
        for node in self.inner.store.list_nodes()? {
            if node.status.is_settled() {
                continue;
            }
            if let Err(e) = self.inner.evaluate(&node.name, now).await {
                warn!(node = %node.name, error = %e, "monitor sweep failed for node");
            }
        }
        Ok(())
    }
}

/// The monitor loop for a single node.
async fn run_monitor_loop(
    node: &str,
    inner: Arc<MonitorInner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%node, "monitor loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match inner.evaluate(node, now_millis()).await {
                    Ok(TickOutcome::Continue) => {}
                    Ok(TickOutcome::Stop) => {
                        debug!(%node, "node settled, monitor loop exiting");
                        break;
                    }
                    Err(e) => {
                        error!(%node, error = %e, "monitor evaluation failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!(%node, "monitor loop shutting down");
                break;
            }
        }
    }
}

impl MonitorInner {
    async fn evaluate(&self, name: &str, now: u64) -> MonitorResult<TickOutcome> {
        let Some(node) = self.store.get_node(name)? else {
            return Ok(TickOutcome::Stop);
        };
        if node.status.is_settled() {
            return Ok(TickOutcome::Stop);
        }

        if let Some(limit) = self.config.timeout_for(node.status) {
            let elapsed = Duration::from_millis(now.saturating_sub(node.last_progress_at));
            if elapsed > limit {
                let message = format!(
                    "phase {} timed out after {}s",
                    node.status,
                    limit.as_secs()
                );
                self.fail(&node, FailureReason::Timeout, message).await?;
                return Ok(TickOutcome::Stop);
            }
        }

        if node.status.awaits_provider() {
            return self.reconcile_provider(&node).await;
        }

        match node.status {
            Phase::ClusterFormation => {
                if let Some(cb) = &self.on_ready {
                    cb(node.name.clone()).await;
                }
            }
            Phase::DnsRegistration => self.verify_dns(&node).await?,
            Phase::HealthValidation => self.validate_health(&node).await?,
            _ => {}
        }
        Ok(TickOutcome::Continue)
    }

    /// Map the provider's server status onto the server_* phases.
    async fn reconcile_provider(&self, node: &Node) -> MonitorResult<TickOutcome> {
        let Some(server_id) = &node.server_id else {
            return Ok(TickOutcome::Continue);
        };

        let info = match self.cloud.get_server(server_id).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => {
                let message = format!("server {server_id} no longer exists");
                self.fail(node, FailureReason::Provider, message).await?;
                return Ok(TickOutcome::Stop);
            }
            Err(e) => {
                warn!(node = %node.name, %server_id, error = %e, "server status poll failed");
                return Ok(TickOutcome::Continue);
            }
        };

        let phase = match info.status {
            ServerStatus::Pending => Phase::ServerRequested,
            ServerStatus::Provisioning => Phase::ServerProvisioning,
            ServerStatus::Running => Phase::ServerRunning,
            ServerStatus::Failed => {
                let reason = info
                    .status_reason
                    .unwrap_or_else(|| "provider reported failure".to_string());
                let message = format!("server {server_id} failed: {reason}");
                self.fail(node, FailureReason::Provider, message).await?;
                return Ok(TickOutcome::Stop);
            }
            ServerStatus::Stopped | ServerStatus::Deleting => {
                debug!(node = %node.name, status = %info.status, "server not running");
                return Ok(TickOutcome::Continue);
            }
        };

        if phase.index() > node.status.index() {
            self.tracker.enter(
                &node.name,
                phase,
                EventSource::Provider,
                format!("provider status {}", info.status),
            )?;
            self.store.update_node(&node.name, |n| {
                n.provider_status = Some(info.status.to_string());
                true
            })?;
        }
        Ok(TickOutcome::Continue)
    }

    /// Confirm every record the node owns is still published.
    async fn verify_dns(&self, node: &Node) -> MonitorResult<()> {
        let records = self.store.list_dns_records_for_owner(&node.name)?;
        for record in &records {
            match self.cloud.find_dns_record(&record.zone, &record.name).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    let message = format!("DNS record {} is no longer published", record.name);
                    self.fail(node, FailureReason::Dns, message).await?;
                    return Ok(());
                }
                Err(e) => {
                    warn!(node = %node.name, record = %record.name, error = %e, "DNS lookup failed");
                    return Ok(());
                }
            }
        }
        self.tracker.enter(
            &node.name,
            Phase::HealthValidation,
            EventSource::Monitor,
            format!("{} DNS records verified", records.len()),
        )?;
        Ok(())
    }

    /// Probe the controller VM (management address as fallback) and
    /// deploy the node once it answers.
    async fn validate_health(&self, node: &Node) -> MonitorResult<()> {
        let target = node
            .addresses
            .controller_vm
            .as_deref()
            .or(node.addresses.management.as_deref());
        let Some(address) = target else {
            self.tracker.enter(
                &node.name,
                Phase::Deployed,
                EventSource::Monitor,
                "no address to probe",
            )?;
            return Ok(());
        };

        match self.probe.probe(address).await {
            ProbeResult::Healthy => {
                self.tracker.enter(
                    &node.name,
                    Phase::Deployed,
                    EventSource::Monitor,
                    format!("health check passed on {address}"),
                )?;
            }
            result => debug!(node = %node.name, %address, ?result, "health check not passing yet"),
        }
        Ok(())
    }

    /// Mark the node failed and hand it to the failure callback.
    async fn fail(&self, node: &Node, reason: FailureReason, message: String) -> MonitorResult<()> {
        let transition = self.tracker.fail(&node.name, EventSource::Monitor, message.clone())?;
        if !transition.applied() {
            // Someone else settled it first (cleanup, another report).
            return Ok(());
        }
        if let Some(cb) = &self.on_failure {
            cb(NodeFailure {
                node: node.name.clone(),
                phase: node.status,
                reason,
                message,
            })
            .await;
        }
        Ok(())
    }
}
