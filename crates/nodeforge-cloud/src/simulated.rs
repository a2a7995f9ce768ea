//! In-memory provider with fault injection.
//!
//! Behaves like a strict control plane: duplicate address reservations are
//! conflicts, deleting something unknown is `NotFound`, and servers walk
//! through a scripted status progression, one step per poll.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{CloudError, CloudResult};
use crate::provider::*;

/// What an injected fault does to the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Retryable upstream failure (503).
    Transient,
    /// Non-retryable API error (400).
    Permanent,
    /// Never answers. The caller's timeout has to fire.
    Hang,
    /// The call takes effect upstream but the answer is lost, so the
    /// caller sees a timeout.
    LostResponse,
}

#[derive(Debug, Clone)]
struct Fault {
    op: CloudOp,
    /// Fire on this 1-based call number, or on the next calls if `None`.
    at_call: Option<u32>,
    remaining: u32,
    kind: FaultKind,
}

#[derive(Debug, Clone)]
struct SimServer {
    info: ServerInfo,
    user_data: String,
    polls: usize,
}

#[derive(Default)]
struct SimState {
    reservations: HashMap<String, AddressReservation>,
    /// Addresses held by something outside NodeForge.
    foreign: HashSet<(String, String)>,
    dns: HashMap<String, ProviderDnsRecord>,
    attachments: HashMap<String, ProviderAttachment>,
    servers: HashMap<String, SimServer>,
    calls: HashMap<CloudOp, u32>,
    faults: Vec<Fault>,
    progression: Vec<ServerStatus>,
}

/// In-memory provider for tests and dry runs.
pub struct SimulatedCloud {
    state: Mutex<SimState>,
    next_id: AtomicU64,
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCloud {
    pub fn new() -> Self {
        let state = SimState {
            progression: vec![
                ServerStatus::Pending,
                ServerStatus::Provisioning,
                ServerStatus::Running,
            ],
            ..SimState::default()
        };
        Self {
            state: Mutex::new(state),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        // Poisoning is ignored; the state is plain data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn new_id(&self, prefix: &str) -> String {
        format!("{prefix}-{:04}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // ── Fault injection ────────────────────────────────────────────

    /// Fail the `n`-th call (1-based, counted from creation) of `op`.
    pub fn fail_nth(&self, op: CloudOp, n: u32, kind: FaultKind) {
        self.lock().faults.push(Fault {
            op,
            at_call: Some(n),
            remaining: 1,
            kind,
        });
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail_next(&self, op: CloudOp, times: u32, kind: FaultKind) {
        self.lock().faults.push(Fault {
            op,
            at_call: None,
            remaining: times,
            kind,
        });
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Mark an address as taken by someone else.
    pub fn mark_in_use(&self, subnet: &str, address: &str) {
        self.lock()
            .foreign
            .insert((subnet.to_string(), address.to_string()));
    }

    /// Statuses a new server reports on successive polls. The last one sticks.
    pub fn set_server_progression(&self, progression: Vec<ServerStatus>) {
        self.lock().progression = progression;
    }

    /// Force the status of an existing server.
    pub fn set_server_status(&self, server_id: &str, status: ServerStatus) {
        if let Some(server) = self.lock().servers.get_mut(server_id) {
            server.info.status = status;
            server.polls = usize::MAX;
        }
    }

    // ── Inspection ─────────────────────────────────────────────────

    /// Number of calls made to `op`, failed ones included.
    pub fn calls(&self, op: CloudOp) -> u32 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn reservation_count(&self) -> usize {
        self.lock().reservations.len()
    }

    pub fn dns_record_count(&self) -> usize {
        self.lock().dns.len()
    }

    pub fn attachment_count(&self) -> usize {
        self.lock().attachments.len()
    }

    pub fn server_count(&self) -> usize {
        self.lock().servers.len()
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.lock().servers.keys().cloned().collect()
    }

    /// The initialization payload a server was created with.
    pub fn server_user_data(&self, server_id: &str) -> Option<String> {
        self.lock()
            .servers
            .get(server_id)
            .map(|s| s.user_data.clone())
    }

    /// Register the call and return the fault to apply, if any.
    fn enter(&self, op: CloudOp) -> Option<FaultKind> {
        let mut state = self.lock();
        let count = {
            let c = state.calls.entry(op).or_insert(0);
            *c += 1;
            *c
        };
        let idx = state.faults.iter().position(|f| {
            f.op == op && f.remaining > 0 && f.at_call.is_none_or(|n| n == count)
        })?;
        let fault = &mut state.faults[idx];
        fault.remaining -= 1;
        let kind = fault.kind;
        if fault.remaining == 0 {
            state.faults.remove(idx);
        }
        Some(kind)
    }

    /// Apply `f` to the state unless a fault stops the call first. A lost
    /// response applies `f` and then reports a timeout anyway.
    async fn run<T, F>(&self, op: CloudOp, f: F) -> CloudResult<T>
    where
        F: FnOnce(&mut SimState) -> CloudResult<T> + Send,
    {
        let lose_response = match self.enter(op) {
            None => false,
            Some(FaultKind::LostResponse) => true,
            Some(FaultKind::Transient) => {
                return Err(CloudError::Unavailable(format!(
                    "injected transient failure in {op}"
                )));
            }
            Some(FaultKind::Permanent) => {
                return Err(CloudError::InvalidRequest(format!(
                    "injected failure in {op}"
                )));
            }
            Some(FaultKind::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Err(CloudError::Timeout(format!("injected hang in {op}")));
            }
        };
        let result = f(&mut self.lock());
        match result {
            Ok(_) if lose_response => {
                debug!(%op, "simulated response lost after apply");
                Err(CloudError::Timeout(format!("response to {op} lost")))
            }
            other => other,
        }
    }
}

#[async_trait]
impl CloudProvider for SimulatedCloud {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn list_reserved_addresses(&self, subnet: &str) -> CloudResult<Vec<AddressReservation>> {
        self.run(CloudOp::ListReservedAddresses, |state| {
            let mut list: Vec<_> = state
                .reservations
                .values()
                .filter(|r| r.subnet == subnet)
                .cloned()
                .collect();
            list.extend(
                state
                    .foreign
                    .iter()
                    .filter(|(s, _)| s == subnet)
                    .map(|(s, a)| AddressReservation {
                        id: format!("foreign-{a}"),
                        subnet: s.clone(),
                        address: a.clone(),
                        name: "foreign".to_string(),
                    }),
            );
            Ok(list)
        })
        .await
    }

    async fn reserve_address(
        &self,
        subnet: &str,
        address: &str,
        name: &str,
    ) -> CloudResult<AddressReservation> {
        self.run(CloudOp::ReserveAddress, |state| {
            let taken = state.foreign.contains(&(subnet.to_string(), address.to_string()))
                || state
                    .reservations
                    .values()
                    .any(|r| r.subnet == subnet && r.address == address);
            if taken {
                return Err(CloudError::Conflict(format!(
                    "{address} is already reserved in {subnet}"
                )));
            }
            let id = self.new_id("rip");
            let reservation = AddressReservation {
                id: id.clone(),
                subnet: subnet.to_string(),
                address: address.to_string(),
                name: name.to_string(),
            };
            state.reservations.insert(id, reservation.clone());
            debug!(%subnet, %address, "simulated reservation created");
            Ok(reservation)
        })
        .await
    }

    async fn release_address(&self, subnet: &str, reservation_id: &str) -> CloudResult<()> {
        self.run(CloudOp::ReleaseAddress, |state| {
            match state.reservations.get(reservation_id) {
                Some(r) if r.subnet == subnet => {
                    state.reservations.remove(reservation_id);
                    Ok(())
                }
                _ => Err(CloudError::NotFound(format!(
                    "reservation {reservation_id} in {subnet}"
                ))),
            }
        })
        .await
    }

    async fn create_dns_record(&self, spec: &DnsRecordSpec) -> CloudResult<ProviderDnsRecord> {
        self.run(CloudOp::CreateDnsRecord, |state| {
            if state
                .dns
                .values()
                .any(|r| r.zone == spec.zone && r.name == spec.name)
            {
                return Err(CloudError::Conflict(format!("record {} exists", spec.name)));
            }
            let id = self.new_id("rec");
            let record = ProviderDnsRecord {
                id: id.clone(),
                zone: spec.zone.clone(),
                name: spec.name.clone(),
                record_type: spec.record_type.clone(),
                target: spec.target.clone(),
            };
            state.dns.insert(id, record.clone());
            Ok(record)
        })
        .await
    }

    async fn delete_dns_record(&self, zone: &str, record_id: &str) -> CloudResult<()> {
        self.run(CloudOp::DeleteDnsRecord, |state| match state.dns.get(record_id) {
            Some(r) if r.zone == zone => {
                state.dns.remove(record_id);
                Ok(())
            }
            _ => Err(CloudError::NotFound(format!("record {record_id} in {zone}"))),
        })
        .await
    }

    async fn find_dns_record(&self, zone: &str, name: &str) -> CloudResult<Option<ProviderDnsRecord>> {
        self.run(CloudOp::FindDnsRecord, |state| {
            Ok(state
                .dns
                .values()
                .find(|r| r.zone == zone && r.name == name)
                .cloned())
        })
        .await
    }

    async fn create_attachment(&self, spec: &AttachmentSpec) -> CloudResult<ProviderAttachment> {
        self.run(CloudOp::CreateAttachment, |state| {
            let id = self.new_id("vna");
            let attachment = ProviderAttachment {
                id: id.clone(),
                name: spec.name.clone(),
                subnet: spec.subnet.clone(),
                address: spec.address.clone(),
            };
            state.attachments.insert(id, attachment.clone());
            Ok(attachment)
        })
        .await
    }

    async fn delete_attachment(&self, attachment_id: &str) -> CloudResult<()> {
        self.run(CloudOp::DeleteAttachment, |state| {
            match state.attachments.remove(attachment_id) {
                Some(_) => Ok(()),
                None => Err(CloudError::NotFound(format!("attachment {attachment_id}"))),
            }
        })
        .await
    }

    async fn find_attachment(&self, subnet: &str, name: &str) -> CloudResult<Option<ProviderAttachment>> {
        self.run(CloudOp::FindAttachment, |state| {
            Ok(state
                .attachments
                .values()
                .find(|a| a.subnet == subnet && a.name == name)
                .cloned())
        })
        .await
    }

    async fn create_server(&self, spec: &ServerSpec) -> CloudResult<ServerInfo> {
        self.run(CloudOp::CreateServer, |state| {
            for attachment in &spec.attachments {
                if !state.attachments.contains_key(attachment) {
                    return Err(CloudError::InvalidRequest(format!(
                        "unknown attachment {attachment}"
                    )));
                }
            }
            let status = state
                .progression
                .first()
                .copied()
                .unwrap_or(ServerStatus::Pending);
            let id = self.new_id("srv");
            let info = ServerInfo {
                id: id.clone(),
                name: spec.name.clone(),
                status,
                status_reason: None,
            };
            state.servers.insert(
                id,
                SimServer {
                    info: info.clone(),
                    user_data: spec.user_data.clone(),
                    polls: 0,
                },
            );
            Ok(info)
        })
        .await
    }

    async fn get_server(&self, server_id: &str) -> CloudResult<ServerInfo> {
        self.run(CloudOp::GetServer, |state| {
            let server = state
                .servers
                .get_mut(server_id)
                .ok_or_else(|| CloudError::NotFound(format!("server {server_id}")))?;
            if server.polls != usize::MAX {
                server.polls += 1;
                let step = server.polls.min(state.progression.len().saturating_sub(1));
                if let Some(status) = state.progression.get(step) {
                    server.info.status = *status;
                }
            }
            Ok(server.info.clone())
        })
        .await
    }

    async fn find_server(&self, name: &str) -> CloudResult<Option<ServerInfo>> {
        self.run(CloudOp::FindServer, |state| {
            Ok(state
                .servers
                .values()
                .find(|s| s.info.name == name)
                .map(|s| s.info.clone()))
        })
        .await
    }

    async fn delete_server(&self, server_id: &str) -> CloudResult<()> {
        self.run(CloudOp::DeleteServer, |state| match state.servers.remove(server_id) {
            Some(_) => Ok(()),
            None => Err(CloudError::NotFound(format!("server {server_id}"))),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_reservation_conflicts() {
        let sim = SimulatedCloud::new();
        sim.reserve_address("s1", "10.0.0.1", "a").await.unwrap();
        let err = sim.reserve_address("s1", "10.0.0.1", "b").await.unwrap_err();
        assert!(err.is_conflict());
        sim.reserve_address("s2", "10.0.0.1", "c").await.unwrap();
    }

    #[tokio::test]
    async fn foreign_addresses_are_listed_and_taken() {
        let sim = SimulatedCloud::new();
        sim.mark_in_use("s1", "10.0.0.5");
        let listed = sim.list_reserved_addresses("s1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(sim.reserve_address("s1", "10.0.0.5", "x").await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn deleting_unknown_is_not_found() {
        let sim = SimulatedCloud::new();
        assert!(sim.delete_server("srv-x").await.unwrap_err().is_not_found());
        assert!(sim.delete_attachment("vna-x").await.unwrap_err().is_not_found());
        assert!(sim.delete_dns_record("z", "rec-x").await.unwrap_err().is_not_found());
        assert!(sim.release_address("s", "rip-x").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn server_walks_progression() {
        let sim = SimulatedCloud::new();
        let srv = sim
            .create_server(&ServerSpec {
                name: "n1".to_string(),
                profile: "p".to_string(),
                image: "i".to_string(),
                attachments: vec![],
                user_data: "#!ipxe".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(srv.status, ServerStatus::Pending);
        assert_eq!(sim.get_server(&srv.id).await.unwrap().status, ServerStatus::Provisioning);
        assert_eq!(sim.get_server(&srv.id).await.unwrap().status, ServerStatus::Running);
        assert_eq!(sim.get_server(&srv.id).await.unwrap().status, ServerStatus::Running);
        assert_eq!(sim.server_user_data(&srv.id).as_deref(), Some("#!ipxe"));
    }

    #[tokio::test]
    async fn nth_call_fault_fires_once() {
        let sim = SimulatedCloud::new();
        sim.fail_nth(CloudOp::CreateDnsRecord, 2, FaultKind::Permanent);

        let spec = |n: &str| DnsRecordSpec::a_record("z", n, "10.0.0.1", 60);
        assert!(sim.create_dns_record(&spec("a")).await.is_ok());
        assert!(sim.create_dns_record(&spec("b")).await.is_err());
        assert!(sim.create_dns_record(&spec("c")).await.is_ok());
        assert_eq!(sim.calls(CloudOp::CreateDnsRecord), 3);
        assert_eq!(sim.dns_record_count(), 2);
    }

    #[tokio::test]
    async fn lost_response_still_applies() {
        let sim = SimulatedCloud::new();
        sim.fail_next(CloudOp::CreateServer, 1, FaultKind::LostResponse);
        let spec = ServerSpec {
            name: "n1".to_string(),
            profile: "p".to_string(),
            image: "i".to_string(),
            attachments: vec![],
            user_data: String::new(),
        };
        let err = sim.create_server(&spec).await.unwrap_err();
        assert!(matches!(err, CloudError::Timeout(_)));
        assert_eq!(sim.server_count(), 1);
        let found = sim.find_server("n1").await.unwrap().unwrap();
        assert_eq!(found.name, "n1");
        assert!(sim.find_server("n2").await.unwrap().is_none());
    }
}
