//! Provider calls with a per-call timeout and bounded retry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use nodeforge_core::{ProviderConfig, RetrySettings};
use tracing::{debug, info, warn};

use crate::error::{CloudError, CloudResult};
use crate::provider::*;

/// Retry configuration for provider operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries, for call sites that must fail fast.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.backoff_multiplier.max(1.0)).min(self.max_delay)
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_multiplier: settings.backoff_multiplier,
        }
    }
}

/// Shared handle to a provider. Cheap to clone.
#[derive(Clone)]
pub struct CloudClient {
    provider: Arc<dyn CloudProvider>,
    retry: RetryConfig,
    call_timeout: Duration,
}

impl CloudClient {
    pub fn new(provider: Arc<dyn CloudProvider>, retry: RetryConfig, call_timeout: Duration) -> Self {
        Self {
            provider,
            retry,
            call_timeout,
        }
    }

    pub fn from_config(provider: Arc<dyn CloudProvider>, config: &ProviderConfig) -> Self {
        Self::new(
            provider,
            RetryConfig::from(&config.retry),
            Duration::from_secs(config.call_timeout_secs),
        )
    }

    pub fn provider(&self) -> &Arc<dyn CloudProvider> {
        &self.provider
    }

    async fn attempt<T>(&self, op: CloudOp, fut: impl Future<Output = CloudResult<T>>) -> CloudResult<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CloudError::Timeout(format!(
                "{op} did not answer within {:?}",
                self.call_timeout
            ))),
        }
    }

    /// Run `f` under the call timeout, retrying transient failures.
    async fn call<T, F, Fut>(&self, op: CloudOp, mut f: F) -> CloudResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CloudResult<T>>,
    {
        let mut attempt = 1;
        let mut delay = self.retry.initial_delay;
        loop {
            match self.attempt(op, f()).await {
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    warn!(
                        provider = self.provider.name(),
                        %op,
                        attempt,
                        error = %e,
                        "transient provider error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = self.retry.next_delay(delay);
                    attempt += 1;
                }
                Err(e) => {
                    debug!(provider = self.provider.name(), %op, attempt, error = %e, "provider call failed");
                    return Err(e);
                }
                Ok(value) => return Ok(value),
            }
        }
    }

    /// Like [`call`](Self::call) for operations that create something.
    ///
    /// A create that failed ambiguously may exist upstream. Before trying
    /// again, `lookup` searches for it by name and an existing resource is
    /// adopted instead of created twice. If the lookup itself fails the
    /// original error is returned and nothing is retried.
    async fn create<T, F, Fut, L, LFut>(&self, op: CloudOp, mut f: F, lookup: L) -> CloudResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CloudResult<T>>,
        L: Fn() -> LFut,
        LFut: Future<Output = CloudResult<Option<T>>>,
    {
        let mut attempt = 1;
        let mut delay = self.retry.initial_delay;
        loop {
            let e = match self.attempt(op, f()).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if e.is_ambiguous() {
                let lookup_op = op.lookup().unwrap_or(op);
                match self.call(lookup_op, &lookup).await {
                    Ok(Some(existing)) => {
                        info!(
                            provider = self.provider.name(),
                            %op,
                            attempt,
                            "unanswered create took effect upstream, adopting it"
                        );
                        return Ok(existing);
                    }
                    Ok(None) => {}
                    Err(lookup_err) => {
                        warn!(
                            provider = self.provider.name(),
                            %op,
                            error = %lookup_err,
                            "could not check for an unanswered create, not retrying"
                        );
                        return Err(e);
                    }
                }
            }
            if !e.is_transient() || attempt >= self.retry.max_attempts {
                debug!(provider = self.provider.name(), %op, attempt, error = %e, "provider call failed");
                return Err(e);
            }
            warn!(
                provider = self.provider.name(),
                %op,
                attempt,
                error = %e,
                "transient provider error, retrying"
            );
            tokio::time::sleep(delay).await;
            delay = self.retry.next_delay(delay);
            attempt += 1;
        }
    }

    pub async fn list_reserved_addresses(&self, subnet: &str) -> CloudResult<Vec<AddressReservation>> {
        self.call(CloudOp::ListReservedAddresses, || {
            self.provider.list_reserved_addresses(subnet)
        })
        .await
    }

    pub async fn reserve_address(
        &self,
        subnet: &str,
        address: &str,
        name: &str,
    ) -> CloudResult<AddressReservation> {
        self.create(
            CloudOp::ReserveAddress,
            || self.provider.reserve_address(subnet, address, name),
            || async move {
                self.provider
                    .list_reserved_addresses(subnet)
                    .await
                    .map(|held| held.into_iter().find(|r| r.address == address && r.name == name))
            },
        )
        .await
    }

    pub async fn release_address(&self, subnet: &str, reservation_id: &str) -> CloudResult<()> {
        self.call(CloudOp::ReleaseAddress, || {
            self.provider.release_address(subnet, reservation_id)
        })
        .await
    }

    pub async fn create_dns_record(&self, spec: &DnsRecordSpec) -> CloudResult<ProviderDnsRecord> {
        self.create(
            CloudOp::CreateDnsRecord,
            || self.provider.create_dns_record(spec),
            || async move {
                self.provider
                    .find_dns_record(&spec.zone, &spec.name)
                    .await
                    .map(|found| found.filter(|r| r.target == spec.target))
            },
        )
        .await
    }

    pub async fn delete_dns_record(&self, zone: &str, record_id: &str) -> CloudResult<()> {
        self.call(CloudOp::DeleteDnsRecord, || {
            self.provider.delete_dns_record(zone, record_id)
        })
        .await
    }

    pub async fn find_dns_record(&self, zone: &str, name: &str) -> CloudResult<Option<ProviderDnsRecord>> {
        self.call(CloudOp::FindDnsRecord, || self.provider.find_dns_record(zone, name))
            .await
    }

    pub async fn create_attachment(&self, spec: &AttachmentSpec) -> CloudResult<ProviderAttachment> {
        self.create(
            CloudOp::CreateAttachment,
            || self.provider.create_attachment(spec),
            || self.provider.find_attachment(&spec.subnet, &spec.name),
        )
        .await
    }

    pub async fn delete_attachment(&self, attachment_id: &str) -> CloudResult<()> {
        self.call(CloudOp::DeleteAttachment, || {
            self.provider.delete_attachment(attachment_id)
        })
        .await
    }

    pub async fn create_server(&self, spec: &ServerSpec) -> CloudResult<ServerInfo> {
        self.create(
            CloudOp::CreateServer,
            || self.provider.create_server(spec),
            || self.provider.find_server(&spec.name),
        )
        .await
    }

    pub async fn get_server(&self, server_id: &str) -> CloudResult<ServerInfo> {
        self.call(CloudOp::GetServer, || self.provider.get_server(server_id))
            .await
    }

    pub async fn delete_server(&self, server_id: &str) -> CloudResult<()> {
        self.call(CloudOp::DeleteServer, || self.provider.delete_server(server_id))
            .await
    }
}
