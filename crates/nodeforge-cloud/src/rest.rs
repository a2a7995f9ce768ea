//! JSON-over-HTTPS provider client.
//!
//! Uses bearer-token authentication. Every request carries the configured
//! region as a query parameter. URL builders are public so the cleanup
//! script generator can emit the same endpoints.

use async_trait::async_trait;
use nodeforge_core::ProviderConfig;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CloudError, CloudResult};
use crate::provider::*;

pub fn reserved_addresses_url(base: &str, subnet: &str) -> String {
    format!("{}/subnets/{subnet}/reserved_ips", base.trim_end_matches('/'))
}

pub fn reserved_address_url(base: &str, subnet: &str, reservation_id: &str) -> String {
    format!("{}/{reservation_id}", reserved_addresses_url(base, subnet))
}

pub fn dns_records_url(base: &str, zone: &str) -> String {
    format!("{}/dns_zones/{zone}/records", base.trim_end_matches('/'))
}

pub fn dns_record_url(base: &str, zone: &str, record_id: &str) -> String {
    format!("{}/{record_id}", dns_records_url(base, zone))
}

pub fn attachments_url(base: &str) -> String {
    format!("{}/network_attachments", base.trim_end_matches('/'))
}

pub fn attachment_url(base: &str, attachment_id: &str) -> String {
    format!("{}/{attachment_id}", attachments_url(base))
}

pub fn servers_url(base: &str) -> String {
    format!("{}/bare_metal_servers", base.trim_end_matches('/'))
}

pub fn server_url(base: &str, server_id: &str) -> String {
    format!("{}/{server_id}", servers_url(base))
}

/// Provider backed by the infrastructure REST API.
pub struct RestCloudProvider {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    region: String,
}

#[derive(Debug, Deserialize)]
struct ReservedIpList {
    reserved_ips: Vec<AddressReservation>,
}

#[derive(Debug, Deserialize)]
struct DnsRecordList {
    records: Vec<ProviderDnsRecord>,
}

#[derive(Debug, Deserialize)]
struct AttachmentList {
    network_attachments: Vec<ProviderAttachment>,
}

#[derive(Debug, Deserialize)]
struct ServerList {
    bare_metal_servers: Vec<ServerResponse>,
}

#[derive(Debug, Serialize)]
struct ReserveRequest<'a> {
    address: &'a str,
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct ServerResponse {
    id: String,
    name: String,
    status: String,
    status_reason: Option<String>,
}

impl From<ServerResponse> for ServerInfo {
    fn from(r: ServerResponse) -> Self {
        ServerInfo {
            id: r.id,
            name: r.name,
            status: ServerStatus::from_provider(&r.status),
            status_reason: r.status_reason,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    message: String,
}

impl RestCloudProvider {
    pub fn new(config: &ProviderConfig) -> CloudResult<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(CloudError::InvalidConfig(
                "provider.endpoint is required".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| CloudError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            region: config.region.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.query(&[("region", self.region.as_str())]);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> CloudResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.errors.into_iter().next().map(|e| e.message))
            .unwrap_or(body);
        if is_gone(status) {
            return Err(CloudError::NotFound(message));
        }
        Err(CloudError::from_status(status.as_u16(), message))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> CloudResult<T> {
        let response = self.authorize(request).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    async fn send_empty(&self, request: RequestBuilder) -> CloudResult<()> {
        let response = self.authorize(request).send().await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl CloudProvider for RestCloudProvider {
    fn name(&self) -> &str {
        "rest"
    }

    async fn list_reserved_addresses(&self, subnet: &str) -> CloudResult<Vec<AddressReservation>> {
        let url = reserved_addresses_url(&self.endpoint, subnet);
        let list: ReservedIpList = self.send_json(self.client.get(&url)).await?;
        Ok(list
            .reserved_ips
            .into_iter()
            .map(|mut r| {
                r.subnet = subnet.to_string();
                r
            })
            .collect())
    }

    async fn reserve_address(
        &self,
        subnet: &str,
        address: &str,
        name: &str,
    ) -> CloudResult<AddressReservation> {
        let url = reserved_addresses_url(&self.endpoint, subnet);
        let body = ReserveRequest { address, name };
        let mut reservation: AddressReservation =
            self.send_json(self.client.post(&url).json(&body)).await?;
        reservation.subnet = subnet.to_string();
        debug!(%subnet, %address, id = %reservation.id, "address reserved");
        Ok(reservation)
    }

    async fn release_address(&self, subnet: &str, reservation_id: &str) -> CloudResult<()> {
        let url = reserved_address_url(&self.endpoint, subnet, reservation_id);
        self.send_empty(self.client.delete(&url)).await
    }

    async fn create_dns_record(&self, spec: &DnsRecordSpec) -> CloudResult<ProviderDnsRecord> {
        let url = dns_records_url(&self.endpoint, &spec.zone);
        self.send_json(self.client.post(&url).json(spec)).await
    }

    async fn delete_dns_record(&self, zone: &str, record_id: &str) -> CloudResult<()> {
        let url = dns_record_url(&self.endpoint, zone, record_id);
        self.send_empty(self.client.delete(&url)).await
    }

    async fn find_dns_record(&self, zone: &str, name: &str) -> CloudResult<Option<ProviderDnsRecord>> {
        let url = dns_records_url(&self.endpoint, zone);
        let list: DnsRecordList = self
            .send_json(self.client.get(&url).query(&[("name", name)]))
            .await?;
        Ok(list.records.into_iter().find(|r| r.name == name))
    }

    async fn create_attachment(&self, spec: &AttachmentSpec) -> CloudResult<ProviderAttachment> {
        let url = attachments_url(&self.endpoint);
        self.send_json(self.client.post(&url).json(spec)).await
    }

    async fn delete_attachment(&self, attachment_id: &str) -> CloudResult<()> {
        let url = attachment_url(&self.endpoint, attachment_id);
        self.send_empty(self.client.delete(&url)).await
    }

    async fn find_attachment(&self, subnet: &str, name: &str) -> CloudResult<Option<ProviderAttachment>> {
        let url = attachments_url(&self.endpoint);
        let list: AttachmentList = self
            .send_json(self.client.get(&url).query(&[("name", name), ("subnet", subnet)]))
            .await?;
        Ok(list
            .network_attachments
            .into_iter()
            .find(|a| a.name == name && a.subnet == subnet))
    }

    async fn create_server(&self, spec: &ServerSpec) -> CloudResult<ServerInfo> {
        let url = servers_url(&self.endpoint);
        let response: ServerResponse = self.send_json(self.client.post(&url).json(spec)).await?;
        Ok(response.into())
    }

    async fn get_server(&self, server_id: &str) -> CloudResult<ServerInfo> {
        let url = server_url(&self.endpoint, server_id);
        let response: ServerResponse = self.send_json(self.client.get(&url)).await?;
        Ok(response.into())
    }

    async fn find_server(&self, name: &str) -> CloudResult<Option<ServerInfo>> {
        let url = servers_url(&self.endpoint);
        let list: ServerList = self
            .send_json(self.client.get(&url).query(&[("name", name)]))
            .await?;
        Ok(list
            .bare_metal_servers
            .into_iter()
            .find(|s| s.name == name)
            .map(ServerInfo::from))
    }

    async fn delete_server(&self, server_id: &str) -> CloudResult<()> {
        let url = server_url(&self.endpoint, server_id);
        match self.send_empty(self.client.delete(&url)).await {
            // Deletion already in progress upstream.
            Err(CloudError::Conflict(_)) => Ok(()),
            other => other,
        }
    }
}

/// Whether a status code means "resource is gone".
pub fn is_gone(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND || status == StatusCode::GONE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_normalized() {
        let base = "https://iaas.example.net/v1/";
        assert_eq!(
            reserved_address_url(base, "subnet-1", "rip-9"),
            "https://iaas.example.net/v1/subnets/subnet-1/reserved_ips/rip-9"
        );
        assert_eq!(
            dns_record_url(base, "zone-a", "rec-1"),
            "https://iaas.example.net/v1/dns_zones/zone-a/records/rec-1"
        );
        assert_eq!(
            server_url(base, "srv-1"),
            "https://iaas.example.net/v1/bare_metal_servers/srv-1"
        );
    }

    #[test]
    fn rest_provider_needs_endpoint() {
        let config = ProviderConfig {
            endpoint: " ".to_string(),
            ..ProviderConfig::default()
        };
        assert!(matches!(
            RestCloudProvider::new(&config),
            Err(CloudError::InvalidConfig(_))
        ));
    }

    #[test]
    fn gone_statuses() {
        assert!(is_gone(StatusCode::NOT_FOUND));
        assert!(is_gone(StatusCode::GONE));
        assert!(!is_gone(StatusCode::CONFLICT));
    }
}
