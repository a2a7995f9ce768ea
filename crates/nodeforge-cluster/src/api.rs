//! Cluster management API.
//!
//! Formation talks to the management interface of one member, the entry
//! point. The HTTP implementation speaks JSON over plain HTTP/1.1.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClusterError, ClusterResult};

/// A member as the management API sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSpec {
    pub node: String,
    pub management_address: String,
    pub hypervisor_address: Option<String>,
    pub controller_vm_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateClusterRequest {
    pub name: String,
    pub vip: Option<String>,
    pub members: Vec<MemberSpec>,
}

/// Health as reported by the entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub up: bool,
    #[serde(default)]
    pub members_up: u32,
    #[serde(default)]
    pub message: Option<String>,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Form a new cluster, issued against the entry point.
    async fn create_cluster(&self, entry_point: &str, request: &CreateClusterRequest) -> ClusterResult<()>;

    /// Add a member to a formed cluster through the entry point.
    async fn join_cluster(&self, entry_point: &str, cluster: &str, member: &MemberSpec) -> ClusterResult<()>;

    async fn cluster_health(&self, entry_point: &str, cluster: &str) -> ClusterResult<ClusterHealth>;
}

/// [`ClusterApi`] over HTTP on the members' management port.
#[derive(Debug, Clone)]
pub struct HttpClusterApi {
    port: u16,
    timeout: Duration,
}

impl HttpClusterApi {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    async fn send(
        &self,
        method: http::Method,
        entry_point: &str,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> ClusterResult<Bytes> {
        let authority = format!("{entry_point}:{}", self.port);
        let uri = format!("http://{authority}{path}");

        let exchange = async {
            let stream = tokio::net::TcpStream::connect(&authority)
                .await
                .map_err(|e| ClusterError::Transport(format!("{authority}: {e}")))?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| ClusterError::Transport(e.to_string()))?;
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let request = http::Request::builder()
                .method(method)
                .uri(&uri)
                .header("host", &authority)
                .header("content-type", "application/json")
                .header("user-agent", "nodeforge-cluster/0.1")
                .body(Full::new(Bytes::from(body.unwrap_or_default())))
                .map_err(|e| ClusterError::InvalidRequest(e.to_string()))?;

            let response = sender
                .send_request(request)
                .await
                .map_err(|e| ClusterError::Transport(e.to_string()))?;
            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| ClusterError::Transport(e.to_string()))?
                .to_bytes();

            debug!(%uri, %status, "management API call");
            if !status.is_success() {
                return Err(ClusterError::Api {
                    status: status.as_u16(),
                    message: String::from_utf8_lossy(&bytes).into_owned(),
                });
            }
            Ok(bytes)
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ClusterError::Timeout(self.timeout.as_secs()))?
    }

    async fn post<T: Serialize + Sync>(&self, entry_point: &str, path: &str, body: &T) -> ClusterResult<()> {
        let body = serde_json::to_vec(body)?;
        self.send(http::Method::POST, entry_point, path, Some(body))
            .await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, entry_point: &str, path: &str) -> ClusterResult<T> {
        let bytes = self.send(http::Method::GET, entry_point, path, None).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl ClusterApi for HttpClusterApi {
    async fn create_cluster(&self, entry_point: &str, request: &CreateClusterRequest) -> ClusterResult<()> {
        self.post(entry_point, "/api/cluster/v1/clusters", request).await
    }

    async fn join_cluster(&self, entry_point: &str, cluster: &str, member: &MemberSpec) -> ClusterResult<()> {
        self.post(entry_point, &format!("/api/cluster/v1/clusters/{cluster}/nodes"), member)
            .await
    }

    async fn cluster_health(&self, entry_point: &str, cluster: &str) -> ClusterResult<ClusterHealth> {
        self.get(entry_point, &format!("/api/cluster/v1/clusters/{cluster}/health"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Read one request (headers and body) from `socket`.
    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw).into_owned();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0);
                if raw.len() >= end + 4 + length || n == 0 {
                    return text;
                }
            } else if n == 0 {
                return text;
            }
        }
    }

    async fn one_shot_server(response: String) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            request
        });
        (port, handle)
    }

    #[tokio::test]
    async fn health_is_decoded() {
        let body = r#"{"up":true,"members_up":3}"#;
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{body}",
            body.len()
        );
        let (port, server) = one_shot_server(response).await;
        let api = HttpClusterApi::new(port, Duration::from_secs(2));

        let health = api.cluster_health("127.0.0.1", "hci-a").await.unwrap();
        assert!(health.up);
        assert_eq!(health.members_up, 3);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/cluster/v1/clusters/hci-a/health"));
    }

    #[tokio::test]
    async fn create_posts_json() {
        let (port, server) =
            one_shot_server("HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\n\r\n".to_string()).await;
        let api = HttpClusterApi::new(port, Duration::from_secs(2));
        let request = CreateClusterRequest {
            name: "hci-a".to_string(),
            vip: Some("10.10.2.200".to_string()),
            members: vec![MemberSpec {
                node: "node-1".to_string(),
                management_address: "10.10.0.10".to_string(),
                hypervisor_address: None,
                controller_vm_address: None,
            }],
        };
        api.create_cluster("127.0.0.1", &request).await.unwrap();

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /api/cluster/v1/clusters "));
        assert!(raw.contains("\"vip\":\"10.10.2.200\""));
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let (port, _server) =
            one_shot_server("HTTP/1.1 409 Conflict\r\ncontent-length: 6\r\n\r\nexists".to_string()).await;
        let api = HttpClusterApi::new(port, Duration::from_secs(2));
        let member = MemberSpec {
            node: "node-4".to_string(),
            management_address: "10.10.0.13".to_string(),
            hypervisor_address: None,
            controller_vm_address: None,
        };
        let err = api.join_cluster("127.0.0.1", "hci-a", &member).await.unwrap_err();
        match err {
            ClusterError::Api { status, message } => {
                assert_eq!(status, 409);
                assert_eq!(message, "exists");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_entry_point() {
        let api = HttpClusterApi::new(1, Duration::from_millis(200));
        let err = api.cluster_health("127.0.0.1", "hci-a").await.unwrap_err();
        assert!(matches!(err, ClusterError::Transport(_) | ClusterError::Timeout(_)));
    }
}
