//! PD client over plain HTTP/1.1 with hyper.
//!
//! Each call opens a connection to the PD client service, sends one request
//! and reads the whole body. The call as a whole is bounded by the configured
//! timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{
    ClusterInfo, EvictLeaderRequest, HealthInfo, MemberHealth, MemberInfo, MembersInfo,
    PdApiError, PdClient, PdControl, Result, StoreInfo, StoresInfo, evict_leader_scheduler_name,
    pd_url,
};

/// HTTP client for one PD cluster
pub struct HttpPdClient {
    host: String,
    port: u16,
    timeout: Duration,
}

impl HttpPdClient {
    /// Client for a base URL of the form `http://host:port`.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let authority = url
            .strip_prefix("http://")
            .ok_or_else(|| PdApiError::Http(format!("unsupported PD url: {}", url)))?
            .trim_end_matches('/');
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|e| PdApiError::Http(format!("invalid port in {}: {}", url, e)))?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), 80),
        };
        Ok(Self::from_host(host, port, timeout))
    }

    pub fn from_host(host: String, port: u16, timeout: Duration) -> Self {
        Self {
            host,
            port,
            timeout,
        }
    }

    async fn send(&self, method: &str, path: &str, body: Option<Vec<u8>>) -> Result<(u16, Bytes)> {
        let call = self.send_inner(method, path, body);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PdApiError::Timeout(path.to_string())),
        }
    }

    async fn send_inner(&self, method: &str, path: &str, body: Option<Vec<u8>>) -> Result<(u16, Bytes)> {
        let authority = format!("{}:{}", self.host, self.port);
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| PdApiError::Connection(authority.clone(), e.to_string()))?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = http1::handshake(io)
            .await
            .map_err(|e| PdApiError::Http(e.to_string()))?;

        // The connection must be driven until the body has been read
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "PD connection closed");
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("Host", authority);
        if body.is_some() {
            builder = builder.header("Content-Type", "application/json");
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| PdApiError::Http(e.to_string()))?;

        let response = sender
            .send_request(req)
            .await
            .map_err(|e| PdApiError::Http(e.to_string()))?;
        let status = response.status().as_u16();

        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| PdApiError::Http(e.to_string()))?
            .to_bytes();

        trace!(method = method, path = path, status = status, "PD response");
        Ok((status, bytes))
    }

    async fn request(&self, method: &str, path: &str, body: Option<Vec<u8>>) -> Result<Bytes> {
        let (status, bytes) = self.send(method, path, body).await?;
        if !(200..300).contains(&status) {
            return Err(PdApiError::Status {
                path: path.to_string(),
                status,
                body: String::from_utf8_lossy(&bytes).trim().to_string(),
            });
        }
        Ok(bytes)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let bytes = self.request("GET", path, None).await?;
        serde_json::from_slice(&bytes).map_err(|e| PdApiError::Decode(path.to_string(), e.to_string()))
    }

    /// Deletes treat 404 as already done.
    async fn delete_idempotent(&self, path: &str) -> Result<()> {
        match self.request("DELETE", path, None).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl PdClient for HttpPdClient {
    async fn get_health(&self) -> Result<HealthInfo> {
        let healths: Vec<MemberHealth> = self.get_json("/pd/health").await?;
        Ok(HealthInfo { healths })
    }

    async fn get_members(&self) -> Result<MembersInfo> {
        self.get_json("/pd/api/v1/members").await
    }

    async fn get_leader(&self) -> Result<MemberInfo> {
        self.get_json("/pd/api/v1/leader").await
    }

    async fn transfer_leader(&self, name: &str) -> Result<()> {
        let path = format!("/pd/api/v1/leader/transfer/{}", name);
        self.request("POST", &path, None).await.map(|_| ())
    }

    async fn delete_member(&self, name: &str) -> Result<()> {
        self.delete_idempotent(&format!("/pd/api/v1/members/name/{}", name))
            .await
    }

    async fn delete_member_by_id(&self, id: u64) -> Result<()> {
        self.delete_idempotent(&format!("/pd/api/v1/members/id/{}", id))
            .await
    }

    async fn get_cluster(&self) -> Result<ClusterInfo> {
        self.get_json("/pd/api/v1/cluster").await
    }

    async fn get_stores(&self) -> Result<StoresInfo> {
        self.get_json("/pd/api/v1/stores").await
    }

    async fn get_tombstone_stores(&self) -> Result<StoresInfo> {
        self.get_json("/pd/api/v1/stores?state=2").await
    }

    async fn get_store(&self, id: u64) -> Result<StoreInfo> {
        self.get_json(&format!("/pd/api/v1/store/{}", id)).await
    }

    async fn delete_store(&self, id: u64) -> Result<()> {
        self.delete_idempotent(&format!("/pd/api/v1/store/{}", id))
            .await
    }

    async fn begin_evict_leader(&self, store_id: u64) -> Result<()> {
        let body = serde_json::to_vec(&EvictLeaderRequest::new(store_id))
            .map_err(|e| PdApiError::Http(e.to_string()))?;
        self.request("POST", "/pd/api/v1/schedulers", Some(body))
            .await
            .map(|_| ())
    }

    async fn end_evict_leader(&self, store_id: u64) -> Result<()> {
        let path = format!(
            "/pd/api/v1/schedulers/{}",
            evict_leader_scheduler_name(store_id)
        );
        self.delete_idempotent(&path).await
    }
}

const PD_CLIENT_PORT: u16 = 2379;

/// Caches one HTTP client per cluster.
pub struct HttpPdControl {
    timeout: Duration,
    clients: Mutex<HashMap<String, Arc<HttpPdClient>>>,
}

impl HttpPdControl {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl PdControl for HttpPdControl {
    fn client(&self, namespace: &str, name: &str) -> Arc<dyn PdClient> {
        let url = pd_url(namespace, name);
        let mut clients = match self.clients.lock() {
            Ok(clients) => clients,
            Err(poisoned) => poisoned.into_inner(),
        };
        clients
            .entry(url)
            .or_insert_with(|| {
                Arc::new(HttpPdClient::from_host(
                    format!("{}-pd.{}", name, namespace),
                    PD_CLIENT_PORT,
                    self.timeout,
                ))
            })
            .clone()
    }
}
