//! Client for the PD HTTP API.
//!
//! `PdClient` covers the calls the member managers need; `PdControl` hands
//! out a client per cluster. The HTTP implementation lives in [`http`], an
//! in-memory one in [`fake`].

pub mod fake;
pub mod http;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use types::*;

/// Errors from PD API calls
#[derive(Error, Debug)]
pub enum PdApiError {
    #[error("connection to {0} failed: {1}")]
    Connection(String, String),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("{path} returned HTTP {status}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },

    #[error("failed to decode response from {0}: {1}")]
    Decode(String, String),
}

impl PdApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PdApiError::Status { status: 404, .. })
    }
}

pub type Result<T> = std::result::Result<T, PdApiError>;

/// Operations against one PD cluster.
#[async_trait]
pub trait PdClient: Send + Sync {
    /// `GET /pd/health`
    async fn get_health(&self) -> Result<HealthInfo>;
    /// `GET /pd/api/v1/members`
    async fn get_members(&self) -> Result<MembersInfo>;
    /// `GET /pd/api/v1/leader`
    async fn get_leader(&self) -> Result<MemberInfo>;
    /// `POST /pd/api/v1/leader/transfer/{name}`
    async fn transfer_leader(&self, name: &str) -> Result<()>;
    /// `DELETE /pd/api/v1/members/name/{name}`; a missing member is not an error
    async fn delete_member(&self, name: &str) -> Result<()>;
    /// `DELETE /pd/api/v1/members/id/{id}`; a missing member is not an error
    async fn delete_member_by_id(&self, id: u64) -> Result<()>;
    /// `GET /pd/api/v1/cluster`
    async fn get_cluster(&self) -> Result<ClusterInfo>;
    /// `GET /pd/api/v1/stores`
    async fn get_stores(&self) -> Result<StoresInfo>;
    /// `GET /pd/api/v1/stores?state=2`
    async fn get_tombstone_stores(&self) -> Result<StoresInfo>;
    /// `GET /pd/api/v1/store/{id}`
    async fn get_store(&self, id: u64) -> Result<StoreInfo>;
    /// `DELETE /pd/api/v1/store/{id}`: start taking the store offline
    async fn delete_store(&self, id: u64) -> Result<()>;
    /// `POST /pd/api/v1/schedulers` with an evict-leader scheduler
    async fn begin_evict_leader(&self, store_id: u64) -> Result<()>;
    /// `DELETE /pd/api/v1/schedulers/evict-leader-scheduler-{id}`
    async fn end_evict_leader(&self, store_id: u64) -> Result<()>;
}

/// Hands out the PD client of a cluster.
pub trait PdControl: Send + Sync {
    fn client(&self, namespace: &str, name: &str) -> Arc<dyn PdClient>;
}

/// Base URL of a cluster's PD client service.
pub fn pd_url(namespace: &str, name: &str) -> String {
    format!("http://{}-pd.{}:2379", name, namespace)
}
