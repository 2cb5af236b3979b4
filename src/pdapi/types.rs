//! Wire types of the PD HTTP API.

use serde::{Deserialize, Serialize};

/// One entry of `GET /pd/health`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct MemberHealth {
    pub name: String,
    pub member_id: u64,
    #[serde(default)]
    pub client_urls: Vec<String>,
    pub health: bool,
}

/// Health of every PD member.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthInfo {
    pub healths: Vec<MemberHealth>,
}

/// A PD member as reported by `GET /pd/api/v1/members`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct MemberInfo {
    pub name: String,
    pub member_id: u64,
    #[serde(default)]
    pub peer_urls: Vec<String>,
    #[serde(default)]
    pub client_urls: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct MembersInfo {
    #[serde(default)]
    pub members: Vec<MemberInfo>,
    #[serde(default)]
    pub leader: Option<MemberInfo>,
    #[serde(default)]
    pub etcd_leader: Option<MemberInfo>,
}

/// `GET /pd/api/v1/cluster`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterInfo {
    pub id: u64,
    #[serde(default)]
    pub max_peer_count: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct MetaStore {
    pub id: u64,
    pub address: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub state_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct StoreStatus {
    #[serde(default)]
    pub leader_count: i32,
    #[serde(default)]
    pub region_count: i32,
    #[serde(default)]
    pub last_heartbeat_ts: String,
}

/// A store with its runtime status.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct StoreInfo {
    pub store: MetaStore,
    #[serde(default)]
    pub status: StoreStatus,
}

/// `GET /pd/api/v1/stores`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct StoresInfo {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub stores: Vec<StoreInfo>,
}

/// Body of `POST /pd/api/v1/schedulers` for the evict-leader scheduler.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct EvictLeaderRequest {
    pub name: String,
    pub store_id: u64,
}

impl EvictLeaderRequest {
    pub fn new(store_id: u64) -> Self {
        Self {
            name: "evict-leader-scheduler".to_string(),
            store_id,
        }
    }
}

/// Scheduler name PD assigns to an evict-leader scheduler.
pub fn evict_leader_scheduler_name(store_id: u64) -> String {
    format!("evict-leader-scheduler-{}", store_id)
}
