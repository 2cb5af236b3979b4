//! In-memory PD for tests.
//!
//! Keeps members and stores, applies the mutating calls the way PD would,
//! records every call and can fail chosen methods.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    ClusterInfo, HealthInfo, MemberHealth, MemberInfo, MembersInfo, MetaStore, PdApiError,
    PdClient, PdControl, Result, StoreInfo, StoreStatus, StoresInfo,
};

/// A call made against the fake.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PdAction {
    GetHealth,
    GetMembers,
    GetLeader,
    TransferLeader(String),
    DeleteMember(String),
    DeleteMemberById(u64),
    GetCluster,
    GetStores,
    GetTombstoneStores,
    GetStore(u64),
    DeleteStore(u64),
    BeginEvictLeader(u64),
    EndEvictLeader(u64),
}

/// Method selector for error injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PdMethod {
    GetHealth,
    GetMembers,
    GetLeader,
    TransferLeader,
    DeleteMember,
    GetCluster,
    GetStores,
    GetTombstoneStores,
    GetStore,
    DeleteStore,
    BeginEvictLeader,
    EndEvictLeader,
}

impl PdAction {
    fn method(&self) -> PdMethod {
        match self {
            PdAction::GetHealth => PdMethod::GetHealth,
            PdAction::GetMembers => PdMethod::GetMembers,
            PdAction::GetLeader => PdMethod::GetLeader,
            PdAction::TransferLeader(_) => PdMethod::TransferLeader,
            PdAction::DeleteMember(_) | PdAction::DeleteMemberById(_) => PdMethod::DeleteMember,
            PdAction::GetCluster => PdMethod::GetCluster,
            PdAction::GetStores => PdMethod::GetStores,
            PdAction::GetTombstoneStores => PdMethod::GetTombstoneStores,
            PdAction::GetStore(_) => PdMethod::GetStore,
            PdAction::DeleteStore(_) => PdMethod::DeleteStore,
            PdAction::BeginEvictLeader(_) => PdMethod::BeginEvictLeader,
            PdAction::EndEvictLeader(_) => PdMethod::EndEvictLeader,
        }
    }
}

#[derive(Default)]
struct FakePdState {
    cluster_id: u64,
    health: Vec<MemberHealth>,
    members: Vec<MemberInfo>,
    leader: Option<String>,
    stores: Vec<StoreInfo>,
    evicting: BTreeSet<u64>,
    failures: HashMap<PdMethod, String>,
    calls: Vec<PdAction>,
}

/// In-memory PD cluster.
#[derive(Default)]
pub struct FakePdClient {
    state: Mutex<FakePdState>,
}

impl FakePdClient {
    pub fn new(cluster_id: u64) -> Self {
        let client = Self::default();
        client.lock().cluster_id = cluster_id;
        client
    }

    fn lock(&self) -> MutexGuard<'_, FakePdState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record the call and return the injected failure, if any.
    fn begin(&self, action: PdAction) -> Result<MutexGuard<'_, FakePdState>> {
        let mut state = self.lock();
        let method = action.method();
        state.calls.push(action);
        if let Some(message) = state.failures.get(&method) {
            return Err(PdApiError::Http(message.clone()));
        }
        Ok(state)
    }

    /// Fail every call of `method` until cleared.
    pub fn fail(&self, method: PdMethod, message: &str) {
        self.lock().failures.insert(method, message.to_string());
    }

    pub fn clear_failure(&self, method: PdMethod) {
        self.lock().failures.remove(&method);
    }

    pub fn calls(&self) -> Vec<PdAction> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Add a member reachable at `{name}.{peer_service}:2379`.
    pub fn add_member(&self, name: &str, id: u64, healthy: bool) {
        let mut state = self.lock();
        let client_urls = vec![format!("http://{}:2379", name)];
        state.members.push(MemberInfo {
            name: name.to_string(),
            member_id: id,
            peer_urls: vec![format!("http://{}:2380", name)],
            client_urls: client_urls.clone(),
        });
        state.health.push(MemberHealth {
            name: name.to_string(),
            member_id: id,
            client_urls,
            health: healthy,
        });
        if state.leader.is_none() {
            state.leader = Some(name.to_string());
        }
    }

    pub fn set_member_health(&self, name: &str, healthy: bool) {
        let mut state = self.lock();
        for health in state.health.iter_mut().filter(|h| h.name == name) {
            health.health = healthy;
        }
    }

    pub fn set_leader(&self, name: &str) {
        self.lock().leader = Some(name.to_string());
    }

    pub fn leader(&self) -> Option<String> {
        self.lock().leader.clone()
    }

    pub fn member_names(&self) -> Vec<String> {
        self.lock().members.iter().map(|m| m.name.clone()).collect()
    }

    pub fn add_store(&self, id: u64, address: &str, state_name: &str) {
        self.lock().stores.push(StoreInfo {
            store: MetaStore {
                id,
                address: address.to_string(),
                version: String::new(),
                state_name: state_name.to_string(),
            },
            status: StoreStatus {
                leader_count: 1,
                region_count: 1,
                last_heartbeat_ts: "2020-05-01T10:00:00Z".to_string(),
            },
        });
    }

    pub fn set_store_state(&self, id: u64, state_name: &str) {
        let mut state = self.lock();
        for store in state.stores.iter_mut().filter(|s| s.store.id == id) {
            store.store.state_name = state_name.to_string();
        }
    }

    pub fn set_store_leader_count(&self, id: u64, leader_count: i32) {
        let mut state = self.lock();
        for store in state.stores.iter_mut().filter(|s| s.store.id == id) {
            store.status.leader_count = leader_count;
        }
    }

    pub fn set_store_heartbeat(&self, id: u64, heartbeat: &str) {
        let mut state = self.lock();
        for store in state.stores.iter_mut().filter(|s| s.store.id == id) {
            store.status.last_heartbeat_ts = heartbeat.to_string();
        }
    }

    pub fn store_state(&self, id: u64) -> Option<String> {
        self.lock()
            .stores
            .iter()
            .find(|s| s.store.id == id)
            .map(|s| s.store.state_name.clone())
    }

    pub fn evicting(&self) -> BTreeSet<u64> {
        self.lock().evicting.clone()
    }

    fn remove_member(state: &mut FakePdState, matches: impl Fn(&MemberInfo) -> bool) {
        let removed: Vec<String> = state
            .members
            .iter()
            .filter(|m| matches(m))
            .map(|m| m.name.clone())
            .collect();
        state.members.retain(|m| !matches(m));
        state.health.retain(|h| !removed.contains(&h.name));
        if state
            .leader
            .as_ref()
            .is_some_and(|leader| removed.contains(leader))
        {
            state.leader = state.members.first().map(|m| m.name.clone());
        }
    }
}

#[async_trait]
impl PdClient for FakePdClient {
    async fn get_health(&self) -> Result<HealthInfo> {
        let state = self.begin(PdAction::GetHealth)?;
        Ok(HealthInfo {
            healths: state.health.clone(),
        })
    }

    async fn get_members(&self) -> Result<MembersInfo> {
        let state = self.begin(PdAction::GetMembers)?;
        let leader = state
            .leader
            .as_ref()
            .and_then(|name| state.members.iter().find(|m| &m.name == name).cloned());
        Ok(MembersInfo {
            members: state.members.clone(),
            leader: leader.clone(),
            etcd_leader: leader,
        })
    }

    async fn get_leader(&self) -> Result<MemberInfo> {
        let state = self.begin(PdAction::GetLeader)?;
        state
            .leader
            .as_ref()
            .and_then(|name| state.members.iter().find(|m| &m.name == name).cloned())
            .ok_or_else(|| PdApiError::Status {
                path: "/pd/api/v1/leader".to_string(),
                status: 500,
                body: "no leader".to_string(),
            })
    }

    async fn transfer_leader(&self, name: &str) -> Result<()> {
        let mut state = self.begin(PdAction::TransferLeader(name.to_string()))?;
        if !state.members.iter().any(|m| m.name == name) {
            return Err(PdApiError::Status {
                path: format!("/pd/api/v1/leader/transfer/{}", name),
                status: 500,
                body: "member not found".to_string(),
            });
        }
        state.leader = Some(name.to_string());
        Ok(())
    }

    async fn delete_member(&self, name: &str) -> Result<()> {
        let mut state = self.begin(PdAction::DeleteMember(name.to_string()))?;
        Self::remove_member(&mut state, |m| m.name == name);
        Ok(())
    }

    async fn delete_member_by_id(&self, id: u64) -> Result<()> {
        let mut state = self.begin(PdAction::DeleteMemberById(id))?;
        Self::remove_member(&mut state, |m| m.member_id == id);
        Ok(())
    }

    async fn get_cluster(&self) -> Result<ClusterInfo> {
        let state = self.begin(PdAction::GetCluster)?;
        Ok(ClusterInfo {
            id: state.cluster_id,
            max_peer_count: 3,
        })
    }

    async fn get_stores(&self) -> Result<StoresInfo> {
        let state = self.begin(PdAction::GetStores)?;
        let stores: Vec<StoreInfo> = state
            .stores
            .iter()
            .filter(|s| s.store.state_name != "Tombstone")
            .cloned()
            .collect();
        Ok(StoresInfo {
            count: stores.len(),
            stores,
        })
    }

    async fn get_tombstone_stores(&self) -> Result<StoresInfo> {
        let state = self.begin(PdAction::GetTombstoneStores)?;
        let stores: Vec<StoreInfo> = state
            .stores
            .iter()
            .filter(|s| s.store.state_name == "Tombstone")
            .cloned()
            .collect();
        Ok(StoresInfo {
            count: stores.len(),
            stores,
        })
    }

    async fn get_store(&self, id: u64) -> Result<StoreInfo> {
        let state = self.begin(PdAction::GetStore(id))?;
        state
            .stores
            .iter()
            .find(|s| s.store.id == id)
            .cloned()
            .ok_or_else(|| PdApiError::Status {
                path: format!("/pd/api/v1/store/{}", id),
                status: 404,
                body: "store not found".to_string(),
            })
    }

    async fn delete_store(&self, id: u64) -> Result<()> {
        let mut state = self.begin(PdAction::DeleteStore(id))?;
        for store in state.stores.iter_mut().filter(|s| s.store.id == id) {
            if store.store.state_name != "Tombstone" {
                store.store.state_name = "Offline".to_string();
            }
        }
        Ok(())
    }

    async fn begin_evict_leader(&self, store_id: u64) -> Result<()> {
        let mut state = self.begin(PdAction::BeginEvictLeader(store_id))?;
        state.evicting.insert(store_id);
        for store in state.stores.iter_mut().filter(|s| s.store.id == store_id) {
            store.status.leader_count = 0;
        }
        Ok(())
    }

    async fn end_evict_leader(&self, store_id: u64) -> Result<()> {
        let mut state = self.begin(PdAction::EndEvictLeader(store_id))?;
        state.evicting.remove(&store_id);
        Ok(())
    }
}

/// Hands out one shared fake per cluster.
#[derive(Default)]
pub struct FakePdControl {
    clients: Mutex<HashMap<String, Arc<FakePdClient>>>,
}

impl FakePdControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// The fake backing a cluster, created on first use.
    pub fn pd_client(&self, namespace: &str, name: &str) -> Arc<FakePdClient> {
        let mut clients = match self.clients.lock() {
            Ok(clients) => clients,
            Err(poisoned) => poisoned.into_inner(),
        };
        clients
            .entry(format!("{}/{}", namespace, name))
            .or_insert_with(|| Arc::new(FakePdClient::new(6800)))
            .clone()
    }
}

impl PdControl for FakePdControl {
    fn client(&self, namespace: &str, name: &str) -> Arc<dyn PdClient> {
        self.pd_client(namespace, name)
    }
}
