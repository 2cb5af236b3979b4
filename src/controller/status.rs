//! Reading clusters from the local cache and persisting their status.
//!
//! Status writes go through [`ClusterApi::replace_status`], which carries the
//! object's resourceVersion so a concurrent writer surfaces as a conflict.
//! [`update_cluster_status`] retries those conflicts against the latest
//! cached copy.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use kube::api::PostParams;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, warn};

use crate::control::fake::RequestTracker;
use crate::controller::error::{Error, Result};
use crate::controller::events::FIELD_MANAGER;
use crate::crd::{TikvCluster, TikvClusterStatus};

/// Attempts made by [`update_cluster_status`] before giving up.
pub const STATUS_UPDATE_ATTEMPTS: usize = 5;

/// Writes to the TikvCluster API.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Replace the status subresource of `tc`.
    async fn replace_status(&self, tc: &TikvCluster) -> Result<TikvCluster>;
}

/// Read access to cached clusters. Returned objects are owned copies.
pub trait ClusterLister: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<TikvCluster>;
    fn list(&self) -> Vec<TikvCluster>;
}

/// Persist `status` on `tc`, refetching from `lister` on conflicts.
pub async fn update_cluster_status(
    api: &dyn ClusterApi,
    lister: &dyn ClusterLister,
    mut tc: TikvCluster,
    status: &TikvClusterStatus,
) -> Result<TikvCluster> {
    let namespace = tc.namespace().unwrap_or_default();
    let name = tc.name_any();
    let mut last_error = None;

    for attempt in 1..=STATUS_UPDATE_ATTEMPTS {
        tc.status = Some(status.clone());
        match api.replace_status(&tc).await {
            Ok(updated) => {
                debug!(namespace = %namespace, name = %name, attempt, "Updated TikvCluster status");
                return Ok(updated);
            }
            Err(e) if e.is_conflict() => {
                debug!(namespace = %namespace, name = %name, attempt, error = %e, "Status update conflicted, refetching");
                match lister.get(&namespace, &name) {
                    Some(latest) => tc = latest,
                    None => warn!(namespace = %namespace, name = %name, "TikvCluster missing from cache during status update"),
                }
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        Error::Conflict(format!("status update of {}/{} kept conflicting", namespace, name))
    }))
}

/// Status writes through the API server.
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn replace_status(&self, tc: &TikvCluster) -> Result<TikvCluster> {
        let namespace = tc.namespace().unwrap_or_default();
        let api: Api<TikvCluster> = Api::namespaced(self.client.clone(), &namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let body = serde_json::to_vec(tc)?;
        api.replace_status(&tc.name_any(), &params, body)
            .await
            .map_err(|e| match e {
                kube::Error::Api(ref resp) if resp.code == 409 => {
                    Error::Conflict(resp.message.clone())
                }
                other => Error::Kube(other),
            })
    }
}

/// Lister over a reflector store.
#[derive(Clone)]
pub struct StoreLister {
    store: Store<TikvCluster>,
}

impl StoreLister {
    pub fn new(store: Store<TikvCluster>) -> Self {
        Self { store }
    }
}

impl ClusterLister for StoreLister {
    fn get(&self, namespace: &str, name: &str) -> Option<TikvCluster> {
        self.store
            .get(&ObjectRef::new(name).within(namespace))
            .map(|tc| (*tc).clone())
    }

    fn list(&self) -> Vec<TikvCluster> {
        self.store.state().iter().map(|tc| (**tc).clone()).collect()
    }
}

/// In-memory cluster store serving as both API and lister.
#[derive(Default)]
pub struct FakeClusterStore {
    clusters: Mutex<BTreeMap<(String, String), TikvCluster>>,
    status_writes: AtomicUsize,
    pub update_tracker: RequestTracker,
}

impl FakeClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), TikvCluster>> {
        match self.clusters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Store `tc`, bumping its resourceVersion as the API server would.
    pub fn insert(&self, mut tc: TikvCluster) {
        let key = (tc.namespace().unwrap_or_default(), tc.name_any());
        let mut clusters = self.lock();
        let next = clusters
            .get(&key)
            .and_then(|c| c.metadata.resource_version.as_deref())
            .and_then(|rv| rv.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        tc.metadata.resource_version = Some(next.to_string());
        if tc.metadata.uid.is_none() {
            tc.metadata.uid = Some(format!("tc-uid-{}", key.1));
        }
        clusters.insert(key, tc);
    }

    pub fn remove(&self, namespace: &str, name: &str) -> Option<TikvCluster> {
        self.lock().remove(&(namespace.to_string(), name.to_string()))
    }

    /// Number of successful status writes.
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterApi for FakeClusterStore {
    async fn replace_status(&self, tc: &TikvCluster) -> Result<TikvCluster> {
        self.update_tracker.check()?;
        let key = (tc.namespace().unwrap_or_default(), tc.name_any());
        let current = self
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::Transient(format!("TikvCluster {}/{} not found", key.0, key.1)))?;
        if current.metadata.resource_version != tc.metadata.resource_version {
            return Err(Error::Conflict(format!(
                "TikvCluster {}/{} has been modified",
                key.0, key.1
            )));
        }
        let mut updated = current;
        updated.status = tc.status.clone();
        self.insert(updated);
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        self.lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::Transient(format!("TikvCluster {}/{} not found", key.0, key.1)))
    }
}

impl ClusterLister for FakeClusterStore {
    fn get(&self, namespace: &str, name: &str) -> Option<TikvCluster> {
        self.lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn list(&self) -> Vec<TikvCluster> {
        self.lock().values().cloned().collect()
    }
}
