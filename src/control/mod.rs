//! Controls over the Kubernetes objects a cluster owns.
//!
//! Every object kind goes through [`ObjectControl`], so managers can run
//! against the API server ([`kube_control::KubeControl`]) or an in-memory
//! store ([`fake::FakeControl`]).

pub mod fake;
pub mod kube_control;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Pod, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::Client;

use crate::controller::error::Result;
use crate::controller::events::EventSink;
use crate::crd::TikvCluster;

/// Create, read, update and delete one object kind on behalf of a cluster.
#[async_trait]
pub trait ObjectControl<K>: Send + Sync {
    /// `None` when the object does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;
    /// Objects whose labels include every pair of `selector`.
    async fn list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<K>>;
    async fn create(&self, tc: &TikvCluster, obj: K) -> Result<K>;
    async fn update(&self, tc: &TikvCluster, obj: K) -> Result<K>;
    async fn delete(&self, tc: &TikvCluster, namespace: &str, name: &str) -> Result<()>;
}

/// The controls for every owned kind.
#[derive(Clone)]
pub struct Controls {
    pub services: Arc<dyn ObjectControl<Service>>,
    pub stateful_sets: Arc<dyn ObjectControl<StatefulSet>>,
    pub pods: Arc<dyn ObjectControl<Pod>>,
    pub pvcs: Arc<dyn ObjectControl<PersistentVolumeClaim>>,
    pub deployments: Arc<dyn ObjectControl<Deployment>>,
    pub config_maps: Arc<dyn ObjectControl<ConfigMap>>,
    pub service_accounts: Arc<dyn ObjectControl<ServiceAccount>>,
    pub roles: Arc<dyn ObjectControl<Role>>,
    pub role_bindings: Arc<dyn ObjectControl<RoleBinding>>,
}

impl Controls {
    /// Controls backed by the API server.
    pub fn kube(client: Client, events: Arc<dyn EventSink>) -> Self {
        use kube_control::KubeControl;
        Self {
            services: Arc::new(KubeControl::<Service>::new(client.clone(), events.clone())),
            stateful_sets: Arc::new(KubeControl::<StatefulSet>::new(
                client.clone(),
                events.clone(),
            )),
            pods: Arc::new(KubeControl::<Pod>::new(client.clone(), events.clone())),
            pvcs: Arc::new(KubeControl::<PersistentVolumeClaim>::new(
                client.clone(),
                events.clone(),
            )),
            deployments: Arc::new(KubeControl::<Deployment>::new(client.clone(), events.clone())),
            config_maps: Arc::new(KubeControl::<ConfigMap>::new(client.clone(), events.clone())),
            service_accounts: Arc::new(KubeControl::<ServiceAccount>::new(
                client.clone(),
                events.clone(),
            )),
            roles: Arc::new(KubeControl::<Role>::new(client.clone(), events.clone())),
            role_bindings: Arc::new(KubeControl::<RoleBinding>::new(client, events)),
        }
    }
}

/// In-memory controls, with typed handles for test setup and inspection.
#[derive(Clone, Default)]
pub struct FakeControls {
    pub services: Arc<fake::FakeControl<Service>>,
    pub stateful_sets: Arc<fake::FakeControl<StatefulSet>>,
    pub pods: Arc<fake::FakeControl<Pod>>,
    pub pvcs: Arc<fake::FakeControl<PersistentVolumeClaim>>,
    pub deployments: Arc<fake::FakeControl<Deployment>>,
    pub config_maps: Arc<fake::FakeControl<ConfigMap>>,
    pub service_accounts: Arc<fake::FakeControl<ServiceAccount>>,
    pub roles: Arc<fake::FakeControl<Role>>,
    pub role_bindings: Arc<fake::FakeControl<RoleBinding>>,
}

impl FakeControls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn controls(&self) -> Controls {
        Controls {
            services: self.services.clone(),
            stateful_sets: self.stateful_sets.clone(),
            pods: self.pods.clone(),
            pvcs: self.pvcs.clone(),
            deployments: self.deployments.clone(),
            config_maps: self.config_maps.clone(),
            service_accounts: self.service_accounts.clone(),
            roles: self.roles.clone(),
            role_bindings: self.role_bindings.clone(),
        }
    }
}
