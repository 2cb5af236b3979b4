//! Object control backed by the Kubernetes API.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::ObjectControl;
use crate::controller::error::{Error, Result};
use crate::controller::events::{ClusterEvent, EventSink, FIELD_MANAGER};
use crate::crd::TikvCluster;
use crate::resources::labels::selector_string;

/// Writes objects through `Api<K>` and records an event per write.
pub struct KubeControl<K> {
    client: Client,
    events: Arc<dyn EventSink>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeControl<K> {
    pub fn new(client: Client, events: Arc<dyn EventSink>) -> Self {
        Self {
            client,
            events,
            _kind: PhantomData,
        }
    }
}

impl<K> KubeControl<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn record<T: Sync>(&self, tc: &TikvCluster, verb: &str, name: &str, result: &Result<T>) {
        let kind = K::kind(&());
        let event = match result {
            Ok(_) => ClusterEvent::normal(
                &format!("Successful{}", verb),
                verb,
                format!(
                    "{} {} {} in TikvCluster {} successful",
                    verb.to_lowercase(),
                    kind,
                    name,
                    tc.name_any()
                ),
            ),
            Err(e) => ClusterEvent::warning(
                &format!("Failed{}", verb),
                verb,
                format!(
                    "{} {} {} in TikvCluster {} failed error: {}",
                    verb.to_lowercase(),
                    kind,
                    name,
                    tc.name_any(),
                    e
                ),
            ),
        };
        self.events.publish(tc, event).await;
    }
}

fn map_conflict(e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ref resp) if resp.code == 409 => Error::Conflict(resp.message.clone()),
        other => Error::Kube(other),
    }
}

#[async_trait]
impl<K> ObjectControl<K> for KubeControl<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<K>> {
        let params = ListParams::default().labels(&selector_string(selector));
        Ok(self.api(namespace).list(&params).await?.items)
    }

    async fn create(&self, tc: &TikvCluster, obj: K) -> Result<K> {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let result = self
            .api(&namespace)
            .create(&params, &obj)
            .await
            .map_err(map_conflict);
        self.record(tc, "Create", &name, &result).await;
        if result.is_ok() {
            debug!(kind = %K::kind(&()), namespace = %namespace, name = %name, "Created object");
        }
        result
    }

    async fn update(&self, tc: &TikvCluster, obj: K) -> Result<K> {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let result = self
            .api(&namespace)
            .replace(&name, &params, &obj)
            .await
            .map_err(map_conflict);
        self.record(tc, "Update", &name, &result).await;
        result
    }

    async fn delete(&self, tc: &TikvCluster, namespace: &str, name: &str) -> Result<()> {
        let result = match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                warn!(kind = %K::kind(&()), namespace = %namespace, name = %name, "Object already deleted");
                Ok(())
            }
            Err(e) => Err(Error::Kube(e)),
        };
        self.record(tc, "Delete", name, &result).await;
        result
    }
}
