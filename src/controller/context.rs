//! Shared context for the controller.
//!
//! A `Context` bundles every collaborator a reconcile pass needs. Production
//! wiring uses the Kubernetes-backed implementations; tests inject fakes.

use std::sync::Arc;

use kube::{Client, ResourceExt};

use crate::control::{Controls, FakeControls};
use crate::controller::config::ControllerConfig;
use crate::controller::events::{ClusterEvent, EventSink, FakeEventSink, KubeEventSink};
use crate::controller::status::{ClusterApi, ClusterLister, FakeClusterStore, KubeClusterApi};
use crate::crd::TikvCluster;
use crate::health::HealthState;
use crate::pdapi::fake::{FakePdClient, FakePdControl};
use crate::pdapi::http::HttpPdControl;
use crate::pdapi::{PdClient, PdControl};

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    pub controls: Controls,
    pub pd_control: Arc<dyn PdControl>,
    pub events: Arc<dyn EventSink>,
    pub cluster_api: Arc<dyn ClusterApi>,
    pub lister: Arc<dyn ClusterLister>,
    pub config: ControllerConfig,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    /// Context backed by the API server and the PD HTTP API.
    pub fn new(
        client: Client,
        lister: Arc<dyn ClusterLister>,
        config: ControllerConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        let events: Arc<dyn EventSink> = Arc::new(KubeEventSink::new(client.clone()));
        Self {
            controls: Controls::kube(client.clone(), events.clone()),
            pd_control: Arc::new(HttpPdControl::new(config.pd_request_timeout)),
            events,
            cluster_api: Arc::new(KubeClusterApi::new(client)),
            lister,
            config,
            health_state,
        }
    }

    /// PD client of `tc`.
    pub fn pd_client(&self, tc: &TikvCluster) -> Arc<dyn PdClient> {
        self.pd_control
            .client(&tc.namespace().unwrap_or_default(), &tc.name_any())
    }

    /// Publish a normal event for a cluster
    pub async fn publish_normal_event(
        &self,
        tc: &TikvCluster,
        reason: &str,
        action: &str,
        note: impl Into<String>,
    ) {
        self.events
            .publish(tc, ClusterEvent::normal(reason, action, note))
            .await;
    }

    /// Publish a warning event for a cluster
    pub async fn publish_warning_event(
        &self,
        tc: &TikvCluster,
        reason: &str,
        action: &str,
        note: impl Into<String>,
    ) {
        self.events
            .publish(tc, ClusterEvent::warning(reason, action, note))
            .await;
    }
}

/// A context wired to in-memory fakes, with typed handles to each of them.
pub struct FakeEnv {
    pub controls: FakeControls,
    pub pd: Arc<FakePdControl>,
    pub events: Arc<FakeEventSink>,
    pub clusters: Arc<FakeClusterStore>,
    pub ctx: Arc<Context>,
}

impl FakeEnv {
    pub fn new(config: ControllerConfig) -> Self {
        let controls = FakeControls::new();
        let pd = Arc::new(FakePdControl::new());
        let events = Arc::new(FakeEventSink::new());
        let clusters = Arc::new(FakeClusterStore::new());
        let ctx = Arc::new(Context {
            controls: controls.controls(),
            pd_control: pd.clone(),
            events: events.clone(),
            cluster_api: clusters.clone(),
            lister: clusters.clone(),
            config,
            health_state: None,
        });
        Self {
            controls,
            pd,
            events,
            clusters,
            ctx,
        }
    }

    /// The fake PD of `tc`.
    pub fn pd_client(&self, tc: &TikvCluster) -> Arc<FakePdClient> {
        self.pd
            .pd_client(&tc.namespace().unwrap_or_default(), &tc.name_any())
    }
}

impl Default for FakeEnv {
    fn default() -> Self {
        Self::new(ControllerConfig::default())
    }
}
