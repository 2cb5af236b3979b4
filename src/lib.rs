//! tikv-operator library crate
//!
//! This module exports the controller, CRD definitions, resource generators,
//! the PD client and the per-stage managers.

pub mod control;
pub mod controller;
pub mod crd;
pub mod health;
pub mod manager;
pub mod pdapi;
pub mod resources;

pub use health::HealthState;

use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::runtime::controller::{self as runtime_controller, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{WatchStreamExt, predicates, reflector, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use controller::config::ControllerConfig;
use controller::context::Context;
use controller::status::StoreLister;
use controller::tikv_cluster_control::DefaultClusterControl;
use controller::tikv_cluster_controller::{TikvClusterController, error_policy, reconcile};
use crd::TikvCluster;
use resources::labels::{MANAGED_BY_KEY, MANAGED_BY_VALUE};

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Reflector-backed TikvCluster stream. The store doubles as the lister the
/// status updater reads fresh copies from.
fn cluster_stream(
    api: Api<TikvCluster>,
    watcher_config: WatcherConfig,
) -> (
    reflector::Store<TikvCluster>,
    impl Stream<Item = Result<TikvCluster, watcher::Error>>,
) {
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation);
    (reader, stream)
}

/// Run the operator controller until `cancel` fires. Reconciles in flight
/// at that point are allowed to finish.
///
/// StatefulSets carrying the operator's managed-by label map back to their
/// owning cluster through the controller owner reference. Every cluster is
/// reconciled again after the resync period.
pub async fn run_controller(
    client: Client,
    config: ControllerConfig,
    health_state: Option<Arc<HealthState>>,
    cancel: CancellationToken,
) {
    let namespace = config.namespace.clone();
    info!(scope = namespace.as_deref().unwrap_or("cluster-wide"), "Starting controller for TikvCluster resources");

    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let clusters: Api<TikvCluster> = scoped_api(client.clone(), namespace.as_deref());
    let statefulsets: Api<StatefulSet> = scoped_api(client.clone(), namespace.as_deref());

    let watcher_config = default_watcher_config();
    let (reader, clusters) = cluster_stream(clusters, watcher_config.clone());
    let sts_config = watcher_config.labels(&format!("{}={}", MANAGED_BY_KEY, MANAGED_BY_VALUE));

    let workers = u16::try_from(config.workers.max(1)).unwrap_or(u16::MAX);
    let ctx = Arc::new(Context::new(
        client,
        Arc::new(StoreLister::new(reader.clone())),
        config,
        health_state,
    ));
    let control = Arc::new(DefaultClusterControl::new(ctx.clone()));
    let state = Arc::new(TikvClusterController::new(ctx, control));

    let results = Controller::for_stream(clusters, reader)
        .owns(statefulsets, sts_config)
        .with_config(runtime_controller::Config::default().concurrency(workers))
        .graceful_shutdown_on(cancel.clone().cancelled_owned())
        .run(reconcile, error_policy, state.clone())
        .for_each(|result| {
            let state = state.clone();
            async move {
                match result {
                    Ok((obj, _action)) => debug!(cluster = %obj, "Reconcile finished"),
                    Err(runtime_controller::Error::ObjectNotFound(obj)) => {
                        state.cluster_deleted(obj.namespace.as_deref().unwrap_or_default(), &obj.name);
                    }
                    // Logged by the error policy.
                    Err(runtime_controller::Error::ReconcilerFailed(_, obj)) => {
                        debug!(cluster = %obj, "Reconcile failed");
                    }
                    Err(e) => error!(error = %e, "Controller error"),
                }
            }
        });

    results.await;
    if cancel.is_cancelled() {
        info!("Controller stopped");
    } else {
        error!("Controller stream ended unexpectedly");
    }
}
