//! Helpers shared by the managers.

use std::collections::BTreeSet;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::ResourceExt;
use tracing::info;

use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::crd::TikvCluster;
use crate::resources::labels::{ANN_BOOTSTRAPPING, CONTROLLER_REVISION_HASH_KEY};
use crate::resources::services::{merge_service, service_needs_update};
use crate::resources::statefulset::{
    set_last_applied_config, statefulset_equal, statefulset_replicas,
};

/// Current time in RFC 3339.
pub fn now() -> String {
    jiff::Timestamp::now().to_string()
}

/// Time elapsed since an RFC 3339 timestamp; `None` if it does not parse.
pub fn elapsed_since(timestamp: &str) -> Option<Duration> {
    let then: jiff::Timestamp = timestamp.parse().ok()?;
    let elapsed = jiff::Timestamp::now().duration_since(then);
    Some(Duration::try_from(elapsed).unwrap_or(Duration::ZERO))
}

/// Ordinals a StatefulSet currently runs: `0..replicas`.
pub fn statefulset_ordinals(sts: &StatefulSet) -> BTreeSet<i32> {
    (0..statefulset_replicas(sts)).collect()
}

pub fn pod_revision(pod: &Pod) -> Option<&str> {
    pod.labels()
        .get(CONTROLLER_REVISION_HASH_KEY)
        .map(String::as_str)
}

pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}

/// Names of the PVCs a pod mounts.
pub fn pod_claim_names(pod: &Pod) -> Vec<String> {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .filter_map(|v| v.persistent_volume_claim.as_ref())
                .map(|claim| claim.claim_name.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Create `desired` or bring an existing service in line with it.
pub async fn sync_service(ctx: &Context, tc: &TikvCluster, desired: Service) -> Result<()> {
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();
    match ctx.controls.services.get(&namespace, &name).await? {
        None => {
            ctx.controls.services.create(tc, desired).await?;
        }
        Some(existing) if service_needs_update(&desired, &existing) => {
            info!(namespace = %namespace, name = %name, "Updating service");
            ctx.controls
                .services
                .update(tc, merge_service(&desired, &existing))
                .await?;
        }
        Some(_) => {}
    }
    Ok(())
}

/// Create `desired` or update the data of the existing ConfigMap.
pub async fn sync_config_map(ctx: &Context, tc: &TikvCluster, desired: ConfigMap) -> Result<ConfigMap> {
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();
    match ctx.controls.config_maps.get(&namespace, &name).await? {
        None => ctx.controls.config_maps.create(tc, desired).await,
        Some(existing)
            if existing.data != desired.data || existing.metadata.labels != desired.metadata.labels =>
        {
            let mut updated = existing;
            updated.data = desired.data;
            updated.metadata.labels = desired.metadata.labels;
            ctx.controls.config_maps.update(tc, updated).await
        }
        Some(existing) => Ok(existing),
    }
}

/// Write `new` over `old` unless it matches what was last applied.
///
/// Existing annotations are kept; delete slots and the bootstrap marker
/// follow `new`.
pub async fn update_statefulset(
    ctx: &Context,
    tc: &TikvCluster,
    new: &StatefulSet,
    old: &StatefulSet,
) -> Result<()> {
    if statefulset_equal(new, old) {
        return Ok(());
    }

    let mut set = old.clone();
    match (set.spec.as_mut(), new.spec.as_ref()) {
        (Some(spec), Some(desired)) => {
            spec.template = desired.template.clone();
            spec.replicas = desired.replicas;
            spec.update_strategy = desired.update_strategy.clone();
        }
        _ => set.spec = new.spec.clone(),
    }

    let annotations = set.annotations_mut();
    for (key, value) in new.annotations() {
        annotations.insert(key.clone(), value.clone());
    }
    if !new.annotations().contains_key(ANN_BOOTSTRAPPING) {
        annotations.remove(ANN_BOOTSTRAPPING);
    }
    let labels = set.labels_mut();
    for (key, value) in new.labels() {
        labels.insert(key.clone(), value.clone());
    }

    set_last_applied_config(&mut set)?;
    info!(
        cluster = %tc.key(),
        statefulset = %set.name_any(),
        replicas = statefulset_replicas(&set),
        "Updating StatefulSet"
    );
    ctx.controls.stateful_sets.update(tc, set).await?;
    Ok(())
}
