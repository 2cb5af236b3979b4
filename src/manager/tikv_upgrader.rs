//! Rolling upgrade of the TiKV tier.
//!
//! Stores go one at a time in ascending ordinal order. Region leaders are
//! evicted from a store before its pod is deleted; the pod goes once the
//! store holds no leaders or the eviction has run past its timeout. TiKV
//! waits for PD to finish its own upgrade first.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::info;

use super::Upgrader;
use super::utils::{elapsed_since, now, pod_revision, statefulset_ordinals};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::crd::{MemberPhase, MemberType, StoreState, TikvCluster, TikvStore};
use crate::requeue;
use crate::resources::common::ordinal_pod_name;
use crate::resources::labels::ANN_EVICT_LEADER_BEGIN_TIME;
use crate::resources::statefulset::{last_applied_template, template_equal};

fn store_id(store: &TikvStore) -> Result<u64> {
    store
        .id
        .parse()
        .map_err(|_| Error::Transient(format!("invalid store id {:?} of pod {}", store.id, store.pod_name)))
}

pub struct TikvUpgrader {
    ctx: Arc<Context>,
}

impl TikvUpgrader {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Evict leaders from the store of `pod`, then delete the pod.
    async fn upgrade_pod(&self, tc: &TikvCluster, mut pod: Pod, store: &TikvStore) -> Result<()> {
        let namespace = tc.namespace().unwrap_or_default();
        let pod_name = pod.name_any();
        let id = store_id(store)?;

        let Some(begin) = pod.annotations().get(ANN_EVICT_LEADER_BEGIN_TIME).cloned() else {
            self.ctx.pd_client(tc).begin_evict_leader(id).await?;
            pod.annotations_mut()
                .insert(ANN_EVICT_LEADER_BEGIN_TIME.to_string(), now());
            self.ctx.controls.pods.update(tc, pod).await?;
            info!(cluster = %tc.key(), store = id, pod = %pod_name, "Evicting region leaders before upgrade");
            return Err(requeue!(
                "TikvCluster: [{}], evicting leaders of store {} before upgrading {}",
                tc.key(),
                id,
                pod_name
            ));
        };

        let timed_out = elapsed_since(&begin).is_none_or(|e| e >= self.ctx.config.evict_leader_timeout);
        if store.leader_count > 0 && !timed_out {
            return Err(requeue!(
                "TikvCluster: [{}], store {} still has {} leaders",
                tc.key(),
                id,
                store.leader_count
            ));
        }

        self.ctx.controls.pods.delete(tc, &namespace, &pod_name).await?;
        info!(
            cluster = %tc.key(),
            store = id,
            pod = %pod_name,
            leader_count = store.leader_count,
            "Deleted TiKV pod to upgrade it"
        );
        Err(requeue!(
            "TikvCluster: [{}], TiKV pod {} is upgrading",
            tc.key(),
            pod_name
        ))
    }
}

#[async_trait]
impl Upgrader for TikvUpgrader {
    async fn upgrade(&self, tc: &mut TikvCluster, old: &StatefulSet, new: &mut StatefulSet) -> Result<()> {
        if tc.pd_upgrading() {
            // Hold the TiKV template back until PD is done.
            if let (Some(spec), Some(template)) = (new.spec.as_mut(), last_applied_template(old)) {
                spec.template = template;
            }
            info!(cluster = %tc.key(), "Waiting for PD upgrade before upgrading TiKV");
            return Ok(());
        }

        tc.status.get_or_insert_with(Default::default).tikv.phase = MemberPhase::Upgrade;
        if !template_equal(new, old) {
            return Ok(());
        }

        let status = tc.status_ref();
        if !status.tikv.synced {
            return Err(requeue!(
                "TikvCluster: [{}], TiKV status is not synced, can't upgrade",
                tc.key()
            ));
        }
        let sts_status = old.status.clone().unwrap_or_default();
        if sts_status.observed_generation != old.metadata.generation {
            return Err(requeue!(
                "TikvCluster: [{}], waiting for the TiKV StatefulSet to observe generation {:?}",
                tc.key(),
                old.metadata.generation
            ));
        }
        let update_revision = sts_status.update_revision.unwrap_or_default();
        let force = tc.force_upgrade();
        let namespace = tc.namespace().unwrap_or_default();

        for ordinal in statefulset_ordinals(old) {
            let pod_name = ordinal_pod_name(&tc.name_any(), MemberType::Tikv, ordinal);
            let Some(pod) = self.ctx.controls.pods.get(&namespace, &pod_name).await? else {
                return Err(requeue!(
                    "TikvCluster: [{}], TiKV pod {} not found",
                    tc.key(),
                    pod_name
                ));
            };
            let store = status.tikv.stores.values().find(|s| s.pod_name == pod_name);

            if pod_revision(&pod) == Some(update_revision.as_str()) {
                match store {
                    Some(store) if store.state == StoreState::Up => {
                        // An evicted store regains no leaders until the scheduler goes.
                        if store.leader_count == 0 {
                            self.ctx.pd_client(tc).end_evict_leader(store_id(store)?).await?;
                        }
                    }
                    _ if force => {}
                    _ => {
                        return Err(requeue!(
                            "TikvCluster: [{}], store of upgraded pod {} is not up yet",
                            tc.key(),
                            pod_name
                        ));
                    }
                }
                continue;
            }

            let Some(store) = store else {
                if force {
                    self.ctx.controls.pods.delete(tc, &namespace, &pod_name).await?;
                    return Err(requeue!(
                        "TikvCluster: [{}], TiKV pod {} without a store is upgrading",
                        tc.key(),
                        pod_name
                    ));
                }
                return Err(requeue!(
                    "TikvCluster: [{}], TiKV pod {} has no store, can't upgrade",
                    tc.key(),
                    pod_name
                ));
            };
            if !force {
                if let Some(down) = status
                    .tikv
                    .stores
                    .values()
                    .find(|s| s.pod_name != pod_name && s.state != StoreState::Up)
                {
                    return Err(requeue!(
                        "TikvCluster: [{}], store {} is {}, can't upgrade {}",
                        tc.key(),
                        down.id,
                        down.state,
                        pod_name
                    ));
                }
            }
            return self.upgrade_pod(tc, pod, store).await;
        }
        Ok(())
    }
}
