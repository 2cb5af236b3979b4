//! Rolling upgrade of the PD tier.
//!
//! PD runs with the `OnDelete` strategy: a pod picks up the new template only
//! when it is deleted. Pods go one at a time in ascending ordinal order with
//! the leader last, and leadership is moved off a pod before it is deleted.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use tracing::info;

use super::Upgrader;
use super::utils::{pod_revision, statefulset_ordinals};
use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::crd::{MemberPhase, MemberType, TikvCluster};
use crate::requeue;
use crate::resources::common::{ordinal_from_name, ordinal_pod_name};
use crate::resources::statefulset::template_equal;

/// Ordinals in upgrade order: ascending, with the leader moved to the end.
pub fn upgrade_order(ordinals: &BTreeSet<i32>, leader: Option<i32>) -> Vec<i32> {
    let mut order: Vec<i32> = ordinals
        .iter()
        .copied()
        .filter(|o| Some(*o) != leader)
        .collect();
    if let Some(leader) = leader.filter(|l| ordinals.contains(l)) {
        order.push(leader);
    }
    order
}

pub struct PdUpgrader {
    ctx: Arc<Context>,
}

impl PdUpgrader {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn upgrade_pod(&self, tc: &TikvCluster, pod_name: &str) -> Result<()> {
        let status = tc.status_ref();
        let force = tc.force_upgrade();

        if !force {
            if let Some(unhealthy) = status
                .pd
                .members
                .values()
                .find(|m| m.name != pod_name && !m.health)
            {
                return Err(requeue!(
                    "TikvCluster: [{}], PD member {} is unhealthy, can't upgrade {}",
                    tc.key(),
                    unhealthy.name,
                    pod_name
                ));
            }
        }

        let is_leader = status
            .pd
            .leader
            .as_ref()
            .is_some_and(|leader| leader.name == pod_name);
        if is_leader && status.pd.members.len() > 1 {
            let target = status
                .pd
                .members
                .values()
                .find(|m| m.name != pod_name && m.health)
                .map(|m| m.name.clone());
            if let Some(target) = target {
                self.ctx.pd_client(tc).transfer_leader(&target).await?;
                info!(cluster = %tc.key(), from = %pod_name, to = %target, "Transferred PD leader before upgrade");
                return Err(requeue!(
                    "TikvCluster: [{}], transferring PD leader from {} to {} before upgrade",
                    tc.key(),
                    pod_name,
                    target
                ));
            }
        }

        let namespace = tc.namespace().unwrap_or_default();
        self.ctx.controls.pods.delete(tc, &namespace, pod_name).await?;
        info!(cluster = %tc.key(), pod = %pod_name, "Deleted PD pod to upgrade it");
        Err(requeue!(
            "TikvCluster: [{}], PD pod {} is upgrading",
            tc.key(),
            pod_name
        ))
    }
}

#[async_trait]
impl Upgrader for PdUpgrader {
    async fn upgrade(&self, tc: &mut TikvCluster, old: &StatefulSet, new: &mut StatefulSet) -> Result<()> {
        tc.status.get_or_insert_with(Default::default).pd.phase = MemberPhase::Upgrade;
        // The new template is written first; pods roll on later passes.
        if !template_equal(new, old) {
            return Ok(());
        }

        let status = tc.status_ref();
        if !status.pd.synced {
            return Err(requeue!(
                "TikvCluster: [{}], PD status is not synced, can't upgrade",
                tc.key()
            ));
        }
        let sts_status = old.status.clone().unwrap_or_default();
        if sts_status.observed_generation != old.metadata.generation {
            return Err(requeue!(
                "TikvCluster: [{}], waiting for the PD StatefulSet to observe generation {:?}",
                tc.key(),
                old.metadata.generation
            ));
        }
        let update_revision = sts_status.update_revision.unwrap_or_default();

        let namespace = tc.namespace().unwrap_or_default();
        let leader = status
            .pd
            .leader
            .as_ref()
            .and_then(|l| ordinal_from_name(&l.name));
        for ordinal in upgrade_order(&statefulset_ordinals(old), leader) {
            let pod_name = ordinal_pod_name(&tc.name_any(), MemberType::Pd, ordinal);
            let Some(pod) = self.ctx.controls.pods.get(&namespace, &pod_name).await? else {
                return Err(requeue!(
                    "TikvCluster: [{}], PD pod {} not found",
                    tc.key(),
                    pod_name
                ));
            };

            if pod_revision(&pod) == Some(update_revision.as_str()) {
                let healthy = status.pd.members.get(&pod_name).is_some_and(|m| m.health);
                if !healthy && !tc.force_upgrade() {
                    return Err(requeue!(
                        "TikvCluster: [{}], upgraded PD pod {} is not healthy yet",
                        tc.key(),
                        pod_name
                    ));
                }
                continue;
            }
            return self.upgrade_pod(tc, &pod_name).await;
        }
        Ok(())
    }
}
