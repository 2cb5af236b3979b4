//! Scaling a tier one ordinal per pass.
//!
//! The StatefulSet controller runs ordinals `0..replicas`, so scale-out adds
//! the next ordinal and scale-in removes the highest one, after the tier
//! confirms the member can go. The PVC of a removed ordinal is marked
//! defer-deleting and only deleted once its pod is gone.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use tracing::{info, warn};

use super::Scaler;
use super::utils::{now, statefulset_ordinals};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::crd::{MemberType, StoreState, TikvCluster};
use crate::requeue;
use crate::resources::common::{
    data_volume_name, member_labels, ordinal_from_name, ordinal_pod_name, pvc_name,
};
use crate::resources::labels::ANN_PVC_DEFER_DELETING;
use crate::resources::statefulset::set_replicas;

/// The single step from `current` towards `desired`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleStep {
    Out(i32),
    In(i32),
    None,
}

/// Additions win over removals; the lowest addition and the highest removal go first.
pub fn next_scale_step(current: &BTreeSet<i32>, desired: &BTreeSet<i32>) -> ScaleStep {
    if let Some(&ordinal) = desired.difference(current).next() {
        return ScaleStep::Out(ordinal);
    }
    if let Some(&ordinal) = current.difference(desired).last() {
        return ScaleStep::In(ordinal);
    }
    ScaleStep::None
}

/// Scaler of one tier.
pub struct TierScaler {
    ctx: Arc<Context>,
    member_type: MemberType,
}

impl TierScaler {
    pub fn pd(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            member_type: MemberType::Pd,
        }
    }

    pub fn tikv(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            member_type: MemberType::Tikv,
        }
    }

    async fn scale_out(
        &self,
        tc: &TikvCluster,
        current: &BTreeSet<i32>,
        ordinal: i32,
        new: &mut StatefulSet,
    ) -> Result<()> {
        let namespace = tc.namespace().unwrap_or_default();
        let pod_name = ordinal_pod_name(&tc.name_any(), self.member_type, ordinal);
        let claim = pvc_name(self.member_type, &pod_name);

        // A PVC left over from an earlier scale-in would bring back stale data.
        let existing = self.ctx.controls.pvcs.get(&namespace, &claim).await?;
        if existing.is_some_and(|pvc| pvc.annotations().contains_key(ANN_PVC_DEFER_DELETING)) {
            info!(cluster = %tc.key(), pvc = %claim, "Deleting defer-deleting PVC before scale out");
            self.ctx.controls.pvcs.delete(tc, &namespace, &claim).await?;
        }

        let mut ordinals = current.clone();
        ordinals.insert(ordinal);
        info!(
            cluster = %tc.key(),
            tier = %self.member_type,
            ordinal,
            replicas = ordinals.len(),
            "Scaling out"
        );
        set_replicas(new, ordinals.len() as i32);
        Ok(())
    }

    async fn scale_in(
        &self,
        tc: &mut TikvCluster,
        current: &BTreeSet<i32>,
        ordinal: i32,
        new: &mut StatefulSet,
    ) -> Result<()> {
        let status = tc.status_ref();
        let (synced, upgrading) = match self.member_type {
            MemberType::Pd => (status.pd.synced, tc.pd_upgrading()),
            MemberType::Tikv => (status.tikv.synced, tc.tikv_upgrading()),
        };
        if !synced {
            return Err(requeue!(
                "TikvCluster: [{}], can't scale in {} while its status is not synced",
                tc.key(),
                self.member_type
            ));
        }
        if upgrading {
            return Err(requeue!(
                "TikvCluster: [{}], can't scale in {} while upgrading",
                tc.key(),
                self.member_type
            ));
        }

        let namespace = tc.namespace().unwrap_or_default();
        let pod_name = ordinal_pod_name(&tc.name_any(), self.member_type, ordinal);
        match self.member_type {
            MemberType::Pd => self.pd_member_removable(tc, &pod_name).await?,
            MemberType::Tikv => self.tikv_store_removable(tc, &pod_name).await?,
        }

        let claim = pvc_name(self.member_type, &pod_name);
        if let Some(mut pvc) = self.ctx.controls.pvcs.get(&namespace, &claim).await? {
            if !pvc.annotations().contains_key(ANN_PVC_DEFER_DELETING) {
                pvc.annotations_mut()
                    .insert(ANN_PVC_DEFER_DELETING.to_string(), now());
                self.ctx.controls.pvcs.update(tc, pvc).await?;
            }
        } else {
            warn!(cluster = %tc.key(), pvc = %claim, "PVC of scaled-in pod not found");
        }

        let mut ordinals = current.clone();
        ordinals.remove(&ordinal);
        info!(
            cluster = %tc.key(),
            tier = %self.member_type,
            ordinal,
            replicas = ordinals.len(),
            "Scaling in"
        );
        set_replicas(new, ordinals.len() as i32);
        Ok(())
    }

    /// A StatefulSet can only grow at `current.len()` and shrink at its
    /// highest ordinal.
    fn check_step(&self, tc: &TikvCluster, current: &BTreeSet<i32>, step: ScaleStep) -> Result<()> {
        let (ordinal, allowed, action) = match step {
            ScaleStep::Out(ordinal) => (ordinal, current.len() as i32, "add"),
            ScaleStep::In(ordinal) => (ordinal, current.last().copied().unwrap_or(-1), "remove"),
            ScaleStep::None => return Ok(()),
        };
        if ordinal == allowed {
            return Ok(());
        }
        Err(Error::Validation(format!(
            "TikvCluster: [{}], {} can only {} ordinal {}, not {}",
            tc.key(),
            self.member_type,
            action,
            allowed,
            ordinal
        )))
    }

    /// Move leadership off the member, then remove it from PD.
    async fn pd_member_removable(&self, tc: &TikvCluster, pod_name: &str) -> Result<()> {
        let pd = self.ctx.pd_client(tc);
        let status = tc.status_ref();
        let is_leader = status
            .pd
            .leader
            .as_ref()
            .is_some_and(|leader| leader.name == pod_name);
        if is_leader {
            let target = status
                .pd
                .members
                .values()
                .find(|m| m.name != pod_name && m.health)
                .map(|m| m.name.clone());
            if let Some(target) = target {
                pd.transfer_leader(&target).await?;
                return Err(requeue!(
                    "TikvCluster: [{}], transferring PD leader from {} to {} before scale in",
                    tc.key(),
                    pod_name,
                    target
                ));
            }
        }
        pd.delete_member(pod_name).await?;
        info!(cluster = %tc.key(), member = %pod_name, "Deleted PD member");
        Ok(())
    }

    /// A store may go once PD reports it tombstone, or it never registered.
    async fn tikv_store_removable(&self, tc: &TikvCluster, pod_name: &str) -> Result<()> {
        let status = tc.status_ref();
        if status
            .tikv
            .tombstone_stores
            .values()
            .any(|s| s.pod_name == pod_name)
        {
            return Ok(());
        }
        let Some(store) = status.tikv.stores.values().find(|s| s.pod_name == pod_name) else {
            info!(cluster = %tc.key(), pod = %pod_name, "Store never registered, safe to remove");
            return Ok(());
        };
        match store.state {
            StoreState::Tombstone => Ok(()),
            StoreState::Offline => Err(requeue!(
                "TikvCluster: [{}], store {} of pod {} is still offline",
                tc.key(),
                store.id,
                pod_name
            )),
            _ => {
                let id: u64 = store.id.parse().map_err(|_| {
                    Error::Transient(format!(
                        "invalid store id {:?} for pod {}",
                        store.id, pod_name
                    ))
                })?;
                self.ctx.pd_client(tc).delete_store(id).await?;
                info!(cluster = %tc.key(), store = id, pod = %pod_name, "Deleting TiKV store");
                Err(requeue!(
                    "TikvCluster: [{}], deleting store {} of pod {}, waiting for it to become tombstone",
                    tc.key(),
                    id,
                    pod_name
                ))
            }
        }
    }
}

#[async_trait]
impl Scaler for TierScaler {
    async fn scale(&self, tc: &mut TikvCluster, old: &StatefulSet, new: &mut StatefulSet) -> Result<()> {
        let current = statefulset_ordinals(old);
        let desired = tc.sts_desired_ordinals(self.member_type, false);
        let step = next_scale_step(&current, &desired);
        self.check_step(tc, &current, step)?;
        match step {
            ScaleStep::Out(ordinal) => self.scale_out(tc, &current, ordinal, new).await,
            ScaleStep::In(ordinal) => self.scale_in(tc, &current, ordinal, new).await,
            ScaleStep::None => Ok(()),
        }
    }

    async fn clean_deferred_pvcs(&self, tc: &TikvCluster, sts: &StatefulSet) -> Result<()> {
        let namespace = tc.namespace().unwrap_or_default();
        let running = statefulset_ordinals(sts);
        let prefix = format!("{}-", data_volume_name(self.member_type));
        let pvcs = self
            .ctx
            .controls
            .pvcs
            .list(&namespace, &member_labels(tc, self.member_type))
            .await?;

        for pvc in pvcs {
            if !pvc.annotations().contains_key(ANN_PVC_DEFER_DELETING) {
                continue;
            }
            let name = pvc.name_any();
            let Some(pod_name) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(ordinal) = ordinal_from_name(pod_name) else {
                continue;
            };
            if running.contains(&ordinal) {
                continue;
            }
            if self.ctx.controls.pods.get(&namespace, pod_name).await?.is_some() {
                continue;
            }
            info!(cluster = %tc.key(), pvc = %name, "Deleting defer-deleting PVC");
            self.ctx.controls.pvcs.delete(tc, &namespace, &name).await?;
        }
        Ok(())
    }
}
