//! Member manager of the PD tier.
//!
//! Keeps the PD services, ConfigMap and StatefulSet in line with the spec,
//! pulls member health from PD into the status, and hands replica and
//! template changes to the scaler, failover and upgrader.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::pd_failover::PdFailover;
use super::pd_upgrader::PdUpgrader;
use super::scaler::TierScaler;
use super::utils::{
    now, pod_revision, statefulset_ordinals, sync_config_map, sync_service, update_statefulset,
};
use super::{Failover, Manager, Scaler, Upgrader};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::crd::{MemberPhase, MemberType, PdMember, TikvCluster, UnjoinedMember};
use crate::pdapi::PdApiError;
use crate::requeue;
use crate::resources::common::{member_labels, member_name, pvc_name};
use crate::resources::configmap::generate_configmap;
use crate::resources::labels::ANN_BOOTSTRAPPING;
use crate::resources::services::{generate_pd_service, generate_peer_service};
use crate::resources::statefulset::{
    container_image, generate_pd_statefulset, set_last_applied_config,
    set_replicas, statefulset_is_upgrading,
    statefulset_replicas, status_snapshot, template_equal,
};

/// What PD reports about its members.
struct PdView {
    cluster_id: String,
    members: BTreeMap<String, PdMember>,
    leader: Option<PdMember>,
}

/// Tier phase from the StatefulSet and the revisions its pods run.
pub(crate) fn tier_phase(sts: &StatefulSet, pods: &[Pod]) -> MemberPhase {
    let update_revision = sts.status.as_ref().and_then(|s| s.update_revision.as_deref());
    let stale_pods =
        update_revision.is_some_and(|rev| pods.iter().any(|p| pod_revision(p) != Some(rev)));
    if statefulset_is_upgrading(sts) || stale_pods {
        MemberPhase::Upgrade
    } else {
        MemberPhase::Normal
    }
}

pub struct PdMemberManager {
    ctx: Arc<Context>,
    scaler: Arc<dyn Scaler>,
    failover: Arc<dyn Failover>,
    upgrader: Arc<dyn Upgrader>,
}

impl PdMemberManager {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            scaler: Arc::new(TierScaler::pd(ctx.clone())),
            failover: Arc::new(PdFailover::new(ctx.clone())),
            upgrader: Arc::new(PdUpgrader::new(ctx.clone())),
            ctx,
        }
    }

    pub fn with_parts(
        ctx: Arc<Context>,
        scaler: Arc<dyn Scaler>,
        failover: Arc<dyn Failover>,
        upgrader: Arc<dyn Upgrader>,
    ) -> Self {
        Self {
            ctx,
            scaler,
            failover,
            upgrader,
        }
    }

    async fn pull_pd_view(&self, tc: &TikvCluster) -> std::result::Result<PdView, PdApiError> {
        let pd = self.ctx.pd_client(tc);
        let cluster = pd.get_cluster().await?;
        let health = pd.get_health().await?;
        let leader = pd.get_leader().await?;

        let previous = tc.status_ref().pd.members;
        let mut members = BTreeMap::new();
        for h in health.healths {
            let last_transition_time = match previous.get(&h.name) {
                Some(old) if old.health == h.health => {
                    old.last_transition_time.clone().or_else(|| Some(now()))
                }
                _ => Some(now()),
            };
            members.insert(
                h.name.clone(),
                PdMember {
                    name: h.name,
                    id: h.member_id.to_string(),
                    client_url: h.client_urls.first().cloned().unwrap_or_default(),
                    health: h.health,
                    last_transition_time,
                },
            );
        }
        let leader = members.get(&leader.name).cloned();
        Ok(PdView {
            cluster_id: cluster.id.to_string(),
            members,
            leader,
        })
    }

    /// Refresh `status.pd` from the StatefulSet, its pods and PD.
    async fn sync_status(&self, tc: &mut TikvCluster, sts: &StatefulSet) -> Result<()> {
        let namespace = tc.namespace().unwrap_or_default();
        let pods = self
            .ctx
            .controls
            .pods
            .list(&namespace, &member_labels(tc, MemberType::Pd))
            .await?;

        {
            let status = &mut tc.status.get_or_insert_with(Default::default).pd;
            status.stateful_set = status_snapshot(sts);
            status.phase = tier_phase(sts, &pods);
            status.image = container_image(sts, MemberType::Pd).unwrap_or_default();
        }

        let view = match self.pull_pd_view(tc).await {
            Ok(view) => view,
            Err(e) => {
                warn!(cluster = %tc.key(), error = %e, "Failed to get PD status");
                tc.status.get_or_insert_with(Default::default).pd.synced = false;
                return Ok(());
            }
        };

        let previous = tc.status_ref().pd.unjoined_members;
        let mut unjoined = BTreeMap::new();
        for pod in &pods {
            let pod_name = pod.name_any();
            if view.members.contains_key(&pod_name) {
                continue;
            }
            let claim = pvc_name(MemberType::Pd, &pod_name);
            let pvc_uid = self
                .ctx
                .controls
                .pvcs
                .get(&namespace, &claim)
                .await?
                .and_then(|p| p.uid())
                .unwrap_or_default();
            let created_at = previous
                .get(&pod_name)
                .map(|m| m.created_at.clone())
                .unwrap_or_else(now);
            unjoined.insert(
                pod_name.clone(),
                UnjoinedMember {
                    pod_name,
                    pvc_uid,
                    created_at,
                },
            );
        }

        let status = tc.status.get_or_insert_with(Default::default);
        status.cluster_id = view.cluster_id;
        status.pd.synced = true;
        status.pd.members = view.members;
        status.pd.leader = view.leader;
        status.pd.unjoined_members = unjoined;
        Ok(())
    }

    async fn create_statefulset(&self, tc: &mut TikvCluster, cm_name: &str) -> Result<()> {
        let mut sts = generate_pd_statefulset(tc, cm_name);
        // PD bootstraps from a single member; the rest join once it is up.
        set_replicas(&mut sts, 1);
        sts.annotations_mut()
            .insert(ANN_BOOTSTRAPPING.to_string(), "true".to_string());
        set_last_applied_config(&mut sts)?;
        info!(cluster = %tc.key(), statefulset = %sts.name_any(), "Creating PD StatefulSet");
        self.ctx.controls.stateful_sets.create(tc, sts).await?;
        tc.status.get_or_insert_with(Default::default).pd.stateful_set = Some(Default::default());
        Err(requeue!(
            "TikvCluster: [{}], waiting for PD cluster running",
            tc.key()
        ))
    }
}

#[async_trait]
impl Manager for PdMemberManager {
    async fn sync(&self, tc: &mut TikvCluster) -> Result<()> {
        let namespace = tc.namespace().unwrap_or_default();
        sync_service(&self.ctx, tc, generate_pd_service(tc)).await?;
        sync_service(&self.ctx, tc, generate_peer_service(tc, MemberType::Pd)).await?;
        let cm = sync_config_map(&self.ctx, tc, generate_configmap(tc, MemberType::Pd)).await?;
        let cm_name = cm.name_any();

        let sts_name = member_name(&tc.name_any(), MemberType::Pd);
        let Some(old) = self
            .ctx
            .controls
            .stateful_sets
            .get(&namespace, &sts_name)
            .await?
        else {
            return self.create_statefulset(tc, &cm_name).await;
        };

        self.sync_status(tc, &old).await?;
        if tc.spec.paused {
            debug!(cluster = %tc.key(), "Cluster is paused, skipping PD sync");
            return Ok(());
        }

        let mut new = generate_pd_statefulset(tc, &cm_name);
        let bootstrapped = tc.status_ref().pd.members.values().any(|m| m.health);
        if old.annotations().contains_key(ANN_BOOTSTRAPPING) {
            if !bootstrapped {
                set_replicas(&mut new, 1);
                new.annotations_mut()
                    .insert(ANN_BOOTSTRAPPING.to_string(), "true".to_string());
                update_statefulset(&self.ctx, tc, &new, &old).await?;
                return Err(requeue!(
                    "TikvCluster: [{}], waiting for the first PD member to become healthy",
                    tc.key()
                ));
            }
            info!(cluster = %tc.key(), "PD cluster bootstrapped");
        }
        set_replicas(&mut new, statefulset_replicas(&old));

        let mut errors = Vec::new();
        // Failover decisions need live member health.
        let synced = tc.status_ref().pd.synced;
        if synced && self.ctx.config.auto_failover && tc.spec.pd.max_failover_count.unwrap_or(0) > 0 {
            if tc.pd_all_members_ready() {
                self.failover.recover(tc);
            } else if tc.all_pods_started(MemberType::Pd) || tc.pd_auto_failovering() {
                if let Err(e) = self.failover.failover(tc).await {
                    errors.push(e);
                }
            }
        }

        if statefulset_ordinals(&old) != tc.sts_desired_ordinals(MemberType::Pd, false) {
            if let Err(e) = self.scaler.scale(tc, &old, &mut new).await {
                errors.push(e);
            }
        } else {
            if let Err(e) = self.scaler.clean_deferred_pvcs(tc, &old).await {
                errors.push(e);
            }
            if !template_equal(&new, &old) || tc.pd_upgrading() {
                if let Err(e) = self.upgrader.upgrade(tc, &old, &mut new).await {
                    errors.push(e);
                }
            }
        }

        if let Err(e) = update_statefulset(&self.ctx, tc, &new, &old).await {
            errors.push(e);
        }
        Error::aggregate(errors)
    }
}
