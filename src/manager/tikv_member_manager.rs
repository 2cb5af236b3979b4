//! Member manager of the TiKV tier.
//!
//! Waits for PD to be available, then keeps the TiKV peer service, ConfigMap
//! and StatefulSet in line with the spec and mirrors the stores PD knows
//! about into the status.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::pd_member_manager::tier_phase;
use super::scaler::TierScaler;
use super::tikv_failover::TikvFailover;
use super::tikv_upgrader::TikvUpgrader;
use super::utils::{now, statefulset_ordinals, sync_config_map, sync_service, update_statefulset};
use super::{Failover, Manager, Scaler, Upgrader};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::crd::{MemberType, StoreState, TikvCluster, TikvStore};
use crate::pdapi::{PdApiError, StoreInfo};
use crate::requeue;
use crate::resources::common::{member_labels, member_name};
use crate::resources::configmap::generate_configmap;
use crate::resources::services::generate_peer_service;
use crate::resources::statefulset::{
    container_image, generate_tikv_statefulset, set_last_applied_config,
    set_replicas, statefulset_replicas,
    status_snapshot, template_equal,
};

/// Host and pod name of a store address `{pod}.{peer-service}.{ns}.svc:{port}`.
pub fn parse_store_address(address: &str) -> (String, String) {
    let host = address
        .rsplit_once(':')
        .map_or(address, |(host, _)| host);
    let pod_name = host.split('.').next().unwrap_or_default();
    (host.to_string(), pod_name.to_string())
}

fn to_store(info: StoreInfo, previous: Option<&TikvStore>) -> TikvStore {
    let (ip, pod_name) = parse_store_address(&info.store.address);
    let state = StoreState::from_name(&info.store.state_name);
    let last_transition_time = match previous {
        Some(old) if old.state == state => old.last_transition_time.clone().or_else(|| Some(now())),
        _ => Some(now()),
    };
    TikvStore {
        id: info.store.id.to_string(),
        pod_name,
        ip,
        leader_count: info.status.leader_count,
        state,
        last_heartbeat_time: info.status.last_heartbeat_ts,
        last_transition_time,
    }
}

pub struct TikvMemberManager {
    ctx: Arc<Context>,
    scaler: Arc<dyn Scaler>,
    failover: Arc<dyn Failover>,
    upgrader: Arc<dyn Upgrader>,
}

impl TikvMemberManager {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            scaler: Arc::new(TierScaler::tikv(ctx.clone())),
            failover: Arc::new(TikvFailover::new(ctx.clone())),
            upgrader: Arc::new(TikvUpgrader::new(ctx.clone())),
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

    async fn pull_stores(
        &self,
        tc: &TikvCluster,
    ) -> std::result::Result<(BTreeMap<String, TikvStore>, BTreeMap<String, TikvStore>), PdApiError> {
        let pd = self.ctx.pd_client(tc);
        let live = pd.get_stores().await?;
        let tombstones = pd.get_tombstone_stores().await?;

        let previous = tc.status_ref().tikv;
        let stores = live
            .stores
            .into_iter()
            .map(|info| {
                let id = info.store.id.to_string();
                let store = to_store(info, previous.stores.get(&id));
                (id, store)
            })
            .collect();
        let tombstone_stores = tombstones
            .stores
            .into_iter()
            .map(|info| {
                let id = info.store.id.to_string();
                let store = to_store(info, previous.tombstone_stores.get(&id));
                (id, store)
            })
            .collect();
        Ok((stores, tombstone_stores))
    }

    async fn sync_status(&self, tc: &mut TikvCluster, sts: &StatefulSet) -> Result<()> {
        let namespace = tc.namespace().unwrap_or_default();
        let pods = self
            .ctx
            .controls
            .pods
            .list(&namespace, &member_labels(tc, MemberType::Tikv))
            .await?;
        {
            let status = &mut tc.status.get_or_insert_with(Default::default).tikv;
            status.stateful_set = status_snapshot(sts);
            status.phase = tier_phase(sts, &pods);
            status.image = container_image(sts, MemberType::Tikv).unwrap_or_default();
        }

        match self.pull_stores(tc).await {
            Ok((stores, tombstone_stores)) => {
                let status = &mut tc.status.get_or_insert_with(Default::default).tikv;
                status.synced = true;
                status.stores = stores;
                status.tombstone_stores = tombstone_stores;
            }
            Err(e) => {
                warn!(cluster = %tc.key(), error = %e, "Failed to get TiKV stores from PD");
                tc.status.get_or_insert_with(Default::default).tikv.synced = false;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Manager for TikvMemberManager {
    async fn sync(&self, tc: &mut TikvCluster) -> Result<()> {
        if !tc.pd_is_available() {
            return Err(requeue!(
                "TikvCluster: [{}], waiting for PD cluster running",
                tc.key()
            ));
        }

        let namespace = tc.namespace().unwrap_or_default();
        sync_service(&self.ctx, tc, generate_peer_service(tc, MemberType::Tikv)).await?;
        let cm = sync_config_map(&self.ctx, tc, generate_configmap(tc, MemberType::Tikv)).await?;
        let cm_name = cm.name_any();

        let sts_name = member_name(&tc.name_any(), MemberType::Tikv);
        let Some(old) = self
            .ctx
            .controls
            .stateful_sets
            .get(&namespace, &sts_name)
            .await?
        else {
            let mut sts = generate_tikv_statefulset(tc, &cm_name);
            set_last_applied_config(&mut sts)?;
            info!(
                cluster = %tc.key(),
                statefulset = %sts_name,
                replicas = statefulset_replicas(&sts),
                "Creating TiKV StatefulSet"
            );
            self.ctx.controls.stateful_sets.create(tc, sts).await?;
            tc.status.get_or_insert_with(Default::default).tikv.stateful_set = Some(Default::default());
            return Ok(());
        };

        self.sync_status(tc, &old).await?;
        if tc.spec.paused {
            debug!(cluster = %tc.key(), "Cluster is paused, skipping TiKV sync");
            return Ok(());
        }

        let mut new = generate_tikv_statefulset(tc, &cm_name);
        set_replicas(&mut new, statefulset_replicas(&old));

        let mut errors = Vec::new();
        // Store states are stale while PD cannot be reached.
        let synced = tc.status_ref().tikv.synced;
        if synced && self.ctx.config.auto_failover && tc.spec.tikv.max_failover_count.unwrap_or(0) > 0 {
            if tc.tikv_all_stores_ready() {
                self.failover.recover(tc);
            } else if tc.all_pods_started(MemberType::Tikv) {
                if let Err(e) = self.failover.failover(tc).await {
                    errors.push(e);
                }
            }
        }

        if statefulset_ordinals(&old) != tc.sts_desired_ordinals(MemberType::Tikv, false) {
            if let Err(e) = self.scaler.scale(tc, &old, &mut new).await {
                errors.push(e);
            }
        } else {
            if let Err(e) = self.scaler.clean_deferred_pvcs(tc, &old).await {
                errors.push(e);
            }
            if !template_equal(&new, &old) || tc.tikv_upgrading() {
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
