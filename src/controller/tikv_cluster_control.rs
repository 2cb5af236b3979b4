//! One reconcile pass over a TikvCluster.
//!
//! A pass defaults and validates the cluster, runs every stage in order and
//! persists the status if it changed. Stage errors do not stop later stages;
//! they are combined into the returned error while the status computed by
//! the successful stages is still written.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::controller::condition::{status_needs_persist, update_ready_condition};
use crate::controller::context::Context;
use crate::controller::defaulting::set_defaults;
use crate::controller::error::{Error, Result};
use crate::controller::status::update_cluster_status;
use crate::controller::validation::{aggregate_message, validate_cluster};
use crate::crd::{MemberType, TikvCluster};
use crate::manager::Manager;
use crate::manager::discovery_manager::DiscoveryManager;
use crate::manager::meta_manager::MetaManager;
use crate::manager::orphan_pods_cleaner::OrphanPodsCleaner;
use crate::manager::pd_member_manager::PdMemberManager;
use crate::manager::tikv_member_manager::TikvMemberManager;
use crate::manager::utils::now;

/// Drives a cluster towards its spec.
#[async_trait]
pub trait ClusterControl: Send + Sync {
    async fn update_tikv_cluster(&self, tc: TikvCluster) -> Result<()>;
}

pub type Stage = (&'static str, Arc<dyn Manager>);

pub struct DefaultClusterControl {
    ctx: Arc<Context>,
    stages: Vec<Stage>,
}

impl DefaultClusterControl {
    pub fn new(ctx: Arc<Context>) -> Self {
        let stages: Vec<Stage> = vec![
            ("orphan-pods", Arc::new(OrphanPodsCleaner::new(ctx.clone()))),
            ("discovery", Arc::new(DiscoveryManager::new(ctx.clone()))),
            ("pd", Arc::new(PdMemberManager::new(ctx.clone()))),
            ("tikv", Arc::new(TikvMemberManager::new(ctx.clone()))),
            ("meta", Arc::new(MetaManager::new(ctx.clone()))),
        ];
        Self { ctx, stages }
    }

    pub fn with_stages(ctx: Arc<Context>, stages: Vec<Stage>) -> Self {
        Self { ctx, stages }
    }

    fn record_replicas(&self, tc: &TikvCluster) {
        let Some(health) = &self.ctx.health_state else {
            return;
        };
        let namespace = tc.namespace().unwrap_or_default();
        let name = tc.name_any();
        let status = tc.status_ref();
        for (member_type, snapshot) in [
            (MemberType::Pd, status.pd.stateful_set.as_ref()),
            (MemberType::Tikv, status.tikv.stateful_set.as_ref()),
        ] {
            let ready = snapshot.map(|s| s.ready_replicas).unwrap_or(0);
            health.metrics.set_tier_replicas(
                &namespace,
                &name,
                member_type.as_str(),
                i64::from(tc.sts_desired_replicas(member_type)),
                i64::from(ready),
            );
        }
    }
}

#[async_trait]
impl ClusterControl for DefaultClusterControl {
    async fn update_tikv_cluster(&self, mut tc: TikvCluster) -> Result<()> {
        let original = tc.clone();
        let key = tc.key();

        set_defaults(&mut tc);

        let field_errors = validate_cluster(&tc);
        if !field_errors.is_empty() {
            let message = aggregate_message(&field_errors);
            warn!(cluster = %key, error = %message, "TikvCluster failed validation");
            self.ctx
                .publish_warning_event(&tc, "FailedValidation", "Validating", message)
                .await;
            return Ok(());
        }

        let old_status = tc.status_ref();
        let mut errors = Vec::new();
        for (stage, manager) in &self.stages {
            if let Err(e) = manager.sync(&mut tc).await {
                debug!(cluster = %key, stage = %stage, error = %e, "Stage did not complete");
                errors.push(e);
            }
        }

        update_ready_condition(&mut tc, &now());
        self.record_replicas(&tc);

        let new_status = tc.status_ref();
        if !status_needs_persist(&old_status, &new_status) {
            return Error::aggregate(errors);
        }

        debug!(cluster = %key, "Persisting TikvCluster status");
        if let Err(e) = update_cluster_status(
            &*self.ctx.cluster_api,
            &*self.ctx.lister,
            original,
            &new_status,
        )
        .await
        {
            errors.push(e);
        }
        Error::aggregate(errors)
    }
}
