//! Replacement of PD members that stay unhealthy.
//!
//! A member unhealthy for longer than the failover period is recorded as a
//! failure member, which raises the desired StatefulSet replicas by one. On
//! the next pass the failed member is removed from PD together with its pod
//! and PVC, so the StatefulSet recreates the pod as a fresh member.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{info, warn};

use super::Failover;
use super::utils::{elapsed_since, now};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::crd::{MemberType, PdFailureMember, TikvCluster};
use crate::requeue;
use crate::resources::common::pvc_name;

pub struct PdFailover {
    ctx: Arc<Context>,
}

impl PdFailover {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Record the first member unhealthy past the failover period.
    async fn try_mark_failure(&self, tc: &mut TikvCluster) -> Result<()> {
        let status = tc.status_ref();
        let max_failover_count = tc.spec.pd.max_failover_count.unwrap_or(0).max(0) as usize;
        let period = self.ctx.config.pd_failover_period;

        for member in status.pd.members.values().filter(|m| !m.health) {
            if status.pd.failure_members.contains_key(&member.name) {
                continue;
            }
            let Some(elapsed) = member.last_transition_time.as_deref().and_then(elapsed_since) else {
                continue;
            };
            if elapsed < period {
                continue;
            }
            if status.pd.failure_members.len() >= max_failover_count {
                warn!(
                    cluster = %tc.key(),
                    member = %member.name,
                    max_failover_count,
                    "PD failover budget exhausted, not replacing member"
                );
                return Ok(());
            }

            let namespace = tc.namespace().unwrap_or_default();
            let claim = pvc_name(MemberType::Pd, &member.name);
            let pvc = self.ctx.controls.pvcs.get(&namespace, &claim).await?;
            let pvc_uid = pvc.and_then(|p| p.uid()).unwrap_or_default();

            let record = PdFailureMember {
                pod_name: member.name.clone(),
                member_id: member.id.clone(),
                pvc_uid,
                member_deleted: false,
                created_at: now(),
            };
            tc.status
                .get_or_insert_with(Default::default)
                .pd
                .failure_members
                .insert(member.name.clone(), record);

            let note = format!(
                "PD member {} has been unhealthy for more than {}",
                member.name,
                humantime::format_duration(period)
            );
            warn!(cluster = %tc.key(), member = %member.name, "{}", note);
            self.ctx
                .publish_warning_event(tc, "Unhealthy", "Failover", note)
                .await;
            return Err(requeue!(
                "TikvCluster: [{}], marked PD member {} as failure",
                tc.key(),
                member.name
            ));
        }
        Ok(())
    }

    /// Remove a recorded member from PD, then its pod and PVC.
    async fn try_delete_member(&self, tc: &mut TikvCluster, failure: PdFailureMember) -> Result<()> {
        let namespace = tc.namespace().unwrap_or_default();
        let id: u64 = failure.member_id.parse().map_err(|_| {
            Error::Transient(format!(
                "invalid member id {:?} for pod {}",
                failure.member_id, failure.pod_name
            ))
        })?;
        self.ctx.pd_client(tc).delete_member_by_id(id).await?;
        info!(cluster = %tc.key(), member = %failure.pod_name, id, "Deleted failed PD member");

        if self
            .ctx
            .controls
            .pods
            .get(&namespace, &failure.pod_name)
            .await?
            .is_some()
        {
            self.ctx
                .controls
                .pods
                .delete(tc, &namespace, &failure.pod_name)
                .await?;
        }

        let claim = pvc_name(MemberType::Pd, &failure.pod_name);
        if let Some(pvc) = self.ctx.controls.pvcs.get(&namespace, &claim).await? {
            // A PVC with another uid was already recreated for the replacement.
            if pvc.uid().as_deref() == Some(failure.pvc_uid.as_str()) {
                self.ctx.controls.pvcs.delete(tc, &namespace, &claim).await?;
            }
        }

        if let Some(record) = tc
            .status
            .get_or_insert_with(Default::default)
            .pd
            .failure_members
            .get_mut(&failure.pod_name)
        {
            record.member_deleted = true;
        }
        Ok(())
    }
}

#[async_trait]
impl Failover for PdFailover {
    async fn failover(&self, tc: &mut TikvCluster) -> Result<()> {
        let status = tc.status_ref();
        if !status.pd.synced {
            return Err(requeue!(
                "TikvCluster: [{}], PD status is not synced, can't failover",
                tc.key()
            ));
        }

        let members = status.pd.members.len();
        let healthy = status.pd.members.values().filter(|m| m.health).count();
        if healthy <= members / 2 {
            return Err(requeue!(
                "TikvCluster: [{}], {} of {} PD members are healthy, no quorum to failover",
                tc.key(),
                healthy,
                members
            ));
        }

        let pending = status
            .pd
            .failure_members
            .values()
            .find(|m| !m.member_deleted)
            .cloned();
        match pending {
            Some(failure) => self.try_delete_member(tc, failure).await,
            None => self.try_mark_failure(tc).await,
        }
    }

    fn recover(&self, tc: &mut TikvCluster) {
        let key = tc.key();
        if let Some(status) = tc.status.as_mut() {
            if !status.pd.failure_members.is_empty() {
                info!(cluster = %key, "PD is healthy again, clearing failure members");
                status.pd.failure_members.clear();
            }
        }
    }
}
