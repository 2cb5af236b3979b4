//! Removal of orphaned tier pods.
//!
//! A pod is orphaned when its ordinal is outside what the tier StatefulSet
//! runs, or when it is Pending and its claim was deleted. A Pending pod
//! without its PVC can never schedule; deleting it lets the StatefulSet
//! controller recreate it together with a new PVC.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::info;

use super::Manager;
use super::utils::{pod_claim_names, pod_phase, statefulset_ordinals};
use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::crd::{MemberType, TikvCluster};
use crate::resources::common::{member_labels, member_name, ordinal_from_name};

pub struct OrphanPodsCleaner {
    ctx: Arc<Context>,
}

impl OrphanPodsCleaner {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn claim_missing(&self, namespace: &str, pod: &Pod) -> Result<bool> {
        for claim in pod_claim_names(pod) {
            if self.ctx.controls.pvcs.get(namespace, &claim).await?.is_none() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl Manager for OrphanPodsCleaner {
    async fn sync(&self, tc: &mut TikvCluster) -> Result<()> {
        if tc.spec.paused {
            return Ok(());
        }
        let namespace = tc.namespace().unwrap_or_default();

        for member_type in [MemberType::Pd, MemberType::Tikv] {
            let sts_name = member_name(&tc.name_any(), member_type);
            // Without the StatefulSet there is no expected ordinal set yet.
            let expected = self
                .ctx
                .controls
                .stateful_sets
                .get(&namespace, &sts_name)
                .await?
                .map(|sts| statefulset_ordinals(&sts));
            let pods = self
                .ctx
                .controls
                .pods
                .list(&namespace, &member_labels(tc, member_type))
                .await?;
            for pod in pods {
                let pod_name = pod.name_any();
                let unexpected = match (&expected, ordinal_from_name(&pod_name)) {
                    (Some(ordinals), Some(ordinal)) => !ordinals.contains(&ordinal),
                    _ => false,
                };
                if unexpected {
                    info!(cluster = %tc.key(), pod = %pod_name, "Deleting pod outside the StatefulSet ordinals");
                } else if pod_phase(&pod) == "Pending" && self.claim_missing(&namespace, &pod).await? {
                    info!(cluster = %tc.key(), pod = %pod_name, "Deleting pending pod whose PVC is gone");
                } else {
                    continue;
                }
                self.ctx.controls.pods.delete(tc, &namespace, &pod_name).await?;
            }
        }
        Ok(())
    }
}
