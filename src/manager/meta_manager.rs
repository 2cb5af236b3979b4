//! Propagation of cluster identity labels onto pods and PVCs.
//!
//! Pods get the cluster id and their PD member id or TiKV store id from the
//! status. Each PVC then takes the managed labels of the pod mounting it and
//! an annotation naming that pod.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

use super::Manager;
use super::utils::pod_claim_names;
use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::crd::{MemberType, TikvCluster, TikvClusterStatus};
use crate::resources::common::member_labels;
use crate::resources::labels::{ANN_POD_NAME, CLUSTER_ID_KEY, MEMBER_ID_KEY, STORE_ID_KEY};

/// Identity labels a pod should carry.
fn pod_identity(status: &TikvClusterStatus, member_type: MemberType, pod_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    if !status.cluster_id.is_empty() {
        labels.insert(CLUSTER_ID_KEY.to_string(), status.cluster_id.clone());
    }
    match member_type {
        MemberType::Pd => {
            if let Some(member) = status.pd.members.get(pod_name) {
                labels.insert(MEMBER_ID_KEY.to_string(), member.id.clone());
            }
        }
        MemberType::Tikv => {
            if let Some(store) = status.tikv.stores.values().find(|s| s.pod_name == pod_name) {
                labels.insert(STORE_ID_KEY.to_string(), store.id.clone());
            }
        }
    }
    labels
}

/// Insert `wanted` into `target`; true if anything changed.
fn merge_into(target: &mut BTreeMap<String, String>, wanted: &BTreeMap<String, String>) -> bool {
    let mut changed = false;
    for (key, value) in wanted {
        if target.get(key) != Some(value) {
            target.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

pub struct MetaManager {
    ctx: Arc<Context>,
}

impl MetaManager {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Manager for MetaManager {
    async fn sync(&self, tc: &mut TikvCluster) -> Result<()> {
        let namespace = tc.namespace().unwrap_or_default();
        let status = tc.status_ref();

        for member_type in [MemberType::Pd, MemberType::Tikv] {
            let pods = self
                .ctx
                .controls
                .pods
                .list(&namespace, &member_labels(tc, member_type))
                .await?;
            for mut pod in pods {
                let pod_name = pod.name_any();
                if merge_into(pod.labels_mut(), &pod_identity(&status, member_type, &pod_name)) {
                    debug!(cluster = %tc.key(), pod = %pod_name, "Updating pod identity labels");
                    pod = self.ctx.controls.pods.update(tc, pod).await?;
                }

                let mut wanted = member_labels(tc, member_type);
                for key in [CLUSTER_ID_KEY, MEMBER_ID_KEY, STORE_ID_KEY] {
                    if let Some(value) = pod.labels().get(key) {
                        wanted.insert(key.to_string(), value.clone());
                    }
                }
                let annotation = BTreeMap::from([(ANN_POD_NAME.to_string(), pod_name.clone())]);

                for claim in pod_claim_names(&pod) {
                    let Some(mut pvc) = self.ctx.controls.pvcs.get(&namespace, &claim).await? else {
                        continue;
                    };
                    let labels_changed = merge_into(pvc.labels_mut(), &wanted);
                    let annotations_changed = merge_into(pvc.annotations_mut(), &annotation);
                    if labels_changed || annotations_changed {
                        debug!(cluster = %tc.key(), pvc = %claim, "Updating PVC labels");
                        self.ctx.controls.pvcs.update(tc, pvc).await?;
                    }
                }
            }
        }
        Ok(())
    }
}
