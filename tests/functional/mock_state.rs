//! A simulated TiKV cluster for functional tests.
//!
//! [`MockCluster`] owns a [`FakeEnv`] and the production orchestrator wired
//! to it. It can seed a cluster that is already running and play the part
//! of the StatefulSet controller between passes.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodStatus, Volume,
};
use kube::ResourceExt;
use kube::api::ObjectMeta;

use tikv_operator::controller::config::ControllerConfig;
use tikv_operator::controller::context::FakeEnv;
use tikv_operator::controller::defaulting::set_defaults;
use tikv_operator::controller::error::Result;
use tikv_operator::controller::status::ClusterLister;
use tikv_operator::controller::tikv_cluster_control::{ClusterControl, DefaultClusterControl};
use tikv_operator::crd::{
    MemberType, PdSpec, ResourceRequirementsSpec, TikvCluster, TikvClusterCondition,
    TikvClusterSpec, TikvSpec,
};
use tikv_operator::manager::utils::statefulset_ordinals;
use tikv_operator::pdapi::fake::FakePdClient;
use tikv_operator::resources::common::{
    data_volume_name, member_labels, member_name, ordinal_pod_name, pvc_name,
};
use tikv_operator::resources::labels::CONTROLLER_REVISION_HASH_KEY;
use tikv_operator::resources::statefulset::{
    generate_pd_statefulset, generate_tikv_statefulset, set_last_applied_config,
    set_replicas, statefulset_replicas,
};

pub const NAMESPACE: &str = "default";
pub const NAME: &str = "demo";

fn storage(size: &str) -> ResourceRequirementsSpec {
    ResourceRequirementsSpec {
        requests: BTreeMap::from([("storage".to_string(), size.to_string())]),
        ..Default::default()
    }
}

/// A valid `default/demo` cluster.
pub fn cluster_spec(pd_replicas: i32, tikv_replicas: i32) -> TikvCluster {
    let mut tc = TikvCluster::new(
        NAME,
        TikvClusterSpec {
            version: "v4.0.0".to_string(),
            pd: PdSpec {
                replicas: pd_replicas,
                base_image: "pingcap/pd".to_string(),
                resources: storage("1Gi"),
                ..Default::default()
            },
            tikv: TikvSpec {
                replicas: tikv_replicas,
                base_image: "pingcap/tikv".to_string(),
                resources: storage("10Gi"),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    tc.metadata.namespace = Some(NAMESPACE.to_string());
    tc
}

pub fn store_address(ordinal: i32) -> String {
    format!(
        "{}.{}-tikv-peer.{}.svc:20160",
        ordinal_pod_name(NAME, MemberType::Tikv, ordinal),
        NAME,
        NAMESPACE
    )
}

/// Fake environment plus the orchestrator under test.
pub struct MockCluster {
    pub env: FakeEnv,
    pub control: DefaultClusterControl,
}

impl MockCluster {
    pub fn new(config: ControllerConfig) -> Self {
        let env = FakeEnv::new(config);
        let control = DefaultClusterControl::new(env.ctx.clone());
        Self { env, control }
    }

    /// A cluster whose tiers are fully rolled out at revision "1", with
    /// healthy PD members (leader `demo-pd-0`) and Up stores with ids from 1.
    pub fn running(pd_replicas: i32, tikv_replicas: i32) -> Self {
        Self::running_with(ControllerConfig::default(), pd_replicas, tikv_replicas)
    }

    pub fn running_with(config: ControllerConfig, pd_replicas: i32, tikv_replicas: i32) -> Self {
        let mock = Self::new(config);
        let tc = cluster_spec(pd_replicas, tikv_replicas);
        mock.env.clusters.insert(tc);
        let mut tc = mock.cluster();
        set_defaults(&mut tc);

        for (member_type, replicas) in [
            (MemberType::Pd, pd_replicas),
            (MemberType::Tikv, tikv_replicas),
        ] {
            mock.env
                .controls
                .stateful_sets
                .insert(rolled_out_statefulset(&tc, member_type, replicas));
            for ordinal in 0..replicas {
                mock.env
                    .controls
                    .pods
                    .insert(tier_pod(&tc, member_type, ordinal, "1"));
                mock.env.controls.pvcs.insert(tier_pvc(&tc, member_type, ordinal));
            }
        }

        let pd = mock.pd();
        for ordinal in 0..pd_replicas {
            pd.add_member(
                &ordinal_pod_name(NAME, MemberType::Pd, ordinal),
                100 + ordinal as u64,
                true,
            );
        }
        for ordinal in 0..tikv_replicas {
            pd.add_store(ordinal as u64 + 1, &store_address(ordinal), "Up");
        }
        mock
    }

    /// The stored cluster.
    pub fn cluster(&self) -> TikvCluster {
        self.env.clusters.get(NAMESPACE, NAME).unwrap()
    }

    /// Apply `f` to the stored cluster as a user edit would.
    pub fn edit(&self, f: impl FnOnce(&mut TikvCluster)) {
        let mut tc = self.cluster();
        f(&mut tc);
        self.env.clusters.insert(tc);
    }

    pub fn pd(&self) -> Arc<FakePdClient> {
        self.env.pd.pd_client(NAMESPACE, NAME)
    }

    /// One reconcile pass over the stored cluster.
    pub async fn reconcile(&self) -> Result<()> {
        self.control.update_tikv_cluster(self.cluster()).await
    }

    /// Reconcile until a pass succeeds, settling the StatefulSets in between.
    pub async fn reconcile_until_ok(&self, max_passes: usize) -> Result<()> {
        let mut last = self.reconcile().await;
        for _ in 1..max_passes {
            if last.is_ok() {
                break;
            }
            self.settle(MemberType::Pd);
            self.settle(MemberType::Tikv);
            last = self.reconcile().await;
        }
        last
    }

    pub fn statefulset(&self, member_type: MemberType) -> StatefulSet {
        self.env
            .controls
            .stateful_sets
            .object(NAMESPACE, &member_name(NAME, member_type))
            .unwrap()
    }

    pub fn replicas(&self, member_type: MemberType) -> i32 {
        statefulset_replicas(&self.statefulset(member_type))
    }

    pub fn pod(&self, member_type: MemberType, ordinal: i32) -> Option<Pod> {
        self.env
            .controls
            .pods
            .object(NAMESPACE, &ordinal_pod_name(NAME, member_type, ordinal))
    }

    pub fn ready_condition(&self) -> Option<TikvClusterCondition> {
        self.cluster()
            .status_ref()
            .conditions
            .into_iter()
            .find(|c| c.r#type == "Ready")
    }

    /// Bump the update revision of a tier, as a template change would.
    pub fn start_rollout(&self, member_type: MemberType, revision: &str) {
        self.env.controls.stateful_sets.modify(
            NAMESPACE,
            &member_name(NAME, member_type),
            |sts| {
                if let Some(status) = sts.status.as_mut() {
                    status.update_revision = Some(revision.to_string());
                }
            },
        );
    }

    /// Act as the StatefulSet controller for one tier: run a pod for every
    /// ordinal of the set (new pods at the update revision), remove pods of
    /// dropped ordinals and report the result in the StatefulSet status.
    pub fn settle(&self, member_type: MemberType) {
        let Some(sts) = self
            .env
            .controls
            .stateful_sets
            .object(NAMESPACE, &member_name(NAME, member_type))
        else {
            return;
        };
        let tc = self.cluster();
        let ordinals = statefulset_ordinals(&sts);
        let status = sts.status.clone().unwrap_or_default();
        let update_revision = status.update_revision.clone().unwrap_or_else(|| "1".to_string());

        let prefix = format!("{}-", member_name(NAME, member_type));
        for pod in self.env.controls.pods.objects() {
            let name = pod.name_any();
            let ordinal = name
                .strip_prefix(&prefix)
                .and_then(|o| o.parse::<i32>().ok());
            if ordinal.is_some_and(|o| !ordinals.contains(&o)) {
                self.env.controls.pods.remove(NAMESPACE, &name);
            }
        }
        for &ordinal in &ordinals {
            if self.pod(member_type, ordinal).is_none() {
                self.env
                    .controls
                    .pods
                    .insert(tier_pod(&tc, member_type, ordinal, &update_revision));
            }
            let claim = pvc_name(member_type, &ordinal_pod_name(NAME, member_type, ordinal));
            if self.env.controls.pvcs.object(NAMESPACE, &claim).is_none() {
                self.env.controls.pvcs.insert(tier_pvc(&tc, member_type, ordinal));
            }
        }

        let replicas = ordinals.len() as i32;
        let all_updated = ordinals.iter().all(|&o| {
            self.pod(member_type, o).is_some_and(|p| {
                p.labels().get(CONTROLLER_REVISION_HASH_KEY) == Some(&update_revision)
            })
        });
        self.env.controls.stateful_sets.modify(
            NAMESPACE,
            &member_name(NAME, member_type),
            |sts| {
                let status = sts.status.get_or_insert_with(Default::default);
                status.replicas = replicas;
                status.ready_replicas = Some(replicas);
                status.current_replicas = Some(replicas);
                status.updated_replicas = Some(replicas);
                status.observed_generation = sts.metadata.generation;
                status.update_revision = Some(update_revision.clone());
                if all_updated {
                    status.current_revision = Some(update_revision.clone());
                }
            },
        );
    }
}

/// The tier StatefulSet as the operator applies it, fully rolled out.
pub fn rolled_out_statefulset(tc: &TikvCluster, member_type: MemberType, replicas: i32) -> StatefulSet {
    let cm_name = member_name(NAME, member_type);
    let mut sts = match member_type {
        MemberType::Pd => generate_pd_statefulset(tc, &cm_name),
        MemberType::Tikv => generate_tikv_statefulset(tc, &cm_name),
    };
    set_replicas(&mut sts, replicas);
    set_last_applied_config(&mut sts).unwrap();
    sts.metadata.generation = Some(1);
    sts.status = Some(StatefulSetStatus {
        replicas,
        ready_replicas: Some(replicas),
        current_replicas: Some(replicas),
        updated_replicas: Some(replicas),
        current_revision: Some("1".to_string()),
        update_revision: Some("1".to_string()),
        observed_generation: Some(1),
        ..Default::default()
    });
    sts
}

/// A running tier pod at `revision` mounting its PVC.
pub fn tier_pod(tc: &TikvCluster, member_type: MemberType, ordinal: i32, revision: &str) -> Pod {
    let name = ordinal_pod_name(NAME, member_type, ordinal);
    let mut labels = member_labels(tc, member_type);
    labels.insert(CONTROLLER_REVISION_HASH_KEY.to_string(), revision.to_string());
    Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            volumes: Some(vec![Volume {
                name: data_volume_name(member_type).to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: pvc_name(member_type, &name),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

pub fn tier_pvc(tc: &TikvCluster, member_type: MemberType, ordinal: i32) -> PersistentVolumeClaim {
    let pod_name = ordinal_pod_name(NAME, member_type, ordinal);
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(pvc_name(member_type, &pod_name)),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(member_labels(tc, member_type)),
            ..Default::default()
        },
        ..Default::default()
    }
}
