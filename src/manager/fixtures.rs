//! Objects shared by the manager tests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodStatus, Volume,
};
use kube::api::ObjectMeta;

use super::utils::now;
use crate::crd::{
    MemberType, PdMember, PdSpec, ResourceRequirementsSpec, StatefulSetStatusSnapshot, StoreState,
    TikvCluster, TikvClusterSpec, TikvClusterStatus, TikvSpec, TikvStore,
};
use crate::resources::common::{
    data_volume_name, member_labels, member_name, ordinal_pod_name, pvc_name,
};
use crate::resources::labels::CONTROLLER_REVISION_HASH_KEY;
use crate::resources::statefulset::{
    generate_pd_statefulset, generate_tikv_statefulset, set_last_applied_config,
    set_replicas,
};

fn storage(size: &str) -> ResourceRequirementsSpec {
    ResourceRequirementsSpec {
        requests: BTreeMap::from([("storage".to_string(), size.to_string())]),
        ..Default::default()
    }
}

/// Cluster `default/demo` with the given replica counts.
pub fn cluster(pd_replicas: i32, tikv_replicas: i32) -> TikvCluster {
    let mut tc = TikvCluster::new(
        "demo",
        TikvClusterSpec {
            version: "v4.0.0".to_string(),
            pd: PdSpec {
                replicas: pd_replicas,
                base_image: "pingcap/pd".to_string(),
                resources: storage("1Gi"),
                max_failover_count: Some(3),
                ..Default::default()
            },
            tikv: TikvSpec {
                replicas: tikv_replicas,
                base_image: "pingcap/tikv".to_string(),
                resources: storage("10Gi"),
                max_failover_count: Some(3),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    tc.metadata.namespace = Some("default".to_string());
    tc.metadata.uid = Some("tc-uid-demo".to_string());
    tc
}

fn snapshot(replicas: i32) -> Option<StatefulSetStatusSnapshot> {
    Some(StatefulSetStatusSnapshot {
        replicas,
        ready_replicas: replicas,
        current_replicas: replicas,
        updated_replicas: replicas,
        current_revision: Some("1".to_string()),
        update_revision: Some("1".to_string()),
        observed_generation: Some(1),
    })
}

/// Three healthy PD members (leader `demo-pd-0`) and three Up stores with ids 1 to 3.
pub fn set_synced_status(tc: &mut TikvCluster) {
    let mut status = TikvClusterStatus {
        cluster_id: "6800".to_string(),
        ..Default::default()
    };
    status.pd.synced = true;
    status.pd.stateful_set = snapshot(3);
    status.tikv.synced = true;
    status.tikv.stateful_set = snapshot(3);
    for i in 0..3 {
        let name = ordinal_pod_name("demo", MemberType::Pd, i);
        status.pd.members.insert(
            name.clone(),
            PdMember {
                name: name.clone(),
                id: (100 + i).to_string(),
                client_url: format!("http://{}.demo-pd-peer.default.svc:2379", name),
                health: true,
                last_transition_time: Some(now()),
            },
        );
        let pod_name = ordinal_pod_name("demo", MemberType::Tikv, i);
        let id = (i + 1).to_string();
        status.tikv.stores.insert(
            id.clone(),
            TikvStore {
                id,
                ip: format!("{}.demo-tikv-peer.default.svc", pod_name),
                pod_name,
                leader_count: 1,
                state: StoreState::Up,
                last_heartbeat_time: now(),
                last_transition_time: Some(now()),
            },
        );
    }
    status.pd.leader = status.pd.members.get("demo-pd-0").cloned();
    tc.status = Some(status);
}

/// The tier StatefulSet as the operator would have applied it, with `replicas` running.
pub fn statefulset(tc: &TikvCluster, member_type: MemberType, replicas: i32) -> StatefulSet {
    let cm_name = member_name("demo", member_type);
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

/// A running tier pod at `revision`, mounting its PVC.
pub fn pod(tc: &TikvCluster, member_type: MemberType, ordinal: i32, revision: &str) -> Pod {
    let name = ordinal_pod_name("demo", member_type, ordinal);
    let mut labels = member_labels(tc, member_type);
    labels.insert(CONTROLLER_REVISION_HASH_KEY.to_string(), revision.to_string());
    Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some("default".to_string()),
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

/// The PVC of a tier pod.
pub fn pvc(tc: &TikvCluster, member_type: MemberType, ordinal: i32) -> PersistentVolumeClaim {
    let pod_name = ordinal_pod_name("demo", member_type, ordinal);
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(pvc_name(member_type, &pod_name)),
            namespace: Some("default".to_string()),
            labels: Some(member_labels(tc, member_type)),
            ..Default::default()
        },
        ..Default::default()
    }
}
