//! Single-pass scenarios over a seeded cluster.

use tikv_operator::controller::condition::{
    REASON_PD_UNHEALTHY, REASON_READY, REASON_STATEFULSET_NOT_UP_TO_DATE,
    REASON_TIKV_STORE_NOT_UP,
};
use tikv_operator::controller::config::ControllerConfig;
use tikv_operator::controller::error::Error;
use tikv_operator::crd::{MemberType, StoreState};
use tikv_operator::pdapi::fake::PdMethod;
use tikv_operator::resources::labels::{CLUSTER_ID_KEY, MEMBER_ID_KEY, STORE_ID_KEY};

use crate::mock_state::{MockCluster, cluster_spec, store_address};

/// Scenario A: three healthy PD members and three Up stores, all rolled out.
#[tokio::test]
async fn test_healthy_cluster_is_ready() {
    let mock = MockCluster::running(3, 3);

    mock.reconcile().await.unwrap();

    let condition = mock.ready_condition().unwrap();
    assert_eq!(condition.status, "True");
    assert_eq!(condition.reason, REASON_READY);
    assert_eq!(condition.message, "TiKV cluster is fully up and running");

    let status = mock.cluster().status_ref();
    assert_eq!(status.cluster_id, "6800");
    assert!(status.pd.synced);
    assert!(status.tikv.synced);
    assert_eq!(status.pd.members.len(), 3);
    assert_eq!(status.pd.leader.unwrap().name, "demo-pd-0");
    assert_eq!(status.tikv.stores.len(), 3);
    assert!(status.tikv.stores.values().all(|s| s.state == StoreState::Up));
    assert_eq!(status.tikv.stores["2"].pod_name, "demo-tikv-1");
}

/// Scenario C: a TiKV rollout in progress wins over healthy members.
#[tokio::test]
async fn test_rollout_in_progress_is_not_ready() {
    let mock = MockCluster::running(3, 3);
    mock.start_rollout(MemberType::Tikv, "2");

    // The upgrader starts evicting leaders, which is not an error.
    let result = mock.reconcile().await;
    assert!(result.as_ref().is_ok() || result.as_ref().is_err_and(Error::is_requeue));

    let condition = mock.ready_condition().unwrap();
    assert_eq!(condition.status, "False");
    assert_eq!(condition.reason, REASON_STATEFULSET_NOT_UP_TO_DATE);
    assert_eq!(condition.message, "Statefulset(s) are in progress");
}

/// Scenario D: the first status write conflicts and the retry succeeds.
#[tokio::test]
async fn test_status_conflict_is_retried() {
    let mock = MockCluster::running(3, 3);
    mock.env
        .clusters
        .update_tracker
        .set_error(|| Error::Conflict("the object has been modified".to_string()));

    mock.reconcile().await.unwrap();

    assert_eq!(mock.env.clusters.status_writes(), 1);
    assert_eq!(mock.ready_condition().unwrap().status, "True");
}

#[tokio::test]
async fn test_second_pass_writes_nothing() {
    let mock = MockCluster::running(3, 3);
    mock.reconcile().await.unwrap();
    let writes = mock.env.clusters.status_writes();
    mock.env.controls.stateful_sets.clear_writes();
    mock.env.controls.pods.clear_writes();
    mock.env.controls.pvcs.clear_writes();
    mock.env.controls.services.clear_writes();

    mock.reconcile().await.unwrap();

    assert_eq!(mock.env.clusters.status_writes(), writes);
    assert!(mock.env.controls.stateful_sets.writes().is_empty());
    assert!(mock.env.controls.pods.writes().is_empty());
    assert!(mock.env.controls.pvcs.writes().is_empty());
    assert!(mock.env.controls.services.writes().is_empty());
}

#[tokio::test]
async fn test_unhealthy_pd_member_is_reported() {
    let mock = MockCluster::running(3, 3);
    mock.pd().set_member_health("demo-pd-1", false);

    mock.reconcile().await.unwrap();

    let condition = mock.ready_condition().unwrap();
    assert_eq!(condition.status, "False");
    assert_eq!(condition.reason, REASON_PD_UNHEALTHY);
}

#[tokio::test]
async fn test_down_store_is_reported() {
    let mock = MockCluster::running(3, 3);
    mock.pd().set_store_state(3, "Down");

    // The default failover period has not passed, so nothing is replaced.
    mock.reconcile().await.unwrap();

    let condition = mock.ready_condition().unwrap();
    assert_eq!(condition.reason, REASON_TIKV_STORE_NOT_UP);
    assert!(mock.cluster().status_ref().tikv.failure_stores.is_empty());
    assert_eq!(mock.replicas(MemberType::Tikv), 3);
}

#[tokio::test]
async fn test_pd_api_failure_still_persists_status() {
    let mock = MockCluster::running(3, 3);
    mock.reconcile().await.unwrap();
    mock.pd().fail(PdMethod::GetStores, "connection refused");

    mock.reconcile().await.unwrap();

    let status = mock.cluster().status_ref();
    assert!(status.pd.synced);
    assert!(!status.tikv.synced);
    // Stores from the previous pass are kept.
    assert_eq!(status.tikv.stores.len(), 3);
}

#[tokio::test]
async fn test_invalid_cluster_is_not_reconciled() {
    let mock = MockCluster::new(ControllerConfig::default());
    let mut tc = cluster_spec(3, 3);
    tc.spec.tikv.resources.requests.clear();
    mock.env.clusters.insert(tc);

    mock.reconcile().await.unwrap();

    assert_eq!(mock.env.events.reasons(), vec!["FailedValidation".to_string()]);
    assert!(mock.env.controls.stateful_sets.objects().is_empty());
    assert_eq!(mock.env.clusters.status_writes(), 0);
}

#[tokio::test]
async fn test_paused_cluster_keeps_statefulsets() {
    let mock = MockCluster::running(3, 3);
    mock.edit(|tc| {
        tc.spec.paused = true;
        tc.spec.tikv.replicas = 5;
    });

    mock.reconcile().await.unwrap();

    assert_eq!(mock.replicas(MemberType::Tikv), 3);
    assert!(mock.cluster().status_ref().tikv.synced);
}

#[tokio::test]
async fn test_identity_labels_reach_pods_and_pvcs() {
    let mock = MockCluster::running(3, 3);

    mock.reconcile().await.unwrap();

    let pd_pod = mock.pod(MemberType::Pd, 2).unwrap();
    assert_eq!(pd_pod.metadata.labels.as_ref().unwrap()[CLUSTER_ID_KEY], "6800");
    assert_eq!(pd_pod.metadata.labels.as_ref().unwrap()[MEMBER_ID_KEY], "102");
    let pvc = mock
        .env
        .controls
        .pvcs
        .object("default", "tikv-demo-tikv-0")
        .unwrap();
    assert_eq!(pvc.metadata.labels.as_ref().unwrap()[STORE_ID_KEY], "1");
}

/// A new cluster is brought up from nothing: PD bootstraps from one member,
/// then PD and TiKV grow to their desired sizes.
#[tokio::test]
async fn test_bootstrap_from_empty() {
    let mock = MockCluster::new(ControllerConfig::default());
    mock.env.clusters.insert(cluster_spec(3, 3));

    let err = mock.reconcile().await.unwrap_err();
    assert!(err.is_requeue());
    assert_eq!(mock.replicas(MemberType::Pd), 1);
    assert!(mock.env.controls.deployments.object("default", "demo-discovery").is_some());
    assert!(
        mock.env
            .controls
            .stateful_sets
            .object("default", "demo-tikv")
            .is_none()
    );

    // The first PD member comes up.
    mock.settle(MemberType::Pd);
    mock.pd().add_member("demo-pd-0", 100, true);
    mock.reconcile().await.unwrap_err();
    assert_eq!(mock.replicas(MemberType::Pd), 2);

    // Two healthy members form a quorum: PD grows to three and the TiKV
    // StatefulSet is created at full size.
    mock.settle(MemberType::Pd);
    mock.pd().add_member("demo-pd-1", 101, true);
    mock.reconcile().await.unwrap();
    assert_eq!(mock.replicas(MemberType::Pd), 3);
    assert_eq!(mock.replicas(MemberType::Tikv), 3);

    mock.settle(MemberType::Pd);
    mock.settle(MemberType::Tikv);
    mock.pd().add_member("demo-pd-2", 102, true);
    for ordinal in 0..3 {
        mock.pd().add_store(ordinal as u64 + 1, &store_address(ordinal), "Up");
    }
    mock.reconcile().await.unwrap();
    assert_eq!(mock.ready_condition().unwrap().status, "True");
}
