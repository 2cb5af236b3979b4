//! Multi-pass lifecycle flows: scaling, failover and rolling upgrades.

use std::time::Duration;

use kube::ResourceExt;

use tikv_operator::controller::config::ControllerConfig;
use tikv_operator::crd::{MemberPhase, MemberType, StoreState};
use tikv_operator::pdapi::fake::{PdAction, PdMethod};
use tikv_operator::resources::labels::{ANN_EVICT_LEADER_BEGIN_TIME, ANN_PVC_DEFER_DELETING};

use crate::mock_state::{MockCluster, NAMESPACE, store_address};

fn immediate_failover() -> ControllerConfig {
    ControllerConfig {
        pd_failover_period: Duration::ZERO,
        tikv_failover_period: Duration::ZERO,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_tikv_scale_out() {
    let mock = MockCluster::running(3, 3);
    mock.edit(|tc| tc.spec.tikv.replicas = 4);

    mock.reconcile().await.unwrap();
    assert_eq!(mock.replicas(MemberType::Tikv), 4);

    mock.settle(MemberType::Tikv);
    mock.pd().add_store(4, &store_address(3), "Up");
    mock.reconcile().await.unwrap();

    assert!(mock.pod(MemberType::Tikv, 3).is_some());
    assert_eq!(mock.cluster().status_ref().tikv.stores["4"].pod_name, "demo-tikv-3");
    assert_eq!(mock.ready_condition().unwrap().status, "True");
}

#[tokio::test]
async fn test_tikv_scale_in_waits_for_tombstone() {
    let mock = MockCluster::running(3, 4);
    mock.edit(|tc| tc.spec.tikv.replicas = 3);

    // The store is taken offline first; the ordinal stays until PD drains it.
    let err = mock.reconcile().await.unwrap_err();
    assert!(err.is_requeue());
    assert_eq!(mock.pd().store_state(4).as_deref(), Some("Offline"));
    assert_eq!(mock.replicas(MemberType::Tikv), 4);

    let err = mock.reconcile().await.unwrap_err();
    assert!(err.is_requeue());
    assert_eq!(mock.replicas(MemberType::Tikv), 4);

    mock.pd().set_store_state(4, "Tombstone");
    mock.reconcile().await.unwrap();
    assert_eq!(mock.replicas(MemberType::Tikv), 3);
    let pvc = mock
        .env
        .controls
        .pvcs
        .object(NAMESPACE, "tikv-demo-tikv-3")
        .unwrap();
    assert!(pvc.annotations().contains_key(ANN_PVC_DEFER_DELETING));
    assert!(mock.cluster().status_ref().tikv.tombstone_stores.contains_key("4"));

    // Once the pod is gone the deferred claim is released.
    mock.settle(MemberType::Tikv);
    mock.reconcile().await.unwrap();
    assert!(mock.pod(MemberType::Tikv, 3).is_none());
    assert!(
        mock.env
            .controls
            .pvcs
            .object(NAMESPACE, "tikv-demo-tikv-3")
            .is_none()
    );
}

#[tokio::test]
async fn test_delete_slot_inside_range_is_rejected() {
    let mock = MockCluster::running(3, 3);
    mock.edit(|tc| {
        tc.spec.tikv.replicas = 2;
        tc.annotations_mut().insert(
            tikv_operator::crd::ANN_TIKV_DELETE_SLOTS.to_string(),
            "[1]".to_string(),
        );
    });

    // Dropping ordinal 1 from a StatefulSet would remove pod 2 instead.
    mock.reconcile().await.unwrap();

    assert!(mock.env.events.reasons().contains(&"FailedValidation".to_string()));
    assert!(!mock.pd().calls().iter().any(|c| matches!(c, PdAction::DeleteStore(_))));
    assert_eq!(mock.pd().store_state(2).as_deref(), Some("Up"));
    assert_eq!(mock.replicas(MemberType::Tikv), 3);
}

#[tokio::test]
async fn test_pd_scale_in_removes_member() {
    let mock = MockCluster::running(5, 3);
    mock.edit(|tc| tc.spec.pd.replicas = 4);

    mock.reconcile().await.unwrap();

    assert_eq!(mock.replicas(MemberType::Pd), 4);
    assert!(
        mock.pd()
            .calls()
            .contains(&PdAction::DeleteMember("demo-pd-4".to_string()))
    );
    assert!(!mock.pd().member_names().contains(&"demo-pd-4".to_string()));
    let pvc = mock.env.controls.pvcs.object(NAMESPACE, "pd-demo-pd-4").unwrap();
    assert!(pvc.annotations().contains_key(ANN_PVC_DEFER_DELETING));
}

/// Scenario B: a store Down past the failover period gets a replacement.
#[tokio::test]
async fn test_tikv_failover_adds_replica() {
    let mock = MockCluster::running_with(immediate_failover(), 3, 3);
    mock.pd().set_store_state(1, "Down");

    mock.reconcile().await.unwrap();

    let tc = mock.cluster();
    let failures = tc.status_ref().tikv.failure_stores;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures["1"].pod_name, "demo-tikv-0");
    assert_eq!(tc.tikv_sts_desired_replicas(), 4);
    assert_eq!(mock.replicas(MemberType::Tikv), 4);
    assert!(mock.env.events.reasons().contains(&"Unhealthy".to_string()));

    // The store comes back and the replacement registers: the record is
    // cleared and the extra store is drained again.
    mock.settle(MemberType::Tikv);
    mock.pd().set_store_state(1, "Up");
    mock.pd().add_store(4, &store_address(3), "Up");
    let err = mock.reconcile().await.unwrap_err();
    assert!(err.is_requeue());
    assert!(mock.cluster().status_ref().tikv.failure_stores.is_empty());
    assert_eq!(mock.pd().store_state(4).as_deref(), Some("Offline"));
}

#[tokio::test]
async fn test_tikv_failover_respects_budget() {
    let mock = MockCluster::running_with(immediate_failover(), 3, 3);
    mock.edit(|tc| tc.spec.tikv.max_failover_count = Some(1));
    mock.pd().set_store_state(1, "Down");
    mock.pd().set_store_state(2, "Down");

    mock.reconcile().await.unwrap();

    assert_eq!(mock.cluster().status_ref().tikv.failure_stores.len(), 1);
    assert_eq!(mock.replicas(MemberType::Tikv), 4);
}

#[tokio::test]
async fn test_pd_failover_replaces_member() {
    let mock = MockCluster::running_with(immediate_failover(), 3, 3);
    mock.pd().set_member_health("demo-pd-2", false);

    // First pass records the failure and grows the set.
    let err = mock.reconcile().await.unwrap_err();
    assert!(err.is_requeue());
    let failures = mock.cluster().status_ref().pd.failure_members;
    assert_eq!(failures["demo-pd-2"].member_id, "102");
    assert!(!failures["demo-pd-2"].member_deleted);
    assert!(mock.env.events.reasons().contains(&"Unhealthy".to_string()));
    assert_eq!(mock.replicas(MemberType::Pd), 4);

    // Second pass removes the member, its pod and its claim.
    let _ = mock.reconcile().await;
    assert!(!mock.pd().member_names().contains(&"demo-pd-2".to_string()));
    assert!(mock.pod(MemberType::Pd, 2).is_none());
    assert!(mock.env.controls.pvcs.object(NAMESPACE, "pd-demo-pd-2").is_none());
    let failures = mock.cluster().status_ref().pd.failure_members;
    assert!(failures["demo-pd-2"].member_deleted);
    assert_eq!(mock.replicas(MemberType::Pd), 4);
}

#[tokio::test]
async fn test_stale_down_store_is_not_failed_over() {
    let mock = MockCluster::running_with(immediate_failover(), 3, 3);
    mock.edit(|tc| tc.spec.tikv.max_failover_count = Some(0));
    mock.pd().set_store_state(1, "Down");
    mock.reconcile().await.unwrap();
    assert_eq!(mock.cluster().status_ref().tikv.stores["1"].state, StoreState::Down);

    // PD becomes unreachable; the Down state in status is all that is left.
    mock.edit(|tc| tc.spec.tikv.max_failover_count = Some(3));
    mock.pd().fail(PdMethod::GetStores, "connection refused");
    mock.reconcile().await.unwrap();

    let status = mock.cluster().status_ref();
    assert!(!status.tikv.synced);
    assert!(status.tikv.failure_stores.is_empty());
    assert_eq!(mock.replicas(MemberType::Tikv), 3);
}

#[tokio::test]
async fn test_failover_disabled_by_config() {
    let config = ControllerConfig {
        auto_failover: false,
        ..immediate_failover()
    };
    let mock = MockCluster::running_with(config, 3, 3);
    mock.pd().set_store_state(1, "Down");

    mock.reconcile().await.unwrap();

    assert!(mock.cluster().status_ref().tikv.failure_stores.is_empty());
    assert_eq!(mock.replicas(MemberType::Tikv), 3);
}

#[tokio::test]
async fn test_pd_rolling_upgrade_moves_leader_last() {
    let mock = MockCluster::running(3, 3);
    let pd_template = mock.statefulset(MemberType::Pd).spec.unwrap().template;
    let tikv_template = mock.statefulset(MemberType::Tikv).spec.unwrap().template;
    mock.edit(|tc| tc.spec.version = "v4.0.1".to_string());

    // The new PD template is written; TiKV is held back.
    mock.reconcile().await.unwrap();
    assert_eq!(mock.cluster().status_ref().pd.phase, MemberPhase::Upgrade);
    assert_ne!(mock.statefulset(MemberType::Pd).spec.unwrap().template, pd_template);
    assert_eq!(mock.statefulset(MemberType::Tikv).spec.unwrap().template, tikv_template);

    mock.start_rollout(MemberType::Pd, "2");
    mock.settle(MemberType::Pd);

    // Followers go first, in ordinal order.
    mock.reconcile().await.unwrap_err();
    assert!(mock.pod(MemberType::Pd, 1).is_none());
    assert!(mock.pod(MemberType::Pd, 2).is_some());

    mock.settle(MemberType::Pd);
    mock.reconcile().await.unwrap_err();
    assert!(mock.pod(MemberType::Pd, 2).is_none());
    assert!(mock.pod(MemberType::Pd, 0).is_some());

    // Leadership moves off the last pod before it is deleted.
    mock.settle(MemberType::Pd);
    mock.reconcile().await.unwrap_err();
    assert_eq!(mock.pd().leader().as_deref(), Some("demo-pd-1"));
    assert!(mock.pod(MemberType::Pd, 0).is_some());

    mock.reconcile().await.unwrap_err();
    assert!(mock.pod(MemberType::Pd, 0).is_none());
}

#[tokio::test]
async fn test_tikv_rolling_upgrade_evicts_leaders() {
    let mock = MockCluster::running(3, 3);
    mock.edit(|tc| tc.spec.tikv.component.version = Some("v4.0.1".to_string()));

    mock.reconcile().await.unwrap();
    assert_eq!(mock.cluster().status_ref().tikv.phase, MemberPhase::Upgrade);

    mock.start_rollout(MemberType::Tikv, "2");
    mock.settle(MemberType::Tikv);

    // Leaders are evicted from the first store, its pod stays for now.
    mock.reconcile().await.unwrap_err();
    let pod = mock.pod(MemberType::Tikv, 0).unwrap();
    assert!(pod.annotations().contains_key(ANN_EVICT_LEADER_BEGIN_TIME));
    assert!(mock.pd().evicting().contains(&1));

    // With no leaders left the pod is deleted.
    mock.reconcile().await.unwrap_err();
    assert!(mock.pod(MemberType::Tikv, 0).is_none());
    assert!(mock.pod(MemberType::Tikv, 1).is_some());

    // The upgraded store is released and the next one starts evicting.
    mock.settle(MemberType::Tikv);
    mock.reconcile().await.unwrap_err();
    let evicting = mock.pd().evicting();
    assert!(!evicting.contains(&1));
    assert!(evicting.contains(&2));
}
