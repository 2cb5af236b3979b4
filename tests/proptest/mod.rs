// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for tikv-operator.
//!
//! Uses proptest to generate random inputs and verify invariants.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use proptest::prelude::*;

use tikv_operator::controller::condition::set_condition;
use tikv_operator::controller::config::ControllerConfig;
use tikv_operator::controller::context::FakeEnv;
use tikv_operator::controller::tikv_cluster_controller::backoff_delay;
use tikv_operator::crd::{
    StoreState, TikvCluster, TikvClusterCondition, TikvClusterSpec, TikvStore,
    pod_ordinals_from_replicas_and_delete_slots,
};
use tikv_operator::manager::Failover;
use tikv_operator::manager::pd_upgrader::upgrade_order;
use tikv_operator::manager::scaler::{ScaleStep, next_scale_step};
use tikv_operator::manager::tikv_failover::TikvFailover;

/// Strategy for small ordinal sets (0-15).
fn ordinal_set() -> impl Strategy<Value = BTreeSet<i32>> {
    prop::collection::btree_set(0..16i32, 0..8)
}

/// Strategy for replica counts, including invalid negative ones.
fn replicas() -> impl Strategy<Value = i32> {
    -2..12i32
}

fn condition(status: &str, reason: &str) -> TikvClusterCondition {
    TikvClusterCondition {
        r#type: "Ready".to_string(),
        status: status.to_string(),
        last_update_time: None,
        last_transition_time: None,
        reason: reason.to_string(),
        message: String::new(),
    }
}

/// A cluster whose first `down` of `total` stores have been Down for an hour.
fn cluster_with_down_stores(total: usize, down: usize, max_failover_count: i32) -> TikvCluster {
    let mut tc = TikvCluster::new("demo", TikvClusterSpec::default());
    tc.metadata.namespace = Some("default".to_string());
    tc.spec.tikv.replicas = total as i32;
    tc.spec.tikv.max_failover_count = Some(max_failover_count);
    let since = (jiff::Timestamp::now() - jiff::SignedDuration::from_secs(3600)).to_string();
    let stores: BTreeMap<String, TikvStore> = (0..total)
        .map(|i| {
            let id = (i + 1).to_string();
            let store = TikvStore {
                id: id.clone(),
                pod_name: format!("demo-tikv-{}", i),
                state: if i < down { StoreState::Down } else { StoreState::Up },
                last_transition_time: Some(since.clone()),
                ..Default::default()
            };
            (id, store)
        })
        .collect();
    tc.status.get_or_insert_with(Default::default).tikv.stores = stores;
    tc
}

proptest! {
    /// Property: desired ordinals are exactly `replicas` long and avoid every delete slot.
    #[test]
    fn test_ordinals_avoid_delete_slots(replicas in replicas(), slots in ordinal_set()) {
        let ordinals = pod_ordinals_from_replicas_and_delete_slots(replicas, &slots);
        prop_assert_eq!(ordinals.len(), replicas.max(0) as usize);
        prop_assert!(ordinals.is_disjoint(&slots));
        // Nothing below the highest ordinal is skipped unless it is a slot.
        if let Some(&max) = ordinals.last() {
            for o in 0..max {
                prop_assert!(ordinals.contains(&o) || slots.contains(&o));
            }
        }
    }

    /// Property: between two replica counts every step adds the next ordinal
    /// or removes the highest one, so the StatefulSet stays `0..replicas`.
    #[test]
    fn test_replica_steps_stay_contiguous(from in 0..12i32, to in 0..12i32) {
        let desired: BTreeSet<i32> = (0..to).collect();
        let mut current: BTreeSet<i32> = (0..from).collect();
        for _ in 0..24 {
            match next_scale_step(&current, &desired) {
                ScaleStep::Out(o) => {
                    prop_assert_eq!(o, current.len() as i32);
                    current.insert(o);
                }
                ScaleStep::In(o) => {
                    prop_assert_eq!(Some(&o), current.last());
                    current.remove(&o);
                }
                ScaleStep::None => break,
            }
        }
        prop_assert_eq!(current, desired);
    }

    /// Property: scale steps reach the desired set one ordinal at a time,
    /// adding before removing and removing the highest ordinal first.
    #[test]
    fn test_scale_steps_converge(current in ordinal_set(), desired in ordinal_set()) {
        let mut ordinals = current.clone();
        let mut removing = false;
        let mut steps = 0;
        loop {
            match next_scale_step(&ordinals, &desired) {
                ScaleStep::Out(o) => {
                    prop_assert!(!removing, "scale out after scale in");
                    prop_assert!(!ordinals.contains(&o));
                    ordinals.insert(o);
                }
                ScaleStep::In(o) => {
                    removing = true;
                    let highest_surplus = ordinals.difference(&desired).last().copied();
                    prop_assert_eq!(Some(o), highest_surplus);
                    ordinals.remove(&o);
                }
                ScaleStep::None => break,
            }
            steps += 1;
        }
        prop_assert_eq!(&ordinals, &desired);
        prop_assert_eq!(steps, current.symmetric_difference(&desired).count());
    }

    /// Property: the upgrade order is a permutation with the leader last.
    #[test]
    fn test_upgrade_order_leader_last(ordinals in ordinal_set(), leader in prop::option::of(0..16i32)) {
        let order = upgrade_order(&ordinals, leader);
        prop_assert_eq!(order.len(), ordinals.len());
        prop_assert_eq!(order.iter().copied().collect::<BTreeSet<_>>(), ordinals.clone());
        match leader {
            Some(l) if ordinals.contains(&l) => prop_assert_eq!(order.last(), Some(&l)),
            _ => prop_assert!(order.windows(2).all(|w| w[0] < w[1])),
        }
    }

    /// Property: an unchanged condition status keeps its transition time.
    #[test]
    fn test_transition_time_kept_for_same_status(
        ready in any::<bool>(),
        first_reason in "[A-Z][a-z]{2,8}",
        second_reason in "[A-Z][a-z]{2,8}",
    ) {
        let status = if ready { "True" } else { "False" };
        let mut conditions = Vec::new();
        set_condition(&mut conditions, condition(status, &first_reason), "2020-05-01T10:00:00Z");
        set_condition(&mut conditions, condition(status, &second_reason), "2020-05-01T10:05:00Z");

        prop_assert_eq!(conditions.len(), 1);
        prop_assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2020-05-01T10:00:00Z")
        );
        prop_assert_eq!(&conditions[0].reason, &second_reason);
    }

    /// Property: TiKV failover never records more stores than its budget.
    #[test]
    fn test_failover_budget_never_exceeded(
        (total, down) in (1usize..8).prop_flat_map(|total| (Just(total), 0..=total)),
        max_failover_count in 0..5i32,
    ) {
        let env = FakeEnv::new(ControllerConfig::default());
        let failover = TikvFailover::new(env.ctx.clone());
        let mut tc = cluster_with_down_stores(total, down, max_failover_count);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        // Repeated passes must not grow past the budget either.
        for _ in 0..3 {
            runtime.block_on(failover.failover(&mut tc)).unwrap();
        }

        let recorded = tc.status_ref().tikv.failure_stores.len();
        prop_assert!(recorded <= max_failover_count as usize);
        prop_assert_eq!(recorded, down.min(max_failover_count as usize));
    }

    /// Property: retry backoff grows with failures and never passes the cap.
    #[test]
    fn test_backoff_monotonic_and_capped(failures in 0u32..64) {
        let base = Duration::from_millis(5);
        let max = Duration::from_secs(1000);
        let delay = backoff_delay(base, max, failures);
        prop_assert!(delay <= max);
        prop_assert!(delay >= base);
        prop_assert!(backoff_delay(base, max, failures + 1) >= delay);
    }
}
