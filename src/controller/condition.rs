//! Aggregate Ready condition of a TikvCluster.

use jiff::{SignedDuration, Timestamp};

use crate::crd::{CONDITION_READY, StoreState, TikvCluster, TikvClusterCondition, TikvClusterStatus};

/// Heartbeat-only status changes are written at most this often.
pub const HEARTBEAT_PERSIST_INTERVAL: SignedDuration = SignedDuration::from_mins(5);

pub const REASON_STATEFULSET_NOT_UP_TO_DATE: &str = "StatefulSetNotUpToDate";
pub const REASON_PD_UNHEALTHY: &str = "PDUnhealthy";
pub const REASON_TIKV_STORE_NOT_UP: &str = "TiKVStoreNotUp";
pub const REASON_READY: &str = "Ready";

const MESSAGE_STATEFULSET_NOT_UP_TO_DATE: &str = "Statefulset(s) are in progress";
const MESSAGE_PD_UNHEALTHY: &str = "PD(s) are not healthy";
const MESSAGE_TIKV_STORE_NOT_UP: &str = "TiKV store(s) are not up";
const MESSAGE_READY: &str = "TiKV cluster is fully up and running";

fn stateful_sets_up_to_date(status: &TikvClusterStatus) -> bool {
    [status.pd.stateful_set.as_ref(), status.tikv.stateful_set.as_ref()]
        .into_iter()
        .all(|sts| sts.is_some_and(|s| s.current_revision == s.update_revision))
}

/// Derive the Ready condition from a cluster's status.
///
/// Timestamps are left unset; [`set_condition`] fills them.
pub fn derive_ready_condition(tc: &TikvCluster) -> TikvClusterCondition {
    let status = tc.status_ref();
    let (ready, reason, message) = if !stateful_sets_up_to_date(&status) {
        (false, REASON_STATEFULSET_NOT_UP_TO_DATE, MESSAGE_STATEFULSET_NOT_UP_TO_DATE)
    } else if status.pd.members.len() != tc.pd_sts_desired_replicas() as usize
        || status.pd.members.values().any(|m| !m.health)
    {
        (false, REASON_PD_UNHEALTHY, MESSAGE_PD_UNHEALTHY)
    } else if status.tikv.stores.len() != tc.tikv_sts_desired_replicas() as usize
        || status.tikv.stores.values().any(|s| s.state != StoreState::Up)
    {
        (false, REASON_TIKV_STORE_NOT_UP, MESSAGE_TIKV_STORE_NOT_UP)
    } else {
        (true, REASON_READY, MESSAGE_READY)
    };

    TikvClusterCondition {
        r#type: CONDITION_READY.to_string(),
        status: if ready { "True" } else { "False" }.to_string(),
        last_update_time: None,
        last_transition_time: None,
        reason: reason.to_string(),
        message: message.to_string(),
    }
}

/// Insert or replace the condition of the same type.
///
/// Returns false when nothing changed. An unchanged status keeps the
/// previous transition time.
pub fn set_condition(
    conditions: &mut Vec<TikvClusterCondition>,
    mut condition: TikvClusterCondition,
    now: &str,
) -> bool {
    let existing = conditions.iter().find(|c| c.r#type == condition.r#type);
    if let Some(current) = existing {
        if current.status == condition.status && current.reason == condition.reason {
            return false;
        }
        if current.status == condition.status {
            condition.last_transition_time = current.last_transition_time.clone();
        }
    }
    condition.last_update_time = Some(now.to_string());
    if condition.last_transition_time.is_none() {
        condition.last_transition_time = Some(now.to_string());
    }
    conditions.retain(|c| c.r#type != condition.r#type);
    conditions.push(condition);
    true
}

/// Recompute the Ready condition on `tc`'s status.
pub fn update_ready_condition(tc: &mut TikvCluster, now: &str) -> bool {
    let condition = derive_ready_condition(tc);
    let status = tc.status.get_or_insert_with(Default::default);
    set_condition(&mut status.conditions, condition, now)
}

/// Compare two statuses, ignoring TiKV store heartbeat times.
pub fn status_equal_ignoring_heartbeats(a: &TikvClusterStatus, b: &TikvClusterStatus) -> bool {
    fn strip(status: &TikvClusterStatus) -> TikvClusterStatus {
        let mut status = status.clone();
        for store in status
            .tikv
            .stores
            .values_mut()
            .chain(status.tikv.tombstone_stores.values_mut())
        {
            store.last_heartbeat_time.clear();
        }
        status
    }
    strip(a) == strip(b)
}

/// A store heartbeat in `new` is at least [`HEARTBEAT_PERSIST_INTERVAL`]
/// ahead of the one recorded in `old`.
fn heartbeats_stale(old: &TikvClusterStatus, new: &TikvClusterStatus) -> bool {
    new.tikv.stores.iter().any(|(id, store)| {
        let Some(recorded) = old.tikv.stores.get(id) else {
            return false;
        };
        match (
            recorded.last_heartbeat_time.parse::<Timestamp>(),
            store.last_heartbeat_time.parse::<Timestamp>(),
        ) {
            (Ok(then), Ok(now)) => now.duration_since(then) >= HEARTBEAT_PERSIST_INTERVAL,
            _ => false,
        }
    })
}

/// Whether `new` has to be written over `old`.
///
/// PD reports a fresh heartbeat for every store on every pass. Those alone
/// would write status each pass, so they are only persisted once they drift
/// [`HEARTBEAT_PERSIST_INTERVAL`] from what was stored.
pub fn status_needs_persist(old: &TikvClusterStatus, new: &TikvClusterStatus) -> bool {
    !status_equal_ignoring_heartbeats(old, new) || heartbeats_stale(old, new)
}
