//! Reconcile entry points for the kube runtime controller.
//!
//! `lib::run_controller` drives [`reconcile`] and [`error_policy`] through a
//! `kube::runtime::Controller` watching TikvClusters and the StatefulSets
//! they own. The runtime deduplicates triggers per object and never runs two
//! reconciles of the same object at once; this module adds per-cluster
//! exponential backoff on top.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::tikv_cluster_control::ClusterControl;
use crate::crd::TikvCluster;

/// Upper bound of the retry delay of a failing cluster.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(1000);

/// `base * 2^failures`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |d| d.min(max))
}

/// State shared by every reconcile: the context, the orchestrator and the
/// consecutive failure count of each cluster key.
pub struct TikvClusterController {
    pub ctx: Arc<Context>,
    control: Arc<dyn ClusterControl>,
    failures: Mutex<HashMap<String, u32>>,
}

impl TikvClusterController {
    pub fn new(ctx: Arc<Context>, control: Arc<dyn ClusterControl>) -> Self {
        Self {
            ctx,
            control,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn failures_lock(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Consecutive failed passes of `key`.
    pub fn num_failures(&self, key: &str) -> u32 {
        self.failures_lock().get(key).copied().unwrap_or(0)
    }

    /// Reset the backoff of `key`.
    pub fn forget(&self, key: &str) {
        let retrying = {
            let mut failures = self.failures_lock();
            failures.remove(key);
            failures.len()
        };
        self.set_retrying_gauge(retrying);
    }

    /// Count one more failure of `key` and return the delay before retrying.
    fn next_retry(&self, key: &str, base: Duration) -> Duration {
        let (attempt, retrying) = {
            let mut failures = self.failures_lock();
            let count = failures.entry(key.to_string()).or_insert(0);
            let attempt = *count;
            *count = count.saturating_add(1);
            (attempt, failures.len())
        };
        self.set_retrying_gauge(retrying);
        backoff_delay(base, MAX_RETRY_DELAY, attempt)
    }

    fn set_retrying_gauge(&self, retrying: usize) {
        if let Some(health) = &self.ctx.health_state {
            health.metrics.set_retrying_clusters(retrying);
        }
    }

    /// Drop every trace of a deleted cluster.
    pub fn cluster_deleted(&self, namespace: &str, name: &str) {
        debug!(cluster = %format!("{namespace}/{name}"), "TikvCluster has been deleted");
        self.forget(&format!("{namespace}/{name}"));
        if let Some(health) = &self.ctx.health_state {
            health.metrics.remove_cluster(namespace, name);
        }
    }
}

/// Reconcile one cluster.
///
/// The cached object is cloned before it reaches the orchestrator. Any
/// error, requeue requests included, goes through [`error_policy`].
pub async fn reconcile(tc: Arc<TikvCluster>, controller: Arc<TikvClusterController>) -> Result<Action> {
    let start = Instant::now();
    let key = tc.key();
    let namespace = tc.namespace().unwrap_or_default();
    let name = tc.name_any();

    let result = controller.control.update_tikv_cluster((*tc).clone()).await;

    if let Some(health) = &controller.ctx.health_state {
        health
            .metrics
            .record_reconcile(&namespace, &name, start.elapsed().as_secs_f64());
        if result.is_ok() {
            health
                .last_reconcile
                .store(jiff::Timestamp::now().as_second().max(0) as u64, Ordering::Relaxed);
        }
    }

    result?;
    controller.forget(&key);
    debug!(cluster = %key, "Reconciled TikvCluster");
    Ok(Action::requeue(controller.ctx.config.resync_duration))
}

/// Retry policy for a failed pass: requeue requests are logged at info and
/// failures at error; both back off exponentially per cluster.
pub fn error_policy(tc: Arc<TikvCluster>, error: &Error, controller: Arc<TikvClusterController>) -> Action {
    let key = tc.key();
    let delay = controller.next_retry(&key, error.requeue_after());
    if error.is_requeue() {
        info!(cluster = %key, reason = %error, delay = ?delay, "Requeuing TikvCluster");
    } else {
        error!(cluster = %key, error = %error, delay = ?delay, "TikvCluster sync failed");
        if let Some(health) = &controller.ctx.health_state {
            health
                .metrics
                .record_error(&tc.namespace().unwrap_or_default(), &tc.name_any());
        }
    }
    Action::requeue(delay)
}
