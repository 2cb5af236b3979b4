//! Replacement of TiKV stores that stay Down.
//!
//! A record in `status.tikv.failureStores` adds one replica to the TiKV
//! StatefulSet. The failed store itself is left to PD; the record is only
//! cleared once every desired store is Up again.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::Failover;
use super::utils::{elapsed_since, now};
use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::crd::{StoreState, TikvCluster, TikvFailureStore};

pub struct TikvFailover {
    ctx: Arc<Context>,
}

impl TikvFailover {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Failover for TikvFailover {
    async fn failover(&self, tc: &mut TikvCluster) -> Result<()> {
        let status = tc.status_ref();
        let max_failover_count = tc.spec.tikv.max_failover_count.unwrap_or(0).max(0) as usize;
        let period = self.ctx.config.tikv_failover_period;
        let mut failures = status.tikv.failure_stores.clone();

        for store in status.tikv.stores.values() {
            if store.state != StoreState::Down {
                continue;
            }
            let Some(elapsed) = store.last_transition_time.as_deref().and_then(elapsed_since) else {
                continue;
            };
            if elapsed < period || failures.contains_key(&store.id) {
                continue;
            }
            if failures.len() >= max_failover_count {
                warn!(
                    cluster = %tc.key(),
                    store = %store.id,
                    max_failover_count,
                    "TiKV failover budget exhausted, not replacing store"
                );
                break;
            }

            failures.insert(
                store.id.clone(),
                TikvFailureStore {
                    pod_name: store.pod_name.clone(),
                    store_id: store.id.clone(),
                    created_at: now(),
                },
            );
            let note = format!(
                "store {} of pod {} has been down for more than {}",
                store.id,
                store.pod_name,
                humantime::format_duration(period)
            );
            warn!(cluster = %tc.key(), store = %store.id, pod = %store.pod_name, "{}", note);
            self.ctx
                .publish_warning_event(tc, "Unhealthy", "Failover", note)
                .await;
        }

        tc.status
            .get_or_insert_with(Default::default)
            .tikv
            .failure_stores = failures;
        Ok(())
    }

    fn recover(&self, tc: &mut TikvCluster) {
        let key = tc.key();
        if let Some(status) = tc.status.as_mut() {
            if !status.tikv.failure_stores.is_empty() {
                info!(cluster = %key, "All TiKV stores are up, clearing failure stores");
                status.tikv.failure_stores.clear();
            }
        }
    }
}
