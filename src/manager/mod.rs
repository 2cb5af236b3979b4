//! Per-stage managers of the reconcile pipeline.
//!
//! Each stage of a pass implements [`Manager`]. The tier managers delegate
//! scaling, failover and upgrades to the [`Scaler`], [`Failover`] and
//! [`Upgrader`] capabilities, each with a production implementation and an
//! in-memory fake in [`fake`].

pub mod discovery_manager;
pub mod fake;
#[cfg(test)]
pub(crate) mod fixtures;
pub mod meta_manager;
pub mod orphan_pods_cleaner;
pub mod pd_failover;
pub mod pd_member_manager;
pub mod pd_upgrader;
pub mod scaler;
pub mod tikv_failover;
pub mod tikv_member_manager;
pub mod tikv_upgrader;
pub mod utils;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;

use crate::controller::error::Result;
use crate::crd::TikvCluster;

/// One stage of a reconcile pass. Stages may update `tc.status`.
#[async_trait]
pub trait Manager: Send + Sync {
    async fn sync(&self, tc: &mut TikvCluster) -> Result<()>;
}

/// Moves a tier's StatefulSet one ordinal towards the desired set.
#[async_trait]
pub trait Scaler: Send + Sync {
    /// Adjust `new` so it adds or removes at most one ordinal relative to `old`.
    async fn scale(&self, tc: &mut TikvCluster, old: &StatefulSet, new: &mut StatefulSet) -> Result<()>;

    /// Delete PVCs left by earlier scale-ins once their pods are gone.
    async fn clean_deferred_pvcs(&self, tc: &TikvCluster, sts: &StatefulSet) -> Result<()>;
}

/// Replaces members that stay unhealthy.
#[async_trait]
pub trait Failover: Send + Sync {
    async fn failover(&self, tc: &mut TikvCluster) -> Result<()>;

    /// Forget failure records once the tier is healthy again.
    fn recover(&self, tc: &mut TikvCluster);
}

/// Rolls a new pod template out one pod at a time.
#[async_trait]
pub trait Upgrader: Send + Sync {
    async fn upgrade(&self, tc: &mut TikvCluster, old: &StatefulSet, new: &mut StatefulSet) -> Result<()>;
}
