//! In-memory implementations of the manager capabilities.
//!
//! Each fake counts its calls and can be told to fail through a
//! [`RequestTracker`], so the member managers and the orchestrator can be
//! exercised without the real scaler, failover or upgrader.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;

use super::{Failover, Manager, Scaler, Upgrader};
use crate::control::fake::RequestTracker;
use crate::controller::error::Result;
use crate::crd::TikvCluster;

/// Records scale calls; replicas are left untouched.
#[derive(Default)]
pub struct FakeScaler {
    pub tracker: RequestTracker,
    scales: AtomicUsize,
    cleans: AtomicUsize,
}

impl FakeScaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scale_calls(&self) -> usize {
        self.scales.load(Ordering::SeqCst)
    }

    pub fn clean_calls(&self) -> usize {
        self.cleans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scaler for FakeScaler {
    async fn scale(&self, _tc: &mut TikvCluster, _old: &StatefulSet, _new: &mut StatefulSet) -> Result<()> {
        self.scales.fetch_add(1, Ordering::SeqCst);
        self.tracker.check()
    }

    async fn clean_deferred_pvcs(&self, _tc: &TikvCluster, _sts: &StatefulSet) -> Result<()> {
        self.cleans.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records failover and recover calls.
#[derive(Default)]
pub struct FakeFailover {
    pub tracker: RequestTracker,
    failovers: AtomicUsize,
    recovers: AtomicUsize,
}

impl FakeFailover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failover_calls(&self) -> usize {
        self.failovers.load(Ordering::SeqCst)
    }

    pub fn recover_calls(&self) -> usize {
        self.recovers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Failover for FakeFailover {
    async fn failover(&self, _tc: &mut TikvCluster) -> Result<()> {
        self.failovers.fetch_add(1, Ordering::SeqCst);
        self.tracker.check()
    }

    fn recover(&self, _tc: &mut TikvCluster) {
        self.recovers.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records upgrade calls.
#[derive(Default)]
pub struct FakeUpgrader {
    pub tracker: RequestTracker,
    upgrades: AtomicUsize,
}

impl FakeUpgrader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upgrade_calls(&self) -> usize {
        self.upgrades.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upgrader for FakeUpgrader {
    async fn upgrade(&self, _tc: &mut TikvCluster, _old: &StatefulSet, _new: &mut StatefulSet) -> Result<()> {
        self.upgrades.fetch_add(1, Ordering::SeqCst);
        self.tracker.check()
    }
}

/// A pipeline stage that only counts its passes.
#[derive(Default)]
pub struct FakeManager {
    pub tracker: RequestTracker,
    syncs: AtomicUsize,
}

impl FakeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync_calls(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Manager for FakeManager {
    async fn sync(&self, _tc: &mut TikvCluster) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        self.tracker.check()
    }
}
