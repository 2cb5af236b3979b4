//! The per-cluster PD discovery service.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tracing::info;

use super::Manager;
use super::utils::sync_service;
use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::crd::TikvCluster;
use crate::resources::common::discovery_name;
use crate::resources::discovery::{
    generate_deployment, generate_role, generate_role_binding, generate_service_account,
};
use crate::resources::services::generate_discovery_service;

/// Fields of the discovery Deployment the operator owns.
fn deployment_needs_update(desired: &Deployment, existing: &Deployment) -> bool {
    let (Some(want), Some(have)) = (desired.spec.as_ref(), existing.spec.as_ref()) else {
        return true;
    };
    if want.strategy != have.strategy {
        return true;
    }
    let containers = |d: &k8s_openapi::api::apps::v1::DeploymentSpec| {
        d.template
            .spec
            .as_ref()
            .and_then(|s| s.containers.first().cloned())
    };
    match (containers(want), containers(have)) {
        (Some(w), Some(h)) => w.image != h.image || w.env != h.env || w.resources != h.resources,
        _ => true,
    }
}

pub struct DiscoveryManager {
    ctx: Arc<Context>,
}

impl DiscoveryManager {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Manager for DiscoveryManager {
    async fn sync(&self, tc: &mut TikvCluster) -> Result<()> {
        let namespace = tc.namespace().unwrap_or_default();
        let name = discovery_name(&tc.name_any());
        let controls = &self.ctx.controls;

        if controls.service_accounts.get(&namespace, &name).await?.is_none() {
            controls
                .service_accounts
                .create(tc, generate_service_account(tc))
                .await?;
        }
        if controls.roles.get(&namespace, &name).await?.is_none() {
            controls.roles.create(tc, generate_role(tc)).await?;
        }
        if controls.role_bindings.get(&namespace, &name).await?.is_none() {
            controls
                .role_bindings
                .create(tc, generate_role_binding(tc))
                .await?;
        }

        let desired = generate_deployment(tc, &self.ctx.config.pd_discovery_image);
        match controls.deployments.get(&namespace, &name).await? {
            None => {
                controls.deployments.create(tc, desired).await?;
            }
            Some(existing) if deployment_needs_update(&desired, &existing) => {
                info!(cluster = %tc.key(), deployment = %name, "Updating discovery deployment");
                let mut updated = existing;
                updated.spec = desired.spec;
                controls.deployments.update(tc, updated).await?;
            }
            Some(_) => {}
        }

        sync_service(&self.ctx, tc, generate_discovery_service(tc)).await
    }
}
