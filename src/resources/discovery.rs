//! Discovery service objects.
//!
//! PD pods ask the discovery service for their start arguments
//! (`--initial-cluster` on bootstrap, `--join` afterwards). It needs to read
//! its own TikvCluster, hence the ServiceAccount, Role and RoleBinding.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec,
    PodTemplateSpec, ResourceRequirements, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use std::collections::BTreeMap;

use crate::crd::TikvCluster;
use crate::resources::common::{discovery_name, owned_meta};
use crate::resources::labels::Label;
use crate::resources::services::DISCOVERY_PORT;

fn discovery_labels(tc: &TikvCluster) -> BTreeMap<String, String> {
    Label::new()
        .instance(&tc.name_any())
        .discovery()
        .into_labels()
}

pub fn generate_service_account(tc: &TikvCluster) -> ServiceAccount {
    ServiceAccount {
        metadata: owned_meta(tc, discovery_name(&tc.name_any()), discovery_labels(tc)),
        ..Default::default()
    }
}

/// Role granting read access to the owning cluster only.
pub fn generate_role(tc: &TikvCluster) -> Role {
    Role {
        metadata: owned_meta(tc, discovery_name(&tc.name_any()), discovery_labels(tc)),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec!["tikv.org".to_string()]),
            resources: Some(vec!["tikvclusters".to_string()]),
            resource_names: Some(vec![tc.name_any()]),
            verbs: vec!["get".to_string()],
            ..Default::default()
        }]),
    }
}

pub fn generate_role_binding(tc: &TikvCluster) -> RoleBinding {
    let name = discovery_name(&tc.name_any());
    RoleBinding {
        metadata: owned_meta(tc, name.clone(), discovery_labels(tc)),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: tc.namespace(),
            ..Default::default()
        }]),
    }
}

fn quantities(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if map.is_empty() {
        return None;
    }
    Some(
        map.iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect(),
    )
}

/// Discovery Deployment running `image`.
pub fn generate_deployment(tc: &TikvCluster, image: &str) -> Deployment {
    let name = discovery_name(&tc.name_any());
    let labels = discovery_labels(tc);
    let resources = &tc.spec.discovery.resources;

    Deployment {
        metadata: owned_meta(tc, name.clone(), labels.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            // a single discovery pod at a time
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(name),
                    containers: vec![Container {
                        name: "discovery".to_string(),
                        image: Some(image.to_string()),
                        image_pull_policy: Some(tc.image_pull_policy().to_string()),
                        command: Some(vec!["/usr/local/bin/tikv-discovery".to_string()]),
                        ports: Some(vec![ContainerPort {
                            name: Some("discovery".to_string()),
                            container_port: DISCOVERY_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        env: Some(vec![
                            EnvVar {
                                name: "MY_POD_NAMESPACE".to_string(),
                                value_from: Some(EnvVarSource {
                                    field_ref: Some(ObjectFieldSelector {
                                        field_path: "metadata.namespace".to_string(),
                                        ..Default::default()
                                    }),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                            EnvVar {
                                name: "TC_NAME".to_string(),
                                value: Some(tc.name_any()),
                                ..Default::default()
                            },
                            EnvVar {
                                name: "TZ".to_string(),
                                value: Some(tc.timezone().to_string()),
                                ..Default::default()
                            },
                        ]),
                        resources: Some(ResourceRequirements {
                            requests: quantities(&resources.requests),
                            limits: quantities(&resources.limits),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
