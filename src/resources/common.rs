//! Common resource generation utilities.
//!
//! Names, owner references and conversions shared by the tier generators.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapKeySelector, EnvVar, EnvVarSource, SecretKeySelector, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use crate::crd::{ComponentSpec, MemberType, TikvCluster};
use crate::resources::labels::Label;

pub const API_VERSION: &str = "tikv.org/v1alpha1";
pub const KIND: &str = "TikvCluster";

/// Create the controller owner reference pointing at a TikvCluster
pub fn owner_reference(tc: &TikvCluster) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: tc.name_any(),
        uid: tc.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Object metadata for an owned object.
pub fn owned_meta(tc: &TikvCluster, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: tc.namespace(),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(tc)]),
        ..Default::default()
    }
}

/// Labels of every object of a tier.
pub fn member_labels(tc: &TikvCluster, member_type: MemberType) -> BTreeMap<String, String> {
    Label::new()
        .instance(&tc.name_any())
        .member(member_type)
        .into_labels()
}

/// `{name}-pd` / `{name}-tikv`: StatefulSet and, for PD, client service name.
pub fn member_name(tc_name: &str, member_type: MemberType) -> String {
    format!("{}-{}", tc_name, member_type.as_str())
}

/// `{name}-pd-peer` / `{name}-tikv-peer`: headless service name.
pub fn peer_member_name(tc_name: &str, member_type: MemberType) -> String {
    format!("{}-{}-peer", tc_name, member_type.as_str())
}

pub fn discovery_name(tc_name: &str) -> String {
    format!("{}-discovery", tc_name)
}

pub fn pd_member_name(tc_name: &str) -> String {
    member_name(tc_name, MemberType::Pd)
}

pub fn tikv_member_name(tc_name: &str) -> String {
    member_name(tc_name, MemberType::Tikv)
}

/// Pod name of an ordinal in a tier.
pub fn ordinal_pod_name(tc_name: &str, member_type: MemberType, ordinal: i32) -> String {
    format!("{}-{}", member_name(tc_name, member_type), ordinal)
}

/// Data volume name of a tier, also the PVC name prefix.
pub fn data_volume_name(member_type: MemberType) -> &'static str {
    member_type.as_str()
}

/// PVC created by the StatefulSet for a pod: `{volume}-{pod}`.
pub fn pvc_name(member_type: MemberType, pod_name: &str) -> String {
    format!("{}-{}", data_volume_name(member_type), pod_name)
}

/// Ordinal suffix of a pod or PVC name.
pub fn ordinal_from_name(name: &str) -> Option<i32> {
    name.rsplit_once('-').and_then(|(_, ordinal)| ordinal.parse().ok())
}

/// Scheduling knobs with tier values taking priority over cluster values.
pub struct Scheduling {
    pub scheduler_name: Option<String>,
    pub image_pull_policy: String,
    pub host_network: bool,
    pub priority_class_name: Option<String>,
    pub node_selector: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
}

pub fn scheduling(tc: &TikvCluster, component: &ComponentSpec) -> Scheduling {
    let spec = &tc.spec;
    let node_selector = if component.node_selector.is_empty() {
        spec.node_selector.clone()
    } else {
        component.node_selector.clone()
    };
    let mut annotations = spec.annotations.clone();
    annotations.extend(component.annotations.clone());
    let tolerations = if component.tolerations.is_empty() {
        &spec.tolerations
    } else {
        &component.tolerations
    };

    Scheduling {
        scheduler_name: component
            .scheduler_name
            .clone()
            .or_else(|| spec.scheduler_name.clone()),
        image_pull_policy: component
            .image_pull_policy
            .clone()
            .unwrap_or_else(|| tc.image_pull_policy().to_string()),
        host_network: component
            .host_network
            .or(spec.host_network)
            .unwrap_or(false),
        priority_class_name: component
            .priority_class_name
            .clone()
            .or_else(|| spec.priority_class_name.clone()),
        node_selector,
        annotations,
        tolerations: tolerations
            .iter()
            .map(|t| Toleration {
                key: t.key.clone(),
                operator: t.operator.clone(),
                value: t.value.clone(),
                effect: t.effect.clone(),
                toleration_seconds: t.toleration_seconds,
            })
            .collect(),
    }
}

/// Convert CRD env vars to k8s-openapi EnvVars.
///
/// Only ConfigMap and Secret key references survive validation.
pub fn convert_env(env: &[crate::crd::EnvVar]) -> Vec<EnvVar> {
    env.iter()
        .map(|e| EnvVar {
            name: e.name.clone(),
            value: if e.value.is_empty() {
                None
            } else {
                Some(e.value.clone())
            },
            value_from: e.value_from.as_ref().map(|source| EnvVarSource {
                config_map_key_ref: source.config_map_key_ref.as_ref().map(|r| {
                    ConfigMapKeySelector {
                        name: r.name.clone(),
                        key: r.key.clone(),
                        optional: r.optional,
                    }
                }),
                secret_key_ref: source.secret_key_ref.as_ref().map(|r| SecretKeySelector {
                    name: r.name.clone(),
                    key: r.key.clone(),
                    optional: r.optional,
                }),
                ..Default::default()
            }),
        })
        .collect()
}

/// Config update strategy of a tier, falling back to the cluster strategy.
pub fn config_update_strategy(
    tc: &TikvCluster,
    component: &ComponentSpec,
) -> crate::crd::ConfigUpdateStrategy {
    component
        .config_update_strategy
        .unwrap_or(tc.spec.config_update_strategy)
}

/// `Some(map)` unless empty.
pub fn non_empty(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() { None } else { Some(map) }
}
