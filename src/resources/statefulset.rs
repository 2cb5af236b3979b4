//! StatefulSet generation for the PD and TiKV tiers.
//!
//! Both tiers use the `OnDelete` update strategy: the upgrader decides when a
//! pod is replaced. The desired spec is recorded in an annotation so later
//! passes compare against what the operator applied, not what the API server
//! defaulted.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, KeyToPath,
    ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, ResourceRequirements, SecurityContext, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::controller::error::Result;
use crate::crd::{
    ComponentSpec, MemberType, ResourceRequirementsSpec, StatefulSetStatusSnapshot, TikvCluster,
};
use crate::resources::common::{
    convert_env, data_volume_name, member_labels, member_name, non_empty, owned_meta,
    peer_member_name, scheduling,
};
use crate::resources::configmap::{CONFIG_FILE_KEY, STARTUP_SCRIPT_KEY};
use crate::resources::labels::ANN_LAST_APPLIED_CONFIG;
use crate::resources::services::{PD_CLIENT_PORT, PD_PEER_PORT, TIKV_PORT, TIKV_STATUS_PORT};

struct TierSettings<'a> {
    member_type: MemberType,
    component: &'a ComponentSpec,
    resources: &'a ResourceRequirementsSpec,
    replicas: i32,
    image: String,
    storage_class_name: Option<String>,
    config_path: &'static str,
    script_path: &'static str,
    data_dir: &'static str,
    ports: Vec<ContainerPort>,
    env: Vec<EnvVar>,
    command: Vec<String>,
    privileged: bool,
    service_account: Option<String>,
}

/// Generate the PD StatefulSet that mounts ConfigMap `cm_name`.
pub fn generate_pd_statefulset(tc: &TikvCluster, cm_name: &str) -> StatefulSet {
    let name = tc.name_any();
    let settings = TierSettings {
        member_type: MemberType::Pd,
        component: &tc.spec.pd.component,
        resources: &tc.spec.pd.resources,
        replicas: tc.pd_sts_desired_replicas(),
        image: tc.pd_image(),
        storage_class_name: tc.spec.pd.storage_class_name.clone(),
        config_path: "/etc/pd",
        script_path: "/usr/local/bin",
        data_dir: "/var/lib/pd",
        ports: vec![
            container_port("server", PD_PEER_PORT),
            container_port("client", PD_CLIENT_PORT),
        ],
        env: vec![
            env_value("PEER_SERVICE_NAME", &peer_member_name(&name, MemberType::Pd)),
            env_value("SERVICE_NAME", &member_name(&name, MemberType::Pd)),
        ],
        command: vec![
            "/bin/sh".to_string(),
            "/usr/local/bin/pd_start_script.sh".to_string(),
        ],
        privileged: false,
        service_account: None,
    };
    build_statefulset(tc, cm_name, settings)
}

/// Generate the TiKV StatefulSet that mounts ConfigMap `cm_name`.
pub fn generate_tikv_statefulset(tc: &TikvCluster, cm_name: &str) -> StatefulSet {
    let name = tc.name_any();
    let capacity = tc
        .spec
        .tikv
        .resources
        .storage_request()
        .unwrap_or("0")
        .to_string();
    let settings = TierSettings {
        member_type: MemberType::Tikv,
        component: &tc.spec.tikv.component,
        resources: &tc.spec.tikv.resources,
        replicas: tc.tikv_sts_desired_replicas(),
        image: tc.tikv_image(),
        storage_class_name: tc.spec.tikv.storage_class_name.clone(),
        config_path: "/etc/tikv",
        script_path: "/usr/local/bin",
        data_dir: "/var/lib/tikv",
        ports: vec![
            container_port("server", TIKV_PORT),
            container_port("status", TIKV_STATUS_PORT),
        ],
        env: vec![
            env_value(
                "HEADLESS_SERVICE_NAME",
                &peer_member_name(&name, MemberType::Tikv),
            ),
            env_value("CAPACITY", &capacity),
        ],
        command: vec![
            "/bin/sh".to_string(),
            "/usr/local/bin/tikv_start_script.sh".to_string(),
        ],
        privileged: tc.tikv_container_privileged(),
        service_account: tc.spec.tikv.service_account.clone(),
    };
    build_statefulset(tc, cm_name, settings)
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn env_value(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn env_field(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn quantities(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    let converted: BTreeMap<String, Quantity> = map
        .iter()
        .filter(|(k, _)| k.as_str() != "storage")
        .map(|(k, v)| (k.clone(), Quantity(v.clone())))
        .collect();
    if converted.is_empty() {
        None
    } else {
        Some(converted)
    }
}

fn container_resources(resources: &ResourceRequirementsSpec) -> ResourceRequirements {
    ResourceRequirements {
        requests: quantities(&resources.requests),
        limits: quantities(&resources.limits),
        ..Default::default()
    }
}

fn build_statefulset(tc: &TikvCluster, cm_name: &str, tier: TierSettings<'_>) -> StatefulSet {
    let name = tc.name_any();
    let member_type = tier.member_type;
    let labels = member_labels(tc, member_type);
    let sched = scheduling(tc, tier.component);
    let volume = data_volume_name(member_type);
    let script_file = format!("{}_start_script.sh", member_type.as_str());
    let config_file = format!("{}.toml", member_type.as_str());

    let mut env = vec![
        env_field("NAMESPACE", "metadata.namespace"),
        env_value("CLUSTER_NAME", &name),
        env_value("TZ", tc.timezone()),
    ];
    env.extend(tier.env);
    env.extend(convert_env(&tier.component.env));

    let container = Container {
        name: member_type.as_str().to_string(),
        image: Some(tier.image),
        image_pull_policy: Some(sched.image_pull_policy.clone()),
        command: Some(tier.command),
        ports: Some(tier.ports),
        env: Some(env),
        resources: Some(container_resources(tier.resources)),
        security_context: if tier.privileged {
            Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            })
        } else {
            None
        },
        volume_mounts: Some(vec![
            VolumeMount {
                name: "config".to_string(),
                mount_path: tier.config_path.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "startup-script".to_string(),
                mount_path: tier.script_path.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: volume.to_string(),
                mount_path: tier.data_dir.to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let volumes = vec![
        configmap_volume("config", cm_name, CONFIG_FILE_KEY, &config_file),
        configmap_volume("startup-script", cm_name, STARTUP_SCRIPT_KEY, &script_file),
    ];

    let template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels.clone()),
            annotations: non_empty(sched.annotations),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            scheduler_name: sched.scheduler_name,
            host_network: if sched.host_network { Some(true) } else { None },
            dns_policy: if sched.host_network {
                Some("ClusterFirstWithHostNet".to_string())
            } else {
                None
            },
            priority_class_name: sched.priority_class_name,
            node_selector: non_empty(sched.node_selector),
            tolerations: if sched.tolerations.is_empty() {
                None
            } else {
                Some(sched.tolerations)
            },
            service_account_name: tier.service_account,
            containers: vec![container],
            volumes: Some(volumes),
            restart_policy: Some("Always".to_string()),
            ..Default::default()
        }),
    };

    let mut storage = BTreeMap::new();
    if let Some(size) = tier.resources.storage_request() {
        storage.insert("storage".to_string(), Quantity(size.to_string()));
    }
    let pvc_template = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(volume.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: tier.storage_class_name,
            resources: Some(VolumeResourceRequirements {
                requests: Some(storage),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    StatefulSet {
        metadata: owned_meta(tc, member_name(&name, member_type), labels.clone()),
        spec: Some(StatefulSetSpec {
            replicas: Some(tier.replicas),
            service_name: Some(peer_member_name(&name, member_type)),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            pod_management_policy: Some("Parallel".to_string()),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("OnDelete".to_string()),
                ..Default::default()
            }),
            template,
            volume_claim_templates: Some(vec![pvc_template]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn configmap_volume(name: &str, cm_name: &str, key: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: cm_name.to_string(),
            items: Some(vec![KeyToPath {
                key: key.to_string(),
                path: path.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Set the replica count of a StatefulSet. The StatefulSet controller runs
/// ordinals `0..replicas`.
pub fn set_replicas(sts: &mut StatefulSet, replicas: i32) {
    if let Some(spec) = sts.spec.as_mut() {
        spec.replicas = Some(replicas);
    }
}

pub fn statefulset_replicas(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

/// Spec fields recorded in the last-applied annotation.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct AppliedSpec {
    replicas: Option<i32>,
    template: serde_json::Value,
    update_strategy: Option<StatefulSetUpdateStrategy>,
}

fn applied_spec(sts: &StatefulSet) -> Result<AppliedSpec> {
    let spec = sts.spec.clone().unwrap_or_default();
    Ok(AppliedSpec {
        replicas: spec.replicas,
        template: serde_json::to_value(&spec.template)?,
        update_strategy: spec.update_strategy,
    })
}

fn recorded_spec(sts: &StatefulSet) -> Option<AppliedSpec> {
    sts.annotations()
        .get(ANN_LAST_APPLIED_CONFIG)
        .and_then(|v| serde_json::from_str(v).ok())
}

/// Record the spec about to be written in the last-applied annotation.
pub fn set_last_applied_config(sts: &mut StatefulSet) -> Result<()> {
    let applied = serde_json::to_string(&applied_spec(sts)?)?;
    sts.annotations_mut()
        .insert(ANN_LAST_APPLIED_CONFIG.to_string(), applied);
    Ok(())
}

/// Pod template recorded in the last-applied annotation of `sts`.
pub fn last_applied_template(sts: &StatefulSet) -> Option<PodTemplateSpec> {
    recorded_spec(sts).and_then(|spec| serde_json::from_value(spec.template).ok())
}

/// The pod template of `new` equals the template last applied to `old`.
pub fn template_equal(new: &StatefulSet, old: &StatefulSet) -> bool {
    let (Some(recorded), Ok(desired)) = (recorded_spec(old), applied_spec(new)) else {
        return false;
    };
    recorded.template == desired.template
}

/// `new` matches the spec last applied to `old`.
pub fn statefulset_equal(new: &StatefulSet, old: &StatefulSet) -> bool {
    let (Some(recorded), Ok(desired)) = (recorded_spec(old), applied_spec(new)) else {
        return false;
    };
    recorded == desired
}

/// Status snapshot stored on the cluster.
pub fn status_snapshot(sts: &StatefulSet) -> Option<StatefulSetStatusSnapshot> {
    sts.status.as_ref().map(|s| StatefulSetStatusSnapshot {
        replicas: s.replicas,
        ready_replicas: s.ready_replicas.unwrap_or(0),
        current_replicas: s.current_replicas.unwrap_or(0),
        updated_replicas: s.updated_replicas.unwrap_or(0),
        current_revision: s.current_revision.clone(),
        update_revision: s.update_revision.clone(),
        observed_generation: s.observed_generation,
    })
}

/// The StatefulSet controller has not finished rolling out its update revision.
pub fn statefulset_is_upgrading(sts: &StatefulSet) -> bool {
    let Some(status) = sts.status.as_ref() else {
        return false;
    };
    if status.observed_generation.is_some() && status.observed_generation != sts.metadata.generation {
        return true;
    }
    status.current_revision != status.update_revision
}

/// Image of the tier container.
pub fn container_image(sts: &StatefulSet, member_type: MemberType) -> Option<String> {
    sts.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == member_type.as_str())
        .and_then(|c| c.image.clone())
}
