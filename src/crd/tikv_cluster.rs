//! TikvCluster Custom Resource Definition.
//!
//! A TikvCluster describes a PD (placement) tier and a TiKV (storage) tier.
//! The spec is user-owned; the status is rewritten by the controller on
//! every reconcile pass.

use std::collections::{BTreeMap, BTreeSet};

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation carrying the PD delete slots (JSON integer array).
pub const ANN_PD_DELETE_SLOTS: &str = "pd.tikv.org/delete-slots";
/// Annotation carrying the TiKV delete slots (JSON integer array).
pub const ANN_TIKV_DELETE_SLOTS: &str = "tikv.tikv.org/delete-slots";
/// Annotation that lets the upgrader proceed past unhealthy members.
pub const ANN_FORCE_UPGRADE: &str = "tikv.org/force-upgrade";

const DEFAULT_TIMEZONE: &str = "UTC";

/// TikvCluster is a custom resource describing a TiKV deployment.
///
/// Example:
/// ```yaml
/// apiVersion: tikv.org/v1alpha1
/// kind: TikvCluster
/// metadata:
///   name: basic
/// spec:
///   version: v4.0.0
///   pd:
///     baseImage: pingcap/pd
///     replicas: 3
///     requests:
///       storage: 1Gi
///   tikv:
///     baseImage: pingcap/tikv
///     replicas: 3
///     requests:
///       storage: 10Gi
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tikv.org",
    version = "v1alpha1",
    kind = "TikvCluster",
    plural = "tikvclusters",
    shortname = "tc",
    status = "TikvClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"PD", "type":"string", "jsonPath":".status.pd.image"}"#,
    printcolumn = r#"{"name":"Storage", "type":"string", "jsonPath":".spec.pd.requests.storage"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.pd.statefulSet.readyReplicas"}"#,
    printcolumn = r#"{"name":"Desire", "type":"integer", "jsonPath":".spec.pd.replicas"}"#,
    printcolumn = r#"{"name":"TiKV", "type":"string", "jsonPath":".status.tikv.image"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.tikv.statefulSet.readyReplicas"}"#,
    printcolumn = r#"{"name":"Desire", "type":"integer", "jsonPath":".spec.tikv.replicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TikvClusterSpec {
    /// Discovery service settings.
    #[serde(default)]
    pub discovery: DiscoverySpec,

    /// PD tier.
    pub pd: PdSpec,

    /// TiKV tier.
    pub tikv: TikvSpec,

    /// Stop mutating workloads; status is still refreshed.
    #[serde(default)]
    pub paused: bool,

    /// Cluster-wide version, used as image tag unless a tier overrides it.
    #[serde(default)]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,

    /// Defaults to IfNotPresent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    #[serde(default)]
    pub config_update_strategy: ConfigUpdateStrategy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_network: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Annotations added to every pod.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Timezone of the pods, defaults to UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// How config changes reach running pods.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConfigUpdateStrategy {
    /// Update the ConfigMap in place; pods pick it up on their next restart.
    #[default]
    InPlace,
    /// Generate a new ConfigMap per config content, rolling the pods.
    RollingUpdate,
}

/// Discovery service configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverySpec {
    #[serde(flatten)]
    pub resources: ResourceRequirementsSpec,
}

/// Settings shared by both tiers.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Deprecated, use baseImage instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Overrides the cluster version for this tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_network: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_update_strategy: Option<ConfigUpdateStrategy>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

/// PD tier specification.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PdSpec {
    #[serde(flatten)]
    pub component: ComponentSpec,

    #[serde(flatten)]
    pub resources: ResourceRequirementsSpec,

    /// Number of PD members (minimum 1).
    pub replicas: i32,

    /// Image repository, tagged with the tier or cluster version.
    #[serde(default)]
    pub base_image: String,

    /// Client service customisation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceSpec>,

    /// Failover budget; 0 disables failover. Defaults to 3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failover_count: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Raw PD configuration in TOML.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

/// TiKV tier specification.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TikvSpec {
    #[serde(flatten)]
    pub component: ComponentSpec,

    #[serde(flatten)]
    pub resources: ResourceRequirementsSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Number of TiKV stores (minimum 1).
    pub replicas: i32,

    #[serde(default)]
    pub base_image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failover_count: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Raw TiKV configuration in TOML.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

/// Client service customisation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, rename = "loadBalancerIP", skip_serializing_if = "Option::is_none")]
    pub load_balancer_ip: Option<String>,

    #[serde(default, rename = "clusterIP", skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,
}

/// Resource requests and limits as Kubernetes quantity strings.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirementsSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

impl ResourceRequirementsSpec {
    /// The requested storage size, if any.
    pub fn storage_request(&self) -> Option<&str> {
        self.requests.get("storage").map(String::as_str)
    }
}

/// Toleration for pod scheduling.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

/// Environment variable passed to a tier's container.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSource>,
}

/// Source of an environment variable value.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_ref: Option<FieldSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_field_ref: Option<ResourceFieldSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<KeySelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<KeySelector>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldSelector {
    pub field_path: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFieldSelector {
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
}

/// Key in a ConfigMap or Secret.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeySelector {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

// ============================================================================
// Status
// ============================================================================

/// Observed state of a TikvCluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TikvClusterStatus {
    /// Cluster id reported by PD.
    #[serde(default, rename = "clusterID", skip_serializing_if = "String::is_empty")]
    pub cluster_id: String,

    #[serde(default)]
    pub pd: PdStatus,

    #[serde(default)]
    pub tikv: TikvStatus,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<TikvClusterCondition>,
}

/// Phase of a tier.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum MemberPhase {
    #[default]
    Normal,
    Upgrade,
}

impl std::fmt::Display for MemberPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberPhase::Normal => write!(f, "Normal"),
            MemberPhase::Upgrade => write!(f, "Upgrade"),
        }
    }
}

/// Snapshot of a StatefulSet's status.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatefulSetStatusSnapshot {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub current_replicas: i32,
    #[serde(default)]
    pub updated_replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// PD tier status.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PdStatus {
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub phase: MemberPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful_set: Option<StatefulSetStatusSnapshot>,
    /// Members keyed by member name (the pod name).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub members: BTreeMap<String, PdMember>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<PdMember>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failure_members: BTreeMap<String, PdFailureMember>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unjoined_members: BTreeMap<String, UnjoinedMember>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
}

/// A PD member as reported by PD.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PdMember {
    pub name: String,
    /// Member id as a decimal string.
    pub id: String,
    #[serde(rename = "clientURL")]
    pub client_url: String,
    pub health: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// A PD member marked as failed.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PdFailureMember {
    pub pod_name: String,
    #[serde(rename = "memberID")]
    pub member_id: String,
    #[serde(default, rename = "pvcUID")]
    pub pvc_uid: String,
    #[serde(default)]
    pub member_deleted: bool,
    pub created_at: String,
}

/// A PD pod that has not joined the PD cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnjoinedMember {
    pub pod_name: String,
    #[serde(default, rename = "pvcUID")]
    pub pvc_uid: String,
    pub created_at: String,
}

/// TiKV tier status.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TikvStatus {
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub phase: MemberPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful_set: Option<StatefulSetStatusSnapshot>,
    /// Live stores keyed by store id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stores: BTreeMap<String, TikvStore>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tombstone_stores: BTreeMap<String, TikvStore>,
    /// Failure records keyed by pod name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failure_stores: BTreeMap<String, TikvFailureStore>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
}

/// State of a TiKV store as named by PD.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum StoreState {
    Up,
    Down,
    Offline,
    Tombstone,
    Disconnected,
    #[default]
    #[serde(other)]
    Unknown,
}

impl StoreState {
    /// Parse a PD `state_name`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "Up" => StoreState::Up,
            "Down" => StoreState::Down,
            "Offline" => StoreState::Offline,
            "Tombstone" => StoreState::Tombstone,
            "Disconnected" => StoreState::Disconnected,
            _ => StoreState::Unknown,
        }
    }
}

impl std::fmt::Display for StoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreState::Up => write!(f, "Up"),
            StoreState::Down => write!(f, "Down"),
            StoreState::Offline => write!(f, "Offline"),
            StoreState::Tombstone => write!(f, "Tombstone"),
            StoreState::Disconnected => write!(f, "Disconnected"),
            StoreState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A TiKV store as reported by PD.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TikvStore {
    pub id: String,
    pub pod_name: String,
    pub ip: String,
    pub leader_count: i32,
    pub state: StoreState,
    #[serde(default)]
    pub last_heartbeat_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// A TiKV store marked as failed.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TikvFailureStore {
    pub pod_name: String,
    #[serde(rename = "storeID")]
    pub store_id: String,
    pub created_at: String,
}

/// Condition type reported on the cluster.
pub const CONDITION_READY: &str = "Ready";

/// Aggregate condition of a TikvCluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TikvClusterCondition {
    pub r#type: String,
    /// "True", "False" or "Unknown".
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Which tier a helper operates on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MemberType {
    Pd,
    Tikv,
}

impl MemberType {
    /// Component label value and name suffix.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberType::Pd => "pd",
            MemberType::Tikv => "tikv",
        }
    }
}

impl std::fmt::Display for MemberType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn component_image(component: &ComponentSpec, base_image: &str, cluster_version: &str) -> String {
    if base_image.is_empty() {
        return component.image.clone().unwrap_or_default();
    }
    let version = component.version.as_deref().unwrap_or(cluster_version);
    format!("{}:{}", base_image, version)
}

impl TikvCluster {
    /// PD image; baseImage takes priority over the deprecated image field.
    pub fn pd_image(&self) -> String {
        component_image(
            &self.spec.pd.component,
            &self.spec.pd.base_image,
            &self.spec.version,
        )
    }

    /// TiKV image; baseImage takes priority over the deprecated image field.
    pub fn tikv_image(&self) -> String {
        component_image(
            &self.spec.tikv.component,
            &self.spec.tikv.base_image,
            &self.spec.version,
        )
    }

    /// Tag of the PD image, "latest" when untagged.
    pub fn pd_version(&self) -> String {
        let image = self.pd_image();
        match image.rsplit_once(':') {
            Some((_, tag)) => tag.to_string(),
            None => "latest".to_string(),
        }
    }

    pub fn timezone(&self) -> &str {
        match self.spec.timezone.as_deref() {
            Some(tz) if !tz.is_empty() => tz,
            _ => DEFAULT_TIMEZONE,
        }
    }

    pub fn image_pull_policy(&self) -> &str {
        self.spec.image_pull_policy.as_deref().unwrap_or("IfNotPresent")
    }

    pub fn status_ref(&self) -> TikvClusterStatus {
        self.status.clone().unwrap_or_default()
    }

    /// `namespace/name` key of this cluster.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn pd_sts_desired_replicas(&self) -> i32 {
        let failures = self
            .status
            .as_ref()
            .map(|s| s.pd.failure_members.len())
            .unwrap_or(0);
        self.spec.pd.replicas + failures as i32
    }

    pub fn tikv_sts_desired_replicas(&self) -> i32 {
        let failures = self
            .status
            .as_ref()
            .map(|s| s.tikv.failure_stores.len())
            .unwrap_or(0);
        self.spec.tikv.replicas + failures as i32
    }

    pub fn sts_desired_replicas(&self, member_type: MemberType) -> i32 {
        match member_type {
            MemberType::Pd => self.pd_sts_desired_replicas(),
            MemberType::Tikv => self.tikv_sts_desired_replicas(),
        }
    }

    fn sts_status(&self, member_type: MemberType) -> Option<&StatefulSetStatusSnapshot> {
        let status = self.status.as_ref()?;
        match member_type {
            MemberType::Pd => status.pd.stateful_set.as_ref(),
            MemberType::Tikv => status.tikv.stateful_set.as_ref(),
        }
    }

    /// Replicas reported by the tier's StatefulSet (0 when unknown).
    pub fn sts_actual_replicas(&self, member_type: MemberType) -> i32 {
        self.sts_status(member_type).map(|s| s.replicas).unwrap_or(0)
    }

    pub fn all_pods_started(&self, member_type: MemberType) -> bool {
        self.sts_desired_replicas(member_type) == self.sts_actual_replicas(member_type)
    }

    /// All desired PD members are present and healthy.
    pub fn pd_all_members_ready(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        if self.pd_sts_desired_replicas() as usize != status.pd.members.len() {
            return false;
        }
        status.pd.members.values().all(|m| m.health)
    }

    /// All desired TiKV stores are present and Up.
    pub fn tikv_all_stores_ready(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        if self.tikv_sts_desired_replicas() as usize != status.tikv.stores.len() {
            return false;
        }
        status.tikv.stores.values().all(|s| s.state == StoreState::Up)
    }

    /// PD has quorum: members, healthy members and ready pods all reach a majority.
    pub fn pd_is_available(&self) -> bool {
        let lower_limit = (self.spec.pd.replicas / 2 + 1) as usize;
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        if status.pd.members.len() < lower_limit {
            return false;
        }
        let healthy = status.pd.members.values().filter(|m| m.health).count();
        if healthy < lower_limit {
            return false;
        }
        match status.pd.stateful_set.as_ref() {
            Some(sts) => sts.ready_replicas as usize >= lower_limit,
            None => false,
        }
    }

    /// A PD failure member exists whose replacement workflow has not finished.
    pub fn pd_auto_failovering(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.pd.failure_members.values().any(|m| !m.member_deleted))
    }

    pub fn pd_upgrading(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.pd.phase == MemberPhase::Upgrade)
    }

    pub fn tikv_upgrading(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.tikv.phase == MemberPhase::Upgrade)
    }

    /// Delete slots of a tier parsed from its annotation; malformed values yield an empty set.
    pub fn delete_slots(&self, member_type: MemberType) -> BTreeSet<i32> {
        let key = match member_type {
            MemberType::Pd => ANN_PD_DELETE_SLOTS,
            MemberType::Tikv => ANN_TIKV_DELETE_SLOTS,
        };
        self.annotations()
            .get(key)
            .and_then(|v| serde_json::from_str::<Vec<i32>>(v).ok())
            .map(|slots| slots.into_iter().collect())
            .unwrap_or_default()
    }

    /// Desired pod ordinals of a tier.
    ///
    /// With `exclude_failover` the failure records are not counted.
    pub fn sts_desired_ordinals(&self, member_type: MemberType, exclude_failover: bool) -> BTreeSet<i32> {
        let replicas = match (member_type, exclude_failover) {
            (MemberType::Pd, true) => self.spec.pd.replicas,
            (MemberType::Tikv, true) => self.spec.tikv.replicas,
            (t, false) => self.sts_desired_replicas(t),
        };
        pod_ordinals_from_replicas_and_delete_slots(replicas, &self.delete_slots(member_type))
    }

    /// The force-upgrade annotation is set to "true".
    pub fn force_upgrade(&self) -> bool {
        self.annotations()
            .get(ANN_FORCE_UPGRADE)
            .is_some_and(|v| v == "true")
    }

    pub fn tikv_container_privileged(&self) -> bool {
        self.spec.tikv.privileged.unwrap_or(false)
    }
}

/// The first `replicas` non-negative ordinals that are not delete slots.
pub fn pod_ordinals_from_replicas_and_delete_slots(
    replicas: i32,
    delete_slots: &BTreeSet<i32>,
) -> BTreeSet<i32> {
    let mut ordinals = BTreeSet::new();
    let mut ordinal = 0;
    while (ordinals.len() as i32) < replicas.max(0) {
        if !delete_slots.contains(&ordinal) {
            ordinals.insert(ordinal);
        }
        ordinal += 1;
    }
    ordinals
}
