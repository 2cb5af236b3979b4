//! Label and annotation taxonomy shared by every owned object.

use std::collections::BTreeMap;

use crate::crd::MemberType;

pub const NAME_KEY: &str = "app.kubernetes.io/name";
pub const MANAGED_BY_KEY: &str = "app.kubernetes.io/managed-by";
pub const INSTANCE_KEY: &str = "app.kubernetes.io/instance";
pub const COMPONENT_KEY: &str = "app.kubernetes.io/component";

/// Cluster id label propagated to pods and PVCs.
pub const CLUSTER_ID_KEY: &str = "tikv.org/cluster-id";
/// PD member id label propagated to pods and PVCs.
pub const MEMBER_ID_KEY: &str = "tikv.org/member-id";
/// TiKV store id label propagated to pods and PVCs.
pub const STORE_ID_KEY: &str = "tikv.org/store-id";

/// PVC annotation naming the pod that owns it.
pub const ANN_POD_NAME: &str = "tikv.org/pod-name";
/// PVC annotation marking it for deletion once its ordinal is gone.
pub const ANN_PVC_DEFER_DELETING: &str = "tikv.org/pvc-defer-deleting";
/// Pod annotation recording when leader eviction started.
pub const ANN_EVICT_LEADER_BEGIN_TIME: &str = "tikv.org/evict-leader-begin-time";
/// StatefulSet annotation set while the tier is bootstrapping at one replica.
pub const ANN_BOOTSTRAPPING: &str = "tikv.org/bootstrapping";
/// StatefulSet annotation with the last applied spec.
pub const ANN_LAST_APPLIED_CONFIG: &str = "tikv.org/last-applied-configuration";

/// Pod label written by the StatefulSet controller.
pub const CONTROLLER_REVISION_HASH_KEY: &str = "controller-revision-hash";

pub const NAME_VALUE: &str = "tikv-cluster";
pub const MANAGED_BY_VALUE: &str = "tikv-operator";
pub const DISCOVERY_COMPONENT: &str = "discovery";

/// Builder over the label set of a cluster's objects.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Label(BTreeMap<String, String>);

impl Label {
    /// Base labels every cluster object carries.
    pub fn new() -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(NAME_KEY.to_string(), NAME_VALUE.to_string());
        labels.insert(MANAGED_BY_KEY.to_string(), MANAGED_BY_VALUE.to_string());
        Label(labels)
    }

    pub fn instance(mut self, name: &str) -> Self {
        self.0.insert(INSTANCE_KEY.to_string(), name.to_string());
        self
    }

    pub fn component(mut self, component: &str) -> Self {
        self.0.insert(COMPONENT_KEY.to_string(), component.to_string());
        self
    }

    pub fn member(self, member_type: MemberType) -> Self {
        self.component(member_type.as_str())
    }

    pub fn pd(self) -> Self {
        self.member(MemberType::Pd)
    }

    pub fn tikv(self) -> Self {
        self.member(MemberType::Tikv)
    }

    pub fn discovery(self) -> Self {
        self.component(DISCOVERY_COMPONENT)
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.0.clone()
    }

    pub fn into_labels(self) -> BTreeMap<String, String> {
        self.0
    }

    /// `k=v,k=v` selector string.
    pub fn selector(&self) -> String {
        selector_string(&self.0)
    }
}

/// Render a label map as a Kubernetes label selector.
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Every key/value of `selector` is present in `labels`.
pub fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}
