//! Defaults applied to a cluster before every reconcile.
//!
//! The defaulted copy is what the managers see; defaults are never written
//! back to the spec.

use crate::crd::TikvCluster;

pub const DEFAULT_PD_IMAGE: &str = "pingcap/pd";
pub const DEFAULT_TIKV_IMAGE: &str = "pingcap/tikv";
pub const DEFAULT_MAX_FAILOVER_COUNT: i32 = 3;
const DEFAULT_IMAGE_PULL_POLICY: &str = "IfNotPresent";

/// Fill unset fields with their defaults.
pub fn set_defaults(tc: &mut TikvCluster) {
    let spec = &mut tc.spec;
    if spec.image_pull_policy.as_deref().is_none_or(str::is_empty) {
        spec.image_pull_policy = Some(DEFAULT_IMAGE_PULL_POLICY.to_string());
    }

    let has_version = !spec.version.is_empty();

    if (has_version || spec.pd.component.version.is_some()) && spec.pd.base_image.is_empty() {
        spec.pd.base_image = DEFAULT_PD_IMAGE.to_string();
    }
    if spec.pd.max_failover_count.is_none() {
        spec.pd.max_failover_count = Some(DEFAULT_MAX_FAILOVER_COUNT);
    }

    if (has_version || spec.tikv.component.version.is_some()) && spec.tikv.base_image.is_empty() {
        spec.tikv.base_image = DEFAULT_TIKV_IMAGE.to_string();
    }
    if spec.tikv.max_failover_count.is_none() {
        spec.tikv.max_failover_count = Some(DEFAULT_MAX_FAILOVER_COUNT);
    }
}
