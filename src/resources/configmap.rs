//! Tier ConfigMaps: the raw TOML config and the startup script.
//!
//! With the `RollingUpdate` config strategy the ConfigMap name carries a hash
//! of its content, so a config change produces a new pod template. `InPlace`
//! keeps a fixed name and rewrites the data.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::crd::{ConfigUpdateStrategy, MemberType, TikvCluster};
use crate::resources::common::{config_update_strategy, member_labels, member_name, owned_meta};

pub const CONFIG_FILE_KEY: &str = "config-file";
pub const STARTUP_SCRIPT_KEY: &str = "startup-script";

const PD_STARTUP_SCRIPT: &str = r#"#!/bin/sh
set -uo pipefail

domain="${HOSTNAME}.${PEER_SERVICE_NAME}.${NAMESPACE}.svc"
until nslookup "${domain}" > /dev/null 2>&1; do
    echo "waiting for ${domain} to resolve"
    sleep 1
done

ARGS="--data-dir=/var/lib/pd \
--name=${HOSTNAME} \
--peer-urls=http://0.0.0.0:2380 \
--advertise-peer-urls=http://${domain}:2380 \
--client-urls=http://0.0.0.0:2379 \
--advertise-client-urls=http://${domain}:2379 \
--config=/etc/pd/pd.toml"

if [ -f /var/lib/pd/join ]; then
    join=$(cat /var/lib/pd/join | tr "," "\n" | awk -F'=' '{print $2}' | tr "\n" ",")
    ARGS="${ARGS} --join=${join%,}"
elif [ ! -d /var/lib/pd/member/wal ]; then
    encoded_domain_url=$(echo "${domain}:2380" | base64 | tr -d "\n")
    discovery_url="${CLUSTER_NAME}-discovery.${NAMESPACE}.svc:10261"
    until result=$(wget -qO- -T 3 "http://${discovery_url}/new/${encoded_domain_url}" 2>/dev/null); do
        echo "waiting for discovery service to return start args"
        sleep $((RANDOM % 5))
    done
    ARGS="${ARGS} ${result}"
fi

echo "starting pd-server ..."
echo "/pd-server ${ARGS}"
exec /pd-server ${ARGS}
"#;

const TIKV_STARTUP_SCRIPT: &str = r#"#!/bin/sh
set -uo pipefail

ARGS="--pd=http://${CLUSTER_NAME}-pd:2379 \
--advertise-addr=${HOSTNAME}.${HEADLESS_SERVICE_NAME}.${NAMESPACE}.svc:20160 \
--addr=0.0.0.0:20160 \
--status-addr=0.0.0.0:20180 \
--data-dir=/var/lib/tikv \
--capacity=${CAPACITY} \
--config=/etc/tikv/tikv.toml"

echo "starting tikv-server ..."
echo "/tikv-server ${ARGS}"
exec /tikv-server ${ARGS}
"#;

fn raw_config(tc: &TikvCluster, member_type: MemberType) -> String {
    match member_type {
        MemberType::Pd => tc.spec.pd.config.clone(),
        MemberType::Tikv => tc.spec.tikv.config.clone(),
    }
    .unwrap_or_default()
}

/// Short content hash of ConfigMap data.
pub fn data_hash(data: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    hasher
        .finalize()
        .iter()
        .take(4)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Generate the ConfigMap of a tier.
pub fn generate_configmap(tc: &TikvCluster, member_type: MemberType) -> ConfigMap {
    let script = match member_type {
        MemberType::Pd => PD_STARTUP_SCRIPT,
        MemberType::Tikv => TIKV_STARTUP_SCRIPT,
    };
    let mut data = BTreeMap::new();
    data.insert(CONFIG_FILE_KEY.to_string(), raw_config(tc, member_type));
    data.insert(STARTUP_SCRIPT_KEY.to_string(), script.to_string());

    let component = match member_type {
        MemberType::Pd => &tc.spec.pd.component,
        MemberType::Tikv => &tc.spec.tikv.component,
    };
    let base = member_name(&tc.name_any(), member_type);
    let name = match config_update_strategy(tc, component) {
        ConfigUpdateStrategy::InPlace => base,
        ConfigUpdateStrategy::RollingUpdate => format!("{}-{}", base, data_hash(&data)),
    };

    ConfigMap {
        metadata: owned_meta(tc, name, member_labels(tc, member_type)),
        data: Some(data),
        ..Default::default()
    }
}
