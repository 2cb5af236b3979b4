//! Service generation for TiKV clusters.
//!
//! - **PD client Service**: `{name}-pd`, the address of the PD HTTP API
//! - **PD peer Service**: `{name}-pd-peer`, headless, stable member DNS
//! - **TiKV peer Service**: `{name}-tikv-peer`, headless, store addresses
//! - **Discovery Service**: `{name}-discovery`

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::{MemberType, TikvCluster};
use crate::resources::common::{
    discovery_name, member_labels, non_empty, owned_meta, pd_member_name, peer_member_name,
};
use crate::resources::labels::Label;

pub const PD_CLIENT_PORT: i32 = 2379;
pub const PD_PEER_PORT: i32 = 2380;
pub const TIKV_PORT: i32 = 20160;
pub const TIKV_STATUS_PORT: i32 = 20180;
pub const DISCOVERY_PORT: i32 = 10261;

fn tcp_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Generate the PD client Service.
///
/// `spec.pd.service` can change its type, annotations, IPs and port name.
pub fn generate_pd_service(tc: &TikvCluster) -> Service {
    let labels = member_labels(tc, MemberType::Pd);
    let custom = tc.spec.pd.service.clone().unwrap_or_default();
    let port_name = custom.port_name.clone().unwrap_or_else(|| "client".to_string());
    let type_ = custom.type_.clone().unwrap_or_else(|| "ClusterIP".to_string());

    let mut meta = owned_meta(tc, pd_member_name(&tc.name_any()), labels.clone());
    meta.annotations = non_empty(custom.annotations.clone());

    Service {
        metadata: meta,
        spec: Some(ServiceSpec {
            load_balancer_ip: if type_ == "LoadBalancer" {
                custom.load_balancer_ip.clone()
            } else {
                None
            },
            cluster_ip: custom.cluster_ip.clone(),
            type_: Some(type_),
            selector: Some(labels),
            ports: Some(vec![tcp_port(&port_name, PD_CLIENT_PORT)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the headless Service of a tier.
///
/// `publishNotReadyAddresses` lets members find each other before they are ready.
pub fn generate_peer_service(tc: &TikvCluster, member_type: MemberType) -> Service {
    let labels = member_labels(tc, member_type);
    let port = match member_type {
        MemberType::Pd => tcp_port("peer", PD_PEER_PORT),
        MemberType::Tikv => tcp_port("peer", TIKV_PORT),
    };

    Service {
        metadata: owned_meta(tc, peer_member_name(&tc.name_any(), member_type), labels.clone()),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(labels),
            ports: Some(vec![port]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the discovery Service.
pub fn generate_discovery_service(tc: &TikvCluster) -> Service {
    let labels = Label::new()
        .instance(&tc.name_any())
        .discovery()
        .into_labels();

    Service {
        metadata: owned_meta(tc, discovery_name(&tc.name_any()), labels.clone()),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels),
            ports: Some(vec![tcp_port("discovery", DISCOVERY_PORT)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Whether `existing` must be rewritten to match `desired`.
///
/// The allocated cluster IP is not compared unless the desired service pins one.
pub fn service_needs_update(desired: &Service, existing: &Service) -> bool {
    let (Some(want), Some(have)) = (desired.spec.as_ref(), existing.spec.as_ref()) else {
        return desired.spec.is_some();
    };
    want.type_ != have.type_
        || want.selector != have.selector
        || want.ports != have.ports
        || want.publish_not_ready_addresses != have.publish_not_ready_addresses
        || want.load_balancer_ip != have.load_balancer_ip
        || (want.cluster_ip.is_some() && want.cluster_ip != have.cluster_ip)
        || desired.metadata.annotations != existing.metadata.annotations
        || desired.metadata.labels != existing.metadata.labels
}

/// Merge desired spec onto an existing service, keeping server-assigned fields.
pub fn merge_service(desired: &Service, existing: &Service) -> Service {
    let mut merged = existing.clone();
    merged.metadata.labels = desired.metadata.labels.clone();
    merged.metadata.annotations = desired.metadata.annotations.clone();
    if let (Some(want), Some(have)) = (desired.spec.as_ref(), merged.spec.as_mut()) {
        let cluster_ip = want.cluster_ip.clone().or_else(|| have.cluster_ip.clone());
        let cluster_ips = have.cluster_ips.clone();
        *have = want.clone();
        have.cluster_ip = cluster_ip;
        have.cluster_ips = cluster_ips;
    } else {
        merged.spec = desired.spec.clone();
    }
    merged
}
