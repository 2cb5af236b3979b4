//! Custom Resource Definitions (CRDs) for tikv-operator.
//!
//! - `TikvCluster`: Deploy and manage a PD tier and a TiKV tier

mod tikv_cluster;

pub use tikv_cluster::*;
