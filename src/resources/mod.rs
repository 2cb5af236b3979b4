//! Resource generation module.
//!
//! Contains utilities for generating Kubernetes resources owned by TikvCluster.
//!
//! ## Resources Generated
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | StatefulSet | PD and TiKV members with stable identity and storage |
//! | Peer Service | Headless member DNS (publishNotReadyAddresses) |
//! | PD Service | PD client endpoint |
//! | ConfigMap | Tier TOML config and startup script |
//! | Deployment | Discovery service for PD bootstrap |
//! | ServiceAccount / Role / RoleBinding | Discovery access to its cluster |

pub mod common;
pub mod configmap;
pub mod discovery;
pub mod labels;
pub mod services;
pub mod statefulset;

// Re-export commonly used items from common
pub use common::owner_reference;
pub use labels::Label;
