//! TikvCluster controller.
//!
//! Contains the controller entry points, the reconcile
//! orchestrator and the pieces they share: context, configuration, error
//! classification, events, defaulting, validation, conditions and status
//! persistence.

pub mod condition;
pub mod config;
pub mod context;
pub mod defaulting;
pub mod error;
pub mod events;
pub mod status;
pub mod tikv_cluster_control;
pub mod tikv_cluster_controller;
pub mod validation;
