//! Trellis in-cluster operator: dnsmasq and storage account controllers

#![deny(missing_docs)]

/// Kubernetes clients for the cluster singleton and machine config pools
pub mod clients;
/// Operator settings
pub mod config;
/// Controller wiring for the kube runtime
pub mod controller_runner;
/// Concrete child reconcilers
pub mod controllers;
/// Kind-agnostic apply and delete
pub mod dynamic;
/// Shared reconcile skeleton and its outcome type
pub mod reconciler;

pub use config::OperatorConfig;
pub use controller_runner::{
    build_dnsmasq_controllers, build_storage_account_controllers, ControllerFuture,
};
pub use reconciler::{reconcile, ChildReconciler, ReconcileOutcome, Snapshot};
