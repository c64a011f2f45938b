//! Provisioning backend for Trellis
//!
//! - [`Backend`]: leases cluster documents and runs one worker per lease
//! - [`run_cycle`] and [`transition`]: the provisioning state machine
//! - [`Installer`]: the resumable install phase sequencer
//! - [`ResourceManager`] and [`Provisioner`]: seams for provider work

#![deny(missing_docs)]

mod backend;
mod cluster;
mod config;
mod install;
mod manager;
mod provisioning;

pub use backend::Backend;
pub use cluster::{ClusterManager, ClusterManagerFactory};
pub use config::BackendConfig;
pub use install::{InstallConfig, Installer, PhaseStatus, Provisioner};
pub use manager::{ManagerFactory, ResourceManager};
pub use provisioning::{run_cycle, transition, CycleOutcome, CycleSettings, Step};
