//! MachineConfig and MachineConfigPool types
//!
//! These CRDs are owned by the node configuration operator, not by Trellis.
//! Only the fields Trellis reads or writes are modelled; unknown fields are
//! ignored on read.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label tying a MachineConfig to the pool role it configures
pub const MACHINE_CONFIG_ROLE_LABEL: &str = "machineconfiguration.openshift.io/role";

/// Pool of nodes sharing one rendered machine configuration
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machineconfiguration.openshift.io",
    version = "v1",
    kind = "MachineConfigPool",
    plural = "machineconfigpools"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigPoolSpec {
    /// Whether rollout of new configuration is paused
    #[serde(default)]
    pub paused: bool,
}

/// One fragment of node configuration
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machineconfiguration.openshift.io",
    version = "v1",
    kind = "MachineConfig",
    plural = "machineconfigs"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigSpec {
    /// Ignition configuration merged into the pool's rendered config
    #[serde(default)]
    pub config: serde_json::Value,
}
