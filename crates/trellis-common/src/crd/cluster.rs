//! Cluster singleton read by the in-cluster controllers
//!
//! Exactly one `Cluster` named [`CLUSTER_SINGLETON`] exists per cluster. It
//! carries the cluster's identity, the operator feature flags and the
//! last-applied snapshots each controller uses for change deduplication.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the singleton `Cluster` object
pub const CLUSTER_SINGLETON: &str = "cluster";

/// Feature flag gating the storage account controller
pub const STORAGE_ACCOUNTS_ENABLED: &str = "trellis.storageaccounts.enabled";

/// Feature flag gating the dnsmasq controllers
pub const DNSMASQ_ENABLED: &str = "trellis.dns.enabled";

/// Example:
/// ```yaml
/// apiVersion: trellis.dev/v1alpha1
/// kind: Cluster
/// metadata:
///   name: cluster
/// spec:
///   resourceId: /subscriptions/abc/resourceGroups/rg/providers/Trellis/clusters/prod
///   location: eastus
///   storageSuffix: x7k2p
///   domain: prod.example.com
///   apiIntIp: 10.0.0.4
///   ingressIp: 10.0.0.5
///   serviceSubnets:
///     - /subscriptions/abc/resourceGroups/vnet/providers/Network/virtualNetworks/v/subnets/master
///   operatorFlags:
///     trellis.storageaccounts.enabled: "true"
///     trellis.dns.enabled: "true"
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "Cluster",
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Location","type":"string","jsonPath":".spec.location"}"#,
    printcolumn = r#"{"name":"Domain","type":"string","jsonPath":".spec.domain"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Resource ID of the managed cluster
    #[serde(default)]
    pub resource_id: String,

    /// Region the cluster runs in
    #[serde(default)]
    pub location: String,

    /// Suffix shared by the cluster's storage account names
    #[serde(default)]
    pub storage_suffix: String,

    /// Base DNS domain of the cluster
    #[serde(default)]
    pub domain: String,

    /// Internal API load balancer address
    #[serde(default)]
    pub api_int_ip: String,

    /// Default ingress address
    #[serde(default)]
    pub ingress_ip: String,

    /// Subnets of services that must reach the cluster's storage
    #[serde(default)]
    pub service_subnets: Vec<String>,

    /// Operator feature flags; a flag is on only when its value is `true`
    #[serde(default)]
    pub operator_flags: BTreeMap<String, String>,
}

impl ClusterSpec {
    /// True when `flag` is set to a boolean `true`
    pub fn flag_enabled(&self, flag: &str) -> bool {
        self.operator_flags
            .get(flag)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
    }
}

/// Observed state of the cluster singleton
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Last storage account reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_accounts: Option<StorageAccountsStatus>,
}

/// Parameters and completion time of the last storage account reconcile
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageAccountsStatus {
    /// When the reconcile finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completion_time: Option<DateTime<Utc>>,

    /// Subnets granted access, sorted
    #[serde(default)]
    pub subnets: Vec<String>,

    /// Storage accounts updated, sorted
    #[serde(default)]
    pub storage_accounts: Vec<String>,
}
