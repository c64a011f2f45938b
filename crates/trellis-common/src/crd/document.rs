//! Cluster documents driven by the backend dispatcher
//!
//! A `ClusterDocument` is the unit of work: one managed cluster, its
//! provisioning state, the in-flight install workflow and the lease held by
//! whichever worker is currently driving it.

use std::fmt;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Top-level lifecycle state of a managed cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ProvisioningState {
    /// Initial provisioning requested
    #[default]
    Creating,
    /// Customer-requested update in progress
    Updating,
    /// Operator-requested maintenance in progress
    AdminUpdating,
    /// Teardown requested
    Deleting,
    /// Last cycle completed
    Succeeded,
    /// Last cycle failed; terminal until retried
    Failed,
}

impl ProvisioningState {
    /// True while a worker still has something to do
    pub fn is_pending(&self) -> bool {
        !matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "Creating",
            Self::Updating => "Updating",
            Self::AdminUpdating => "AdminUpdating",
            Self::Deleting => "Deleting",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Step of the install workflow, in execution order
///
/// Values written by a newer build deserialize as `Unrecognized`, which the
/// installer refuses to act on.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum InstallPhase {
    /// Create the storage the cluster bootstraps from
    DeployStorage,
    /// Create networks, load balancers and machines
    DeployResources,
    /// Tear down the bootstrap node and its resources
    RemoveBootstrap,
    /// A phase this build does not know about
    #[serde(other)]
    Unrecognized,
}

impl InstallPhase {
    /// First phase of a fresh install
    pub const FIRST: InstallPhase = InstallPhase::DeployStorage;

    /// The phase that follows this one, or `None` after the terminal phase
    pub fn next(self) -> Option<InstallPhase> {
        match self {
            Self::DeployStorage => Some(Self::DeployResources),
            Self::DeployResources => Some(Self::RemoveBootstrap),
            Self::RemoveBootstrap | Self::Unrecognized => None,
        }
    }

    /// True for the phase whose completion ends the workflow
    pub fn is_terminal(self) -> bool {
        self == Self::RemoveBootstrap
    }
}

impl fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// In-flight install workflow
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Install {
    /// Next phase to execute
    pub phase: InstallPhase,
}

impl Default for Install {
    fn default() -> Self {
        Self {
            phase: InstallPhase::FIRST,
        }
    }
}

/// Exclusive, time-bounded right to drive a document
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Identity of the holding dispatcher
    pub owner: String,
    /// Instant after which the lease may be taken over
    pub expires: DateTime<Utc>,
}

impl Lease {
    /// True once the lease can no longer be relied on
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires <= now
    }
}

/// Provisioning properties of a managed cluster
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterProperties {
    /// Current lifecycle state
    pub provisioning_state: ProvisioningState,

    /// State to return to once an admin update finishes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_provisioning_state: Option<ProvisioningState>,

    /// State that was running when the document entered `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_provisioning_state: Option<ProvisioningState>,

    /// Error from the most recent admin update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_admin_update_error: Option<String>,

    /// Install workflow, present only while it is running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<Install>,

    /// Suffix used to derive storage account names
    #[serde(default)]
    pub storage_suffix: String,

    /// Resource group holding the cluster's infrastructure
    #[serde(default)]
    pub cluster_resource_group: String,
}

/// Persisted record of one managed cluster
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDocument {
    /// Lowercased resource ID; unique and immutable
    pub key: String,

    /// Resource ID as supplied by the caller
    pub id: String,

    /// Provisioning properties
    #[serde(default)]
    pub properties: ClusterProperties,

    /// Number of times a worker has leased this document
    #[serde(default)]
    pub dequeues: u32,

    /// Lease held by the worker driving this document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,

    /// Earliest instant the document may be leased again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    /// Optimistic concurrency token, owned by the store
    #[serde(skip)]
    pub etag: Option<String>,
}

impl ClusterDocument {
    /// New document in `Creating` for the given resource ID
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            key: normalize_key(&id),
            id,
            ..Default::default()
        }
    }

    /// Builder-style override of the provisioning state
    pub fn with_state(mut self, state: ProvisioningState) -> Self {
        self.properties.provisioning_state = state;
        self
    }

    /// True when a worker may take this document now
    pub fn is_leaseable(&self, now: DateTime<Utc>) -> bool {
        self.properties.provisioning_state.is_pending()
            && self.lease.as_ref().map_or(true, |l| l.is_expired(now))
            && self.not_before.map_or(true, |t| t <= now)
    }

    /// True when `owner` holds an unexpired lease
    pub fn is_leased_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|l| l.owner == owner && !l.is_expired(now))
    }
}

/// Normalize a resource ID into a document key
pub fn normalize_key(id: &str) -> String {
    id.to_lowercase()
}

/// Kubernetes representation of a `ClusterDocument`
///
/// The object name is a hash of the document key; `resourceVersion` is the
/// document's concurrency token.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "ClusterRecord",
    namespaced,
    printcolumn = r#"{"name":"Key","type":"string","jsonPath":".spec.document.key"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".spec.document.properties.provisioningState"}"#,
    printcolumn = r#"{"name":"Dequeues","type":"integer","jsonPath":".spec.document.dequeues"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRecordSpec {
    /// The stored document
    pub document: ClusterDocument,
}
