//! Custom resource and document types

mod cluster;
mod document;
mod machine_config;

pub use cluster::{
    Cluster, ClusterSpec, ClusterStatus, StorageAccountsStatus, CLUSTER_SINGLETON,
    DNSMASQ_ENABLED, STORAGE_ACCOUNTS_ENABLED,
};
pub use document::{
    normalize_key, ClusterDocument, ClusterProperties, ClusterRecord, ClusterRecordSpec,
    Install, InstallPhase, Lease, ProvisioningState,
};
pub use machine_config::{
    MachineConfig, MachineConfigPool, MachineConfigPoolSpec, MachineConfigSpec,
    MACHINE_CONFIG_ROLE_LABEL,
};
