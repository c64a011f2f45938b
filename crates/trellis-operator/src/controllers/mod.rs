//! In-cluster controllers built on the reconciler driver

pub mod dnsmasq;
pub mod storage_accounts;
