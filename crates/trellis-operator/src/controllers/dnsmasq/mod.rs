//! Node-local DNS for cluster endpoints
//!
//! Every machine config pool gets a `99-<pool>-aro-dns` MachineConfig that
//! runs dnsmasq on the node, answering for `api`, `api-int` and `*.apps` of
//! the cluster domain. Three controllers keep these in place: one per pool
//! (with a finalizer for cleanup), one per MachineConfig (to undo edits), and
//! one on the cluster singleton (to re-render after domain or address
//! changes).

mod cluster;
mod machine_config;
mod machine_config_pool;

pub use cluster::DnsmasqClusterReconciler;
pub use machine_config::DnsmasqMachineConfigReconciler;
pub use machine_config_pool::{DnsmasqPoolReconciler, POOL_FINALIZER};

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kube::api::{DynamicObject, ObjectMeta};
use serde_json::json;

use trellis_common::crd::{Cluster, MachineConfig, MachineConfigSpec, MACHINE_CONFIG_ROLE_LABEL};
use trellis_common::{Error, Result};

use crate::dynamic::DynamicHelper;

/// Ignition spec version of the rendered config
pub const IGNITION_VERSION: &str = "3.2.0";

const DNSMASQ_CONF_PATH: &str = "/etc/dnsmasq.conf";

/// MachineConfig name for `pool`
pub fn machine_config_name(pool: &str) -> String {
    format!("99-{pool}-aro-dns")
}

/// Pool a dnsmasq MachineConfig belongs to, if `name` is one
pub fn pool_for_machine_config(name: &str) -> Option<&str> {
    name.strip_prefix("99-")?
        .strip_suffix("-aro-dns")
        .filter(|pool| !pool.is_empty())
}

/// Inputs to the rendered MachineConfigs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsmasqParams {
    /// Cluster base domain
    pub domain: String,
    /// Address `api` and `api-int` resolve to
    pub api_int_ip: String,
    /// Address `*.apps` resolves to
    pub ingress_ip: String,
    /// Pools to render for, sorted
    pub pools: Vec<String>,
}

impl DnsmasqParams {
    /// Parameters for `pools` from the cluster singleton
    pub fn new(cluster: &Cluster, pools: impl IntoIterator<Item = String>) -> Self {
        let mut pools: Vec<String> = pools.into_iter().collect();
        pools.sort();
        Self {
            domain: cluster.spec.domain.clone(),
            api_int_ip: cluster.spec.api_int_ip.clone(),
            ingress_ip: cluster.spec.ingress_ip.clone(),
            pools,
        }
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("spec.domain", &self.domain),
            ("spec.apiIntIp", &self.api_int_ip),
            ("spec.ingressIp", &self.ingress_ip),
        ] {
            if value.trim().is_empty() {
                return Err(Error::validation_for_field(field, "required for dnsmasq"));
            }
        }
        Ok(())
    }
}

/// dnsmasq configuration file contents
pub fn dnsmasq_conf(params: &DnsmasqParams) -> String {
    let DnsmasqParams {
        domain,
        api_int_ip,
        ingress_ip,
        ..
    } = params;
    format!(
        "resolv-file=/etc/resolv.conf.dnsmasq
strict-order
address=/api.{domain}/{api_int_ip}
address=/api-int.{domain}/{api_int_ip}
address=/.apps.{domain}/{ingress_ip}
user=dnsmasq
group=dnsmasq
no-hosts
cache-size=0
"
    )
}

const DNSMASQ_UNIT: &str = r#"[Unit]
Description=DNS caching server.
After=network-online.target
Before=bootkube.service

[Service]
ExecStartPre=/bin/cp /etc/resolv.conf /etc/resolv.conf.dnsmasq
ExecStartPre=/bin/bash -c '/bin/sed -ni -e "/^nameserver /!p; \$a nameserver $$(hostname -I | cut -d \" \" -f1)" /etc/resolv.conf'
ExecStart=/usr/sbin/dnsmasq -k
ExecStopPost=/bin/bash -c '/bin/mv /etc/resolv.conf.dnsmasq /etc/resolv.conf'
Restart=always

[Install]
WantedBy=multi-user.target
"#;

/// Ignition config installing and enabling dnsmasq
pub fn ignition_config(params: &DnsmasqParams) -> serde_json::Value {
    let source = format!(
        "data:text/plain;charset=utf-8;base64,{}",
        BASE64.encode(dnsmasq_conf(params))
    );
    json!({
        "ignition": { "version": IGNITION_VERSION },
        "storage": {
            "files": [{
                "path": DNSMASQ_CONF_PATH,
                "overwrite": true,
                "mode": 0o644,
                "user": { "name": "root" },
                "contents": { "source": source }
            }]
        },
        "systemd": {
            "units": [{
                "name": "dnsmasq.service",
                "enabled": true,
                "contents": DNSMASQ_UNIT
            }]
        }
    })
}

/// The dnsmasq MachineConfig for one pool
pub fn machine_config(params: &DnsmasqParams, pool: &str) -> Result<DynamicObject> {
    let config = MachineConfig {
        metadata: ObjectMeta {
            name: Some(machine_config_name(pool)),
            labels: Some(BTreeMap::from([(
                MACHINE_CONFIG_ROLE_LABEL.to_string(),
                pool.to_string(),
            )])),
            ..Default::default()
        },
        spec: MachineConfigSpec {
            config: ignition_config(params),
        },
    };
    Ok(serde_json::from_value(serde_json::to_value(&config)?)?)
}

/// Render and ensure the MachineConfigs for every pool in `params`
pub(crate) async fn ensure_machine_configs(
    dynamic: &dyn DynamicHelper,
    params: &DnsmasqParams,
) -> Result<()> {
    params.validate()?;
    let objects = params
        .pools
        .iter()
        .map(|pool| machine_config(params, pool))
        .collect::<Result<Vec<_>>>()?;
    dynamic.ensure(&objects).await
}
