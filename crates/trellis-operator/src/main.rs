//! Trellis operator - in-cluster controllers for managed clusters

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};

use trellis_common::kube_utils::{owned_crds, FIELD_MANAGER};
use trellis_common::telemetry::{init_telemetry, TelemetryConfig};
use trellis_operator::config::WATCH_TIMEOUT_SECS;
use trellis_operator::{build_dnsmasq_controllers, OperatorConfig};

/// Trellis - controllers keeping a managed cluster's node DNS and storage in shape
#[derive(Parser, Debug)]
#[command(name = "trellis", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the in-cluster controllers (default mode)
    Controller(ControllerArgs),
}

#[derive(Args, Debug, Clone)]
struct ControllerArgs {
    /// Server-side timeout of each watch request, in seconds
    #[arg(long, env = "TRELLIS_WATCH_TIMEOUT_SECS", default_value_t = WATCH_TIMEOUT_SECS)]
    watch_timeout_secs: u32,

    /// Delay before retrying a failed reconcile, in seconds
    #[arg(long, env = "TRELLIS_ERROR_REQUEUE_SECS", default_value_t = 5)]
    error_requeue_secs: u64,

    /// OTLP collector endpoint; unset keeps telemetry local
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    /// Log JSON lines instead of human-readable output
    #[arg(long, env = "TRELLIS_LOG_JSON", default_value_t = true, action = clap::ArgAction::Set)]
    log_json: bool,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        Self {
            watch_timeout_secs: WATCH_TIMEOUT_SECS,
            error_requeue_secs: 5,
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            log_json: true,
        }
    }
}

impl ControllerArgs {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            watch_timeout_secs: self.watch_timeout_secs,
            error_requeue: Duration::from_secs(self.error_requeue_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        for crd in owned_crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        None => ControllerArgs::default(),
    };

    let _telemetry = init_telemetry(TelemetryConfig {
        service_name: "trellis-operator".to_string(),
        otlp_endpoint: args.otlp_endpoint.clone(),
        json: args.log_json,
        ..Default::default()
    })?;

    run_controller(args.operator_config()).await
}

/// Install the Trellis CRDs with server-side apply so their versions track
/// the running operator
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in owned_crds() {
        let name = crd
            .metadata
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("CRD without a name"))?;
        tracing::info!(crd = %name, "Installing CRD...");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("All Trellis CRDs installed/updated");
    Ok(())
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    tracing::info!("Trellis controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    tracing::info!("Starting controllers:");
    let controllers = build_dnsmasq_controllers(client, config);
    futures::future::join_all(controllers).await;

    tracing::info!("Trellis controller shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_runs_the_controller() {
        let cli = Cli::try_parse_from(["trellis"]).unwrap();
        assert!(!cli.crd);
        assert!(cli.command.is_none());
    }

    #[test]
    fn controller_flags_reach_operator_config() {
        let cli = Cli::try_parse_from([
            "trellis",
            "controller",
            "--watch-timeout-secs",
            "10",
            "--error-requeue-secs",
            "30",
            "--log-json",
            "false",
        ])
        .unwrap();
        let Some(Commands::Controller(args)) = cli.command else {
            panic!("expected controller subcommand");
        };
        assert!(!args.log_json);
        let config = args.operator_config();
        assert_eq!(config.watch_timeout_secs, 10);
        assert_eq!(config.error_requeue, Duration::from_secs(30));
    }
}
