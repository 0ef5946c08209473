//! Accelerator operator - node labeling and operand deployment for accelerator clusters

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::future::select_all;
use kube::{Client, CustomResourceExt};

use accel_common::crd::ClusterPolicy;
use accel_common::telemetry::{init_telemetry, TelemetryConfig};
use accel_common::OPERATOR_NAMESPACE_ENV;
use accel_operator::controller_runner;
use accel_policy::{load_stages, Context, OperatorConfig};

/// Accelerator operator - reconciles the ClusterPolicy onto accelerator nodes
#[derive(Parser, Debug)]
#[command(name = "accel-operator", version, about, long_about = None)]
struct Cli {
    /// Namespace the operands are deployed into
    #[arg(long, global = true, env = OPERATOR_NAMESPACE_ENV)]
    operator_namespace: Option<String>,

    /// Directory with one manifest directory per deployment stage
    #[arg(long, global = true, env = "ASSETS_DIR", default_value = "/opt/gpu-operator")]
    assets_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the ClusterPolicy and driver upgrade controllers (default mode)
    Controller,
    /// Print the ClusterPolicy CRD and exit
    Crd,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube's rustls client needs a process-wide crypto provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The operator cannot reach the API server without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Crd) => {
            let crd = serde_yaml::to_string(&ClusterPolicy::crd())
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("{crd}");
            Ok(())
        }
        Some(Commands::Controller) | None => {
            init_telemetry(&TelemetryConfig::from_env(cli.operator_namespace.clone()))
                .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;
            run_controller(OperatorConfig {
                namespace: cli.operator_namespace,
                assets_dir: cli.assets_dir,
            })
            .await
        }
    }
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let stages = load_stages(&config.assets_dir)
        .map_err(|e| anyhow::anyhow!("Failed to load stage manifests: {}", e))?;
    tracing::info!(
        assets_dir = %config.assets_dir.display(),
        stages = stages.len(),
        "loaded deployment stages"
    );

    let (fatal_tx, mut fatal_rx) = tokio::sync::mpsc::channel(1);
    let ctx = Arc::new(
        Context::builder(client.clone())
            .config(config)
            .stages(stages)
            .fatal_channel(fatal_tx)
            .build(),
    );

    tracing::info!("Starting accelerator operator controllers...");
    let mut controllers = controller_runner::build_policy_controllers(client.clone(), ctx.clone());
    controllers.extend(controller_runner::build_upgrade_controllers(client, ctx));

    tokio::select! {
        _ = select_all(controllers) => {
            tracing::info!("controller completed");
        }
        Some(reason) = fatal_rx.recv() => {
            tracing::error!(%reason, "unrecoverable configuration error, exiting");
            anyhow::bail!("fatal configuration error: {reason}");
        }
    }

    tracing::info!("Accelerator operator shutting down");
    Ok(())
}
