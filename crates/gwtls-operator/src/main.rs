//! gwtls operator - TLS policy attachment for Gateway API listeners

use clap::Parser;
use kube::{Client, CustomResourceExt};

use gwtls_common::crd::TLSPolicy;
use gwtls_common::telemetry::init_telemetry;
use gwtls_operator::config::Cli;
use gwtls_operator::controller_runner::build_policy_controller;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&TLSPolicy::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(&cli.telemetry())?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let settings = cli.controller_settings();
    tracing::info!(
        max_retries = settings.max_retries,
        backoff_base_secs = settings.backoff_base.as_secs(),
        backoff_max_secs = settings.backoff_max.as_secs(),
        "Starting gwtls controller"
    );

    build_policy_controller(client, cli.namespace(), settings).await;

    tracing::info!("gwtls controller shut down");
    Ok(())
}
