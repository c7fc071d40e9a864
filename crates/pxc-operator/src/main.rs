//! PXC operator: backup and restore controllers for Percona XtraDB Cluster

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pxc_backup::finalizer::DEFAULT_WORKERS_LIMIT;
use pxc_backup::Context;
use pxc_common::crd::{
    PerconaXtraDBCluster, PerconaXtraDBClusterBackup, PerconaXtraDBClusterRestore,
};
use pxc_common::kube_utils::create_client;
use pxc_common::telemetry::{init_telemetry, TelemetryConfig};

mod runner;

/// Backup and restore operator for Percona XtraDB Cluster
#[derive(Parser, Debug)]
#[command(name = "pxc-operator", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Namespace to watch; every namespace when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Maximum number of backups removed from storage at the same time
    #[arg(
        long,
        env = "S3_WORKERS_LIMIT",
        default_value_t = DEFAULT_WORKERS_LIMIT,
        value_parser = parse_workers_limit,
    )]
    workers_limit: usize,
}

fn parse_workers_limit(value: &str) -> Result<usize, String> {
    match value.trim().parse::<usize>() {
        Ok(limit) if limit > 0 => Ok(limit),
        _ => Err(format!(
            "invalid S3_WORKERS_LIMIT value ({value}), should be positive int"
        )),
    }
}

/// Every CRD the operator works with, as one multi-document YAML stream
fn crd_manifests() -> anyhow::Result<String> {
    let docs = [
        serde_yaml::to_string(&PerconaXtraDBClusterBackup::crd()),
        serde_yaml::to_string(&PerconaXtraDBClusterRestore::crd()),
        serde_yaml::to_string(&PerconaXtraDBCluster::crd()),
    ]
    .into_iter()
    .collect::<Result<Vec<_>, _>>()
    .context("failed to serialize CRD")?;
    Ok(docs.join("---\n"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    let _telemetry = init_telemetry(TelemetryConfig::for_service("pxc-operator"))?;

    let client = create_client()
        .await
        .context("failed to create kubernetes client")?;

    let shutdown = CancellationToken::new();
    let ctx = Arc::new(
        Context::builder(client.clone())
            .workers_limit(cli.workers_limit)
            .cancel(shutdown.clone())
            .build(),
    );

    info!(
        namespace = cli.namespace.as_deref().unwrap_or("<all>"),
        workers_limit = cli.workers_limit,
        "starting controllers"
    );
    let controllers = runner::build_controllers(client, cli.namespace.as_deref(), ctx);
    futures::future::join_all(controllers).await;

    // Controllers are down; stop in-flight storage cleanups too
    shutdown.cancel();
    info!("controllers stopped");
    Ok(())
}
