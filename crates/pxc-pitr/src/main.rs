//! `pitr` binary: binlog collector and point-in-time recoverer

use std::ffi::OsString;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use prometheus::Registry;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pxc_common::telemetry::{init_telemetry, TelemetryConfig};
use pxc_pitr::cache::CACHE_KEY;
use pxc_pitr::collector::{Collector, CollectorOptions, MysqlBinlogFetcher};
use pxc_pitr::config::{default_ca_path, read_ca_bundle, Cli, CollectArgs, PitrCommand, RecoverArgs};
use pxc_pitr::database::{
    discover_nodes, first_primary_host, oldest_binlog_host, DatabaseConnector, MySqlConnector,
    MySqlDatabase,
};
use pxc_pitr::recoverer::{MysqlApplier, Recoverer, RecoveryMode, XbstreamDecoder};
use pxc_pitr::server::{self, ServerState};
use pxc_storage::StorageClient;

/// Where and what the HTTP endpoints serve
struct Http {
    addr: SocketAddr,
    registry: Registry,
}

impl Http {
    fn spawn(
        self,
        storage: Arc<dyn StorageClient>,
        cache_key: &str,
        cache_lock: Arc<Mutex<()>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let state = Arc::new(ServerState {
            storage,
            cache_key: cache_key.to_string(),
            cache_lock,
            registry: self.registry,
        });
        let addr = self.addr;
        tokio::spawn(async move {
            if let Err(e) = server::serve(addr, state, shutdown).await {
                error!(%addr, error = %e, "http server failed");
            }
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `pitr` alone means `pitr collect`
    let mut args: Vec<OsString> = std::env::args_os().collect();
    if args.len() == 1 {
        args.push("collect".into());
    }
    let cli = Cli::parse_from(args);

    let registry = Registry::new();
    let _telemetry = init_telemetry(
        TelemetryConfig::for_service("pxc-pitr").with_prometheus(registry.clone()),
    )?;

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let http = Http {
        addr: cli.http_addr,
        registry,
    };
    match cli.command {
        PitrCommand::Collect(args) => run_collector(args, http, shutdown).await,
        PitrCommand::Recover(args) => run_recoverer(args, http, shutdown).await,
    }
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
    shutdown.cancel();
}

async fn run_collector(
    args: CollectArgs,
    http: Http,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let password = args.pxc.password()?;
    let ca_bundle = read_ca_bundle(&default_ca_path())?;
    let storage: Arc<dyn StorageClient> =
        Arc::from(pxc_storage::new_client(&args.storage_options(ca_bundle)?)?);
    let fetcher = Arc::new(MysqlBinlogFetcher::new(&args.pxc.pxc_user, &password));
    let connector = MySqlConnector::new(&args.pxc.pxc_user, &password);
    let span = args.collect_span()?;
    let cache_lock = Arc::new(Mutex::new(()));
    let http_task = http.spawn(
        storage.clone(),
        &args.gtid_cache_key,
        cache_lock.clone(),
        shutdown.clone(),
    );

    let mut collector = Collector::new(
        storage,
        fetcher,
        CollectorOptions {
            cache_key: args.gtid_cache_key.clone(),
            timeout: args.timeout()?,
            ..CollectorOptions::default()
        },
    );

    info!(service = %args.pxc.pxc_service, ?span, "running binlog collector");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = collect_once(&mut collector, &connector, &args.pxc.pxc_service, &cache_lock) => {
                result?;
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(span) => {}
        }
    }

    let _ = http_task.await;
    info!("binlog collector stopped");
    Ok(())
}

async fn collect_once(
    collector: &mut Collector,
    connector: &dyn DatabaseConnector,
    service: &str,
    cache_lock: &Mutex<()>,
) -> anyhow::Result<()> {
    let nodes = discover_nodes(service).await.context("get nodes")?;
    let host = oldest_binlog_host(connector, &nodes)
        .await
        .context("get host")?;
    info!(host = %host, "reading binlogs");
    let db = connector.connect(&host).await?;
    let _cache = cache_lock.lock().await;
    collector.run(db.as_ref()).await.context("collect binlogs")?;
    Ok(())
}

async fn run_recoverer(
    args: RecoverArgs,
    http: Http,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let password = args.pxc.password()?;
    let mode = RecoveryMode::parse(
        &args.pitr_recovery_type,
        args.pitr_date.as_deref(),
        args.pitr_gtid.as_deref(),
    )?;
    let ca_bundle = read_ca_bundle(&default_ca_path())?;
    let backup_storage = pxc_storage::new_client(&args.backup_storage(ca_bundle.clone())?)?;
    let binlog_storage: Arc<dyn StorageClient> =
        Arc::from(pxc_storage::new_client(&args.binlog_storage(ca_bundle)?)?);
    let http_task = http.spawn(
        binlog_storage.clone(),
        CACHE_KEY,
        Arc::new(Mutex::new(())),
        shutdown.clone(),
    );

    let nodes = discover_nodes(&args.pxc.pxc_service).await.context("get nodes")?;
    let host = first_primary_host(&nodes)?;
    info!(host = %host, "recovering on primary");
    let db = MySqlDatabase::connect(&host, &args.pxc.pxc_user, &password)?;

    let applier = Arc::new(MysqlApplier::new(
        binlog_storage.clone(),
        &args.pxc.pxc_user,
        &password,
    ));
    let recoverer = Recoverer::new(
        binlog_storage,
        backup_storage.as_ref(),
        &XbstreamDecoder,
        applier,
        mode,
    )
    .await?;

    let result = tokio::select! {
        _ = shutdown.cancelled() => Err(anyhow::anyhow!("recovery interrupted")),
        result = recoverer.run(&db) => result.context("recover"),
    };
    db.close().await;
    shutdown.cancel();
    let _ = http_task.await;
    result?;

    info!("point-in-time recovery finished");
    Ok(())
}
