//! Controller futures for the backup and restore resources

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};

use pxc_backup::{backup_controller, restore_controller, Context};
use pxc_common::crd::{PerconaXtraDBClusterBackup, PerconaXtraDBClusterRestore};

/// Watcher timeout (seconds), kept below the client read timeout (30s) so
/// idle watches are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller ready to be awaited
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Api over one namespace, or every namespace when `namespace` is `None`
fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Build the backup and restore controllers.
///
/// Both also watch the jobs they own, so job progress triggers a reconcile
/// without waiting for a requeue.
pub fn build_controllers(
    client: Client,
    namespace: Option<&str>,
    ctx: Arc<Context>,
) -> Vec<ControllerFuture> {
    let backups: Api<PerconaXtraDBClusterBackup> = scoped(&client, namespace);
    let restores: Api<PerconaXtraDBClusterRestore> = scoped(&client, namespace);
    let jobs: Api<Job> = scoped(&client, namespace);

    let backup_ctrl = Controller::new(backups, watcher())
        .owns(jobs.clone(), watcher())
        .shutdown_on_signal()
        .run(
            backup_controller::reconcile,
            backup_controller::error_policy,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("Backup"));

    let restore_ctrl = Controller::new(restores, watcher())
        .owns(jobs, watcher())
        .shutdown_on_signal()
        .run(
            restore_controller::reconcile,
            restore_controller::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result("Restore"));

    tracing::info!("- PerconaXtraDBClusterBackup controller");
    tracing::info!("- PerconaXtraDBClusterRestore controller");

    vec![Box::pin(backup_ctrl), Box::pin(restore_ctrl)]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
