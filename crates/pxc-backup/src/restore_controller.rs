//! PerconaXtraDBClusterRestore controller
//!
//! Drives a restore through its stages:
//!
//! ```text
//! New -> Starting -> StopCluster -> Restore -> [Pitr] -> [PrepareCluster] -> StartCluster -> Succeeded
//! ```
//!
//! Each reconcile handles the current stage only. A stage that has to wait
//! for pods, jobs or the cluster requeues without touching the status, so a
//! restarted operator picks up where the last one stopped. Any error that
//! won't go away on retry ends the restore as Failed with the error as its
//! comment.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument, warn};

use pxc_common::crd::{
    BackupState, ConditionStatus, PerconaXtraDBCluster, PerconaXtraDBClusterBackupStatus,
    PerconaXtraDBClusterRestore, PerconaXtraDBClusterRestoreStatus, RestoreState,
    CONDITION_PITR_READY, VERSION_KEEP_VOLUMES, VERSION_PREPARE_JOB,
};
use pxc_common::events::{actions, reasons};
use pxc_common::kube_utils::{job_outcome, poll_until, JobOutcome};
use pxc_common::metrics::{self, ControllerKind, ReconcileTimer};
use pxc_common::naming::{
    haproxy_labels, pitr_job_name, prepare_job_name, proxysql_labels, pxc_data_volume_prefix,
    pxc_labels, restore_job_name, selector_string, FINALIZER_KEEP_JOB,
};
use pxc_common::{Error, REQUEUE_ERROR_SECS};

use crate::client::KubeClient;
use crate::context::Context;
use crate::jobs::{binlog_storage, prepare_job};
use crate::restorer::Restorer;
use crate::storage::{backup_storage, resolve_options};
use crate::wait::WaitReason;

/// Requeue after a stage change, in case the status watch event is missed
const REQUEUE_PROGRESS: Duration = Duration::from_secs(1);

/// Object name prefix every binlog in the archive starts with
const BINLOG_PREFIX: &str = "binlog_";

/// Outcome of handling one stage
#[derive(Debug)]
enum Step {
    /// Write this status and continue from the new stage
    Advance(PerconaXtraDBClusterRestoreStatus),
    /// Stay in the current stage for now
    Wait(WaitReason),
}

/// Reconcile a PerconaXtraDBClusterRestore
#[instrument(
    skip(restore, ctx),
    fields(
        restore = %restore.name_any(),
        namespace = %restore.namespace().unwrap_or_default(),
        state = %restore.state(),
    )
)]
pub async fn reconcile(
    restore: Arc<PerconaXtraDBClusterRestore>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let timer = ReconcileTimer::start(ControllerKind::Restore);
    let result = reconcile_restore(&restore, &ctx).await;
    match &result {
        Ok(_) => timer.success(),
        Err(e) => timer.error(e.is_retryable()),
    }
    result
}

/// Log the failure and retry shortly
pub fn error_policy(
    restore: Arc<PerconaXtraDBClusterRestore>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    error!(
        ?error,
        restore = %restore.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
}

async fn reconcile_restore(
    restore: &PerconaXtraDBClusterRestore,
    ctx: &Context,
) -> Result<Action, Error> {
    let state = restore.state();
    let step = match state {
        RestoreState::Succeeded | RestoreState::Failed => return Ok(Action::await_change()),
        RestoreState::New => handle_new(restore, ctx).await,
        RestoreState::Starting => handle_starting(restore, ctx).await,
        RestoreState::StopCluster => handle_stop_cluster(restore, ctx).await,
        RestoreState::Restore => handle_restore(restore, ctx).await,
        RestoreState::Pitr => handle_pitr(restore, ctx).await,
        RestoreState::PrepareCluster => handle_prepare_cluster(restore, ctx).await,
        RestoreState::StartCluster => handle_start_cluster(restore, ctx).await,
    };

    match step {
        Ok(Step::Advance(status)) => {
            let next = status.state;
            advance(restore, ctx, status).await?;
            if next.is_terminal() {
                Ok(Action::await_change())
            } else {
                Ok(Action::requeue(REQUEUE_PROGRESS))
            }
        }
        Ok(Step::Wait(reason)) => {
            debug!(%reason, "restore waiting");
            Ok(reason.action())
        }
        Err(e) if e.is_retryable() => Err(e),
        Err(e) => {
            warn!(error = %e, "restore failed");
            let status = PerconaXtraDBClusterRestoreStatus {
                state: RestoreState::Failed,
                comments: e.to_string(),
                completed: Some(Utc::now()),
                ..current_status(restore)
            };
            advance(restore, ctx, status).await?;
            Ok(Action::await_change())
        }
    }
}

fn current_status(restore: &PerconaXtraDBClusterRestore) -> PerconaXtraDBClusterRestoreStatus {
    restore.status.clone().unwrap_or_default()
}

fn with_state(
    restore: &PerconaXtraDBClusterRestore,
    state: RestoreState,
) -> PerconaXtraDBClusterRestoreStatus {
    PerconaXtraDBClusterRestoreStatus {
        state,
        comments: String::new(),
        ..current_status(restore)
    }
}

/// Persist a stage change. Stages never move backwards.
async fn advance(
    restore: &PerconaXtraDBClusterRestore,
    ctx: &Context,
    status: PerconaXtraDBClusterRestoreStatus,
) -> Result<(), Error> {
    let current = restore.state();
    if restore.status.as_ref() == Some(&status) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    if status.state.ordinal() < current.ordinal() {
        return Err(Error::internal_with_context(
            "restore",
            format!("refusing to move from {current:?} back to {:?}", status.state),
        ));
    }

    let name = restore.name_any();
    let namespace = restore.namespace().unwrap_or_default();

    if status.state.is_terminal() {
        release_jobs(ctx.kube.as_ref(), restore).await;
    }

    ctx.kube
        .patch_restore_status(&name, &namespace, &status)
        .await?;
    info!(from = ?current, to = ?status.state, "restore stage changed");

    let (type_, reason) = match status.state {
        RestoreState::Starting => (EventType::Normal, reasons::RESTORE_STARTED),
        RestoreState::Succeeded => (EventType::Normal, reasons::RESTORE_SUCCEEDED),
        RestoreState::Failed => (EventType::Warning, reasons::RESTORE_FAILED),
        _ => (EventType::Normal, reasons::RESTORE_PROGRESSING),
    };
    let note = match status.state {
        RestoreState::Failed => status.comments.clone(),
        state => format!("restore is now {state:?}"),
    };
    ctx.events
        .publish(
            &restore.object_ref(&()),
            type_,
            reason,
            actions::TRANSITION,
            Some(note),
        )
        .await;

    if status.state.is_terminal() {
        metrics::record_restore_finished(status.state == RestoreState::Succeeded);
    }
    Ok(())
}

/// Let the restore's jobs be garbage collected with the restore
async fn release_jobs(kube: &dyn KubeClient, restore: &PerconaXtraDBClusterRestore) {
    let namespace = restore.namespace().unwrap_or_default();
    let name = restore.name_any();
    let cluster = &restore.spec.pxc_cluster;

    for job in [
        restore_job_name(&name, cluster),
        pitr_job_name(&name, cluster),
        prepare_job_name(&name, cluster),
    ] {
        if let Err(e) = release_job(kube, &job, &namespace).await {
            warn!(job = %job, error = %e, "failed to remove keep-job finalizer");
        }
    }
}

async fn release_job(kube: &dyn KubeClient, name: &str, namespace: &str) -> Result<(), Error> {
    let Some(job) = kube.get_job(name, namespace).await? else {
        return Ok(());
    };
    let finalizers = job.finalizers();
    if !finalizers.iter().any(|f| f == FINALIZER_KEEP_JOB) {
        return Ok(());
    }
    let remaining: Vec<&String> = finalizers
        .iter()
        .filter(|f| *f != FINALIZER_KEEP_JOB)
        .collect();
    kube.patch_job(
        name,
        namespace,
        json!({ "metadata": { "finalizers": remaining } }),
    )
    .await
}

async fn get_cluster(
    kube: &dyn KubeClient,
    restore: &PerconaXtraDBClusterRestore,
) -> Result<PerconaXtraDBCluster, Error> {
    let name = &restore.spec.pxc_cluster;
    kube.get_cluster(name, &restore.namespace().unwrap_or_default())
        .await?
        .ok_or_else(|| Error::validation_for(restore.name_any(), format!("cluster {name} not found")))
}

/// The backup to restore from.
///
/// An inline `backupSource` stands for a backup that already succeeded.
async fn resolve_backup(
    kube: &dyn KubeClient,
    restore: &PerconaXtraDBClusterRestore,
) -> Result<PerconaXtraDBClusterBackupStatus, Error> {
    if let Some(source) = &restore.spec.backup_source {
        return Ok(PerconaXtraDBClusterBackupStatus {
            state: BackupState::Succeeded,
            ..source.clone()
        });
    }

    let name = &restore.spec.backup_name;
    let backup = kube
        .get_backup(name, &restore.namespace().unwrap_or_default())
        .await?
        .ok_or_else(|| Error::validation_for(restore.name_any(), format!("backup {name} not found")))?;
    let status = backup.status.unwrap_or_default();
    if status.state != BackupState::Succeeded {
        return Err(Error::validation_for(
            restore.name_any(),
            format!(
                "backup {name} didn't finished yet, current state: {}",
                status.state
            ),
        ));
    }
    Ok(status)
}

async fn restorer_for(
    kube: &dyn KubeClient,
    restore: &PerconaXtraDBClusterRestore,
    cluster: &PerconaXtraDBCluster,
) -> Result<Restorer, Error> {
    let backup = resolve_backup(kube, restore).await?;
    Restorer::new(restore, cluster, &backup)
}

async fn handle_new(
    restore: &PerconaXtraDBClusterRestore,
    ctx: &Context,
) -> Result<Step, Error> {
    restore.spec.validate()?;
    let cluster = get_cluster(ctx.kube.as_ref(), restore).await?;

    let status = PerconaXtraDBClusterRestoreStatus {
        pxc_size: Some(cluster.spec.pxc.size),
        haproxy_size: cluster
            .haproxy_enabled()
            .then(|| cluster.spec.haproxy.as_ref().map(|p| p.size))
            .flatten(),
        proxy_size: cluster
            .proxysql_enabled()
            .then(|| cluster.spec.proxysql.as_ref().map(|p| p.size))
            .flatten(),
        ..with_state(restore, RestoreState::Starting)
    };
    Ok(Step::Advance(status))
}

/// Fail when another unfinished restore targets the same cluster.
///
/// Restores that haven't been picked up yet don't count; they check again
/// once they reach this point.
async fn check_concurrent(
    kube: &dyn KubeClient,
    restore: &PerconaXtraDBClusterRestore,
) -> Result<(), Error> {
    let name = restore.name_any();
    let others = kube
        .list_restores(&restore.namespace().unwrap_or_default())
        .await?;
    let running = others.iter().find(|other| {
        other.spec.pxc_cluster == restore.spec.pxc_cluster
            && other.name_any() != name
            && !matches!(
                other.state(),
                RestoreState::New | RestoreState::Succeeded | RestoreState::Failed
            )
    });
    match running {
        Some(other) => Err(Error::validation_for(
            name,
            format!(
                "unable to continue, concurent restore job {} running now.",
                other.name_any()
            ),
        )),
        None => Ok(()),
    }
}

async fn handle_starting(
    restore: &PerconaXtraDBClusterRestore,
    ctx: &Context,
) -> Result<Step, Error> {
    let kube = ctx.kube.as_ref();
    check_concurrent(kube, restore).await?;

    let cluster = get_cluster(kube, restore).await?;
    let backup = resolve_backup(kube, restore).await?;
    let restorer = Restorer::new(restore, &cluster, &backup)?;

    let job = restorer.job()?;
    restorer.validate_job(kube, &job).await?;
    if let Some(wait) = restorer.validate(kube, ctx.storage.as_ref()).await? {
        return Ok(Step::Wait(wait));
    }

    if restore.pitr_requested() {
        let pitr_job = restorer.pitr_job()?;
        restorer.validate_job(kube, &pitr_job).await?;
        validate_binlog_storage(ctx, restore, &cluster).await?;
        if !is_pitr_ready(ctx, restore, &cluster, &backup).await? {
            return Err(Error::validation_for(
                restore.name_any(),
                format!(
                    "backup {} is not ready for point-in-time recovery: binlogs after it have a gap",
                    restorer.destination()
                ),
            ));
        }
    }

    Ok(Step::Advance(with_state(restore, RestoreState::StopCluster)))
}

async fn validate_binlog_storage(
    ctx: &Context,
    restore: &PerconaXtraDBClusterRestore,
    cluster: &PerconaXtraDBCluster,
) -> Result<(), Error> {
    let namespace = restore.namespace().unwrap_or_default();
    let spec = binlog_storage(restore, cluster)?;
    let Some(options) = resolve_options(ctx.kube.as_ref(), &namespace, &spec, None).await? else {
        return Err(Error::validation("binlogs can't be stored on a filesystem storage"));
    };
    let storage = ctx.storage.client(&options)?;
    storage
        .list_objects(BINLOG_PREFIX)
        .await
        .map_err(|e| Error::storage_permanent(format!("failed to validate binlog storage: {e}")))?;
    Ok(())
}

/// Whether binlogs after the backup are continuous.
///
/// A `PITRReady=False` condition on the backup or a marker object next to it
/// means a gap was detected.
async fn is_pitr_ready(
    ctx: &Context,
    restore: &PerconaXtraDBClusterRestore,
    cluster: &PerconaXtraDBCluster,
    backup: &PerconaXtraDBClusterBackupStatus,
) -> Result<bool, Error> {
    if backup
        .conditions
        .iter()
        .any(|c| c.type_ == CONDITION_PITR_READY && c.status == ConditionStatus::False)
    {
        return Ok(false);
    }

    let Some(destination) = backup.destination() else {
        return Ok(true);
    };
    let Some(storage) = backup_storage(
        ctx.kube.as_ref(),
        ctx.storage.as_ref(),
        &restore.namespace().unwrap_or_default(),
        backup,
        Some(cluster),
    )
    .await?
    else {
        return Ok(true);
    };

    match storage.get_object(&destination.pitr_not_ready_key()).await {
        Ok(_) => Ok(false),
        Err(e) if e.is_not_found() => Ok(true),
        Err(e) => Err(Error::storage(format!(
            "get pitr-not-ready file from storage: {e}"
        ))),
    }
}

/// Pause the cluster. Returns a wait reason until every database and proxy
/// pod is gone.
async fn stop_cluster(
    kube: &dyn KubeClient,
    cluster: &PerconaXtraDBCluster,
) -> Result<Option<WaitReason>, Error> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();

    if !cluster.spec.pause {
        kube.patch_cluster(&name, &namespace, json!({ "spec": { "pause": true } }))
            .await?;
        info!(cluster = %name, "pausing cluster");
        return Ok(Some(WaitReason::PodsRunning));
    }

    let mut selectors = vec![pxc_labels(&name)];
    if cluster.haproxy_enabled() {
        selectors.push(haproxy_labels(&name));
    }
    if cluster.proxysql_enabled() {
        selectors.push(proxysql_labels(&name));
    }
    for labels in &selectors {
        if !kube
            .list_pods(&namespace, &selector_string(labels))
            .await?
            .is_empty()
        {
            return Ok(Some(WaitReason::PodsRunning));
        }
    }
    Ok(None)
}

/// Delete every data volume but the first and wait until only it is left
async fn shrink_volumes(ctx: &Context, cluster: &PerconaXtraDBCluster) -> Result<(), Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let prefix = pxc_data_volume_prefix(&cluster.name_any());
    let seed = format!("{prefix}0");

    let data_volumes = |pvcs: Vec<k8s_openapi::api::core::v1::PersistentVolumeClaim>| {
        pvcs.into_iter()
            .map(|p| p.name_any())
            .filter(|n| n.starts_with(&prefix))
            .collect::<Vec<_>>()
    };

    for name in data_volumes(ctx.kube.list_pvcs(&namespace).await?) {
        if name != seed {
            info!(pvc = %name, "deleting data volume");
            ctx.kube.delete_pvc(&name, &namespace).await?;
        }
    }

    let kube = ctx.kube.clone();
    poll_until(
        ctx.timings.volume_shrink_timeout,
        ctx.timings.poll_interval,
        "data volumes were not deleted in time",
        || {
            let kube = kube.clone();
            let namespace = namespace.clone();
            async move { Ok(data_volumes(kube.list_pvcs(&namespace).await?).len() == 1) }
        },
    )
    .await
}

async fn create_job(kube: &dyn KubeClient, namespace: &str, job: &Job) -> Result<(), Error> {
    match kube.create_job(namespace, job).await {
        Err(e) if e.is_conflict() => {
            debug!(job = %job.name_any(), "job already exists");
            Ok(())
        }
        other => other,
    }
}

async fn handle_stop_cluster(
    restore: &PerconaXtraDBClusterRestore,
    ctx: &Context,
) -> Result<Step, Error> {
    let kube = ctx.kube.as_ref();
    let cluster = get_cluster(kube, restore).await?;
    let restorer = restorer_for(kube, restore, &cluster).await?;

    if let Some(wait) = stop_cluster(kube, &cluster).await? {
        return Ok(Step::Wait(wait));
    }
    if !cluster.version_at_least(VERSION_KEEP_VOLUMES) {
        shrink_volumes(ctx, &cluster).await?;
    }
    if let Some(wait) = restorer.init(kube).await? {
        return Ok(Step::Wait(wait));
    }

    let job = restorer.job()?;
    create_job(kube, &restore.namespace().unwrap_or_default(), &job).await?;
    info!(job = %job.name_any(), "restore job created");
    Ok(Step::Advance(with_state(restore, RestoreState::Restore)))
}

/// `None` once the job completed
async fn wait_for_job(
    kube: &dyn KubeClient,
    name: &str,
    namespace: &str,
) -> Result<Option<WaitReason>, Error> {
    let job = kube
        .get_job(name, namespace)
        .await?
        .ok_or_else(|| Error::job(name, "job not found"))?;
    match job_outcome(&job) {
        JobOutcome::Complete { .. } => Ok(None),
        JobOutcome::Failed { message } => Err(Error::job(name, message)),
        JobOutcome::Pending | JobOutcome::Running => {
            Ok(Some(WaitReason::JobRunning(name.to_string())))
        }
    }
}

/// Stage after the data is in place
fn after_restore(cluster: &PerconaXtraDBCluster) -> RestoreState {
    if cluster.version_at_least(VERSION_PREPARE_JOB) {
        RestoreState::PrepareCluster
    } else {
        RestoreState::StartCluster
    }
}

async fn handle_restore(
    restore: &PerconaXtraDBClusterRestore,
    ctx: &Context,
) -> Result<Step, Error> {
    let kube = ctx.kube.as_ref();
    let namespace = restore.namespace().unwrap_or_default();
    let cluster = get_cluster(kube, restore).await?;

    let job = restore_job_name(&restore.name_any(), &cluster.name_any());
    if let Some(wait) = wait_for_job(kube, &job, &namespace).await? {
        return Ok(Step::Wait(wait));
    }

    if !restore.pitr_requested() {
        return Ok(Step::Advance(with_state(restore, after_restore(&cluster))));
    }

    // Binlogs are replayed into a single running node
    let restorer = restorer_for(kube, restore, &cluster).await?;
    let pitr_job = restorer.pitr_job()?;
    kube.patch_cluster(
        &cluster.name_any(),
        &namespace,
        json!({
            "spec": {
                "pause": false,
                "pxc": { "size": 1 },
                "unsafeFlags": { "pxcSize": true },
            }
        }),
    )
    .await?;
    create_job(kube, &namespace, &pitr_job).await?;
    info!(job = %pitr_job.name_any(), "point-in-time recovery started");
    Ok(Step::Advance(with_state(restore, RestoreState::Pitr)))
}

async fn handle_pitr(
    restore: &PerconaXtraDBClusterRestore,
    ctx: &Context,
) -> Result<Step, Error> {
    let kube = ctx.kube.as_ref();
    let cluster = get_cluster(kube, restore).await?;
    let job = pitr_job_name(&restore.name_any(), &cluster.name_any());

    match wait_for_job(kube, &job, &restore.namespace().unwrap_or_default()).await? {
        Some(wait) => Ok(Step::Wait(wait)),
        None => Ok(Step::Advance(with_state(restore, after_restore(&cluster)))),
    }
}

async fn handle_prepare_cluster(
    restore: &PerconaXtraDBClusterRestore,
    ctx: &Context,
) -> Result<Step, Error> {
    let kube = ctx.kube.as_ref();
    let namespace = restore.namespace().unwrap_or_default();
    let cluster = get_cluster(kube, restore).await?;

    // The PITR stage leaves one node running on the data volume
    if let Some(wait) = stop_cluster(kube, &cluster).await? {
        return Ok(Step::Wait(wait));
    }

    let name = prepare_job_name(&restore.name_any(), &cluster.name_any());
    if kube.get_job(&name, &namespace).await?.is_none() {
        create_job(kube, &namespace, &prepare_job(restore, &cluster)?).await?;
        info!(job = %name, "prepare job created");
        return Ok(Step::Wait(WaitReason::JobRunning(name)));
    }

    match wait_for_job(kube, &name, &namespace).await? {
        Some(wait) => Ok(Step::Wait(wait)),
        None => Ok(Step::Advance(with_state(restore, RestoreState::StartCluster))),
    }
}

/// Patch bringing the cluster back to its pre-restore shape, `None` when it
/// already is.
///
/// `unsafeFlags.pxcSize` is only kept when the saved size needs it.
fn start_patch(
    cluster: &PerconaXtraDBCluster,
    saved: &PerconaXtraDBClusterRestoreStatus,
) -> Option<Value> {
    let mut spec = Map::new();

    if cluster.spec.pause {
        spec.insert("pause".into(), json!(false));
    }
    if let Some(size) = saved.pxc_size {
        if cluster.spec.pxc.size != size {
            spec.insert("pxc".into(), json!({ "size": size }));
        }
    }
    let needs_unsafe = saved.pxc_size.is_some_and(|s| s < 3);
    if cluster.spec.unsafe_flags.pxc_size && !needs_unsafe {
        spec.insert("unsafeFlags".into(), json!({ "pxcSize": false }));
    }
    if let (Some(size), Some(proxy)) = (saved.haproxy_size, cluster.spec.haproxy.as_ref()) {
        if proxy.size != size {
            spec.insert("haproxy".into(), json!({ "size": size }));
        }
    }
    if let (Some(size), Some(proxy)) = (saved.proxy_size, cluster.spec.proxysql.as_ref()) {
        if proxy.size != size {
            spec.insert("proxysql".into(), json!({ "size": size }));
        }
    }

    (!spec.is_empty()).then(|| json!({ "spec": spec }))
}

async fn handle_start_cluster(
    restore: &PerconaXtraDBClusterRestore,
    ctx: &Context,
) -> Result<Step, Error> {
    let kube = ctx.kube.as_ref();
    let cluster = get_cluster(kube, restore).await?;
    let status = current_status(restore);

    if let Some(patch) = start_patch(&cluster, &status) {
        kube.patch_cluster(
            &cluster.name_any(),
            &cluster.namespace().unwrap_or_default(),
            patch,
        )
        .await?;
        info!(cluster = %cluster.name_any(), "starting cluster");
        return Ok(Step::Wait(WaitReason::ClusterNotReady));
    }
    if !cluster.is_ready_after_restart() {
        return Ok(Step::Wait(WaitReason::ClusterNotReady));
    }

    match restorer_for(kube, restore, &cluster).await {
        Ok(restorer) => restorer.finalize(kube).await?,
        Err(e) => warn!(error = %e, "skipping restore source cleanup"),
    }

    let name = restore.name_any();
    Ok(Step::Advance(PerconaXtraDBClusterRestoreStatus {
        state: RestoreState::Succeeded,
        completed: Some(Utc::now()),
        comments: format!(
            "You can view xtrabackup log:\n$ kubectl logs job/{}\nIf everything is fine, you can cleanup the job:\n$ kubectl delete pxc-restore/{name}\n",
            restore_job_name(&name, &cluster.name_any()),
        ),
        ..status
    }))
}
