//! PerconaXtraDBClusterBackup controller
//!
//! A backup is one `xb-<name>` job writing to the storage named in its spec.
//! The controller creates the job once, mirrors its progress into the
//! backup's status and cleans up when the backup is deleted. Backups of a
//! cluster that disallows parallel runs take turns through the lease in
//! [`crate::lease`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use pxc_common::crd::{
    AppState, BackupState, BackupStorageSpec, BackupStorageType, ClusterBackupSpec,
    PerconaXtraDBCluster, PerconaXtraDBClusterBackup, PerconaXtraDBClusterBackupStatus,
};
use pxc_common::destination::Destination;
use pxc_common::events::{actions, reasons};
use pxc_common::kube_utils::{creation_time, job_outcome, JobOutcome};
use pxc_common::metrics::{self, ControllerKind, ReconcileTimer};
use pxc_common::naming::{
    backup_holder_id, backup_job_name, pitr_bootstrap_secret_name, pitr_labels, pxc_host_prefix,
    selector_string, FINALIZER_RELEASE_LOCK, GAP_DETECTED_PATH, PITR_CONTAINER, TIMELINE_PATH,
};
use pxc_common::{Error, REQUEUE_ERROR_SECS, REQUEUE_WAIT_SECS};
use pxc_pitr::cache::{self, CACHE_KEY};

use crate::context::Context;
use crate::deadline::{DeadlineExceeded, Deadlines};
use crate::jobs::{backup_job, backup_pvc};
use crate::lease::{self, holder_of, LeaseError};
use crate::storage::cluster_storage;
use crate::wait::WaitReason;

/// Reconcile a PerconaXtraDBClusterBackup
#[instrument(
    skip(backup, ctx),
    fields(
        backup = %backup.name_any(),
        namespace = %backup.namespace().unwrap_or_default(),
        state = %backup.state(),
    )
)]
pub async fn reconcile(
    backup: Arc<PerconaXtraDBClusterBackup>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let timer = ReconcileTimer::start(ControllerKind::Backup);
    let result = reconcile_backup(&backup, &ctx).await;
    match &result {
        Ok(_) => timer.success(),
        Err(e) => timer.error(e.is_retryable()),
    }
    result
}

/// Log the failure and retry shortly
pub fn error_policy(
    backup: Arc<PerconaXtraDBClusterBackup>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    error!(
        ?error,
        backup = %backup.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
}

fn wait_action() -> Action {
    Action::requeue(Duration::from_secs(REQUEUE_WAIT_SECS))
}

async fn reconcile_backup(
    backup: &Arc<PerconaXtraDBClusterBackup>,
    ctx: &Context,
) -> Result<Action, Error> {
    if backup.meta().deletion_timestamp.is_some() {
        return Ok(dispatch_cleanup(backup, ctx));
    }

    if backup.state().is_terminal() {
        release_lock(ctx, backup).await?;
        return Ok(Action::await_change());
    }

    match run(backup, ctx).await {
        Ok(action) => Ok(action),
        Err(e) if e.is_retryable() => Err(e),
        Err(e) => {
            warn!(error = %e, "backup failed");
            fail(backup, ctx, e).await?;
            Ok(Action::await_change())
        }
    }
}

/// Hand a deleted backup to the finalizer pool
fn dispatch_cleanup(backup: &PerconaXtraDBClusterBackup, ctx: &Context) -> Action {
    if backup.finalizers().is_empty() {
        return Action::await_change();
    }

    let key = format!(
        "{}/{}",
        backup.namespace().unwrap_or_default(),
        backup.name_any()
    );
    let cleanup = ctx.cleanup.clone();
    let owned = backup.clone();
    let dispatch = ctx
        .finalizers
        .dispatch(&key, async move { cleanup.finalize(owned).await });
    debug!(?dispatch, "backup cleanup requested");

    // The pool drops requests while busy; ask again until the finalizers are gone
    wait_action()
}

/// The cluster's backup section, or why backups can't run
fn backup_settings(cluster: &PerconaXtraDBCluster) -> Result<&ClusterBackupSpec, Error> {
    cluster
        .spec
        .backup
        .as_ref()
        .filter(|b| !b.image.is_empty())
        .ok_or_else(|| {
            Error::validation_for_field(
                cluster.name_any(),
                "spec.backup.image",
                "a backup image should be set in the PXC config",
            )
        })
}

async fn run(backup: &PerconaXtraDBClusterBackup, ctx: &Context) -> Result<Action, Error> {
    let kube = ctx.kube.as_ref();
    let name = backup.name_any();
    let namespace = backup.namespace().unwrap_or_default();
    let cluster_name = &backup.spec.pxc_cluster;

    let cluster = kube
        .get_cluster(cluster_name, &namespace)
        .await?
        .ok_or_else(|| Error::validation_for(&name, format!("cluster {cluster_name} not found")))?;
    let settings = backup_settings(&cluster)?;
    let storage = cluster.storage(&backup.spec.storage_name)?;

    if !settings.allow_parallel && !has_finalizer(backup, FINALIZER_RELEASE_LOCK) {
        let mut finalizers = backup.finalizers().to_vec();
        finalizers.push(FINALIZER_RELEASE_LOCK.to_string());
        kube.set_backup_finalizers(&name, &namespace, finalizers)
            .await?;
    }

    let job_name = backup_job_name(&name);
    let job = kube.get_job(&job_name, &namespace).await?;

    if let Err(exceeded) = Deadlines::resolve(backup, Some(settings)).check(backup, job.as_ref(), Utc::now()) {
        if job.is_some() && exceeded != DeadlineExceeded::Starting {
            info!(job = %job_name, "deleting backup job");
            kube.delete_job(&job_name, &namespace).await?;
        }
        return Err(Error::job(&job_name, exceeded.to_string()));
    }

    if !cluster.spec.unsafe_flags.backup_if_unhealthy {
        if let Some(job) = &job {
            if let Some(action) = suspend_or_resume(backup, ctx, &cluster, job).await? {
                return Ok(action);
            }
        }
    }

    let mut status = backup.status.clone().unwrap_or_default();

    let job = match job {
        Some(job) => job,
        None => {
            if let Err(reason) = cluster.can_backup() {
                let wait = WaitReason::ClusterNotBackupReady(reason);
                debug!(%wait, "backup waiting");
                return Ok(wait.action());
            }
            if !settings.allow_parallel && backup.state() == BackupState::New {
                if let Some(wait) = acquire_lock(ctx, backup).await? {
                    debug!(%wait, "backup waiting");
                    return Ok(wait.action());
                }
            }

            let destination = assign_destination(ctx, backup, &cluster, storage, &mut status).await?;
            let job = backup_job(backup, &cluster, storage, &destination)?;
            match kube.create_job(&namespace, &job).await {
                Err(e) if e.is_conflict() => debug!(job = %job_name, "backup job already exists"),
                other => {
                    other?;
                    info!(job = %job_name, destination = %destination, "created backup job");
                    publish(ctx, backup, EventType::Normal, reasons::BACKUP_STARTED, format!("writing to {destination}")).await;
                }
            }
            job
        }
    };

    match job_outcome(&job) {
        JobOutcome::Pending => status.state = BackupState::Starting,
        JobOutcome::Running => status.state = BackupState::Running,
        JobOutcome::Failed { message } => {
            return Err(Error::job(&job_name, message));
        }
        JobOutcome::Complete { completed } => {
            status.state = BackupState::Succeeded;
            status.completed = completed.or_else(|| Some(Utc::now()));
            if cluster.pitr_enabled() {
                reset_pitr(ctx, backup, &cluster).await?;
            }
        }
    }

    if status.state.is_terminal() {
        finish(backup, ctx, status).await?;
        return Ok(Action::await_change());
    }
    write_status(backup, ctx, &status).await?;
    Ok(wait_action())
}

fn has_finalizer(backup: &PerconaXtraDBClusterBackup, finalizer: &str) -> bool {
    backup.finalizers().iter().any(|f| f == finalizer)
}

/// Suspend the job while the cluster is unhealthy and resume it afterwards.
///
/// Returns the action to end the reconcile with when something changed.
async fn suspend_or_resume(
    backup: &PerconaXtraDBClusterBackup,
    ctx: &Context,
    cluster: &PerconaXtraDBCluster,
    job: &Job,
) -> Result<Option<Action>, Error> {
    if matches!(
        job_outcome(job),
        JobOutcome::Complete { .. } | JobOutcome::Failed { .. }
    ) {
        return Ok(None);
    }

    let job_name = job.name_any();
    let namespace = backup.namespace().unwrap_or_default();
    let cluster_state = cluster.status.as_ref().map(|s| s.state).unwrap_or_default();
    let suspended = job
        .spec
        .as_ref()
        .and_then(|s| s.suspend)
        .unwrap_or(false);
    let mut status = backup.status.clone().unwrap_or_default();

    match (cluster_state == AppState::Ready, suspended) {
        (false, false) => {
            ctx.kube
                .patch_job(&job_name, &namespace, json!({ "spec": { "suspend": true } }))
                .await?;
            info!(job = %job_name, cluster_state = %cluster_state, "suspended backup job");
            status.state = BackupState::Suspended;
            write_status(backup, ctx, &status).await?;
            publish(
                ctx,
                backup,
                EventType::Warning,
                reasons::BACKUP_SUSPENDED,
                format!("cluster is {cluster_state}"),
            )
            .await;
            Ok(Some(wait_action()))
        }
        (false, true) => {
            let wait = WaitReason::ClusterNotBackupReady(format!("cluster is {cluster_state}"));
            debug!(%wait, "backup waiting");
            Ok(Some(wait.action()))
        }
        (true, true) => {
            ctx.kube
                .patch_job(&job_name, &namespace, json!({ "spec": { "suspend": false } }))
                .await?;
            info!(job = %job_name, "resumed backup job");
            status.state = BackupState::Starting;
            write_status(backup, ctx, &status).await?;
            Ok(Some(wait_action()))
        }
        (true, false) => Ok(None),
    }
}

/// `None` once this backup holds the cluster's lease
async fn acquire_lock(
    ctx: &Context,
    backup: &PerconaXtraDBClusterBackup,
) -> Result<Option<WaitReason>, Error> {
    let holder = backup_holder_id(&backup.name_any(), &backup.uid().unwrap_or_default());
    let lease = lease::acquire(
        ctx.kube.as_ref(),
        &backup.namespace().unwrap_or_default(),
        &backup.spec.pxc_cluster,
        &holder,
    )
    .await
    .map_err(lease_error)?;

    match holder_of(&lease) {
        Some(current) if current == holder => Ok(None),
        current => Ok(Some(WaitReason::LeaseHeld {
            holder: current.unwrap_or_default().to_string(),
        })),
    }
}

/// Give the lease back and drop the finalizer guarding it
async fn release_lock(ctx: &Context, backup: &PerconaXtraDBClusterBackup) -> Result<(), Error> {
    if !has_finalizer(backup, FINALIZER_RELEASE_LOCK) {
        return Ok(());
    }

    let name = backup.name_any();
    let namespace = backup.namespace().unwrap_or_default();
    let holder = backup_holder_id(&name, &backup.uid().unwrap_or_default());

    match lease::release(ctx.kube.as_ref(), &namespace, &backup.spec.pxc_cluster, &holder).await {
        Ok(()) => {}
        Err(LeaseError::NotTheHolder { holder: current }) => {
            debug!(%current, "backup lease held by another backup");
        }
        Err(LeaseError::Kube(e)) => return Err(e),
    }

    let remaining = backup
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER_RELEASE_LOCK)
        .cloned()
        .collect();
    ctx.kube
        .set_backup_finalizers(&name, &namespace, remaining)
        .await
}

fn lease_error(e: LeaseError) -> Error {
    match e {
        LeaseError::Kube(e) => e,
        other => Error::internal_with_context("lease", other.to_string()),
    }
}

/// Pick where the backup goes and record the storage it uses.
///
/// Runs once; later reconciles reuse the recorded destination.
async fn assign_destination(
    ctx: &Context,
    backup: &PerconaXtraDBClusterBackup,
    cluster: &PerconaXtraDBCluster,
    storage: &BackupStorageSpec,
    status: &mut PerconaXtraDBClusterBackupStatus,
) -> Result<Destination, Error> {
    if let Some(destination) = status.destination() {
        return Ok(destination);
    }

    let created = creation_time(&backup.metadata).unwrap_or_else(Utc::now);
    let cluster_name = cluster.name_any();
    let destination = match storage.type_ {
        BackupStorageType::Filesystem => {
            let template = storage
                .volume
                .as_ref()
                .and_then(|v| v.persistent_volume_claim.clone())
                .unwrap_or_default();
            let pvc = backup_pvc(backup, &cluster_name, &template);
            let claim = pvc.name_any();
            let namespace = backup.namespace().unwrap_or_default();
            if ctx.kube.get_pvc(&claim, &namespace).await?.is_none() {
                match ctx.kube.create_pvc(&namespace, &pvc).await {
                    Err(e) if e.is_conflict() => {}
                    other => {
                        other?;
                        info!(pvc = %claim, "created backup volume");
                    }
                }
            }
            Destination::pvc(claim)
        }
        BackupStorageType::S3 => {
            let s3 = storage
                .s3
                .as_ref()
                .ok_or_else(|| Error::validation("s3 storage is not specified"))?;
            Destination::s3(&s3.bucket, &cluster_name, created)
        }
        BackupStorageType::Azure => {
            let azure = storage
                .azure
                .as_ref()
                .ok_or_else(|| Error::validation("azure storage is not specified"))?;
            Destination::azure(&azure.container_path, &cluster_name, created)
        }
    };

    status.destination = destination.to_string();
    status.storage_name = backup.spec.storage_name.clone();
    status.storage_type = Some(storage.type_);
    status.s3 = storage.s3.clone();
    status.azure = storage.azure.clone();
    status.verify_tls = storage.verify_tls;
    status.image = cluster
        .spec
        .backup
        .as_ref()
        .map(|b| b.image.clone())
        .unwrap_or_default();
    Ok(destination)
}

/// Start binlog collection over from the new backup.
///
/// Clears the gap and timeline markers in the collector, the cached GTID
/// sets of the cluster's hosts and the bootstrap secret of this backup.
/// Anything already gone is fine.
async fn reset_pitr(
    ctx: &Context,
    backup: &PerconaXtraDBClusterBackup,
    cluster: &PerconaXtraDBCluster,
) -> Result<(), Error> {
    let namespace = backup.namespace().unwrap_or_default();
    let selector = selector_string(&pitr_labels(&cluster.name_any()));

    let pods = ctx.kube.list_pods(&namespace, &selector).await?;
    match pods.first() {
        Some(pod) => {
            let pod = pod.name_any();
            for path in [GAP_DETECTED_PATH, TIMELINE_PATH] {
                remove_file(ctx, &namespace, &pod, path).await?;
            }
        }
        None => warn!("binlog collector pod not found, skipping marker cleanup"),
    }

    if let Some(storage_name) = cluster
        .spec
        .backup
        .as_ref()
        .map(|b| b.pitr.storage_name.as_str())
        .filter(|s| !s.is_empty())
    {
        let storage = cluster_storage(
            ctx.kube.as_ref(),
            ctx.storage.as_ref(),
            &namespace,
            cluster,
            storage_name,
        )
        .await?;
        if let Some(storage) = storage {
            let prefix = pxc_host_prefix(&cluster.name_any());
            cache::invalidate_hosts(storage.as_ref(), CACHE_KEY, |host| host.starts_with(&prefix))
                .await
                .map_err(|e| Error::storage(format!("invalidate binlog cache: {e}")))?;
        }
    }

    ctx.kube
        .delete_secret(&pitr_bootstrap_secret_name(&backup.name_any()), &namespace)
        .await
}

async fn remove_file(ctx: &Context, namespace: &str, pod: &str, path: &str) -> Result<(), Error> {
    let output = ctx
        .kube
        .exec(
            namespace,
            pod,
            PITR_CONTAINER,
            vec!["rm".to_string(), path.to_string()],
        )
        .await?;
    if output.success || output.stderr.contains("No such file or directory") {
        return Ok(());
    }
    Err(Error::internal_with_context(
        "pitr",
        format!("remove {path} in {pod}: {}", output.stderr.trim()),
    ))
}

async fn write_status(
    backup: &PerconaXtraDBClusterBackup,
    ctx: &Context,
    status: &PerconaXtraDBClusterBackupStatus,
) -> Result<(), Error> {
    if backup.status.as_ref() == Some(status) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    ctx.kube
        .patch_backup_status(
            &backup.name_any(),
            &backup.namespace().unwrap_or_default(),
            status,
        )
        .await?;
    if backup.state() != status.state {
        info!(from = %backup.state(), to = %status.state, "backup state changed");
    }
    Ok(())
}

async fn publish(
    ctx: &Context,
    backup: &PerconaXtraDBClusterBackup,
    type_: EventType,
    reason: &str,
    note: String,
) {
    ctx.events
        .publish(
            &backup.object_ref(&()),
            type_,
            reason,
            actions::RECONCILE,
            Some(note),
        )
        .await;
}

/// Record a terminal state
async fn finish(
    backup: &PerconaXtraDBClusterBackup,
    ctx: &Context,
    status: PerconaXtraDBClusterBackupStatus,
) -> Result<(), Error> {
    write_status(backup, ctx, &status).await?;
    release_lock(ctx, backup).await?;

    let succeeded = status.state == BackupState::Succeeded;
    let (type_, reason, note) = if succeeded {
        (EventType::Normal, reasons::BACKUP_SUCCEEDED, format!("stored at {}", status.destination))
    } else {
        (EventType::Warning, reasons::BACKUP_FAILED, status.error.clone())
    };
    publish(ctx, backup, type_, reason, note).await;
    metrics::record_backup_finished(succeeded, &backup.spec.storage_name);
    Ok(())
}

async fn fail(backup: &PerconaXtraDBClusterBackup, ctx: &Context, error: Error) -> Result<(), Error> {
    let mut status = backup.status.clone().unwrap_or_default();
    status.set_failed(&error);
    finish(backup, ctx, status).await
}
