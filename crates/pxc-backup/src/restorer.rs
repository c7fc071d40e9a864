//! Storage-specific steps of a restore
//!
//! A restore reads its backup from a claim, S3 or Azure. The kind is chosen
//! once from the backup's destination; everything that differs between the
//! three lives here so the state machine stays storage-agnostic.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Container, Pod};
use kube::ResourceExt;
use tracing::{debug, info};

use pxc_common::crd::{
    PerconaXtraDBCluster, PerconaXtraDBClusterBackupStatus, PerconaXtraDBClusterRestore,
};
use pxc_common::destination::Destination;
use pxc_common::naming::{restore_source_labels, restore_source_name};
use pxc_common::Error;

use crate::client::KubeClient;
use crate::jobs::{self, restore_source_pod, restore_source_service, secret_refs, BACKUP_MOUNT};
use crate::storage::{backup_storage, StorageProvider};
use crate::wait::WaitReason;

/// Smallest stream a verified PVC backup may have, in bytes
const MIN_BACKUP_STREAM_BYTES: u64 = 5_000_000;

/// Where a restore reads its backup from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestorerKind {
    /// A filesystem backup on a claim, streamed by a source pod
    Pvc {
        /// Claim holding the backup
        claim: String,
    },
    /// An S3 bucket
    S3,
    /// An Azure blob container
    Azure,
}

/// Storage-specific half of a restore
pub struct Restorer {
    kind: RestorerKind,
    restore: PerconaXtraDBClusterRestore,
    cluster: PerconaXtraDBCluster,
    backup: PerconaXtraDBClusterBackupStatus,
    destination: Destination,
}

impl Restorer {
    /// Pick the restorer for `backup`
    pub fn new(
        restore: &PerconaXtraDBClusterRestore,
        cluster: &PerconaXtraDBCluster,
        backup: &PerconaXtraDBClusterBackupStatus,
    ) -> Result<Self, Error> {
        let destination = backup
            .destination()
            .ok_or_else(|| Error::validation("unknown backup storage type"))?;
        let kind = match &destination {
            Destination::Pvc { claim } => RestorerKind::Pvc {
                claim: claim.clone(),
            },
            Destination::S3 { .. } => RestorerKind::S3,
            Destination::Azure { .. } if backup.azure.is_some() => RestorerKind::Azure,
            Destination::Azure { .. } => {
                return Err(Error::validation("unknown backup storage type"))
            }
        };
        Ok(Self {
            kind,
            restore: restore.clone(),
            cluster: cluster.clone(),
            backup: backup.clone(),
            destination,
        })
    }

    /// Where the backup is read from
    pub fn kind(&self) -> &RestorerKind {
        &self.kind
    }

    /// Parsed location of the backup
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    fn namespace(&self) -> String {
        self.restore.namespace().unwrap_or_default()
    }

    fn source_name(&self, claim: &str) -> String {
        restore_source_name(&self.restore.name_any(), claim)
    }

    /// The job writing the backup into the data volume
    pub fn job(&self) -> Result<Job, Error> {
        let source = match &self.kind {
            RestorerKind::Pvc { claim } => Some(self.source_name(claim)),
            _ => None,
        };
        jobs::restore_job(
            &self.restore,
            &self.cluster,
            &self.backup,
            &self.destination,
            source.as_deref(),
        )
    }

    /// The job replaying binlogs after the restore
    pub fn pitr_job(&self) -> Result<Job, Error> {
        if let RestorerKind::Pvc { .. } = self.kind {
            return Err(Error::validation("pitr restore is not supported for pvc"));
        }
        jobs::pitr_job(&self.restore, &self.cluster, &self.backup, &self.destination)
    }

    /// Prepare whatever the restore job reads from.
    ///
    /// For claims this is the source pod and its service; returns a wait
    /// reason until the pod runs. Cloud restores need nothing.
    pub async fn init(&self, kube: &dyn KubeClient) -> Result<Option<WaitReason>, Error> {
        let RestorerKind::Pvc { claim } = &self.kind else {
            return Ok(None);
        };
        let namespace = self.namespace();
        let name = self.source_name(claim);

        match kube.get_pod(&name, &namespace).await? {
            Some(pod) if phase(&pod) == Some("Running") => Ok(None),
            Some(_) => Ok(Some(WaitReason::SourcePodNotRunning)),
            None => {
                let service = restore_source_service(&self.restore, &self.cluster, claim);
                tolerate_exists(kube.create_service(&namespace, &service).await)?;
                let pod = restore_source_pod(&self.restore, &self.cluster, claim)?;
                tolerate_exists(kube.create_pod(&namespace, &pod).await)?;
                info!(pod = %name, "created restore source");
                Ok(Some(WaitReason::SourcePodNotRunning))
            }
        }
    }

    /// Check the backup is actually there.
    ///
    /// Claims are verified by a short-lived pod, so this may ask to wait.
    pub async fn validate(
        &self,
        kube: &dyn KubeClient,
        provider: &dyn StorageProvider,
    ) -> Result<Option<WaitReason>, Error> {
        match &self.kind {
            RestorerKind::Pvc { claim } => self.verify_claim(kube, claim).await,
            RestorerKind::S3 | RestorerKind::Azure => {
                let storage = backup_storage(
                    kube,
                    provider,
                    &self.namespace(),
                    &self.backup,
                    Some(&self.cluster),
                )
                .await?
                .ok_or_else(|| Error::internal("cloud backup without a storage client"))?;

                let objects = storage
                    .list_objects(&self.destination.backup_dir())
                    .await
                    .map_err(|e| Error::storage(format!("failed to list objects: {e}")))?;
                if objects.is_empty() {
                    let message = match self.kind {
                        RestorerKind::Azure => "no backups found",
                        _ => "backup not found",
                    };
                    return Err(Error::validation_for(self.destination.to_string(), message));
                }
                Ok(None)
            }
        }
    }

    async fn verify_claim(
        &self,
        kube: &dyn KubeClient,
        claim: &str,
    ) -> Result<Option<WaitReason>, Error> {
        let namespace = self.namespace();
        let pod = self.verify_pod(claim)?;
        let name = pod.name_any();

        let Some(existing) = kube.get_pod(&name, &namespace).await? else {
            tolerate_exists(kube.create_pod(&namespace, &pod).await)?;
            debug!(pod = %name, "verifying backup files");
            return Ok(Some(WaitReason::Validation));
        };

        match phase(&existing) {
            Some("Succeeded") => {
                kube.delete_pod(&name, &namespace).await?;
                Ok(None)
            }
            Some("Failed") => {
                kube.delete_pod(&name, &namespace).await?;
                Err(Error::validation(format!(
                    "backup files not found on {}",
                    self.destination
                )))
            }
            _ => Ok(Some(WaitReason::Validation)),
        }
    }

    /// One-shot pod checking the claim holds a plausible backup stream
    fn verify_pod(&self, claim: &str) -> Result<Pod, Error> {
        let mut pod = restore_source_pod(&self.restore, &self.cluster, claim)?;
        let name = format!("{}-verify", self.source_name(claim));
        pod.metadata.labels = Some(restore_source_labels(&self.cluster.name_any(), &name));
        pod.metadata.name = Some(name);

        let check = format!(
            "[[ $(stat -c%s {BACKUP_MOUNT}/xtrabackup.stream) -gt {MIN_BACKUP_STREAM_BYTES} ]]"
        );
        if let Some(spec) = pod.spec.as_mut() {
            spec.restart_policy = Some("Never".to_string());
            spec.containers = spec
                .containers
                .drain(..)
                .map(|c| Container {
                    name: "verify".to_string(),
                    command: Some(vec!["bash".to_string(), "-c".to_string(), check.clone()]),
                    ports: None,
                    ..c
                })
                .collect();
        }
        Ok(pod)
    }

    /// Fail when a secret `job` reads from doesn't exist.
    ///
    /// S3 jobs without a credentials secret run on instance credentials and
    /// are not checked.
    pub async fn validate_job(&self, kube: &dyn KubeClient, job: &Job) -> Result<(), Error> {
        if self.kind == RestorerKind::S3
            && self
                .backup
                .s3
                .as_ref()
                .map_or(true, |s3| s3.credentials_secret.is_empty())
        {
            return Ok(());
        }

        let namespace = self.namespace();
        let mut missing = Vec::new();
        for name in secret_refs(job) {
            if kube.get_secret(&name, &namespace).await?.is_none() {
                missing.push(name);
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        Err(Error::validation_for(
            job.name_any(),
            format!("secrets {} not found", missing.join(", ")),
        ))
    }

    /// Remove what [`Restorer::init`] created
    pub async fn finalize(&self, kube: &dyn KubeClient) -> Result<(), Error> {
        if let RestorerKind::Pvc { claim } = &self.kind {
            let namespace = self.namespace();
            let name = self.source_name(claim);
            kube.delete_pod(&name, &namespace).await?;
            kube.delete_service(&name, &namespace).await?;
        }
        Ok(())
    }
}

fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

fn tolerate_exists(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(e) if e.is_conflict() => Ok(()),
        other => other,
    }
}
