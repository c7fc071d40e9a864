//! Deletion finalizers for backups
//!
//! Removing a backup from object storage can take minutes, so it runs outside
//! the reconcile loop on a bounded pool. At most one cleanup per backup is in
//! flight; when every slot is busy the request is dropped and picked up again
//! by a later reconcile of the still-present backup.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashSet;
use kube::ResourceExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pxc_common::crd::{BackupStorageType, PerconaXtraDBClusterBackup};
use pxc_common::metrics;
use pxc_common::naming::{backup_holder_id, FINALIZER_DELETE_BACKUP, FINALIZER_RELEASE_LOCK};
use pxc_common::retry::{retry_with_backoff, RetryConfig};
use pxc_common::Error;
use pxc_storage::StorageClient;

use crate::client::KubeClient;
use crate::lease::{self, LeaseError};
use crate::storage::{backup_storage_spec, resolve_options, StorageProvider};

/// Default number of concurrent cleanups
pub const DEFAULT_WORKERS_LIMIT: usize = 10;

/// What happened to a cleanup request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// A worker picked it up
    Started,
    /// A cleanup for the same backup is still running
    AlreadyRunning,
    /// Every worker is busy
    Busy,
}

/// Bounded, deduplicated pool of cleanup tasks
pub struct FinalizerPool {
    slots: Arc<Semaphore>,
    in_flight: Arc<DashSet<String>>,
    cancel: CancellationToken,
}

/// Removes its key from the in-flight set when the task ends, however it ends
struct InFlight {
    key: String,
    set: Arc<DashSet<String>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.remove(&self.key);
        metrics::set_finalizers_in_flight(self.set.len());
    }
}

impl FinalizerPool {
    /// Pool with `limit` workers; tasks stop early when `cancel` fires
    pub fn new(limit: usize, cancel: CancellationToken) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(limit.max(1))),
            in_flight: Arc::new(DashSet::new()),
            cancel,
        }
    }

    /// Run `task` for `key` if a worker is free and no task for `key` runs
    pub fn dispatch<F>(&self, key: &str, task: F) -> Dispatch
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.in_flight.contains(key) {
            return Dispatch::AlreadyRunning;
        }

        let Ok(permit) = self.slots.clone().try_acquire_owned() else {
            warn!(
                backup = %key,
                in_progress = %self.in_flight().join(", "),
                "all workers are busy - skip backup deletion for now"
            );
            metrics::record_finalizer_skipped();
            return Dispatch::Busy;
        };

        if !self.in_flight.insert(key.to_string()) {
            return Dispatch::AlreadyRunning;
        }
        metrics::set_finalizers_in_flight(self.in_flight.len());

        let guard = InFlight {
            key: key.to_string(),
            set: self.in_flight.clone(),
        };
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            tokio::select! {
                _ = cancel.cancelled() => debug!("backup cleanup cancelled"),
                _ = task => {}
            }
        });

        Dispatch::Started
    }

    /// Keys of the cleanups currently running, sorted
    pub fn in_flight(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.in_flight.iter().map(|k| k.clone()).collect();
        keys.sort();
        keys
    }
}

/// Runs the finalizers of a deleted backup
#[derive(Clone)]
pub struct BackupCleanup {
    kube: Arc<dyn KubeClient>,
    storage: Arc<dyn StorageProvider>,
    retry: RetryConfig,
}

impl BackupCleanup {
    /// Cleanup using the bounded storage retry policy
    pub fn new(kube: Arc<dyn KubeClient>, storage: Arc<dyn StorageProvider>) -> Self {
        Self {
            kube,
            storage,
            retry: RetryConfig::storage(),
        }
    }

    /// Override the retry policy of storage calls
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run every finalizer and write back the ones that still need to run
    pub async fn finalize(&self, backup: PerconaXtraDBClusterBackup) {
        let name = backup.name_any();
        let namespace = backup.namespace().unwrap_or_default();

        let remaining = self.run(&backup).await;
        if let Err(e) = self
            .kube
            .set_backup_finalizers(&name, &namespace, remaining)
            .await
        {
            warn!(backup = %name, error = %e, "failed to update finalizers for backup");
        }
    }

    /// Run every finalizer independently, returning the ones that failed.
    ///
    /// Finalizers owned by someone else are kept untouched.
    pub async fn run(&self, backup: &PerconaXtraDBClusterBackup) -> Vec<String> {
        let name = backup.name_any();
        let mut remaining = Vec::new();

        for finalizer in backup.finalizers() {
            let result = match finalizer.as_str() {
                FINALIZER_DELETE_BACKUP => self.delete_backup(backup).await,
                FINALIZER_RELEASE_LOCK => self.release_lock(backup).await,
                _ => {
                    remaining.push(finalizer.clone());
                    continue;
                }
            };
            match result {
                Ok(()) => debug!(backup = %name, finalizer = %finalizer, "finalizer done"),
                Err(e) => {
                    warn!(backup = %name, finalizer = %finalizer, error = %e, "finalizer failed");
                    remaining.push(finalizer.clone());
                }
            }
        }

        remaining
    }

    async fn delete_backup(&self, backup: &PerconaXtraDBClusterBackup) -> Result<(), Error> {
        let name = backup.name_any();
        let namespace = backup.namespace().unwrap_or_default();
        let Some(status) = backup.status.as_ref() else {
            return Ok(());
        };
        let Some(destination) = status.destination() else {
            return Ok(());
        };
        let storage_type = destination.storage_type();
        if storage_type == BackupStorageType::Filesystem {
            // The claim is owned by the backup and goes with it
            return Ok(());
        }

        if let Some(s3) = status.s3.as_ref() {
            if storage_type == BackupStorageType::S3
                && !s3.credentials_secret.is_empty()
                && self
                    .kube
                    .get_secret(&s3.credentials_secret, &namespace)
                    .await?
                    .is_none()
            {
                warn!(backup = %name, secret = %s3.credentials_secret, "credentials secret not found, leaving backup in storage");
                return Ok(());
            }
        }

        let cluster = self
            .kube
            .get_cluster(&backup.spec.pxc_cluster, &namespace)
            .await?;
        let spec = backup_storage_spec(status, cluster.as_ref());
        let Some(options) =
            resolve_options(self.kube.as_ref(), &namespace, &spec, Some(&destination)).await?
        else {
            return Ok(());
        };
        let client = self.storage.client(&options)?;

        info!(backup = %name, destination = %destination, "deleting backup from storage");
        let backup_name = destination.backup_name();
        self.remove_tree(client.as_ref(), &destination.backup_dir())
            .await?;

        let sst_info = format!("{backup_name}.sst_info/");
        if let Err(e) = self.remove_tree(client.as_ref(), &sst_info).await {
            warn!(backup = %name, prefix = %sst_info, error = %e, "failed to delete sst info");
        }
        if storage_type == BackupStorageType::S3 {
            let md5 = format!("{backup_name}.md5");
            if let Err(e) = client.delete_object(&md5).await {
                if !e.is_not_found() {
                    warn!(backup = %name, object = %md5, error = %e, "failed to delete checksum");
                }
            }
        }

        info!(backup = %name, "backup was removed");
        Ok(())
    }

    async fn remove_tree(&self, client: &dyn StorageClient, prefix: &str) -> Result<(), Error> {
        retry_with_backoff(&self.retry, "remove backup objects", || async {
            let objects = client.list_objects(prefix).await?;
            for object in objects {
                match client.delete_object(&object).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::storage(format!("delete {prefix}: {e}")))
    }

    async fn release_lock(&self, backup: &PerconaXtraDBClusterBackup) -> Result<(), Error> {
        let namespace = backup.namespace().unwrap_or_default();
        let holder = backup_holder_id(&backup.name_any(), &backup.uid().unwrap_or_default());
        match lease::release(
            self.kube.as_ref(),
            &namespace,
            &backup.spec.pxc_cluster,
            &holder,
        )
        .await
        {
            Ok(()) | Err(LeaseError::NotTheHolder { .. }) => Ok(()),
            Err(LeaseError::Kube(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockKubeClient;
    use crate::storage::tests::{memory_provider, secret};
    use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
    use pxc_common::crd::{
        AzureStorageSpec, PerconaXtraDBClusterBackupSpec, PerconaXtraDBClusterBackupStatus,
        S3StorageSpec,
    };
    use pxc_storage::MemoryStorage;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        }
    }

    fn deleted_backup(status: PerconaXtraDBClusterBackupStatus, finalizers: &[&str]) -> PerconaXtraDBClusterBackup {
        let mut b = PerconaXtraDBClusterBackup::new(
            "backup1",
            PerconaXtraDBClusterBackupSpec {
                pxc_cluster: "cluster1".to_string(),
                storage_name: "s3-us-west".to_string(),
                ..Default::default()
            },
        );
        b.metadata.namespace = Some("ns".to_string());
        b.metadata.uid = Some("uid1".to_string());
        b.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        b.status = Some(status);
        b
    }

    fn s3_status() -> PerconaXtraDBClusterBackupStatus {
        PerconaXtraDBClusterBackupStatus {
            destination: "s3://operator-testing/nightly/cluster1-full".to_string(),
            storage_type: Some(BackupStorageType::S3),
            s3: Some(S3StorageSpec {
                bucket: "operator-testing/nightly".to_string(),
                credentials_secret: "s3-creds".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn kube_with_secret() -> MockKubeClient {
        let mut mock = MockKubeClient::new();
        mock.expect_get_secret()
            .returning(|_, _| Ok(Some(secret(&[("AWS_ACCESS_KEY_ID", "a")]))));
        mock.expect_get_cluster().returning(|_, _| Ok(None));
        mock
    }

    fn seeded_storage() -> Arc<MemoryStorage> {
        let storage = Arc::new(MemoryStorage::with_prefix("nightly/"));
        storage.insert("nightly/cluster1-full/xtrabackup.stream", "data");
        storage.insert("nightly/cluster1-full/sst_info/sst_info", "info");
        storage.insert("nightly/cluster1-full.md5", "sum");
        storage.insert("nightly/cluster1-full.sst_info/sst_info", "info");
        storage.insert("nightly/cluster2-full/xtrabackup.stream", "other");
        storage
    }

    /// Story: deleting an S3 backup removes its directory, checksum and
    /// sst info tree and nothing else from the bucket
    #[tokio::test]
    async fn story_s3_backup_objects_are_removed() {
        let storage = seeded_storage();
        let cleanup = BackupCleanup::new(
            Arc::new(kube_with_secret()),
            Arc::new(memory_provider(storage.clone())),
        )
        .with_retry(fast_retry());

        let remaining = cleanup
            .run(&deleted_backup(s3_status(), &[FINALIZER_DELETE_BACKUP]))
            .await;

        assert!(remaining.is_empty());
        assert_eq!(storage.keys(), vec!["nightly/cluster2-full/xtrabackup.stream"]);
    }

    #[tokio::test]
    async fn test_azure_removes_sst_info_tree() {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert("cluster1-full/xtrabackup.stream", "data");
        storage.insert("cluster1-full.sst_info/sst_info", "info");
        storage.insert("cluster2-full/xtrabackup.stream", "other");

        let mut mock = MockKubeClient::new();
        mock.expect_get_secret().returning(|_, _| {
            Ok(Some(secret(&[
                ("AZURE_STORAGE_ACCOUNT_NAME", "acct"),
                ("AZURE_STORAGE_ACCOUNT_KEY", "key"),
            ])))
        });
        mock.expect_get_cluster().returning(|_, _| Ok(None));

        let status = PerconaXtraDBClusterBackupStatus {
            destination: "azure://backups/cluster1-full".to_string(),
            storage_type: Some(BackupStorageType::Azure),
            azure: Some(AzureStorageSpec {
                container_path: "backups".to_string(),
                credentials_secret: "azure-creds".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let cleanup = BackupCleanup::new(Arc::new(mock), Arc::new(memory_provider(storage.clone())))
            .with_retry(fast_retry());

        let remaining = cleanup
            .run(&deleted_backup(status, &[FINALIZER_DELETE_BACKUP]))
            .await;
        assert!(remaining.is_empty());
        assert_eq!(storage.keys(), vec!["cluster2-full/xtrabackup.stream"]);
    }

    /// Story: storage is down while the lock is releasable; the lock finalizer
    /// completes and only the storage finalizer stays for the next attempt
    #[tokio::test]
    async fn story_failed_finalizer_is_kept_alone() {
        let storage = seeded_storage();
        storage.fail_next(100);

        let mut mock = kube_with_secret();
        mock.expect_get_lease().returning(|_, _| {
            Ok(Some(Lease {
                spec: Some(LeaseSpec {
                    holder_identity: Some("backup1-uid1".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }))
        });
        mock.expect_delete_lease().times(1).returning(|_, _, _| Ok(()));

        let cleanup = BackupCleanup::new(Arc::new(mock), Arc::new(memory_provider(storage)))
            .with_retry(fast_retry());
        let remaining = cleanup
            .run(&deleted_backup(
                s3_status(),
                &[FINALIZER_DELETE_BACKUP, FINALIZER_RELEASE_LOCK, "example.com/other"],
            ))
            .await;

        assert_eq!(remaining, vec![FINALIZER_DELETE_BACKUP.to_string(), "example.com/other".to_string()]);
    }

    #[tokio::test]
    async fn test_lock_held_by_another_backup_counts_as_released() {
        let mut mock = MockKubeClient::new();
        mock.expect_get_lease().returning(|_, _| {
            Ok(Some(Lease {
                spec: Some(LeaseSpec {
                    holder_identity: Some("backup9-uid9".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }))
        });
        mock.expect_delete_lease().never();

        let cleanup = BackupCleanup::new(Arc::new(mock), Arc::new(crate::storage::MockStorageProvider::new()));
        let remaining = cleanup
            .run(&deleted_backup(s3_status(), &[FINALIZER_RELEASE_LOCK]))
            .await;
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn test_missing_s3_secret_leaves_objects() {
        let storage = seeded_storage();
        let mut mock = MockKubeClient::new();
        mock.expect_get_secret().returning(|_, _| Ok(None));

        let cleanup = BackupCleanup::new(Arc::new(mock), Arc::new(memory_provider(storage.clone())));
        let remaining = cleanup
            .run(&deleted_backup(s3_status(), &[FINALIZER_DELETE_BACKUP]))
            .await;
        assert!(remaining.is_empty());
        assert_eq!(storage.keys().len(), 5);
    }

    #[tokio::test]
    async fn test_finalize_writes_remaining_finalizers() {
        let mut mock = MockKubeClient::new();
        mock.expect_set_backup_finalizers()
            .withf(|name, ns, finalizers| name == "backup1" && ns == "ns" && finalizers.is_empty())
            .times(1)
            .returning(|_, _, _| Ok(()));

        let status = PerconaXtraDBClusterBackupStatus {
            destination: "pvc/xb-backup1".to_string(),
            ..Default::default()
        };
        let cleanup = BackupCleanup::new(Arc::new(mock), Arc::new(crate::storage::MockStorageProvider::new()));
        cleanup
            .finalize(deleted_backup(status, &[FINALIZER_DELETE_BACKUP]))
            .await;
    }

    async fn wait_idle(pool: &FinalizerPool) {
        for _ in 0..200 {
            if pool.in_flight().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pool never went idle");
    }

    /// Story: with every worker busy the next deletion is skipped without
    /// error, and goes through once a worker frees up
    #[tokio::test]
    async fn story_pool_defers_when_full() {
        let pool = FinalizerPool::new(1, CancellationToken::new());

        let (release, wait) = oneshot::channel::<()>();
        assert_eq!(
            pool.dispatch("ns/backup1", async move {
                let _ = wait.await;
            }),
            Dispatch::Started
        );

        let (skipped_tx, mut skipped_rx) = oneshot::channel::<()>();
        assert_eq!(
            pool.dispatch("ns/backup2", async move {
                let _ = skipped_tx.send(());
            }),
            Dispatch::Busy
        );
        assert_eq!(pool.in_flight(), vec!["ns/backup1".to_string()]);
        assert!(skipped_rx.try_recv().is_err());

        release.send(()).unwrap();
        wait_idle(&pool).await;

        let (done_tx, done_rx) = oneshot::channel::<()>();
        assert_eq!(
            pool.dispatch("ns/backup2", async move {
                let _ = done_tx.send(());
            }),
            Dispatch::Started
        );
        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_pool_deduplicates_by_key() {
        let pool = FinalizerPool::new(4, CancellationToken::new());
        let (release, wait) = oneshot::channel::<()>();
        assert_eq!(
            pool.dispatch("ns/backup1", async move {
                let _ = wait.await;
            }),
            Dispatch::Started
        );
        assert_eq!(pool.dispatch("ns/backup1", async {}), Dispatch::AlreadyRunning);

        release.send(()).unwrap();
        wait_idle(&pool).await;
    }

    #[tokio::test]
    async fn test_cancel_frees_workers() {
        let cancel = CancellationToken::new();
        let pool = FinalizerPool::new(1, cancel.clone());
        pool.dispatch("ns/backup1", futures::future::pending::<()>());
        cancel.cancel();
        wait_idle(&pool).await;
    }
}
