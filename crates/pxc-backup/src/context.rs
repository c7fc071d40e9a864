//! Shared state of the backup and restore controllers

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio_util::sync::CancellationToken;

use pxc_common::events::{EventPublisher, KubeEventPublisher};

use crate::client::{KubeClient, KubeClientImpl};
use crate::finalizer::{BackupCleanup, FinalizerPool, DEFAULT_WORKERS_LIMIT};
use crate::storage::{ObjectStorageProvider, StorageProvider};

/// Name the controllers report events as
pub const CONTROLLER_NAME: &str = "pxc-backup-controller";

/// Bounds of the few waits that block inside a reconcile
#[derive(Clone, Debug)]
pub struct Timings {
    /// How long to wait for the extra data volumes of a cluster to go away
    pub volume_shrink_timeout: Duration,
    /// Interval between checks while waiting
    pub poll_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            volume_shrink_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Context shared by every reconcile of both controllers
pub struct Context {
    /// Kubernetes API access (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Object storage connections
    pub storage: Arc<dyn StorageProvider>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Workers removing deleted backups from storage
    pub finalizers: FinalizerPool,
    /// What the workers run
    pub cleanup: BackupCleanup,
    /// Wait bounds
    pub timings: Timings,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder {
            client,
            workers_limit: DEFAULT_WORKERS_LIMIT,
            cancel: CancellationToken::new(),
        }
    }

    /// Context over mocks, with no real cluster behind it
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, storage: Arc<dyn StorageProvider>) -> Self {
        Self {
            cleanup: BackupCleanup::new(kube.clone(), storage.clone()),
            kube,
            storage,
            events: Arc::new(pxc_common::events::NoopEventPublisher),
            finalizers: FinalizerPool::new(DEFAULT_WORKERS_LIMIT, CancellationToken::new()),
            timings: Timings {
                volume_shrink_timeout: Duration::from_millis(200),
                poll_interval: Duration::from_millis(5),
            },
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    workers_limit: usize,
    cancel: CancellationToken,
}

impl ContextBuilder {
    /// Maximum number of concurrent backup deletions
    pub fn workers_limit(mut self, limit: usize) -> Self {
        self.workers_limit = limit;
        self
    }

    /// Token stopping in-flight deletions on shutdown
    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kube: Arc<dyn KubeClient> = Arc::new(KubeClientImpl::new(self.client.clone()));
        let storage: Arc<dyn StorageProvider> = Arc::new(ObjectStorageProvider);
        Context {
            cleanup: BackupCleanup::new(kube.clone(), storage.clone()),
            kube,
            storage,
            events: Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME)),
            finalizers: FinalizerPool::new(self.workers_limit, self.cancel),
            timings: Timings::default(),
        }
    }
}
