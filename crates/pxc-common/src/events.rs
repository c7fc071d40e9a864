//! Kubernetes Event recording for the backup and restore controllers.
//!
//! Events are fire-and-forget: a failed publish is logged as a warning and
//! never fails a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events on resources
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event about `resource_ref`.
    ///
    /// `reason` shows up in the REASON column, `action` in the ACTION column.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons
pub mod reasons {
    /// Backup job created
    pub const BACKUP_STARTED: &str = "BackupStarted";
    /// Backup job completed
    pub const BACKUP_SUCCEEDED: &str = "BackupSucceeded";
    /// Backup failed
    pub const BACKUP_FAILED: &str = "BackupFailed";
    /// Backup job suspended while the cluster is unhealthy
    pub const BACKUP_SUSPENDED: &str = "BackupSuspended";
    /// Restore started
    pub const RESTORE_STARTED: &str = "RestoreStarted";
    /// Restore moved to another stage
    pub const RESTORE_PROGRESSING: &str = "RestoreProgressing";
    /// Restore completed
    pub const RESTORE_SUCCEEDED: &str = "RestoreSucceeded";
    /// Restore failed
    pub const RESTORE_FAILED: &str = "RestoreFailed";
}

/// Event actions
pub mod actions {
    /// Reconcile loop
    pub const RECONCILE: &str = "Reconcile";
    /// Stage transition
    pub const TRANSITION: &str = "Transition";
}
