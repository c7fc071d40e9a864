//! PerconaXtraDBClusterBackup Custom Resource Definition
//!
//! A backup is a one-shot request: the controller resolves the storage,
//! assigns a destination, runs a job and records the outcome. State only
//! moves toward Succeeded or Failed.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AzureStorageSpec, BackupStorageType, Condition, S3StorageSpec};
use crate::destination::Destination;

/// Condition type reporting whether a backup can serve point-in-time recovery
pub const CONDITION_PITR_READY: &str = "PITRReady";

/// State of a backup
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BackupState {
    /// Not handled yet
    #[default]
    #[serde(rename = "")]
    New,
    /// Job suspended while the cluster is unhealthy
    Suspended,
    /// Job created, not running yet
    Starting,
    /// Job is running
    Running,
    /// Backup failed
    Failed,
    /// Backup completed
    Succeeded,
}

impl BackupState {
    /// True for Succeeded and Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for BackupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, ""),
            Self::Suspended => write!(f, "Suspended"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Failed => write!(f, "Failed"),
            Self::Succeeded => write!(f, "Succeeded"),
        }
    }
}

/// Specification of a PerconaXtraDBClusterBackup
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "pxc.percona.com",
    version = "v1",
    kind = "PerconaXtraDBClusterBackup",
    plural = "perconaxtradbclusterbackups",
    shortname = "pxc-backup",
    namespaced,
    status = "PerconaXtraDBClusterBackupStatus",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.pxcCluster"}"#,
    printcolumn = r#"{"name":"Storage","type":"string","jsonPath":".status.storageName"}"#,
    printcolumn = r#"{"name":"Destination","type":"string","jsonPath":".status.destination"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Completed","type":"date","jsonPath":".status.completed"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PerconaXtraDBClusterBackupSpec {
    /// Cluster to back up
    #[serde(rename = "pxcCluster")]
    pub pxc_cluster: String,

    /// Storage from the cluster's `spec.backup.storages`
    #[serde(default)]
    pub storage_name: String,

    /// Seconds a new backup may wait before it must have started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_deadline_seconds: Option<i64>,

    /// Seconds the backup job may stay suspended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_deadline_seconds: Option<i64>,

    /// Seconds a starting backup may take to reach Running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_deadline_seconds: Option<i64>,
}

/// Status of a PerconaXtraDBClusterBackup.
///
/// Also embedded in restores as `backupSource` to restore from a backup that
/// has no backup object in the cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerconaXtraDBClusterBackupStatus {
    /// Current state
    #[serde(default)]
    pub state: BackupState,

    /// Where the backup is written (`pvc/…`, `s3://…`, `azure://…`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination: String,

    /// Storage the backup was written to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_name: String,

    /// Storage kind
    #[serde(default, rename = "storage_type", skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<BackupStorageType>,

    /// S3 settings copied from the storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3StorageSpec>,

    /// Azure settings copied from the storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureStorageSpec>,

    /// Backup agent image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    /// Completion time
    #[serde(default, rename = "completed", skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,

    /// Failure reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Verify the storage endpoint's TLS certificate
    #[serde(default, rename = "verifyTLS", skip_serializing_if = "Option::is_none")]
    pub verify_tls: Option<bool>,
}

impl PerconaXtraDBClusterBackupStatus {
    /// Parsed destination, `None` until one is assigned
    pub fn destination(&self) -> Option<Destination> {
        if self.destination.is_empty() {
            return None;
        }
        Destination::parse(&self.destination).ok()
    }

    /// Storage kind, derived from the copied settings when not recorded
    pub fn storage_type(&self) -> Option<BackupStorageType> {
        if let Some(t) = self.storage_type {
            return Some(t);
        }
        if self.s3.is_some() {
            Some(BackupStorageType::S3)
        } else if self.azure.is_some() {
            Some(BackupStorageType::Azure)
        } else {
            self.destination().map(|d| d.storage_type())
        }
    }

    /// Record a failure
    pub fn set_failed(&mut self, error: impl std::fmt::Display) {
        self.state = BackupState::Failed;
        self.error = error.to_string();
    }
}

impl PerconaXtraDBClusterBackup {
    /// Current state, New when no status was written yet
    pub fn state(&self) -> BackupState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}
