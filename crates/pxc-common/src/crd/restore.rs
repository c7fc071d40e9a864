//! PerconaXtraDBClusterRestore Custom Resource Definition
//!
//! A restore stops the cluster, replaces its data from a backup, optionally
//! replays binlogs up to a target, and starts the cluster again.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::backup::PerconaXtraDBClusterBackupStatus;
use crate::Error;

/// Stage of a restore
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RestoreState {
    /// Not handled yet
    #[default]
    #[serde(rename = "")]
    New,
    /// Backup resolved and jobs being validated
    Starting,
    /// Cluster being paused
    #[serde(rename = "Stopping Cluster")]
    StopCluster,
    /// Restore job running
    #[serde(rename = "Restoring")]
    Restore,
    /// Binlog replay job running
    #[serde(rename = "Point-in-time recovering")]
    Pitr,
    /// Prepare job running
    #[serde(rename = "Preparing Cluster")]
    PrepareCluster,
    /// Cluster being started
    #[serde(rename = "Starting Cluster")]
    StartCluster,
    /// Restore failed
    Failed,
    /// Restore completed
    Succeeded,
}

impl RestoreState {
    /// True for Succeeded and Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Position in the forward order, terminal states last
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::New => 0,
            Self::Starting => 1,
            Self::StopCluster => 2,
            Self::Restore => 3,
            Self::Pitr => 4,
            Self::PrepareCluster => 5,
            Self::StartCluster => 6,
            Self::Failed | Self::Succeeded => 7,
        }
    }
}

impl std::fmt::Display for RestoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, ""),
            Self::Starting => write!(f, "Starting"),
            Self::StopCluster => write!(f, "Stopping Cluster"),
            Self::Restore => write!(f, "Restoring"),
            Self::Pitr => write!(f, "Point-in-time recovering"),
            Self::PrepareCluster => write!(f, "Preparing Cluster"),
            Self::StartCluster => write!(f, "Starting Cluster"),
            Self::Failed => write!(f, "Failed"),
            Self::Succeeded => write!(f, "Succeeded"),
        }
    }
}

/// How far binlogs are replayed
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PitrType {
    /// Everything that was uploaded
    #[default]
    Latest,
    /// Up to a point in time
    Date,
    /// Up to, and excluding, a transaction
    Transaction,
    /// Everything except one transaction
    Skip,
}

impl std::fmt::Display for PitrType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Date => write!(f, "date"),
            Self::Transaction => write!(f, "transaction"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

/// Point-in-time recovery target
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PitrTarget {
    /// Replay mode
    #[serde(rename = "type")]
    pub type_: PitrType,

    /// Target time (`YYYY-MM-DD HH:MM:SS`) for `date`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub date: String,

    /// Target GTID for `transaction` and `skip`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gtid: String,

    /// Binlog storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_source: Option<PerconaXtraDBClusterBackupStatus>,
}

/// Specification of a PerconaXtraDBClusterRestore
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "pxc.percona.com",
    version = "v1",
    kind = "PerconaXtraDBClusterRestore",
    plural = "perconaxtradbclusterrestores",
    shortname = "pxc-restore",
    namespaced,
    status = "PerconaXtraDBClusterRestoreStatus",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.pxcCluster"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Completed","type":"date","jsonPath":".status.completed"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PerconaXtraDBClusterRestoreSpec {
    /// Cluster to restore
    #[serde(rename = "pxcCluster")]
    pub pxc_cluster: String,

    /// Backup object to restore from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backup_name: String,

    /// Inline description of a backup without a backup object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_source: Option<PerconaXtraDBClusterBackupStatus>,

    /// Point-in-time recovery target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitr: Option<PitrTarget>,
}

impl PerconaXtraDBClusterRestoreSpec {
    /// Reject specs that can't name a backup
    pub fn validate(&self) -> Result<(), Error> {
        if self.pxc_cluster.is_empty() {
            return Err(Error::validation_for_field("restore", "spec.pxcCluster", "pxcCluster can't be empty"));
        }
        if let Some(source) = self.pitr.as_ref().and_then(|p| p.backup_source.as_ref()) {
            if source.storage_name.is_empty() && source.s3.is_none() && source.azure.is_none() {
                return Err(Error::validation_for_field(
                    "restore",
                    "spec.pitr.backupSource",
                    "PITR.BackupSource.StorageName, PITR.BackupSource.S3 and PITR.BackupSource.Azure can't be empty simultaneously",
                ));
            }
        }
        match (self.backup_name.is_empty(), self.backup_source.is_none()) {
            (true, true) => Err(Error::validation_for_field(
                "restore",
                "spec.backupName",
                "backupName and BackupSource can't be empty simultaneously",
            )),
            (false, false) => Err(Error::validation_for_field(
                "restore",
                "spec.backupName",
                "backupName and BackupSource can't be specified simultaneously",
            )),
            _ => Ok(()),
        }
    }
}

/// Status of a PerconaXtraDBClusterRestore
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerconaXtraDBClusterRestoreStatus {
    /// Current stage
    #[serde(default)]
    pub state: RestoreState,

    /// Failure reason or progress note
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comments: String,

    /// Completion time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,

    /// PXC size before the restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pxc_size: Option<i32>,

    /// ProxySQL size before the restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_size: Option<i32>,

    /// HAProxy size before the restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub haproxy_size: Option<i32>,
}

impl PerconaXtraDBClusterRestore {
    /// Current state, New when no status was written yet
    pub fn state(&self) -> RestoreState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// True when the restore replays binlogs
    pub fn pitr_requested(&self) -> bool {
        self.spec.pitr.is_some()
    }
}
