//! Custom Resource Definitions for the PXC operator
//!
//! The backup and restore CRDs are owned by this operator. The cluster CRD is
//! owned elsewhere; only the fields the backup and restore flows use are
//! modeled.

mod backup;
mod cluster;
mod restore;
mod types;

pub use backup::{
    BackupState, PerconaXtraDBClusterBackup, PerconaXtraDBClusterBackupSpec,
    PerconaXtraDBClusterBackupStatus, CONDITION_PITR_READY,
};
pub use cluster::{
    AppState, BackupStorageSpec, ClusterBackupSpec, ComponentStatus, PerconaXtraDBCluster,
    PerconaXtraDBClusterSpec, PerconaXtraDBClusterStatus, PitrSpec, ProxySpec, PxcSpec,
    UnsafeFlags, VERSION_KEEP_VOLUMES, VERSION_PREPARE_JOB,
};
pub use restore::{
    PerconaXtraDBClusterRestore, PerconaXtraDBClusterRestoreSpec,
    PerconaXtraDBClusterRestoreStatus, PitrTarget, PitrType, RestoreState,
};
pub use types::{
    set_condition, AzureStorageSpec, BackupStorageType, Condition, ConditionStatus, PvcTemplate,
    S3StorageSpec, SecretKeyRef, VolumeSpec,
};

/// Serde default helper returning `true`
pub(crate) fn default_true() -> bool {
    true
}
