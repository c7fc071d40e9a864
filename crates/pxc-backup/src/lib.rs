//! Backup and restore controllers for Percona XtraDB Cluster
//!
//! Two kube-rs controllers share one [`context::Context`]:
//!
//! - [`backup_controller`] runs `PerconaXtraDBClusterBackup` objects as
//!   backup jobs, serializes them per cluster when parallel backups are
//!   disabled and removes deleted backups from storage on a worker pool.
//! - [`restore_controller`] walks a `PerconaXtraDBClusterRestore` through
//!   stopping the cluster, restoring the data, optionally replaying binlogs
//!   and starting the cluster again.

#![deny(missing_docs)]

pub mod backup_controller;
pub mod client;
pub mod context;
pub mod deadline;
pub mod finalizer;
pub mod jobs;
pub mod lease;
pub mod restore_controller;
pub mod restorer;
pub mod storage;
pub mod wait;

pub use context::Context;
