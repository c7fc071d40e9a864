//! Backup deadlines
//!
//! Three independent clocks can fail a backup: how long it may stay New, how
//! long its job may stay Suspended, and how long a Starting backup may take
//! to get a running job. Each deadline comes from the backup, else from the
//! cluster's backup section, else it is disabled.

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use thiserror::Error;

use pxc_common::crd::{BackupState, ClusterBackupSpec, PerconaXtraDBClusterBackup};
use pxc_common::kube_utils::{creation_time, suspended_since};

/// A deadline that ran out
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DeadlineExceeded {
    /// The backup stayed New too long
    #[error("starting deadline seconds exceeded")]
    Starting,
    /// The job stayed suspended too long
    #[error("suspended deadline seconds exceeded")]
    Suspended,
    /// The job took too long to start running
    #[error("running deadline seconds exceeded")]
    Running,
}

/// Effective deadlines of one backup, in seconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadlines {
    /// Limit on the New state
    pub starting: Option<i64>,
    /// Limit on a suspended job
    pub suspended: Option<i64>,
    /// Limit on the Starting state
    pub running: Option<i64>,
}

impl Deadlines {
    /// Per-backup values override the cluster defaults
    pub fn resolve(
        backup: &PerconaXtraDBClusterBackup,
        cluster: Option<&ClusterBackupSpec>,
    ) -> Self {
        let spec = &backup.spec;
        Self {
            starting: spec
                .starting_deadline_seconds
                .or_else(|| cluster.and_then(|c| c.starting_deadline_seconds)),
            suspended: spec
                .suspended_deadline_seconds
                .or_else(|| cluster.and_then(|c| c.suspended_deadline_seconds)),
            running: spec
                .running_deadline_seconds
                .or_else(|| cluster.and_then(|c| c.running_deadline_seconds)),
        }
    }

    /// Check every deadline at `now`, in starting, running, suspended order
    pub fn check(
        &self,
        backup: &PerconaXtraDBClusterBackup,
        job: Option<&Job>,
        now: DateTime<Utc>,
    ) -> Result<(), DeadlineExceeded> {
        let state = backup.state();

        if let (Some(limit), BackupState::New) = (self.starting, state) {
            if let Some(created) = creation_time(&backup.metadata) {
                if elapsed(created, now) >= limit {
                    return Err(DeadlineExceeded::Starting);
                }
            }
        }

        if let (Some(limit), BackupState::Starting, Some(job)) = (self.running, state, job) {
            if let Some(created) = creation_time(&job.metadata) {
                if elapsed(created, now) >= limit {
                    return Err(DeadlineExceeded::Running);
                }
            }
        }

        if let (Some(limit), Some(job)) = (self.suspended, job) {
            if let Some(since) = suspended_since(job) {
                if elapsed(since, now) > limit {
                    return Err(DeadlineExceeded::Suspended);
                }
            }
        }

        Ok(())
    }
}

fn elapsed(from: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - from).num_seconds()
}
