//! Reasons a reconcile stops early and asks to be called again
//!
//! Neither controller blocks on slow external progress. A step that can't
//! finish yet returns a [`WaitReason`] and the reconcile requeues without
//! touching the status.

use std::fmt;
use std::time::Duration;

use kube::runtime::controller::Action;

use pxc_common::REQUEUE_WAIT_SECS;

/// Something a reconcile is waiting on
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitReason {
    /// The cluster isn't in a state that allows a backup
    ClusterNotBackupReady(String),
    /// Another backup holds the cluster's backup lease
    LeaseHeld {
        /// Identity of the current holder
        holder: String,
    },
    /// Backup files are still being verified
    Validation,
    /// The PVC restore source pod isn't running yet
    SourcePodNotRunning,
    /// Cluster pods are still running after a pause
    PodsRunning,
    /// A restore, PITR or prepare job is still running
    JobRunning(String),
    /// The cluster hasn't come back up after the restore
    ClusterNotReady,
}

impl WaitReason {
    /// Requeue action for this wait
    pub fn action(&self) -> Action {
        Action::requeue(Duration::from_secs(REQUEUE_WAIT_SECS))
    }
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClusterNotBackupReady(reason) => write!(f, "cluster not ready for backup: {reason}"),
            Self::LeaseHeld { holder } => write!(f, "backup lock is held by {holder}"),
            Self::Validation => write!(f, "waiting for backup validation"),
            Self::SourcePodNotRunning => write!(f, "restore source pod is not running"),
            Self::PodsRunning => write!(f, "waiting for cluster pods to stop"),
            Self::JobRunning(job) => write!(f, "job {job} is still running"),
            Self::ClusterNotReady => write!(f, "waiting for cluster to start"),
        }
    }
}
