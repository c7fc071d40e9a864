//! Metrics for the backup and restore controllers
//!
//! Instruments are created lazily on the global meter; without an installed
//! meter provider they are no-ops.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("pxc-operator"));

/// Histogram of reconcile duration
///
/// Labels:
/// - `controller`: backup, restore
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("pxc_reconcile_duration_seconds")
        .with_description("Duration of reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconcile errors
///
/// Labels:
/// - `controller`: backup, restore
/// - `error_type`: transient, permanent
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("pxc_reconcile_errors_total")
        .with_description("Total number of reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of backups reaching a terminal state
///
/// Labels:
/// - `state`: succeeded, failed
/// - `storage`: s3, azure, filesystem
pub static BACKUPS_FINISHED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("pxc_backups_finished_total")
        .with_description("Total number of backups that reached a terminal state")
        .with_unit("{backups}")
        .build()
});

/// Counter of restores reaching a terminal state
///
/// Labels:
/// - `state`: succeeded, failed
pub static RESTORES_FINISHED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("pxc_restores_finished_total")
        .with_description("Total number of restores that reached a terminal state")
        .with_unit("{restores}")
        .build()
});

/// Gauge of deletion finalizers currently running
pub static FINALIZERS_IN_FLIGHT: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("pxc_backup_finalizers_in_flight")
        .with_description("Number of backup deletion finalizers currently running")
        .with_unit("{tasks}")
        .build()
});

/// Counter of deletion requests skipped because every worker was busy
pub static FINALIZERS_SKIPPED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("pxc_backup_finalizers_skipped_total")
        .with_description("Deletion requests skipped because all workers were busy")
        .with_unit("{requests}")
        .build()
});

/// Which controller a metric belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerKind {
    /// Backup controller
    Backup,
    /// Restore controller
    Restore,
}

impl ControllerKind {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }
}

/// Times a reconcile and records its outcome
pub struct ReconcileTimer {
    controller: ControllerKind,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconcile
    pub fn start(controller: ControllerKind) -> Self {
        Self {
            controller,
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("controller", self.controller.as_str()),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record a failed reconcile
    pub fn error(self, retryable: bool) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("controller", self.controller.as_str()),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("controller", self.controller.as_str()),
                KeyValue::new("error_type", if retryable { "transient" } else { "permanent" }),
            ],
        );
    }
}

/// Record a backup reaching a terminal state
pub fn record_backup_finished(succeeded: bool, storage: &str) {
    BACKUPS_FINISHED.add(
        1,
        &[
            KeyValue::new("state", if succeeded { "succeeded" } else { "failed" }),
            KeyValue::new("storage", storage.to_string()),
        ],
    );
}

/// Record a restore reaching a terminal state
pub fn record_restore_finished(succeeded: bool) {
    RESTORES_FINISHED.add(
        1,
        &[KeyValue::new("state", if succeeded { "succeeded" } else { "failed" })],
    );
}

/// Update the number of running deletion finalizers
pub fn set_finalizers_in_flight(count: usize) {
    FINALIZERS_IN_FLIGHT.record(count as i64, &[]);
}

/// Record a deletion request skipped by a full worker pool
pub fn record_finalizer_skipped() {
    FINALIZERS_SKIPPED.add(1, &[]);
}
