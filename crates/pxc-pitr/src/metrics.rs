//! Binlog collector metrics

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Meter};

static METER: Lazy<Meter> = Lazy::new(|| global::meter("pxc-pitr"));

/// Successful collection cycles
pub static COLLECT_SUCCESS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("pxc_binlog_collector_success_total")
        .with_description("Total number of successful binlog collection cycles")
        .build()
});

/// Failed collection cycles
pub static COLLECT_FAILURE: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("pxc_binlog_collector_failure_total")
        .with_description("Total number of failed binlog collection cycles")
        .build()
});

/// Binlogs uploaded
pub static UPLOADED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("pxc_binlog_collector_uploaded_total")
        .with_description("Total number of successfully uploaded binlogs")
        .build()
});

/// Gaps detected between the archive and the server's binlogs
pub static GAP_DETECTED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("pxc_binlog_collector_gap_detected_total")
        .with_description("Total number of times a gap was detected in binlogs")
        .build()
});

/// Unix time of the last completed processing cycle
pub static LAST_PROCESSING: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("pxc_binlog_collector_last_processing_timestamp")
        .with_description("Timestamp of the last successful binlog processing")
        .with_unit("s")
        .build()
});

/// Unix time of the last uploaded binlog
pub static LAST_UPLOAD: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("pxc_binlog_collector_last_upload_timestamp")
        .with_description("Timestamp of the last successful binlog upload")
        .with_unit("s")
        .build()
});

fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Record one uploaded binlog
pub fn record_upload() {
    UPLOADED.add(1, &[]);
    LAST_UPLOAD.record(now(), &[]);
}

/// Record the end of a processing cycle that found nothing left to do
pub fn record_processed() {
    LAST_PROCESSING.record(now(), &[]);
}
