//! Common types for the PXC operator: CRDs, errors, naming and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod destination;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod naming;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side apply and status patch
pub const FIELD_MANAGER: &str = "pxc-operator";

/// Requeue interval after a failed reconciliation (5 seconds)
pub const REQUEUE_ERROR_SECS: u64 = 5;

/// Requeue interval while waiting on an external condition (5 seconds)
pub const REQUEUE_WAIT_SECS: u64 = 5;
