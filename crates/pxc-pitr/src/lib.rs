//! Binlog archiving and point-in-time recovery for Percona XtraDB Cluster
//!
//! The collector uploads every binlog of the cluster to object storage along
//! with its GTID set. The recoverer replays the archived binlogs on top of a
//! restored backup, up to a date, a transaction or the end of the archive.
//! Both modes serve health, metrics and cache invalidation over HTTP.

#![deny(missing_docs)]

pub mod cache;
pub mod collector;
pub mod config;
pub mod database;
pub mod error;
pub mod gtid;
pub mod metrics;
pub mod recoverer;
pub mod server;

pub use error::{PitrError, Result};
