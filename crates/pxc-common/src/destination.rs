//! Backup destinations
//!
//! A destination is stored on the backup status as a single string:
//! `pvc/<claim>`, `s3://<bucket>/<prefix><name>` or
//! `azure://<container>/<prefix><name>`. Restores and finalizers only ever
//! see that string, so everything they need is parsed back out of it.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::crd::BackupStorageType;
use crate::naming::PITR_NOT_READY;
use crate::Error;

/// Prefix of PVC destinations
pub const PVC_PREFIX: &str = "pvc/";
/// Prefix of S3 destinations
pub const S3_PREFIX: &str = "s3://";
/// Prefix of Azure destinations
pub const AZURE_PREFIX: &str = "azure://";

/// Where a backup lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    /// A persistent volume claim holding the backup stream
    Pvc {
        /// Claim name
        claim: String,
    },
    /// An S3 key prefix
    S3 {
        /// Bucket name
        bucket: String,
        /// Path prefix inside the bucket, empty or `/`-terminated
        prefix: String,
        /// Backup directory name
        name: String,
    },
    /// An Azure Blob path
    Azure {
        /// Container name
        container: String,
        /// Path prefix inside the container, empty or `/`-terminated
        prefix: String,
        /// Backup directory name
        name: String,
    },
}

impl Destination {
    /// Parse a destination string
    pub fn parse(s: &str) -> Result<Self, Error> {
        if let Some(claim) = s.strip_prefix(PVC_PREFIX) {
            if claim.is_empty() {
                return Err(Error::validation(format!("invalid destination {s}: empty claim name")));
            }
            return Ok(Self::Pvc {
                claim: claim.to_string(),
            });
        }

        let (rest, is_s3) = if let Some(rest) = s.strip_prefix(S3_PREFIX) {
            (rest, true)
        } else if let Some(rest) = s.strip_prefix(AZURE_PREFIX) {
            (rest, false)
        } else {
            return Err(Error::validation(format!("unknown backup storage type in destination {s}")));
        };

        let (bucket, path) = rest
            .split_once('/')
            .ok_or_else(|| Error::validation(format!("invalid destination {s}: missing backup name")))?;
        let path = path.trim_end_matches('/');
        let (prefix, name) = match path.rsplit_once('/') {
            Some((prefix, name)) => (format!("{prefix}/"), name),
            None => (String::new(), path),
        };
        if bucket.is_empty() || name.is_empty() {
            return Err(Error::validation(format!("invalid destination {s}")));
        }

        Ok(if is_s3 {
            Self::S3 {
                bucket: bucket.to_string(),
                prefix,
                name: name.to_string(),
            }
        } else {
            Self::Azure {
                container: bucket.to_string(),
                prefix,
                name: name.to_string(),
            }
        })
    }

    /// Destination of a new PVC backup
    pub fn pvc(claim: impl Into<String>) -> Self {
        Self::Pvc {
            claim: claim.into(),
        }
    }

    /// Destination of a new S3 backup.
    ///
    /// `bucket_path` is the storage's `bucket` field, which may carry a prefix.
    pub fn s3(bucket_path: &str, cluster: &str, created: DateTime<Utc>) -> Self {
        let (bucket, prefix) = split_bucket_path(bucket_path.trim_start_matches(S3_PREFIX));
        Self::S3 {
            bucket,
            prefix,
            name: backup_directory_name(cluster, created),
        }
    }

    /// Destination of a new Azure backup
    pub fn azure(container_path: &str, cluster: &str, created: DateTime<Utc>) -> Self {
        let (container, prefix) = split_bucket_path(container_path.trim_start_matches(AZURE_PREFIX));
        Self::Azure {
            container,
            prefix,
            name: backup_directory_name(cluster, created),
        }
    }

    /// Storage kind
    pub fn storage_type(&self) -> BackupStorageType {
        match self {
            Self::Pvc { .. } => BackupStorageType::Filesystem,
            Self::S3 { .. } => BackupStorageType::S3,
            Self::Azure { .. } => BackupStorageType::Azure,
        }
    }

    /// Bucket or container, `None` for PVC backups
    pub fn bucket(&self) -> Option<&str> {
        match self {
            Self::Pvc { .. } => None,
            Self::S3 { bucket, .. } => Some(bucket),
            Self::Azure { container, .. } => Some(container),
        }
    }

    /// Prefix inside the bucket, empty for PVC backups
    pub fn prefix(&self) -> &str {
        match self {
            Self::Pvc { .. } => "",
            Self::S3 { prefix, .. } | Self::Azure { prefix, .. } => prefix,
        }
    }

    /// Backup directory name (the claim name for PVC backups)
    pub fn backup_name(&self) -> &str {
        match self {
            Self::Pvc { claim } => claim,
            Self::S3 { name, .. } | Self::Azure { name, .. } => name,
        }
    }

    /// Directory holding the backup files, relative to the storage prefix
    pub fn backup_dir(&self) -> String {
        format!("{}/", self.backup_name())
    }

    /// Key of the marker written when binlogs after this backup have a gap,
    /// relative to the storage prefix
    pub fn pitr_not_ready_key(&self) -> String {
        format!("{}.{PITR_NOT_READY}", self.backup_name())
    }

    /// Path passed to the restore job: bucket, prefix and name without the scheme
    pub fn path_without_scheme(&self) -> String {
        match self {
            Self::Pvc { claim } => claim.clone(),
            Self::S3 { bucket, prefix, name } | Self::Azure { container: bucket, prefix, name } => {
                format!("{bucket}/{prefix}{name}")
            }
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pvc { claim } => write!(f, "{PVC_PREFIX}{claim}"),
            Self::S3 { .. } => write!(f, "{S3_PREFIX}{}", self.path_without_scheme()),
            Self::Azure { .. } => write!(f, "{AZURE_PREFIX}{}", self.path_without_scheme()),
        }
    }
}

fn split_bucket_path(path: &str) -> (String, String) {
    match path.split_once('/') {
        Some((bucket, prefix)) => {
            let prefix = prefix.trim_matches('/');
            if prefix.is_empty() {
                (bucket.to_string(), String::new())
            } else {
                (bucket.to_string(), format!("{prefix}/"))
            }
        }
        None => (path.to_string(), String::new()),
    }
}

/// `<cluster>-<YYYY-MM-DD-HH:MM:SS>-full`
pub fn backup_directory_name(cluster: &str, created: DateTime<Utc>) -> String {
    format!("{cluster}-{}-full", created.format("%Y-%m-%d-%H:%M:%S"))
}
