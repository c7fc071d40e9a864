//! PerconaXtraDBCluster Custom Resource Definition
//!
//! Only the part of the cluster API that backup and restore read or patch is
//! modeled here. Unknown fields are preserved by the API server and ignored
//! on deserialization.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::default_true;
use super::types::{AzureStorageSpec, BackupStorageType, S3StorageSpec, VolumeSpec};
use crate::Error;

/// First version that no longer deletes non-seed volumes during restore
pub const VERSION_KEEP_VOLUMES: &str = "1.15.0";

/// First version that runs a prepare job before the cluster restarts
pub const VERSION_PREPARE_JOB: &str = "1.18.0";

/// State of a cluster or one of its components
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    /// Nothing observed yet
    #[default]
    #[serde(rename = "")]
    Unknown,
    /// Pods are starting
    Initializing,
    /// Cluster is paused
    Paused,
    /// Pods are being stopped
    Stopping,
    /// All members are ready
    Ready,
    /// Reconciliation failed
    Error,
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, ""),
            Self::Initializing => write!(f, "initializing"),
            Self::Paused => write!(f, "paused"),
            Self::Stopping => write!(f, "stopping"),
            Self::Ready => write!(f, "ready"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// PXC statefulset settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PxcSpec {
    /// Number of PXC members
    #[serde(default)]
    pub size: i32,

    /// Database image, also used by the restore jobs
    #[serde(default)]
    pub image: String,
}

/// HAProxy or ProxySQL settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    /// Whether the proxy is deployed
    #[serde(default)]
    pub enabled: bool,

    /// Number of proxy replicas
    #[serde(default)]
    pub size: i32,
}

/// Flags that relax safety checks
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnsafeFlags {
    /// Allow a PXC size below 3
    #[serde(default)]
    pub pxc_size: bool,

    /// Allow a proxy size below 2
    #[serde(default)]
    pub proxy_size: bool,

    /// Run backups while the cluster isn't ready
    #[serde(default)]
    pub backup_if_unhealthy: bool,
}

/// A named storage backups can be written to
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageSpec {
    /// Storage kind
    #[serde(rename = "type")]
    pub type_: BackupStorageType,

    /// S3 settings when `type` is `s3`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3StorageSpec>,

    /// Azure settings when `type` is `azure`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureStorageSpec>,

    /// Volume settings when `type` is `filesystem`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeSpec>,

    /// Verify the storage endpoint's TLS certificate
    #[serde(default, rename = "verifyTLS", skip_serializing_if = "Option::is_none")]
    pub verify_tls: Option<bool>,
}

/// Binlog collector settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PitrSpec {
    /// Whether binlogs are collected
    #[serde(default)]
    pub enabled: bool,

    /// Storage binlogs are uploaded to
    #[serde(default)]
    pub storage_name: String,

    /// Seconds between collector runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_between_uploads: Option<f64>,
}

/// Backup settings of a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBackupSpec {
    /// Backup agent image
    #[serde(default)]
    pub image: String,

    /// Service account used by backup and restore jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Whether backups of this cluster may run concurrently
    #[serde(default = "default_true")]
    pub allow_parallel: bool,

    /// Named storages
    #[serde(default)]
    pub storages: BTreeMap<String, BackupStorageSpec>,

    /// Binlog collection
    #[serde(default)]
    pub pitr: PitrSpec,

    /// Default deadline for a new backup to start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_deadline_seconds: Option<i64>,

    /// Default deadline for a suspended backup job to resume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_deadline_seconds: Option<i64>,

    /// Default deadline for a starting backup to reach Running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_deadline_seconds: Option<i64>,
}

/// Specification of a PerconaXtraDBCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "pxc.percona.com",
    version = "v1",
    kind = "PerconaXtraDBCluster",
    plural = "perconaxtradbclusters",
    shortname = "pxc",
    namespaced,
    status = "PerconaXtraDBClusterStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"PXC","type":"string","jsonPath":".status.pxc.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PerconaXtraDBClusterSpec {
    /// Version of the operator this resource was written for
    #[serde(default)]
    pub cr_version: String,

    /// Stop all members when true
    #[serde(default)]
    pub pause: bool,

    /// PXC members
    #[serde(default)]
    pub pxc: PxcSpec,

    /// HAProxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub haproxy: Option<ProxySpec>,

    /// ProxySQL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxysql: Option<ProxySpec>,

    /// Safety overrides
    #[serde(default, rename = "unsafeFlags")]
    pub unsafe_flags: UnsafeFlags,

    /// Backup settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<ClusterBackupSpec>,
}

/// Observed state of one component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ComponentStatus {
    /// Component state
    #[serde(default)]
    pub status: AppState,

    /// Ready members
    #[serde(default)]
    pub ready: i32,

    /// Desired members
    #[serde(default)]
    pub size: i32,
}

/// Status of a PerconaXtraDBCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerconaXtraDBClusterStatus {
    /// PXC members
    #[serde(default)]
    pub pxc: ComponentStatus,

    /// Overall state
    #[serde(default, rename = "state")]
    pub state: AppState,

    /// Generation last handled by the cluster controller
    #[serde(default)]
    pub observed_generation: i64,
}

impl PerconaXtraDBCluster {
    /// True when the HAProxy deployment is enabled
    pub fn haproxy_enabled(&self) -> bool {
        self.spec.haproxy.as_ref().is_some_and(|p| p.enabled)
    }

    /// True when the ProxySQL deployment is enabled
    pub fn proxysql_enabled(&self) -> bool {
        self.spec.proxysql.as_ref().is_some_and(|p| p.enabled)
    }

    /// True when binlog collection is enabled
    pub fn pitr_enabled(&self) -> bool {
        self.spec.backup.as_ref().is_some_and(|b| b.pitr.enabled)
    }

    /// Compare `crVersion` against `version`.
    ///
    /// An empty or unparsable `crVersion` is treated as the newest version.
    pub fn version_at_least(&self, version: &str) -> bool {
        let wanted = match semver::Version::parse(version) {
            Ok(v) => v,
            Err(_) => return false,
        };
        match semver::Version::parse(self.spec.cr_version.trim_start_matches('v')) {
            Ok(current) => current >= wanted,
            Err(_) => true,
        }
    }

    /// Named storage, or a validation error naming the missing storage
    pub fn storage(&self, name: &str) -> Result<&BackupStorageSpec, Error> {
        self.spec
            .backup
            .as_ref()
            .and_then(|b| b.storages.get(name))
            .ok_or_else(|| Error::validation_for_field(
                self.metadata.name.clone().unwrap_or_default(),
                "spec.backup.storages",
                format!("storage {name} doesn't exist"),
            ))
    }

    /// Whether a backup can run against the cluster right now.
    ///
    /// Returns the reason when it can't.
    pub fn can_backup(&self) -> Result<(), String> {
        let status = self.status.clone().unwrap_or_default();
        if status.state == AppState::Ready {
            return Ok(());
        }
        if !self.spec.unsafe_flags.backup_if_unhealthy {
            return Err(format!(
                "unsafe.backupIfUnhealthy must be true to run backup on cluster with status {}",
                status.state
            ));
        }
        if status.pxc.ready < 1 {
            return Err("there are no ready PXC nodes".to_string());
        }
        Ok(())
    }

    /// True when the cluster controller has caught up with the latest spec
    /// and the PXC members are ready
    pub fn is_ready_after_restart(&self) -> bool {
        let generation = self.metadata.generation.unwrap_or_default();
        self.status.as_ref().is_some_and(|s| {
            s.observed_generation == generation && s.pxc.status == AppState::Ready
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(yaml: &str) -> PerconaXtraDBCluster {
        let spec: PerconaXtraDBClusterSpec = serde_yaml::from_str(yaml).unwrap();
        PerconaXtraDBCluster::new("cluster1", spec)
    }

    #[test]
    fn test_parse_backup_section() {
        let c = cluster(
            r#"
crVersion: 1.16.0
pxc:
  size: 3
  image: percona/percona-xtradb-cluster:8.0
haproxy:
  enabled: true
  size: 2
backup:
  image: percona/percona-xtradb-cluster-operator:1.16.0-pxc8.0-backup
  allowParallel: false
  startingDeadlineSeconds: 300
  pitr:
    enabled: true
    storageName: s3-us-west-binlogs
  storages:
    s3-us-west:
      type: s3
      verifyTLS: false
      s3:
        bucket: operator-testing/prefix
        credentialsSecret: my-cluster-name-backup-s3
        region: us-west-2
    fs-pvc:
      type: filesystem
      volume:
        persistentVolumeClaim:
          size: 10Gi
"#,
        );

        let backup = c.spec.backup.as_ref().unwrap();
        assert!(!backup.allow_parallel);
        assert_eq!(backup.starting_deadline_seconds, Some(300));
        assert!(c.pitr_enabled());
        assert!(c.haproxy_enabled());
        assert!(!c.proxysql_enabled());

        let s3 = c.storage("s3-us-west").unwrap();
        assert_eq!(s3.type_, BackupStorageType::S3);
        assert_eq!(s3.verify_tls, Some(false));
        assert_eq!(s3.s3.as_ref().unwrap().region, "us-west-2");

        assert_eq!(
            c.storage("fs-pvc").unwrap().type_,
            BackupStorageType::Filesystem
        );
    }

    #[test]
    fn test_missing_storage_is_a_validation_error() {
        let c = cluster("backup:\n  image: img\n");
        let err = c.storage("nope").unwrap_err();
        assert!(err.to_string().contains("storage nope doesn't exist"));
    }

    #[test]
    fn test_allow_parallel_defaults_to_true() {
        let c = cluster("backup:\n  image: img\n");
        assert!(c.spec.backup.unwrap().allow_parallel);
    }

    #[test]
    fn test_version_gates() {
        let old = cluster("crVersion: 1.14.0\n");
        assert!(!old.version_at_least(VERSION_KEEP_VOLUMES));

        let mid = cluster("crVersion: 1.15.0\n");
        assert!(mid.version_at_least(VERSION_KEEP_VOLUMES));
        assert!(!mid.version_at_least(VERSION_PREPARE_JOB));

        let new = cluster("crVersion: 1.18.0\n");
        assert!(new.version_at_least(VERSION_PREPARE_JOB));
    }

    /// Story: an unhealthy cluster only accepts backups when explicitly allowed
    /// and at least one member is ready
    #[test]
    fn story_backup_on_unhealthy_cluster() {
        let mut c = cluster("pxc:\n  size: 3\n");
        c.status = Some(PerconaXtraDBClusterStatus {
            state: AppState::Initializing,
            ..Default::default()
        });
        let reason = c.can_backup().unwrap_err();
        assert!(reason.contains("unsafe.backupIfUnhealthy"));

        c.spec.unsafe_flags.backup_if_unhealthy = true;
        assert_eq!(c.can_backup().unwrap_err(), "there are no ready PXC nodes");

        c.status.as_mut().unwrap().pxc.ready = 1;
        assert!(c.can_backup().is_ok());

        c.spec.unsafe_flags.backup_if_unhealthy = false;
        c.status.as_mut().unwrap().state = AppState::Ready;
        assert!(c.can_backup().is_ok());
    }

    #[test]
    fn test_ready_after_restart_requires_observed_generation() {
        let mut c = cluster("pxc:\n  size: 3\n");
        c.metadata.generation = Some(4);
        c.status = Some(PerconaXtraDBClusterStatus {
            pxc: ComponentStatus {
                status: AppState::Ready,
                ready: 3,
                size: 3,
            },
            state: AppState::Ready,
            observed_generation: 3,
        });
        assert!(!c.is_ready_after_restart());

        c.status.as_mut().unwrap().observed_generation = 4;
        assert!(c.is_ready_after_restart());
    }

    #[test]
    fn test_app_state_wire_names() {
        let s: PerconaXtraDBClusterStatus =
            serde_json::from_str(r#"{"state":"ready","pxc":{"status":"initializing","ready":1}}"#)
                .unwrap();
        assert_eq!(s.state, AppState::Ready);
        assert_eq!(s.pxc.status, AppState::Initializing);

        let s: PerconaXtraDBClusterStatus = serde_json::from_str(r#"{"state":""}"#).unwrap();
        assert_eq!(s.state, AppState::Unknown);
    }
}
