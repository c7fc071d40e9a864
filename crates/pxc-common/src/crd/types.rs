//! Types shared by the cluster, backup and restore CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Kind of storage a backup is written to
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupStorageType {
    /// Persistent volume claim owned by the backup
    #[default]
    Filesystem,
    /// S3-compatible object storage
    S3,
    /// Azure Blob storage
    Azure,
}

impl std::fmt::Display for BackupStorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filesystem => write!(f, "filesystem"),
            Self::S3 => write!(f, "s3"),
            Self::Azure => write!(f, "azure"),
        }
    }
}

/// Reference to a key inside a secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SecretKeyRef {
    /// Secret name
    pub name: String,
    /// Key within the secret
    pub key: String,
}

/// S3 storage configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3StorageSpec {
    /// Bucket, optionally followed by a path prefix (`bucket/some/prefix`)
    pub bucket: String,

    /// Secret holding `AWS_ACCESS_KEY_ID` and `AWS_SECRET_ACCESS_KEY`
    #[serde(default)]
    pub credentials_secret: String,

    /// Region
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,

    /// Endpoint of an S3-compatible service
    #[serde(default, rename = "endpointUrl", skip_serializing_if = "String::is_empty")]
    pub endpoint_url: String,

    /// CA bundle used to verify the endpoint certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<SecretKeyRef>,
}

impl S3StorageSpec {
    /// Split `bucket` into the bucket name and a `/`-terminated prefix
    pub fn bucket_and_prefix(&self) -> (String, String) {
        split_container_path(&self.bucket)
    }
}

/// Azure Blob storage configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureStorageSpec {
    /// Container, optionally followed by a path prefix
    #[serde(rename = "container")]
    pub container_path: String,

    /// Secret holding `AZURE_STORAGE_ACCOUNT_NAME` and `AZURE_STORAGE_ACCOUNT_KEY`
    #[serde(default)]
    pub credentials_secret: String,

    /// Blob endpoint
    #[serde(default, rename = "endpointUrl", skip_serializing_if = "String::is_empty")]
    pub endpoint: String,

    /// Access tier of uploaded blobs
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_class: String,
}

impl AzureStorageSpec {
    /// Split `container` into the container name and a `/`-terminated prefix
    pub fn container_and_prefix(&self) -> (String, String) {
        split_container_path(&self.container_path)
    }
}

fn split_container_path(path: &str) -> (String, String) {
    match path.split_once('/') {
        Some((bucket, prefix)) => {
            let prefix = prefix.trim_end_matches('/');
            if prefix.is_empty() {
                (bucket.to_string(), String::new())
            } else {
                (bucket.to_string(), format!("{prefix}/"))
            }
        }
        None => (path.to_string(), String::new()),
    }
}

/// Volume used by filesystem backups
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Claim template for the per-backup PVC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PvcTemplate>,
}

/// Minimal persistent volume claim template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PvcTemplate {
    /// Storage class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Requested size (e.g. "6Gi")
    #[serde(default = "default_pvc_size")]
    pub size: String,

    /// Access modes, `ReadWriteOnce` when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
}

fn default_pvc_size() -> String {
    "6Gi".to_string()
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., PITRReady)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Set `condition` in `conditions`, keeping the transition time when the
/// status didn't change.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) if existing.status == condition.status => {
            existing.reason = condition.reason;
            existing.message = condition.message;
        }
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_and_prefix() {
        let s3 = S3StorageSpec {
            bucket: "operator-testing/some/prefix/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            s3.bucket_and_prefix(),
            ("operator-testing".to_string(), "some/prefix/".to_string())
        );

        let s3 = S3StorageSpec {
            bucket: "operator-testing".to_string(),
            ..Default::default()
        };
        assert_eq!(
            s3.bucket_and_prefix(),
            ("operator-testing".to_string(), String::new())
        );
    }

    #[test]
    fn test_container_and_prefix() {
        let azure = AzureStorageSpec {
            container_path: "backups/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            azure.container_and_prefix(),
            ("backups".to_string(), String::new())
        );
    }

    #[test]
    fn test_storage_type_wire_names() {
        let t: BackupStorageType = serde_json::from_str("\"filesystem\"").unwrap();
        assert_eq!(t, BackupStorageType::Filesystem);
        assert_eq!(serde_json::to_string(&BackupStorageType::S3).unwrap(), "\"s3\"");
        assert_eq!(BackupStorageType::Azure.to_string(), "azure");
    }

    /// Story: re-reporting the same condition doesn't move its transition time
    #[test]
    fn story_condition_transition_time_is_stable() {
        let mut conditions = vec![];
        set_condition(
            &mut conditions,
            Condition::new("PITRReady", ConditionStatus::False, "BinlogGapDetected", "gap"),
        );
        let first = conditions[0].last_transition_time;

        set_condition(
            &mut conditions,
            Condition::new("PITRReady", ConditionStatus::False, "BinlogGapDetected", "still a gap"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions[0].message, "still a gap");

        set_condition(
            &mut conditions,
            Condition::new("PITRReady", ConditionStatus::True, "Ready", ""),
        );
        assert_eq!(conditions[0].status, ConditionStatus::True);
    }
}
