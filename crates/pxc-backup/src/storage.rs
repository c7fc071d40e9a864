//! Storage clients for backups and binlog archives
//!
//! Storage settings live in the cluster spec or in a backup's status;
//! credentials live in secrets. This module joins the two into
//! [`StorageOptions`] and hands them to a [`StorageProvider`].

use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

use pxc_common::crd::{
    AzureStorageSpec, BackupStorageSpec, BackupStorageType, PerconaXtraDBCluster,
    PerconaXtraDBClusterBackupStatus, S3StorageSpec,
};
use pxc_common::destination::Destination;
use pxc_common::kube_utils::secret_string;
use pxc_common::Error;
use pxc_storage::{s3_endpoint, AzureOptions, S3Options, StorageClient, StorageOptions};

use crate::client::KubeClient;

/// S3 access key id key in the credentials secret
pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
/// S3 secret key key in the credentials secret
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
/// Azure account name key in the credentials secret
pub const AZURE_STORAGE_ACCOUNT_NAME: &str = "AZURE_STORAGE_ACCOUNT_NAME";
/// Azure account key key in the credentials secret
pub const AZURE_STORAGE_ACCOUNT_KEY: &str = "AZURE_STORAGE_ACCOUNT_KEY";

/// Builds storage clients from resolved options
#[cfg_attr(test, automock)]
pub trait StorageProvider: Send + Sync {
    /// Connect to the storage described by `options`
    fn client(&self, options: &StorageOptions) -> Result<Arc<dyn StorageClient>, Error>;
}

/// Provider backed by `object_store`
pub struct ObjectStorageProvider;

impl StorageProvider for ObjectStorageProvider {
    fn client(&self, options: &StorageOptions) -> Result<Arc<dyn StorageClient>, Error> {
        pxc_storage::new_client(options)
            .map(Arc::from)
            .map_err(|e| Error::storage_permanent(format!("new storage client: {e}")))
    }
}

/// Storage settings recorded on a backup, with the cluster's TLS override.
///
/// The `verifyTLS` of the named storage in the cluster wins over the value
/// copied into the backup status.
pub fn backup_storage_spec(
    status: &PerconaXtraDBClusterBackupStatus,
    cluster: Option<&PerconaXtraDBCluster>,
) -> BackupStorageSpec {
    let cluster_verify = cluster
        .and_then(|c| c.spec.backup.as_ref())
        .and_then(|b| b.storages.get(&status.storage_name))
        .and_then(|s| s.verify_tls);

    BackupStorageSpec {
        type_: status.storage_type().unwrap_or_default(),
        s3: status.s3.clone(),
        azure: status.azure.clone(),
        volume: None,
        verify_tls: cluster_verify.or(status.verify_tls),
    }
}

/// Resolve credentials and location of a storage.
///
/// `destination` pins bucket and prefix to where a backup was actually
/// written. Filesystem storages have no client and resolve to `None`.
pub async fn resolve_options(
    kube: &dyn KubeClient,
    namespace: &str,
    spec: &BackupStorageSpec,
    destination: Option<&Destination>,
) -> Result<Option<StorageOptions>, Error> {
    match spec.type_ {
        BackupStorageType::Filesystem => Ok(None),
        BackupStorageType::S3 => {
            let s3 = spec
                .s3
                .as_ref()
                .ok_or_else(|| Error::validation("s3 storage has no s3 settings"))?;
            let verify_tls = spec.verify_tls.unwrap_or(true);
            s3_options(kube, namespace, s3, verify_tls, destination)
                .await
                .map(|o| Some(StorageOptions::S3(o)))
        }
        BackupStorageType::Azure => {
            let azure = spec
                .azure
                .as_ref()
                .ok_or_else(|| Error::validation("azure storage has no azure settings"))?;
            azure_options(kube, namespace, azure, destination)
                .await
                .map(|o| Some(StorageOptions::Azure(o)))
        }
    }
}

fn location(spec_path: (String, String), destination: Option<&Destination>) -> (String, String) {
    match destination.and_then(|d| d.bucket().map(|b| (b.to_string(), d.prefix().to_string()))) {
        Some(location) => location,
        None => spec_path,
    }
}

async fn s3_options(
    kube: &dyn KubeClient,
    namespace: &str,
    s3: &S3StorageSpec,
    verify_tls: bool,
    destination: Option<&Destination>,
) -> Result<S3Options, Error> {
    // No secret means instance credentials (IAM roles)
    let secret = if s3.credentials_secret.is_empty() {
        None
    } else {
        kube.get_secret(&s3.credentials_secret, namespace).await?
    };
    let read = |key: &str| {
        secret
            .as_ref()
            .and_then(|s| secret_string(s, key))
            .unwrap_or_default()
    };

    let ca_bundle = match &s3.ca_bundle {
        Some(reference) => {
            let secret = kube
                .get_secret(&reference.name, namespace)
                .await?
                .ok_or_else(|| Error::validation(format!("secret {} not found", reference.name)))?;
            let bundle = secret
                .data
                .as_ref()
                .and_then(|d| d.get(&reference.key))
                .map(|v| v.0.clone())
                .ok_or_else(|| {
                    Error::validation(format!(
                        "key {} not found in secret {}",
                        reference.key, reference.name
                    ))
                })?;
            Some(bundle)
        }
        None => None,
    };

    let (bucket, prefix) = location(s3.bucket_and_prefix(), destination);
    Ok(S3Options {
        bucket,
        prefix,
        region: s3.region.clone(),
        endpoint: s3_endpoint(&s3.endpoint_url),
        access_key_id: read(AWS_ACCESS_KEY_ID),
        secret_access_key: read(AWS_SECRET_ACCESS_KEY),
        verify_tls,
        ca_bundle,
    })
}

async fn azure_options(
    kube: &dyn KubeClient,
    namespace: &str,
    azure: &AzureStorageSpec,
    destination: Option<&Destination>,
) -> Result<AzureOptions, Error> {
    let secret = kube
        .get_secret(&azure.credentials_secret, namespace)
        .await?
        .ok_or_else(|| {
            Error::validation(format!("secret {} not found", azure.credentials_secret))
        })?;
    let account = secret_string(&secret, AZURE_STORAGE_ACCOUNT_NAME).unwrap_or_default();
    let access_key = secret_string(&secret, AZURE_STORAGE_ACCOUNT_KEY).unwrap_or_default();

    let endpoint = if azure.endpoint.is_empty() {
        format!("https://{account}.blob.core.windows.net/")
    } else {
        azure.endpoint.clone()
    };

    let (container, prefix) = location(azure.container_and_prefix(), destination);
    Ok(AzureOptions {
        container,
        prefix,
        account,
        access_key,
        endpoint,
    })
}

/// Connect to the storage a backup was written to
pub async fn backup_storage(
    kube: &dyn KubeClient,
    provider: &dyn StorageProvider,
    namespace: &str,
    status: &PerconaXtraDBClusterBackupStatus,
    cluster: Option<&PerconaXtraDBCluster>,
) -> Result<Option<Arc<dyn StorageClient>>, Error> {
    let spec = backup_storage_spec(status, cluster);
    let destination = status.destination();
    match resolve_options(kube, namespace, &spec, destination.as_ref()).await? {
        Some(options) => provider.client(&options).map(Some),
        None => Ok(None),
    }
}

/// Connect to one of the cluster's named storages
pub async fn cluster_storage(
    kube: &dyn KubeClient,
    provider: &dyn StorageProvider,
    namespace: &str,
    cluster: &PerconaXtraDBCluster,
    storage_name: &str,
) -> Result<Option<Arc<dyn StorageClient>>, Error> {
    let spec = cluster.storage(storage_name)?;
    match resolve_options(kube, namespace, spec, None).await? {
        Some(options) => provider.client(&options).map(Some),
        None => Ok(None),
    }
}
