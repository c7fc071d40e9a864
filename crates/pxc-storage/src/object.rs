//! S3 and Azure implementation on top of `object_store`

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore, WriteMultipart};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{
    collect_stream, join_key, relative_key, ByteStream, StorageClient, StorageError,
    StorageOptions,
};

/// Bodies up to this size go up in a single request
const MULTIPART_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Parts in flight per multipart upload
const UPLOAD_CONCURRENCY: usize = 4;

/// [`StorageClient`] over any `object_store` backend
pub struct ObjectStoreClient {
    store: Arc<dyn ObjectStore>,
    prefix: RwLock<String>,
}

impl ObjectStoreClient {
    /// Build the backend described by `options`
    pub fn new(options: &StorageOptions) -> Result<Self, StorageError> {
        let store: Arc<dyn ObjectStore> = match options {
            StorageOptions::S3(o) => {
                if o.bucket.is_empty() {
                    return Err(StorageError::Config("bucket is not set".to_string()));
                }
                let mut client = ClientOptions::new()
                    .with_allow_invalid_certificates(!o.verify_tls)
                    .with_allow_http(o.endpoint.starts_with("http://"));
                if let Some(pem) = o.ca_bundle.as_deref().filter(|b| !b.is_empty()) {
                    let cert = object_store::Certificate::from_pem(pem)
                        .map_err(|e| StorageError::Config(format!("invalid CA bundle: {e}")))?;
                    client = client.with_root_certificate(cert);
                }

                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(&o.bucket)
                    .with_client_options(client);
                if !o.region.is_empty() {
                    builder = builder.with_region(&o.region);
                }
                if !o.endpoint.is_empty() {
                    builder = builder.with_endpoint(o.endpoint.trim_end_matches('/'));
                }
                if !o.access_key_id.is_empty() {
                    builder = builder
                        .with_access_key_id(&o.access_key_id)
                        .with_secret_access_key(&o.secret_access_key);
                }
                Arc::new(builder.build()?)
            }
            StorageOptions::Azure(o) => {
                if o.container.is_empty() {
                    return Err(StorageError::Config("container is not set".to_string()));
                }
                let mut builder = MicrosoftAzureBuilder::new()
                    .with_container_name(&o.container)
                    .with_account(&o.account)
                    .with_access_key(&o.access_key);
                if !o.endpoint.is_empty() {
                    builder = builder
                        .with_endpoint(o.endpoint.clone())
                        .with_allow_http(o.endpoint.starts_with("http://"));
                }
                Arc::new(builder.build()?)
            }
        };

        Ok(Self::from_store(store, options.prefix()))
    }

    /// Wrap an existing store
    pub fn from_store(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: RwLock::new(prefix.to_string()),
        }
    }

    fn path(&self, name: &str) -> Result<ObjectPath, StorageError> {
        let key = join_key(&self.prefix.read(), name);
        ObjectPath::parse(&key).map_err(|e| StorageError::InvalidPath(e.to_string()))
    }
}

#[async_trait]
impl StorageClient for ObjectStoreClient {
    async fn get_object(&self, name: &str) -> Result<ByteStream, StorageError> {
        let path = self.path(name)?;
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| StorageError::from_backend(name, e))?;
        let name = name.to_string();
        Ok(result
            .into_stream()
            .map_err(move |e| StorageError::from_backend(&name, e))
            .boxed())
    }

    async fn put_object(
        &self,
        name: &str,
        mut body: ByteStream,
        size: u64,
    ) -> Result<(), StorageError> {
        let path = self.path(name)?;
        debug!(object = %path, size, "uploading object");
        if size <= MULTIPART_THRESHOLD {
            let data: Bytes = collect_stream(body).await?;
            self.store.put(&path, data.into()).await?;
            return Ok(());
        }

        let mut writer = WriteMultipart::new(self.store.put_multipart(&path).await?);
        let written = async {
            while let Some(chunk) = body.try_next().await? {
                writer.wait_for_capacity(UPLOAD_CONCURRENCY).await?;
                writer.write(&chunk);
            }
            Ok::<_, StorageError>(())
        }
        .await;

        match written {
            Ok(()) => {
                writer.finish().await?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = writer.abort().await {
                    warn!(object = %path, error = %abort, "failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let root = self.prefix.read().clone();
        let wanted = if root.is_empty() {
            prefix.to_string()
        } else {
            format!("{}{prefix}", if root.ends_with('/') { root.clone() } else { format!("{root}/") })
        };

        // object_store lists whole path segments, so list the directory that
        // contains the prefix and filter on the string prefix.
        let dir = match wanted.rfind('/') {
            Some(idx) => &wanted[..idx],
            None => "",
        };
        let dir_path = if dir.is_empty() {
            None
        } else {
            Some(ObjectPath::parse(dir).map_err(|e| StorageError::InvalidPath(e.to_string()))?)
        };

        let mut names = Vec::new();
        let mut stream = self.store.list(dir_path.as_ref());
        while let Some(meta) = stream.next().await {
            let meta = meta?;
            let key = meta.location.as_ref();
            if key.starts_with(&wanted) {
                names.push(relative_key(&root, key).to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete_object(&self, name: &str) -> Result<(), StorageError> {
        let path = self.path(name)?;
        debug!(object = %path, "deleting object");
        self.store
            .delete(&path)
            .await
            .map_err(|e| StorageError::from_backend(name, e))
    }

    fn set_prefix(&self, prefix: &str) {
        *self.prefix.write() = prefix.to_string();
    }

    fn prefix(&self) -> String {
        self.prefix.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bytes_stream, AzureOptions, S3Options};
    use futures::stream;
    use object_store::memory::InMemory;

    fn client(prefix: &str) -> ObjectStoreClient {
        ObjectStoreClient::from_store(Arc::new(InMemory::new()), prefix)
    }

    #[tokio::test]
    async fn test_put_get_under_prefix() {
        let c = client("pitr/");
        c.put_bytes("binlog_1", Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(c.get_bytes("binlog_1").await.unwrap(), Bytes::from_static(b"data"));

        c.set_prefix("");
        assert_eq!(
            c.get_bytes("pitr/binlog_1").await.unwrap(),
            Bytes::from_static(b"data")
        );
    }

    /// Story: a binlog larger than one request is uploaded in parts straight
    /// from its stream and reads back chunk by chunk
    #[tokio::test]
    async fn story_large_body_uploads_in_parts() {
        let c = client("pitr/");
        let chunks: Vec<Result<Bytes, StorageError>> = (0..8u8)
            .map(|i| Ok(Bytes::from(vec![i; 1024])))
            .collect();
        c.put_object("binlog_1", stream::iter(chunks).boxed(), MULTIPART_THRESHOLD + 1)
            .await
            .unwrap();

        let mut body = c.get_object("binlog_1").await.unwrap();
        let mut total = 0;
        while let Some(chunk) = body.try_next().await.unwrap() {
            total += chunk.len();
        }
        assert_eq!(total, 8 * 1024);
    }

    /// Story: a body that fails halfway leaves no object behind
    #[tokio::test]
    async fn story_failed_stream_aborts_upload() {
        let c = client("");
        let body = stream::iter([
            Ok(Bytes::from_static(b"first part")),
            Err(StorageError::Config("connection reset".to_string())),
        ])
        .boxed();
        let err = c
            .put_object("binlog_1", body, MULTIPART_THRESHOLD + 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
        assert!(c.get_object("binlog_1").await.err().unwrap().is_not_found());

        c.put_object("binlog_2", bytes_stream(Bytes::from_static(b"x")), 1)
            .await
            .unwrap();
        assert_eq!(c.list_objects("binlog_").await.unwrap(), vec!["binlog_2"]);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let c = client("");
        let err = c.get_object("nope").await.err().unwrap();
        assert!(err.is_not_found());
    }

    /// Story: listing by a name prefix that is not a whole directory still
    /// finds binlogs and skips unrelated objects
    #[tokio::test]
    async fn story_list_by_partial_name() {
        let c = client("pitr");
        for name in ["binlog_1", "binlog_1-gtid-set", "binlog_2", "last-binlog-set-abc"] {
            c.put_bytes(name, Bytes::new()).await.unwrap();
        }
        c.set_prefix("");
        c.put_bytes("other/binlog_9", Bytes::new()).await.unwrap();
        c.set_prefix("pitr");

        let names = c.list_objects("binlog_").await.unwrap();
        assert_eq!(names, vec!["binlog_1", "binlog_1-gtid-set", "binlog_2"]);
    }

    #[tokio::test]
    async fn test_list_backup_directory() {
        let c = client("");
        c.put_bytes("c1-full/xtrabackup_info", Bytes::new()).await.unwrap();
        c.put_bytes("c1-full/.sst_info/sst_info", Bytes::new()).await.unwrap();
        c.put_bytes("c1-full.md5", Bytes::new()).await.unwrap();

        let names = c.list_objects("c1-full/").await.unwrap();
        assert_eq!(names, vec!["c1-full/.sst_info/sst_info", "c1-full/xtrabackup_info"]);
    }

    #[test]
    fn test_config_errors() {
        let err = ObjectStoreClient::new(&StorageOptions::S3(S3Options::default()))
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::Config(_)));

        let err = ObjectStoreClient::new(&StorageOptions::Azure(AzureOptions::default()))
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
