//! Object storage for backups and binlogs
//!
//! [`StorageClient`] is the narrow contract the rest of the operator uses:
//! get, put, list and delete objects relative to a mutable key prefix.
//! Object bodies travel as [`ByteStream`]s so binlogs never have to fit in
//! memory; [`StorageClient::get_bytes`] and [`StorageClient::put_bytes`]
//! cover small metadata objects.
//! [`new_client`] builds the S3 or Azure implementation from
//! [`StorageOptions`]; [`MemoryStorage`] backs tests.

#![deny(missing_docs)]

mod error;
mod memory;
mod object;
mod options;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};

pub use error::StorageError;
pub use memory::MemoryStorage;
pub use object::ObjectStoreClient;
pub use options::{s3_endpoint, AzureOptions, S3Options, StorageOptions, AWS_DEFAULT_HOST};

/// Chunks of an object body
pub type ByteStream = BoxStream<'static, Result<Bytes, StorageError>>;

/// Single-chunk stream over an in-memory body
pub fn bytes_stream(data: Bytes) -> ByteStream {
    stream::once(async move { Ok(data) }).boxed()
}

/// Drain a stream into one buffer
pub async fn collect_stream(body: ByteStream) -> Result<Bytes, StorageError> {
    body.try_fold(BytesMut::new(), |mut acc, chunk| async move {
        acc.extend_from_slice(&chunk);
        Ok(acc)
    })
    .await
    .map(BytesMut::freeze)
}

/// Object storage rooted at a prefix.
///
/// Object names are relative to the current prefix; `list_objects` returns
/// names relative to it as well.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Open an object for reading, `NotFound` when it doesn't exist
    async fn get_object(&self, name: &str) -> Result<ByteStream, StorageError>;

    /// Create or replace an object from a stream of `size` bytes
    ///
    /// `size` is a hint for the upload strategy; the stream decides how
    /// much is written.
    async fn put_object(
        &self,
        name: &str,
        body: ByteStream,
        size: u64,
    ) -> Result<(), StorageError>;

    /// Names of all objects whose key starts with `prefix`, recursively
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Delete an object, `NotFound` when it doesn't exist
    async fn delete_object(&self, name: &str) -> Result<(), StorageError>;

    /// Replace the key prefix
    fn set_prefix(&self, prefix: &str);

    /// Current key prefix
    fn prefix(&self) -> String;

    /// Read a small object into memory
    async fn get_bytes(&self, name: &str) -> Result<Bytes, StorageError> {
        collect_stream(self.get_object(name).await?).await
    }

    /// Write a small in-memory object
    async fn put_bytes(&self, name: &str, data: Bytes) -> Result<(), StorageError> {
        let size = data.len() as u64;
        self.put_object(name, bytes_stream(data), size).await
    }
}

/// Build a client for the configured backend
pub fn new_client(options: &StorageOptions) -> Result<Box<dyn StorageClient>, StorageError> {
    Ok(Box::new(ObjectStoreClient::new(options)?))
}

/// Join a prefix and a name into a storage key
pub(crate) fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    match (prefix.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{prefix}/{name}"),
    }
}

/// Strip `prefix` from a full key, the way names are reported back to callers
pub(crate) fn relative_key<'a>(prefix: &str, key: &'a str) -> &'a str {
    key.strip_prefix(prefix)
        .map(|k| k.trim_start_matches('/'))
        .unwrap_or(key)
}
