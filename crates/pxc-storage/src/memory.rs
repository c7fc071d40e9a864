//! In-process storage used by tests

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::{
    bytes_stream, collect_stream, join_key, relative_key, ByteStream, StorageClient, StorageError,
};

/// [`StorageClient`] keeping objects in a map
///
/// `fail_next` makes the next N calls fail with a backend error, which lets
/// tests drive retry paths.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, Bytes>>,
    prefix: RwLock<String>,
    failures: Mutex<u32>,
}

impl MemoryStorage {
    /// Empty storage with no prefix
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty storage rooted at `prefix`
    pub fn with_prefix(prefix: &str) -> Self {
        let storage = Self::default();
        storage.set_prefix(prefix);
        storage
    }

    /// Store an object under its full key, ignoring the prefix
    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        self.objects.lock().insert(key.to_string(), data.into());
    }

    /// True when the full key exists
    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }

    /// All full keys, sorted
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    /// Fail the next `count` operations
    pub fn fail_next(&self, count: u32) {
        *self.failures.lock() = count;
    }

    fn check_failure(&self) -> Result<(), StorageError> {
        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(StorageError::Backend(object_store::Error::Generic {
                store: "memory",
                source: "injected failure".into(),
            }));
        }
        Ok(())
    }

    fn key(&self, name: &str) -> String {
        join_key(&self.prefix.read(), name)
    }
}

#[async_trait]
impl StorageClient for MemoryStorage {
    async fn get_object(&self, name: &str) -> Result<ByteStream, StorageError> {
        self.check_failure()?;
        let key = self.key(name);
        let data = self
            .objects
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                name: name.to_string(),
            })?;
        Ok(bytes_stream(data))
    }

    async fn put_object(
        &self,
        name: &str,
        body: ByteStream,
        _size: u64,
    ) -> Result<(), StorageError> {
        self.check_failure()?;
        let key = self.key(name);
        let data = collect_stream(body).await?;
        self.objects.lock().insert(key, data);
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.check_failure()?;
        let root = self.prefix.read().clone();
        let wanted = if root.is_empty() {
            prefix.to_string()
        } else {
            format!("{}/{prefix}", root.trim_end_matches('/'))
        };
        Ok(self
            .objects
            .lock()
            .keys()
            .filter(|k| k.starts_with(&wanted))
            .map(|k| relative_key(&root, k).to_string())
            .collect())
    }

    async fn delete_object(&self, name: &str) -> Result<(), StorageError> {
        self.check_failure()?;
        let key = self.key(name);
        match self.objects.lock().remove(&key) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    fn set_prefix(&self, prefix: &str) {
        *self.prefix.write() = prefix.to_string();
    }

    fn prefix(&self) -> String {
        self.prefix.read().clone()
    }
}
