//! Per-host cache of binlog GTID sets
//!
//! Computing a binlog's GTID set means reading the whole file on the server,
//! so results are persisted as one JSON document in the binlog storage.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use pxc_storage::StorageClient;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;

/// Object name of the cache document
pub const CACHE_KEY: &str = "gtid-binlog-cache.json";

const CACHE_VERSION: u32 = 1;

/// Binlog file name to GTID set for one host
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BinlogCacheEntry {
    /// binlog name -> gtid set
    pub binlogs: BTreeMap<String, String>,
}

impl BinlogCacheEntry {
    /// Cached set of a binlog
    pub fn get(&self, binlog: &str) -> Option<&str> {
        self.binlogs.get(binlog).map(String::as_str)
    }

    /// Remember the set of a binlog
    pub fn set(&mut self, binlog: &str, gtid_set: &str) {
        self.binlogs.insert(binlog.to_string(), gtid_set.to_string());
    }
}

/// The persisted cache document
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HostBinlogCache {
    /// host -> binlogs
    pub entries: BTreeMap<String, BinlogCacheEntry>,
    /// Document format version
    pub version: u32,
    /// Time of the last save
    pub last_updated_at: DateTime<Utc>,
}

impl Default for HostBinlogCache {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            version: CACHE_VERSION,
            last_updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl HostBinlogCache {
    /// Load the document, starting empty when it doesn't exist yet
    pub async fn load(storage: &dyn StorageClient, key: &str) -> Result<Self> {
        match storage.get_bytes(key).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.is_not_found() => {
                warn!(key, "binlog cache not found, starting empty");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stamp and store the document
    pub async fn save(&mut self, storage: &dyn StorageClient, key: &str) -> Result<()> {
        info!(key, hosts = self.entries.len(), "updating binlog cache");
        self.last_updated_at = Utc::now();
        let data = serde_json::to_vec(self)?;
        storage.put_bytes(key, Bytes::from(data)).await?;
        Ok(())
    }

    /// Forget everything cached for `host`; false when nothing was
    pub fn invalidate_host(&mut self, host: &str) -> bool {
        self.entries.remove(host).is_some()
    }
}

/// Drop the entries of every host `matches` accepts and store the document
/// if anything changed. Returns the hosts that were dropped.
pub async fn invalidate_hosts(
    storage: &dyn StorageClient,
    key: &str,
    matches: impl Fn(&str) -> bool,
) -> Result<Vec<String>> {
    let mut cache = HostBinlogCache::load(storage, key).await?;
    let hosts: Vec<String> = cache
        .entries
        .keys()
        .filter(|h| matches(h.as_str()))
        .cloned()
        .collect();
    if hosts.is_empty() {
        return Ok(hosts);
    }

    for host in &hosts {
        cache.invalidate_host(host);
    }
    cache.save(storage, key).await?;
    info!(key, hosts = ?hosts, "binlog cache invalidated");
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pxc_storage::MemoryStorage;

    #[tokio::test]
    async fn test_load_missing_starts_empty() {
        let storage = MemoryStorage::new();
        let cache = HostBinlogCache::load(&storage, CACHE_KEY).await.unwrap();
        assert!(cache.entries.is_empty());
        assert_eq!(cache.version, 1);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let storage = MemoryStorage::with_prefix("binlogs");
        let mut cache = HostBinlogCache::default();
        cache
            .entries
            .entry("cluster1-pxc-0".to_string())
            .or_default()
            .set("binlog.000001", "src:1-10");
        cache.save(&storage, CACHE_KEY).await.unwrap();
        assert!(storage.contains("binlogs/gtid-binlog-cache.json"));

        let loaded = HostBinlogCache::load(&storage, CACHE_KEY).await.unwrap();
        assert_eq!(
            loaded.entries["cluster1-pxc-0"].get("binlog.000001"),
            Some("src:1-10")
        );
        assert!(loaded.last_updated_at > DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn test_document_format() {
        let doc = r#"{"entries":{"h":{"binlogs":{"binlog.000002":"a:1-2"}}},"version":1,"last_updated_at":"2024-05-01T10:00:00Z"}"#;
        let cache: HostBinlogCache = serde_json::from_str(doc).unwrap();
        assert_eq!(cache.entries["h"].get("binlog.000002"), Some("a:1-2"));
    }

    #[test]
    fn test_invalidate() {
        let mut cache = HostBinlogCache::default();
        cache.entries.insert("h".to_string(), BinlogCacheEntry::default());
        cache.entries.insert("other".to_string(), BinlogCacheEntry::default());
        assert!(cache.invalidate_host("h"));
        assert!(!cache.invalidate_host("h"));
        assert!(cache.entries.contains_key("other"));
    }

    /// Story: invalidating one host keeps the sets cached for the others in
    /// the stored document
    #[tokio::test]
    async fn story_invalidate_one_host_keeps_others() {
        let storage = MemoryStorage::new();
        let mut cache = HostBinlogCache::default();
        for host in ["cluster1-pxc-0", "cluster1-pxc-1"] {
            cache
                .entries
                .entry(host.to_string())
                .or_default()
                .set("binlog.000001", "src:1-10");
        }
        cache.save(&storage, CACHE_KEY).await.unwrap();

        let dropped = invalidate_hosts(&storage, CACHE_KEY, |h| h == "cluster1-pxc-0")
            .await
            .unwrap();
        assert_eq!(dropped, vec!["cluster1-pxc-0"]);

        let loaded = HostBinlogCache::load(&storage, CACHE_KEY).await.unwrap();
        assert!(!loaded.entries.contains_key("cluster1-pxc-0"));
        assert_eq!(
            loaded.entries["cluster1-pxc-1"].get("binlog.000001"),
            Some("src:1-10")
        );
    }

    #[tokio::test]
    async fn test_invalidate_hosts_without_document() {
        let storage = MemoryStorage::new();
        let dropped = invalidate_hosts(&storage, CACHE_KEY, |_| true).await.unwrap();
        assert!(dropped.is_empty());
        assert!(!storage.contains(CACHE_KEY));
    }
}
