//! Binlog collector
//!
//! Each cycle uploads the binlogs written since the last uploaded one. The
//! position is recovered from storage every cycle (`last-binlog-set-<source>`
//! objects), so restarts and failovers resume where the archive ends. When
//! the archive's last set can't be found on the node any more, the collector
//! records a gap marker and uploads what it has.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use pxc_storage::{ByteStream, StorageClient, StorageError};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::cache::HostBinlogCache;
use crate::database::{Binlog, BinlogDatabase};
use crate::error::{PitrError, Result};
use crate::gtid::{source_id, GtidSet};
use crate::metrics;

/// Object name prefix of the per-source "last uploaded set" markers
pub const LAST_SET_PREFIX: &str = "last-binlog-set-";

/// Suffix of the sidecar object holding a binlog's GTID set
pub const GTID_SET_SUFFIX: &str = "-gtid-set";

/// Object name prefix of uploaded binlogs
pub const BINLOG_PREFIX: &str = "binlog_";

/// Port of the PXC admin interface used for binlog streaming
pub const ADMIN_PORT: u16 = 33062;

/// Content of one binlog on its way to storage
pub struct BinlogStream {
    /// File content
    pub body: ByteStream,
    /// Length in bytes
    pub size: u64,
}

/// Reads the raw content of a binlog from a node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BinlogFetcher: Send + Sync {
    /// Binlog file as stored on `host`
    async fn fetch(&self, host: &str, binlog: &str) -> Result<BinlogStream>;
}

/// Stream `name` out of `dir`; the directory is removed once the stream is dropped
async fn scratch_file_stream(dir: TempDir, name: &str) -> Result<BinlogStream> {
    let file = tokio::fs::File::open(dir.path().join(name)).await?;
    let size = file.metadata().await?.len();
    let body = ReaderStream::new(file)
        .map(move |chunk| {
            let _scratch = &dir;
            chunk.map_err(StorageError::from)
        })
        .boxed();
    Ok(BinlogStream { body, size })
}

/// [`BinlogFetcher`] running `mysqlbinlog --raw` into a scratch directory
pub struct MysqlBinlogFetcher {
    user: String,
    password: String,
}

impl MysqlBinlogFetcher {
    /// Fetcher authenticating as `user`
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl BinlogFetcher for MysqlBinlogFetcher {
    async fn fetch(&self, host: &str, binlog: &str) -> Result<BinlogStream> {
        let dir = tempfile::tempdir()?;
        let output = Command::new("mysqlbinlog")
            .args(["-R", "-P", ADMIN_PORT.to_string().as_str(), "--raw"])
            .arg(format!("-h{host}"))
            .arg(format!("-u{}", self.user))
            .arg(binlog)
            .env("MYSQL_PWD", &self.password)
            .current_dir(dir.path())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(PitrError::command(
                "mysqlbinlog",
                format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        scratch_file_stream(dir, binlog).await
    }
}

/// Collector settings that don't change between cycles
#[derive(Clone, Debug)]
pub struct CollectorOptions {
    /// Object name of the GTID cache document
    pub cache_key: String,
    /// Local gap marker file
    pub gap_path: PathBuf,
    /// Local file with first and last uploaded timestamps
    pub timeline_path: PathBuf,
    /// Upper bound of one cycle once the cache is warm
    pub timeout: Duration,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            cache_key: crate::cache::CACHE_KEY.to_string(),
            gap_path: PathBuf::from(pxc_common::naming::GAP_DETECTED_PATH),
            timeline_path: PathBuf::from(pxc_common::naming::TIMELINE_PATH),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Uploads binlogs of one node to storage
pub struct Collector {
    storage: Arc<dyn StorageClient>,
    fetcher: Arc<dyn BinlogFetcher>,
    options: CollectorOptions,
    last_uploaded: GtidSet,
    source_id: String,
}

impl Collector {
    /// Collector writing to `storage`
    pub fn new(
        storage: Arc<dyn StorageClient>,
        fetcher: Arc<dyn BinlogFetcher>,
        options: CollectorOptions,
    ) -> Self {
        Self {
            storage,
            fetcher,
            options,
            last_uploaded: GtidSet::default(),
            source_id: String::new(),
        }
    }

    /// Run one collection cycle against `db`
    #[instrument(skip(self, db), fields(host = %db.host()))]
    pub async fn run(&mut self, db: &dyn BinlogDatabase) -> Result<()> {
        let result = self.cycle(db).await;
        match &result {
            Ok(()) => metrics::COLLECT_SUCCESS.add(1, &[]),
            Err(_) => metrics::COLLECT_FAILURE.add(1, &[]),
        }
        result
    }

    async fn cycle(&mut self, db: &dyn BinlogDatabase) -> Result<()> {
        // The position always comes from storage.
        self.last_uploaded = GtidSet::default();
        self.source_id = db.cluster_state_uuid().await?;

        let mut cache = HostBinlogCache::load(self.storage.as_ref(), &self.options.cache_key).await?;
        if cache.entries.contains_key(&db.host()) {
            let timeout = self.options.timeout;
            tokio::time::timeout(timeout, self.collect(db, &mut cache))
                .await
                .map_err(|_| PitrError::Recovery(format!("collection cycle exceeded {timeout:?}")))?
        } else {
            warn!("ignoring timeout to populate the cache, this might take some time");
            self.collect(db, &mut cache).await
        }
    }

    async fn collect(&mut self, db: &dyn BinlogDatabase, cache: &mut HostBinlogCache) -> Result<()> {
        let mut binlogs = db.binlog_list().await?;
        self.add_gtid_sets(db, cache, &mut binlogs).await?;

        let Some(newest_sets) = binlogs
            .iter()
            .rev()
            .map(|b| b.gtid_set.list())
            .find(|l| !l.is_empty())
            .map(|l| l.into_iter().map(str::to_string).collect::<Vec<_>>())
        else {
            info!("no binlogs to upload");
            return Ok(());
        };

        // After a restore the cluster gets a new UUID and the newest binlog may
        // carry sets of both the old and the current source. Prefer the
        // current one so an old source's marker doesn't look like a gap.
        for set in &newest_sets {
            let source = source_id(set);
            if self.last_uploaded.is_empty() || self.source_id == source {
                self.last_uploaded = self.read_last_set(&source).await?;
                if self.source_id == source {
                    break;
                }
            }
        }

        let last_name = if self.last_uploaded.is_empty() {
            None
        } else {
            info!(set = %self.last_uploaded, "last uploaded GTID set");
            let found = self.find_last_uploaded(db, &binlogs).await?;
            if found.is_none() {
                error!(
                    set = %self.last_uploaded,
                    "gap detected in the binary logs; binlogs will be uploaded anyway, \
                     but a full backup is needed for consistent recovery"
                );
                metrics::GAP_DETECTED.add(1, &[]);
                tokio::fs::write(&self.options.gap_path, self.last_uploaded.raw()).await?;
            }
            found
        };
        info!(binlog = last_name.as_deref().unwrap_or(""), "last uploaded binlog");

        let pending = self.pending(db, binlogs, last_name.as_deref()).await?;
        if pending.is_empty() {
            info!("no binlogs to upload after filter");
            metrics::record_processed();
            return Ok(());
        }

        if !tokio::fs::try_exists(&self.options.timeline_path).await? {
            let first = db.first_timestamp(&pending[0].name).await?;
            tokio::fs::write(&self.options.timeline_path, first.to_string()).await?;
        }

        for binlog in &pending {
            self.upload(db, binlog).await?;
            metrics::record_upload();

            let last = db.last_timestamp(&binlog.name).await?;
            update_timeline(&self.options.timeline_path, last).await?;
        }

        metrics::record_processed();
        Ok(())
    }

    async fn add_gtid_sets(
        &self,
        db: &dyn BinlogDatabase,
        cache: &mut HostBinlogCache,
        binlogs: &mut [Binlog],
    ) -> Result<()> {
        let host = db.host();
        let mut dirty = !cache.entries.contains_key(&host);
        let entry = cache.entries.entry(host.clone()).or_default();

        for binlog in binlogs.iter_mut() {
            let set = match entry.get(&binlog.name) {
                Some(set) => set.to_string(),
                None => {
                    debug!(binlog = %binlog.name, "no cache entry");
                    match db.gtid_set(&binlog.name).await? {
                        Some(set) => {
                            entry.set(&binlog.name, &set);
                            dirty = true;
                            set
                        }
                        None => continue,
                    }
                }
            };
            binlog.gtid_set = GtidSet::new(set);
            debug!(binlog = %binlog.name, set = %binlog.gtid_set, "binlog GTID set");
        }

        if dirty {
            cache.save(self.storage.as_ref(), &self.options.cache_key).await?;
        }
        Ok(())
    }

    async fn read_last_set(&self, source: &str) -> Result<GtidSet> {
        match self.storage.get_bytes(&format!("{LAST_SET_PREFIX}{source}")).await {
            Ok(data) => Ok(GtidSet::new(String::from_utf8_lossy(&data))),
            Err(e) if e.is_not_found() => Ok(GtidSet::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Newest binlog containing, or contained in, the last uploaded set
    async fn find_last_uploaded(
        &self,
        db: &dyn BinlogDatabase,
        binlogs: &[Binlog],
    ) -> Result<Option<String>> {
        for binlog in binlogs.iter().rev() {
            for set in binlog.gtid_set.list() {
                for uploaded in self.last_uploaded.list() {
                    if uploaded == set
                        || db.gtid_subset(uploaded, set).await?
                        || db.gtid_subset(set, uploaded).await?
                    {
                        debug!(binlog = %binlog.name, set, uploaded, "found last uploaded binlog");
                        return Ok(Some(binlog.name.clone()));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Binlogs still to upload, in order, without empty ones
    async fn pending(
        &self,
        db: &dyn BinlogDatabase,
        binlogs: Vec<Binlog>,
        last_name: Option<&str>,
    ) -> Result<Vec<Binlog>> {
        let start = match last_name {
            None => 0,
            Some(name) => {
                let Some(idx) = binlogs.iter().position(|b| b.name == name) else {
                    return Ok(Vec::new());
                };
                // The last uploaded file is uploaded again only if it grew.
                let current = db.gtid_set(name).await?.unwrap_or_default();
                if current.trim() == self.last_uploaded.raw() {
                    idx + 1
                } else {
                    idx
                }
            }
        };
        Ok(binlogs
            .into_iter()
            .skip(start)
            .filter(|b| !b.gtid_set.is_empty())
            .collect())
    }

    async fn upload(&mut self, db: &dyn BinlogDatabase, binlog: &Binlog) -> Result<()> {
        let first = db.first_timestamp(&binlog.name).await?;
        let object = object_name(first, &binlog.name, &binlog.gtid_set)?;

        info!(binlog = %binlog.name, object = %object, "uploading binlog");
        let file = self.fetcher.fetch(&db.host(), &binlog.name).await?;
        self.storage.put_object(&object, file.body, file.size).await?;

        let set = Bytes::from(binlog.gtid_set.raw().to_string());
        self.storage
            .put_bytes(&format!("{object}{GTID_SET_SUFFIX}"), set.clone())
            .await?;
        for member in binlog.gtid_set.list() {
            let marker = format!("{LAST_SET_PREFIX}{}", source_id(member));
            self.storage.put_bytes(&marker, set.clone()).await?;
        }

        self.last_uploaded = binlog.gtid_set.clone();
        Ok(())
    }
}

/// Storage name of a binlog: `binlog_<first-ts>_<sequence>_<set-digest>`
pub fn object_name(first_timestamp: i64, binlog: &str, gtid_set: &GtidSet) -> Result<String> {
    let sequence = binlog
        .rsplit_once('.')
        .map(|(_, seq)| seq)
        .filter(|seq| !seq.is_empty())
        .ok_or_else(|| PitrError::Metadata(format!("invalid binlog name format: {binlog}")))?;
    let digest = Sha256::digest(gtid_set.raw().as_bytes());
    Ok(format!(
        "{BINLOG_PREFIX}{first_timestamp}_{sequence}_{}",
        hex::encode(&digest[..16])
    ))
}

/// First timestamp encoded in a binlog object name
pub fn object_timestamp(object: &str) -> Result<i64> {
    object
        .split('_')
        .nth(1)
        .and_then(|ts| ts.parse().ok())
        .ok_or_else(|| PitrError::Metadata(format!("get timestamp from binlog name {object}")))
}

/// Keep the first line, replace or append the last one
async fn update_timeline(path: &Path, last: i64) -> Result<()> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    if lines.len() > 1 {
        if let Some(tail) = lines.last_mut() {
            *tail = last.to_string();
        }
    } else {
        lines.push(last.to_string());
    }
    tokio::fs::write(path, lines.join("\n")).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CACHE_KEY;
    use crate::database::MockBinlogDatabase;
    use pxc_storage::MemoryStorage;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const HOST: &str = "cluster1-pxc-0";

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: Arc<MemoryStorage>,
        fetched: Arc<Mutex<Vec<String>>>,
        collector: Collector,
        options: CollectorOptions,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemoryStorage::with_prefix("binlogs"));
        let fetched = Arc::new(Mutex::new(Vec::new()));

        let mut fetcher = MockBinlogFetcher::new();
        let record = fetched.clone();
        fetcher.expect_fetch().returning(move |_, binlog| {
            record.lock().unwrap().push(binlog.to_string());
            let data = Bytes::from(format!("content of {binlog}"));
            Ok(BinlogStream {
                size: data.len() as u64,
                body: pxc_storage::bytes_stream(data),
            })
        });

        let options = CollectorOptions {
            gap_path: dir.path().join("gap-detected"),
            timeline_path: dir.path().join("pitr-timeline"),
            ..Default::default()
        };
        let collector = Collector::new(storage.clone(), Arc::new(fetcher), options.clone());
        Fixture {
            _dir: dir,
            storage,
            fetched,
            collector,
            options,
        }
    }

    /// Mock node with the given binlogs and their GTID sets.
    /// `gtid_set` returns `None` for names missing from `sets`.
    fn node(binlogs: &[&str], sets: &[(&str, &str)]) -> MockBinlogDatabase {
        let names: Vec<String> = binlogs.iter().map(|s| s.to_string()).collect();
        let sets: HashMap<String, String> = sets
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let mut db = MockBinlogDatabase::new();
        db.expect_host().returning(|| HOST.to_string());
        db.expect_cluster_state_uuid().returning(|| Ok("src".to_string()));
        db.expect_binlog_list()
            .returning(move || Ok(names.iter().map(Binlog::named).collect()));
        db.expect_gtid_set()
            .returning(move |name| Ok(sets.get(name).cloned()));
        db.expect_first_timestamp()
            .returning(|name| Ok(1000 + sequence(name)));
        db.expect_last_timestamp()
            .returning(|name| Ok(2000 + sequence(name)));
        db.expect_gtid_subset().returning(|_, _| Ok(false));
        db
    }

    fn sequence(name: &str) -> i64 {
        name.rsplit('.').next().and_then(|s| s.parse().ok()).unwrap_or(0)
    }

    fn uploaded_binlogs(storage: &MemoryStorage) -> Vec<String> {
        storage
            .keys()
            .into_iter()
            .filter_map(|k| k.strip_prefix("binlogs/").map(str::to_string))
            .filter(|k| k.starts_with(BINLOG_PREFIX) && !k.ends_with(GTID_SET_SUFFIX))
            .collect()
    }

    /// Story: the archive already holds binlog A. The node lists A, B and C,
    /// so the collector resumes after A and uploads B then C.
    #[tokio::test]
    async fn story_resume_after_last_uploaded_binlog() {
        let mut f = fixture();
        f.storage.insert("binlogs/last-binlog-set-src", "src:1-10");

        let mut cache = HostBinlogCache::default();
        cache
            .entries
            .entry(HOST.to_string())
            .or_default()
            .set("binlog.000001", "src:1-10");
        cache.save(f.storage.as_ref(), CACHE_KEY).await.unwrap();

        let db = node(
            &["binlog.000001", "binlog.000002", "binlog.000003"],
            &[
                ("binlog.000001", "src:1-10"),
                ("binlog.000002", "src:11-20"),
                ("binlog.000003", "src:21-30"),
            ],
        );

        f.collector.run(&db).await.unwrap();

        assert_eq!(
            *f.fetched.lock().unwrap(),
            vec!["binlog.000002".to_string(), "binlog.000003".to_string()]
        );
        let uploaded = uploaded_binlogs(&f.storage);
        assert_eq!(uploaded.len(), 2);
        assert!(uploaded[0].starts_with("binlog_1002_000002_"));
        assert!(uploaded[1].starts_with("binlog_1003_000003_"));
        assert_eq!(
            f.storage.get_bytes(&uploaded[1]).await.unwrap(),
            Bytes::from_static(b"content of binlog.000003")
        );

        let sidecar = f
            .storage
            .get_bytes(&format!("{}{GTID_SET_SUFFIX}", uploaded[1]))
            .await
            .unwrap();
        assert_eq!(sidecar, Bytes::from_static(b"src:21-30"));
        assert_eq!(
            f.storage.get_bytes("last-binlog-set-src").await.unwrap(),
            Bytes::from_static(b"src:21-30")
        );

        let timeline = std::fs::read_to_string(&f.options.timeline_path).unwrap();
        assert_eq!(timeline, "1002\n2003");
        assert!(!f.options.gap_path.exists());

        let cache = HostBinlogCache::load(f.storage.as_ref(), CACHE_KEY).await.unwrap();
        assert_eq!(cache.entries[HOST].get("binlog.000003"), Some("src:21-30"));
    }

    /// Story: the archive ends at a set the node no longer has. A gap marker
    /// is written and every non-empty binlog is uploaded.
    #[tokio::test]
    async fn story_gap_detected() {
        let mut f = fixture();
        f.storage.insert("binlogs/last-binlog-set-src", "src:1-5");

        let db = node(
            &["binlog.000007", "binlog.000008"],
            &[("binlog.000007", "src:40-50"), ("binlog.000008", "src:51-60")],
        );

        f.collector.run(&db).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&f.options.gap_path).unwrap(),
            "src:1-5"
        );
        assert_eq!(f.fetched.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_and_unreadable_binlogs_are_skipped() {
        let mut f = fixture();
        let db = node(
            &["binlog.000001", "binlog.000002", "binlog.000003"],
            &[("binlog.000001", ""), ("binlog.000003", "src:1-3")],
        );

        f.collector.run(&db).await.unwrap();

        assert_eq!(*f.fetched.lock().unwrap(), vec!["binlog.000003".to_string()]);
        assert!(!f.options.gap_path.exists());
    }

    #[tokio::test]
    async fn test_nothing_to_upload() {
        let mut f = fixture();
        let db = node(&["binlog.000001"], &[("binlog.000001", "")]);
        f.collector.run(&db).await.unwrap();
        assert!(f.fetched.lock().unwrap().is_empty());
        assert!(!f.options.timeline_path.exists());
    }

    /// Story: the last uploaded binlog kept growing, so it is uploaded again
    #[tokio::test]
    async fn story_grown_binlog_is_uploaded_again() {
        let mut f = fixture();
        f.storage.insert("binlogs/last-binlog-set-src", "src:1-10");

        let mut db = MockBinlogDatabase::new();
        db.expect_host().returning(|| HOST.to_string());
        db.expect_cluster_state_uuid().returning(|| Ok("src".to_string()));
        db.expect_binlog_list()
            .returning(|| Ok(vec![Binlog::named("binlog.000001")]));
        // First lookup fills the cache, the second sees the file after rotation.
        let mut calls = 0;
        db.expect_gtid_set().returning(move |_| {
            calls += 1;
            Ok(Some(if calls == 1 { "src:1-10" } else { "src:1-15" }.to_string()))
        });
        db.expect_first_timestamp().returning(|_| Ok(1000));
        db.expect_last_timestamp().returning(|_| Ok(2000));

        f.collector.run(&db).await.unwrap();
        assert_eq!(*f.fetched.lock().unwrap(), vec!["binlog.000001".to_string()]);
    }

    #[test]
    fn test_object_name() {
        let set = GtidSet::new("src:1-10");
        let name = object_name(1700000000, "binlog.000011", &set).unwrap();
        let parts: Vec<&str> = name.split('_').collect();
        assert_eq!(parts[0], "binlog");
        assert_eq!(parts[1], "1700000000");
        assert_eq!(parts[2], "000011");
        assert_eq!(parts[3].len(), 32);
        assert_eq!(object_timestamp(&name).unwrap(), 1700000000);

        assert!(object_name(1, "binlog", &set).is_err());
        assert!(object_timestamp("binlog_x").is_err());
    }

    #[tokio::test]
    async fn test_update_timeline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timeline");
        std::fs::write(&path, "100").unwrap();
        update_timeline(&path, 200).await.unwrap();
        update_timeline(&path, 300).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "100\n300");
    }

    /// Story: a fetched binlog is read from the scratch directory in chunks,
    /// and the directory goes away once the upload is done with the stream
    #[tokio::test]
    async fn story_fetched_binlog_streams_from_scratch_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let content = vec![7u8; 64 * 1024 + 3];
        std::fs::write(path.join("binlog.000004"), &content).unwrap();

        let file = scratch_file_stream(dir, "binlog.000004").await.unwrap();
        assert_eq!(file.size, content.len() as u64);
        assert!(path.exists());

        let storage = MemoryStorage::new();
        storage
            .put_object("binlog_1_000004_x", file.body, file.size)
            .await
            .unwrap();
        assert_eq!(
            storage.get_bytes("binlog_1_000004_x").await.unwrap(),
            Bytes::from(content)
        );
        assert!(!path.exists());
    }
}
