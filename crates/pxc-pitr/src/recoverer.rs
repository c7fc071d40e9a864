//! Point-in-time recovery from the binlog archive
//!
//! The starting point is the GTID set recorded in the restored backup's
//! metadata. Archived binlogs are walked newest first until one overlaps
//! that set; the selected files are then replayed oldest first through
//! `mysqlbinlog | mysql`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDateTime;
use futures::TryStreamExt;
use pxc_storage::StorageClient;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::collector::{object_timestamp, ADMIN_PORT, BINLOG_PREFIX, GTID_SET_SUFFIX};
use crate::database::BinlogDatabase;
use crate::error::{PitrError, Result};
use crate::gtid::{extend_to_binlog_end, source_id, validate_transaction_target};

/// Format of the `date` recovery target
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// How far to replay
#[derive(Clone, Debug, PartialEq)]
pub enum RecoveryMode {
    /// Everything in the archive
    Latest,
    /// Up to a point in time (UTC)
    Date(NaiveDateTime),
    /// Up to, not including, a transaction
    Transaction(String),
    /// Everything except one transaction
    Skip(String),
}

impl RecoveryMode {
    /// Build from the recovery type and its target
    pub fn parse(kind: &str, date: Option<&str>, gtid: Option<&str>) -> Result<Self> {
        let require_gtid = || {
            gtid.filter(|g| !g.is_empty())
                .map(str::to_string)
                .ok_or_else(|| PitrError::Config(format!("gtid is required for {kind} recovery")))
        };
        match kind {
            "latest" => Ok(Self::Latest),
            "date" => {
                let date = date
                    .filter(|d| !d.is_empty())
                    .ok_or_else(|| PitrError::Config("date is required for date recovery".into()))?;
                NaiveDateTime::parse_from_str(date, DATE_FORMAT)
                    .map(Self::Date)
                    .map_err(|e| PitrError::Config(format!("parse date {date}: {e}")))
            }
            "transaction" => Ok(Self::Transaction(require_gtid()?)),
            "skip" => Ok(Self::Skip(require_gtid()?)),
            other => Err(PitrError::Config(format!("wrong recover type {other}"))),
        }
    }
}

/// Binlogs to replay and the `mysqlbinlog` option restricting them
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplayPlan {
    /// Node to replay on
    pub host: String,
    /// Extra `mysqlbinlog` option
    pub flag: Option<String>,
    /// Archived binlog objects, oldest first
    pub binlogs: Vec<String>,
}

/// Replays archived binlogs on a node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BinlogApplier: Send + Sync {
    /// Replay every binlog of the plan in order
    async fn apply(&self, plan: &ReplayPlan) -> Result<()>;
}

/// Turns stored backup metadata into plain text
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetadataDecoder: Send + Sync {
    /// Content of `file` inside the stored object
    async fn decode(&self, data: Bytes, file: &str) -> Result<Vec<u8>>;
}

/// Decoder for metadata stored uncompressed
pub struct PlainDecoder;

#[async_trait]
impl MetadataDecoder for PlainDecoder {
    async fn decode(&self, data: Bytes, _file: &str) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Decoder extracting compressed xbstream metadata with `xbstream`
pub struct XbstreamDecoder;

#[async_trait]
impl MetadataDecoder for XbstreamDecoder {
    async fn decode(&self, data: Bytes, file: &str) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let mut child = Command::new("xbstream")
            .args(["-x", "--decompress"])
            .current_dir(dir.path())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&data).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() || !output.stderr.is_empty() {
            return Err(PitrError::command(
                "xbstream",
                format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(tokio::fs::read(dir.path().join(file)).await?)
    }
}

/// [`BinlogApplier`] piping `mysqlbinlog` into a single `mysql` session
pub struct MysqlApplier {
    storage: Arc<dyn StorageClient>,
    user: String,
    password: String,
}

impl MysqlApplier {
    /// Applier reading binlogs from `storage`
    pub fn new(
        storage: Arc<dyn StorageClient>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            user: user.into(),
            password: password.into(),
        }
    }
}

fn check_status(command: &str, status: std::process::ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(PitrError::command(command, status.to_string()))
    }
}

#[async_trait]
impl BinlogApplier for MysqlApplier {
    async fn apply(&self, plan: &ReplayPlan) -> Result<()> {
        let mut mysql = Command::new("mysql")
            .args([
                "-h",
                plan.host.as_str(),
                "-P",
                ADMIN_PORT.to_string().as_str(),
                "-u",
                self.user.as_str(),
            ])
            .env("MYSQL_PWD", &self.password)
            .stdin(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let mut mysql_in = mysql
            .stdin
            .take()
            .ok_or_else(|| PitrError::command("mysql", "stdin not captured"))?;

        let total = plan.binlogs.len();
        for (i, binlog) in plan.binlogs.iter().enumerate() {
            info!(binlog = %binlog, remaining = total - i, total, "applying binlog");
            let mut body = self.storage.get_object(binlog).await?;

            let mut cmd = Command::new("mysqlbinlog");
            cmd.arg("--disable-log-bin");
            if let Some(flag) = &plan.flag {
                cmd.arg(flag);
            }
            let mut child = cmd
                .arg("-")
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| PitrError::command("mysqlbinlog", "stdin not captured"))?;
            let mut stdout = child
                .stdout
                .take()
                .ok_or_else(|| PitrError::command("mysqlbinlog", "stdout not captured"))?;

            let feed = async move {
                while let Some(chunk) = body.try_next().await? {
                    stdin.write_all(&chunk).await?;
                }
                stdin.shutdown().await?;
                Ok::<_, PitrError>(())
            };
            let (fed, copied) = tokio::join!(feed, tokio::io::copy(&mut stdout, &mut mysql_in));
            fed?;
            copied?;
            check_status("mysqlbinlog", child.wait().await?)?;
        }

        drop(mysql_in);
        info!("waiting for mysql to finish");
        check_status("mysql", mysql.wait().await?)
    }
}

/// Start GTID set of a backup: `<source>:<last interval>`
pub async fn start_gtid_set(
    backup: &dyn StorageClient,
    decoder: &dyn MetadataDecoder,
) -> Result<String> {
    let source = backup_source_id(backup, decoder).await?;
    let info = first_object(backup, "xtrabackup_info").await?.ok_or_else(|| {
        PitrError::Metadata("no xtrabackup_info objects found".to_string())
    })?;
    let content = decoder.decode(backup.get_bytes(&info).await?, "xtrabackup_info").await?;
    let set = xtrabackup_info_set(&source, &content)?;
    Ok(format!("{source}:{set}"))
}

async fn first_object(storage: &dyn StorageClient, prefix: &str) -> Result<Option<String>> {
    let mut names = storage.list_objects(prefix).await?;
    names.sort();
    Ok(names.into_iter().next())
}

async fn backup_source_id(backup: &dyn StorageClient, decoder: &dyn MetadataDecoder) -> Result<String> {
    if let Some(name) = first_object(backup, ".sst_info/sst_info").await? {
        let content = decoder.decode(backup.get_bytes(&name).await?, "sst_info").await?;
        return Ok(source_id(&parse_sst_info(&content)?));
    }
    if let Some(name) = first_object(backup, "xtrabackup_binlog_info").await? {
        let content = decoder
            .decode(backup.get_bytes(&name).await?, "xtrabackup_binlog_info")
            .await?;
        return Ok(source_id(&parse_xtrabackup_binlog_info(&content)?));
    }
    Err(PitrError::Metadata(
        "no sst_info or xtrabackup_binlog_info objects found".to_string(),
    ))
}

/// Value of `galera-gtid=` in an `sst_info` file
pub fn parse_sst_info(content: &[u8]) -> Result<String> {
    let text = String::from_utf8_lossy(content);
    let (_, rest) = text
        .split_once("galera-gtid=")
        .ok_or_else(|| PitrError::Metadata("no gtid data in backup".to_string()))?;
    let (value, _) = rest
        .split_once('\n')
        .ok_or_else(|| PitrError::Metadata("can't find gtid data in backup".to_string()))?;
    Ok(value.trim().to_string())
}

/// GTID set column of `xtrabackup_binlog_info` (`file\tposition\tset`)
pub fn parse_xtrabackup_binlog_info(content: &[u8]) -> Result<String> {
    let text = String::from_utf8_lossy(content);
    let tokens: Vec<&str> = text.split('\t').collect();
    if tokens.len() != 3 {
        return Err(PitrError::Metadata(
            "incorrect number of tokens in xtrabackup_binlog_info content".to_string(),
        ));
    }
    Ok(tokens[2].trim().to_string())
}

/// Quoted set after `GTID of the last` in `xtrabackup_info`
pub fn xtrabackup_info_gtid(content: &[u8]) -> Result<String> {
    let text = String::from_utf8_lossy(content);
    let (_, rest) = text
        .split_once("GTID of the last")
        .ok_or_else(|| PitrError::Metadata("no gtid data in backup".to_string()))?;
    let end = rest
        .find("'\n")
        .ok_or_else(|| PitrError::Metadata("can't find gtid data in backup".to_string()))?;
    let start = rest[..end]
        .find('\'')
        .ok_or_else(|| PitrError::Metadata("can't find gtid data in backup".to_string()))?;
    Ok(rest[start + 1..end].to_string())
}

/// Interval of `source` in the set recorded in `xtrabackup_info`
pub fn xtrabackup_info_set(source: &str, content: &[u8]) -> Result<String> {
    let gtids = xtrabackup_info_gtid(content)?;
    gtids
        .split(',')
        .map(str::trim)
        .filter_map(|member| member.split_once(':'))
        .find(|(src, _)| *src == source)
        .map(|(_, set)| set.to_string())
        .ok_or_else(|| {
            PitrError::Metadata(format!("can't find current gtid ({source}) in xtrabackup file"))
        })
}

/// Replays archived binlogs on top of a restored backup
pub struct Recoverer {
    storage: Arc<dyn StorageClient>,
    applier: Arc<dyn BinlogApplier>,
    mode: RecoveryMode,
    start_gtid: String,
}

impl Recoverer {
    /// Read the backup's start position and check the target against it
    pub async fn new(
        binlog_storage: Arc<dyn StorageClient>,
        backup_storage: &dyn StorageClient,
        decoder: &dyn MetadataDecoder,
        applier: Arc<dyn BinlogApplier>,
        mode: RecoveryMode,
    ) -> Result<Self> {
        let start_gtid = start_gtid_set(backup_storage, decoder).await?;
        info!(start = %start_gtid, ?mode, "starting point-in-time recovery");

        if let RecoveryMode::Transaction(target) = &mode {
            validate_transaction_target(&start_gtid, target)?;
        }

        Ok(Self {
            storage: binlog_storage,
            applier,
            mode,
            start_gtid,
        })
    }

    /// GTID set the backup ends at
    pub fn start_gtid(&self) -> &str {
        &self.start_gtid
    }

    /// Replay on the node behind `db`
    #[instrument(skip(self, db), fields(host = %db.host()))]
    pub async fn run(&self, db: &dyn BinlogDatabase) -> Result<()> {
        let plan = self.plan(db).await?;
        info!(binlogs = plan.binlogs.len(), flag = ?plan.flag, "replay plan ready");

        db.remove_binlog_functions().await?;
        self.applier.apply(&plan).await?;
        info!("finished");
        Ok(())
    }

    /// Select binlogs and the `mysqlbinlog` restriction for the mode
    pub async fn plan(&self, db: &dyn BinlogDatabase) -> Result<ReplayPlan> {
        let (binlogs, exclude) = self.select_binlogs(db).await?;

        let (flag, binlogs) = match &self.mode {
            RecoveryMode::Latest => (None, binlogs),
            RecoveryMode::Skip(gtid) => (Some(format!("--exclude-gtids={gtid}")), binlogs),
            RecoveryMode::Transaction(_) => (
                exclude.map(|set| format!("--exclude-gtids={set}")),
                binlogs,
            ),
            RecoveryMode::Date(target) => {
                let target_ts = target.and_utc().timestamp();
                let mut kept = Vec::with_capacity(binlogs.len());
                for binlog in binlogs {
                    let ts = object_timestamp(&binlog)?;
                    if ts > target_ts {
                        info!(binlog = %binlog, ts, target_ts, "stopping at binlog after the recovery time");
                        break;
                    }
                    kept.push(binlog);
                }
                (
                    Some(format!("--stop-datetime={}", target.format(DATE_FORMAT))),
                    kept,
                )
            }
        };

        Ok(ReplayPlan {
            host: db.host(),
            flag,
            binlogs,
        })
    }

    /// Archived binlogs from the one overlapping the start set onwards,
    /// plus the set to exclude for transaction recovery
    async fn select_binlogs(&self, db: &dyn BinlogDatabase) -> Result<(Vec<String>, Option<String>)> {
        let mut list = self.storage.list_objects(BINLOG_PREFIX).await?;
        list.sort();

        let target = match &self.mode {
            RecoveryMode::Transaction(gtid) => Some(gtid.as_str()),
            _ => None,
        };
        let mut exclude: Option<String> = None;
        let mut selected = Vec::new();

        for binlog in list.iter().rev().filter(|b| !b.contains(GTID_SET_SUFFIX)) {
            let set = match self
                .storage
                .get_bytes(&format!("{binlog}{GTID_SET_SUFFIX}"))
                .await
            {
                Ok(data) => String::from_utf8_lossy(&data).trim().to_string(),
                Err(e) => {
                    warn!(binlog = %binlog, error = %e, "can't get binlog gtid set");
                    continue;
                }
            };

            if let Some(target) = target {
                // The oldest binlog holding part of the target decides the set
                if db.gtid_subtract(&set, target).await? != set {
                    exclude = Some(extend_to_binlog_end(&set, target)?);
                }
                // Binlogs written after the target aren't needed.
                if exclude.is_none() {
                    continue;
                }
            }

            selected.push(binlog.clone());
            if db.gtid_subtract(&self.start_gtid, &set).await? != self.start_gtid {
                break;
            }
        }

        if selected.is_empty() {
            return Err(PitrError::Recovery(format!(
                "no objects for prefix {BINLOG_PREFIX} or with source_id={}",
                source_id(&self.start_gtid)
            )));
        }
        selected.reverse();
        Ok((selected, exclude))
    }
}
