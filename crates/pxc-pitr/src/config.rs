//! Command line and environment configuration of the `pitr` binary

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use pxc_storage::{s3_endpoint, AzureOptions, S3Options, StorageOptions};

use crate::cache::CACHE_KEY;
use crate::error::{PitrError, Result};

/// Default listen address of the HTTP endpoints
pub const HTTP_ADDR: &str = "0.0.0.0:8080";

/// Default location of the xtrabackup user's password
pub const PASSWORD_FILE: &str = "/etc/mysql/mysql-users-secret/xtrabackup";

/// Binlog collector and point-in-time recoverer
#[derive(Parser, Debug)]
#[command(name = "pitr", version, about, long_about = None)]
pub struct Cli {
    /// Mode to run in
    #[command(subcommand)]
    pub command: PitrCommand,

    /// Listen address of the health, metrics and cache endpoints
    #[arg(long, env = "HTTP_ADDR", default_value = HTTP_ADDR, global = true)]
    pub http_addr: SocketAddr,
}

/// Modes of the binary
#[derive(Subcommand, Debug)]
pub enum PitrCommand {
    /// Continuously upload binlogs of the cluster to storage
    Collect(CollectArgs),
    /// Replay archived binlogs on a freshly restored cluster
    Recover(RecoverArgs),
}

/// Backend kind of the binlog storage
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    /// S3-compatible storage
    S3,
    /// Azure Blob storage
    Azure,
}

/// Connection to the cluster
#[derive(Args, Debug, Clone)]
pub struct PxcArgs {
    /// Service resolving to every PXC node
    #[arg(long, env = "PXC_SERVICE")]
    pub pxc_service: String,

    /// Database user
    #[arg(long, env = "PXC_USER", default_value = "xtrabackup")]
    pub pxc_user: String,

    /// Database password, read from `--pxc-pass-file` when unset
    #[arg(long, env = "PXC_PASS", hide_env_values = true)]
    pub pxc_pass: Option<String>,

    /// File holding the database password
    #[arg(long, env = "PXC_PASS_FILE", default_value = PASSWORD_FILE)]
    pub pxc_pass_file: PathBuf,
}

impl PxcArgs {
    /// Password from the environment or the mounted secret
    pub fn password(&self) -> Result<String> {
        if let Some(pass) = &self.pxc_pass {
            return Ok(pass.clone());
        }
        let pass = std::fs::read_to_string(&self.pxc_pass_file).map_err(|e| {
            PitrError::Config(format!(
                "read password file {}: {e}",
                self.pxc_pass_file.display()
            ))
        })?;
        Ok(pass.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// S3 settings shared by the collector and the recoverer's backup storage
#[derive(Args, Debug, Clone)]
pub struct S3Args {
    /// S3 endpoint
    #[arg(long, env = "ENDPOINT", default_value = pxc_storage::AWS_DEFAULT_HOST)]
    pub endpoint: String,

    /// Access key id
    #[arg(long, env = "ACCESS_KEY_ID", hide_env_values = true)]
    pub access_key_id: Option<String>,

    /// Secret access key
    #[arg(long, env = "SECRET_ACCESS_KEY", hide_env_values = true)]
    pub secret_access_key: Option<String>,

    /// Bucket with optional path, `s3://bucket/path` or `bucket/path`
    #[arg(long, env = "S3_BUCKET_URL")]
    pub s3_bucket_url: Option<String>,

    /// Region
    #[arg(long, env = "DEFAULT_REGION", default_value = "")]
    pub default_region: String,
}

/// Azure settings of the collector
#[derive(Args, Debug, Clone)]
pub struct AzureArgs {
    /// Blob endpoint
    #[arg(long, env = "AZURE_ENDPOINT", default_value = "")]
    pub azure_endpoint: String,

    /// Container with optional path, `container/path`
    #[arg(long, env = "AZURE_CONTAINER_PATH")]
    pub azure_container_path: Option<String>,

    /// Storage account
    #[arg(long, env = "AZURE_STORAGE_ACCOUNT", hide_env_values = true)]
    pub azure_storage_account: Option<String>,

    /// Storage account key
    #[arg(long, env = "AZURE_ACCESS_KEY", hide_env_values = true)]
    pub azure_access_key: Option<String>,
}

/// Arguments of `pitr collect`
#[derive(Args, Debug, Clone)]
pub struct CollectArgs {
    /// Cluster connection
    #[command(flatten)]
    pub pxc: PxcArgs,

    /// Storage backend
    #[arg(long, env = "STORAGE_TYPE", value_enum, default_value_t = StorageKind::S3)]
    pub storage_type: StorageKind,

    /// S3 binlog storage
    #[command(flatten)]
    pub s3: S3Args,

    /// Azure binlog storage
    #[command(flatten)]
    pub azure: AzureArgs,

    /// Seconds between collection cycles
    #[arg(long, env = "COLLECT_SPAN_SEC", default_value_t = 60.0)]
    pub collect_span_sec: f64,

    /// Upper bound in seconds of one cycle once the GTID cache is warm
    #[arg(long, env = "TIMEOUT_SECONDS", default_value_t = 60.0)]
    pub timeout_seconds: f64,

    /// Verify the storage certificate
    #[arg(long, env = "VERIFY_TLS", default_value_t = true, action = ArgAction::Set)]
    pub verify_tls: bool,

    /// Object name of the GTID cache document
    #[arg(long, env = "GTID_CACHE_KEY", default_value = CACHE_KEY)]
    pub gtid_cache_key: String,
}

impl CollectArgs {
    /// Pause between cycles
    pub fn collect_span(&self) -> Result<Duration> {
        seconds("COLLECT_SPAN_SEC", self.collect_span_sec)
    }

    /// Cycle timeout
    pub fn timeout(&self) -> Result<Duration> {
        seconds("TIMEOUT_SECONDS", self.timeout_seconds)
    }

    /// Binlog storage settings
    pub fn storage_options(&self, ca_bundle: Option<Vec<u8>>) -> Result<StorageOptions> {
        match self.storage_type {
            StorageKind::S3 => {
                let url = required(&self.s3.s3_bucket_url, "S3_BUCKET_URL")?;
                let (bucket, prefix) = bucket_and_prefix(url)?;
                Ok(StorageOptions::S3(S3Options {
                    bucket,
                    prefix,
                    region: self.s3.default_region.clone(),
                    endpoint: s3_endpoint(&self.s3.endpoint),
                    access_key_id: self.s3.access_key_id.clone().unwrap_or_default(),
                    secret_access_key: self.s3.secret_access_key.clone().unwrap_or_default(),
                    verify_tls: self.verify_tls,
                    ca_bundle,
                }))
            }
            StorageKind::Azure => {
                let path = required(&self.azure.azure_container_path, "AZURE_CONTAINER_PATH")?;
                let (container, prefix) = container_and_prefix(path);
                Ok(StorageOptions::Azure(AzureOptions {
                    container,
                    prefix,
                    account: required(&self.azure.azure_storage_account, "AZURE_STORAGE_ACCOUNT")?
                        .to_string(),
                    access_key: required(&self.azure.azure_access_key, "AZURE_ACCESS_KEY")?
                        .to_string(),
                    endpoint: self.azure.azure_endpoint.clone(),
                }))
            }
        }
    }
}

/// S3 location of the binlog archive during recovery
#[derive(Args, Debug, Clone)]
pub struct BinlogS3Args {
    /// Endpoint
    #[arg(long, env = "BINLOG_S3_ENDPOINT", default_value = pxc_storage::AWS_DEFAULT_HOST)]
    pub binlog_s3_endpoint: String,

    /// Access key id
    #[arg(long, env = "BINLOG_ACCESS_KEY_ID", hide_env_values = true)]
    pub binlog_access_key_id: Option<String>,

    /// Secret access key
    #[arg(long, env = "BINLOG_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub binlog_secret_access_key: Option<String>,

    /// Region
    #[arg(long, env = "BINLOG_S3_REGION", default_value = "")]
    pub binlog_s3_region: String,

    /// Bucket with optional path
    #[arg(long, env = "BINLOG_S3_BUCKET_URL")]
    pub binlog_s3_bucket_url: Option<String>,
}

/// Azure location of the backup being recovered
#[derive(Args, Debug, Clone)]
pub struct AzureBackupArgs {
    /// Blob endpoint
    #[arg(long, env = "AZURE_ENDPOINT", default_value = "")]
    pub azure_endpoint: String,

    /// Container of the backup
    #[arg(long, env = "AZURE_CONTAINER_NAME")]
    pub azure_container_name: Option<String>,

    /// Storage account
    #[arg(long, env = "AZURE_STORAGE_ACCOUNT", hide_env_values = true)]
    pub azure_storage_account: Option<String>,

    /// Storage account key
    #[arg(long, env = "AZURE_ACCESS_KEY", hide_env_values = true)]
    pub azure_access_key: Option<String>,

    /// Backup directory inside the container
    #[arg(long, env = "BACKUP_PATH")]
    pub backup_path: Option<String>,
}

/// Azure location of the binlog archive during recovery
#[derive(Args, Debug, Clone)]
pub struct BinlogAzureArgs {
    /// Blob endpoint
    #[arg(long, env = "BINLOG_AZURE_ENDPOINT", default_value = "")]
    pub binlog_azure_endpoint: String,

    /// Container with optional path
    #[arg(long, env = "BINLOG_AZURE_CONTAINER_PATH")]
    pub binlog_azure_container_path: Option<String>,

    /// Storage account
    #[arg(long, env = "BINLOG_AZURE_STORAGE_ACCOUNT", hide_env_values = true)]
    pub binlog_azure_storage_account: Option<String>,

    /// Storage account key
    #[arg(long, env = "BINLOG_AZURE_ACCESS_KEY", hide_env_values = true)]
    pub binlog_azure_access_key: Option<String>,
}

/// Arguments of `pitr recover`
#[derive(Args, Debug, Clone)]
pub struct RecoverArgs {
    /// Cluster connection
    #[command(flatten)]
    pub pxc: PxcArgs,

    /// Storage backend of both the backup and the binlogs
    #[arg(long, env = "STORAGE_TYPE", value_enum, default_value_t = StorageKind::S3)]
    pub storage_type: StorageKind,

    /// `latest`, `date`, `transaction` or `skip`
    #[arg(long, env = "PITR_RECOVERY_TYPE")]
    pub pitr_recovery_type: String,

    /// Target time for `date` recovery, `YYYY-MM-DD hh:mm:ss`
    #[arg(long, env = "PITR_DATE")]
    pub pitr_date: Option<String>,

    /// Target GTID for `transaction` and `skip` recovery
    #[arg(long, env = "PITR_GTID")]
    pub pitr_gtid: Option<String>,

    /// Verify the storage certificate
    #[arg(long, env = "VERIFY_TLS", default_value_t = true, action = ArgAction::Set)]
    pub verify_tls: bool,

    /// S3 backup storage
    #[command(flatten)]
    pub backup_s3: S3Args,

    /// S3 binlog storage
    #[command(flatten)]
    pub binlog_s3: BinlogS3Args,

    /// Azure backup storage
    #[command(flatten)]
    pub backup_azure: AzureBackupArgs,

    /// Azure binlog storage
    #[command(flatten)]
    pub binlog_azure: BinlogAzureArgs,
}

impl RecoverArgs {
    /// Storage holding the backup's metadata files
    pub fn backup_storage(&self, ca_bundle: Option<Vec<u8>>) -> Result<StorageOptions> {
        match self.storage_type {
            StorageKind::S3 => {
                let url = required(&self.backup_s3.s3_bucket_url, "S3_BUCKET_URL")?;
                let (bucket, prefix) = bucket_and_prefix(url)?;
                Ok(StorageOptions::S3(S3Options {
                    bucket,
                    prefix,
                    region: self.backup_s3.default_region.clone(),
                    endpoint: s3_endpoint(&self.backup_s3.endpoint),
                    access_key_id: self.backup_s3.access_key_id.clone().unwrap_or_default(),
                    secret_access_key: self
                        .backup_s3
                        .secret_access_key
                        .clone()
                        .unwrap_or_default(),
                    verify_tls: self.verify_tls,
                    ca_bundle,
                }))
            }
            StorageKind::Azure => {
                let azure = &self.backup_azure;
                let container = required(&azure.azure_container_name, "AZURE_CONTAINER_NAME")?;
                let path = required(&azure.backup_path, "BACKUP_PATH")?;
                Ok(StorageOptions::Azure(AzureOptions {
                    container: container.to_string(),
                    prefix: directory(path),
                    account: required(&azure.azure_storage_account, "AZURE_STORAGE_ACCOUNT")?
                        .to_string(),
                    access_key: required(&azure.azure_access_key, "AZURE_ACCESS_KEY")?.to_string(),
                    endpoint: azure.azure_endpoint.clone(),
                }))
            }
        }
    }

    /// Storage holding the binlog archive
    pub fn binlog_storage(&self, ca_bundle: Option<Vec<u8>>) -> Result<StorageOptions> {
        match self.storage_type {
            StorageKind::S3 => {
                let s3 = &self.binlog_s3;
                let url = required(&s3.binlog_s3_bucket_url, "BINLOG_S3_BUCKET_URL")?;
                let (bucket, prefix) = bucket_and_prefix(url)?;
                Ok(StorageOptions::S3(S3Options {
                    bucket,
                    prefix,
                    region: s3.binlog_s3_region.clone(),
                    endpoint: s3_endpoint(&s3.binlog_s3_endpoint),
                    access_key_id: s3.binlog_access_key_id.clone().unwrap_or_default(),
                    secret_access_key: s3.binlog_secret_access_key.clone().unwrap_or_default(),
                    verify_tls: self.verify_tls,
                    ca_bundle,
                }))
            }
            StorageKind::Azure => {
                let azure = &self.binlog_azure;
                let path = required(
                    &azure.binlog_azure_container_path,
                    "BINLOG_AZURE_CONTAINER_PATH",
                )?;
                let (container, prefix) = container_and_prefix(path);
                Ok(StorageOptions::Azure(AzureOptions {
                    container,
                    prefix,
                    account: required(
                        &azure.binlog_azure_storage_account,
                        "BINLOG_AZURE_STORAGE_ACCOUNT",
                    )?
                    .to_string(),
                    access_key: required(&azure.binlog_azure_access_key, "BINLOG_AZURE_ACCESS_KEY")?
                        .to_string(),
                    endpoint: azure.binlog_azure_endpoint.clone(),
                }))
            }
        }
    }
}

fn required<'a>(value: &'a Option<String>, env: &str) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PitrError::Config(format!("{env} is required")))
}

fn seconds(env: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        return Err(PitrError::Config(format!("{env} must be a non-negative number")));
    }
    Ok(Duration::from_secs_f64(value))
}

fn directory(path: &str) -> String {
    let path = path.trim_matches('/');
    if path.is_empty() {
        String::new()
    } else {
        format!("{path}/")
    }
}

/// Split a bucket URL into bucket and key prefix.
///
/// Accepts `s3://bucket/path`, `https://host/bucket/path` and `bucket/path`.
/// A non-empty prefix always ends with `/`.
pub fn bucket_and_prefix(url: &str) -> Result<(String, String)> {
    let rest = if let Some(rest) = url.strip_prefix("s3://") {
        rest
    } else if let Some(rest) = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
    {
        rest.split_once('/').map(|(_, path)| path).unwrap_or("")
    } else {
        url
    };
    let rest = rest.trim_start_matches('/');
    let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(PitrError::Config(format!("can't find bucket in {url:?}")));
    }
    Ok((bucket.to_string(), directory(path)))
}

/// Split `container/path` into container and key prefix
pub fn container_and_prefix(path: &str) -> (String, String) {
    let path = path.trim_start_matches('/');
    let (container, prefix) = path.split_once('/').unwrap_or((path, ""));
    (container.to_string(), directory(prefix))
}

/// Extra CA bundle mounted for the storage endpoint, if any
pub fn read_ca_bundle(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(data) if data.is_empty() => Ok(None),
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Default CA bundle location
pub fn default_ca_path() -> PathBuf {
    Path::new(pxc_common::naming::STORAGE_CA_DIRECTORY).join(pxc_common::naming::STORAGE_CA_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_and_prefix() {
        let cases = [
            ("s3://operator-testing/test", "operator-testing", "test/"),
            ("s3://operator-testing/test/", "operator-testing", "test/"),
            ("operator-testing/test", "operator-testing", "test/"),
            ("operator-testing", "operator-testing", ""),
            ("operator-testing/", "operator-testing", ""),
            (
                "https://somebucket.s3.amazonaws.com/operator-testing/a/b",
                "operator-testing",
                "a/b/",
            ),
            ("s3://bucket/dir/sub-dir/", "bucket", "dir/sub-dir/"),
        ];
        for (url, bucket, prefix) in cases {
            let (b, p) = bucket_and_prefix(url).unwrap();
            assert_eq!((b.as_str(), p.as_str()), (bucket, prefix), "url {url}");
        }
        assert!(bucket_and_prefix("s3://").is_err());
    }

    #[test]
    fn test_container_and_prefix() {
        assert_eq!(
            container_and_prefix("binlogs/cluster1"),
            ("binlogs".to_string(), "cluster1/".to_string())
        );
        assert_eq!(
            container_and_prefix("binlogs"),
            ("binlogs".to_string(), String::new())
        );
    }

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_collect_storage_options() {
        let cli = parse(&[
            "pitr",
            "collect",
            "--pxc-service",
            "cluster1-pxc",
            "--s3-bucket-url",
            "s3://binlogs/cluster1",
            "--endpoint",
            "minio:9000",
            "--verify-tls",
            "false",
        ]);
        assert_eq!(cli.http_addr.port(), 8080);
        let PitrCommand::Collect(args) = cli.command else {
            panic!("expected collect");
        };
        assert_eq!(args.collect_span().unwrap(), Duration::from_secs(60));
        let StorageOptions::S3(s3) = args.storage_options(None).unwrap() else {
            panic!("expected s3");
        };
        assert_eq!(s3.bucket, "binlogs");
        assert_eq!(s3.prefix, "cluster1/");
        assert_eq!(s3.endpoint, "https://minio:9000");
        assert!(!s3.verify_tls);
    }

    #[test]
    fn test_collect_requires_location() {
        let cli = parse(&["pitr", "collect", "--pxc-service", "svc", "--storage-type", "azure"]);
        let PitrCommand::Collect(args) = cli.command else {
            panic!("expected collect");
        };
        let err = args.storage_options(None).unwrap_err();
        assert!(err.to_string().contains("AZURE_CONTAINER_PATH"));
    }

    #[test]
    fn test_recover_storages() {
        let cli = parse(&[
            "pitr",
            "recover",
            "--pxc-service",
            "svc",
            "--pitr-recovery-type",
            "latest",
            "--s3-bucket-url",
            "backups/cluster1-2024-05-01",
            "--binlog-s3-bucket-url",
            "binlogs/cluster1",
            "--http-addr",
            "127.0.0.1:9090",
        ]);
        assert_eq!(cli.http_addr, "127.0.0.1:9090".parse::<SocketAddr>().unwrap());
        let PitrCommand::Recover(args) = cli.command else {
            panic!("expected recover");
        };
        let StorageOptions::S3(backup) = args.backup_storage(None).unwrap() else {
            panic!("expected s3");
        };
        assert_eq!(backup.prefix, "cluster1-2024-05-01/");
        assert_eq!(backup.endpoint, "");
        let StorageOptions::S3(binlogs) = args.binlog_storage(None).unwrap() else {
            panic!("expected s3");
        };
        assert_eq!(binlogs.bucket, "binlogs");
    }

    #[test]
    fn test_password_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("xtrabackup");
        std::fs::write(&file, "s3cret\n").unwrap();
        let args = PxcArgs {
            pxc_service: "svc".to_string(),
            pxc_user: "xtrabackup".to_string(),
            pxc_pass: None,
            pxc_pass_file: file,
        };
        assert_eq!(args.password().unwrap(), "s3cret");
    }

    #[test]
    fn test_missing_ca_bundle() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_ca_bundle(&dir.path().join("ca.crt")).unwrap().is_none());
    }
}
