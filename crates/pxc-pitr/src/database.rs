//! Access to PXC nodes
//!
//! [`BinlogDatabase`] is everything the collector and the recoverer ask a
//! node; [`MySqlDatabase`] implements it over `sqlx`. Node discovery goes
//! through the `peer-list` helper shipped in the PXC images.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlDatabaseError, MySqlPool, MySqlPoolOptions};
use sqlx::{Executor, Row};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

#[cfg(test)]
use mockall::automock;

use crate::error::{PitrError, Result};
use crate::gtid::GtidSet;

/// Status fragment `get-pxc-state` prints for a synced primary node
pub const SYNCED_PRIMARY_STATE: &str =
    "wsrep_ready:ON:wsrep_connected:ON:wsrep_local_state_comment:Synced:wsrep_cluster_status:Primary";

/// MySQL error number the binlog UDFs raise for unreadable binlogs
const ER_UDF_ERROR: u16 = 3200;

const DEFAULT_PORT: u16 = 3306;

const COMPONENT_URN: &str = "file://component_binlog_utils_udf";

const BINLOG_FUNCTIONS: [(&str, &str); 4] = [
    ("get_gtid_set_by_binlog", "STRING"),
    ("get_binlog_by_gtid_set", "STRING"),
    ("get_first_record_timestamp_by_binlog", "INTEGER"),
    ("get_last_record_timestamp_by_binlog", "INTEGER"),
];

/// A binary log file on a node
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Binlog {
    /// File name, e.g. `binlog.000011`
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// GTIDs written to the file, empty until filled in
    pub gtid_set: GtidSet,
}

impl Binlog {
    /// Binlog without a known GTID set
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Queries run against a single PXC node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BinlogDatabase: Send + Sync {
    /// Node address
    fn host(&self) -> String;

    /// Server version string
    async fn version(&self) -> Result<String>;

    /// `wsrep_cluster_state_uuid` of the node
    async fn cluster_state_uuid(&self) -> Result<String>;

    /// Binary logs in order, then rotate so the newest listed file is closed
    async fn binlog_list(&self) -> Result<Vec<Binlog>>;

    /// Binary log names in order, without rotating
    async fn binlog_names(&self) -> Result<Vec<String>>;

    /// GTID set of a binlog; `None` when the server can't read the file
    async fn gtid_set(&self, binlog: &str) -> Result<Option<String>>;

    /// Unix time of the first event in a binlog
    async fn first_timestamp(&self, binlog: &str) -> Result<i64>;

    /// Unix time of the last event in a binlog
    async fn last_timestamp(&self, binlog: &str) -> Result<i64>;

    /// `GTID_SUBSET(subset, set)`
    async fn gtid_subset(&self, subset: &str, set: &str) -> Result<bool>;

    /// `GTID_SUBTRACT(set, subset)`
    async fn gtid_subtract(&self, set: &str, subset: &str) -> Result<String>;

    /// Make the binlog UDFs available
    async fn install_binlog_functions(&self) -> Result<()>;

    /// Remove the binlog UDFs
    async fn remove_binlog_functions(&self) -> Result<()>;
}

/// Opens connections to nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    /// Connect to `host`
    async fn connect(&self, host: &str) -> Result<Box<dyn BinlogDatabase>>;
}

/// [`BinlogDatabase`] over a small `sqlx` pool
pub struct MySqlDatabase {
    host: String,
    pool: MySqlPool,
    functions_ready: OnceCell<()>,
}

impl MySqlDatabase {
    /// Lazily connect to `host` (optionally `host:port`)
    pub fn connect(host: &str, user: &str, password: &str) -> Result<Self> {
        let (name, port) = match host.rsplit_once(':') {
            Some((h, p)) => (
                h,
                p.parse()
                    .map_err(|_| PitrError::Config(format!("invalid port in {host}")))?,
            ),
            None => (host, DEFAULT_PORT),
        };
        let options = MySqlConnectOptions::new()
            .host(name)
            .port(port)
            .username(user)
            .password(password);
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .connect_lazy_with(options);

        Ok(Self {
            host: host.to_string(),
            pool,
            functions_ready: OnceCell::new(),
        })
    }

    /// Close the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn err(&self, what: &str, e: sqlx::Error) -> PitrError {
        PitrError::database(&self.host, format!("{what}: {e}"))
    }

    async fn ensure_functions(&self) -> Result<()> {
        self.functions_ready
            .get_or_try_init(|| self.install_binlog_functions())
            .await
            .map(|_| ())
    }

    async fn text_scalar(&self, what: &str, query: &str, args: &[&str]) -> Result<Option<String>> {
        let mut q = sqlx::query_scalar::<_, Option<Vec<u8>>>(query);
        for arg in args {
            q = q.bind(*arg);
        }
        let value = q.fetch_one(&self.pool).await.map_err(|e| self.err(what, e))?;
        Ok(value.map(|v| String::from_utf8_lossy(&v).trim().to_string()))
    }

    async fn int_scalar(&self, what: &str, query: &str, arg: &str) -> Result<i64> {
        let value = sqlx::query_scalar::<_, Option<i64>>(query)
            .bind(arg)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.err(what, e))?;
        Ok(value.unwrap_or_default())
    }

    async fn component_installed(&self) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM mysql.component WHERE component_urn = ?",
        )
        .bind(COMPONENT_URN)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| self.err("check component", e))?;
        Ok(count > 0)
    }

    async fn function_exists(&self, name: &str) -> Result<bool> {
        let found = sqlx::query_scalar::<_, Vec<u8>>("SELECT name FROM mysql.func WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.err("get udf name", e))?;
        Ok(found.is_some())
    }

    async fn uses_component(&self) -> Result<bool> {
        Ok(self.version().await?.starts_with("8.4"))
    }
}

fn udf_error(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.try_downcast_ref::<MySqlDatabaseError>())
        .is_some_and(|m| m.number() == ER_UDF_ERROR)
}

#[async_trait]
impl BinlogDatabase for MySqlDatabase {
    fn host(&self) -> String {
        self.host.clone()
    }

    async fn version(&self) -> Result<String> {
        self.text_scalar("get version", "SELECT @@VERSION", &[])
            .await
            .map(Option::unwrap_or_default)
    }

    async fn cluster_state_uuid(&self) -> Result<String> {
        let row = (&self.pool)
            .fetch_optional(sqlx::raw_sql("SHOW STATUS LIKE 'wsrep_cluster_state_uuid'"))
            .await
            .map_err(|e| self.err("get cluster state uuid", e))?;
        let value = row
            .map(|r| r.try_get::<Vec<u8>, _>(1))
            .transpose()
            .map_err(|e| self.err("scan cluster state uuid", e))?
            .unwrap_or_default();
        Ok(String::from_utf8_lossy(&value).trim().to_string())
    }

    async fn binlog_list(&self) -> Result<Vec<Binlog>> {
        let rows = sqlx::raw_sql("SHOW BINARY LOGS")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.err("show binary logs", e))?;
        let mut binlogs = Vec::with_capacity(rows.len());
        for row in rows {
            let name: Vec<u8> = row.try_get(0).map_err(|e| self.err("scan binlogs", e))?;
            binlogs.push(Binlog {
                name: String::from_utf8_lossy(&name).to_string(),
                size: row.try_get::<u64, _>(1).unwrap_or_default(),
                gtid_set: GtidSet::default(),
            });
        }

        sqlx::raw_sql("FLUSH BINARY LOGS")
            .execute(&self.pool)
            .await
            .map_err(|e| self.err("flush binary logs", e))?;

        Ok(binlogs)
    }

    async fn binlog_names(&self) -> Result<Vec<String>> {
        let rows = sqlx::raw_sql("SHOW BINARY LOGS")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.err("show binary logs", e))?;
        rows.iter()
            .map(|row| {
                row.try_get::<Vec<u8>, _>(0)
                    .map(|n| String::from_utf8_lossy(&n).to_string())
                    .map_err(|e| self.err("scan binlogs", e))
            })
            .collect()
    }

    async fn gtid_set(&self, binlog: &str) -> Result<Option<String>> {
        self.ensure_functions().await?;
        let value = sqlx::query_scalar::<_, Option<Vec<u8>>>("SELECT get_gtid_set_by_binlog(?)")
            .bind(binlog)
            .fetch_one(&self.pool)
            .await;
        match value {
            Ok(v) => Ok(Some(
                v.map(|v| String::from_utf8_lossy(&v).trim().to_string())
                    .unwrap_or_default(),
            )),
            Err(e) if udf_error(&e) => {
                error!(host = %self.host, binlog, error = %e, "binlog file is invalid");
                Ok(None)
            }
            Err(e) => Err(self.err("scan set", e)),
        }
    }

    async fn first_timestamp(&self, binlog: &str) -> Result<i64> {
        self.ensure_functions().await?;
        self.int_scalar(
            "scan binlog timestamp",
            "SELECT get_first_record_timestamp_by_binlog(?) DIV 1000000",
            binlog,
        )
        .await
    }

    async fn last_timestamp(&self, binlog: &str) -> Result<i64> {
        self.ensure_functions().await?;
        self.int_scalar(
            "scan binlog timestamp",
            "SELECT get_last_record_timestamp_by_binlog(?) DIV 1000000",
            binlog,
        )
        .await
    }

    async fn gtid_subset(&self, subset: &str, set: &str) -> Result<bool> {
        let value = sqlx::query_scalar::<_, i64>("SELECT GTID_SUBSET(?, ?)")
            .bind(subset)
            .bind(set)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.err("scan gtid subset result", e))?;
        Ok(value != 0)
    }

    async fn gtid_subtract(&self, set: &str, subset: &str) -> Result<String> {
        self.text_scalar("scan gtid subtract result", "SELECT GTID_SUBTRACT(?, ?)", &[set, subset])
            .await
            .map(Option::unwrap_or_default)
    }

    async fn install_binlog_functions(&self) -> Result<()> {
        if self.uses_component().await? {
            if !self.component_installed().await? {
                info!(host = %self.host, "installing binlog UDF component");
                sqlx::raw_sql(&format!("INSTALL COMPONENT '{COMPONENT_URN}'"))
                    .execute(&self.pool)
                    .await
                    .map_err(|e| self.err("install component", e))?;
            }
            return Ok(());
        }

        for (name, returns) in BINLOG_FUNCTIONS {
            if self.function_exists(name).await? {
                continue;
            }
            debug!(host = %self.host, function = name, "creating binlog function");
            sqlx::raw_sql(&format!(
                "CREATE FUNCTION {name} RETURNS {returns} SONAME 'binlog_utils_udf.so'"
            ))
            .execute(&self.pool)
            .await
            .map_err(|e| self.err("create function", e))?;
        }
        Ok(())
    }

    async fn remove_binlog_functions(&self) -> Result<()> {
        if self.uses_component().await? {
            if self.component_installed().await? {
                sqlx::raw_sql(&format!("UNINSTALL COMPONENT '{COMPONENT_URN}'"))
                    .execute(&self.pool)
                    .await
                    .map_err(|e| self.err("uninstall component", e))?;
            }
            return Ok(());
        }

        for (name, _) in BINLOG_FUNCTIONS {
            sqlx::raw_sql(&format!("DROP FUNCTION IF EXISTS {name}"))
                .execute(&self.pool)
                .await
                .map_err(|e| self.err("drop function", e))?;
        }
        Ok(())
    }
}

/// Connects with fixed credentials
pub struct MySqlConnector {
    user: String,
    password: String,
}

impl MySqlConnector {
    /// Connector for `user`
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl DatabaseConnector for MySqlConnector {
    async fn connect(&self, host: &str) -> Result<Box<dyn BinlogDatabase>> {
        Ok(Box::new(MySqlDatabase::connect(host, &self.user, &self.password)?))
    }
}

/// Node status lines of a PXC service, as printed by `peer-list`
pub async fn discover_nodes(service: &str) -> Result<Vec<String>> {
    let output = Command::new("peer-list")
        .arg("-on-start=/usr/bin/get-pxc-state")
        .arg(format!("-service={service}"))
        .output()
        .await?;
    if !output.status.success() {
        return Err(PitrError::command(
            "peer-list",
            format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(parse_nodes(&String::from_utf8_lossy(&output.stdout)))
}

/// Split `peer-list` output into one status line per node
pub fn parse_nodes(output: &str) -> Vec<String> {
    output
        .split("node:")
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect()
}

/// Hosts of the synced primary nodes, sorted
pub fn primary_hosts(nodes: &[String]) -> Vec<String> {
    let mut hosts: Vec<String> = nodes
        .iter()
        .filter(|n| n.contains(SYNCED_PRIMARY_STATE))
        .filter_map(|n| n.split(':').next())
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect();
    hosts.sort();
    hosts
}

/// First synced primary host in name order
pub fn first_primary_host(nodes: &[String]) -> Result<String> {
    primary_hosts(nodes).into_iter().next().ok_or(PitrError::NoHost)
}

/// Synced primary host whose oldest binlog starts earliest.
///
/// Hosts that can't be queried are skipped.
pub async fn oldest_binlog_host(
    connector: &dyn DatabaseConnector,
    nodes: &[String],
) -> Result<String> {
    let mut oldest: Option<(String, i64)> = None;
    for host in primary_hosts(nodes) {
        let ts = match first_binlog_time(connector, &host).await {
            Ok(ts) => ts,
            Err(e) => {
                error!(host = %host, error = %e, "get binlog time");
                continue;
            }
        };
        match &oldest {
            Some((_, best)) if *best <= ts => {}
            _ => oldest = Some((host, ts)),
        }
    }
    oldest.map(|(host, _)| host).ok_or(PitrError::NoHost)
}

async fn first_binlog_time(connector: &dyn DatabaseConnector, host: &str) -> Result<i64> {
    let db = connector.connect(host).await?;
    let names = db.binlog_names().await?;
    if names.is_empty() {
        return Err(PitrError::database(host, "no binlogs found"));
    }
    for name in &names {
        match db.first_timestamp(name).await {
            Ok(ts) if ts > 0 => return Ok(ts),
            Ok(_) => {}
            Err(e) => error!(host, binlog = %name, error = %e, "get binlog timestamp"),
        }
    }
    Err(PitrError::database(host, "no binlogs timestamp found"))
}
