pub mod error;
pub mod mongodb;
pub mod mysql;
pub mod postgresql;
pub mod redis;
pub mod sqlite;

use crate::backup::adapter::error::{DiscoveryError, DumpError};
use crate::backup::adapter::mongodb::{MongodbAdapter, MongodbConfig};
use crate::backup::adapter::mysql::{MysqlAdapter, MysqlConfig, MysqlFlavor};
use crate::backup::adapter::postgresql::{PostgresqlAdapter, PostgresqlConfig};
use crate::backup::adapter::redis::{RedisAdapter, RedisConfig};
use crate::backup::adapter::sqlite::{SqliteAdapter, SqliteConfig};
use crate::backup::process::{CommandRunner, CommandSpec};
use crate::backup::validate::validate_database_name;
use bon::Builder;
use chrono::{DateTime, Local};
use derive_more::From;
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::result;
use std::sync::Arc;
use std::time::Duration;
use validator::{Validate, ValidationError, ValidationErrors};
use walkdir::WalkDir;

/// Timeout for the short administrative calls that enumerate databases
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// One database engine, seen through the operations a backup run needs.
///
/// Every call is self-contained: implementations may spawn a short-lived
/// subprocess but never keep a connection open between calls.
pub trait Adapter: Send + Sync {
    /// Stable name of the engine, also used as the remote path prefix
    fn kind(&self) -> &str;

    fn is_enabled(&self) -> bool;

    /// Extension appended to file artifacts inside the archive
    fn file_ext(&self) -> Option<&str>;

    /// Databases to back up, in the order they should be dumped.
    fn list_databases(&self) -> result::Result<Vec<String>, DiscoveryError>;

    /// Dumps `name` to `destination`.
    ///
    /// On success the destination exists and is not empty.
    fn dump_database(&self, name: &str, destination: &Path)
        -> result::Result<DumpArtifact, DumpError>;

    /// Synthetic names of adapter-wide artifacts not tied to one database.
    fn extra_artifacts(&self) -> Vec<String> {
        Vec::new()
    }

    fn dump_extra(&self, name: &str, _destination: &Path) -> result::Result<DumpArtifact, DumpError> {
        Err(DumpError::engine(
            name,
            format!("{} has no extra artifact named {name:?}", self.kind()),
        ))
    }
}

/// Which databases of an engine to back up.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SelectorRepr", into = "SelectorRepr")]
pub enum DatabaseSelector {
    #[default]
    All,
    Explicit(Vec<String>),
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum SelectorRepr {
    Text(String),
    List(Vec<String>),
}

impl TryFrom<SelectorRepr> for DatabaseSelector {
    type Error = String;

    fn try_from(value: SelectorRepr) -> result::Result<Self, Self::Error> {
        let names = match value {
            SelectorRepr::Text(text) if text.trim().eq_ignore_ascii_case("all") => {
                return Ok(DatabaseSelector::All)
            }
            SelectorRepr::Text(text) => text
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect_vec(),
            SelectorRepr::List(list) => list
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect_vec(),
        };
        if names.is_empty() {
            return Err("database selector must be \"all\" or name at least one database".into());
        }
        Ok(DatabaseSelector::Explicit(names))
    }
}

impl From<DatabaseSelector> for SelectorRepr {
    fn from(value: DatabaseSelector) -> Self {
        match value {
            DatabaseSelector::All => SelectorRepr::Text("all".into()),
            DatabaseSelector::Explicit(names) => SelectorRepr::List(names),
        }
    }
}

fn validate_selector(selector: &DatabaseSelector) -> result::Result<(), ValidationError> {
    match selector {
        DatabaseSelector::All => Ok(()),
        DatabaseSelector::Explicit(names) => names.iter().try_for_each(validate_database_name),
    }
}

fn default_enabled() -> bool {
    true
}

fn default_dump_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

/// Options every adapter kind shares.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, CopyGetters)]
pub struct DumpOptions {
    #[serde(default = "default_enabled")]
    #[builder(default = default_enabled())]
    #[getset(get_copy = "pub")]
    enabled: bool,
    #[serde(default)]
    #[builder(default)]
    #[validate(custom(function = validate_selector))]
    #[getset(get = "pub")]
    databases: DatabaseSelector,
    #[serde(default)]
    #[getset(get = "pub")]
    extra_opts: Option<String>,
    #[serde(default = "default_dump_timeout", with = "humantime_serde")]
    #[builder(default = default_dump_timeout())]
    #[getset(get_copy = "pub")]
    dump_timeout: Duration,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl DumpOptions {
    /// `extra_opts` split the way a shell would split unquoted words.
    pub fn extra_args(&self) -> Vec<String> {
        self.extra_opts
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_string).collect_vec())
            .unwrap_or_default()
    }
}

/// Configuration of one adapter, tagged by database kind.
#[derive(Clone, From, Serialize, Deserialize, Debug)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum AdapterConfig {
    Postgresql(PostgresqlConfig),
    #[from(ignore)]
    Mysql(MysqlConfig),
    #[from(ignore)]
    Mariadb(MysqlConfig),
    Mongodb(MongodbConfig),
    Redis(RedisConfig),
    Sqlite(SqliteConfig),
}

impl AdapterConfig {
    pub fn options(&self) -> &DumpOptions {
        match self {
            AdapterConfig::Postgresql(c) => c.options(),
            AdapterConfig::Mysql(c) | AdapterConfig::Mariadb(c) => c.options(),
            AdapterConfig::Mongodb(c) => c.options(),
            AdapterConfig::Redis(c) => c.options(),
            AdapterConfig::Sqlite(c) => c.options(),
        }
    }

    pub fn build(&self, runner: Arc<dyn CommandRunner>) -> Box<dyn Adapter> {
        match self {
            AdapterConfig::Postgresql(c) => Box::new(PostgresqlAdapter::new(c.clone(), runner)),
            AdapterConfig::Mysql(c) => {
                Box::new(MysqlAdapter::new(MysqlFlavor::Mysql, c.clone(), runner))
            }
            AdapterConfig::Mariadb(c) => {
                Box::new(MysqlAdapter::new(MysqlFlavor::Mariadb, c.clone(), runner))
            }
            AdapterConfig::Mongodb(c) => Box::new(MongodbAdapter::new(c.clone(), runner)),
            AdapterConfig::Redis(c) => Box::new(RedisAdapter::new(c.clone(), runner)),
            AdapterConfig::Sqlite(c) => Box::new(SqliteAdapter::new(c.clone())),
        }
    }
}

impl Validate for AdapterConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            AdapterConfig::Postgresql(c) => c.validate(),
            AdapterConfig::Mysql(c) | AdapterConfig::Mariadb(c) => c.validate(),
            AdapterConfig::Mongodb(c) => c.validate(),
            AdapterConfig::Redis(c) => c.validate(),
            AdapterConfig::Sqlite(c) => c.validate(),
        }
    }
}

/// A file or directory produced by one dump.
#[derive(Clone, Debug, PartialEq, Eq, Getters, CopyGetters)]
pub struct DumpArtifact {
    #[getset(get = "pub")]
    name: String,
    #[getset(get = "pub")]
    path: PathBuf,
    #[getset(get_copy = "pub")]
    size: u64,
    #[getset(get_copy = "pub")]
    produced_at: DateTime<Local>,
    #[getset(get_copy = "pub")]
    is_dir: bool,
}

impl DumpArtifact {
    /// Checks what a dump tool left at `path`.
    ///
    /// A missing path, an empty file, or a directory without any byte of
    /// content is a failed dump even when the tool exited cleanly.
    pub fn collect<S: Into<String>, P: AsRef<Path>>(
        name: S,
        path: P,
    ) -> result::Result<DumpArtifact, DumpError> {
        let name = name.into();
        let path = path.as_ref();
        let missing = |reason| DumpError::MissingOutput {
            database: name.clone(),
            path: path.to_path_buf(),
            reason,
        };

        let md = std::fs::metadata(path).map_err(|_| missing("missing"))?;
        let size = if md.is_dir() {
            WalkDir::new(path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum()
        } else {
            md.len()
        };
        if size == 0 {
            return Err(missing("empty"));
        }

        tracing::debug!("Collected artifact {:?} at {:?} ({} bytes)", name, path, size);
        Ok(DumpArtifact {
            name,
            path: path.to_path_buf(),
            size,
            produced_at: Local::now(),
            is_dir: md.is_dir(),
        })
    }
}

/// Runs a dump command and checks its artifact.
pub(crate) fn run_dump(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
    timeout: Duration,
    database: &str,
    destination: &Path,
) -> result::Result<DumpArtifact, DumpError> {
    tracing::info!("Dumping {:?} with {}", database, spec.program());
    let output = runner
        .run(spec, timeout)
        .map_err(|e| DumpError::from_process(database, e))?;
    if !output.success() {
        return Err(DumpError::NonZeroExit {
            database: database.to_string(),
            program: spec.program().to_string(),
            code: output.status,
            stderr: output.stderr,
        });
    }
    DumpArtifact::collect(database, destination)
}

/// Runs a listing command and returns its stdout.
///
/// Any failure discards whatever was printed, so a half answer never
/// becomes a short database list.
pub(crate) fn run_discovery(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
    kind: &str,
) -> result::Result<String, DiscoveryError> {
    tracing::info!("Listing {} databases", kind);
    let output = runner
        .run(spec, DISCOVERY_TIMEOUT)
        .map_err(|e| DiscoveryError::from_process(kind, e))?;
    if !output.success() {
        return Err(DiscoveryError::Failed {
            kind: kind.to_string(),
            code: output.status,
            stderr: output.stderr,
        });
    }
    Ok(output.stdout)
}

/// One name per line, blank lines and `deny` entries dropped.
pub(crate) fn parse_listing(stdout: &str, deny: &[&str]) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !deny.contains(l))
        .map(str::to_string)
        .collect_vec()
}

/// Name of a database's artifact inside the scratch dir and the archive.
pub fn entry_name(name: &str, file_ext: Option<&str>) -> String {
    match file_ext {
        Some(ext) => format!("{name}.{ext}"),
        None => name.to_string(),
    }
}
