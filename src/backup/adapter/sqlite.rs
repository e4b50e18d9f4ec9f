use crate::backup::adapter::error::{DiscoveryError, DumpError};
use crate::backup::adapter::{Adapter, DatabaseSelector, DumpArtifact, DumpOptions};
use crate::backup::validate::validate_dir_exist;
use bon::Builder;
use getset::Getters;
use globset::{Glob, GlobSet, GlobSetBuilder};
use itertools::Itertools;
use rusqlite::{Connection, OpenFlags, MAIN_DB};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::result;
use validator::Validate;
use walkdir::WalkDir;

fn default_patterns() -> Vec<Glob> {
    ["*.db", "*.sqlite", "*.sqlite3"]
        .into_iter()
        .filter_map(|p| Glob::new(p).ok())
        .collect()
}

/// SQLite files are discovered in a directory instead of asked from a server.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[getset(get = "pub")]
pub struct SqliteConfig {
    #[serde(flatten)]
    #[validate(nested)]
    #[builder(default)]
    options: DumpOptions,
    #[validate(custom(function = validate_dir_exist))]
    #[builder(into)]
    data_dir: PathBuf,
    #[serde(default = "default_patterns")]
    #[builder(default = default_patterns(), into)]
    patterns: Vec<Glob>,
}

pub struct SqliteAdapter {
    config: SqliteConfig,
}

impl SqliteAdapter {
    pub fn new(config: SqliteConfig) -> Self {
        Self { config }
    }

    fn glob_set(&self) -> result::Result<GlobSet, globset::Error> {
        self.config
            .patterns
            .iter()
            .fold(GlobSetBuilder::new(), |mut builder, glob| {
                builder.add(glob.clone());
                builder
            })
            .build()
    }
}

impl Adapter for SqliteAdapter {
    fn kind(&self) -> &str {
        "sqlite"
    }

    fn is_enabled(&self) -> bool {
        self.config.options.enabled()
    }

    /// File names already carry their extension.
    fn file_ext(&self) -> Option<&str> {
        None
    }

    fn list_databases(&self) -> result::Result<Vec<String>, DiscoveryError> {
        if let DatabaseSelector::Explicit(names) = self.config.options.databases() {
            return Ok(names.clone());
        }
        let engine = |message: String| DiscoveryError::Engine {
            kind: self.kind().to_string(),
            message,
        };
        let set = self.glob_set().map_err(|e| engine(e.to_string()))?;

        let entries = WalkDir::new(&self.config.data_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .collect::<result::Result<Vec<_>, _>>()
            .map_err(|e| engine(format!("cannot scan {:?}: {e}", self.config.data_dir)))?;

        Ok(entries
            .into_iter()
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|name| set.is_match(name))
            .sorted()
            .collect())
    }

    /// Online backup through the SQLite backup API, safe against concurrent writers.
    fn dump_database(
        &self,
        name: &str,
        destination: &Path,
    ) -> result::Result<DumpArtifact, DumpError> {
        let src = self.config.data_dir.join(name);
        if !src.is_file() {
            return Err(DumpError::engine(name, format!("{src:?} is not a file")));
        }
        tracing::info!("Backing up sqlite database {:?}", src);
        let conn = Connection::open_with_flags(
            &src,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| DumpError::engine(name, e))?;
        conn.backup(MAIN_DB, destination, None)
            .map_err(|e| DumpError::engine(name, e))?;
        DumpArtifact::collect(name, destination)
    }
}
