use crate::backup::adapter::error::{DiscoveryError, DumpError};
use crate::backup::adapter::{
    parse_listing, run_discovery, run_dump, Adapter, DatabaseSelector, DumpArtifact, DumpOptions,
};
use crate::backup::process::{CommandRunner, CommandSpec};
use crate::backup::redacted::RedactedString;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::path::Path;
use std::result;
use std::sync::Arc;
use validator::Validate;

const SYSTEM_SCHEMAS: [&str; 4] = ["information_schema", "performance_schema", "mysql", "sys"];

/// MySQL and MariaDB speak the same protocol but ship differently named clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MysqlFlavor {
    Mysql,
    Mariadb,
}

impl MysqlFlavor {
    pub fn kind(self) -> &'static str {
        match self {
            MysqlFlavor::Mysql => "mysql",
            MysqlFlavor::Mariadb => "mariadb",
        }
    }

    fn client(self) -> &'static str {
        match self {
            MysqlFlavor::Mysql => "mysql",
            MysqlFlavor::Mariadb => "mariadb",
        }
    }

    fn dump_tool(self) -> &'static str {
        match self {
            MysqlFlavor::Mysql => "mysqldump",
            MysqlFlavor::Mariadb => "mariadb-dump",
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    3306
}

fn default_user() -> String {
    "root".to_string()
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Getters, CopyGetters)]
pub struct MysqlConfig {
    #[serde(flatten)]
    #[validate(nested)]
    #[getset(get = "pub")]
    options: DumpOptions,
    #[serde(default = "default_host")]
    #[validate(length(min = 1))]
    #[getset(get = "pub")]
    host: String,
    #[serde(default = "default_port")]
    #[getset(get_copy = "pub")]
    port: u16,
    #[serde(default = "default_user")]
    #[getset(get = "pub")]
    user: String,
    #[getset(get = "pub")]
    password: Option<RedactedString>,
}

pub struct MysqlAdapter {
    flavor: MysqlFlavor,
    config: MysqlConfig,
    runner: Arc<dyn CommandRunner>,
}

impl MysqlAdapter {
    pub fn new(flavor: MysqlFlavor, config: MysqlConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            flavor,
            config,
            runner,
        }
    }

    fn command(&self, program: &str) -> CommandSpec {
        let spec = CommandSpec::new(program).args([
            "-h".to_string(),
            self.config.host.clone(),
            "-P".to_string(),
            self.config.port.to_string(),
            "-u".to_string(),
            self.config.user.clone(),
        ]);
        match &self.config.password {
            Some(pw) => spec.secret_env("MYSQL_PWD", pw),
            None => spec,
        }
    }
}

impl Adapter for MysqlAdapter {
    fn kind(&self) -> &str {
        self.flavor.kind()
    }

    fn is_enabled(&self) -> bool {
        self.config.options.enabled()
    }

    fn file_ext(&self) -> Option<&str> {
        Some("sql")
    }

    fn list_databases(&self) -> result::Result<Vec<String>, DiscoveryError> {
        if let DatabaseSelector::Explicit(names) = self.config.options.databases() {
            return Ok(names.clone());
        }
        let spec = self
            .command(self.flavor.client())
            .args(["-N", "-e", "SHOW DATABASES;"]);
        let stdout = run_discovery(self.runner.as_ref(), &spec, self.kind())?;
        Ok(parse_listing(&stdout, &SYSTEM_SCHEMAS))
    }

    fn dump_database(
        &self,
        name: &str,
        destination: &Path,
    ) -> result::Result<DumpArtifact, DumpError> {
        let spec = self
            .command(self.flavor.dump_tool())
            .args([
                "--single-transaction",
                "--routines",
                "--triggers",
                "--events",
            ])
            .args(self.config.options.extra_args())
            .args(["--", name])
            .stdout_to(destination);
        run_dump(
            self.runner.as_ref(),
            &spec,
            self.config.options.dump_timeout(),
            name,
            destination,
        )
    }
}
