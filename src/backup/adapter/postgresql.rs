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
use std::time::Duration;
use validator::Validate;

/// Synthetic artifact holding roles and tablespaces
pub const GLOBALS_ARTIFACT: &str = "postgresql_globals";

const LIST_QUERY: &str = "SELECT datname FROM pg_database WHERE datistemplate = false;";
const GLOBALS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_dump_globals() -> bool {
    true
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Getters, CopyGetters)]
pub struct PostgresqlConfig {
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
    #[serde(default = "default_dump_globals")]
    #[getset(get_copy = "pub")]
    dump_globals: bool,
}

pub struct PostgresqlAdapter {
    config: PostgresqlConfig,
    runner: Arc<dyn CommandRunner>,
}

impl PostgresqlAdapter {
    pub fn new(config: PostgresqlConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    /// `program -h host -p port -U user` with `PGPASSWORD` when set
    fn command(&self, program: &str) -> CommandSpec {
        let spec = CommandSpec::new(program).args([
            "-h".to_string(),
            self.config.host.clone(),
            "-p".to_string(),
            self.config.port.to_string(),
            "-U".to_string(),
            self.config.user.clone(),
        ]);
        match &self.config.password {
            Some(pw) => spec.secret_env("PGPASSWORD", pw),
            None => spec,
        }
    }
}

/// `-d` takes a whole connection string once the name holds `=` or a URI
/// prefix, so the name is always passed quoted as the `dbname` keyword.
fn dbname_conninfo(name: &str) -> String {
    format!(
        "dbname='{}'",
        name.replace('\\', "\\\\").replace('\'', "\\'")
    )
}

impl Adapter for PostgresqlAdapter {
    fn kind(&self) -> &str {
        "postgresql"
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
        let spec = self.command("psql").args(["-t", "-A", "-c", LIST_QUERY]);
        let stdout = run_discovery(self.runner.as_ref(), &spec, self.kind())?;
        Ok(parse_listing(&stdout, &[]))
    }

    fn dump_database(
        &self,
        name: &str,
        destination: &Path,
    ) -> result::Result<DumpArtifact, DumpError> {
        let spec = self
            .command("pg_dump")
            .arg("-d")
            .arg(dbname_conninfo(name))
            .arg("-f")
            .arg(destination.to_string_lossy())
            .args(self.config.options.extra_args());
        run_dump(
            self.runner.as_ref(),
            &spec,
            self.config.options.dump_timeout(),
            name,
            destination,
        )
    }

    fn extra_artifacts(&self) -> Vec<String> {
        if self.config.dump_globals {
            vec![GLOBALS_ARTIFACT.to_string()]
        } else {
            Vec::new()
        }
    }

    fn dump_extra(&self, name: &str, destination: &Path) -> result::Result<DumpArtifact, DumpError> {
        if name != GLOBALS_ARTIFACT || !self.config.dump_globals {
            return Err(DumpError::engine(
                name,
                format!("postgresql has no extra artifact named {name:?}"),
            ));
        }
        let spec = self
            .command("pg_dumpall")
            .args(["--globals-only", "-f"])
            .arg(destination.to_string_lossy());
        run_dump(
            self.runner.as_ref(),
            &spec,
            GLOBALS_TIMEOUT,
            name,
            destination,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::process::testing::ScriptedRunner;
    use crate::backup::process::CommandOutput;
    use itertools::Itertools;
    use tempfile::TempDir;

    fn adapter(yaml: &str, runner: Arc<ScriptedRunner>) -> PostgresqlAdapter {
        let config: PostgresqlConfig = serde_yml::from_str(yaml).unwrap();
        PostgresqlAdapter::new(config, runner)
    }

    /// Writes some bytes to whatever follows `-f`, like the real tools do.
    fn writing_runner() -> Arc<ScriptedRunner> {
        Arc::new(ScriptedRunner::new(|spec| {
            if let Some(dest) = spec.value_of("-f") {
                std::fs::write(dest, "-- dump\n").unwrap();
            }
            Ok(CommandOutput::ok(""))
        }))
    }

    #[test]
    fn test_defaults() {
        let config: PostgresqlConfig = serde_yml::from_str("{}").unwrap();
        assert_eq!(config.host(), "localhost");
        assert_eq!(config.port(), 5432);
        assert_eq!(config.user(), "postgres");
        assert!(config.password().is_none());
        assert!(config.dump_globals());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_selector_skips_engine() {
        let runner = writing_runner();
        let pg = adapter("databases: 'app, audit'", runner.clone());
        assert_eq!(pg.list_databases().unwrap(), vec!["app", "audit"]);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_list_all_queries_psql() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            Ok(CommandOutput::ok("postgres\napp\n\naudit\n"))
        }));
        let pg = adapter("{host: db, password: pw}", runner.clone());
        assert_eq!(pg.list_databases().unwrap(), vec!["postgres", "app", "audit"]);

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program(), "psql");
        assert_eq!(calls[0].value_of("-h"), Some("db"));
        assert_eq!(calls[0].value_of("-c"), Some(LIST_QUERY));
        assert_eq!(calls[0].env_keys().collect_vec(), vec!["PGPASSWORD"]);
    }

    #[test]
    fn test_list_failure_is_discovery_error() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            Ok(CommandOutput::failed(2, "could not connect"))
        }));
        let pg = adapter("{}", runner);
        assert!(matches!(
            pg.list_databases(),
            Err(DiscoveryError::Failed { .. })
        ));
    }

    #[test]
    fn test_dump_database_args() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("app.sql");
        let runner = writing_runner();
        let pg = adapter("{port: 6543, extra_opts: '--no-owner'}", runner.clone());

        let artifact = pg.dump_database("app", &dest).unwrap();
        assert_eq!(artifact.name(), "app");
        assert_eq!(artifact.size(), 8);
        assert!(!artifact.is_dir());

        let call = &runner.calls()[0];
        assert_eq!(call.program(), "pg_dump");
        assert_eq!(call.value_of("-p"), Some("6543"));
        assert_eq!(call.value_of("-d"), Some("dbname='app'"));
        assert_eq!(call.value_of("-f"), dest.to_str());
        assert_eq!(
            call.arg_list().last().and_then(|a| a.as_plain()),
            Some("--no-owner")
        );
    }

    #[test]
    fn test_dbname_never_read_as_connection_string() {
        assert_eq!(dbname_conninfo("app"), "dbname='app'");
        assert_eq!(
            dbname_conninfo("host=evil sslmode=disable"),
            "dbname='host=evil sslmode=disable'"
        );
        assert_eq!(
            dbname_conninfo("postgresql://evil/db"),
            "dbname='postgresql://evil/db'"
        );
        assert_eq!(dbname_conninfo(r"o'neil\x"), r"dbname='o\'neil\\x'");
    }

    #[test]
    fn test_dump_without_output_fails() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|_| Ok(CommandOutput::ok(""))));
        let pg = adapter("{}", runner);
        let err = pg.dump_database("app", &dir.path().join("app.sql")).unwrap_err();
        assert_eq!(err.label(), "missing_output");
    }

    #[test]
    fn test_globals_artifact() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("postgresql_globals.sql");
        let runner = writing_runner();
        let pg = adapter("{}", runner.clone());

        assert_eq!(pg.extra_artifacts(), vec![GLOBALS_ARTIFACT]);
        pg.dump_extra(GLOBALS_ARTIFACT, &dest).unwrap();
        let call = &runner.calls()[0];
        assert_eq!(call.program(), "pg_dumpall");
        assert!(call
            .arg_list()
            .iter()
            .any(|a| a.as_plain() == Some("--globals-only")));

        let no_globals = adapter("dump_globals: false", writing_runner());
        assert!(no_globals.extra_artifacts().is_empty());
        assert!(no_globals.dump_extra(GLOBALS_ARTIFACT, &dest).is_err());
    }
}
