use crate::backup::adapter::error::{DiscoveryError, DumpError};
use crate::backup::adapter::{run_dump, Adapter, DatabaseSelector, DumpArtifact, DumpOptions};
use crate::backup::process::{CommandRunner, CommandSpec};
use crate::backup::redacted::RedactedString;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::path::{Path, PathBuf};
use std::result;
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;

/// Name used for the whole-instance snapshot
pub const WHOLE_INSTANCE: &str = "all";

const SAVE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const CONFIG_TIMEOUT: Duration = Duration::from_secs(10);

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_save_fallback() -> bool {
    true
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Getters, CopyGetters)]
pub struct RedisConfig {
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
    #[getset(get = "pub")]
    password: Option<RedactedString>,
    /// Falls back to `SAVE` and copying the server's RDB file when `--rdb` fails
    #[serde(default = "default_save_fallback")]
    #[getset(get_copy = "pub")]
    save_fallback: bool,
}

pub struct RedisAdapter {
    config: RedisConfig,
    runner: Arc<dyn CommandRunner>,
}

impl RedisAdapter {
    pub fn new(config: RedisConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    fn command(&self) -> CommandSpec {
        let spec = CommandSpec::new("redis-cli").args([
            "-h".to_string(),
            self.config.host.clone(),
            "-p".to_string(),
            self.config.port.to_string(),
        ]);
        match &self.config.password {
            Some(pw) => spec.secret_env("REDISCLI_AUTH", pw),
            None => spec,
        }
    }

    /// Runs a redis-cli command and returns its stdout, mapping failures
    /// onto the dump of `name`.
    fn query(&self, name: &str, args: &[&str], timeout: Duration) -> result::Result<String, DumpError> {
        let spec = self.command().args(args.iter().copied());
        let output = self
            .runner
            .run(&spec, timeout)
            .map_err(|e| DumpError::from_process(name, e))?;
        if !output.success() {
            return Err(DumpError::NonZeroExit {
                database: name.to_string(),
                program: spec.program().to_string(),
                code: output.status,
                stderr: output.stderr,
            });
        }
        Ok(output.stdout)
    }

    /// `CONFIG GET key` answers with the key on one line and the value on the next.
    fn config_get(&self, name: &str, key: &str) -> result::Result<String, DumpError> {
        let stdout = self.query(name, &["CONFIG", "GET", key], CONFIG_TIMEOUT)?;
        stdout
            .lines()
            .nth(1)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| DumpError::engine(name, format!("CONFIG GET {key} returned no value")))
    }

    fn dump_with_save(&self, name: &str, destination: &Path) -> result::Result<DumpArtifact, DumpError> {
        let saved = self.query(name, &["SAVE"], SAVE_TIMEOUT)?;
        if !saved.contains("OK") {
            return Err(DumpError::engine(
                name,
                format!("SAVE answered {:?}", saved.trim()),
            ));
        }
        let rdb_path = PathBuf::from(self.config_get(name, "dir")?)
            .join(self.config_get(name, "dbfilename")?);
        tracing::debug!("Copying redis snapshot {:?} to {:?}", rdb_path, destination);
        std::fs::copy(&rdb_path, destination).map_err(|e| {
            DumpError::engine(
                name,
                format!("cannot copy {rdb_path:?}, is the redis data dir readable? {e}"),
            )
        })?;
        DumpArtifact::collect(name, destination)
    }
}

impl Adapter for RedisAdapter {
    fn kind(&self) -> &str {
        "redis"
    }

    fn is_enabled(&self) -> bool {
        self.config.options.enabled()
    }

    fn file_ext(&self) -> Option<&str> {
        Some("rdb")
    }

    /// Redis is snapshotted as a whole, the server is never asked.
    fn list_databases(&self) -> result::Result<Vec<String>, DiscoveryError> {
        match self.config.options.databases() {
            DatabaseSelector::Explicit(names) => Ok(names.clone()),
            DatabaseSelector::All => Ok(vec![WHOLE_INSTANCE.to_string()]),
        }
    }

    fn dump_database(
        &self,
        name: &str,
        destination: &Path,
    ) -> result::Result<DumpArtifact, DumpError> {
        let spec = self
            .command()
            .arg("--rdb")
            .arg(destination.to_string_lossy())
            .args(self.config.options.extra_args());
        let primary = run_dump(
            self.runner.as_ref(),
            &spec,
            self.config.options.dump_timeout(),
            name,
            destination,
        );
        match primary {
            Err(e) if !e.is_timeout() && self.config.save_fallback => {
                tracing::warn!("redis-cli --rdb failed ({}), trying SAVE", e);
                self.dump_with_save(name, destination).map_err(|fallback| {
                    tracing::warn!("SAVE fallback failed too: {}", fallback);
                    e
                })
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::process::testing::{timeout_of, ScriptedRunner};
    use crate::backup::process::CommandOutput;
    use itertools::Itertools;
    use tempfile::TempDir;

    fn adapter(yaml: &str, runner: Arc<ScriptedRunner>) -> RedisAdapter {
        let config: RedisConfig = serde_yml::from_str(yaml).unwrap();
        RedisAdapter::new(config, runner)
    }

    fn last_plain(spec: &CommandSpec) -> Option<String> {
        spec.arg_list()
            .last()
            .and_then(|a| a.as_plain())
            .map(str::to_string)
    }

    #[test]
    fn test_all_is_whole_instance_without_server() {
        let runner = Arc::new(ScriptedRunner::new(|_| Ok(CommandOutput::ok(""))));
        let redis = adapter("{}", runner.clone());
        assert_eq!(redis.list_databases().unwrap(), vec![WHOLE_INSTANCE]);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_rdb_dump_uses_auth_env() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("all.rdb");
        let runner = Arc::new(ScriptedRunner::new(|spec| {
            std::fs::write(spec.value_of("--rdb").unwrap(), "REDIS0011").unwrap();
            Ok(CommandOutput::ok(""))
        }));
        let redis = adapter("password: pw", runner.clone());
        let artifact = redis.dump_database(WHOLE_INSTANCE, &dest).unwrap();
        assert_eq!(artifact.size(), 9);

        let call = &runner.calls()[0];
        assert_eq!(call.program(), "redis-cli");
        assert_eq!(call.env_keys().collect_vec(), vec!["REDISCLI_AUTH"]);
        assert_eq!(call.value_of("-p"), Some("6379"));
    }

    #[test]
    fn test_falls_back_to_save() {
        let data = TempDir::new().unwrap();
        std::fs::write(data.path().join("dump.rdb"), "REDIS0011snapshot").unwrap();
        let data_dir = data.path().to_string_lossy().to_string();

        let scratch = TempDir::new().unwrap();
        let dest = scratch.path().join("all.rdb");
        let runner = Arc::new(ScriptedRunner::new(move |spec| {
            match last_plain(spec).as_deref() {
                Some("SAVE") => Ok(CommandOutput::ok("OK\n")),
                Some("dir") => Ok(CommandOutput::ok(format!("dir\n{data_dir}\n"))),
                Some("dbfilename") => Ok(CommandOutput::ok("dbfilename\ndump.rdb\n")),
                _ => Ok(CommandOutput::failed(1, "ERR unknown command 'SYNC'")),
            }
        }));
        let redis = adapter("{}", runner.clone());

        let artifact = redis.dump_database(WHOLE_INSTANCE, &dest).unwrap();
        assert_eq!(artifact.size(), 17);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "REDIS0011snapshot");
        assert_eq!(runner.calls().len(), 4);
    }

    #[test]
    fn test_failed_fallback_reports_primary_error() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|spec| match last_plain(spec).as_deref() {
            Some("SAVE") => Ok(CommandOutput::failed(1, "NOPERM")),
            _ => Ok(CommandOutput::failed(1, "ERR unknown command 'SYNC'")),
        }));
        let redis = adapter("{}", runner);
        let err = redis
            .dump_database(WHOLE_INSTANCE, &dir.path().join("all.rdb"))
            .unwrap_err();
        assert!(err.to_string().contains("SYNC"));
    }

    #[test]
    fn test_timeout_skips_fallback() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|spec| Err(timeout_of(spec))));
        let redis = adapter("{}", runner.clone());
        let err = redis
            .dump_database(WHOLE_INSTANCE, &dir.path().join("all.rdb"))
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn test_fallback_disabled() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|_| Ok(CommandOutput::failed(1, "nope"))));
        let redis = adapter("save_fallback: false", runner.clone());
        assert!(redis
            .dump_database(WHOLE_INSTANCE, &dir.path().join("all.rdb"))
            .is_err());
        assert_eq!(runner.calls().len(), 1);
    }
}
