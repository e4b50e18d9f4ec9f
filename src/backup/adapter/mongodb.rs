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

const SYSTEM_DATABASES: [&str; 3] = ["admin", "local", "config"];
const LIST_SCRIPT: &str =
    "db.adminCommand(\"listDatabases\").databases.map(d => d.name).join(\"\\n\")";

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    27017
}

fn default_auth_db() -> String {
    "admin".to_string()
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Getters, CopyGetters)]
pub struct MongodbConfig {
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
    user: Option<String>,
    #[getset(get = "pub")]
    password: Option<RedactedString>,
    #[serde(default = "default_auth_db")]
    #[getset(get = "pub")]
    auth_db: String,
}

pub struct MongodbAdapter {
    config: MongodbConfig,
    runner: Arc<dyn CommandRunner>,
}

impl MongodbAdapter {
    pub fn new(config: MongodbConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    fn command(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program).args([
            "--host".to_string(),
            self.config.host.clone(),
            "--port".to_string(),
            self.config.port.to_string(),
        ])
    }

    /// Credentials are only passed when both user and password are set.
    fn with_auth(&self, spec: CommandSpec) -> CommandSpec {
        match (&self.config.user, &self.config.password) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => spec
                .args(["--username", user.as_str(), "--password"])
                .secret_arg(password)
                .args(["--authenticationDatabase", self.config.auth_db.as_str()]),
            _ => spec,
        }
    }
}

impl Adapter for MongodbAdapter {
    fn kind(&self) -> &str {
        "mongodb"
    }

    fn is_enabled(&self) -> bool {
        self.config.options.enabled()
    }

    fn file_ext(&self) -> Option<&str> {
        None
    }

    fn list_databases(&self) -> result::Result<Vec<String>, DiscoveryError> {
        if let DatabaseSelector::Explicit(names) = self.config.options.databases() {
            return Ok(names.clone());
        }
        let spec = self.with_auth(
            self.command("mongosh")
                .args(["--quiet", "--eval", LIST_SCRIPT]),
        );
        let stdout = run_discovery(self.runner.as_ref(), &spec, self.kind())?;
        Ok(parse_listing(&stdout, &SYSTEM_DATABASES))
    }

    /// mongodump always writes `<out>/<name>/`, so the artifact is a directory.
    fn dump_database(
        &self,
        name: &str,
        destination: &Path,
    ) -> result::Result<DumpArtifact, DumpError> {
        let out_dir = destination.parent().ok_or_else(|| {
            DumpError::engine(name, format!("{destination:?} has no parent directory"))
        })?;
        let produced = out_dir.join(name);
        if produced != destination && produced.exists() {
            return Err(DumpError::engine(
                name,
                format!("{produced:?} is already taken in the scratch directory"),
            ));
        }

        let spec = self
            .with_auth(
                self.command("mongodump")
                    .args(["--db", name, "--out"])
                    .arg(out_dir.to_string_lossy()),
            )
            .args(self.config.options.extra_args());
        let output = run_dump(
            self.runner.as_ref(),
            &spec,
            self.config.options.dump_timeout(),
            name,
            &produced,
        )?;
        if produced == destination {
            return Ok(output);
        }

        std::fs::rename(&produced, destination).map_err(|e| {
            DumpError::engine(
                name,
                format!("cannot move {produced:?} to {destination:?}: {e}"),
            )
        })?;
        DumpArtifact::collect(name, destination)
    }
}
