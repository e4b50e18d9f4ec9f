use crate::backup::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::backup::remote::{RemoteObject, RemoteStore, UploadError, UploadErrorKind};
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::path::{Path, PathBuf};
use std::result;
use std::sync::Arc;
use std::time::Duration;
use validator::{Validate, ValidationError};

fn default_config_file() -> PathBuf {
    PathBuf::from("/config/rclone.conf")
}

fn default_upload_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

fn validate_remote_name(remote: &str) -> result::Result<(), ValidationError> {
    if remote.is_empty() || remote.contains(':') || remote.contains('/') {
        return Err(ValidationError::new("InvalidRemote")
            .with_message(format!("{remote:?} must be a bare rclone remote name").into()));
    }
    Ok(())
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
pub struct RcloneRemoteConfig {
    /// Remote name as listed by `rclone listremotes`, without the colon
    #[validate(custom(function = validate_remote_name))]
    #[getset(get = "pub")]
    remote: String,
    /// Folder inside the remote that holds the per-kind folders
    #[getset(get = "pub")]
    path: Option<String>,
    #[serde(default = "default_config_file")]
    #[getset(get = "pub")]
    config_file: PathBuf,
    #[serde(default)]
    #[getset(get_copy = "pub")]
    insecure_skip_verify: bool,
    #[serde(default = "default_upload_timeout", with = "humantime_serde")]
    #[getset(get_copy = "pub")]
    upload_timeout: Duration,
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    #[getset(get_copy = "pub")]
    command_timeout: Duration,
}

pub struct RcloneRemote {
    config: RcloneRemoteConfig,
    runner: Arc<dyn CommandRunner>,
}

impl RcloneRemote {
    pub fn new(config: RcloneRemoteConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    /// `{remote}:{path}/{kind}`
    fn kind_dir(&self, kind: &str) -> String {
        match self.config.path.as_deref().map(|p| p.trim_matches('/')) {
            Some(p) if !p.is_empty() => format!("{}:{p}/{kind}", self.config.remote),
            _ => format!("{}:{kind}", self.config.remote),
        }
    }

    fn command<I, S>(&self, subcommand: &str, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = CommandSpec::new("rclone")
            .arg(subcommand)
            .args(args)
            .arg("--config")
            .arg(self.config.config_file.to_string_lossy());
        if self.config.insecure_skip_verify {
            spec.arg("--no-check-certificate")
        } else {
            spec
        }
    }

    fn call(&self, spec: CommandSpec, timeout: Duration) -> result::Result<CommandOutput, UploadError> {
        tracing::debug!("Calling `{}`", spec);
        let output = self.runner.run(&spec, timeout)?;
        if output.success() {
            Ok(output)
        } else {
            Err(UploadError::classify(output.stderr))
        }
    }
}

impl RemoteStore for RcloneRemote {
    fn upload(&self, local_archive: &Path, kind: &str) -> result::Result<String, UploadError> {
        let file_name = local_archive
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                UploadError::new(
                    UploadErrorKind::Other,
                    format!("{local_archive:?} has no usable file name"),
                )
            })?;
        let target = format!("{}/{file_name}", self.kind_dir(kind));
        tracing::info!("Uploading {:?} to {}", local_archive, target);
        let spec = self.command(
            "copyto",
            [local_archive.to_string_lossy().into_owned(), target.clone()],
        );
        self.call(spec, self.config.upload_timeout)?;
        Ok(target)
    }

    fn list(&self, kind: &str) -> result::Result<Vec<RemoteObject>, UploadError> {
        let spec = self.command(
            "lsf",
            [
                "--files-only".to_string(),
                "--format".to_string(),
                "ps".to_string(),
                "--separator".to_string(),
                ";".to_string(),
                self.kind_dir(kind),
            ],
        );
        match self.call(spec, self.config.command_timeout) {
            Ok(output) => Ok(parse_lsf(&output.stdout)),
            // A kind that never uploaded has no folder yet.
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn delete(&self, kind: &str, name: &str) -> result::Result<(), UploadError> {
        let target = format!("{}/{name}", self.kind_dir(kind));
        tracing::info!("Deleting remote {}", target);
        self.call(self.command("deletefile", [target]), self.config.command_timeout)
            .map(|_| ())
    }

    fn verify(&self) -> result::Result<(), UploadError> {
        let output = self.call(
            self.command("listremotes", Vec::<String>::new()),
            self.config.command_timeout,
        )?;
        let remotes = output
            .stdout
            .lines()
            .map(|l| l.trim().trim_end_matches(':'))
            .filter(|l| !l.is_empty())
            .collect_vec();
        if remotes.contains(&self.config.remote.as_str()) {
            tracing::info!("rclone remote {:?} is configured", self.config.remote);
            Ok(())
        } else {
            Err(UploadError::new(
                UploadErrorKind::Auth,
                format!(
                    "remote {:?} not found in {:?}, available: {}",
                    self.config.remote,
                    self.config.config_file,
                    remotes.join(", ")
                ),
            ))
        }
    }
}

/// Parses `path;size` lines from `rclone lsf --format ps --separator ;`.
fn parse_lsf(stdout: &str) -> Vec<RemoteObject> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| match line.rsplit_once(';') {
            Some((name, size)) => RemoteObject {
                name: name.to_string(),
                size: size.trim().parse().ok(),
            },
            None => RemoteObject::new(line),
        })
        .collect()
}
