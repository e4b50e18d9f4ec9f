pub mod local;
pub mod rclone;

use crate::backup::process::{CommandRunner, ProcessError};
use crate::backup::remote::local::{LocalRemote, LocalRemoteConfig};
use crate::backup::remote::rclone::{RcloneRemote, RcloneRemoteConfig};
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::result;
use std::sync::Arc;
use thiserror::Error;
use validator::{Validate, ValidationErrors};

/// Off-host storage for archives, laid out as `{kind}/{file_name}`.
pub trait RemoteStore: Send + Sync {
    /// Uploads `local_archive` under the adapter's prefix and returns the
    /// remote path it was stored at.
    fn upload(&self, local_archive: &Path, kind: &str) -> result::Result<String, UploadError>;

    fn list(&self, kind: &str) -> result::Result<Vec<RemoteObject>, UploadError>;

    fn delete(&self, kind: &str, name: &str) -> result::Result<(), UploadError>;

    /// Startup check that the remote is reachable and configured.
    fn verify(&self) -> result::Result<(), UploadError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteObject {
    pub name: String,
    pub size: Option<u64>,
}

impl RemoteObject {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            size: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum UploadErrorKind {
    #[display("network")]
    Network,
    #[display("auth")]
    Auth,
    #[display("quota")]
    Quota,
    #[display("timeout")]
    Timeout,
    #[display("other")]
    Other,
}

#[derive(Error, Debug)]
#[error("remote {kind} error: {message}")]
pub struct UploadError {
    pub kind: UploadErrorKind,
    pub message: String,
}

impl UploadError {
    pub fn new<S: Into<String>>(kind: UploadErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Guesses the failure class from what the transfer tool printed.
    pub fn classify<S: AsRef<str>>(stderr: S) -> Self {
        let stderr = stderr.as_ref().trim();
        let lower = stderr.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        let kind = if has(&[
            "quota",
            "insufficient storage",
            "no space left",
            "storage full",
            "507",
        ]) {
            UploadErrorKind::Quota
        } else if has(&[
            "unauthorized",
            "forbidden",
            "401",
            "403",
            "access denied",
            "permission denied",
            "invalid credentials",
            "authentication",
            "didn't find section in config file",
        ]) {
            UploadErrorKind::Auth
        } else if has(&[
            "connection refused",
            "connection reset",
            "no such host",
            "network is unreachable",
            "dial tcp",
            "i/o timeout",
            "tls handshake",
            "eof",
        ]) {
            UploadErrorKind::Network
        } else {
            UploadErrorKind::Other
        };
        Self::new(kind, stderr)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == UploadErrorKind::Other && self.message.to_lowercase().contains("not found")
    }
}

impl From<ProcessError> for UploadError {
    fn from(value: ProcessError) -> Self {
        match value {
            ProcessError::Timeout { .. } => Self::new(UploadErrorKind::Timeout, value.to_string()),
            _ => Self::new(UploadErrorKind::Other, value.to_string()),
        }
    }
}

/// Remote storage configuration, tagged by `type`.
#[derive(Clone, Debug, Serialize, Deserialize, From)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum RemoteConfig {
    Rclone(RcloneRemoteConfig),
    Local(LocalRemoteConfig),
}

impl RemoteConfig {
    pub fn build(&self, runner: Arc<dyn CommandRunner>) -> Box<dyn RemoteStore> {
        match self {
            RemoteConfig::Rclone(c) => Box::new(RcloneRemote::new(c.clone(), runner)),
            RemoteConfig::Local(c) => Box::new(LocalRemote::new(c.clone())),
        }
    }
}

impl Validate for RemoteConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            RemoteConfig::Rclone(inner) => inner.validate(),
            RemoteConfig::Local(inner) => inner.validate(),
        }
    }
}
