use crate::backup::process::ProcessError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Enumerating the databases of one engine failed.
///
/// Aborts only the adapter it belongs to.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("listing {kind} databases timed out after {timeout:?}")]
    Timeout { kind: String, timeout: Duration },
    #[error("listing {kind} databases exited with {}: {}", fmt_code(.code), .stderr.trim())]
    Failed {
        kind: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("cannot list {kind} databases: {source}")]
    Launch {
        kind: String,
        #[source]
        source: ProcessError,
    },
    #[error("cannot list {kind} databases: {message}")]
    Engine { kind: String, message: String },
}

impl DiscoveryError {
    pub fn from_process<S: Into<String>>(kind: S, error: ProcessError) -> Self {
        match error {
            ProcessError::Timeout { timeout, .. } => DiscoveryError::Timeout {
                kind: kind.into(),
                timeout,
            },
            source => DiscoveryError::Launch {
                kind: kind.into(),
                source,
            },
        }
    }
}

/// Dumping a single database failed. Never fatal to the run.
#[derive(Error, Debug)]
pub enum DumpError {
    #[error("{program} dumping {database:?} timed out after {timeout:?}")]
    Timeout {
        database: String,
        program: String,
        timeout: Duration,
    },
    #[error("{program} dumping {database:?} exited with {}: {}", fmt_code(.code), .stderr.trim())]
    NonZeroExit {
        database: String,
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("dump of {database:?} reported success but {path:?} is {reason}")]
    MissingOutput {
        database: String,
        path: PathBuf,
        reason: &'static str,
    },
    #[error("cannot start dump of {database:?}: {source}")]
    Launch {
        database: String,
        #[source]
        source: ProcessError,
    },
    #[error("dump of {database:?} failed: {message}")]
    Engine { database: String, message: String },
    #[error("{database:?} is not usable as an archive entry name: {reason}")]
    InvalidName { database: String, reason: String },
}

impl DumpError {
    pub fn from_process<S: Into<String>>(database: S, error: ProcessError) -> Self {
        match error {
            ProcessError::Timeout { program, timeout } => DumpError::Timeout {
                database: database.into(),
                program,
                timeout,
            },
            source => DumpError::Launch {
                database: database.into(),
                source,
            },
        }
    }

    pub fn engine<D: Into<String>, M: ToString>(database: D, message: M) -> Self {
        DumpError::Engine {
            database: database.into(),
            message: message.to_string(),
        }
    }

    /// Short machine-friendly label used in notification payloads.
    pub fn label(&self) -> &'static str {
        match self {
            DumpError::Timeout { .. } => "timeout",
            DumpError::NonZeroExit { .. } => "non_zero_exit",
            DumpError::MissingOutput { .. } => "missing_output",
            DumpError::Launch { .. } => "launch",
            DumpError::Engine { .. } => "engine",
            DumpError::InvalidName { .. } => "invalid_name",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DumpError::Timeout { .. })
    }
}

fn fmt_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("status {c}"),
        None => "a signal".to_string(),
    }
}
