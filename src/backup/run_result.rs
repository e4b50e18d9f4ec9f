//! Outcome of one backup run, built up by the orchestrator and handed to
//! the notifier once the run is over.

use crate::backup::adapter::error::{DiscoveryError, DumpError};
use crate::backup::archive::TIME_FORMAT;
use chrono::{DateTime, Local};
use derive_more::Display;
use humantime_serde::re::humantime::format_duration;
use itertools::Itertools;
use std::fmt::{Display as FmtDisplay, Formatter};
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum RunState {
    #[display("idle")]
    Idle,
    #[display("running")]
    Running,
    #[display("completed")]
    Completed,
    #[display("completed with errors")]
    CompletedWithErrors,
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Dump(#[from] DumpError),
}

impl DatabaseError {
    pub fn label(&self) -> &'static str {
        match self {
            DatabaseError::Discovery(_) => "discovery",
            DatabaseError::Dump(e) => e.label(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArtifactSummary {
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug)]
pub struct DatabaseResult {
    pub name: String,
    pub outcome: Result<ArtifactSummary, DatabaseError>,
    pub duration: Duration,
}

impl DatabaseResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub file_name: String,
    pub remote_path: String,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Stage {
    #[display("scratch")]
    Scratch,
    #[display("archive")]
    Archive,
    #[display("upload")]
    Upload,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
}

impl StageFailure {
    pub fn new<S: ToString>(stage: Stage, error: S) -> Self {
        Self {
            stage,
            message: error.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct AdapterResult {
    pub kind: String,
    pub databases: Vec<DatabaseResult>,
    pub archive: Option<ArchiveRecord>,
    pub stage_failure: Option<StageFailure>,
    pub retention_deleted: Vec<String>,
    pub retention_errors: Vec<String>,
}

impl AdapterResult {
    pub fn new<S: Into<String>>(kind: S) -> Self {
        Self {
            kind: kind.into(),
            databases: Vec::new(),
            archive: None,
            stage_failure: None,
            retention_deleted: Vec::new(),
            retention_errors: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.databases.iter().filter(|d| d.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.databases.len() - self.succeeded()
    }

    /// Retention problems are reported but do not fail the adapter.
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.stage_failure.is_none()
    }
}

#[derive(Debug)]
pub struct RunResult {
    pub timestamp: DateTime<Local>,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub adapters: Vec<AdapterResult>,
    pub state: RunState,
}

impl RunResult {
    pub fn archives(&self) -> Vec<&ArchiveRecord> {
        self.adapters
            .iter()
            .filter_map(|a| a.archive.as_ref())
            .collect()
    }

    /// `(kind, object name)` of every archive pruned by retention
    pub fn retention_deletions(&self) -> Vec<(&str, &str)> {
        self.adapters
            .iter()
            .flat_map(|a| {
                a.retention_deleted
                    .iter()
                    .map(move |n| (a.kind.as_str(), n.as_str()))
            })
            .collect()
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// `success`, `partial_success` or `failed` (nothing archived at all)
    pub fn status(&self) -> &'static str {
        if self.state == RunState::Completed {
            "success"
        } else if self.archives().is_empty() {
            "failed"
        } else {
            "partial_success"
        }
    }

    pub fn title(&self) -> String {
        format!(
            "Database backup {}: {}",
            self.timestamp.format(TIME_FORMAT),
            self.status().replace('_', " ")
        )
    }
}

impl FmtDisplay for RunResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.title())?;
        writeln!(
            f,
            "Started {}, finished {}, took {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.finished_at.format("%Y-%m-%d %H:%M:%S"),
            format_duration(Duration::from_secs(self.duration().as_secs()))
        )?;
        for adapter in &self.adapters {
            writeln!(f)?;
            writeln!(
                f,
                "{}: {} succeeded, {} failed",
                adapter.kind,
                adapter.succeeded(),
                adapter.failed()
            )?;
            for db in &adapter.databases {
                match &db.outcome {
                    Ok(summary) => writeln!(f, "  ok   {} ({})", db.name, format_size(summary.size))?,
                    Err(e) => writeln!(f, "  FAIL {}: {}", db.name, e)?,
                }
            }
            if let Some(archive) = &adapter.archive {
                writeln!(
                    f,
                    "  archive: {} ({})",
                    archive.remote_path,
                    format_size(archive.size)
                )?;
            }
            if let Some(failure) = &adapter.stage_failure {
                writeln!(f, "  {} failed: {}", failure.stage, failure.message)?;
            }
            if !adapter.retention_deleted.is_empty() {
                writeln!(
                    f,
                    "  retention deleted: {}",
                    adapter.retention_deleted.iter().join(", ")
                )?;
            }
            for e in &adapter.retention_errors {
                writeln!(f, "  retention error: {e}")?;
            }
        }
        Ok(())
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}


#[cfg(test)]
mod tests {
    use super::testing::sample;
    use super::*;

    #[test]
    fn test_counts_and_accessors() {
        let result = sample();
        assert_eq!(result.adapters[0].succeeded(), 1);
        assert_eq!(result.adapters[0].failed(), 1);
        assert!(!result.adapters[0].is_success());
        assert!(!result.adapters[1].is_success());
        assert_eq!(result.archives().len(), 1);
        assert_eq!(
            result.retention_deletions(),
            vec![("postgresql", "20250301_020005.zip")]
        );
        assert_eq!(result.duration(), Duration::from_secs(65));
        assert_eq!(result.status(), "partial_success");
    }

    #[test]
    fn test_summary_text() {
        let text = sample().to_string();
        assert!(text.contains("partial success"));
        assert!(text.contains("took 1m 5s"));
        assert!(text.contains("postgresql: 1 succeeded, 1 failed"));
        assert!(text.contains("  ok   app (2.0 KiB)"));
        assert!(text.contains("  FAIL audit: dump of \"audit\" failed: boom"));
        assert!(text.contains("archive: s3:postgresql/20250314_020005.zip (1.5 KiB)"));
        assert!(text.contains("upload failed: quota exceeded"));
        assert!(text.contains("retention deleted: 20250301_020005.zip"));
    }

    #[test]
    fn test_status() {
        let mut result = sample();
        result.adapters[0].archive = None;
        assert_eq!(result.status(), "failed");
        result.state = RunState::Completed;
        assert_eq!(result.status(), "success");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.5 KiB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }

    #[test]
    fn test_database_error_label() {
        let err: DatabaseError = DiscoveryError::Engine {
            kind: "sqlite".into(),
            message: "x".into(),
        }
        .into();
        assert_eq!(err.label(), "discovery");
    }
}
