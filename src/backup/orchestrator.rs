//! Drives one backup run across every enabled adapter.
//!
//! Failures are contained at the smallest unit that can still be named: a
//! database, then an adapter stage. Only a concurrent run or a scratch
//! directory that cannot be created aborts a run.

use crate::backup::adapter::error::DumpError;
use crate::backup::adapter::{entry_name, Adapter, DumpArtifact};
use crate::backup::archive::ArchiveBuilder;
use crate::backup::function_path;
use crate::backup::notifications::Notification;
use crate::backup::registry::AdapterRegistry;
use crate::backup::remote::RemoteStore;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::retention::RetentionConfig;
use crate::backup::run_result::{
    AdapterResult, ArchiveRecord, ArtifactSummary, DatabaseResult, RunResult, RunState, Stage,
    StageFailure,
};
use crate::backup::validate::validate_database_name;
use bon::Builder;
use chrono::{DateTime, Local, SubsecRound};
use function_name::named;
use itertools::Itertools;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{error, info, warn};

#[derive(Builder)]
pub struct BackupOrchestrator {
    registry: AdapterRegistry,
    #[builder(default)]
    archive_builder: ArchiveBuilder,
    remote: Box<dyn RemoteStore>,
    #[builder(default)]
    retention: RetentionConfig,
    notifier: Option<Box<dyn Notification>>,
    /// Parent of the per-run scratch directories
    #[builder(into)]
    scratch_dir: PathBuf,
    #[builder(skip)]
    running: AtomicBool,
    #[builder(skip = Mutex::new(RunState::Idle))]
    state: Mutex<RunState>,
}

/// Holds the run gate until dropped.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| RunGuard(flag))
            .map_err(|_| Error::RunInProgress)
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BackupOrchestrator {
    /// `Running` while a run is active, otherwise the outcome of the last one.
    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: RunState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn remote(&self) -> &dyn RemoteStore {
        self.remote.as_ref()
    }

    /// Runs a full backup and returns its result.
    ///
    /// Errors only with [`Error::RunInProgress`] or when no scratch space
    /// can be created; every other failure is part of the result.
    #[named]
    pub fn run(&self) -> Result<RunResult> {
        let _guard = RunGuard::acquire(&self.running)?;
        let previous = self.state();
        self.set_state(RunState::Running);

        let started_at = Local::now();
        let timestamp = started_at.trunc_subsecs(0);
        info!("Starting backup run {}", timestamp.format("%Y-%m-%d %H:%M:%S"));

        let run_dir = match tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(&self.scratch_dir)
            .map_err(Error::from)
            .add_msg(format!("Cannot create scratch space in {:?}", self.scratch_dir))
            .add_fn_name(function_path!())
        {
            Ok(dir) => dir,
            Err(e) => {
                error!("Aborting backup run: {e}");
                self.set_state(previous);
                return Err(e);
            }
        };

        let adapters = self
            .registry
            .enabled()
            .map(|adapter| self.run_adapter(adapter, run_dir.path(), &timestamp))
            .collect_vec();

        if let Err(e) = run_dir.close() {
            warn!("Cannot remove run scratch directory: {e}");
        }

        let state = if adapters.iter().all(AdapterResult::is_success) {
            RunState::Completed
        } else {
            RunState::CompletedWithErrors
        };
        let result = RunResult {
            timestamp,
            started_at,
            finished_at: Local::now(),
            adapters,
            state,
        };
        info!("Backup run finished: {}", result.title());

        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify(&result) {
                warn!("Cannot deliver run notification: {e}");
            }
        }

        self.set_state(state);
        Ok(result)
    }

    fn run_adapter(
        &self,
        adapter: &dyn Adapter,
        run_dir: &Path,
        timestamp: &DateTime<Local>,
    ) -> AdapterResult {
        let kind = adapter.kind();
        let mut result = AdapterResult::new(kind);
        info!("Backing up {kind}");

        let started = Instant::now();
        let names = match adapter.list_databases() {
            Ok(names) => names,
            Err(e) => {
                error!("Cannot list {kind} databases, skipping adapter: {e}");
                result.databases.push(DatabaseResult {
                    name: kind.to_string(),
                    outcome: Err(e.into()),
                    duration: started.elapsed(),
                });
                return result;
            }
        };

        match tempfile::Builder::new().prefix(kind).tempdir_in(run_dir) {
            Ok(scratch) => {
                self.dump_and_upload(adapter, names, &scratch, timestamp, &mut result);
                if let Err(e) = scratch.close() {
                    warn!("Cannot remove {kind} scratch directory: {e}");
                }
            }
            Err(e) => {
                error!("Cannot create {kind} scratch directory: {e}");
                result.stage_failure = Some(StageFailure::new(Stage::Scratch, e));
            }
        }

        self.apply_retention(kind, &mut result);
        result
    }

    fn dump_and_upload(
        &self,
        adapter: &dyn Adapter,
        names: Vec<String>,
        scratch: &TempDir,
        timestamp: &DateTime<Local>,
        result: &mut AdapterResult,
    ) {
        let kind = adapter.kind();
        let names = names.into_iter().unique().collect_vec();
        let (extras, clashing): (Vec<_>, Vec<_>) = adapter
            .extra_artifacts()
            .into_iter()
            .unique()
            .partition(|extra| !names.contains(extra));
        let targets = names
            .into_iter()
            .map(|n| (n, false))
            .chain(extras.into_iter().map(|n| (n, true)))
            .collect_vec();

        let mut artifacts = Vec::new();
        for (name, is_extra) in targets {
            let started = Instant::now();
            let outcome = self.dump_one(adapter, &name, is_extra, scratch.path());
            let duration = started.elapsed();
            let outcome = match outcome {
                Ok(artifact) => {
                    info!(
                        "Dumped {kind} {:?} in {:.1?} ({} bytes)",
                        name,
                        duration,
                        artifact.size()
                    );
                    let summary = ArtifactSummary {
                        size: artifact.size(),
                        is_dir: artifact.is_dir(),
                    };
                    artifacts.push(artifact);
                    Ok(summary)
                }
                Err(e) => {
                    error!("Dump of {kind} {:?} failed: {e}", name);
                    Err(e.into())
                }
            };
            result.databases.push(DatabaseResult {
                name,
                outcome,
                duration,
            });
        }
        for name in clashing {
            error!("Skipping {kind} {:?}, a database has the same name", name);
            result.databases.push(DatabaseResult {
                outcome: Err(DumpError::InvalidName {
                    database: name.clone(),
                    reason: "clashes with a database of the same name".into(),
                }
                .into()),
                name,
                duration: Duration::ZERO,
            });
        }

        if artifacts.is_empty() {
            warn!("No {kind} dump succeeded, nothing to upload");
            return;
        }

        let archive = match self.archive_builder.build(
            &artifacts,
            adapter.file_ext(),
            scratch.path(),
            timestamp,
        ) {
            Ok(path) => path,
            Err(e) => {
                error!("Cannot archive {kind} dumps: {e}");
                result.stage_failure = Some(StageFailure::new(Stage::Archive, e));
                return;
            }
        };
        let size = match std::fs::metadata(&archive) {
            Ok(md) => md.len(),
            Err(e) => {
                warn!("Cannot read size of {:?}: {e}", archive);
                0
            }
        };

        match self.remote.upload(&archive, kind) {
            Ok(remote_path) => {
                info!("Uploaded {kind} archive to {remote_path}");
                result.archive = Some(ArchiveRecord {
                    file_name: archive
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    remote_path,
                    size,
                });
            }
            Err(e) => {
                error!("Cannot upload {kind} archive: {e}");
                result.stage_failure = Some(StageFailure::new(Stage::Upload, e));
            }
        }
    }

    fn dump_one(
        &self,
        adapter: &dyn Adapter,
        name: &str,
        is_extra: bool,
        dir: &Path,
    ) -> std::result::Result<DumpArtifact, DumpError> {
        validate_database_name(name).map_err(|e| DumpError::InvalidName {
            database: name.to_string(),
            reason: e.to_string(),
        })?;
        let destination = dir.join(entry_name(name, adapter.file_ext()));
        if is_extra {
            adapter.dump_extra(name, &destination)
        } else {
            adapter.dump_database(name, &destination)
        }
    }

    fn apply_retention(&self, kind: &str, result: &mut AdapterResult) {
        let objects = match self.remote.list(kind) {
            Ok(objects) => objects,
            Err(e) => {
                warn!("Cannot list remote {kind} archives for retention: {e}");
                result.retention_errors.push(e.to_string());
                return;
            }
        };

        for expired in self.retention.expired(&objects, &Local::now()) {
            match self.remote.delete(kind, &expired.name) {
                Ok(()) => {
                    info!("Removed out of retention archive {kind}/{}", expired.name);
                    result.retention_deleted.push(expired.name);
                }
                Err(e) => {
                    warn!("Cannot remove {kind}/{}: {e}", expired.name);
                    result
                        .retention_errors
                        .push(format!("{}: {e}", expired.name));
                }
            }
        }
    }
}
