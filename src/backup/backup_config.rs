use crate::backup::adapter::AdapterConfig;
use crate::backup::archive::{ArchiveBuilder, ArchiveConfig};
use crate::backup::function_path;
use crate::backup::notifications::{Notification, NotificationConfig};
use crate::backup::orchestrator::BackupOrchestrator;
use crate::backup::process::CommandRunner;
use crate::backup::registry::AdapterRegistry;
use crate::backup::remote::RemoteConfig;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddFunctionName;
use crate::backup::retention::RetentionConfig;
use crate::backup::validate::{validate_cron_str, validate_writable_dir};
use chrono::{DateTime, Local, TimeZone};
use function_name::named;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use validator::{Validate, ValidationError};

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("db_backup")
}

/// Everything one deployment needs, loaded from YAML once at startup.
#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, Validate, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_has_enabled_adapter))]
pub struct BackupConfig {
    /// 5-field cron expression, evaluated in local time
    #[validate(custom(function = validate_cron_str))]
    #[getset(get = "pub")]
    cron: String,
    #[serde(default)]
    #[getset(get_copy = "pub")]
    run_on_start: bool,
    #[serde(default = "default_scratch_dir")]
    #[validate(custom(function = validate_writable_dir))]
    #[getset(get = "pub")]
    scratch_dir: PathBuf,
    #[serde(default)]
    #[validate(nested)]
    #[getset(get = "pub")]
    archive: ArchiveConfig,
    #[serde(default)]
    #[validate(nested)]
    #[getset(get = "pub")]
    retention: RetentionConfig,
    #[validate(nested)]
    #[getset(get = "pub")]
    remote: RemoteConfig,
    #[validate(nested)]
    #[getset(get = "pub")]
    notification: Option<NotificationConfig>,
    #[validate(nested)]
    #[getset(get = "pub")]
    adapters: Vec<AdapterConfig>,
}

fn validate_has_enabled_adapter(config: &BackupConfig) -> std::result::Result<(), ValidationError> {
    if config.adapters.iter().any(|a| a.options().enabled()) {
        Ok(())
    } else {
        Err(ValidationError::new("NoEnabledAdapter")
            .with_message("at least one adapter must be enabled".into()))
    }
}

impl BackupConfig {
    pub fn build_orchestrator(&self, runner: Arc<dyn CommandRunner>) -> BackupOrchestrator {
        BackupOrchestrator::builder()
            .registry(AdapterRegistry::from_configs(&self.adapters, runner.clone()))
            .archive_builder(ArchiveBuilder::new(self.archive.clone()))
            .remote(self.remote.build(runner))
            .retention(self.retention.clone())
            .maybe_notifier(
                self.notification
                    .clone()
                    .map(|n| Box::new(n) as Box<dyn Notification>),
            )
            .scratch_dir(self.scratch_dir.clone())
            .build()
    }

    /// First cron fire time strictly after `after`.
    pub fn next_fire<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Result<DateTime<Tz>> {
        cron_parser::parse(&self.cron, after).map_err(|_| Error::invalid_cron(self.cron.clone()))
    }

    /// Runs on start if configured, then on every cron tick. Only returns on
    /// a cron expression that stops producing fire times.
    #[named]
    pub fn start_loop(&self, orchestrator: &BackupOrchestrator) -> Result<()> {
        if self.run_on_start {
            info!("Running backup on start");
            trigger(orchestrator);
        }

        loop {
            let now = Local::now();
            let next = self.next_fire(&now).add_fn_name(function_path!())?;
            info!("Sleeping until {next}");
            std::thread::sleep((next - now).to_std().unwrap_or_default());
            trigger(orchestrator);
        }
    }
}

fn trigger(orchestrator: &BackupOrchestrator) {
    match orchestrator.run() {
        Ok(result) => info!("{}", result.title()),
        Err(e) => match e.root_cause() {
            Error::RunInProgress => warn!("Skipping trigger, previous run is still going"),
            _ => error!("Backup run aborted: {e}"),
        },
    }
}
