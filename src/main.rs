use clap::Parser;
use db_backup::backup::backup_config::BackupConfig;
use db_backup::backup::process::SystemRunner;
use db_backup::backup::result_error::error::Error;
use db_backup::backup::result_error::AddMsg;
use db_backup::backup::run_result::RunState;
use std::fs::File;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info};
use validator::Validate;

/// Dump databases on a schedule and ship the archives to remote storage
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long, env = "DB_BACKUP_CONFIG")]
    config: PathBuf,
    /// Run one backup and exit, 0 when everything succeeded, 2 otherwise
    #[arg(long)]
    once: bool,
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let res = File::open(&args.config)
        .map_err(Error::from)
        .and_then(|f| {
            serde_yml::from_reader::<_, BackupConfig>(f)
                .map_err(Error::from)
                .add_msg(format!("Parse YAML config failed: {:?}", &args.config))
        })
        .and_then(|bc| {
            bc.validate()
                .map_err(Error::from)
                .map(|_| bc)
                .add_msg(format!("Config validation failed: {:?}", &args.config))
        });
    let config = match res {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    };

    let orchestrator = config.build_orchestrator(Arc::new(SystemRunner));
    if let Err(e) = orchestrator.remote().verify() {
        error!("Remote storage check failed: {e}");
        exit(1);
    }
    info!("Remote storage reachable");

    if args.once {
        match orchestrator.run() {
            Ok(result) if result.state == RunState::Completed => exit(0),
            Ok(_) => exit(2),
            Err(e) => {
                error!("{e}");
                exit(1);
            }
        }
    }

    match config.start_loop(&orchestrator) {
        Ok(_) => error!("Loop should never break without error"),
        Err(e) => error!("{e}"),
    }

    exit(1);
}
