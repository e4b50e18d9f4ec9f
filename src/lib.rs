//! # db_backup
//!
//! Scheduled backups of heterogeneous databases to remote storage.
//!
//! ## Features
//!
//! - **Engines**: PostgreSQL, MySQL, MariaDB, MongoDB, Redis and SQLite,
//!   each dumped with its native tool
//! - **Isolation**: a failing database or adapter never stops the others
//! - **Archives**: one ZIP per engine and run, optionally AES-256 encrypted
//! - **Remote storage**: any `rclone` remote, or a mounted directory
//! - **Retention**: age threshold with optional daily, monthly and yearly keeps
//! - **Notifications**: webhook, Message Pusher or SMTP after every run
//!
//! ## Quick Start
//!
//! ```no_run
//! use db_backup::backup::backup_config::BackupConfig;
//! use db_backup::backup::process::SystemRunner;
//! use std::sync::Arc;
//!
//! let config: BackupConfig = serde_yml::from_reader(std::fs::File::open("config.yml")?)?;
//! let orchestrator = config.build_orchestrator(Arc::new(SystemRunner));
//! config.start_loop(&orchestrator)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
