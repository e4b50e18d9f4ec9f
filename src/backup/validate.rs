//! Validation functions for configuration values.
//!
//! Custom `validator` hooks for directories, cron expressions, URLs,
//! secrets and database names.

use crate::backup::redacted::RedactedString;
use chrono::Local;
use sanitize_filename::{is_sanitized, sanitize};
use validator::ValidationError;

use std::path::Path;

pub fn validate_dir_exist<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("{:?} not found", dir).into()));
    }

    Ok(())
}

pub fn validate_dir_exist_or_created<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return std::fs::create_dir_all(dir).map_err(|e| {
            ValidationError::new("InvalidDirectory").with_message(
                format!("cannot create or access directory {:?}: {}", dir, e).into(),
            )
        });
    }

    Ok(())
}

pub fn validate_writable_dir<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    validate_dir_exist_or_created(dir)?;
    let md = std::fs::metadata(dir).map_err(|e| {
        ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot access metadata for {:?}: {}", dir, e).into())
    })?;
    if md.permissions().readonly() {
        Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot write to dir {:?}", dir).into()))
    } else {
        Ok(())
    }
}

pub fn validate_cron_str<S: AsRef<str>>(cron: S) -> Result<(), ValidationError> {
    let cron = cron.as_ref();
    if cron_parser::parse(cron, &Local::now()).is_err() {
        return Err(ValidationError::new("InvalidCron")
            .with_message(format!("Invalid cron string: {cron:?}").into()));
    }

    Ok(())
}

pub fn validate_http_url<S: AsRef<str>>(url: S) -> Result<(), ValidationError> {
    let url = url.as_ref();
    match reqwest::Url::parse(url) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => Ok(()),
        Ok(u) => Err(ValidationError::new("InvalidUrl")
            .with_message(format!("unsupported scheme {:?} in {url:?}", u.scheme()).into())),
        Err(e) => Err(ValidationError::new("InvalidUrl")
            .with_message(format!("cannot parse {url:?}: {e}").into())),
    }
}

pub fn validate_non_empty_secret(secret: &RedactedString) -> Result<(), ValidationError> {
    if secret.inner().trim().is_empty() {
        return Err(
            ValidationError::new("EmptySecret").with_message("secret must not be empty".into())
        );
    }

    Ok(())
}

/// Database names become archive entry and scratch file names.
pub fn validate_database_name<S: AsRef<str>>(name: S) -> Result<(), ValidationError> {
    let name = name.as_ref();
    if name.is_empty() || !is_sanitized(name) || name.starts_with('.') {
        return Err(ValidationError::new("InvalidDatabaseName").with_message(
            format!(
                "{name:?} cannot be used as a file name, try sanitizing like {:?}",
                sanitize(name)
            )
            .into(),
        ));
    }
    // Dump tools would read it as an option.
    if name.starts_with('-') {
        return Err(ValidationError::new("InvalidDatabaseName")
            .with_message(format!("{name:?} starts with '-'").into()));
    }

    Ok(())
}
