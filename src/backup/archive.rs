//! Packs one adapter's dump artifacts into a single, optionally encrypted,
//! ZIP file named after the run timestamp.

use crate::backup::adapter::{entry_name, DumpArtifact};
use crate::backup::function_path;
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use bon::Builder;
use chrono::{DateTime, NaiveDateTime, TimeZone};
use function_name::named;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt::Display;
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use validator::{Validate, ValidationError};
use walkdir::WalkDir;
use zip::write::{FileOptions, ZipWriter};
use zip::{AesMode, CompressionMethod};

/// Timestamp layout shared by archive names and retention parsing
pub static TIME_FORMAT: &str = "%Y%m%d_%H%M%S";
pub static ARCHIVE_EXT: &str = "zip";

pub fn archive_file_name<Tz: TimeZone>(timestamp: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    format!("{}.{ARCHIVE_EXT}", timestamp.format(TIME_FORMAT))
}

/// Reads the timestamp back out of an archive name, `None` for anything
/// this tool did not produce.
pub fn parse_archive_timestamp(file_name: &str) -> Option<NaiveDateTime> {
    let stem = file_name.strip_suffix(&format!(".{ARCHIVE_EXT}"))?;
    NaiveDateTime::parse_from_str(stem, TIME_FORMAT).ok()
}

fn validate_archive_config(config: &ArchiveConfig) -> std::result::Result<(), ValidationError> {
    match &config.password {
        Some(pw) if pw.inner().trim().is_empty() => Err(ValidationError::new("EmptySecret")
            .with_message("archive password must not be empty, omit it instead".into())),
        _ => Ok(()),
    }
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_archive_config))]
#[getset(get = "pub")]
pub struct ArchiveConfig {
    /// Every entry is AES-256 encrypted when set
    #[builder(into)]
    password: Option<RedactedString>,
    /// Deflate level, 0 to 9
    #[validate(range(min = 0, max = 9))]
    compression_level: Option<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct ArchiveBuilder {
    config: ArchiveConfig,
}

impl ArchiveBuilder {
    pub fn new(config: ArchiveConfig) -> Self {
        Self { config }
    }

    /// Writes `{out_dir}/{timestamp}.zip` and returns its path.
    ///
    /// The archive is written next to its final name and renamed once
    /// complete, a failed build leaves nothing behind.
    #[named]
    pub fn build<Tz: TimeZone>(
        &self,
        artifacts: &[DumpArtifact],
        file_ext: Option<&str>,
        out_dir: &Path,
        timestamp: &DateTime<Tz>,
    ) -> Result<PathBuf>
    where
        Tz::Offset: Display,
    {
        if artifacts.is_empty() {
            return Err(Error::EmptyArchive);
        }

        let file_name = archive_file_name(timestamp);
        let file_path = out_dir.join(&file_name);
        let file_path_tmp = out_dir.join(format!("{file_name}.tmp"));
        tracing::info!(
            "Packing {} artifact(s) into {:?}",
            artifacts.len(),
            &file_path
        );

        let file = File::create_new(&file_path_tmp)
            .map_err(Error::from)
            .add_msg(format!("Cannot create {:?}", &file_path_tmp))
            .add_fn_name(function_path!())?;

        self.write_archive(file, artifacts, file_ext)
            .and_then(|_| std::fs::rename(&file_path_tmp, &file_path).map_err(Error::from))
            .map(|_| file_path.clone())
            .map_err(|mut e| {
                if let Err(e2) = std::fs::remove_file(&file_path_tmp) {
                    e = e.chain(Error::from(e2).add_msg("Delete tmp archive failed"));
                }
                e
            })
            .add_msg(format!("Cannot build archive {:?}", &file_path))
            .add_fn_name(function_path!())
    }

    fn write_archive(
        &self,
        file: File,
        artifacts: &[DumpArtifact],
        file_ext: Option<&str>,
    ) -> Result<()> {
        let mut options: FileOptions<()> = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(self.config.compression_level)
            .large_file(true);
        if let Some(pw) = &self.config.password {
            options = options.with_aes_encryption(AesMode::Aes256, pw.inner());
        }

        let mut zip = ZipWriter::new(BufWriter::new(file));
        for artifact in artifacts {
            if artifact.is_dir() {
                add_dir_tree(&mut zip, artifact.path(), artifact.name(), &options)?;
            } else {
                let name = entry_name(artifact.name(), file_ext);
                tracing::debug!("Adding {:?} as {:?}", artifact.path(), name);
                zip.start_file(name, options.clone())?;
                std::io::copy(&mut File::open(artifact.path())?, &mut zip)?;
            }
        }
        zip.finish()?.flush()?;
        Ok(())
    }
}

/// Stores `root` as a subtree under `prefix/`, using `/` separators.
fn add_dir_tree<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    root: &Path,
    prefix: &str,
    options: &FileOptions<()>,
) -> Result<()> {
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        let relative = entry.path().strip_prefix(root).map_err(|e| {
            Error::from(std::io::Error::other(e)).add_msg(format!("{:?}", entry.path()))
        })?;
        let name = std::iter::once(prefix.to_string())
            .chain(
                relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned()),
            )
            .collect::<Vec<_>>()
            .join("/");
        if entry.file_type().is_dir() {
            zip.add_directory(format!("{name}/"), options.clone())?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options.clone())?;
            std::io::copy(&mut File::open(entry.path())?, zip)?;
        }
    }
    Ok(())
}
