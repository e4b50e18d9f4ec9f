use crate::backup::remote::{RemoteObject, RemoteStore, UploadError, UploadErrorKind};
use crate::backup::validate::{validate_dir_exist_or_created, validate_writable_dir};
use bon::Builder;
use getset::Getters;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::result;
use validator::Validate;

/// A mounted directory (NAS, second disk) used as the remote.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct LocalRemoteConfig {
    #[validate(custom(function = validate_dir_exist_or_created))]
    #[builder(into)]
    root: PathBuf,
}

pub struct LocalRemote {
    config: LocalRemoteConfig,
}

fn to_upload_error(context: String) -> impl FnOnce(io::Error) -> UploadError {
    move |e| match e.kind() {
        io::ErrorKind::PermissionDenied => {
            UploadError::new(UploadErrorKind::Auth, format!("{context}: {e}"))
        }
        _ => {
            let classified = UploadError::classify(e.to_string());
            UploadError::new(classified.kind, format!("{context}: {e}"))
        }
    }
}

impl LocalRemote {
    pub fn new(config: LocalRemoteConfig) -> Self {
        Self { config }
    }

    fn kind_dir(&self, kind: &str) -> PathBuf {
        self.config.root.join(kind)
    }
}

impl RemoteStore for LocalRemote {
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
        let dir = self.kind_dir(kind);
        std::fs::create_dir_all(&dir).map_err(to_upload_error(format!("create {dir:?}")))?;

        let target = dir.join(file_name);
        let tmp = dir.join(format!(".{file_name}.tmp"));
        tracing::info!("Copying {:?} to {:?}", local_archive, target);
        std::fs::copy(local_archive, &tmp)
            .and_then(|_| std::fs::rename(&tmp, &target))
            .map_err(|e| {
                let _ = std::fs::remove_file(&tmp);
                to_upload_error(format!("copy to {target:?}"))(e)
            })?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn list(&self, kind: &str) -> result::Result<Vec<RemoteObject>, UploadError> {
        let dir = self.kind_dir(kind);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(to_upload_error(format!("list {dir:?}"))(e)),
        };
        Ok(entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| {
                let name = e.file_name().to_str()?.to_string();
                (!name.starts_with('.')).then(|| RemoteObject {
                    size: e.metadata().ok().map(|m| m.len()),
                    name,
                })
            })
            .sorted_by(|a, b| a.name.cmp(&b.name))
            .collect())
    }

    fn delete(&self, kind: &str, name: &str) -> result::Result<(), UploadError> {
        let target = self.kind_dir(kind).join(name);
        tracing::info!("Deleting {:?}", target);
        std::fs::remove_file(&target).map_err(to_upload_error(format!("delete {target:?}")))
    }

    fn verify(&self) -> result::Result<(), UploadError> {
        validate_writable_dir(&self.config.root).map_err(|e| {
            UploadError::new(
                UploadErrorKind::Other,
                format!("{:?} is not usable: {e}", self.config.root),
            )
        })
    }
}
