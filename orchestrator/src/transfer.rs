// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Moving files in and out of targets, and whole-file JSON documents built on
//! top of that.

use crate::target::Target;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("cleanup of the archive requires extracting it")]
    CleanupWithoutExtract,
    #[error("remote path \"{path}\" has no file name")]
    InvalidRemotePath { path: String },
    #[error("local I/O error on \"{path}\"")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("copying to or from {target} failed: {message}")]
    Runtime { target: String, message: String },
    #[error("\"{path}\" on {target} is not valid JSON")]
    Json {
        target: String,
        path: String,
        #[source]
        err: serde_json::Error,
    },
}

/// What to do with an archive once it has been copied out of a target.
///
/// Of the four combinations, `cleanup` without `extract` is invalid: it would
/// discard the only copy of the data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArchiveOptions {
    pub extract: bool,
    pub cleanup: bool,
}

impl ArchiveOptions {
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.cleanup && !self.extract {
            return Err(TransferError::CleanupWithoutExtract);
        }
        Ok(())
    }
}

/// Raw file movement between this host and a target.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Copies the tar archive at `local_archive` into `target` and extracts
    /// it under `remote_dir`, which is created if missing. Returns the
    /// directory the archive was extracted into.
    async fn copy_in_as_archive(
        &self,
        target: &Target,
        local_archive: &Utf8Path,
        remote_dir: &str,
    ) -> Result<String, TransferError>;

    /// Writes `remote_path` (a file or directory) from `target` into a tar
    /// archive at `archive_path`.
    async fn fetch_archive(
        &self,
        target: &Target,
        remote_path: &str,
        archive_path: &Utf8Path,
    ) -> Result<(), TransferError>;
}

fn remote_basename(remote_path: &str) -> Result<&str, TransferError> {
    remote_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .ok_or_else(|| TransferError::InvalidRemotePath {
            path: remote_path.to_string(),
        })
}

/// Copies `remote_path` out of `target` into `dest_dir`.
///
/// Returns `<dest_dir>/<name>.tar` when not extracting, or `<dest_dir>/<name>`
/// when extracting, where `<name>` is the last component of `remote_path`.
/// The options are validated before any I/O takes place.
pub async fn copy_out(
    transfer: &dyn FileTransfer,
    target: &Target,
    remote_path: &str,
    dest_dir: &Utf8Path,
    options: ArchiveOptions,
) -> Result<Utf8PathBuf, TransferError> {
    options.validate()?;
    let name = remote_basename(remote_path)?;

    fs_err::tokio::create_dir_all(dest_dir).await.map_err(|err| {
        TransferError::Io { path: dest_dir.to_owned(), err }
    })?;
    let archive_path = dest_dir.join(format!("{name}.tar"));
    transfer.fetch_archive(target, remote_path, &archive_path).await?;

    let dest_dir = dest_dir.to_owned();
    let name = name.to_string();
    tokio::task::spawn_blocking(move || {
        finish_copy_out(&archive_path, &dest_dir, &name, options)
    })
    .await
    .map_err(|err| TransferError::Runtime {
        target: target.name.clone(),
        message: format!("archive extraction task failed: {err}"),
    })?
}

fn finish_copy_out(
    archive_path: &Utf8Path,
    dest_dir: &Utf8Path,
    name: &str,
    options: ArchiveOptions,
) -> Result<Utf8PathBuf, TransferError> {
    if !options.extract {
        return Ok(archive_path.to_owned());
    }

    let io_err =
        |err| TransferError::Io { path: archive_path.to_owned(), err };
    let file = fs_err::File::open(archive_path).map_err(io_err)?;
    tar::Archive::new(file).unpack(dest_dir).map_err(io_err)?;
    if options.cleanup {
        fs_err::remove_file(archive_path).map_err(io_err)?;
    }
    Ok(dest_dir.join(name))
}

/// Whole-document JSON reads and writes against files on a target.
///
/// Writes overwrite the entire file; callers read, modify and write back the
/// whole document. Concurrent writers to the same path are not safe.
#[async_trait]
pub trait RemoteJson: Send + Sync {
    async fn read_json(
        &self,
        target: &Target,
        path: &str,
    ) -> Result<serde_json::Value, TransferError>;

    async fn write_json(
        &self,
        target: &Target,
        path: &str,
        value: &serde_json::Value,
    ) -> Result<(), TransferError>;
}

/// [RemoteJson] implemented with plain file transfers.
pub struct FileTransferJson {
    transfer: Arc<dyn FileTransfer>,
}

impl FileTransferJson {
    pub fn new(transfer: Arc<dyn FileTransfer>) -> Self {
        FileTransferJson { transfer }
    }
}

fn scratch_dir() -> Result<Utf8TempDir, TransferError> {
    Utf8TempDir::new().map_err(|err| TransferError::Io {
        path: Utf8PathBuf::from("<temporary directory>"),
        err,
    })
}

#[async_trait]
impl RemoteJson for FileTransferJson {
    async fn read_json(
        &self,
        target: &Target,
        path: &str,
    ) -> Result<serde_json::Value, TransferError> {
        let scratch = scratch_dir()?;
        let local = copy_out(
            self.transfer.as_ref(),
            target,
            path,
            scratch.path(),
            ArchiveOptions { extract: true, cleanup: true },
        )
        .await?;
        let contents = fs_err::tokio::read_to_string(&local)
            .await
            .map_err(|err| TransferError::Io { path: local.clone(), err })?;
        serde_json::from_str(&contents).map_err(|err| TransferError::Json {
            target: target.name.clone(),
            path: path.to_string(),
            err,
        })
    }

    async fn write_json(
        &self,
        target: &Target,
        path: &str,
        value: &serde_json::Value,
    ) -> Result<(), TransferError> {
        let name = remote_basename(path)?;
        let remote_dir = match path.trim_end_matches('/').rsplit_once('/') {
            Some(("", _)) => "/",
            Some((dir, _)) => dir,
            None => ".",
        };
        let contents =
            serde_json::to_vec_pretty(value).map_err(|err| {
                TransferError::Json {
                    target: target.name.clone(),
                    path: path.to_string(),
                    err,
                }
            })?;

        let scratch = scratch_dir()?;
        let archive_path = scratch.path().join(format!("{name}.tar"));
        write_single_file_archive(&archive_path, name, &contents)?;
        self.transfer
            .copy_in_as_archive(target, &archive_path, remote_dir)
            .await?;
        Ok(())
    }
}

fn write_single_file_archive(
    archive_path: &Utf8Path,
    name: &str,
    contents: &[u8],
) -> Result<(), TransferError> {
    let io_err =
        |err| TransferError::Io { path: archive_path.to_owned(), err };
    let file = fs_err::File::create(archive_path).map_err(io_err)?;
    let mut builder = tar::Builder::new(file);
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o644);
    header.set_size(contents.len() as u64);
    builder.append_data(&mut header, name, contents).map_err(io_err)?;
    builder.into_inner().map_err(io_err)?;
    Ok(())
}
