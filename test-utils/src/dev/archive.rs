// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builders for the tar archives that stand in for `docker cp` output.

use anyhow::{Context, Result};
use camino::Utf8Path;

/// Writes a tar archive at `archive_path` holding a directory named `root`
/// with one regular file per `(relative path, contents)` entry.
///
/// This mirrors what the container runtime produces when a directory is
/// copied out of a target.
pub fn write_directory_archive(
    archive_path: &Utf8Path,
    root: &str,
    files: &[(&str, &[u8])],
) -> Result<()> {
    let file = std::fs::File::create(archive_path)
        .with_context(|| format!("creating {archive_path}"))?;
    let mut builder = tar::Builder::new(file);

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_mode(0o755);
    header.set_size(0);
    builder
        .append_data(&mut header, format!("{root}/"), std::io::empty())
        .context("appending root directory")?;

    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(contents.len() as u64);
        builder
            .append_data(&mut header, format!("{root}/{path}"), *contents)
            .with_context(|| format!("appending {root}/{path}"))?;
    }
    builder.into_inner().context("finishing archive")?;
    Ok(())
}

/// Writes a tar archive at `archive_path` holding a single regular file.
pub fn write_file_archive(
    archive_path: &Utf8Path,
    name: &str,
    contents: &[u8],
) -> Result<()> {
    let file = std::fs::File::create(archive_path)
        .with_context(|| format!("creating {archive_path}"))?;
    let mut builder = tar::Builder::new(file);
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o644);
    header.set_size(contents.len() as u64);
    builder
        .append_data(&mut header, name, contents)
        .with_context(|| format!("appending {name}"))?;
    builder.into_inner().context("finishing archive")?;
    Ok(())
}
