//! Tar encoding of a dataset directory.
//!
//! Only regular files are archived, in file-name order, with their relative
//! path, permission bits, mtime and size. A directory without regular files
//! encodes to an empty stream rather than a bare tar trailer.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

use crate::TransferError;
use crate::validation::validate_entry_path;

/// Streams `dir` as a tar archive into `writer` and shuts the writer down.
///
/// The archive is produced on the blocking pool.
pub async fn tar_dir<W>(
    dir: PathBuf,
    writer: W,
    cancel: CancellationToken,
) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let bridge = SyncIoBridge::new(writer);
    tokio::task::spawn_blocking(move || {
        let mut bridge = archive_dir(&dir, bridge, &cancel)?;
        bridge.shutdown()?;
        Ok(())
    })
    .await?
}

/// Extracts a tar stream into `dir`, returning the number of files written.
pub async fn untar_dir<R>(
    reader: R,
    dir: PathBuf,
    cancel: CancellationToken,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let bridge = SyncIoBridge::new(reader);
    tokio::task::spawn_blocking(move || extract_archive(bridge, &dir, &cancel)).await?
}

/// Consumes `reader` and returns its length.
pub async fn count_bytes<R>(mut reader: R) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
{
    Ok(tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?)
}

/// Regular files under `dir` as `(relative, absolute)` paths, sorted by name.
fn collect_files(dir: &Path) -> Result<Vec<(PathBuf, PathBuf)>, TransferError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| TransferError::Tar(format!("{}: {e}", entry.path().display())))?
            .to_path_buf();
        files.push((rel, entry.into_path()));
    }
    Ok(files)
}

/// Writes the archive of `dir` to `writer` and hands the writer back.
pub fn archive_dir<W: Write>(
    dir: &Path,
    writer: W,
    cancel: &CancellationToken,
) -> Result<W, TransferError> {
    let files = collect_files(dir)?;
    if files.is_empty() {
        debug!(dir = %dir.display(), "no regular files, empty archive");
        return Ok(writer);
    }

    let mut builder = tar::Builder::new(writer);
    for (rel, path) in &files {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        append_file(&mut builder, rel, path)?;
    }
    debug!(dir = %dir.display(), files = files.len(), "archived directory");
    Ok(builder.into_inner()?)
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    rel: &Path,
    path: &Path,
) -> Result<(), TransferError> {
    let mut file = File::open(path)?;
    let meta = file.metadata()?;
    let size = meta.len();

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(file_mode(&meta));
    header.set_mtime(
        FileTime::from_last_modification_time(&meta)
            .unix_seconds()
            .max(0) as u64,
    );

    let mut limited = (&mut file).take(size);
    builder.append_data(&mut header, rel, &mut limited)?;

    let mut probe = [0u8; 1];
    if limited.limit() != 0 || file.read(&mut probe)? != 0 {
        return Err(TransferError::Tar(format!(
            "{}: size changed while archiving (header says {size} bytes)",
            rel.display()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() { 0o444 } else { 0o644 }
}

/// Extracts regular entries of a tar stream into `dir`.
///
/// Each file is written to a temporary sibling and renamed into place, so a
/// failed extraction never leaves a partially written file under its final
/// name. Bytes after the end of the archive are drained.
pub fn extract_archive<R: Read>(
    reader: R,
    dir: &Path,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    let mut archive = tar::Archive::new(reader);
    let mut files = 0u64;

    for entry in archive.entries()? {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let rel = entry.path()?.into_owned();
        validate_entry_path(&rel)?;
        let size = entry.header().size()?;
        let mode = entry.header().mode()?;
        let mtime = entry.header().mtime()?;

        extract_file(&mut entry, &dir.join(&rel), size, mode, mtime)?;
        files += 1;
    }

    let mut rest = archive.into_inner();
    io::copy(&mut rest, &mut io::sink())?;

    debug!(dir = %dir.display(), files, "extracted archive");
    Ok(files)
}

fn extract_file(
    src: &mut impl Read,
    dest: &Path,
    size: u64,
    mode: u32,
    mtime: u64,
) -> Result<(), TransferError> {
    let parent = dest
        .parent()
        .ok_or_else(|| TransferError::InvalidPath(dest.display().to_string()))?;
    create_dirs(parent)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".nerd-")
        .tempfile_in(parent)?;
    let written = io::copy(src, tmp.as_file_mut())?;
    if written != size {
        return Err(TransferError::Tar(format!(
            "{}: wrote {written} bytes, header says {size}",
            dest.display()
        )));
    }
    set_mode(tmp.as_file(), mode)?;
    tmp.persist(dest).map_err(|e| TransferError::from(e.error))?;

    let mtime = i64::try_from(mtime).unwrap_or(i64::MAX);
    filetime::set_file_mtime(dest, FileTime::from_unix_time(mtime, 0))?;
    Ok(())
}

#[cfg(unix)]
fn create_dirs(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o777).create(dir)
}

#[cfg(not(unix))]
fn create_dirs(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn set_mode(file: &File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(_file: &File, _mode: u32) -> io::Result<()> {
    Ok(())
}
