//! `.tar.gz` packaging for artifacts that cross the wire as one blob.
//!
//! Traces and disk images are directory trees of many small files. To ship
//! one, the artifact is renamed into a staging directory under its
//! identifier, compressed into `<name>.tar.gz`, read into memory, and the
//! staged copies are deleted. Receiving runs the same steps backwards.
//!
//! Staging directories must live on the same filesystem as the artifacts,
//! since moves are plain renames.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::error::{Result, StoreError};

/// Move `artifact` (file or directory) into `staging` as `name`, archive it,
/// and return the compressed bytes. The artifact no longer exists afterwards.
pub fn pack(artifact: &Path, staging: &Path, name: &str) -> Result<Vec<u8>> {
    if !artifact.exists() {
        return Err(StoreError::MissingArtifact(artifact.to_path_buf()));
    }
    fs::create_dir_all(staging)?;

    let staged = staging.join(name);
    remove_any(&staged)?;
    fs::rename(artifact, &staged)?;

    let archive_path = staging.join(format!("{name}.tar.gz"));
    let result = write_archive(&staged, name, &archive_path).and_then(|_| Ok(fs::read(&archive_path)?));

    remove_any(&staged)?;
    remove_any(&archive_path)?;

    let bytes = result?;
    debug!(name, bytes = bytes.len(), "artifact packed");
    Ok(bytes)
}

/// Like [`pack`], but leaves `artifact` in place by archiving a copy.
pub fn pack_copy(artifact: &Path, staging: &Path, name: &str) -> Result<Vec<u8>> {
    if !artifact.exists() {
        return Err(StoreError::MissingArtifact(artifact.to_path_buf()));
    }
    fs::create_dir_all(staging)?;
    let copy = staging.join(format!("{name}.copy"));
    remove_any(&copy)?;
    copy_tree(artifact, &copy)?;
    pack(&copy, staging, name)
}

/// Write `bytes` to a staging archive, extract it, and move the single
/// top-level entry to `dest` (replacing whatever was there).
pub fn unpack(bytes: &[u8], staging: &Path, name: &str, dest: &Path) -> Result<()> {
    fs::create_dir_all(staging)?;
    let archive_path = staging.join(format!("{name}.tar.gz"));
    fs::write(&archive_path, bytes)?;

    let result = unpack_file(&archive_path, staging, name, dest);
    remove_any(&archive_path)?;
    result
}

/// Extract an archive already on disk. See [`unpack`].
pub fn unpack_file(archive_path: &Path, staging: &Path, name: &str, dest: &Path) -> Result<()> {
    fs::create_dir_all(staging)?;
    let extract_dir = staging.join(format!("{name}.extract"));
    remove_any(&extract_dir)?;
    fs::create_dir_all(&extract_dir)?;

    let result = extract_into(archive_path, &extract_dir).and_then(|_| {
        let root = single_root(&extract_dir)?;
        remove_any(dest)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&root, dest)?;
        Ok(())
    });

    remove_any(&extract_dir)?;
    result?;
    debug!(name, dest = %dest.display(), "artifact unpacked");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn write_archive(staged: &Path, name: &str, archive_path: &Path) -> Result<()> {
    let file = File::create(archive_path)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    if staged.is_dir() {
        builder.append_dir_all(name, staged)?;
    } else {
        builder.append_path_with_name(staged, name)?;
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?.into_inner().map_err(|e| StoreError::Io(e.into_error()))?;
    Ok(())
}

fn extract_into(archive_path: &Path, extract_dir: &Path) -> Result<()> {
    let file = File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    archive
        .unpack(extract_dir)
        .map_err(|e| StoreError::Archive(format!("{}: {e}", archive_path.display())))
}

fn single_root(extract_dir: &Path) -> Result<PathBuf> {
    let mut entries = fs::read_dir(extract_dir)?.collect::<std::io::Result<Vec<_>>>()?;
    if entries.len() != 1 {
        return Err(StoreError::Archive(format!(
            "expected one top-level entry, found {}",
            entries.len()
        )));
    }
    Ok(entries.remove(0).path())
}

fn remove_any(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    if src.is_dir() {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dest)?;
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
