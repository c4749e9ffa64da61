//! Safe extraction of a named binary from a gzipped tar archive.
//!
//! Grounded in the `extract_from_tar_gz` pattern from the corpus's other
//! update-client examples (`flate2::read::GzDecoder` + `tar::Archive`),
//! hardened with the path-traversal and size-cap defenses this crate
//! requires: every entry is rejected if its normalized path would escape
//! `dest_dir`, and a declared or actual size above the cap aborts the
//! extraction before writing.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use uuid::Uuid;

use super::error::{UpdateError, UpdateResult};

/// Maximum size (bytes) of any single extracted file. Applied both to the
/// tar header's declared size (reject before reading) and as a hard cap on
/// the actual bytes copied (a lying header cannot overflow it).
pub const MAX_EXTRACTED_SIZE: u64 = 100 * 1024 * 1024;

/// Validates that `name`, once normalized and joined onto `dest_dir`, stays
/// strictly within `dest_dir`. Rejects absolute paths and any `..`
/// component outright before even joining, then re-checks the joined,
/// lexically-normalized result as defense in depth.
fn safe_join(dest_dir: &Path, name: &Path) -> UpdateResult<PathBuf> {
    if name.is_absolute() {
        return Err(UpdateError::PathTraversal(name.display().to_string()));
    }

    for component in name.components() {
        match component {
            Component::ParentDir => {
                return Err(UpdateError::PathTraversal(name.display().to_string()));
            }
            Component::Normal(_) | Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(UpdateError::PathTraversal(name.display().to_string()));
            }
        }
    }

    let joined = dest_dir.join(name);
    let normalized = lexically_normalize(&joined);
    let dest_normalized = lexically_normalize(dest_dir);

    if !normalized.starts_with(&dest_normalized) {
        return Err(UpdateError::PathTraversal(name.display().to_string()));
    }

    Ok(joined)
}

/// Lexical (non-syscall) path normalization: resolves `.`/`..` components
/// without touching the filesystem, so this works even for paths that don't
/// exist yet.
fn lexically_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Extracts every regular file and directory from the gzipped tar at
/// `tar_path` into `dest_dir`, preserving mode bits. Non-regular-file,
/// non-directory entries (symlinks, devices, fifos) are ignored.
pub fn extract_tar_gz(tar_path: &Path, dest_dir: &Path) -> UpdateResult<()> {
    let file = fs::File::open(tar_path)
        .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to open {}: {e}", tar_path.display())))?;
    let decoder = GzDecoder::new(file);
    let mut archive = Archive::new(decoder);

    let entries = archive
        .entries()
        .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to read tar entries: {e}")))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to read tar entry: {e}")))?;
        let header = entry.header();
        let entry_path = entry
            .path()
            .map_err(|e| UpdateError::Other(anyhow::anyhow!("invalid entry path: {e}")))?
            .into_owned();

        let dest_path = safe_join(dest_dir, &entry_path)?;

        if header.entry_type().is_dir() {
            fs::create_dir_all(&dest_path)
                .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to create {}: {e}", dest_path.display())))?;
            continue;
        }

        if !header.entry_type().is_file() {
            continue;
        }

        let declared_size = header
            .size()
            .map_err(|e| UpdateError::Other(anyhow::anyhow!("invalid tar header size: {e}")))?;
        if declared_size > MAX_EXTRACTED_SIZE {
            return Err(UpdateError::BinaryTooLarge {
                declared: declared_size,
                max: MAX_EXTRACTED_SIZE,
            });
        }

        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to create {}: {e}", parent.display())))?;
        }

        write_capped(&mut entry, &dest_path, declared_size)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = header.mode().unwrap_or(0o644);
            let _ = fs::set_permissions(&dest_path, fs::Permissions::from_mode(mode));
        }
    }

    Ok(())
}

/// Extracts the single entry whose basename matches `inner_name` to
/// `dest_path`, via temp-file-plus-rename for atomicity. Returns
/// `FileNotFound` if no matching entry exists.
pub fn extract_file(tar_path: &Path, inner_name: &str, dest_path: &Path) -> UpdateResult<()> {
    let file = fs::File::open(tar_path)
        .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to open {}: {e}", tar_path.display())))?;
    let decoder = GzDecoder::new(file);
    let mut archive = Archive::new(decoder);

    let parent = dest_path
        .parent()
        .ok_or_else(|| UpdateError::Other(anyhow::anyhow!("dest_path has no parent directory")))?;
    fs::create_dir_all(parent)
        .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to create {}: {e}", parent.display())))?;

    let entries = archive
        .entries()
        .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to read tar entries: {e}")))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to read tar entry: {e}")))?;
        let header = entry.header();
        if !header.entry_type().is_file() {
            continue;
        }

        let entry_path = entry
            .path()
            .map_err(|e| UpdateError::Other(anyhow::anyhow!("invalid entry path: {e}")))?
            .into_owned();

        // Path-basename match is accepted per the artifact contract, but the
        // entry's full recorded path must still resolve safely — we never
        // trust tar metadata even for the file we're looking for.
        safe_join(dest_path.parent().unwrap_or(Path::new(".")), &entry_path)?;

        if entry_path.file_name().and_then(|n| n.to_str()) != Some(inner_name) {
            continue;
        }

        let declared_size = header
            .size()
            .map_err(|e| UpdateError::Other(anyhow::anyhow!("invalid tar header size: {e}")))?;
        if declared_size > MAX_EXTRACTED_SIZE {
            return Err(UpdateError::BinaryTooLarge {
                declared: declared_size,
                max: MAX_EXTRACTED_SIZE,
            });
        }

        let temp_path = parent.join(format!(".{inner_name}-{}.tmp", Uuid::new_v4()));
        write_capped(&mut entry, &temp_path, declared_size)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = header.mode().unwrap_or(0o755);
            let _ = fs::set_permissions(&temp_path, fs::Permissions::from_mode(mode));
        }

        fs::rename(&temp_path, dest_path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            UpdateError::Other(anyhow::anyhow!(
                "unable to rename {} to {}: {e}",
                temp_path.display(),
                dest_path.display()
            ))
        })?;

        return Ok(());
    }

    Err(UpdateError::FileNotFound(inner_name.to_string()))
}

/// Copies at most `MAX_EXTRACTED_SIZE` bytes from `entry` into a new file at
/// `dest_path`, refusing to write past the cap even if the header lied
/// about `declared_size`.
fn write_capped<R: Read>(entry: &mut R, dest_path: &Path, declared_size: u64) -> UpdateResult<()> {
    let cap = declared_size.min(MAX_EXTRACTED_SIZE);
    let mut limited = entry.take(cap);
    let mut out = fs::File::create(dest_path)
        .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to create {}: {e}", dest_path.display())))?;
    std::io::copy(&mut limited, &mut out)
        .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to write {}: {e}", dest_path.display())))?;
    Ok(())
}
