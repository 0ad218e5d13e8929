//! Atomic file replacement.

use std::io::Write as _;
use std::path::Path;

/// Write `bytes` to `path` via a uniquely named temp file in the same
/// directory: write, fsync, rename. Readers see either the old content or
/// the new content, never a prefix. Concurrent writers do not share a temp
/// file.
///
/// # Errors
/// Propagates I/O errors; the temp file is removed on failure.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", path.display()),
        )
    })?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Remove `path`, treating "already gone" as success. Returns whether this
/// call removed it.
///
/// # Errors
/// Propagates I/O errors other than not-found.
pub fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
