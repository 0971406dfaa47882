// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Atomic File Writes
// ─────────────────────────────────────────────────────────────────────
//! Every artifact is written to a temporary file in its destination
//! directory, flushed to disk, then renamed into place. A reader never
//! observes a partially written file under its final name.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use vecal_types::{VecalError, VecalResult};

fn staged(path: &Path, bytes: &[u8]) -> VecalResult<NamedTempFile> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| VecalError::io(parent, e))?;
    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| VecalError::io(parent, e))?;
    tmp.write_all(bytes).map_err(|e| VecalError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| VecalError::io(tmp.path(), e))?;
    Ok(tmp)
}

/// Write `bytes` to `path` via temp file + rename, replacing any existing file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> VecalResult<()> {
    let tmp = staged(path, bytes)?;
    tmp.persist(path).map_err(|e| VecalError::io(path, e.error))?;
    Ok(())
}

/// Like [`write_atomic`] but fails if `path` already exists.
pub fn write_atomic_new(path: &Path, bytes: &[u8]) -> VecalResult<()> {
    let tmp = staged(path, bytes)?;
    tmp.persist_noclobber(path)
        .map_err(|e| VecalError::io(path, e.error))?;
    Ok(())
}
