// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Run Root Path Guard
// ─────────────────────────────────────────────────────────────────────
//! Every output path is resolved against a designated run root before
//! any write. `..` components are rejected outright; absolute paths and
//! symlinked ancestors must still land inside the canonical root.

use std::path::{Component, Path, PathBuf};

use vecal_types::{VecalError, VecalResult};

use crate::atomic::{write_atomic, write_atomic_new};

/// Canonicalised directory that bounds all writes of one run.
#[derive(Debug, Clone)]
pub struct RunRoot {
    root: PathBuf,
}

impl RunRoot {
    /// Create the directory if needed and pin its canonical path.
    pub fn create(path: &Path) -> VecalResult<Self> {
        std::fs::create_dir_all(path).map_err(|e| VecalError::io(path, e))?;
        let root = path.canonicalize().map_err(|e| VecalError::io(path, e))?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve `candidate` (relative to the root, or absolute) to a path
    /// guaranteed to sit inside the root. Performs no writes.
    pub fn resolve(&self, candidate: &Path) -> VecalResult<PathBuf> {
        let escape = || VecalError::PathEscape {
            root: self.root.clone(),
            path: candidate.to_path_buf(),
        };

        let mut resolved = if candidate.is_absolute() {
            PathBuf::new()
        } else {
            self.root.clone()
        };
        for component in candidate.components() {
            match component {
                Component::ParentDir => return Err(escape()),
                Component::CurDir => {}
                Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                    resolved.push(component.as_os_str())
                }
            }
        }

        if !resolved.starts_with(&self.root) || resolved == self.root {
            return Err(escape());
        }

        // Symlinks: the deepest existing ancestor (or the path itself) must
        // canonicalise to somewhere under the root.
        let mut ancestor = resolved.as_path();
        loop {
            if ancestor.exists() || ancestor.symlink_metadata().is_ok() {
                let canonical = ancestor.canonicalize().map_err(|_| escape())?;
                if !canonical.starts_with(&self.root) {
                    return Err(escape());
                }
                break;
            }
            match ancestor.parent() {
                Some(parent) => ancestor = parent,
                None => return Err(escape()),
            }
        }

        Ok(resolved)
    }

    /// Nested run root (for example `<out_dir>/<run_id>`).
    pub fn child(&self, name: &str) -> VecalResult<RunRoot> {
        let path = self.resolve(Path::new(name))?;
        RunRoot::create(&path)
    }

    /// Guarded atomic write that replaces an existing file.
    pub fn write(&self, relative: &Path, bytes: &[u8]) -> VecalResult<PathBuf> {
        let path = self.resolve(relative)?;
        write_atomic(&path, bytes)?;
        log::debug!("wrote {} ({} bytes)", path.display(), bytes.len());
        Ok(path)
    }

    /// Guarded atomic write that refuses to replace an existing file.
    pub fn write_new(&self, relative: &Path, bytes: &[u8]) -> VecalResult<PathBuf> {
        let path = self.resolve(relative)?;
        write_atomic_new(&path, bytes)?;
        log::debug!("wrote {} ({} bytes, create-new)", path.display(), bytes.len());
        Ok(path)
    }
}
