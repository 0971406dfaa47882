// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Error Hierarchy
// ─────────────────────────────────────────────────────────────────────

use std::path::PathBuf;

use thiserror::Error;

/// Root error type for all calibration kernel failures.
///
/// Out-of-range sensor readings are not errors; they are tallied by the
/// ingestion layer. Everything here is fatal for the current run.
#[derive(Error, Debug)]
pub enum VecalError {
    /// File could not be opened, read, written or renamed.
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Input log had no header or no data rows.
    #[error("input is empty: {0}")]
    EmptyInput(String),

    /// Required columns could not be resolved for the selected dialect.
    #[error(
        "missing required columns for dialect '{dialect}': expected {expected:?}, found {found:?}"
    )]
    MissingColumns {
        dialect: String,
        found: Vec<String>,
        expected: Vec<String>,
    },

    /// Table or grid file does not follow the expected layout.
    #[error("format error: {0}")]
    Format(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Two artifacts that must share bin edges do not.
    #[error("grid mismatch: {0}")]
    GridMismatch(String),

    /// Hash-gated operation refused.
    #[error("integrity failure: {0}")]
    Integrity(IntegrityFailure),

    /// A resolved path falls outside the designated run root.
    #[error("path escapes run root {}: {}", root.display(), path.display())]
    PathEscape { root: PathBuf, path: PathBuf },

    /// Numerical error (NaN/Inf in computation).
    #[error("numerical error: {0}")]
    Numerical(String),

    /// JSON encode/decode failure outside the metadata path.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Reasons a hash-gated operation was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityFailure {
    /// File exists but its content hash differs from the recorded one.
    #[error("{} was modified since apply (expected sha256 {expected}, found {actual})", path.display())]
    Modified {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Apply metadata document does not exist.
    #[error("apply metadata missing: {}", path.display())]
    MetadataMissing { path: PathBuf },

    /// Apply metadata exists but cannot be decoded or is incomplete.
    #[error("apply metadata corrupt ({}): {reason}", path.display())]
    MetadataCorrupt { path: PathBuf, reason: String },

    /// An artifact referenced by the metadata no longer exists.
    #[error("referenced artifact missing: {}", path.display())]
    ArtifactMissing { path: PathBuf },
}

impl From<IntegrityFailure> for VecalError {
    fn from(failure: IntegrityFailure) -> Self {
        VecalError::Integrity(failure)
    }
}

impl VecalError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        VecalError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for tamper and metadata failures on the apply/rollback path.
    pub fn is_integrity(&self) -> bool {
        matches!(self, VecalError::Integrity(_))
    }
}

pub type VecalResult<T> = Result<T, VecalError>;
