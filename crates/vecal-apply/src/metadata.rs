// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Apply Metadata
// ─────────────────────────────────────────────────────────────────────
//! The record binding one apply operation to the exact bytes it consumed
//! and produced. It is the sole authority for whether a rollback may run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use vecal_artifacts::RunRoot;
use vecal_types::{
    check_apply_clamp_limit, ClampedCell, IntegrityFailure, VecalError, VecalResult,
};

pub const APPLY_METADATA_SCHEMA_ID: &str = "vecal-apply-metadata/1";
const METADATA_SUFFIX: &str = ".apply.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyMetadata {
    pub schema_id: String,
    pub base_table_sha256: String,
    pub correction_grid_sha256: String,
    pub clamp_limit_pct: f64,
    /// RFC 3339, UTC.
    pub applied_at: String,
    pub base_table_path: PathBuf,
    pub correction_grid_path: PathBuf,
    pub output_table_path: PathBuf,
    pub output_table_sha256: String,
    pub clamped_cells: Vec<ClampedCell>,
}

/// Default metadata location: `<table>.apply.json` next to the output.
pub fn metadata_path_for(output_table: &Path) -> PathBuf {
    let mut name = output_table
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(METADATA_SUFFIX);
    output_table.with_file_name(name)
}

fn is_sha256_hex(text: &str) -> bool {
    text.len() == 64 && text.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl ApplyMetadata {
    /// Structural checks on a decoded document.
    fn check(&self) -> Result<(), String> {
        if self.schema_id != APPLY_METADATA_SCHEMA_ID {
            return Err(format!(
                "schema_id '{}' (expected '{}')",
                self.schema_id, APPLY_METADATA_SCHEMA_ID
            ));
        }
        for (field, value) in [
            ("base_table_sha256", &self.base_table_sha256),
            ("correction_grid_sha256", &self.correction_grid_sha256),
            ("output_table_sha256", &self.output_table_sha256),
        ] {
            if !is_sha256_hex(value) {
                return Err(format!("{field} is not a sha256 hex digest"));
            }
        }
        check_apply_clamp_limit(self.clamp_limit_pct, "clamp_limit_pct")
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Load and check a metadata document. A missing file and an
    /// unreadable one are reported as different integrity failures.
    pub fn load(path: &Path) -> VecalResult<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IntegrityFailure::MetadataMissing {
                    path: path.to_path_buf(),
                }
                .into());
            }
            Err(e) => return Err(VecalError::io(path, e)),
        };
        let corrupt = |reason: String| -> VecalError {
            IntegrityFailure::MetadataCorrupt {
                path: path.to_path_buf(),
                reason,
            }
            .into()
        };
        let metadata: ApplyMetadata =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
        metadata.check().map_err(corrupt)?;
        Ok(metadata)
    }

    /// Atomic write of the document at `path`, which must resolve inside `root`.
    pub fn write(&self, root: &RunRoot, path: &Path) -> VecalResult<PathBuf> {
        let mut json = serde_json::to_vec_pretty(self)
            .map_err(|e| VecalError::Serialization(e.to_string()))?;
        json.push(b'\n');
        root.write(path, &json)
    }
}
