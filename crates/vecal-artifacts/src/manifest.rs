// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Run Manifest & Provenance
// ─────────────────────────────────────────────────────────────────────
//! One manifest per run: every input and output artifact with its
//! content hash and shape, an overall status, and run statistics.
//! Written once with create-new semantics and never mutated.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use vecal_types::{VecalError, VecalResult};

use crate::delimited::{detect_delimiter, split_fields};
use crate::hashing::{sha256_file, sha256_hex};
use crate::run_root::RunRoot;

pub const MANIFEST_SCHEMA_ID: &str = "vecal-run-manifest/1";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Success,
    Partial,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub code: StatusCode,
    pub message: String,
    /// Pipeline stage the status refers to (last completed or failing).
    pub stage: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub name: String,
    /// Outputs: relative to the manifest directory. Inputs: as supplied.
    pub path: String,
    pub sha256: String,
    pub rows: Option<usize>,
    pub cols: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub rows_read: usize,
    pub bins_total: usize,
    pub bins_populated: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_id: String,
    pub run_id: String,
    pub created_at: String,
    pub status: RunStatus,
    pub inputs: Vec<ArtifactEntry>,
    pub outputs: Vec<ArtifactEntry>,
    pub stats: RunStats,
}

/// `yyyymmddThhmmssZ-<8 hex>`: readable, sortable, and unique enough to
/// keep concurrent runs apart. Not a security identifier.
pub fn run_id(created_at: DateTime<Utc>, fingerprint_parts: &[&str]) -> String {
    let joined = fingerprint_parts.join("\u{1f}");
    let digest = sha256_hex(joined.as_bytes());
    format!("{}-{}", created_at.format("%Y%m%dT%H%M%SZ"), &digest[..8])
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(text: &str) -> VecalResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| VecalError::Config(format!("invalid RFC 3339 timestamp '{text}': {e}")))
}

/// Row/column counts of a delimited text file: data rows after the header,
/// and header field count (quote-aware). `None` for non-tabular artifacts;
/// `cols` is also `None` when the header has an unterminated quote.
pub fn tabular_shape(path: &Path, bytes: &[u8]) -> (Option<usize>, Option<usize>) {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    if !matches!(ext.as_deref(), Some("csv" | "tsv" | "txt" | "log")) {
        return (None, None);
    }
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return (Some(0), Some(0));
    };
    let cols = split_fields(header, detect_delimiter(header)).map(|fields| fields.len());
    (Some(lines.count()), cols)
}

impl ArtifactEntry {
    /// Hash and measure an artifact on disk.
    ///
    /// `recorded_path` is what goes into the manifest; `disk_path` is read.
    pub fn describe(name: &str, disk_path: &Path, recorded_path: &str) -> VecalResult<Self> {
        let sha256 = sha256_file(disk_path)?;
        let bytes = std::fs::read(disk_path).map_err(|e| VecalError::io(disk_path, e))?;
        let (rows, cols) = tabular_shape(disk_path, &bytes);
        Ok(Self {
            name: name.to_string(),
            path: recorded_path.to_string(),
            sha256,
            rows,
            cols,
        })
    }

    /// Entry for bytes already read and hashed by the caller, so the
    /// manifest certifies exactly what was consumed.
    pub fn from_read(name: &str, path: &Path, bytes: &[u8], sha256: &str) -> Self {
        let (rows, cols) = tabular_shape(path, bytes);
        Self {
            name: name.to_string(),
            path: path.display().to_string(),
            sha256: sha256.to_string(),
            rows,
            cols,
        }
    }
}

/// Collects entries during a run and writes the manifest once.
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    run_id: String,
    created_at: String,
    inputs: Vec<ArtifactEntry>,
    outputs: Vec<ArtifactEntry>,
    stats: RunStats,
}

impl ManifestBuilder {
    pub fn new(run_id: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.to_string(),
            created_at: format_timestamp(created_at),
            inputs: Vec::new(),
            outputs: Vec::new(),
            stats: RunStats::default(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Register an input from the bytes the run actually consumed.
    pub fn add_input(
        &mut self,
        name: &str,
        path: &Path,
        bytes: &[u8],
        sha256: &str,
    ) -> &ArtifactEntry {
        self.inputs.push(ArtifactEntry::from_read(name, path, bytes, sha256));
        &self.inputs[self.inputs.len() - 1]
    }

    /// Register an output that lives inside `root`.
    pub fn add_output(
        &mut self,
        root: &RunRoot,
        name: &str,
        path: &Path,
    ) -> VecalResult<&ArtifactEntry> {
        let relative = path
            .strip_prefix(root.path())
            .map_err(|_| VecalError::PathEscape {
                root: root.path().to_path_buf(),
                path: path.to_path_buf(),
            })?;
        let entry = ArtifactEntry::describe(name, path, &relative.to_string_lossy())?;
        log::info!("artifact {name}: {} sha256={}", path.display(), entry.sha256);
        self.outputs.push(entry);
        Ok(&self.outputs[self.outputs.len() - 1])
    }

    pub fn set_stats(&mut self, stats: RunStats) {
        self.stats = stats;
    }

    pub fn finish(self, status: RunStatus) -> Manifest {
        Manifest {
            schema_id: MANIFEST_SCHEMA_ID.to_string(),
            run_id: self.run_id,
            created_at: self.created_at,
            status,
            inputs: self.inputs,
            outputs: self.outputs,
            stats: self.stats,
        }
    }
}

impl Manifest {
    pub fn to_json(&self) -> VecalResult<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| VecalError::Serialization(e.to_string()))?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Write `manifest.json` into `root`. Fails if one already exists.
    pub fn write(&self, root: &RunRoot) -> VecalResult<PathBuf> {
        let path = root.write_new(Path::new(MANIFEST_FILE), &self.to_json()?)?;
        log::info!(
            "manifest {} written: status={:?} outputs={}",
            self.run_id,
            self.status.code,
            self.outputs.len()
        );
        Ok(path)
    }

    pub fn load(path: &Path) -> VecalResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| VecalError::io(path, e))?;
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| VecalError::Serialization(format!("{}: {e}", path.display())))?;
        if manifest.schema_id != MANIFEST_SCHEMA_ID {
            return Err(VecalError::Format(format!(
                "{}: unexpected schema_id '{}' (expected '{}')",
                path.display(),
                manifest.schema_id,
                MANIFEST_SCHEMA_ID
            )));
        }
        Ok(manifest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestIssue {
    pub name: String,
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestReport {
    pub run_id: String,
    pub checked: usize,
    pub issues: Vec<ManifestIssue>,
}

impl ManifestReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Recompute every hash listed in a manifest.
///
/// Outputs resolve against the manifest's directory; inputs use their
/// recorded path. Missing files and mismatches become issues, not errors.
pub fn verify_manifest(manifest_path: &Path) -> VecalResult<ManifestReport> {
    let manifest = Manifest::load(manifest_path)?;
    let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let mut issues = Vec::new();
    let mut checked = 0usize;

    let targets = manifest
        .inputs
        .iter()
        .map(|e| (e, PathBuf::from(&e.path)))
        .chain(manifest.outputs.iter().map(|e| (e, base.join(&e.path))));

    for (entry, path) in targets {
        checked += 1;
        if !path.exists() {
            issues.push(ManifestIssue {
                name: entry.name.clone(),
                path: entry.path.clone(),
                message: "artifact missing".to_string(),
            });
            continue;
        }
        match sha256_file(&path) {
            Ok(actual) if actual == entry.sha256 => {}
            Ok(actual) => issues.push(ManifestIssue {
                name: entry.name.clone(),
                path: entry.path.clone(),
                message: format!(
                    "hash mismatch (expected {}, computed {})",
                    entry.sha256, actual
                ),
            }),
            Err(err) => issues.push(ManifestIssue {
                name: entry.name.clone(),
                path: entry.path.clone(),
                message: format!("artifact read failed: {err}"),
            }),
        }
    }

    if !issues.is_empty() {
        log::warn!(
            "manifest {}: {} of {} artifacts failed verification",
            manifest.run_id,
            issues.len(),
            checked
        );
    }
    Ok(ManifestReport {
        run_id: manifest.run_id,
        checked,
        issues,
    })
}
