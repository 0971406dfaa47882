// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Apply / Rollback Engine
// ─────────────────────────────────────────────────────────────────────
//! The only component that produces a new VE table.
//!
//! apply:    updated  = round4(base    × (1 + clamp(f, ±limit) / 100))
//! rollback: restored = round4(current ÷ (1 + clamp(f, ±limit) / 100))
//!
//! Rollback runs only when the correction grid and the current table
//! still hash to the digests recorded at apply time; the bytes hashed are
//! the bytes parsed. All writes resolve inside the request's `out_dir`.
//! Every call walks
//! `Idle → Validating → Computing → Writing → Done`, or stops in
//! `Rejected`; nothing carries over between calls. Dry runs stop after
//! `Computing` and write nothing.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use vecal_artifacts::{read_hashed, sha256_file, sha256_hex, CorrectionGrid, RunRoot, VeTable};
use vecal_types::{
    check_apply_clamp_limit, clamp_grid, clamp_pct, pct_factor, round_places, ClampedCell,
    IntegrityFailure, ValueGrid, VecalError, VecalResult,
};

use crate::metadata::{metadata_path_for, ApplyMetadata, APPLY_METADATA_SCHEMA_ID};

/// VE tables carry four decimals.
const VE_PLACES: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Validating,
    Computing,
    Writing,
    Done,
    Rejected,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Validating => "validating",
            EngineState::Computing => "computing",
            EngineState::Writing => "writing",
            EngineState::Done => "done",
            EngineState::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Per-call state machine. Records every transition for the outcome.
#[derive(Debug)]
struct Machine {
    operation: &'static str,
    state: EngineState,
    history: Vec<EngineState>,
}

impl Machine {
    fn start(operation: &'static str) -> Self {
        Self {
            operation,
            state: EngineState::Idle,
            history: vec![EngineState::Idle],
        }
    }

    fn advance(&mut self, next: EngineState) {
        log::debug!("{}: {} → {}", self.operation, self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Run `step`; on failure move to `Rejected` and pass the error on.
    fn guard<T>(&mut self, step: VecalResult<T>) -> VecalResult<T> {
        if let Err(err) = &step {
            if err.is_integrity() {
                log::error!("{} rejected: {err}", self.operation);
            } else {
                log::warn!("{} rejected: {err}", self.operation);
            }
            self.advance(EngineState::Rejected);
        }
        step
    }
}

// ── Integrity checks ────────────────────────────────────────────────

/// Outcome of comparing a file against its recorded digest.
#[must_use = "a Modified result has to be branched on"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityCheck {
    Intact,
    Modified { expected: String, actual: String },
}

impl IntegrityCheck {
    pub fn compare(expected: &str, actual: String) -> Self {
        if actual == expected {
            IntegrityCheck::Intact
        } else {
            IntegrityCheck::Modified {
                expected: expected.to_string(),
                actual,
            }
        }
    }

    pub fn is_intact(&self) -> bool {
        matches!(self, IntegrityCheck::Intact)
    }

    /// Turn `Modified` into an [`IntegrityFailure::Modified`] error.
    pub fn require_intact(self, path: &Path) -> VecalResult<()> {
        match self {
            IntegrityCheck::Intact => Ok(()),
            IntegrityCheck::Modified { expected, actual } => {
                Err(IntegrityFailure::Modified {
                    path: path.to_path_buf(),
                    expected,
                    actual,
                }
                .into())
            }
        }
    }
}

/// Hash `path` and compare. A missing file is an error, not `Modified`.
pub fn check_integrity(path: &Path, expected_sha256: &str) -> VecalResult<IntegrityCheck> {
    if !path.exists() {
        return Err(IntegrityFailure::ArtifactMissing {
            path: path.to_path_buf(),
        }
        .into());
    }
    Ok(IntegrityCheck::compare(expected_sha256, sha256_file(path)?))
}

/// Read `path` once, require its digest to match, and return that text.
fn read_verified(path: &Path, expected_sha256: &str) -> VecalResult<String> {
    let (bytes, actual) = match read_hashed(path) {
        Ok(read) => read,
        Err(VecalError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            return Err(IntegrityFailure::ArtifactMissing {
                path: path.to_path_buf(),
            }
            .into());
        }
        Err(e) => return Err(e),
    };
    IntegrityCheck::compare(expected_sha256, actual).require_intact(path)?;
    decode_utf8(path, bytes)
}

// ── Shared helpers ──────────────────────────────────────────────────

fn decode_utf8(path: &Path, bytes: Vec<u8>) -> VecalResult<String> {
    String::from_utf8(bytes)
        .map_err(|_| VecalError::Format(format!("{}: not valid UTF-8", path.display())))
}

fn read_text(path: &Path) -> VecalResult<(String, String)> {
    let (bytes, sha) = read_hashed(path)?;
    Ok((decode_utf8(path, bytes)?, sha))
}

fn canonical_or_given(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn refuse_overwrite(output: &Path, protected: &[(&str, &Path)]) -> VecalResult<()> {
    for (what, path) in protected {
        if same_path(output, path) {
            return Err(VecalError::Config(format!(
                "output {} would overwrite the {what}; tables are never modified in place",
                output.display()
            )));
        }
    }
    Ok(())
}

/// Cell-wise transform of `table` by the clamped correction factor.
/// Cells without a table value stay empty; cells without a correction
/// keep the table value.
fn transform(
    table: &ValueGrid,
    correction: &ValueGrid,
    limit: f64,
    op: impl Fn(f64, f64) -> f64,
) -> VecalResult<(ValueGrid, usize, f64)> {
    let mut changed = 0usize;
    let mut max_delta = 0.0_f64;
    let out = table.zip_with(correction, "VE table vs correction grid", |ve, pct| {
        let ve = (*ve)?;
        let Some(pct) = *pct else {
            return Some(ve);
        };
        let updated = round_places(op(ve, pct_factor(clamp_pct(pct, limit))), VE_PLACES);
        let delta = (updated - ve).abs();
        if delta > 0.0 {
            changed += 1;
            max_delta = max_delta.max(delta);
        }
        Some(updated)
    })?;
    if out.cells().iter().flatten().any(|v| !v.is_finite() || *v <= 0.0) {
        return Err(VecalError::Numerical(
            "transform produced a non-positive or non-finite VE value".to_string(),
        ));
    }
    Ok((out, changed, max_delta))
}

// ── Apply ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub base_table: PathBuf,
    pub correction_grid: PathBuf,
    /// Root that bounds every write of this call. Created if missing.
    pub out_dir: PathBuf,
    /// Relative to `out_dir`, or absolute inside it.
    pub output_table: PathBuf,
    /// Defaults to `<output_table>.apply.json`.
    pub metadata_path: Option<PathBuf>,
    pub clamp_limit_pct: f64,
    pub applied_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub table: VeTable,
    pub metadata: ApplyMetadata,
    /// Resolved inside `out_dir`.
    pub output_table: PathBuf,
    pub metadata_path: PathBuf,
    pub cells_changed: usize,
    pub max_abs_delta: f64,
    pub dry_run: bool,
    pub transitions: Vec<EngineState>,
}

impl ApplyOutcome {
    pub fn clamped_cells(&self) -> &[ClampedCell] {
        &self.metadata.clamped_cells
    }
}

/// Validated inputs of one apply: parsed tables, their digests, and the
/// resolved write targets.
struct ApplyPlan {
    root: RunRoot,
    output_table: PathBuf,
    metadata_path: PathBuf,
    base: VeTable,
    base_sha: String,
    correction: CorrectionGrid,
    correction_sha: String,
}

/// Multiply a base table by a bounded correction grid into a new table.
pub fn apply(request: &ApplyRequest) -> VecalResult<ApplyOutcome> {
    let mut machine = Machine::start("apply");

    machine.advance(EngineState::Validating);
    let validated = machine.guard(validate_apply(request));
    let plan = validated?;

    machine.advance(EngineState::Computing);
    let computed = machine.guard(
        transform(
            &plan.base.grid,
            &plan.correction.grid,
            request.clamp_limit_pct,
            |ve, factor| ve * factor,
        )
        .and_then(|(grid, changed, delta)| {
            let clamp = clamp_grid(&plan.correction.grid, request.clamp_limit_pct)?;
            Ok((grid, changed, delta, clamp.clamped))
        }),
    );
    let (grid, cells_changed, max_abs_delta, clamped_cells) = computed?;

    let table = VeTable {
        name: plan.output_table.display().to_string(),
        grid,
    };
    let rendered = table.render();
    let applied_at = request
        .applied_at
        .unwrap_or_else(Utc::now)
        .trunc_subsecs(0)
        .to_rfc3339_opts(SecondsFormat::Secs, true);
    let metadata = ApplyMetadata {
        schema_id: APPLY_METADATA_SCHEMA_ID.to_string(),
        base_table_sha256: plan.base_sha,
        correction_grid_sha256: plan.correction_sha,
        clamp_limit_pct: request.clamp_limit_pct,
        applied_at,
        base_table_path: canonical_or_given(&request.base_table),
        correction_grid_path: canonical_or_given(&request.correction_grid),
        output_table_path: plan.output_table.clone(),
        output_table_sha256: sha256_hex(rendered.as_bytes()),
        clamped_cells,
    };

    if !metadata.clamped_cells.is_empty() {
        log::warn!(
            "apply: {} correction cells clamped to ±{}%",
            metadata.clamped_cells.len(),
            request.clamp_limit_pct
        );
    }

    if request.dry_run {
        log::info!(
            "apply (dry run): {cells_changed} cells would change, max |Δ| {max_abs_delta:.4}"
        );
    } else {
        machine.advance(EngineState::Writing);
        let written = write_applied(
            &plan.root,
            &plan.output_table,
            &plan.metadata_path,
            &metadata,
            &rendered,
        );
        machine.guard(written)?;
        log::info!(
            "apply: wrote {} (sha256 {}), metadata {}",
            plan.output_table.display(),
            metadata.output_table_sha256,
            plan.metadata_path.display()
        );
    }
    machine.advance(EngineState::Done);

    Ok(ApplyOutcome {
        table,
        metadata,
        output_table: plan.output_table,
        metadata_path: plan.metadata_path,
        cells_changed,
        max_abs_delta,
        dry_run: request.dry_run,
        transitions: machine.history,
    })
}

/// Metadata first, then the table. A table that cannot be written takes
/// its metadata with it, so no metadata ever describes a missing table
/// and no applied table lacks the record needed to roll it back.
fn write_applied(
    root: &RunRoot,
    output_table: &Path,
    metadata_path: &Path,
    metadata: &ApplyMetadata,
    rendered: &str,
) -> VecalResult<()> {
    metadata.write(root, metadata_path)?;
    if let Err(err) = root.write(output_table, rendered.as_bytes()) {
        if let Err(cleanup) = std::fs::remove_file(metadata_path) {
            log::error!(
                "apply: table write failed and metadata {} could not be removed: {cleanup}",
                metadata_path.display()
            );
        }
        return Err(err);
    }
    Ok(())
}

fn validate_apply(request: &ApplyRequest) -> VecalResult<ApplyPlan> {
    check_apply_clamp_limit(request.clamp_limit_pct, "apply clamp limit")?;
    let root = RunRoot::create(&request.out_dir)?;
    let output_table = root.resolve(&request.output_table)?;
    let metadata_path = match &request.metadata_path {
        Some(path) => root.resolve(path)?,
        None => root.resolve(&metadata_path_for(&output_table))?,
    };
    let inputs = [
        ("base table", request.base_table.as_path()),
        ("correction grid", request.correction_grid.as_path()),
    ];
    refuse_overwrite(&output_table, &inputs)?;
    refuse_overwrite(&metadata_path, &inputs)?;
    if same_path(&metadata_path, &output_table) {
        return Err(VecalError::Config(format!(
            "metadata path {} equals the output table",
            metadata_path.display()
        )));
    }

    let (base_text, base_sha) = read_text(&request.base_table)?;
    let (corr_text, correction_sha) = read_text(&request.correction_grid)?;
    let base = VeTable::parse(&request.base_table.display().to_string(), &base_text)?;
    let correction =
        CorrectionGrid::parse(&request.correction_grid.display().to_string(), &corr_text)?;
    base.grid
        .axes()
        .ensure_same(correction.grid.axes(), "VE table vs correction grid")?;
    Ok(ApplyPlan {
        root,
        output_table,
        metadata_path,
        base,
        base_sha,
        correction,
        correction_sha,
    })
}

// ── Rollback ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RollbackRequest {
    pub current_table: PathBuf,
    pub metadata_path: PathBuf,
    /// Root that bounds the restored table. Created if missing.
    pub out_dir: PathBuf,
    /// Relative to `out_dir`, or absolute inside it.
    pub output_table: PathBuf,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    pub table: VeTable,
    /// Resolved inside `out_dir`.
    pub output_table: PathBuf,
    pub restored_sha256: String,
    /// Restored bytes hash to the base table recorded at apply time.
    pub matches_base: bool,
    pub cells_restored: usize,
    pub dry_run: bool,
    pub transitions: Vec<EngineState>,
}

struct RollbackPlan {
    root: RunRoot,
    output_table: PathBuf,
    metadata: ApplyMetadata,
    current: VeTable,
    correction: CorrectionGrid,
}

/// Reverse a previous apply after verifying both recorded digests.
pub fn rollback(request: &RollbackRequest) -> VecalResult<RollbackOutcome> {
    let mut machine = Machine::start("rollback");

    machine.advance(EngineState::Validating);
    let validated = machine.guard(validate_rollback(request));
    let plan = validated?;

    machine.advance(EngineState::Computing);
    let computed = machine.guard(transform(
        &plan.current.grid,
        &plan.correction.grid,
        plan.metadata.clamp_limit_pct,
        |ve, factor| ve / factor,
    ));
    let (grid, cells_restored, _) = computed?;

    let table = VeTable {
        name: plan.output_table.display().to_string(),
        grid,
    };
    let rendered = table.render();
    let restored_sha256 = sha256_hex(rendered.as_bytes());
    let matches_base = restored_sha256 == plan.metadata.base_table_sha256;

    if request.dry_run {
        log::info!("rollback (dry run): {cells_restored} cells would be restored");
    } else {
        machine.advance(EngineState::Writing);
        machine.guard(plan.root.write(&plan.output_table, rendered.as_bytes()))?;
        log::info!(
            "rollback: wrote {} (sha256 {restored_sha256}, matches base: {matches_base})",
            plan.output_table.display()
        );
    }
    machine.advance(EngineState::Done);

    Ok(RollbackOutcome {
        table,
        output_table: plan.output_table,
        restored_sha256,
        matches_base,
        cells_restored,
        dry_run: request.dry_run,
        transitions: machine.history,
    })
}

fn validate_rollback(request: &RollbackRequest) -> VecalResult<RollbackPlan> {
    let metadata = ApplyMetadata::load(&request.metadata_path)?;

    let corr_text = read_verified(
        &metadata.correction_grid_path,
        &metadata.correction_grid_sha256,
    )?;
    let current_text = read_verified(&request.current_table, &metadata.output_table_sha256)?;

    let root = RunRoot::create(&request.out_dir)?;
    let output_table = root.resolve(&request.output_table)?;
    refuse_overwrite(
        &output_table,
        &[
            ("current table", request.current_table.as_path()),
            ("correction grid", metadata.correction_grid_path.as_path()),
            ("recorded base table", metadata.base_table_path.as_path()),
            ("apply metadata", request.metadata_path.as_path()),
        ],
    )?;

    let current = VeTable::parse(&request.current_table.display().to_string(), &current_text)?;
    let correction = CorrectionGrid::parse(
        &metadata.correction_grid_path.display().to_string(),
        &corr_text,
    )?;
    current
        .grid
        .axes()
        .ensure_same(correction.grid.axes(), "VE table vs correction grid")?;
    Ok(RollbackPlan {
        root,
        output_table,
        metadata,
        current,
        correction,
    })
}
