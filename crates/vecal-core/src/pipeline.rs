// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Analyze Pipeline
// ─────────────────────────────────────────────────────────────────────
//! ingest → aggregate → smooth → clamp → diagnostics → artifacts.
//!
//! [`Analyzer`] is the pure part: records in, grids and reports out.
//! [`run_analysis`] adds file I/O: it hashes the input, writes every
//! artifact atomically under `<out_dir>/<run_id>/`, and records the run
//! in `manifest.json` last. Data artifacts carry no timestamps or paths,
//! so identical inputs and configuration give byte-identical files.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use vecal_artifacts::{
    format_timestamp, read_hashed, render_coverage_grid, render_value_grid, run_id,
    ArtifactEntry, CellFormat, ManifestBuilder, RunRoot, RunStats, RunStatus, StatusCode,
    MANIFEST_FILE,
};
use vecal_types::{
    clamp_grid, Bank, CalibrationConfig, ClampResult, SensorRecord, ValueGrid, VecalError,
    VecalResult,
};

use crate::aggregate::{aggregate, Aggregation, AggregationStats};
use crate::anomaly::{detect_anomalies, Anomaly};
use crate::ingest::{ingest_bytes, IngestReport};
use crate::quality::{assess_quality, BankClamps, QualityReport};
use crate::smoother::{KernelSmoother, SmoothingTrace};

pub const CORRECTION_FILE: &str = "ve_correction.csv";
pub const COVERAGE_FILE: &str = "coverage.csv";
pub const DIAGNOSTICS_FILE: &str = "diagnostics.json";
pub const DIAGNOSTICS_SCHEMA_ID: &str = "vecal-diagnostics/1";

pub fn bank_correction_file(bank: Bank) -> String {
    format!("ve_correction_{bank}.csv")
}

/// Smoothed, clamped and diagnosed corrections for one bank.
#[derive(Debug, Clone)]
pub struct BankAnalysis {
    pub bank: Bank,
    pub trace: SmoothingTrace,
    pub clamp: ClampResult,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub aggregation: Aggregation,
    pub banks: Vec<BankAnalysis>,
    /// Mean of the banks' clamped corrections where any bank has a value.
    pub combined: ValueGrid,
    pub quality: QualityReport,
}

impl Analysis {
    pub fn clamped_count(&self) -> usize {
        self.banks.iter().map(|b| b.clamp.clamped.len()).sum()
    }

    pub fn anomaly_count(&self) -> usize {
        self.banks.iter().map(|b| b.anomalies.len()).sum()
    }
}

/// Mean of the populated cells across `grids`, cell by cell.
pub fn combine_banks(grids: &[&ValueGrid]) -> VecalResult<Option<ValueGrid>> {
    let Some((first, rest)) = grids.split_first() else {
        return Ok(None);
    };
    for g in rest {
        first.axes().ensure_same(g.axes(), "bank combination")?;
    }
    let combined = first.map(|idx, _| {
        let values: Vec<f64> = grids.iter().filter_map(|g| g.value(idx)).collect();
        (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
    });
    Ok(Some(combined))
}

/// Pure analysis stage. Holds the validated configuration.
#[derive(Debug, Clone)]
pub struct Analyzer {
    config: CalibrationConfig,
    smoother: KernelSmoother,
}

impl Analyzer {
    pub fn new(config: CalibrationConfig) -> VecalResult<Self> {
        config.validate()?;
        let smoother = KernelSmoother::from_config(&config);
        Ok(Self { config, smoother })
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn analyze(&self, records: &[SensorRecord], banks: &[Bank]) -> VecalResult<Analysis> {
        let axes = self.config.axes()?;
        let aggregation = aggregate(records, &axes, banks, self.config.min_weight)?;

        let mut results = Vec::with_capacity(aggregation.banks.len());
        for agg in &aggregation.banks {
            let trace = self.smoother.smooth(&agg.error, &agg.coverage)?;
            let clamp = clamp_grid(&trace.output, self.config.correction_clamp_pct)?;
            if clamp.engaged() {
                log::warn!(
                    "bank {}: {} cells clamped to ±{}%",
                    agg.bank,
                    clamp.clamped.len(),
                    clamp.limit
                );
            }
            let anomalies = detect_anomalies(&trace.output, &self.config.anomaly);
            results.push(BankAnalysis {
                bank: agg.bank,
                trace,
                clamp,
                anomalies,
            });
        }

        let clamped_grids: Vec<&ValueGrid> = results.iter().map(|b| &b.clamp.grid).collect();
        let combined =
            combine_banks(&clamped_grids)?.unwrap_or_else(|| ValueGrid::empty(axes.clone()));

        let clamps = results
            .iter()
            .map(|b| BankClamps {
                bank: b.bank,
                limit: b.clamp.limit,
                cells: b.clamp.clamped.clone(),
            })
            .collect();
        let quality = assess_quality(
            &aggregation.samples,
            &aggregation.max_knock,
            &aggregation.max_iat,
            clamps,
            &self.config.quality,
        );

        Ok(Analysis {
            aggregation,
            banks: results,
            combined,
            quality,
        })
    }
}

// ── Diagnostics document ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankDiagnostics {
    pub bank: Bank,
    pub cells_populated: usize,
    pub max_abs_error_pct: f64,
    pub max_abs_correction_pct: f64,
    /// Cells that skipped adaptive smoothing entirely.
    pub held_verbatim: usize,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub schema_id: String,
    pub input_sha256: String,
    pub ingest: IngestReport,
    pub aggregation: AggregationStats,
    pub correction_clamp_pct: f64,
    pub banks: Vec<BankDiagnostics>,
    pub quality: QualityReport,
}

impl Diagnostics {
    pub fn build(
        input_sha256: &str,
        ingest: &IngestReport,
        analysis: &Analysis,
        config: &CalibrationConfig,
    ) -> Self {
        let banks = analysis
            .banks
            .iter()
            .map(|b| BankDiagnostics {
                bank: b.bank,
                cells_populated: b.trace.raw.populated(),
                max_abs_error_pct: b.trace.raw.max_abs(),
                max_abs_correction_pct: b.clamp.grid.max_abs(),
                held_verbatim: b
                    .trace
                    .pass_counts
                    .iter()
                    .filter(|(idx, c)| **c == 0 && b.trace.raw.value(*idx).is_some())
                    .count(),
                anomalies: b.anomalies.clone(),
            })
            .collect();
        Self {
            schema_id: DIAGNOSTICS_SCHEMA_ID.to_string(),
            input_sha256: input_sha256.to_string(),
            ingest: ingest.clone(),
            aggregation: analysis.aggregation.stats.clone(),
            correction_clamp_pct: config.correction_clamp_pct,
            banks,
            quality: analysis.quality.clone(),
        }
    }
}

// ── Run orchestration ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub input: PathBuf,
    pub out_dir: PathBuf,
    /// Fixes the run timestamp so a rerun reproduces the same run id.
    pub created_at: Option<DateTime<Utc>>,
    /// Compute everything, write nothing.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub created_at: String,
    pub dry_run: bool,
    pub run_dir: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
    pub status: StatusCode,
    pub message: String,
    pub dialect: String,
    pub rows_read: usize,
    pub records_accepted: usize,
    pub bins_total: usize,
    pub bins_populated: usize,
    pub clamped_cells: usize,
    pub anomalies: usize,
    pub outputs: Vec<ArtifactEntry>,
}

fn run_status(ingest: &IngestReport, stats: &AggregationStats) -> (StatusCode, String) {
    let rejected = ingest.rejections.total();
    if stats.bins_populated == 0 {
        return (
            StatusCode::Partial,
            format!(
                "no bins populated ({} rows rejected, {} below weight threshold)",
                rejected, stats.below_min_weight
            ),
        );
    }
    if rejected > 0 {
        return (
            StatusCode::Partial,
            format!("{rejected} of {} rows rejected", ingest.rows_read),
        );
    }
    (StatusCode::Success, "analysis complete".to_string())
}

fn write_outputs(
    root: &RunRoot,
    builder: &mut ManifestBuilder,
    analysis: &Analysis,
    diagnostics: &Diagnostics,
) -> VecalResult<()> {
    let combined = render_value_grid(&analysis.combined, CellFormat::SignedPct);
    let path = root.write(Path::new(CORRECTION_FILE), combined.as_bytes())?;
    builder.add_output(root, "ve_correction", &path)?;

    for bank in &analysis.banks {
        let name = bank_correction_file(bank.bank);
        let text = render_value_grid(&bank.clamp.grid, CellFormat::SignedPct);
        let path = root.write(Path::new(&name), text.as_bytes())?;
        builder.add_output(root, &format!("ve_correction_{}", bank.bank), &path)?;
    }

    let coverage = render_coverage_grid(&analysis.aggregation.samples);
    let path = root.write(Path::new(COVERAGE_FILE), coverage.as_bytes())?;
    builder.add_output(root, "coverage", &path)?;

    let mut json = serde_json::to_vec_pretty(diagnostics)
        .map_err(|e| VecalError::Serialization(e.to_string()))?;
    json.push(b'\n');
    let path = root.write(Path::new(DIAGNOSTICS_FILE), &json)?;
    builder.add_output(root, "diagnostics", &path)?;
    Ok(())
}

/// Full analyze run: read, compute, write artifacts, then the manifest.
pub fn run_analysis(
    options: &AnalyzeOptions,
    config: &CalibrationConfig,
) -> VecalResult<RunSummary> {
    let analyzer = Analyzer::new(config.clone())?;
    let (bytes, input_sha256) = read_hashed(&options.input)?;
    let source = options.input.display().to_string();
    let ingest = ingest_bytes(&bytes, &source, config)?;
    let analysis = analyzer.analyze(&ingest.records, &ingest.report.banks)?;
    let diagnostics = Diagnostics::build(&input_sha256, &ingest.report, &analysis, config);

    let created_at = options.created_at.unwrap_or_else(Utc::now).trunc_subsecs(0);
    let created_text = format_timestamp(created_at);
    let config_json = config.to_canonical_json()?;
    let id = run_id(created_at, &[&input_sha256, &config_json, &created_text]);
    let stats = &analysis.aggregation.stats;
    let (status, message) = run_status(&ingest.report, stats);

    let mut summary = RunSummary {
        run_id: id.clone(),
        created_at: created_text,
        dry_run: options.dry_run,
        run_dir: None,
        manifest: None,
        status,
        message: message.clone(),
        dialect: ingest.report.dialect.clone(),
        rows_read: ingest.report.rows_read,
        records_accepted: ingest.report.records_accepted,
        bins_total: stats.bins_total,
        bins_populated: stats.bins_populated,
        clamped_cells: analysis.clamped_count(),
        anomalies: analysis.anomaly_count(),
        outputs: Vec::new(),
    };
    if options.dry_run {
        log::info!("run {id}: dry run, nothing written");
        return Ok(summary);
    }

    let out_root = RunRoot::create(&options.out_dir)?;
    let existing = out_root.resolve(&Path::new(&id).join(MANIFEST_FILE))?;
    if existing.exists() {
        return Err(VecalError::io(
            existing,
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "run already recorded"),
        ));
    }
    let run_root = out_root.child(&id)?;

    let mut builder = ManifestBuilder::new(&id, created_at);
    let input_path = options
        .input
        .canonicalize()
        .unwrap_or_else(|_| options.input.clone());
    builder.add_input("sensor_log", &input_path, &bytes, &input_sha256);
    builder.set_stats(RunStats {
        rows_read: ingest.report.rows_read,
        bins_total: stats.bins_total,
        bins_populated: stats.bins_populated,
    });

    if let Err(err) = write_outputs(&run_root, &mut builder, &analysis, &diagnostics) {
        log::error!("run {id}: writing artifacts failed: {err}");
        let manifest = builder.finish(RunStatus {
            code: StatusCode::Error,
            message: err.to_string(),
            stage: "write".to_string(),
        });
        if let Err(manifest_err) = manifest.write(&run_root) {
            log::error!("run {id}: error manifest not written: {manifest_err}");
        }
        return Err(err);
    }

    let manifest = builder.finish(RunStatus {
        code: status,
        message,
        stage: "complete".to_string(),
    });
    let manifest_path = manifest.write(&run_root)?;
    summary.outputs = manifest.outputs.clone();
    summary.run_dir = Some(run_root.path().to_path_buf());
    summary.manifest = Some(manifest_path);
    log::info!("run {id}: {:?} ({})", summary.status, summary.message);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vecal_types::{AfrPair, BinAxes, CellIndex, LoadProxy};

    fn record(rpm: f64, kpa: f64, front: (f64, f64), rear: Option<(f64, f64)>) -> SensorRecord {
        let pair = |(commanded, measured): (f64, f64)| AfrPair {
            commanded,
            measured,
        };
        SensorRecord {
            rpm,
            map_kpa: kpa,
            load: LoadProxy::TorqueFtLb(80.0),
            afr: [Some(pair(front)), rear.map(pair)],
            knock_retard_deg: None,
            iat_f: None,
            tps_pct: None,
        }
    }

    #[test]
    fn test_combine_banks_means_available_values() {
        let axes = BinAxes::new(vec![1000.0], vec![20.0, 40.0, 60.0]).unwrap();
        let a = ValueGrid::from_cells(axes.clone(), vec![Some(2.0), Some(1.0), None]).unwrap();
        let b = ValueGrid::from_cells(axes, vec![Some(4.0), None, None]).unwrap();
        let c = combine_banks(&[&a, &b]).unwrap().unwrap();
        assert_eq!(c.cells(), &[Some(3.0), Some(1.0), None]);
        assert!(combine_banks(&[]).unwrap().is_none());
    }

    #[test]
    fn test_correction_clamp_uses_generation_limit() {
        // 13.0 commanded vs 10.0 measured is +30%, well past ±15%.
        let records: Vec<SensorRecord> = (0..10)
            .map(|_| record(3000.0, 60.0, (13.0, 10.0), None))
            .collect();
        let analyzer = Analyzer::new(CalibrationConfig::default()).unwrap();
        let analysis = analyzer.analyze(&records, &[Bank::Front]).unwrap();
        let idx = CellIndex { row: 4, col: 2 };
        assert_eq!(analysis.banks[0].clamp.grid.value(idx), Some(15.0));
        assert_eq!(analysis.clamped_count(), 1);
        assert_eq!(analysis.combined.value(idx), Some(15.0));
        assert_eq!(analysis.quality.clamped[0].cells[0].row, 4);
    }

    #[test]
    fn test_two_banks_produce_two_grids() {
        let records: Vec<SensorRecord> = (0..6)
            .map(|_| record(2000.0, 40.0, (13.0, 12.87), Some((13.0, 13.13))))
            .collect();
        let analyzer = Analyzer::new(CalibrationConfig::default()).unwrap();
        let analysis = analyzer.analyze(&records, &[Bank::Front, Bank::Rear]).unwrap();
        assert_eq!(analysis.banks.len(), 2);
        let idx = CellIndex { row: 2, col: 1 };
        let front = analysis.banks[0].clamp.grid.value(idx).unwrap();
        let rear = analysis.banks[1].clamp.grid.value(idx).unwrap();
        assert!(front > 0.0 && rear < 0.0);
        let combined = analysis.combined.value(idx).unwrap();
        assert!((combined - (front + rear) / 2.0).abs() < 1e-12);
    }
}
