// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Analyze Pipeline Integration Tests
// ─────────────────────────────────────────────────────────────────────

use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use vecal_artifacts::{sha256_file, verify_manifest, CorrectionGrid, Manifest, StatusCode};
use vecal_core::{run_analysis, AnalyzeOptions, DIAGNOSTICS_FILE};
use vecal_types::{CalibrationConfig, CellIndex, VecalError};

fn synthetic_log(rows: usize) -> String {
    let mut log = String::from(
        "Engine RPM,MAP kPa,Torque,AFR Target,AFR Front,AFR Rear,Knock Retard,IAT,TPS\n",
    );
    for i in 0..rows {
        let f = i as f64;
        let rpm = 1000.0 + (f * 53.0) % 5000.0;
        let kpa = 20.0 + (f * 17.0) % 80.0;
        let torque = 20.0 + (f * 11.0) % 100.0;
        let front = 12.6 + (f * 0.07) % 0.8;
        let rear = 12.8 + (f * 0.05) % 0.6;
        log.push_str(&format!(
            "{rpm:.0},{kpa:.1},{torque:.1},13.0,{front:.2},{rear:.2},0.0,110,50\n"
        ));
    }
    // One row of each failure kind.
    log.push_str("3000,60,80,13.0,25.0,13.0,0.0,110,50\n");
    log.push_str("3000,60,80,13.0,13.0,13.0,0.0,110\n");
    log
}

fn write_log(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

fn options(input: PathBuf, out_dir: PathBuf) -> AnalyzeOptions {
    AnalyzeOptions {
        input,
        out_dir,
        created_at: Some(Utc.with_ymd_and_hms(2026, 5, 2, 14, 30, 0).unwrap()),
        dry_run: false,
    }
}

#[test]
fn test_reruns_are_byte_identical() {
    let dir = TempDir::new().unwrap();
    let input = write_log(dir.path(), "run.csv", &synthetic_log(600));
    let config = CalibrationConfig::default();

    let a = run_analysis(&options(input.clone(), dir.path().join("out-a")), &config).unwrap();
    let b = run_analysis(&options(input, dir.path().join("out-b")), &config).unwrap();

    assert_eq!(a.run_id, b.run_id);
    assert_eq!(a.outputs.len(), 5);
    let hashes = |s: &vecal_core::RunSummary| -> Vec<String> {
        s.outputs.iter().map(|o| o.sha256.clone()).collect()
    };
    assert_eq!(hashes(&a), hashes(&b));

    let manifest_a = std::fs::read(a.manifest.as_ref().unwrap()).unwrap();
    let manifest_b = std::fs::read(b.manifest.as_ref().unwrap()).unwrap();
    let ma: Manifest = serde_json::from_slice(&manifest_a).unwrap();
    let mb: Manifest = serde_json::from_slice(&manifest_b).unwrap();
    assert_eq!(ma.outputs, mb.outputs);
    assert_eq!(ma.created_at, "2026-05-02T14:30:00Z");
}

#[test]
fn test_run_directory_layout_and_manifest() {
    let dir = TempDir::new().unwrap();
    let input = write_log(dir.path(), "run.csv", &synthetic_log(400));
    let summary =
        run_analysis(&options(input.clone(), dir.path().join("out")), &CalibrationConfig::default())
            .unwrap();

    let run_dir = summary.run_dir.clone().unwrap();
    assert!(run_dir.ends_with(&summary.run_id));
    assert!(summary.run_id.starts_with("20260502T143000Z-"));
    for name in [
        "ve_correction.csv",
        "ve_correction_front.csv",
        "ve_correction_rear.csv",
        "coverage.csv",
        DIAGNOSTICS_FILE,
        "manifest.json",
    ] {
        assert!(run_dir.join(name).is_file(), "missing {name}");
    }

    let manifest = Manifest::load(&run_dir.join("manifest.json")).unwrap();
    assert_eq!(manifest.status.code, StatusCode::Partial);
    assert_eq!(manifest.stats.rows_read, 402);
    assert_eq!(manifest.stats.bins_total, 55);
    assert!(manifest.stats.bins_populated > 0);
    assert_eq!(manifest.inputs[0].sha256, sha256_file(&input).unwrap());
    assert_eq!(manifest.inputs[0].rows, Some(402));
    assert_eq!(manifest.inputs[0].cols, Some(9));
    let coverage = manifest.outputs.iter().find(|o| o.name == "coverage").unwrap();
    assert_eq!((coverage.rows, coverage.cols), (Some(11), Some(6)));

    let report = verify_manifest(&run_dir.join("manifest.json")).unwrap();
    assert!(report.is_clean(), "{:?}", report.issues);

    let text = std::fs::read_to_string(run_dir.join("ve_correction.csv")).unwrap();
    let grid = CorrectionGrid::parse("ve_correction.csv", &text).unwrap();
    assert!(grid.grid.cells().iter().flatten().all(|v| v.abs() <= 15.0));

    let diagnostics: serde_json::Value =
        serde_json::from_slice(&std::fs::read(run_dir.join(DIAGNOSTICS_FILE)).unwrap()).unwrap();
    assert_eq!(diagnostics["ingest"]["dialect"], "dyno-suite");
    assert_eq!(diagnostics["ingest"]["rejections"]["counts"]["afr_out_of_range"], 1);
    assert_eq!(diagnostics["ingest"]["rejections"]["counts"]["malformed"], 1);
}

#[test]
fn test_rerun_with_same_id_refused() {
    let dir = TempDir::new().unwrap();
    let input = write_log(dir.path(), "run.csv", &synthetic_log(50));
    let opts = options(input, dir.path().join("out"));
    let config = CalibrationConfig::default();
    run_analysis(&opts, &config).unwrap();
    let err = run_analysis(&opts, &config).unwrap_err();
    assert!(matches!(err, VecalError::Io { .. }));
}

#[test]
fn test_light_load_leaves_every_cell_absent() {
    let mut log = String::from("rpm,map,torque,afr,afr_target\n");
    for i in 0..100 {
        log.push_str(&format!("{},{},4.9,12.5,13.0\n", 1000 + i * 40, 20 + i % 80));
    }
    let dir = TempDir::new().unwrap();
    let input = write_log(dir.path(), "idle.csv", &log);
    let summary =
        run_analysis(&options(input, dir.path().join("out")), &CalibrationConfig::default())
            .unwrap();
    assert_eq!(summary.bins_populated, 0);
    assert_eq!(summary.status, StatusCode::Partial);

    let run_dir = summary.run_dir.unwrap();
    let text = std::fs::read_to_string(run_dir.join("ve_correction.csv")).unwrap();
    let grid = CorrectionGrid::parse("c", &text).unwrap();
    assert!(grid.grid.cells().iter().all(Option::is_none));
    assert_eq!(grid.grid.value(CellIndex { row: 0, col: 0 }), None);
}

#[test]
fn test_missing_columns_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let input = write_log(dir.path(), "bad.csv", "time,speed,load\n1,2,3\n");
    let out = dir.path().join("out");
    let err = run_analysis(&options(input, out.clone()), &CalibrationConfig::default())
        .unwrap_err();
    assert!(matches!(err, VecalError::MissingColumns { .. }));
    assert!(!out.exists());
}

#[test]
fn test_dry_run_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let input = write_log(dir.path(), "run.csv", &synthetic_log(100));
    let out = dir.path().join("out");
    let mut opts = options(input, out.clone());
    opts.dry_run = true;
    let summary = run_analysis(&opts, &CalibrationConfig::default()).unwrap();
    assert!(summary.dry_run);
    assert!(summary.run_dir.is_none());
    assert!(summary.records_accepted > 0);
    assert!(!out.exists());
}

#[test]
fn test_missing_input_is_io_error() {
    let dir = TempDir::new().unwrap();
    let err = run_analysis(
        &options(dir.path().join("nope.csv"), dir.path().join("out")),
        &CalibrationConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, VecalError::Io { .. }));
}
