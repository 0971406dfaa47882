// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Core Analysis Engine
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Dyno log → bounded VE corrections.
//!
//! - `dialect` / `ingest`: vendor log detection, decoding and validation
//! - `aggregate`: order-independent weighted binning
//! - `smoother`: four-stage deterministic kernel smoother
//! - `anomaly` / `quality`: advisory diagnostics
//! - `pipeline`: the analyze run with artifacts and manifest

pub mod aggregate;
pub mod anomaly;
pub mod dialect;
pub mod ingest;
pub mod pipeline;
pub mod quality;
pub mod smoother;

pub use aggregate::{aggregate, Aggregation, AggregationStats, BankAggregate};
pub use anomaly::{detect_anomalies, Anomaly, Severity};
pub use dialect::{
    dialects, normalize_header, select_dialect, ColumnMap, DynoSuite, EcuLogger, GenericLog,
    LoadKind, LogDialect, Role,
};
pub use ingest::{
    decode_text, ingest_bytes, ingest_path, IngestOutput, IngestReport, TextEncoding,
};
pub use pipeline::{
    bank_correction_file, combine_banks, run_analysis, AnalyzeOptions, Analysis, Analyzer,
    BankAnalysis, Diagnostics, RunSummary, CORRECTION_FILE, COVERAGE_FILE, DIAGNOSTICS_FILE,
};
pub use quality::{assess_quality, BankClamps, Confidence, HotCell, QualityGrade, QualityReport};
pub use smoother::{KernelSmoother, SmoothingTrace};
