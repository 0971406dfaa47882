// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Artifacts
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Everything that touches the filesystem on behalf of the kernel:
//! SHA-256 content hashing, atomic temp-then-rename writes, the run-root
//! path guard, RPM × kPa table formats, and run manifests.

pub mod atomic;
pub mod delimited;
pub mod hashing;
pub mod manifest;
pub mod run_root;
pub mod table;

pub use atomic::{write_atomic, write_atomic_new};
pub use delimited::{detect_delimiter, split_fields};
pub use hashing::{read_hashed, sha256_file, sha256_hex, sha256_reader};
pub use manifest::{
    format_timestamp, parse_timestamp, run_id, verify_manifest, ArtifactEntry, Manifest,
    ManifestBuilder, ManifestIssue, ManifestReport, RunStats, RunStatus, StatusCode,
    MANIFEST_FILE, MANIFEST_SCHEMA_ID,
};
pub use run_root::RunRoot;
pub use table::{
    escape_cell, parse_value_grid, render_coverage_grid, render_value_grid, CellFormat,
    CorrectionGrid, VeTable, HEADER_LABEL,
};
