// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Apply / Rollback
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Hash-gated VE table mutation: apply a bounded correction grid to a
//! base table, and reverse it only while the recorded digests still match.

pub mod engine;
pub mod metadata;

pub use engine::{
    apply, check_integrity, rollback, ApplyOutcome, ApplyRequest, EngineState, IntegrityCheck,
    RollbackOutcome, RollbackRequest,
};
pub use metadata::{metadata_path_for, ApplyMetadata, APPLY_METADATA_SCHEMA_ID};
