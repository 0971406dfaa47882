// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Types
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Type definitions, configuration, and error hierarchy for the
//! VE calibration kernel: sensor records, RPM × kPa grids, and the
//! numeric primitives shared by analysis and apply/rollback.

pub mod clamp;
pub mod config;
pub mod error;
pub mod grid;
pub mod numeric;
pub mod record;

pub use clamp::{
    check_apply_clamp_limit, check_clamp_limit, clamp_grid, ClampResult, ClampedCell,
    MAX_APPLY_CLAMP_PCT,
};
pub use config::{
    AnomalyConfig, CalibrationConfig, PhysicalLimits, QualityConfig, Range, SmootherConfig,
};
pub use error::{IntegrityFailure, VecalError, VecalResult};
pub use grid::{BinAxes, CellIndex, CoverageGrid, Grid, ValueGrid};
pub use numeric::{clamp_pct, median, pct_factor, round_places};
pub use record::{
    AfrPair, Bank, LoadProxy, RejectReason, RejectionTally, SensorRecord, BANK_COUNT,
    HP_TORQUE_CONSTANT,
};
