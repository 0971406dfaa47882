// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Grid Clamp
// ─────────────────────────────────────────────────────────────────────
//! Symmetric percentage clamp over a whole grid, keeping the coordinates
//! of every cell that was bounded. Used both when generating corrections
//! and when applying them; the two call sites pass different limits.

use serde::{Deserialize, Serialize};

use crate::error::{VecalError, VecalResult};
use crate::grid::{CellIndex, ValueGrid};
use crate::numeric::clamp_pct;

/// A cell whose value was bounded by the clamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClampedCell {
    pub row: usize,
    pub col: usize,
    pub rpm: f64,
    pub kpa: f64,
    pub original: f64,
    pub clamped: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClampResult {
    pub grid: ValueGrid,
    pub limit: f64,
    /// Row-major order.
    pub clamped: Vec<ClampedCell>,
}

impl ClampResult {
    pub fn engaged(&self) -> bool {
        !self.clamped.is_empty()
    }

    pub fn is_clamped(&self, idx: CellIndex) -> bool {
        self.clamped
            .iter()
            .any(|c| c.row == idx.row && c.col == idx.col)
    }
}

/// Largest clamp accepted when applying corrections to a VE table.
///
/// Apply rounds to 4 decimals, so the stored table is off by at most
/// 0.5e-4. Rollback divides that error by `1 + f/100`, which is ≥ 0.5 at
/// this bound; the restored cell then lands within one 4-decimal step of
/// the base.
pub const MAX_APPLY_CLAMP_PCT: f64 = 50.0;

/// Validate an apply-time clamp limit: finite and inside (0, 50].
pub fn check_apply_clamp_limit(limit: f64, what: &str) -> VecalResult<()> {
    if !(limit > 0.0 && limit <= MAX_APPLY_CLAMP_PCT) {
        return Err(VecalError::Config(format!(
            "{what} must be in (0, {MAX_APPLY_CLAMP_PCT}], got {limit}"
        )));
    }
    Ok(())
}

/// Validate a clamp limit: finite and strictly inside (0, 100).
pub fn check_clamp_limit(limit: f64, what: &str) -> VecalResult<()> {
    if !limit.is_finite() || limit <= 0.0 || limit >= 100.0 {
        return Err(VecalError::Config(format!(
            "{what} must be in (0, 100), got {limit}"
        )));
    }
    Ok(())
}

/// Clamp every populated cell to `[-limit, limit]`. Absent cells stay absent
/// and unclamped cells are copied bit-for-bit.
pub fn clamp_grid(grid: &ValueGrid, limit: f64) -> VecalResult<ClampResult> {
    check_clamp_limit(limit, "clamp limit")?;
    let axes = grid.axes().clone();
    let mut clamped = Vec::new();
    let out = grid.map(|idx, cell| {
        cell.map(|v| {
            let bounded = clamp_pct(v, limit);
            if bounded != v {
                clamped.push(ClampedCell {
                    row: idx.row,
                    col: idx.col,
                    rpm: axes.rpm[idx.row],
                    kpa: axes.kpa[idx.col],
                    original: v,
                    clamped: bounded,
                });
            }
            bounded
        })
    });
    Ok(ClampResult {
        grid: out,
        limit,
        clamped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::BinAxes;

    fn grid(values: &[Option<f64>]) -> ValueGrid {
        let axes = BinAxes::new(vec![1000.0, 2000.0], vec![20.0, 60.0]).unwrap();
        ValueGrid::from_cells(axes, values.to_vec()).unwrap()
    }

    #[test]
    fn test_clamp_bounds_and_records_cells() {
        let g = grid(&[Some(12.0), Some(-3.3), None, Some(-20.0)]);
        let result = clamp_grid(&g, 7.0).unwrap();
        assert_eq!(result.grid.cells(), &[Some(7.0), Some(-3.3), None, Some(-7.0)]);
        assert_eq!(result.clamped.len(), 2);
        assert_eq!(result.clamped[0].row, 0);
        assert_eq!(result.clamped[0].col, 0);
        assert_eq!(result.clamped[0].original, 12.0);
        assert_eq!(result.clamped[1].kpa, 60.0);
        assert!(result.is_clamped(CellIndex { row: 1, col: 1 }));
        assert!(!result.is_clamped(CellIndex { row: 0, col: 1 }));
    }

    #[test]
    fn test_unclamped_cells_bit_exact() {
        let v = 0.1 + 0.2;
        let g = grid(&[Some(v), None, None, None]);
        let result = clamp_grid(&g, 15.0).unwrap();
        assert_eq!(result.grid.value(CellIndex { row: 0, col: 0 }).unwrap().to_bits(), v.to_bits());
        assert!(!result.engaged());
    }

    #[test]
    fn test_every_output_within_limit() {
        let values: Vec<Option<f64>> = vec![Some(1e6), Some(-1e6), Some(14.999), Some(-15.0)];
        let result = clamp_grid(&grid(&values), 15.0).unwrap();
        assert!(result.grid.cells().iter().flatten().all(|v| v.abs() <= 15.0));
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let g = grid(&[None, None, None, None]);
        assert!(clamp_grid(&g, 0.0).is_err());
        assert!(clamp_grid(&g, 100.0).is_err());
        assert!(clamp_grid(&g, f64::NAN).is_err());
    }

    #[test]
    fn test_apply_clamp_bound() {
        assert!(check_apply_clamp_limit(7.0, "apply").is_ok());
        assert!(check_apply_clamp_limit(MAX_APPLY_CLAMP_PCT, "apply").is_ok());
        for bad in [0.0, -1.0, 50.01, 90.0, f64::NAN, f64::INFINITY] {
            assert!(
                matches!(check_apply_clamp_limit(bad, "apply"), Err(VecalError::Config(_))),
                "{bad} accepted"
            );
        }
        // Generation clamps keep the wider range.
        assert!(check_clamp_limit(90.0, "correction").is_ok());
    }
}
