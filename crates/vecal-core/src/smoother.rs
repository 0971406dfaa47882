// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Four-Stage Kernel Smoother
// ─────────────────────────────────────────────────────────────────────
//! Noise reduction for a raw AFR-error grid that keeps large corrections
//! and sharp regime boundaries intact.
//!
//! 1. **Gradient**: max |Δ| to valid up/down/left/right neighbours.
//! 2. **Adaptive passes**: |v| ≥ taper end gets none, |v| ≤ taper start
//!    gets the full count, linear taper between. A pass replaces a cell
//!    with the mean of itself and its valid 4-neighbours.
//! 3. **Gradient-limited blend**: above the gradient threshold, blend back
//!    toward the raw value by `min(1, g / 2·threshold)`.
//! 4. **Coverage-weighted pass**: inverse-distance, coverage-weighted
//!    8-neighbour mean, mixed in with strength α.
//!
//! Every stage is a pure function. Absent cells stay absent.

use vecal_types::{
    CalibrationConfig, CoverageGrid, Grid, SmootherConfig, ValueGrid, VecalError, VecalResult,
};

/// Intermediate grids of one smoothing run.
#[derive(Debug, Clone, PartialEq)]
pub struct SmoothingTrace {
    pub raw: ValueGrid,
    pub gradients: ValueGrid,
    pub pass_counts: Grid<u32>,
    pub blend_factors: ValueGrid,
    pub adaptive: ValueGrid,
    pub blended: ValueGrid,
    pub output: ValueGrid,
}

// ── Stage 1 ─────────────────────────────────────────────────────────

/// Absent neighbours are skipped. A populated cell with no populated
/// neighbour has gradient 0.
pub fn gradient_grid(raw: &ValueGrid) -> ValueGrid {
    raw.map(|idx, cell| {
        cell.map(|v| {
            raw.valid_orthogonal_values(idx)
                .into_iter()
                .fold(0.0_f64, |acc, n| acc.max((v - n).abs()))
        })
    })
}

// ── Stage 2 ─────────────────────────────────────────────────────────

pub fn pass_count(value: f64, config: &SmootherConfig) -> u32 {
    let magnitude = value.abs();
    if magnitude >= config.taper_end_pct {
        0
    } else if magnitude <= config.taper_start_pct {
        config.passes
    } else {
        let span = config.taper_end_pct - config.taper_start_pct;
        let fraction = (config.taper_end_pct - magnitude) / span;
        (config.passes as f64 * fraction).round() as u32
    }
}

pub fn pass_count_grid(raw: &ValueGrid, config: &SmootherConfig) -> Grid<u32> {
    raw.map(|_, cell| cell.map_or(0, |v| pass_count(v, config)))
}

/// Jacobi passes: each pass reads the previous pass's grid. A cell takes
/// part in pass `p` only while its own count is above `p`.
pub fn adaptive_passes(raw: &ValueGrid, counts: &Grid<u32>) -> VecalResult<ValueGrid> {
    raw.axes().ensure_same(counts.axes(), "adaptive smoothing pass counts")?;
    let max_passes = counts.cells().iter().copied().max().unwrap_or(0);
    let mut current = raw.clone();
    for pass in 0..max_passes {
        let previous = current.clone();
        for idx in previous.indices() {
            let Some(v) = previous.value(idx) else {
                continue;
            };
            if *counts.get(idx) <= pass {
                continue;
            }
            let neighbours = previous.valid_orthogonal_values(idx);
            let sum = v + neighbours.iter().sum::<f64>();
            current.set(idx, Some(sum / (neighbours.len() + 1) as f64));
        }
    }
    Ok(current)
}

// ── Stage 3 ─────────────────────────────────────────────────────────

pub fn blend_factor(gradient: f64, threshold: f64) -> f64 {
    if gradient > threshold {
        (gradient / (2.0 * threshold)).min(1.0)
    } else {
        0.0
    }
}

pub fn gradient_blend(
    raw: &ValueGrid,
    smoothed: &ValueGrid,
    gradients: &ValueGrid,
    threshold: f64,
) -> VecalResult<(ValueGrid, ValueGrid)> {
    raw.axes().ensure_same(smoothed.axes(), "gradient blend")?;
    raw.axes().ensure_same(gradients.axes(), "gradient blend")?;
    let factors = gradients.map(|_, g| g.map(|g| blend_factor(g, threshold)));
    let blended = raw.map(|idx, cell| {
        let (original, smooth) = ((*cell)?, smoothed.value(idx)?);
        let blend = factors.value(idx).unwrap_or(0.0);
        if blend == 0.0 {
            Some(smooth)
        } else {
            Some((1.0 - blend) * smooth + blend * original)
        }
    });
    Ok((blended, factors))
}

// ── Stage 4 ─────────────────────────────────────────────────────────

/// Neighbour weight is `coverage / distance^p`; the centre enters with
/// `center_bias × coverage`. Cells under `min_hits` pass through and
/// neighbours under `min_hits` carry no weight.
pub fn coverage_weighted(
    grid: &ValueGrid,
    coverage: &CoverageGrid,
    config: &SmootherConfig,
) -> VecalResult<ValueGrid> {
    grid.axes().ensure_same(coverage.axes(), "coverage-weighted smoothing")?;
    let out = grid.map(|idx, cell| {
        let center = (*cell)?;
        let hits = *coverage.get(idx);
        if hits < config.min_hits {
            return Some(center);
        }
        let center_weight = config.center_bias * hits as f64;
        let mut weight_sum = center_weight;
        let mut value_sum = center_weight * center;
        for (n, dist) in grid.moore_neighbors(idx) {
            let (Some(v), n_hits) = (grid.value(n), *coverage.get(n)) else {
                continue;
            };
            if n_hits < config.min_hits {
                continue;
            }
            let w = n_hits as f64 / dist.powf(config.distance_power);
            weight_sum += w;
            value_sum += w * v;
        }
        if weight_sum <= 0.0 {
            return Some(center);
        }
        let neighbourhood = value_sum / weight_sum;
        Some(config.coverage_alpha * neighbourhood + (1.0 - config.coverage_alpha) * center)
    });
    Ok(out)
}

// ── Full pipeline ───────────────────────────────────────────────────

/// Deterministic four-stage smoother.
#[derive(Debug, Clone)]
pub struct KernelSmoother {
    config: SmootherConfig,
}

impl KernelSmoother {
    pub fn new(config: SmootherConfig) -> Self {
        Self { config }
    }

    pub fn from_config(config: &CalibrationConfig) -> Self {
        Self::new(config.smoothing.clone())
    }

    pub fn config(&self) -> &SmootherConfig {
        &self.config
    }

    pub fn smooth(&self, raw: &ValueGrid, coverage: &CoverageGrid) -> VecalResult<SmoothingTrace> {
        raw.axes().ensure_same(coverage.axes(), "smoother input")?;
        if raw.cells().iter().flatten().any(|v| !v.is_finite()) {
            return Err(VecalError::Numerical(
                "non-finite value in error grid".to_string(),
            ));
        }

        let gradients = gradient_grid(raw);
        let pass_counts = pass_count_grid(raw, &self.config);
        let adaptive = adaptive_passes(raw, &pass_counts)?;
        let (blended, blend_factors) = gradient_blend(
            raw,
            &adaptive,
            &gradients,
            self.config.gradient_threshold_pct,
        )?;
        let output = coverage_weighted(&blended, coverage, &self.config)?;

        let preserved = pass_counts
            .iter()
            .filter(|(idx, c)| **c == 0 && raw.value(*idx).is_some())
            .count();
        log::debug!(
            "smoothing: {} cells, {preserved} held verbatim in stage 2",
            raw.populated()
        );

        Ok(SmoothingTrace {
            raw: raw.clone(),
            gradients,
            pass_counts,
            blend_factors,
            adaptive,
            blended,
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vecal_types::{BinAxes, CellIndex};

    fn axes(n: usize) -> BinAxes {
        let rpm = (0..n).map(|i| 1000.0 + 500.0 * i as f64).collect();
        let kpa = (0..n).map(|i| 20.0 + 20.0 * i as f64).collect();
        BinAxes::new(rpm, kpa).unwrap()
    }

    fn spike_grid() -> ValueGrid {
        let mut g = ValueGrid::filled(axes(5), Some(0.0));
        g.set(CellIndex { row: 2, col: 2 }, Some(4.0));
        g
    }

    const CENTER: CellIndex = CellIndex { row: 2, col: 2 };

    #[test]
    fn test_gradient_skips_absent() {
        let mut g = ValueGrid::empty(axes(3));
        g.set(CellIndex { row: 1, col: 1 }, Some(2.0));
        g.set(CellIndex { row: 0, col: 1 }, Some(-1.0));
        let grads = gradient_grid(&g);
        assert_eq!(grads.value(CellIndex { row: 1, col: 1 }), Some(3.0));
        assert_eq!(grads.value(CellIndex { row: 0, col: 0 }), None);
        g.set(CellIndex { row: 0, col: 1 }, None);
        assert_eq!(gradient_grid(&g).value(CellIndex { row: 1, col: 1 }), Some(0.0));
    }

    #[test]
    fn test_pass_count_taper() {
        let cfg = SmootherConfig::default();
        assert_eq!(pass_count(0.5, &cfg), 2);
        assert_eq!(pass_count(-1.0, &cfg), 2);
        assert_eq!(pass_count(2.0, &cfg), 1);
        assert_eq!(pass_count(2.9, &cfg), 0);
        assert_eq!(pass_count(3.0, &cfg), 0);
        assert_eq!(pass_count(-4.0, &cfg), 0);
    }

    #[test]
    fn test_single_pass_mean_of_valid_neighbours() {
        let mut g = ValueGrid::empty(axes(3));
        g.set(CellIndex { row: 1, col: 1 }, Some(0.9));
        g.set(CellIndex { row: 1, col: 0 }, Some(0.3));
        let counts = Grid::filled(axes(3), 1);
        let out = adaptive_passes(&g, &counts).unwrap();
        let v = out.value(CellIndex { row: 1, col: 1 }).unwrap();
        assert!((v - 0.6).abs() < 1e-12);
        assert_eq!(out.value(CellIndex { row: 0, col: 0 }), None);
    }

    #[test]
    fn test_isolated_spike_preserved() {
        let raw = spike_grid();
        let coverage = CoverageGrid::filled(axes(5), 10);
        let trace = KernelSmoother::new(SmootherConfig::default())
            .smooth(&raw, &coverage)
            .unwrap();
        assert_eq!(*trace.pass_counts.get(CENTER), 0);
        assert_eq!(trace.adaptive.value(CENTER), Some(4.0));
        assert_eq!(trace.blend_factors.value(CENTER), Some(1.0));
        assert_eq!(trace.blended.value(CENTER), Some(4.0));
        let out = trace.output.value(CENTER).unwrap();
        assert!(out > 3.0, "spike averaged down to {out}");
        assert!(out <= 4.0);
    }

    #[test]
    fn test_absent_cells_never_filled() {
        let mut raw = spike_grid();
        raw.set(CellIndex { row: 0, col: 0 }, None);
        let coverage = CoverageGrid::filled(axes(5), 3);
        let trace = KernelSmoother::new(SmootherConfig::default())
            .smooth(&raw, &coverage)
            .unwrap();
        assert_eq!(trace.output.value(CellIndex { row: 0, col: 0 }), None);
        assert_eq!(trace.output.populated(), raw.populated());
    }

    #[test]
    fn test_low_coverage_passes_through_stage_four() {
        let mut g = ValueGrid::filled(axes(3), Some(1.0));
        g.set(CellIndex { row: 1, col: 1 }, Some(2.0));
        let mut coverage = CoverageGrid::filled(axes(3), 5);
        coverage.set(CellIndex { row: 1, col: 1 }, 0);
        let out = coverage_weighted(&g, &coverage, &SmootherConfig::default()).unwrap();
        assert_eq!(out.value(CellIndex { row: 1, col: 1 }), Some(2.0));
    }

    #[test]
    fn test_sparse_neighbour_ignored_in_stage_four() {
        let mut g = ValueGrid::filled(axes(3), Some(1.0));
        g.set(CellIndex { row: 0, col: 1 }, Some(100.0));
        let mut coverage = CoverageGrid::filled(axes(3), 10);
        coverage.set(CellIndex { row: 0, col: 1 }, 3);
        let config = SmootherConfig {
            min_hits: 5,
            ..SmootherConfig::default()
        };
        let out = coverage_weighted(&g, &coverage, &config).unwrap();
        let v = out.value(CellIndex { row: 1, col: 1 }).unwrap();
        assert!((v - 1.0).abs() < 1e-12, "sparse neighbour leaked in: {v}");
        // Same neighbour with enough hits does pull the centre.
        coverage.set(CellIndex { row: 0, col: 1 }, 5);
        let out = coverage_weighted(&g, &coverage, &config).unwrap();
        assert!(out.value(CellIndex { row: 1, col: 1 }).unwrap() > 1.0);
    }

    #[test]
    fn test_uniform_grid_is_fixed_point() {
        let g = ValueGrid::filled(axes(4), Some(0.75));
        let coverage = CoverageGrid::filled(axes(4), 7);
        let trace = KernelSmoother::new(SmootherConfig::default())
            .smooth(&g, &coverage)
            .unwrap();
        for v in trace.output.cells().iter().flatten() {
            assert!((v - 0.75).abs() < 1e-12);
        }
    }

    #[test]
    fn test_mismatched_coverage_rejected() {
        let raw = ValueGrid::empty(axes(3));
        let coverage = CoverageGrid::filled(axes(4), 1);
        let err = KernelSmoother::new(SmootherConfig::default())
            .smooth(&raw, &coverage)
            .unwrap_err();
        assert!(matches!(err, VecalError::GridMismatch(_)));
    }
}
