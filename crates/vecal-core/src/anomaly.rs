// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Anomaly Diagnostics
// ─────────────────────────────────────────────────────────────────────
//! Robust z-score over neighbour residuals.
//!
//! residual = cell − median(populated 8-neighbours)
//! z        = 0.6745 · (residual − median residual) / MAD
//!
//! With MAD = 0 the scale falls back to 1.2533 · mean absolute deviation.
//! Advisory only: nothing here touches the correction grid.

use serde::{Deserialize, Serialize};

use vecal_types::{median, AnomalyConfig, ValueGrid};

const MAD_CONSISTENCY: f64 = 0.6745;
const MEAN_AD_CONSISTENCY: f64 = 1.2533;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Notice,
    Warning,
    Critical,
}

impl Severity {
    pub fn classify(z_abs: f64, config: &AnomalyConfig) -> Option<Severity> {
        if z_abs >= config.critical_z {
            Some(Severity::Critical)
        } else if z_abs >= config.warning_z {
            Some(Severity::Warning)
        } else if z_abs >= config.notice_z {
            Some(Severity::Notice)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub row: usize,
    pub col: usize,
    pub rpm: f64,
    pub kpa: f64,
    pub value: f64,
    pub neighbor_median: f64,
    pub residual: f64,
    pub robust_z: f64,
    pub severity: Severity,
}

/// Flag cells whose value departs from their neighbourhood. Cells with
/// fewer than `min_neighbors` populated neighbours are not scored.
pub fn detect_anomalies(grid: &ValueGrid, config: &AnomalyConfig) -> Vec<Anomaly> {
    let mut scored = Vec::new();
    for idx in grid.indices() {
        let Some(value) = grid.value(idx) else {
            continue;
        };
        let neighbours: Vec<f64> = grid
            .moore_neighbors(idx)
            .into_iter()
            .filter_map(|(n, _)| grid.value(n))
            .collect();
        if neighbours.len() < config.min_neighbors.max(1) {
            continue;
        }
        let Some(neighbor_median) = median(&neighbours) else {
            continue;
        };
        scored.push((idx, value, neighbor_median, value - neighbor_median));
    }
    if scored.len() < 3 {
        return Vec::new();
    }

    let residuals: Vec<f64> = scored.iter().map(|s| s.3).collect();
    let Some(center) = median(&residuals) else {
        return Vec::new();
    };
    let deviations: Vec<f64> = residuals.iter().map(|r| (r - center).abs()).collect();
    let mad = median(&deviations).unwrap_or(0.0);
    let scale = if mad > 0.0 {
        mad / MAD_CONSISTENCY
    } else {
        let mean_ad = deviations.iter().sum::<f64>() / deviations.len() as f64;
        MEAN_AD_CONSISTENCY * mean_ad
    };
    if scale <= 0.0 || !scale.is_finite() {
        return Vec::new();
    }

    let axes = grid.axes();
    let anomalies: Vec<Anomaly> = scored
        .into_iter()
        .filter_map(|(idx, value, neighbor_median, residual)| {
            let robust_z = (residual - center) / scale;
            let severity = Severity::classify(robust_z.abs(), config)?;
            Some(Anomaly {
                row: idx.row,
                col: idx.col,
                rpm: axes.rpm[idx.row],
                kpa: axes.kpa[idx.col],
                value,
                neighbor_median,
                residual,
                robust_z,
                severity,
            })
        })
        .collect();
    if !anomalies.is_empty() {
        log::warn!("{} anomalous cells flagged", anomalies.len());
    }
    anomalies
}
