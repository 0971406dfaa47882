// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Confidence & Quality Report
// ─────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};

use vecal_types::{Bank, ClampedCell, CoverageGrid, Grid, QualityConfig, ValueGrid};

/// Per-cell confidence derived from sample coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    None,
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn from_hits(hits: u32, config: &QualityConfig) -> Self {
        if hits >= config.high_hits {
            Confidence::High
        } else if hits >= config.medium_hits {
            Confidence::Medium
        } else if hits >= 1 {
            Confidence::Low
        } else {
            Confidence::None
        }
    }
}

/// Whole-run grade from the share of cells with at least medium confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityGrade {
    Good,
    Fair,
    Poor,
    Insufficient,
}

impl QualityGrade {
    pub fn from_share(share: f64) -> Self {
        if share >= 0.75 {
            QualityGrade::Good
        } else if share >= 0.50 {
            QualityGrade::Fair
        } else if share > 0.0 {
            QualityGrade::Poor
        } else {
            QualityGrade::Insufficient
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotKind {
    Knock,
    IntakeTemp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotCell {
    pub row: usize,
    pub col: usize,
    pub rpm: f64,
    pub kpa: f64,
    pub kind: HotKind,
    pub value: f64,
    pub threshold: f64,
}

/// Cells one bank's correction clamp bounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankClamps {
    pub bank: Bank,
    pub limit: f64,
    pub cells: Vec<ClampedCell>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub none: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub grade: QualityGrade,
    pub coverage_ratio: f64,
    pub counts: ConfidenceCounts,
    /// Row-major confidence tiers.
    pub confidence: Vec<Vec<Confidence>>,
    pub clamped: Vec<BankClamps>,
    pub hot_cells: Vec<HotCell>,
}

fn hot_cells(grid: &ValueGrid, kind: HotKind, threshold: f64) -> Vec<HotCell> {
    let axes = grid.axes();
    grid.iter()
        .filter_map(|(idx, v)| {
            let value = (*v).filter(|v| *v > threshold)?;
            Some(HotCell {
                row: idx.row,
                col: idx.col,
                rpm: axes.rpm[idx.row],
                kpa: axes.kpa[idx.col],
                kind,
                value,
                threshold,
            })
        })
        .collect()
}

pub fn assess_quality(
    samples: &CoverageGrid,
    max_knock: &ValueGrid,
    max_iat: &ValueGrid,
    clamped: Vec<BankClamps>,
    config: &QualityConfig,
) -> QualityReport {
    let tiers: Grid<Confidence> = samples.map(|_, hits| Confidence::from_hits(*hits, config));
    let mut counts = ConfidenceCounts::default();
    for tier in tiers.cells() {
        match tier {
            Confidence::High => counts.high += 1,
            Confidence::Medium => counts.medium += 1,
            Confidence::Low => counts.low += 1,
            Confidence::None => counts.none += 1,
        }
    }
    let total = tiers.cells().len().max(1) as f64;
    let coverage_ratio = (total - counts.none as f64) / total;
    let grade = QualityGrade::from_share((counts.high + counts.medium) as f64 / total);

    let confidence = tiers
        .cells()
        .chunks(tiers.cols().max(1))
        .map(<[Confidence]>::to_vec)
        .collect();

    let mut hot = hot_cells(max_knock, HotKind::Knock, config.knock_warn_deg);
    hot.extend(hot_cells(max_iat, HotKind::IntakeTemp, config.iat_warn_f));
    if !hot.is_empty() {
        log::warn!("{} hot cells (knock/intake temperature)", hot.len());
    }

    QualityReport {
        grade,
        coverage_ratio,
        counts,
        confidence,
        clamped,
        hot_cells: hot,
    }
}
