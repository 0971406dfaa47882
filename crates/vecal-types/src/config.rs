// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Configuration
// ─────────────────────────────────────────────────────────────────────

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::clamp::{check_apply_clamp_limit, check_clamp_limit};
use crate::error::{VecalError, VecalResult};
use crate::grid::BinAxes;

/// Runtime configuration for one calibration run.
///
/// Built once at process start and passed by reference into every
/// component. Nothing in the kernel reads configuration from globals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Engine-speed bin centres (rpm), strictly increasing.
    /// Default: 1000..=6000 step 500 (11 rows).
    pub rpm_bins: Vec<f64>,

    /// Manifold-pressure bin centres (kPa), strictly increasing.
    /// Default: 20, 40, 60, 80, 100 (5 columns).
    pub kpa_bins: Vec<f64>,

    /// Plausibility ranges applied to every parsed row.
    pub limits: PhysicalLimits,

    /// Samples with torque-equivalent load below this are discarded.
    /// Default: 5.0.
    pub min_weight: f64,

    pub smoothing: SmootherConfig,

    pub anomaly: AnomalyConfig,

    pub quality: QualityConfig,

    /// Clamp applied when generating the correction grid (percent).
    /// Default: 15.0.
    pub correction_clamp_pct: f64,

    /// Clamp applied when a correction grid is applied to a VE table
    /// (percent). Independent of `correction_clamp_pct`.
    /// Default: 7.0.
    pub apply_clamp_pct: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            rpm_bins: (0..11).map(|i| 1000.0 + 500.0 * i as f64).collect(),
            kpa_bins: vec![20.0, 40.0, 60.0, 80.0, 100.0],
            limits: PhysicalLimits::default(),
            min_weight: 5.0,
            smoothing: SmootherConfig::default(),
            anomaly: AnomalyConfig::default(),
            quality: QualityConfig::default(),
            correction_clamp_pct: 15.0,
            apply_clamp_pct: 7.0,
        }
    }
}

/// Inclusive plausibility range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicalLimits {
    /// Air/fuel ratio. Default: [9.0, 18.0].
    pub afr: Range,
    /// Intake air temperature, °F. Default: [30, 300].
    pub iat_f: Range,
    /// Manifold absolute pressure, kPa. Default: [10, 110].
    pub map_kpa: Range,
    /// Throttle position, %. Default: [0, 100].
    pub tps_pct: Range,
    /// Engine speed, rpm. Default: [100, 12000].
    pub rpm: Range,
}

impl Default for PhysicalLimits {
    fn default() -> Self {
        Self {
            afr: Range::new(9.0, 18.0),
            iat_f: Range::new(30.0, 300.0),
            map_kpa: Range::new(10.0, 110.0),
            tps_pct: Range::new(0.0, 100.0),
            rpm: Range::new(100.0, 12_000.0),
        }
    }
}

/// Parameters for the four-stage kernel smoother.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmootherConfig {
    /// Full pass count for small corrections. Default: 2.
    pub passes: u32,
    /// |value| at or below this receives the full pass count. Default: 1.0.
    pub taper_start_pct: f64,
    /// |value| at or above this is never smoothed. Default: 3.0.
    pub taper_end_pct: f64,
    /// Gradient above which the smoothed value blends back. Default: 1.0.
    pub gradient_threshold_pct: f64,
    /// Stage-4 smoothing strength α. Default: 0.20.
    pub coverage_alpha: f64,
    /// Stage-4 weight multiplier on the centre cell. Default: 1.25.
    pub center_bias: f64,
    /// Stage-4 minimum coverage for a cell to participate. Default: 1.
    pub min_hits: u32,
    /// Stage-4 inverse-distance power. Default: 1.0.
    pub distance_power: f64,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            passes: 2,
            taper_start_pct: 1.0,
            taper_end_pct: 3.0,
            gradient_threshold_pct: 1.0,
            coverage_alpha: 0.20,
            center_bias: 1.25,
            min_hits: 1,
            distance_power: 1.0,
        }
    }
}

/// Robust z-score thresholds for anomaly tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Default: 3.5.
    pub notice_z: f64,
    /// Default: 5.0.
    pub warning_z: f64,
    /// Default: 8.0.
    pub critical_z: f64,
    /// Minimum populated neighbours for a cell to be scored. Default: 2.
    pub min_neighbors: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            notice_z: 3.5,
            warning_z: 5.0,
            critical_z: 8.0,
            min_neighbors: 2,
        }
    }
}

/// Coverage tiers and hot-cell flags for the quality report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Default: 20.
    pub high_hits: u32,
    /// Default: 5.
    pub medium_hits: u32,
    /// Max knock retard (degrees) above which a cell is flagged. Default: 2.0.
    pub knock_warn_deg: f64,
    /// Max intake temperature (°F) above which a cell is flagged. Default: 160.
    pub iat_warn_f: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            high_hits: 20,
            medium_hits: 5,
            knock_warn_deg: 2.0,
            iat_warn_f: 160.0,
        }
    }
}

impl CalibrationConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> VecalResult<()> {
        self.axes()?;
        check_clamp_limit(self.correction_clamp_pct, "correction_clamp_pct")?;
        check_apply_clamp_limit(self.apply_clamp_pct, "apply_clamp_pct")?;
        if !(self.min_weight.is_finite() && self.min_weight >= 0.0) {
            return Err(VecalError::Config(format!(
                "min_weight must be >= 0, got {}",
                self.min_weight
            )));
        }
        for (name, range) in [
            ("afr", self.limits.afr),
            ("iat_f", self.limits.iat_f),
            ("map_kpa", self.limits.map_kpa),
            ("tps_pct", self.limits.tps_pct),
            ("rpm", self.limits.rpm),
        ] {
            if !(range.min.is_finite() && range.max.is_finite() && range.min <= range.max) {
                return Err(VecalError::Config(format!(
                    "limits.{name} must satisfy min <= max, got [{}, {}]",
                    range.min, range.max
                )));
            }
        }
        let s = &self.smoothing;
        if !(s.taper_start_pct >= 0.0
            && s.taper_start_pct < s.taper_end_pct
            && s.taper_end_pct.is_finite())
        {
            return Err(VecalError::Config(format!(
                "smoothing taper must satisfy 0 <= start < end, got [{}, {}]",
                s.taper_start_pct, s.taper_end_pct
            )));
        }
        if !(s.gradient_threshold_pct > 0.0 && s.gradient_threshold_pct.is_finite()) {
            return Err(VecalError::Config(format!(
                "smoothing.gradient_threshold_pct must be > 0, got {}",
                s.gradient_threshold_pct
            )));
        }
        if !(s.coverage_alpha > 0.0 && s.coverage_alpha <= 1.0) {
            return Err(VecalError::Config(format!(
                "smoothing.coverage_alpha must be in (0, 1], got {}",
                s.coverage_alpha
            )));
        }
        let center_ok = s.center_bias > 0.0 && s.center_bias.is_finite();
        let power_ok = s.distance_power >= 0.0 && s.distance_power.is_finite();
        if !(center_ok && power_ok) {
            return Err(VecalError::Config(format!(
                "smoothing.center_bias must be > 0 and distance_power >= 0, got {} / {}",
                s.center_bias, s.distance_power
            )));
        }
        let a = &self.anomaly;
        if !(a.notice_z > 0.0
            && a.notice_z <= a.warning_z
            && a.warning_z <= a.critical_z
            && a.critical_z.is_finite())
        {
            return Err(VecalError::Config(format!(
                "anomaly tiers must satisfy 0 < notice <= warning <= critical, got {} / {} / {}",
                a.notice_z, a.warning_z, a.critical_z
            )));
        }
        if self.quality.medium_hits == 0 || self.quality.medium_hits > self.quality.high_hits {
            return Err(VecalError::Config(format!(
                "quality tiers must satisfy 0 < medium_hits <= high_hits, got {} / {}",
                self.quality.medium_hits, self.quality.high_hits
            )));
        }
        Ok(())
    }

    /// Bin axes described by this configuration.
    pub fn axes(&self) -> VecalResult<BinAxes> {
        BinAxes::new(self.rpm_bins.clone(), self.kpa_bins.clone())
    }

    /// Load from JSON string. Missing fields take their defaults.
    pub fn from_json(json: &str) -> VecalResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| VecalError::Config(format!("JSON parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> VecalResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| VecalError::io(path, e))?;
        Self::from_json(&text)
    }

    /// Canonical JSON form, used when fingerprinting a run.
    pub fn to_canonical_json(&self) -> VecalResult<String> {
        serde_json::to_string(self).map_err(|e| VecalError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let cfg = CalibrationConfig::default();
        cfg.validate().unwrap();
        let axes = cfg.axes().unwrap();
        assert_eq!(axes.rows(), 11);
        assert_eq!(axes.cols(), 5);
        assert_eq!(cfg.rpm_bins[10], 6000.0);
    }

    #[test]
    fn test_clamps_are_independent() {
        let cfg = CalibrationConfig::from_json(r#"{"correction_clamp_pct": 20.0}"#).unwrap();
        assert_eq!(cfg.correction_clamp_pct, 20.0);
        assert_eq!(cfg.apply_clamp_pct, 7.0);
    }

    #[test]
    fn test_partial_nested_override() {
        let cfg = CalibrationConfig::from_json(r#"{"smoothing": {"passes": 4}}"#).unwrap();
        assert_eq!(cfg.smoothing.passes, 4);
        assert_eq!(cfg.smoothing.center_bias, 1.25);
    }

    #[test]
    fn test_rejects_bad_clamp() {
        let mut cfg = CalibrationConfig::default();
        cfg.apply_clamp_pct = 0.0;
        assert!(cfg.validate().is_err());
        cfg.apply_clamp_pct = 100.0;
        assert!(cfg.validate().is_err());
        cfg.apply_clamp_pct = 60.0;
        assert!(cfg.validate().is_err());
        // Generation clamp may exceed the apply bound.
        cfg.apply_clamp_pct = 7.0;
        cfg.correction_clamp_pct = 60.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_nan_smoothing_parameters() {
        let mut cfg = CalibrationConfig::default();
        cfg.smoothing.gradient_threshold_pct = f64::NAN;
        assert!(matches!(cfg.validate(), Err(VecalError::Config(_))));

        let mut cfg = CalibrationConfig::default();
        cfg.smoothing.center_bias = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = CalibrationConfig::default();
        cfg.smoothing.distance_power = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = CalibrationConfig::default();
        cfg.smoothing.taper_end_pct = f64::INFINITY;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_unsorted_bins() {
        let mut cfg = CalibrationConfig::default();
        cfg.kpa_bins = vec![40.0, 20.0];
        assert!(matches!(cfg.validate(), Err(VecalError::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_taper() {
        let mut cfg = CalibrationConfig::default();
        cfg.smoothing.taper_start_pct = 3.0;
        cfg.smoothing.taper_end_pct = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_json() {
        let err = CalibrationConfig::from_json("{not json").unwrap_err();
        assert!(err.to_string().contains("JSON parse error"));
    }
}
