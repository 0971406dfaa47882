// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Numeric Primitives
// ─────────────────────────────────────────────────────────────────────

/// Symmetric percentage clamp: `max(−limit, min(limit, value))`.
///
/// Values already inside the band are returned bit-for-bit.
#[inline]
pub fn clamp_pct(value: f64, limit: f64) -> f64 {
    if value > limit {
        limit
    } else if value < -limit {
        -limit
    } else {
        value
    }
}

/// Multiplicative factor for a percentage correction: `1 + pct / 100`.
#[inline]
pub fn pct_factor(pct: f64) -> f64 {
    1.0 + pct / 100.0
}

/// Round half away from zero to `places` decimals.
#[inline]
pub fn round_places(value: f64, places: u32) -> f64 {
    let scale = 10f64.powi(places as i32);
    (value * scale).round() / scale
}

/// Median of a slice. Returns `None` when empty. NaN must be filtered first.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_inside_band_is_exact() {
        let v = 3.141_592_653_589_793;
        assert_eq!(clamp_pct(v, 7.0).to_bits(), v.to_bits());
    }

    #[test]
    fn test_clamp_bounds() {
        assert_eq!(clamp_pct(12.0, 7.0), 7.0);
        assert_eq!(clamp_pct(-12.0, 7.0), -7.0);
        assert_eq!(clamp_pct(7.0, 7.0), 7.0);
    }

    #[test]
    fn test_round_places() {
        assert_eq!(round_places(94.499_99, 4), 94.5);
        assert_eq!(round_places(-1.234_56, 2), -1.23);
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
    }
}
