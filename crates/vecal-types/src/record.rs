// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Sensor Record Types
// ─────────────────────────────────────────────────────────────────────

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Horsepower → torque constant (ft·lb at rpm).
pub const HP_TORQUE_CONSTANT: f64 = 5252.0;

/// Number of cylinder banks a record can carry.
pub const BANK_COUNT: usize = 2;

/// Cylinder bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bank {
    Front,
    Rear,
}

impl Bank {
    pub const ALL: [Bank; BANK_COUNT] = [Bank::Front, Bank::Rear];

    pub fn index(self) -> usize {
        match self {
            Bank::Front => 0,
            Bank::Rear => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Bank::Front => "front",
            Bank::Rear => "rear",
        }
    }
}

impl fmt::Display for Bank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Load signal as logged. Torque is the weighting unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum LoadProxy {
    TorqueFtLb(f64),
    Horsepower(f64),
}

impl LoadProxy {
    /// Torque equivalent: `hp × 5252 / rpm`. Zero rpm yields zero torque.
    pub fn torque(self, rpm: f64) -> f64 {
        match self {
            LoadProxy::TorqueFtLb(t) => t,
            LoadProxy::Horsepower(hp) => {
                if rpm <= 0.0 {
                    0.0
                } else {
                    hp * HP_TORQUE_CONSTANT / rpm
                }
            }
        }
    }

    pub fn raw(self) -> f64 {
        match self {
            LoadProxy::TorqueFtLb(v) | LoadProxy::Horsepower(v) => v,
        }
    }
}

/// Commanded vs measured air/fuel ratio for one bank.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AfrPair {
    pub commanded: f64,
    pub measured: f64,
}

impl AfrPair {
    /// `(commanded − measured) / measured × 100`.
    pub fn error_pct(self) -> f64 {
        (self.commanded - self.measured) / self.measured * 100.0
    }
}

/// One validated dyno sample. Immutable once built by ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRecord {
    pub rpm: f64,
    pub map_kpa: f64,
    pub load: LoadProxy,
    pub afr: [Option<AfrPair>; BANK_COUNT],
    pub knock_retard_deg: Option<f64>,
    pub iat_f: Option<f64>,
    pub tps_pct: Option<f64>,
}

impl SensorRecord {
    pub fn afr(&self, bank: Bank) -> Option<AfrPair> {
        self.afr[bank.index()]
    }

    /// Non-negative weighting load (torque units).
    pub fn weight(&self) -> f64 {
        self.load.torque(self.rpm).max(0.0)
    }
}

/// Why a row was dropped during ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Malformed,
    Unparseable,
    RpmInvalid,
    LoadInvalid,
    AfrOutOfRange,
    IatOutOfRange,
    MapOutOfRange,
    TpsOutOfRange,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::Malformed => "malformed",
            RejectReason::Unparseable => "unparseable",
            RejectReason::RpmInvalid => "rpm_invalid",
            RejectReason::LoadInvalid => "load_invalid",
            RejectReason::AfrOutOfRange => "afr_out_of_range",
            RejectReason::IatOutOfRange => "iat_out_of_range",
            RejectReason::MapOutOfRange => "map_out_of_range",
            RejectReason::TpsOutOfRange => "tps_out_of_range",
        }
    }
}

/// Rejection histogram. Ordered so serialized output is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RejectionTally {
    counts: BTreeMap<RejectReason, usize>,
}

impl RejectionTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, reason: RejectReason) {
        *self.counts.entry(reason).or_insert(0) += 1;
    }

    pub fn count(&self, reason: RejectReason) -> usize {
        self.counts.get(&reason).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RejectReason, usize)> + '_ {
        self.counts.iter().map(|(r, c)| (*r, *c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hp_to_torque() {
        let load = LoadProxy::Horsepower(100.0);
        assert!((load.torque(5252.0) - 100.0).abs() < 1e-12);
        assert!((load.torque(2626.0) - 200.0).abs() < 1e-12);
        assert_eq!(load.torque(0.0), 0.0);
    }

    #[test]
    fn test_afr_error_pct() {
        let pair = AfrPair {
            commanded: 13.0,
            measured: 12.5,
        };
        assert!((pair.error_pct() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_weight_never_negative() {
        let rec = SensorRecord {
            rpm: 2000.0,
            map_kpa: 50.0,
            load: LoadProxy::TorqueFtLb(-12.0),
            afr: [None, None],
            knock_retard_deg: None,
            iat_f: None,
            tps_pct: None,
        };
        assert_eq!(rec.weight(), 0.0);
    }

    #[test]
    fn test_tally_counts() {
        let mut tally = RejectionTally::new();
        tally.record(RejectReason::AfrOutOfRange);
        tally.record(RejectReason::AfrOutOfRange);
        tally.record(RejectReason::MapOutOfRange);
        assert_eq!(tally.count(RejectReason::AfrOutOfRange), 2);
        assert_eq!(tally.count(RejectReason::TpsOutOfRange), 0);
        assert_eq!(tally.total(), 3);
        let json = serde_json::to_string(&tally).unwrap();
        assert!(json.contains("afr_out_of_range"));
    }
}
