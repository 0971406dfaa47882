// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Bin Aggregator
// ─────────────────────────────────────────────────────────────────────
//! Buckets validated records into the RPM × kPa grid.
//!
//! Per bank: weighted-mean AFR error (%), sample count and total weight.
//! Shared: binned-sample count, peak knock retard and peak intake temp.
//! Sums are kept in fixed-point `i128` so the result does not depend on
//! record order.

use serde::{Deserialize, Serialize};

use vecal_types::{
    Bank, BinAxes, CoverageGrid, Grid, SensorRecord, ValueGrid, VecalError, VecalResult,
    BANK_COUNT,
};

/// Fixed-point quantum for weighted sums (1e-9).
const FIXED_POINT_SCALE: f64 = 1e9;

fn to_fixed(value: f64) -> VecalResult<i128> {
    let scaled = (value * FIXED_POINT_SCALE).round();
    if !scaled.is_finite() || scaled.abs() >= i128::MAX as f64 {
        return Err(VecalError::Numerical(format!(
            "value {value} cannot be accumulated"
        )));
    }
    Ok(scaled as i128)
}

fn from_fixed(value: i128) -> f64 {
    value as f64 / FIXED_POINT_SCALE
}

#[derive(Debug, Clone, Copy, Default)]
struct CellSums {
    weighted_error: i128,
    weight: i128,
    hits: u32,
}

/// One bank's aggregate grids.
#[derive(Debug, Clone, PartialEq)]
pub struct BankAggregate {
    pub bank: Bank,
    /// Weighted-mean AFR error (%); `None` where no sample qualified.
    pub error: ValueGrid,
    pub coverage: CoverageGrid,
    pub weight: Grid<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationStats {
    pub records_binned: usize,
    pub below_min_weight: usize,
    pub bins_total: usize,
    pub bins_populated: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub banks: Vec<BankAggregate>,
    /// Records per cell that passed the weight threshold.
    pub samples: CoverageGrid,
    pub max_knock: ValueGrid,
    pub max_iat: ValueGrid,
    pub stats: AggregationStats,
}

impl Aggregation {
    pub fn bank(&self, bank: Bank) -> Option<&BankAggregate> {
        self.banks.iter().find(|b| b.bank == bank)
    }
}

fn raise_max(grid: &mut ValueGrid, idx: vecal_types::CellIndex, value: Option<f64>) {
    if let Some(v) = value {
        let cell = grid.get_mut(idx);
        *cell = Some(cell.map_or(v, |cur| cur.max(v)));
    }
}

/// Bucket `records` into `axes`, discarding samples whose weight is
/// below `min_weight`. Only banks in `banks` get error grids.
pub fn aggregate(
    records: &[SensorRecord],
    axes: &BinAxes,
    banks: &[Bank],
    min_weight: f64,
) -> VecalResult<Aggregation> {
    let cells = axes.cell_count();
    let mut sums = vec![[CellSums::default(); BANK_COUNT]; cells];
    let mut samples = CoverageGrid::filled(axes.clone(), 0);
    let mut max_knock = ValueGrid::empty(axes.clone());
    let mut max_iat = ValueGrid::empty(axes.clone());
    let mut stats = AggregationStats::default();

    for record in records {
        let w = record.weight();
        if w < min_weight {
            stats.below_min_weight += 1;
            continue;
        }
        let idx = axes.locate(record.rpm, record.map_kpa);
        let flat = idx.row * axes.cols() + idx.col;
        stats.records_binned += 1;
        *samples.get_mut(idx) += 1;
        raise_max(&mut max_knock, idx, record.knock_retard_deg);
        raise_max(&mut max_iat, idx, record.iat_f);

        let w_fixed = to_fixed(w)?;
        for bank in banks {
            let Some(pair) = record.afr(*bank) else {
                continue;
            };
            let err = pair.error_pct();
            let cell = &mut sums[flat][bank.index()];
            cell.weighted_error += to_fixed(err * w)?;
            cell.weight += w_fixed;
            cell.hits += 1;
        }
    }

    let mut out = Vec::with_capacity(banks.len());
    for bank in banks {
        let per_bank: Vec<CellSums> = sums.iter().map(|s| s[bank.index()]).collect();
        let error = Grid::from_cells(
            axes.clone(),
            per_bank
                .iter()
                .map(|s| {
                    (s.weight > 0)
                        .then(|| from_fixed(s.weighted_error) / from_fixed(s.weight))
                })
                .collect(),
        )?;
        let coverage = Grid::from_cells(axes.clone(), per_bank.iter().map(|s| s.hits).collect())?;
        let weight =
            Grid::from_cells(axes.clone(), per_bank.iter().map(|s| from_fixed(s.weight)).collect())?;
        log::debug!("bank {bank}: {} cells populated", error.populated());
        out.push(BankAggregate {
            bank: *bank,
            error,
            coverage,
            weight,
        });
    }

    stats.bins_total = cells;
    stats.bins_populated = (0..cells)
        .filter(|i| out.iter().any(|b| b.error.cells()[*i].is_some()))
        .count();
    if stats.below_min_weight > 0 {
        log::info!(
            "{} samples below weight threshold {min_weight}",
            stats.below_min_weight
        );
    }

    Ok(Aggregation {
        banks: out,
        samples,
        max_knock,
        max_iat,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vecal_types::{AfrPair, CellIndex, LoadProxy};

    fn axes() -> BinAxes {
        BinAxes::new(vec![1000.0, 2000.0, 3000.0], vec![20.0, 60.0, 100.0]).unwrap()
    }

    fn rec(rpm: f64, kpa: f64, torque: f64, cmd: f64, meas: f64) -> SensorRecord {
        SensorRecord {
            rpm,
            map_kpa: kpa,
            load: LoadProxy::TorqueFtLb(torque),
            afr: [
                Some(AfrPair {
                    commanded: cmd,
                    measured: meas,
                }),
                None,
            ],
            knock_retard_deg: None,
            iat_f: None,
            tps_pct: None,
        }
    }

    #[test]
    fn test_weighted_mean() {
        // +4% at weight 10, 0% at weight 30 → 1%.
        let records = vec![
            rec(2000.0, 60.0, 10.0, 13.0, 12.5),
            rec(2100.0, 55.0, 30.0, 13.0, 13.0),
        ];
        let agg = aggregate(&records, &axes(), &[Bank::Front], 5.0).unwrap();
        let front = agg.bank(Bank::Front).unwrap();
        let v = front.error.value(CellIndex { row: 1, col: 1 }).unwrap();
        assert!((v - 1.0).abs() < 1e-9);
        assert_eq!(*front.coverage.get(CellIndex { row: 1, col: 1 }), 2);
        assert_eq!(front.error.populated(), 1);
        assert_eq!(agg.stats.bins_populated, 1);
        assert_eq!(agg.stats.bins_total, 9);
    }

    #[test]
    fn test_all_below_weight_gives_absent_cells() {
        let records: Vec<SensorRecord> = (0..50)
            .map(|i| rec(1000.0 + i as f64 * 40.0, 20.0 + i as f64, 4.99, 13.0, 12.0))
            .collect();
        let agg = aggregate(&records, &axes(), &[Bank::Front], 5.0).unwrap();
        let front = agg.bank(Bank::Front).unwrap();
        assert!(front.error.cells().iter().all(Option::is_none));
        assert_eq!(agg.stats.below_min_weight, 50);
        assert_eq!(agg.stats.records_binned, 0);
    }

    #[test]
    fn test_order_independent_bits() {
        let records: Vec<SensorRecord> = (0..200)
            .map(|i| {
                let f = i as f64;
                rec(
                    1000.0 + (f * 37.0) % 2000.0,
                    20.0 + (f * 13.0) % 80.0,
                    5.0 + (f * 7.3) % 90.0,
                    13.0,
                    12.0 + (f * 0.017) % 1.5,
                )
            })
            .collect();
        let mut reversed = records.clone();
        reversed.reverse();
        let a = aggregate(&records, &axes(), &[Bank::Front], 5.0).unwrap();
        let b = aggregate(&reversed, &axes(), &[Bank::Front], 5.0).unwrap();
        let bits = |g: &ValueGrid| -> Vec<Option<u64>> {
            g.cells().iter().map(|c| c.map(f64::to_bits)).collect()
        };
        assert_eq!(bits(&a.banks[0].error), bits(&b.banks[0].error));
    }

    #[test]
    fn test_peak_knock_and_iat_tracked() {
        let mut a = rec(1000.0, 20.0, 50.0, 13.0, 13.0);
        a.knock_retard_deg = Some(1.0);
        a.iat_f = Some(150.0);
        let mut b = a.clone();
        b.knock_retard_deg = Some(3.5);
        b.iat_f = Some(120.0);
        let agg = aggregate(&[a, b], &axes(), &[Bank::Front], 5.0).unwrap();
        let idx = CellIndex { row: 0, col: 0 };
        assert_eq!(agg.max_knock.value(idx), Some(3.5));
        assert_eq!(agg.max_iat.value(idx), Some(150.0));
        assert_eq!(*agg.samples.get(idx), 2);
    }

    #[test]
    fn test_bank_without_pair_is_skipped() {
        let r = rec(1000.0, 20.0, 50.0, 13.0, 13.0);
        let agg = aggregate(&[r], &axes(), &[Bank::Front, Bank::Rear], 5.0).unwrap();
        assert_eq!(agg.bank(Bank::Rear).unwrap().error.populated(), 0);
        assert_eq!(agg.bank(Bank::Front).unwrap().error.populated(), 1);
    }
}
