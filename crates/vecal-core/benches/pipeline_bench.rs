// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Analysis Benchmarks
// ─────────────────────────────────────────────────────────────────────
//! Criterion benchmarks over a synthetic 20k-row dyno log on the
//! default 11 × 5 grid.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use vecal_core::{aggregate, ingest_bytes, Analyzer, KernelSmoother};
use vecal_types::{AfrPair, Bank, CalibrationConfig, LoadProxy, SensorRecord};

const ROWS: usize = 20_000;

fn make_records() -> Vec<SensorRecord> {
    (0..ROWS)
        .map(|i| {
            let f = i as f64;
            SensorRecord {
                rpm: 1000.0 + (f * 7.919) % 5000.0,
                map_kpa: 20.0 + (f * 3.137) % 80.0,
                load: LoadProxy::TorqueFtLb(5.0 + (f * 1.733) % 120.0),
                afr: [
                    Some(AfrPair {
                        commanded: 13.0,
                        measured: 12.4 + (f * 0.0131) % 1.2,
                    }),
                    Some(AfrPair {
                        commanded: 13.0,
                        measured: 12.5 + (f * 0.0173) % 1.1,
                    }),
                ],
                knock_retard_deg: Some((f * 0.01) % 3.0),
                iat_f: Some(90.0 + (f * 0.07) % 60.0),
                tps_pct: Some((f * 0.3) % 100.0),
            }
        })
        .collect()
}

fn make_log() -> String {
    let mut log = String::from("Engine RPM,MAP kPa,Torque,AFR Target,AFR Front,AFR Rear,IAT\n");
    for r in make_records() {
        let front = r.afr[0].map_or(0.0, |p| p.measured);
        let rear = r.afr[1].map_or(0.0, |p| p.measured);
        log.push_str(&format!(
            "{:.1},{:.1},{:.2},13.0,{front:.3},{rear:.3},{:.1}\n",
            r.rpm,
            r.map_kpa,
            r.load.raw(),
            r.iat_f.unwrap_or(90.0)
        ));
    }
    log
}

// ── Ingestion ───────────────────────────────────────────────────────

fn bench_ingest(c: &mut Criterion) {
    let log = make_log();
    let config = CalibrationConfig::default();
    c.bench_function("ingest_20k_rows", |b| {
        b.iter(|| ingest_bytes(black_box(log.as_bytes()), "bench.csv", &config))
    });
}

// ── Aggregation & smoothing ─────────────────────────────────────────

fn bench_aggregate(c: &mut Criterion) {
    let records = make_records();
    let config = CalibrationConfig::default();
    let axes = config.axes().unwrap();
    c.bench_function("aggregate_20k_two_banks", |b| {
        b.iter(|| aggregate(black_box(&records), &axes, &Bank::ALL, config.min_weight))
    });
}

fn bench_smooth(c: &mut Criterion) {
    let records = make_records();
    let config = CalibrationConfig::default();
    let axes = config.axes().unwrap();
    let agg = aggregate(&records, &axes, &[Bank::Front], config.min_weight).unwrap();
    let smoother = KernelSmoother::from_config(&config);
    let front = &agg.banks[0];
    c.bench_function("smooth_11x5", |b| {
        b.iter(|| smoother.smooth(black_box(&front.error), black_box(&front.coverage)))
    });
}

// ── Full analysis ───────────────────────────────────────────────────

fn bench_analyze(c: &mut Criterion) {
    let records = make_records();
    let analyzer = Analyzer::new(CalibrationConfig::default()).unwrap();
    c.bench_function("analyze_20k_two_banks", |b| {
        b.iter(|| analyzer.analyze(black_box(&records), &Bank::ALL))
    });
}

criterion_group!(
    benches,
    bench_ingest,
    bench_aggregate,
    bench_smooth,
    bench_analyze
);
criterion_main!(benches);
