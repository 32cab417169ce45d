//! Criterion benchmarks for branch updates at both extremes: the
//! steady-state buffer insert and a full-buffer compaction cycle.

use chrono::{DateTime, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use ft_common::{BranchKey, SourceRef, Variant};
use ft_core::branch::Entry;
use ft_core::config::AnalysisConfig;
use ft_core::detector::{BayesianChangepointDetector, ChangepointDetector, DetectorConfig};
use ft_core::inputbuffer::segmentize;
use ft_core::verdict::{PositionVerdict, ResultCounts, Run, VerdictDetails};

fn hour(h: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(h * 3600, 0).unwrap()
}

fn passing(position: i64) -> PositionVerdict {
    PositionVerdict::simple_pass(position, hour(position))
}

fn failing(position: i64) -> PositionVerdict {
    PositionVerdict::with_details(
        position,
        hour(position),
        VerdictDetails {
            is_exonerated: false,
            runs: vec![Run {
                expected: ResultCounts::default(),
                unexpected: ResultCounts {
                    fail_count: 1,
                    ..Default::default()
                },
            }],
        },
    )
}

fn entry_with_cold(config: &AnalysisConfig, cold: Vec<PositionVerdict>) -> Entry {
    let source_ref =
        SourceRef::gitiles("chromium.googlesource.com", "chromium/src", "refs/heads/main");
    let mut entry = Entry::new(
        BranchKey {
            project: "chromium".to_string(),
            test_id: "suite.case".to_string(),
            variant_hash: "8ba4e1e9e213fa17".to_string(),
            ref_hash: source_ref.ref_hash(),
        },
        Variant::default(),
        source_ref,
        config,
    );
    entry.input_buffer.cold.verdicts = cold;
    entry
}

fn regression_cold(len: i64) -> Vec<PositionVerdict> {
    (1..=len)
        .map(|position| {
            if position <= 100 {
                passing(position)
            } else {
                failing(position)
            }
        })
        .collect()
}

fn bench_ingest(c: &mut Criterion) {
    let config = AnalysisConfig::default();
    let detector =
        BayesianChangepointDetector::new(DetectorConfig::default()).expect("default config");
    let mut group = c.benchmark_group("ingest");

    // Half-full buffer: insert only, no compaction.
    let steady = entry_with_cold(&config, regression_cold(1000));
    group.bench_function("steady_state", |b| {
        b.iter(|| {
            let mut entry = steady.clone();
            entry
                .ingest(vec![passing(5000)], &detector, &config, hour(5000))
                .expect("ingest");
            black_box(entry);
        });
    });

    // Full cold tier: one more verdict forces the whole analyze,
    // segmentize, evict cycle.
    let full = entry_with_cold(&config, regression_cold(2000));
    group.bench_function("full_buffer_compaction", |b| {
        b.iter(|| {
            let mut entry = full.clone();
            entry
                .ingest(vec![failing(2001)], &detector, &config, hour(2001))
                .expect("ingest");
            black_box(entry);
        });
    });

    group.finish();
}

fn bench_segmentize(c: &mut Criterion) {
    let detector =
        BayesianChangepointDetector::new(DetectorConfig::default()).expect("default config");
    let history = regression_cold(2000);
    let changepoints = detector.analyze(&history);

    c.bench_function("segmentize_2000", |b| {
        b.iter(|| black_box(segmentize(black_box(&history), black_box(&changepoints))));
    });
}

criterion_group!(benches, bench_ingest, bench_segmentize);
criterion_main!(benches);
