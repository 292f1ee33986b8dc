use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use db_stress::metrics::{MetricsRegistry, SamplingPolicy};
use db_stress::threshold::Threshold;

fn bench_record_path(c: &mut Criterion) {
    let registry = MetricsRegistry::new(SamplingPolicy::Reservoir {
        size: db_stress::defaults::RESERVOIR_SIZE,
    });
    let counter = registry.counter("operations").unwrap();
    let rate = registry.rate("operation_success").unwrap();

    c.bench_function("counter_inc", |b| b.iter(|| counter.inc()));
    c.bench_function("rate_add", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            rate.add(black_box(i % 20 != 0))
        })
    });

    let mut group = c.benchmark_group("trend_add");
    for policy in [
        SamplingPolicy::Exact,
        SamplingPolicy::Reservoir {
            size: db_stress::defaults::RESERVOIR_SIZE,
        },
    ] {
        let registry = MetricsRegistry::new(policy);
        let trend = registry.trend("operation_duration").unwrap();
        let label = match policy {
            SamplingPolicy::Exact => "exact",
            SamplingPolicy::Reservoir { .. } => "reservoir",
        };
        group.bench_function(BenchmarkId::from_parameter(label), |b| {
            let mut v = 0.0f64;
            b.iter(|| {
                v = (v + 1.7) % 250.0;
                trend.add(black_box(v))
            })
        });
    }
    group.finish();
}

fn bench_snapshot_and_evaluate(c: &mut Criterion) {
    let registry = MetricsRegistry::new(SamplingPolicy::Reservoir {
        size: db_stress::defaults::RESERVOIR_SIZE,
    });
    let trend = registry.trend("operation_duration").unwrap();
    for i in 0..100_000 {
        trend.add((i % 500) as f64 * 0.5);
    }
    let threshold = Threshold::parse("operation_duration", "p(95)<200ms").unwrap();

    c.bench_function("trend_snapshot_p95", |b| {
        b.iter(|| {
            let snapshot = registry.snapshot_of("operation_duration").unwrap();
            black_box(threshold.evaluate(Some(&snapshot.value)))
        })
    });
}

criterion_group!(benches, bench_record_path, bench_snapshot_and_evaluate);
criterion_main!(benches);
