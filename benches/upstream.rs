//! Benchmarks for reglb components.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use reglb::metrics::{BorrowSource, MetricsCollector};
use reglb::service::{Service, Status, weight_by_tags};
use reglb::upstream::{ServiceItem, Upstream};
use reglb::util::RequestId;

fn create_upstream(num_items: u16, weight: impl Fn(u16) -> i64) -> Upstream {
    let upstream = Upstream::new("bench", 1000);
    upstream.update((0..num_items).map(|i| {
        ServiceItem::shared(
            Service::new(format!("bench-{i}"), "bench", "127.0.0.1", 9000 + i)
                .with_status(Status::Passing)
                .with_weight(weight(i)),
        )
    }));
    upstream
}

fn benchmark_next(c: &mut Criterion) {
    let mut group = c.benchmark_group("upstream_next");

    let equal = create_upstream(10, |_| 1000);
    group.bench_function("equal_weights", |b| {
        b.iter(|| {
            black_box(equal.next());
        })
    });

    let skewed = create_upstream(10, |i| i64::from(i + 1) * 100);
    group.bench_function("skewed_weights", |b| {
        b.iter(|| {
            black_box(skewed.next());
        })
    });

    let large = create_upstream(200, |i| i64::from(i % 7 + 1) * 150);
    group.bench_function("200_items", |b| {
        b.iter(|| {
            black_box(large.next());
        })
    });

    group.finish();
}

fn benchmark_borrow_release(c: &mut Criterion) {
    let upstream = create_upstream(10, |_| 1000);

    c.bench_function("borrow_release", |b| {
        b.iter(|| {
            if let Some(conn) = upstream.borrow() {
                black_box(conn.release(None));
            }
        })
    });
}

fn benchmark_refresh_cycle(c: &mut Criterion) {
    let upstream = create_upstream(50, |_| 1000);
    let items: Vec<_> = (0..50u16)
        .map(|i| {
            ServiceItem::shared(
                Service::new(format!("bench-{i}"), "bench", "127.0.0.1", 9000 + i)
                    .with_status(Status::Passing)
                    .with_weight(900),
            )
        })
        .collect();

    c.bench_function("reset_update_50", |b| {
        b.iter(|| {
            upstream.reset_and_update(items.iter().cloned());
        })
    });
}

fn benchmark_weight_by_tags(c: &mut Criterion) {
    let tags = ["DC=dc1", "CPU_USAGE=42", "MEMORY_USAGE=61", "zone=a"];

    c.bench_function("weight_by_tags", |b| {
        b.iter(|| {
            black_box(weight_by_tags(black_box(&tags[..])));
        })
    });
}

fn benchmark_metrics(c: &mut Criterion) {
    let collector = MetricsCollector::new();

    let mut group = c.benchmark_group("metrics");
    group.throughput(Throughput::Elements(1));

    group.bench_function("record_borrow", |b| {
        b.iter(|| {
            collector.record_borrow(black_box("api"), BorrowSource::Select);
        })
    });

    group.bench_function("record_return", |b| {
        b.iter(|| {
            collector.record_return(black_box("api"), black_box(true));
        })
    });

    group.finish();
}

fn benchmark_request_id(c: &mut Criterion) {
    c.bench_function("request_id", |b| {
        b.iter(|| {
            black_box(RequestId::new());
        })
    });
}

criterion_group!(
    benches,
    benchmark_next,
    benchmark_borrow_release,
    benchmark_refresh_cycle,
    benchmark_weight_by_tags,
    benchmark_metrics,
    benchmark_request_id,
);

criterion_main!(benches);
