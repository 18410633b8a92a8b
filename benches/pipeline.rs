//! Hot paths between collection and delivery: queue traffic and snapshot diffing.

use aegis_agent::collectors::{diff_values, ValueSnapshot};
use aegis_agent::{EventQueue, SecurityEvent, Severity};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn make_events(n: usize) -> Vec<SecurityEvent> {
    (0..n)
        .map(|i| {
            SecurityEvent::new("process_started", Severity::Low)
                .with_detail("process_id", i as u64)
                .with_detail("process_name", format!("proc_{}", i))
                .with_detail("executable_path", "/usr/bin/bench")
        })
        .collect()
}

fn make_snapshot(n: usize, salt: usize) -> ValueSnapshot {
    (0..n)
        .map(|i| (format!("Value{}", i), format!(r"C:\Program Files\App{}\app.exe", i * salt)))
        .collect()
}

fn bench_queue(c: &mut Criterion) {
    let events = make_events(1000);
    c.bench_function("queue_enqueue_drain_1000", |b| {
        b.iter(|| {
            let q = EventQueue::new();
            q.enqueue_all(black_box(events.clone()));
            while !q.dequeue_batch(10).is_empty() {}
        });
    });
}

fn bench_diff(c: &mut Criterion) {
    let before = make_snapshot(500, 1);
    let after = make_snapshot(500, 2);
    c.bench_function("registry_diff_500_values", |b| {
        b.iter(|| black_box(diff_values(black_box(&before), black_box(&after))));
    });
}

criterion_group!(benches, bench_queue, bench_diff);
criterion_main!(benches);
