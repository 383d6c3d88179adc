//! Pump queue benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ptykit::buffer::IoBuffer;

fn bench_push_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("io_buffer");

    let chunk = vec![b'x'; 4096];
    group.throughput(Throughput::Bytes(64 * 1024));

    // Fill a 64 KiB queue in read-sized chunks, then hand it all over
    group.bench_function("push_drain_64k", |b| {
        let mut buf = IoBuffer::new(64 * 1024);
        b.iter(|| {
            while buf.push(&chunk) > 0 {}
            black_box(buf.drain_into(|bytes| bytes.len()))
        })
    });

    group.finish();
}

fn bench_slow_consumer(c: &mut Criterion) {
    let mut group = c.benchmark_group("io_buffer");

    let chunk = vec![b'y'; 4096];
    group.throughput(Throughput::Bytes(64 * 1024));

    // Consumer that takes at most 80 bytes per offer
    group.bench_function("partial_takes", |b| {
        let mut buf = IoBuffer::new(64 * 1024);
        b.iter(|| {
            while buf.push(&chunk) > 0 {}
            black_box(buf.drain_into(|bytes| bytes.len().min(80)))
        })
    });

    group.finish();
}

criterion_group!(benches, bench_push_drain, bench_slow_consumer);

criterion_main!(benches);
