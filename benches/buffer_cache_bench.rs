// Buffer Cache Performance Benchmarks
// Tests the hash-indexed find-or-create path, pin/unpin churn, and the
// delwri flusher's scan-and-submit pass under a synthetic working set.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pagebuf::block_io::MemoryBlockDevice;
use pagebuf::buffer::{AlignmentPolicy, BufferCache, DelwriFlusher, DeviceTarget, FlusherConfig};
use pagebuf::page_store::{MemoryPageStore, PAGE_SIZE};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn create_cache() -> (Runtime, Arc<DeviceTarget>, BufferCache, MemoryBlockDevice) {
    let rt = Runtime::new().unwrap();
    let store = Arc::new(MemoryPageStore::new());
    let target = Arc::new(DeviceTarget::new(0, store, AlignmentPolicy::Any));
    let cache = BufferCache::new();
    let device = MemoryBlockDevice::new(1 << 16);
    (rt, target, cache, device)
}

fn bench_get_cold(c: &mut Criterion) {
    c.bench_function("buffer_get_cold", |b| {
        let (rt, target, cache, device) = create_cache();
        let mut offset = 0u64;
        b.iter(|| {
            offset += PAGE_SIZE as u64;
            let buf = rt.block_on(cache.get(
                target.clone(),
                black_box(offset),
                PAGE_SIZE,
                Default::default(),
                &device,
            ))
            .unwrap();
            buf.unlock();
            black_box(buf.rele());
        });
    });
}

fn bench_get_hot(c: &mut Criterion) {
    let (rt, target, cache, device) = create_cache();
    let warm = rt
        .block_on(cache.get(target.clone(), 4096, PAGE_SIZE, Default::default(), &device))
        .unwrap();
    warm.unlock();

    c.bench_function("buffer_get_hot", |b| {
        b.iter(|| {
            let buf = rt
                .block_on(cache.get(target.clone(), 4096, PAGE_SIZE, Default::default(), &device))
                .unwrap();
            buf.unlock();
            black_box(buf.rele());
        });
    });
}

fn bench_pin_unpin(c: &mut Criterion) {
    let (rt, target, cache, device) = create_cache();
    let buf = rt
        .block_on(cache.get(target.clone(), 8192, PAGE_SIZE, Default::default(), &device))
        .unwrap();
    buf.unlock();

    c.bench_function("buffer_pin_unpin", |b| {
        b.iter(|| {
            buf.pin();
            black_box(buf.pin_count());
            buf.unpin();
        });
    });
}

fn bench_bucket_occupancy(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_bucket_occupancy");

    for buffer_count in [16usize, 256, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(buffer_count), &buffer_count, |b, &count| {
            let (rt, target, cache, device) = create_cache();
            for i in 0..count {
                let buf = rt
                    .block_on(cache.get(target.clone(), (i * PAGE_SIZE) as u64, PAGE_SIZE, Default::default(), &device))
                    .unwrap();
                buf.unlock();
                buf.rele();
            }
            b.iter(|| {
                black_box(cache.find(&target, black_box(0), PAGE_SIZE));
            });
        });
    }

    group.finish();
}

fn bench_delwri_flush_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("delwri_flush_pass");

    for queued in [8usize, 64, 512] {
        group.bench_with_input(BenchmarkId::from_parameter(queued), &queued, |b, &count| {
            let store = Arc::new(MemoryPageStore::new());
            let target = Arc::new(DeviceTarget::new(0, store, AlignmentPolicy::Any));
            let device = MemoryBlockDevice::new(1 << 16);
            let flusher = DelwriFlusher::new(FlusherConfig {
                flush_interval: std::time::Duration::from_secs(1),
                age_buffer: std::time::Duration::from_millis(0),
            });

            b.iter(|| {
                for i in 0..count {
                    let buf = pagebuf::buffer::Buffer::new(target.clone(), (i * PAGE_SIZE) as u64, PAGE_SIZE, PAGE_SIZE);
                    flusher.queue(buf);
                }
                black_box(flusher.run_once(&device));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_get_cold, bench_get_hot, bench_pin_unpin, bench_bucket_occupancy, bench_delwri_flush_pass);
criterion_main!(benches);
