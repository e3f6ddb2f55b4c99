// Log Engine Performance Benchmarks
// Tests the reservation/write/force pipeline and transaction commit
// throughput, the two operations sitting squarely on the crate's
// critical write path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pagebuf::ail::Ail;
use pagebuf::block_io::MemoryBlockDevice;
use pagebuf::buffer::{AlignmentPolicy, DelwriFlusher, DeviceTarget, FlusherConfig};
use pagebuf::log::ticket::LogClient;
use pagebuf::log::{ForceMode, LogEngine};
use pagebuf::log_item::buf_item::BufferLogItem;
use pagebuf::page_store::{MemoryPageStore, PAGE_SIZE};
use pagebuf::transaction::{Transaction, TRANS_TYPE_GENERIC};
use rand::Rng;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    (0..len).map(|_| rng.random()).collect()
}

fn create_engine() -> (Runtime, LogEngine, Arc<Ail>) {
    let rt = Runtime::new().unwrap();
    let device = Arc::new(MemoryBlockDevice::new(1 << 16));
    let ail = Ail::new();
    let log = LogEngine::new(device, ail.clone(), 0, 16384, 8, 32 * 1024);
    (rt, log, ail)
}

fn bench_reserve(c: &mut Criterion) {
    let (_rt, log, _ail) = create_engine();
    c.bench_function("log_reserve", |b| {
        b.iter(|| {
            let ticket = log.reserve(black_box(256), LogClient::Transaction, false).unwrap();
            log.done(&ticket, true);
        });
    });
}

fn bench_write_no_force(c: &mut Criterion) {
    let (_rt, log, _ail) = create_engine();
    let ticket = log.reserve(16384, LogClient::Transaction, true).unwrap();
    let region = random_bytes(256);

    c.bench_function("log_write_no_force", |b| {
        b.iter(|| {
            black_box(log.write(&ticket, &[region.clone()], false));
        });
    });
}

fn bench_force_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_force_sync");

    for region_len in [64usize, 1024, 8192] {
        group.bench_with_input(BenchmarkId::from_parameter(region_len), &region_len, |b, &len| {
            let (rt, log, _ail) = create_engine();
            let region = random_bytes(len);
            b.iter(|| {
                let ticket = log.reserve(len, LogClient::Transaction, false).unwrap();
                log.write(&ticket, &[region.clone()], true);
                log.done(&ticket, true);
                black_box(rt.block_on(log.force(ForceMode::Sync)));
            });
        });
    }

    group.finish();
}

fn bench_transaction_commit(c: &mut Criterion) {
    let (rt, log, ail) = create_engine();
    let store = Arc::new(MemoryPageStore::new());
    let target = Arc::new(DeviceTarget::new(0, store, AlignmentPolicy::Any));
    let flusher = Arc::new(DelwriFlusher::new(FlusherConfig::default()));

    c.bench_function("transaction_commit", |b| {
        b.iter(|| {
            let buf = pagebuf::buffer::Buffer::new(target.clone(), 0, PAGE_SIZE, PAGE_SIZE);
            buf.associate_memory(vec![0u8; PAGE_SIZE]);
            let item = BufferLogItem::new(buf, flusher.clone(), ail.clone());

            let txn = Transaction::alloc(&log, &ail, TRANS_TYPE_GENERIC, 512, false).unwrap();
            txn.log_buf(&item, 0, 127);
            black_box(rt.block_on(txn.commit(false)).unwrap());
        });
    });
}

criterion_group!(benches, bench_reserve, bench_write_no_force, bench_force_sync, bench_transaction_commit);
criterion_main!(benches);
