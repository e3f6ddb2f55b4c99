//! Delayed-Write Flusher — ages and flushes dirty buffers, with
//! per-CPU I/O-completion worker pools.
//!
//! The daemon is a `tokio::time::sleep` loop driven by a `FlusherConfig`
//! with a `Default` impl, sized with `num_cpus`. The completion pools
//! are plain `std::thread` workers pulling off a `crossbeam::channel`,
//! modeling "interrupt context" as dedicated threads outside the async
//! runtime rather than as more `tokio` tasks.

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::object::{Buffer, BufferFlags};
use crate::block_io::BlockIoPort;

/// Tunable knobs exposed on the mount handle.
#[derive(Debug, Clone)]
pub struct FlusherConfig {
    /// Interval between delwri daemon wake-ups. Clamped to [0.5s, 30s].
    pub flush_interval: Duration,
    /// Minimum age before a dirty buffer is flushed. Clamped to [1s, 300s].
    pub age_buffer: Duration,
}

impl Default for FlusherConfig {
    fn default() -> Self {
        FlusherConfig { flush_interval: Duration::from_secs(1), age_buffer: Duration::from_secs(15) }
    }
}

impl FlusherConfig {
    pub fn clamped(mut self) -> Self {
        self.flush_interval = self.flush_interval.clamp(Duration::from_millis(500), Duration::from_secs(30));
        self.age_buffer = self.age_buffer.clamp(Duration::from_secs(1), Duration::from_secs(300));
        self
    }
}

#[derive(Debug, Default)]
pub struct FlusherStats {
    pub queued: AtomicU64,
    pub flushed: AtomicU64,
    pub failed: AtomicU64,
}

struct QueueEntry {
    buffer: Arc<Buffer>,
    queued_at: Instant,
}

/// The global delwri queue: strictly FIFO by enqueue time, which is what
/// lets the daemon stop scanning at the first non-expired entry.
struct DelwriQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
}

impl DelwriQueue {
    fn new() -> Self {
        DelwriQueue { entries: Mutex::new(VecDeque::new()) }
    }

    fn push(&self, buffer: Arc<Buffer>, now: Instant) {
        self.entries.lock().push_back(QueueEntry { buffer, queued_at: now });
    }

    /// Detaches every buffer at the front of the queue whose age has
    /// reached `age_buffer` (or unconditionally if `force`), stopping at
    /// the first buffer that isn't pinned, cond-lockable, and expired —
    /// matching the original's "stop on first non-expired entry".
    fn detach_ready(&self, age_buffer: Duration, force: bool, now: Instant) -> Vec<Arc<Buffer>> {
        let mut entries = self.entries.lock();
        let mut ready = Vec::new();
        while let Some(front) = entries.front() {
            if front.buffer.pin_count() > 0 {
                break;
            }
            let expired = force || now.duration_since(front.queued_at) >= age_buffer;
            if !expired {
                break;
            }
            if !front.buffer.trylock() {
                break;
            }
            let entry = entries.pop_front().unwrap();
            ready.push(entry.buffer);
        }
        ready
    }

    fn drain_all(&self) -> Vec<Arc<Buffer>> {
        self.entries.lock().drain(..).map(|e| e.buffer).collect()
    }

    fn retain_matching<F: Fn(&Buffer) -> bool>(&self, pred: F) -> Vec<Arc<Buffer>> {
        let mut entries = self.entries.lock();
        let mut matching = Vec::new();
        entries.retain(|e| {
            if pred(&e.buffer) {
                matching.push(e.buffer.clone());
                false
            } else {
                true
            }
        });
        matching
    }
}

/// Dispatches completion work to the per-CPU pool matching the CPU that
/// issued it, so cache lines stay local. "log" and "data" each get their
/// own instance since the workload shapes differ.
pub struct CompletionPool {
    senders: Vec<Sender<Box<dyn FnOnce() + Send>>>,
    _handles: Vec<std::thread::JoinHandle<()>>,
}

impl CompletionPool {
    pub fn new(name: &'static str) -> Self {
        let n = num_cpus::get().max(1);
        let mut senders = Vec::with_capacity(n);
        let mut handles = Vec::with_capacity(n);
        for worker_id in 0..n {
            let (tx, rx) = unbounded::<Box<dyn FnOnce() + Send>>();
            let handle = std::thread::Builder::new()
                .name(format!("pagebuf-{name}-completion-{worker_id}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("failed to spawn completion worker thread");
            senders.push(tx);
            handles.push(handle);
        }
        CompletionPool { senders, _handles: handles }
    }

    /// Dispatches `job` to the pool slot matching `cpu_hint`, localizing
    /// cache lines to the CPU that issued the I/O.
    pub fn dispatch(&self, cpu_hint: usize, job: Box<dyn FnOnce() + Send>) {
        let idx = cpu_hint % self.senders.len();
        let _ = self.senders[idx].send(job);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    Wait,
    TryLock,
}

/// The delayed-write flusher daemon.
pub struct DelwriFlusher {
    queue: Arc<DelwriQueue>,
    config: Mutex<FlusherConfig>,
    force_flush: Arc<AtomicBool>,
    stats: Arc<FlusherStats>,
    log_pool: Arc<CompletionPool>,
    data_pool: Arc<CompletionPool>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<tokio::sync::Notify>,
}

impl DelwriFlusher {
    pub fn new(config: FlusherConfig) -> Self {
        DelwriFlusher {
            queue: Arc::new(DelwriQueue::new()),
            config: Mutex::new(config.clamped()),
            force_flush: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(FlusherStats::default()),
            log_pool: Arc::new(CompletionPool::new("log")),
            data_pool: Arc::new(CompletionPool::new("data")),
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn stats(&self) -> Arc<FlusherStats> {
        self.stats.clone()
    }

    pub fn log_pool(&self) -> Arc<CompletionPool> {
        self.log_pool.clone()
    }

    pub fn data_pool(&self) -> Arc<CompletionPool> {
        self.data_pool.clone()
    }

    /// Queues a buffer for delayed write; marks it `DELWRI`.
    pub fn queue(&self, buffer: Arc<Buffer>) {
        if buffer.flags.contains(BufferFlags::DELWRI) {
            return;
        }
        buffer.flags.set(BufferFlags::DELWRI);
        self.queue.push(buffer, Instant::now());
        self.stats.queued.fetch_add(1, Ordering::Relaxed);
    }

    /// A caller-driven memory-pressure signal.
    pub fn request_force_flush(&self) {
        self.force_flush.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    pub fn wake_now(&self) {
        self.wake.notify_one();
    }

    /// Runs one pass of the daemon loop (step 2-5 of ), returning the
    /// number of buffers submitted.
    pub fn run_once(&self, block_io: &dyn BlockIoPort) -> usize {
        let force = self.force_flush.swap(false, Ordering::AcqRel);
        let age_buffer = self.config.lock().age_buffer;
        let ready = self.queue.detach_ready(age_buffer, force, Instant::now());
        for buffer in &ready {
            buffer.flags.clear(BufferFlags::DELWRI);
            buffer.flags.set(BufferFlags::WRITE);
            let _ = buffer.iorequest(block_io, crate::block_io::IoOp::Write);
            buffer.unlock();
            if buffer.has_error() {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.flushed.fetch_add(1, Ordering::Relaxed);
            }
        }
        block_io.flush_queues();
        ready.len()
    }

    /// Spawns the daemon loop as a background tokio task; call
    /// [`DelwriFlusher::shutdown`] to stop it.
    pub fn spawn(self: Arc<Self>, block_io: Arc<dyn BlockIoPort>) -> tokio::task::JoinHandle<()> {
        let this = self;
        tokio::spawn(async move {
            loop {
                if this.shutdown.load(Ordering::Acquire) {
                    return;
                }
                let interval = this.config.lock().flush_interval;
                let woke = this.wake.notified();
                tokio::select! {
                    _ = woke => {}
                    _ = tokio::time::sleep(interval) => {}
                }
                if this.shutdown.load(Ordering::Acquire) {
                    return;
                }
                this.run_once(block_io.as_ref());
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Explicit flush entry point: `WAIT` drains every matching
    /// buffer via `iowait` before returning; `TRYLOCK` detaches whatever
    /// is immediately lockable and returns without waiting.
    pub async fn flush(&self, mode: FlushMode, block_io: &dyn BlockIoPort) -> usize {
        match mode {
            FlushMode::TryLock => self.run_once(block_io),
            FlushMode::Wait => {
                let matching = self.queue.drain_all();
                let n = matching.len();
                for buffer in &matching {
                    buffer.lock().await;
                    buffer.flags.clear(BufferFlags::DELWRI);
                    buffer.flags.set(BufferFlags::WRITE);
                    let _ = buffer.iorequest(block_io, crate::block_io::IoOp::Write);
                    let _ = buffer.iowait().await;
                    buffer.unlock();
                    if buffer.has_error() {
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.stats.flushed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                block_io.flush_queues();
                n
            }
        }
    }

    /// Removes buffers matching `pred` from the queue without flushing
    /// them (used when a buffer is invalidated via `binval`).
    pub fn remove_matching<F: Fn(&Buffer) -> bool>(&self, pred: F) -> Vec<Arc<Buffer>> {
        let removed = self.queue.retain_matching(pred);
        for buffer in &removed {
            buffer.flags.clear(BufferFlags::DELWRI);
        }
        removed
    }
}
