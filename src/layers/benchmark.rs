//! Benchmark layer
//!
//! Forwards every operation unchanged while sampling wall-clock latency.
//! Every `reps` operations the collected per-operation statistics
//! (count, min/avg/max latency) are logged and the interval restarts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::layer::{
    DirEntry, Fd, FileStat, Layer, LayerRef, LayerResult, OpContext, OpenFlags,
};

#[derive(Debug, Clone, Copy)]
struct OpSample {
    count: u64,
    total: Duration,
    min: Duration,
    max: Duration,
}

impl OpSample {
    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.min = self.min.min(elapsed);
        self.max = self.max.max(elapsed);
    }
}

impl Default for OpSample {
    fn default() -> Self {
        OpSample {
            count: 0,
            total: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
        }
    }
}

/// Latency sampling pass-through.
#[derive(Debug)]
pub struct BenchmarkLayer {
    next: [LayerRef; 1],
    reps: u64,
    samples: Mutex<HashMap<&'static str, OpSample>>,
    since_report: AtomicU64,
}

impl BenchmarkLayer {
    pub fn new(next: LayerRef, reps: u64) -> Self {
        BenchmarkLayer {
            next: [next],
            reps: reps.max(1),
            samples: Mutex::new(HashMap::new()),
            since_report: AtomicU64::new(0),
        }
    }

    fn next(&self) -> &LayerRef {
        &self.next[0]
    }

    fn sample<T>(&self, op: &'static str, call: impl FnOnce() -> LayerResult<T>) -> LayerResult<T> {
        let started = Instant::now();
        let result = call();
        let elapsed = started.elapsed();

        self.samples.lock().entry(op).or_default().record(elapsed);

        if (self.since_report.fetch_add(1, Ordering::Relaxed) + 1) % self.reps == 0 {
            self.report();
        }
        result
    }

    fn report(&self) {
        let mut samples = self.samples.lock();
        for (op, s) in samples.iter() {
            if s.count == 0 {
                continue;
            }
            log::info!(
                "[BENCHMARK] {op}: {} ops, min {:?}, avg {:?}, max {:?}",
                s.count,
                s.min,
                s.total / s.count as u32,
                s.max
            );
        }
        samples.clear();
    }
}

impl Layer for BenchmarkLayer {
    fn kind(&self) -> &'static str {
        "benchmark"
    }

    fn children(&self) -> &[LayerRef] {
        &self.next
    }

    fn open(&self, ctx: &OpContext, path: &str, flags: OpenFlags, mode: u32) -> LayerResult<Fd> {
        self.sample("open", || self.next().open(ctx, path, flags, mode))
    }

    fn close(&self, ctx: &OpContext, fd: Fd) -> LayerResult<()> {
        self.sample("close", || self.next().close(ctx, fd))
    }

    fn pread(&self, ctx: &OpContext, fd: Fd, buf: &mut [u8], offset: u64) -> LayerResult<usize> {
        self.sample("pread", || self.next().pread(ctx, fd, buf, offset))
    }

    fn pwrite(&self, ctx: &OpContext, fd: Fd, buf: &[u8], offset: u64) -> LayerResult<usize> {
        self.sample("pwrite", || self.next().pwrite(ctx, fd, buf, offset))
    }

    fn ftruncate(&self, ctx: &OpContext, fd: Fd, len: u64) -> LayerResult<()> {
        self.sample("ftruncate", || self.next().ftruncate(ctx, fd, len))
    }

    fn truncate(&self, ctx: &OpContext, path: &str, len: u64) -> LayerResult<()> {
        self.sample("truncate", || self.next().truncate(ctx, path, len))
    }

    fn lstat(&self, ctx: &OpContext, path: &str) -> LayerResult<FileStat> {
        self.sample("lstat", || self.next().lstat(ctx, path))
    }

    fn fstat(&self, ctx: &OpContext, fd: Fd) -> LayerResult<FileStat> {
        self.sample("fstat", || self.next().fstat(ctx, fd))
    }

    fn unlink(&self, ctx: &OpContext, path: &str) -> LayerResult<()> {
        self.sample("unlink", || self.next().unlink(ctx, path))
    }

    fn fsync(&self, ctx: &OpContext, fd: Fd, datasync: bool) -> LayerResult<()> {
        self.sample("fsync", || self.next().fsync(ctx, fd, datasync))
    }

    fn readdir(&self, ctx: &OpContext, path: &str) -> LayerResult<Vec<DirEntry>> {
        self.sample("readdir", || self.next().readdir(ctx, path))
    }

    fn rename(&self, ctx: &OpContext, from: &str, to: &str) -> LayerResult<()> {
        self.sample("rename", || self.next().rename(ctx, from, to))
    }

    fn chmod(&self, ctx: &OpContext, path: &str, mode: u32) -> LayerResult<()> {
        self.sample("chmod", || self.next().chmod(ctx, path, mode))
    }

    fn destroy(&self) {
        self.report();
        self.next().destroy();
    }
}
