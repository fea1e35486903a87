//! A randomized workload verified against a shadow copy of the device content.
//!
//! Each worker owns a disjoint region of one device, so the expected content is known exactly
//! without any coordination between workers.
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use casblk_front::{ExecContext, ReqFlags};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::memory_disk::DiskHandle;

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub duration: Duration,
    pub seed: u64,
    /// Workers per device.
    pub threads: usize,
    /// The largest request issued. Should be above the split size to exercise splitting.
    pub max_request: u64,
}

#[derive(Debug, Default)]
pub struct Stats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub flushes: AtomicU64,
    pub discards: AtomicU64,
    pub atomic: AtomicU64,
    pub bytes: AtomicU64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let get = |n: &AtomicU64| n.load(Ordering::Relaxed);
        write!(
            f,
            "{} reads, {} writes, {} flushes, {} discards ({} from atomic context), {} transferred",
            get(&self.reads),
            get(&self.writes),
            get(&self.flushes),
            get(&self.discards),
            get(&self.atomic),
            bytesize::ByteSize(get(&self.bytes)),
        )
    }
}

/// Run workers over all `disks` until `duration` passes or `stop` is set.
///
/// Any data mismatch or request failure aborts the run with an error.
pub async fn run(
    disks: Vec<Arc<DiskHandle>>,
    opts: Options,
    stop: Arc<AtomicBool>,
) -> Result<Stats> {
    ensure!(opts.threads != 0, "at least one worker is required");
    let stats = Arc::new(Stats::default());
    let deadline = Instant::now() + opts.duration;

    let mut workers = tokio::task::JoinSet::new();
    for (disk_idx, disk) in disks.iter().enumerate() {
        let lbs = u64::from(disk.limits().logical_block_size);
        let region = disk.size() / opts.threads as u64 / lbs * lbs;
        ensure!(
            region != 0,
            "device {} is too small for {} workers",
            disk.name(),
            opts.threads,
        );
        for i in 0..opts.threads {
            let worker = Worker {
                disk: disk.clone(),
                start: region * i as u64,
                shadow: vec![0u8; region as usize],
                lbs,
                max_request: opts.max_request.min(region),
                rng: StdRng::seed_from_u64(opts.seed ^ (((disk_idx as u64) << 32) | i as u64)),
                stats: stats.clone(),
            };
            let stop = stop.clone();
            workers.spawn(worker.run(deadline, stop));
        }
    }
    // Release our references so devices can be stopped right after the workers exit.
    drop(disks);

    while let Some(ret) = workers.join_next().await {
        if let Err(err) = ret.context("worker panicked").and_then(|ret| ret) {
            workers.shutdown().await;
            return Err(err);
        }
    }
    Ok(Arc::into_inner(stats).unwrap_or_default())
}

struct Worker {
    disk: Arc<DiskHandle>,
    start: u64,
    shadow: Vec<u8>,
    lbs: u64,
    max_request: u64,
    rng: StdRng,
    stats: Arc<Stats>,
}

impl Worker {
    async fn run(mut self, deadline: Instant, stop: Arc<AtomicBool>) -> Result<()> {
        // Devices start zeroed. Verify the whole region at the beginning and the end.
        self.verify(0, self.shadow.len() as u64).await?;
        while Instant::now() < deadline && !stop.load(Ordering::Relaxed) {
            match self.rng.random_range(0..10) {
                0..=3 => self.write().await?,
                4..=7 => {
                    let (off, len) = self.range();
                    self.verify(off, len).await?;
                }
                8 => self.discard().await?,
                _ => self.flush().await?,
            }
        }
        self.verify(0, self.shadow.len() as u64).await
    }

    /// A random block aligned range inside the region, relative to its start.
    fn range(&mut self) -> (u64, u64) {
        let blocks = self.shadow.len() as u64 / self.lbs;
        // Mostly small requests, with occasional large ones hitting the split path.
        let max_blocks = if self.rng.random_bool(0.1) {
            self.max_request / self.lbs
        } else {
            (64 << 10) / self.lbs
        };
        let len = self.rng.random_range(1..=max_blocks.clamp(1, blocks));
        let off = self.rng.random_range(0..=blocks - len);
        (off * self.lbs, len * self.lbs)
    }

    fn context(&mut self) -> ExecContext {
        if self.rng.random_bool(0.2) {
            self.stats.atomic.fetch_add(1, Ordering::Relaxed);
            ExecContext::Atomic
        } else {
            ExecContext::Task
        }
    }

    async fn write(&mut self) -> Result<()> {
        let (off, len) = self.range();
        let range = off as usize..(off + len) as usize;
        self.rng.fill(&mut self.shadow[range.clone()]);
        let mut flags = ReqFlags::empty();
        if self.rng.random_bool(0.1) {
            flags |= ReqFlags::Preflush;
        }
        if self.rng.random_bool(0.1) {
            flags |= ReqFlags::Fua;
        }
        let ctx = self.context();
        self.disk
            .write(self.start + off, &self.shadow[range], flags, ctx)
            .await
            .with_context(|| format!("failed to write {}@{}", len, self.start + off))?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    async fn verify(&mut self, off: u64, len: u64) -> Result<()> {
        let ctx = self.context();
        let got = self
            .disk
            .read(self.start + off, len as usize, ctx)
            .await
            .with_context(|| format!("failed to read {}@{}", len, self.start + off))?;
        let expect = &self.shadow[off as usize..(off + len) as usize];
        if let Some(pos) = got.iter().zip(expect).position(|(a, b)| a != b) {
            anyhow::bail!(
                "data mismatch on {} at byte {}",
                self.disk.name(),
                self.start + off + pos as u64,
            );
        }
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    async fn discard(&mut self) -> Result<()> {
        if self.disk.limits().discard.is_none() {
            return self.flush().await;
        }
        let (off, len) = self.range();
        let ctx = self.context();
        self.disk
            .discard(self.start + off, len, ctx)
            .await
            .with_context(|| format!("failed to discard {}@{}", len, self.start + off))?;
        self.shadow[off as usize..(off + len) as usize].fill(0);
        self.stats.discards.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let ctx = self.context();
        self.disk.flush(ctx).await.context("failed to flush")?;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
