//! An in-memory caching engine.
//!
//! Each volume keeps its content as sparse fixed-size lines, absent lines read as zeroes. Core
//! volumes of a cache share one [`LineCache`] holding the most recently used lines.
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use casblk_front::{
    DataVec, Direction, EngineError, EngineIo, IoCompletion, IoDesc, ReqFlags, Volume,
};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Where engine completions run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// Synchronously inside the submission.
    Inline,
    /// On a tokio runtime after a random delay, so completions arrive out of order.
    #[default]
    Threaded,
}

/// Recently used lines of all volumes of one cache, keyed by `(volume id, line index)`.
pub struct LineCache {
    lines: Mutex<LruCache<(u16, u64), Bytes>>,
}

impl fmt::Debug for LineCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = self.lines.lock();
        f.debug_struct("LineCache")
            .field("len", &lines.len())
            .field("cap", &lines.cap())
            .finish()
    }
}

impl LineCache {
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            lines: Mutex::new(LruCache::new(capacity)),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct Accounting {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub discards: AtomicU64,
    pub flushes: AtomicU64,
    pub line_hits: AtomicU64,
    pub line_misses: AtomicU64,
    pub errors: AtomicU64,
}

impl fmt::Display for Accounting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let get = |n: &AtomicU64| n.load(Ordering::Relaxed);
        write!(
            f,
            "reads={} writes={} discards={} flushes={} line_hits={} line_misses={} errors={}",
            get(&self.reads),
            get(&self.writes),
            get(&self.discards),
            get(&self.flushes),
            get(&self.line_hits),
            get(&self.line_misses),
            get(&self.errors),
        )
    }
}

#[derive(Debug)]
struct Store {
    id: u16,
    length: u64,
    line_size: u64,
    lines: RwLock<HashMap<u64, Bytes>>,
    /// Serializes read-modify-write of partially covered lines.
    update: Mutex<()>,
    cache: Option<Arc<LineCache>>,
    accounting: Accounting,
}

impl Store {
    fn stored_line(&self, idx: u64) -> Bytes {
        let line = self.lines.read().get(&idx).cloned();
        line.unwrap_or_else(|| Bytes::from(vec![0u8; self.line_size as usize]))
    }

    // The shared cache lock is always taken before `lines`, and held while both are updated.
    fn line(&self, idx: u64) -> Bytes {
        let Some(cache) = &self.cache else {
            return self.stored_line(idx);
        };
        let mut cached = cache.lines.lock();
        if let Some(line) = cached.get(&(self.id, idx)) {
            self.accounting.line_hits.fetch_add(1, Ordering::Relaxed);
            return line.clone();
        }
        self.accounting.line_misses.fetch_add(1, Ordering::Relaxed);
        let line = self.stored_line(idx);
        cached.put((self.id, idx), line.clone());
        line
    }

    fn set_line(&self, idx: u64, line: Option<Bytes>) {
        let mut cached = self.cache.as_ref().map(|cache| cache.lines.lock());
        if let Some(cached) = &mut cached {
            match &line {
                Some(line) => {
                    cached.put((self.id, idx), line.clone());
                }
                None => {
                    cached.pop(&(self.id, idx));
                }
            }
        }
        let mut lines = self.lines.write();
        match line {
            Some(line) => lines.insert(idx, line),
            None => lines.remove(&idx),
        };
    }

    /// Iterate `(line index, offset in line, length, offset in buffer)` covering
    /// `[offset, offset + len)`.
    fn spans(&self, offset: u64, len: u64) -> impl Iterator<Item = (u64, usize, usize, usize)> {
        let line_size = self.line_size;
        let end = offset + len;
        (offset / line_size..end.div_ceil(line_size)).map(move |idx| {
            let line_start = idx * line_size;
            let start = offset.max(line_start);
            let stop = end.min(line_start + line_size);
            (
                idx,
                (start - line_start) as usize,
                (stop - start) as usize,
                (start - offset) as usize,
            )
        })
    }

    fn check_range(&self, desc: &IoDesc) -> Result<(), EngineError> {
        match desc.offset.checked_add(desc.len) {
            Some(end) if end <= self.length => Ok(()),
            _ => {
                tracing::warn!(
                    volume = self.id,
                    offset = desc.offset,
                    len = desc.len,
                    "request out of range"
                );
                Err(EngineError::INVAL)
            }
        }
    }

    fn read(&self, offset: u64, len: u64) -> Vec<u8> {
        let mut buf = vec![0u8; len as usize];
        for (idx, in_line, n, pos) in self.spans(offset, len) {
            buf[pos..pos + n].copy_from_slice(&self.line(idx)[in_line..in_line + n]);
        }
        buf
    }

    fn write(&self, offset: u64, data: &[u8]) {
        let _update = self.update.lock();
        for (idx, in_line, n, pos) in self.spans(offset, data.len() as u64) {
            let mut line = if n as u64 == self.line_size {
                BytesMut::zeroed(n)
            } else {
                BytesMut::from(&self.line(idx)[..])
            };
            line[in_line..in_line + n].copy_from_slice(&data[pos..pos + n]);
            self.set_line(idx, Some(line.freeze()));
        }
    }

    fn discard(&self, offset: u64, len: u64) {
        let _update = self.update.lock();
        for (idx, in_line, n, _) in self.spans(offset, len) {
            if n as u64 == self.line_size {
                self.set_line(idx, None);
            } else {
                let mut line = BytesMut::from(&self.line(idx)[..]);
                line[in_line..in_line + n].fill(0);
                self.set_line(idx, Some(line.freeze()));
            }
        }
    }

    fn execute(&self, kind: Kind, desc: &IoDesc, data: Option<&DataVec>) -> Result<(), EngineError> {
        match kind {
            Kind::Flush => {
                self.accounting.flushes.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Kind::Discard => {
                self.check_range(desc)?;
                self.accounting.discards.fetch_add(1, Ordering::Relaxed);
                self.discard(desc.offset, desc.len);
                return Ok(());
            }
            Kind::Io => {}
        }
        self.check_range(desc)?;
        let data = data.ok_or(EngineError::INVAL)?;
        match desc.dir {
            Direction::Read => {
                self.accounting.reads.fetch_add(1, Ordering::Relaxed);
                data.copy_from_slice(&self.read(desc.offset, desc.len));
            }
            Direction::Write => {
                self.accounting.writes.fetch_add(1, Ordering::Relaxed);
                let mut buf = vec![0u8; desc.len as usize];
                data.copy_to_slice(&mut buf);
                self.write(desc.offset, &buf);
                if desc.flags.contains(ReqFlags::Fua) {
                    self.accounting.flushes.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Io,
    Discard,
    Flush,
}

#[derive(Debug, Clone)]
enum Completion {
    Inline,
    Threaded {
        handle: tokio::runtime::Handle,
        max_delay: Duration,
    },
}

pub struct MemoryIo {
    desc: IoDesc,
    data: Option<DataVec>,
    cmpl: Option<IoCompletion>,
}

impl fmt::Debug for MemoryIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryIo")
            .field("desc", &self.desc)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

impl EngineIo for MemoryIo {
    fn set_data(&mut self, data: DataVec) -> Result<(), EngineError> {
        if data.len_bytes() != self.desc.len {
            return Err(EngineError::INVAL);
        }
        self.data = Some(data);
        Ok(())
    }

    fn set_completion(&mut self, cmpl: IoCompletion) {
        self.cmpl = Some(cmpl);
    }
}

/// A volume of the in-memory engine.
#[derive(Debug)]
pub struct MemoryVolume {
    store: Arc<Store>,
    queue_submits: Box<[AtomicU64]>,
    completion: Completion,
}

impl MemoryVolume {
    /// # Panics
    ///
    /// Panic if `line_size` is not a power of two or `nr_queues` is zero.
    #[must_use]
    pub fn new(id: u16, length: u64, line_size: u32, nr_queues: usize) -> Self {
        assert!(line_size.is_power_of_two());
        assert_ne!(nr_queues, 0);
        Self {
            store: Arc::new(Store {
                id,
                length,
                line_size: line_size.into(),
                lines: RwLock::default(),
                update: Mutex::new(()),
                cache: None,
                accounting: Accounting::default(),
            }),
            queue_submits: (0..nr_queues).map(|_| AtomicU64::new(0)).collect(),
            completion: Completion::Inline,
        }
    }

    #[must_use]
    pub fn with_line_cache(mut self, cache: Arc<LineCache>) -> Self {
        Arc::get_mut(&mut self.store)
            .expect("not shared yet")
            .cache = Some(cache);
        self
    }

    /// Complete on `handle` after a random delay up to `max_delay`.
    #[must_use]
    pub fn with_threaded_completion(
        mut self,
        handle: tokio::runtime::Handle,
        max_delay: Duration,
    ) -> Self {
        self.completion = Completion::Threaded { handle, max_delay };
        self
    }

    #[must_use]
    pub fn accounting(&self) -> &Accounting {
        &self.store.accounting
    }

    /// Submissions per queue.
    #[must_use]
    pub fn queue_submits(&self) -> Vec<u64> {
        self.queue_submits
            .iter()
            .map(|n| n.load(Ordering::Relaxed))
            .collect()
    }

    /// Read the content directly, bypassing the request path.
    #[must_use]
    pub fn peek(&self, offset: u64, len: u64) -> Vec<u8> {
        self.store.read(offset, len)
    }

    fn execute(&self, kind: Kind, io: MemoryIo) {
        let MemoryIo { desc, data, cmpl } = io;
        let Some(cmpl) = cmpl else {
            tracing::error!(volume = self.store.id, ?desc, "submitted without completion");
            return;
        };
        let store = self.store.clone();
        let run = move || {
            let ret = store.execute(kind, &desc, data.as_ref());
            if ret.is_err() {
                store.accounting.errors.fetch_add(1, Ordering::Relaxed);
            }
            cmpl(ret);
        };
        match &self.completion {
            Completion::Inline => run(),
            Completion::Threaded { handle, max_delay } => {
                let delay = rand::rng().random_range(Duration::ZERO..=*max_delay);
                handle.spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    run();
                });
            }
        }
    }
}

impl Volume for MemoryVolume {
    type Io = MemoryIo;

    fn nr_queues(&self) -> usize {
        self.queue_submits.len()
    }

    fn length(&self) -> u64 {
        self.store.length
    }

    fn new_io(&self, queue: usize, desc: IoDesc) -> Option<MemoryIo> {
        self.queue_submits[queue].fetch_add(1, Ordering::Relaxed);
        Some(MemoryIo {
            desc,
            data: None,
            cmpl: None,
        })
    }

    fn submit_io(&self, io: MemoryIo) {
        self.execute(Kind::Io, io);
    }

    fn submit_discard(&self, io: MemoryIo) {
        self.execute(Kind::Discard, io);
    }

    fn submit_flush(&self, io: MemoryIo) {
        self.execute(Kind::Flush, io);
    }
}
