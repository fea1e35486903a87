//! A scripted engine and registration layer logging every call.
#![allow(dead_code)]
use std::fmt::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use casblk_front::{
    AllocMode, DataVec, DeviceOps, EngineError, EngineIo, Error, ExportedObject, Fixed,
    FrontParams, Frontend, Geometry, IoCompletion, IoDesc, Page, QueueLimits, Sector, Segment,
    Volume, PAGE_SIZE,
};
use parking_lot::Mutex;
use rustix::io::Errno;

macro_rules! act {
    ($this:expr, $($tt:tt)*) => {
        write!(*$this.log.lock(), "{};", format_args!($($tt)*)).unwrap()
    };
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Io,
    Discard,
    Flush,
}

/// A submission held back until the test completes it.
pub struct Pending {
    pub kind: Kind,
    pub desc: IoDesc,
    pub data: Option<DataVec>,
    cmpl: IoCompletion,
}

impl Pending {
    pub fn complete(self, ret: Result<(), EngineError>) {
        (self.cmpl)(ret);
    }
}

pub struct MockIo {
    desc: IoDesc,
    fail_set_data: bool,
    data: Option<DataVec>,
    cmpl: Option<IoCompletion>,
}

impl EngineIo for MockIo {
    fn set_data(&mut self, data: DataVec) -> Result<(), EngineError> {
        if self.fail_set_data {
            return Err(EngineError::NOT_SUPP);
        }
        self.data = Some(data);
        Ok(())
    }

    fn set_completion(&mut self, cmpl: IoCompletion) {
        self.cmpl = Some(cmpl);
    }
}

/// Index of the call at which an operation fails.
#[derive(Debug, Default)]
pub struct Faults {
    pub new_io: Option<usize>,
    pub alloc: Option<usize>,
    pub set_data: Option<usize>,
}

#[derive(Debug, Default)]
struct Counters {
    new_io: usize,
    alloc: usize,
}

#[derive(Default)]
pub struct MockVolume {
    pub log: Mutex<String>,
    pub faults: Mutex<Faults>,
    counters: Mutex<Counters>,
    pending: Mutex<Vec<Pending>>,
    /// Complete every submission synchronously inside `submit_*` with this result.
    pub inline: Mutex<Option<Result<(), EngineError>>>,
}

impl MockVolume {
    pub fn drain_log(&self) -> String {
        std::mem::take(&mut *self.log.lock())
    }

    pub fn take_pending(&self) -> Vec<Pending> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn submit(&self, kind: Kind, io: MockIo) {
        let cmpl = io.cmpl.expect("submitted without completion");
        let pending = Pending {
            kind,
            desc: io.desc,
            data: io.data,
            cmpl,
        };
        let inline = *self.inline.lock();
        match inline {
            Some(ret) => pending.complete(ret),
            None => self.pending.lock().push(pending),
        }
    }
}

impl Volume for MockVolume {
    type Io = MockIo;

    fn nr_queues(&self) -> usize {
        2
    }

    fn length(&self) -> u64 {
        1 << 30
    }

    fn new_io(&self, queue: usize, desc: IoDesc) -> Option<MockIo> {
        let idx = {
            let mut counters = self.counters.lock();
            counters.new_io += 1;
            counters.new_io - 1
        };
        let faults = self.faults.lock();
        if faults.new_io == Some(idx) {
            act!(self, "new_io_fail({queue})");
            return None;
        }
        Some(MockIo {
            desc,
            fail_set_data: faults.set_data == Some(idx),
            data: None,
            cmpl: None,
        })
    }

    fn alloc_data(&self, nr_segments: usize, mode: AllocMode) -> Option<DataVec> {
        let idx = {
            let mut counters = self.counters.lock();
            counters.alloc += 1;
            counters.alloc - 1
        };
        if self.faults.lock().alloc == Some(idx) {
            act!(self, "alloc_fail({mode:?})");
            return None;
        }
        DataVec::try_with_capacity(nr_segments)
    }

    fn submit_io(&self, io: MockIo) {
        act!(self, "io({}, {}, {:?})", io.desc.offset, io.desc.len, io.desc.dir);
        self.submit(Kind::Io, io);
    }

    fn submit_discard(&self, io: MockIo) {
        act!(self, "discard({}, {})", io.desc.offset, io.desc.len);
        self.submit(Kind::Discard, io);
    }

    fn submit_flush(&self, io: MockIo) {
        act!(self, "flush()");
        self.submit(Kind::Flush, io);
    }
}

struct ObjectInner {
    tag: String,
    log: Arc<Mutex<String>>,
    backing: QueueLimits,
    create_err: Mutex<Option<Error>>,
    lock_err: Mutex<Option<Errno>>,
    destroy_err: Mutex<Option<Errno>>,
    geometry: Mutex<Option<QueueLimits>>,
}

/// A registration layer sharing its action log with sibling objects.
#[derive(Clone)]
pub struct MockObject(Arc<ObjectInner>);

impl MockObject {
    pub fn new(tag: impl Into<String>, log: Arc<Mutex<String>>) -> Self {
        Self(Arc::new(ObjectInner {
            tag: tag.into(),
            log,
            backing: QueueLimits {
                capacity: Sector(1 << 21),
                physical_block_size: 4096,
                io_min: 4096,
                ..QueueLimits::new()
            },
            create_err: Mutex::new(None),
            lock_err: Mutex::new(None),
            destroy_err: Mutex::new(None),
            geometry: Mutex::new(None),
        }))
    }

    pub fn fail_create(&self, err: Error) {
        *self.0.create_err.lock() = Some(err);
    }

    pub fn fail_lock(&self, err: Option<Errno>) {
        *self.0.lock_err.lock() = err;
    }

    pub fn fail_destroy(&self, err: Option<Errno>) {
        *self.0.destroy_err.lock() = err;
    }

    pub fn geometry(&self) -> Option<QueueLimits> {
        self.0.geometry.lock().clone()
    }
}

impl ExportedObject for MockObject {
    fn create(&self, name: &str, ops: Arc<dyn DeviceOps>) -> Result<(), Error> {
        let this = &self.0;
        if let Some(err) = this.create_err.lock().take() {
            act!(this, "create_fail({})", this.tag);
            return Err(err);
        }
        *this.geometry.lock() = Some(ops.set_geometry(&this.backing)?);
        act!(this, "create({}, {name})", this.tag);
        Ok(())
    }

    fn destroy(&self) -> Result<(), Errno> {
        let this = &self.0;
        act!(this, "destroy({})", this.tag);
        this.destroy_err.lock().map_or(Ok(()), Err)
    }

    fn lock(&self) -> Result<(), Errno> {
        let this = &self.0;
        act!(this, "lock({})", this.tag);
        this.lock_err.lock().map_or(Ok(()), Err)
    }

    fn unlock(&self) {
        act!(self.0, "unlock({})", self.0.tag);
    }

    fn cleanup(&self) {
        act!(self.0, "cleanup({})", self.0.tag);
    }
}

pub const SMALL_PARAMS: FrontParams = FrontParams {
    max_io_size: 64 << 10,
    split_alignment: 16 << 10,
    io_flusher: false,
};

pub fn frontend(name: &str, params: FrontParams) -> (Frontend<MockVolume>, Arc<MockVolume>) {
    let volume = Arc::new(MockVolume::default());
    let front = Frontend::new(name, volume.clone(), Geometry::Cache, params)
        .unwrap()
        .with_queue_policy(Fixed(1));
    (front, volume)
}

/// Deterministic content of byte `pos` of the device.
pub fn pattern(pos: u64) -> u8 {
    (pos % 251) as u8
}

/// A scatter list over fresh pages holding the pattern of `[offset, offset + len)`.
pub fn segments(offset: u64, len: u64) -> Vec<Segment> {
    let mut segs = Vec::new();
    let mut pos = offset;
    while pos < offset + len {
        let n = (offset + len - pos).min(PAGE_SIZE as u64);
        let data = (pos..pos + n).map(pattern).collect::<Vec<_>>();
        segs.push(Segment::new(Page::from_slice(&data), 0, n as u32));
        pos += n;
    }
    segs
}

pub type DoneLog = Arc<Mutex<Vec<(u64, Result<(), Errno>)>>>;

pub fn done_log() -> DoneLog {
    DoneLog::default()
}

pub fn record(log: &DoneLog) -> impl FnOnce(u64, Result<(), Errno>) + Send + 'static {
    let log = log.clone();
    move |len, ret| log.lock().push((len, ret))
}

/// Poll until `f` holds, or panic after a few seconds.
pub fn wait_until(mut f: impl FnMut() -> bool) {
    const TIMEOUT: Duration = Duration::from_secs(5);
    let start = Instant::now();
    while !f() {
        assert!(start.elapsed() < TIMEOUT, "timed out");
        std::thread::sleep(Duration::from_millis(1));
    }
}
