//! The interface of the caching engine consumed by the front-end.
use std::num::NonZeroI32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::{fmt, mem};

use rustix::io::Errno;

use crate::request::{ReqFlags, Segment};

/// An error code reported by the caching engine.
///
/// Codes at or above [`EngineError::BASE`] are engine specific, smaller ones are plain errnos.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineError(NonZeroI32);

impl EngineError {
    pub const BASE: i32 = 1_000_000;

    pub const INVAL: Self = Self::engine(0);
    pub const INTR: Self = Self::engine(1);
    pub const NO_MEM: Self = Self::engine(2);
    pub const NOT_SUPP: Self = Self::engine(3);
    pub const IO: Self = Self::engine(4);
    pub const CACHE_NOT_AVAIL: Self = Self::engine(5);
    pub const CORE_NOT_AVAIL: Self = Self::engine(6);

    const fn engine(n: i32) -> Self {
        match NonZeroI32::new(Self::BASE + n) {
            Some(code) => Self(code),
            None => unreachable!(),
        }
    }

    #[must_use]
    pub fn from_errno(errno: Errno) -> Self {
        match NonZeroI32::new(errno.raw_os_error()) {
            Some(code) => Self(code),
            None => Self::IO,
        }
    }

    /// # Panics
    ///
    /// Panic if `code` is zero.
    #[must_use]
    pub fn from_raw(code: i32) -> Self {
        Self(NonZeroI32::new(code).expect("zero is not an error"))
    }

    #[must_use]
    pub fn raw(self) -> i32 {
        self.0.get()
    }

    /// Translate into the generic I/O error reported to callers.
    #[must_use]
    pub fn to_errno(self) -> Errno {
        match self {
            Self::NO_MEM => Errno::NOMEM,
            Self::INVAL => Errno::INVAL,
            Self::NOT_SUPP => Errno::OPNOTSUPP,
            Self::INTR => Errno::INTR,
            Self::CACHE_NOT_AVAIL | Self::CORE_NOT_AVAIL => Errno::NODEV,
            Self(code) if code.get() >= Self::BASE => Errno::IO,
            Self(code) => Errno::from_raw_os_error(code.get()),
        }
    }
}

impl fmt::Debug for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw() >= Self::BASE {
            write!(f, "EngineError({})", self.raw())
        } else {
            write!(f, "EngineError({:?})", self.to_errno())
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::INVAL => "invalid argument",
            Self::INTR => "interrupted",
            Self::NO_MEM => "out of memory",
            Self::NOT_SUPP => "not supported",
            Self::IO => "I/O error",
            Self::CACHE_NOT_AVAIL => "cache not available",
            Self::CORE_NOT_AVAIL => "core not available",
            _ if self.raw() >= Self::BASE => return write!(f, "engine error {}", self.raw()),
            _ => return self.to_errno().fmt(f),
        };
        f.write_str(name)
    }
}

impl std::error::Error for EngineError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// The allocation mode of engine-owned buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocMode {
    /// May block, but must not recurse into I/O.
    NoIo,
    /// Must not block.
    Atomic,
}

/// Parameters of a new engine submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoDesc {
    pub offset: u64,
    pub len: u64,
    pub dir: Direction,
    pub class: u32,
    pub flags: ReqFlags,
}

/// Completion callback of an engine submission.
pub type IoCompletion = Box<dyn FnOnce(Result<(), EngineError>) + Send>;

/// An engine submission object.
pub trait EngineIo: Send + 'static {
    fn set_data(&mut self, data: DataVec) -> Result<(), EngineError>;

    fn set_completion(&mut self, cmpl: IoCompletion);
}

/// A front volume of the caching engine.
///
/// Completions may be invoked from any thread, including synchronously inside a `submit_*`
/// call.
pub trait Volume: Send + Sync + 'static {
    type Io: EngineIo;

    /// The number of submission queues. Must be non-zero.
    fn nr_queues(&self) -> usize;

    /// The size of the volume in bytes.
    fn length(&self) -> u64;

    /// Create a new submission object on `queue`, or `None` if it cannot be allocated.
    fn new_io(&self, queue: usize, desc: IoDesc) -> Option<Self::Io>;

    /// Allocate a buffer descriptor holding up to `nr_segments` segments.
    fn alloc_data(&self, nr_segments: usize, mode: AllocMode) -> Option<DataVec> {
        let _ = mode;
        DataVec::try_with_capacity(nr_segments)
    }

    fn submit_io(&self, io: Self::Io);

    fn submit_discard(&self, io: Self::Io);

    fn submit_flush(&self, io: Self::Io);
}

/// An engine-owned scatter buffer descriptor with a fixed segment capacity.
#[derive(Debug)]
pub struct DataVec {
    segments: Vec<Segment>,
    capacity: usize,
}

impl DataVec {
    /// Allocate a descriptor for `capacity` segments, or `None` on allocation failure.
    #[must_use]
    pub fn try_with_capacity(capacity: usize) -> Option<Self> {
        let mut segments = Vec::new();
        segments.try_reserve_exact(capacity).ok()?;
        Some(Self { segments, capacity })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Total bytes of all segments.
    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.segments.iter().map(|seg| u64::from(seg.len())).sum()
    }

    /// # Panics
    ///
    /// Panic if the descriptor is full.
    pub fn push(&mut self, seg: Segment) {
        assert!(
            self.segments.len() < self.capacity,
            "segment count exceeds buffer capacity {}",
            self.capacity,
        );
        self.segments.push(seg);
    }

    /// Scatter `src` into the segments in order.
    ///
    /// # Panics
    ///
    /// Panic if `src` is not exactly as long as the descriptor.
    pub fn copy_from_slice(&self, mut src: &[u8]) {
        assert_eq!(src.len() as u64, self.len_bytes());
        for seg in &self.segments {
            let (head, rest) = src.split_at(seg.len() as usize);
            seg.copy_from(head);
            src = rest;
        }
    }

    /// Gather the segments into `dst` in order.
    ///
    /// # Panics
    ///
    /// Panic if `dst` is not exactly as long as the descriptor.
    pub fn copy_to_slice(&self, mut dst: &mut [u8]) {
        assert_eq!(dst.len() as u64, self.len_bytes());
        for seg in &self.segments {
            let (head, rest) = mem::take(&mut dst).split_at_mut(seg.len() as usize);
            seg.copy_to(head);
            dst = rest;
        }
    }
}

/// Selects the engine queue for a submission.
///
/// This is a locality hint only. Any queue in range is correct.
pub trait QueuePolicy: Send + Sync + fmt::Debug + 'static {
    fn select(&self, nr_queues: usize) -> usize;
}

/// Pick the queue bound to the processor performing the submission.
#[derive(Debug, Default, Clone, Copy)]
pub struct PerCpu;

impl QueuePolicy for PerCpu {
    fn select(&self, nr_queues: usize) -> usize {
        rustix::thread::sched_getcpu() % nr_queues
    }
}

#[derive(Debug, Default)]
pub struct RoundRobin(AtomicUsize);

impl QueuePolicy for RoundRobin {
    fn select(&self, nr_queues: usize) -> usize {
        self.0.fetch_add(1, Ordering::Relaxed) % nr_queues
    }
}

/// Always pick the same queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fixed(pub usize);

impl QueuePolicy for Fixed {
    fn select(&self, nr_queues: usize) -> usize {
        self.0 % nr_queues
    }
}
