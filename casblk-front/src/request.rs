use std::sync::Arc;
use std::{fmt, mem};

use parking_lot::Mutex;
use rustix::io::Errno;

/// The fixed capacity of a single scatter segment.
pub const PAGE_SIZE: usize = 4 << 10;

/// A shared fixed-capacity memory page backing one or more [`Segment`]s.
#[derive(Clone)]
pub struct Page(Arc<Mutex<Box<[u8]>>>);

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Page")
            .field(&format_args!("{:p}", Arc::as_ptr(&self.0)))
            .finish()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl Page {
    /// Allocate a zeroed page.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(vec![0u8; PAGE_SIZE].into_boxed_slice())))
    }

    /// Allocate a page with `data` copied to its start, zero padded.
    ///
    /// # Panics
    ///
    /// Panic if `data` does not fit in a page.
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        assert!(data.len() <= PAGE_SIZE);
        let page = Self::new();
        page.0.lock()[..data.len()].copy_from_slice(data);
        page
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A `(page, offset, len)` slice of memory in a scatter list.
#[derive(Debug, Clone)]
pub struct Segment {
    page: Page,
    offset: u32,
    len: u32,
}

impl Segment {
    /// # Panics
    ///
    /// Panic if `len` is zero or the range exceeds the page.
    #[must_use]
    pub fn new(page: Page, offset: u32, len: u32) -> Self {
        assert!(len != 0, "empty segment");
        assert!(
            offset as usize + len as usize <= PAGE_SIZE,
            "segment [{offset}, +{len}) exceeds the page",
        );
        Self { page, offset, len }
    }

    /// A segment covering a whole fresh page holding `data`.
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(Page::from_slice(data), 0, data.len() as u32)
    }

    #[must_use]
    pub fn page(&self) -> &Page {
        &self.page
    }

    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy the segment content into `dst`.
    ///
    /// # Panics
    ///
    /// Panic if `dst.len()` differs from the segment length.
    pub fn copy_to(&self, dst: &mut [u8]) {
        let start = self.offset as usize;
        dst.copy_from_slice(&self.page.0.lock()[start..start + self.len as usize]);
    }

    /// Overwrite the segment content with `src`.
    ///
    /// # Panics
    ///
    /// Panic if `src.len()` differs from the segment length.
    pub fn copy_from(&self, src: &[u8]) {
        let start = self.offset as usize;
        self.page.0.lock()[start..start + self.len as usize].copy_from_slice(src);
    }

    fn split_at(self, at: u32) -> (Segment, Segment) {
        assert!(0 < at && at < self.len);
        let tail = Segment {
            page: self.page.clone(),
            offset: self.offset + at,
            len: self.len - at,
        };
        let head = Segment { len: at, ..self };
        (head, tail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReqOp {
    Read,
    Write,
    Flush,
    Discard,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReqFlags: u32 {
        /// Flush the volatile cache before handling the payload.
        const Preflush = 1 << 0;
        /// Force unit access: the payload must be durable when completed.
        const Fua = 1 << 1;
        const Sync = 1 << 2;
        const Meta = 1 << 3;
    }
}

type DoneFn = Box<dyn FnOnce(u64, Result<(), Errno>) + Send>;

/// The caller's completion of a [`BlockRequest`], invoked with the completed byte count and the
/// generic result.
pub struct IoDone(DoneFn);

impl fmt::Debug for IoDone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoDone").finish_non_exhaustive()
    }
}

impl IoDone {
    pub fn new(f: impl FnOnce(u64, Result<(), Errno>) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn end(self, bytes: u64, ret: Result<(), Errno>) {
        (self.0)(bytes, ret);
    }
}

/// A block I/O request submitted to an exported device.
///
/// The request is owned by whichever stage is processing it, and [`BlockRequest::end`] consumes
/// it, so every accepted request completes exactly once.
#[derive(Debug)]
pub struct BlockRequest {
    pub(crate) op: ReqOp,
    pub(crate) flags: ReqFlags,
    pub(crate) offset: u64,
    pub(crate) len: u64,
    pub(crate) class: u32,
    pub(crate) segments: Vec<Segment>,
    pub(crate) done: IoDone,
}

impl BlockRequest {
    /// A read or write request over the scatter list `segments`. The length is the total length
    /// of all segments.
    ///
    /// # Panics
    ///
    /// Panic if `op` is not [`ReqOp::Read`] or [`ReqOp::Write`].
    pub fn new(
        op: ReqOp,
        offset: u64,
        segments: Vec<Segment>,
        done: impl FnOnce(u64, Result<(), Errno>) + Send + 'static,
    ) -> Self {
        assert!(matches!(op, ReqOp::Read | ReqOp::Write));
        let len = segments.iter().map(|seg| u64::from(seg.len)).sum();
        Self {
            op,
            flags: ReqFlags::empty(),
            offset,
            len,
            class: 0,
            segments,
            done: IoDone::new(done),
        }
    }

    /// A discard request. It carries no payload.
    pub fn discard(
        offset: u64,
        len: u64,
        done: impl FnOnce(u64, Result<(), Errno>) + Send + 'static,
    ) -> Self {
        Self {
            op: ReqOp::Discard,
            flags: ReqFlags::empty(),
            offset,
            len,
            class: 0,
            segments: Vec::new(),
            done: IoDone::new(done),
        }
    }

    /// An empty flush request.
    pub fn flush(done: impl FnOnce(u64, Result<(), Errno>) + Send + 'static) -> Self {
        Self {
            op: ReqOp::Flush,
            flags: ReqFlags::Preflush,
            offset: 0,
            len: 0,
            class: 0,
            segments: Vec::new(),
            done: IoDone::new(done),
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: ReqFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Set the opaque classification tag passed through to the engine.
    #[must_use]
    pub fn with_class(mut self, class: u32) -> Self {
        self.class = class;
        self
    }

    /// Run `hook` when the request completes, right before the caller's completion.
    #[must_use]
    pub fn on_end(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        let done = self.done;
        self.done = IoDone::new(move |bytes, ret| {
            hook();
            done.end(bytes, ret);
        });
        self
    }

    #[must_use]
    pub fn op(&self) -> ReqOp {
        self.op
    }

    #[must_use]
    pub fn flags(&self) -> ReqFlags {
        self.flags
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn class(&self) -> u32 {
        self.class
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[must_use]
    pub fn needs_flush(&self) -> bool {
        self.op == ReqOp::Flush || self.flags.contains(ReqFlags::Preflush)
    }

    pub(crate) fn clear_flush(&mut self) {
        self.flags.remove(ReqFlags::Preflush);
        if self.op == ReqOp::Flush {
            self.op = ReqOp::Write;
        }
    }

    /// Complete the request with its full length.
    pub fn end(self, ret: Result<(), Errno>) {
        self.done.end(self.len, ret);
    }
}

/// A sub-range of a data request, with its own slice of the scatter list.
#[derive(Debug)]
pub struct SplitRequest {
    pub(crate) offset: u64,
    pub(crate) len: u64,
    pub(crate) segments: Vec<Segment>,
}

impl SplitRequest {
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Carve the first `bytes` off `self`, splitting a segment in the middle if needed.
    pub(crate) fn take_front(&mut self, bytes: u64) -> SplitRequest {
        assert!(0 < bytes && bytes < self.len);
        let mut taken = 0u64;
        let whole = self
            .segments
            .iter()
            .take_while(|seg| {
                let fits = taken + u64::from(seg.len) <= bytes;
                if fits {
                    taken += u64::from(seg.len);
                }
                fits
            })
            .count();
        let mut front = self.segments.drain(..whole).collect::<Vec<_>>();
        if taken < bytes {
            let (head, tail) = self.segments[0].clone().split_at((bytes - taken) as u32);
            front.push(head);
            self.segments[0] = tail;
        }

        let offset = self.offset;
        self.offset += bytes;
        self.len -= bytes;
        SplitRequest {
            offset,
            len: bytes,
            segments: front,
        }
    }

    pub(crate) fn take_all(&mut self) -> SplitRequest {
        let offset = self.offset;
        self.offset += self.len;
        SplitRequest {
            offset,
            len: mem::take(&mut self.len),
            segments: mem::take(&mut self.segments),
        }
    }
}
