//! Classification and dispatch of requests to the caching engine.
use std::fmt;
use std::sync::Arc;

use rustix::io::Errno;

use crate::defer::{DeferQueue, ExecContext};
use crate::engine::{Direction, EngineIo, IoDesc, PerCpu, QueuePolicy, Volume};
use crate::error::Error;
use crate::limits::{Geometry, QueueFeatures, QueueLimits};
use crate::request::{BlockRequest, ReqFlags, ReqOp};
use crate::{split, Sector};

/// Tunables of the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrontParams {
    /// Maximum size in bytes of a single engine submission on the data path.
    pub max_io_size: u64,
    /// Every split boundary is a multiple of this many bytes.
    pub split_alignment: u64,
    /// Mark background workers as `PR_SET_IO_FLUSHER`. Requires `CAP_SYS_RESOURCE`.
    pub io_flusher: bool,
}

impl Default for FrontParams {
    fn default() -> Self {
        Self::new()
    }
}

impl FrontParams {
    pub const DEFAULT_MAX_IO_SIZE: u64 = 32 << 20;
    pub const DEFAULT_SPLIT_ALIGNMENT: u64 = 128 << 10;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_io_size: Self::DEFAULT_MAX_IO_SIZE,
            split_alignment: Self::DEFAULT_SPLIT_ALIGNMENT,
            io_flusher: false,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !self.split_alignment.is_power_of_two()
            || self.max_io_size == 0
            || self.max_io_size % self.split_alignment != 0
        {
            tracing::error!(
                max_io_size = self.max_io_size,
                split_alignment = self.split_alignment,
                "split alignment must be a power of two dividing the maximum I/O size",
            );
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

/// The request path of one exported device on top of an engine volume.
pub struct Frontend<V> {
    name: String,
    volume: Arc<V>,
    params: FrontParams,
    queue_policy: Box<dyn QueuePolicy>,
    geometry: Geometry,
    pub(crate) defer: DeferQueue,
}

impl<V> fmt::Debug for Frontend<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frontend")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("queue_policy", &self.queue_policy)
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}

impl<V: Volume> Frontend<V> {
    pub fn new(
        name: impl Into<String>,
        volume: Arc<V>,
        geometry: Geometry,
        params: FrontParams,
    ) -> Result<Self, Error> {
        params.validate()?;
        assert_ne!(volume.nr_queues(), 0, "volume has no queue");
        Ok(Self {
            name: name.into(),
            volume,
            params,
            queue_policy: Box::new(PerCpu),
            geometry,
            defer: DeferQueue::default(),
        })
    }

    #[must_use]
    pub fn with_queue_policy(mut self, policy: impl QueuePolicy) -> Self {
        self.queue_policy = Box::new(policy);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn volume(&self) -> &Arc<V> {
        &self.volume
    }

    #[must_use]
    pub fn params(&self) -> &FrontParams {
        &self.params
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Limits of the exported device stacked on a backing device with `backing` limits.
    pub fn set_geometry(&self, backing: &QueueLimits) -> Result<QueueLimits, Error> {
        let capacity = Sector::from_bytes_floor(self.volume.length());
        self.geometry.apply(capacity, backing)
    }

    #[must_use]
    pub fn queue_features(&self, backing: &QueueLimits) -> QueueFeatures {
        self.geometry.queue_features(backing)
    }

    /// The entry point of all requests of the device.
    pub fn submit_bio(self: &Arc<Self>, req: BlockRequest, ctx: ExecContext) {
        match ctx {
            ExecContext::Task => self.handle_bio(req, ctx),
            ExecContext::Atomic => self.defer_to(req, Self::handle_bio),
        }
    }

    /// Run `handler` on `req` later in the background queue.
    fn defer_to(
        self: &Arc<Self>,
        req: BlockRequest,
        handler: fn(&Arc<Self>, BlockRequest, ExecContext),
    ) {
        let this = Arc::clone(self);
        let work = move |req| handler(&this, req, ExecContext::Task);
        self.defer.push(req, Box::new(work));
    }

    fn select_queue(&self) -> usize {
        let nr_queues = self.volume.nr_queues();
        let queue = self.queue_policy.select(nr_queues);
        debug_assert!(queue < nr_queues);
        queue
    }

    fn handle_bio(self: &Arc<Self>, req: BlockRequest, ctx: ExecContext) {
        if req.needs_flush() {
            self.handle_flush(req);
        } else {
            self.handle_noflush(req, ctx);
        }
    }

    fn handle_noflush(self: &Arc<Self>, req: BlockRequest, ctx: ExecContext) {
        if req.op == ReqOp::Discard {
            self.handle_discard(req);
        } else {
            let queue = self.select_queue();
            split::handle_data(&*self.volume, queue, &self.params, req, ctx.alloc_mode());
        }
    }

    fn handle_flush(self: &Arc<Self>, mut req: BlockRequest) {
        let desc = IoDesc {
            offset: 0,
            len: 0,
            dir: Direction::Write,
            class: 0,
            flags: ReqFlags::Preflush,
        };
        let Some(mut io) = self.volume.new_io(self.select_queue(), desc) else {
            tracing::warn!(name = %self.name, "cannot allocate flush request");
            return req.end(Err(Errno::NOMEM));
        };
        let this = Arc::clone(self);
        io.set_completion(Box::new(move |ret| {
            if let Err(err) = ret {
                return req.end(Err(err.to_errno()));
            }
            if req.is_empty() {
                return req.end(Ok(()));
            }
            req.clear_flush();
            this.defer_to(req, Self::handle_noflush);
        }));
        self.volume.submit_flush(io);
    }

    fn handle_discard(&self, req: BlockRequest) {
        if req.offset.checked_add(req.len).is_none() {
            tracing::warn!(
                name = %self.name,
                offset = req.offset,
                len = req.len,
                "discard beyond the addressable range",
            );
            return req.end(Err(Errno::INVAL));
        }
        let desc = IoDesc {
            offset: req.offset,
            len: req.len,
            dir: Direction::Write,
            class: 0,
            flags: ReqFlags::empty(),
        };
        let Some(mut io) = self.volume.new_io(self.select_queue(), desc) else {
            tracing::warn!(name = %self.name, offset = req.offset, "cannot allocate discard request");
            return req.end(Err(Errno::NOMEM));
        };
        io.set_completion(Box::new(move |ret| req.end(ret.map_err(|err| err.to_errno()))));
        self.volume.submit_discard(io);
    }
}
