//! Fan-in of sub-request completions into the completion of the original request.
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::engine::EngineError;
use crate::request::IoDone;

#[derive(Debug)]
struct Master {
    remaining: AtomicU32,
    /// Zero means no error.
    error: AtomicI32,
    size: u64,
    start: Instant,
    done: Mutex<Option<IoDone>>,
}

impl Master {
    fn put(&self, err: Option<EngineError>) {
        if let Some(err) = err {
            // First error wins.
            let _ = self.error.compare_exchange(0, err.raw(), Ordering::AcqRel, Ordering::Acquire);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finalize();
        }
    }

    fn finalize(&self) {
        let ret = match self.error.load(Ordering::Acquire) {
            0 => Ok(()),
            code => Err(EngineError::from_raw(code).to_errno()),
        };
        let done = self.done.lock().take().expect("finalized twice");
        done.end(self.size, ret);
        tracing::trace!(size = self.size, elapsed = ?self.start.elapsed(), ?ret, "request completed");
    }
}

/// The reference held by the splitting loop while it is still issuing sub-requests.
///
/// It must be consumed by [`LoopRef::release`]. Dropping it releases with an I/O error.
#[derive(Debug)]
pub struct LoopRef(Option<Arc<Master>>);

impl LoopRef {
    /// Start aggregating completions for an original request of `size` bytes.
    #[must_use]
    pub fn begin(done: IoDone, size: u64) -> Self {
        Self(Some(Arc::new(Master {
            remaining: AtomicU32::new(1),
            error: AtomicI32::new(0),
            size,
            start: Instant::now(),
            done: Mutex::new(Some(done)),
        })))
    }

    fn master(&self) -> &Arc<Master> {
        self.0.as_ref().expect("consumed")
    }

    /// Take a reference for one more in-flight sub-request.
    #[must_use]
    pub fn add_reference(&self) -> SubRef {
        let master = self.master();
        let prev = master.remaining.fetch_add(1, Ordering::Relaxed);
        assert_ne!(prev, u32::MAX, "too many sub-requests");
        SubRef(Some(master.clone()))
    }

    /// Done issuing sub-requests, either finished or aborted with `err`.
    pub fn release(mut self, err: Option<EngineError>) {
        if let Some(master) = self.0.take() {
            master.put(err);
        }
    }
}

impl Drop for LoopRef {
    fn drop(&mut self) {
        if let Some(master) = self.0.take() {
            tracing::error!("splitting loop reference dropped without release");
            master.put(Some(EngineError::IO));
        }
    }
}

/// The reference of one in-flight sub-request.
///
/// It must be consumed by [`SubRef::complete`]. Dropping it completes with an I/O error.
#[derive(Debug)]
pub struct SubRef(Option<Arc<Master>>);

impl SubRef {
    pub fn complete(mut self, ret: Result<(), EngineError>) {
        if let Some(master) = self.0.take() {
            master.put(ret.err());
        }
    }
}

impl Drop for SubRef {
    fn drop(&mut self) {
        if let Some(master) = self.0.take() {
            tracing::error!("sub-request dropped without completion");
            master.put(Some(EngineError::IO));
        }
    }
}
