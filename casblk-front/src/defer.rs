//! Per-device background queue for work that cannot run in the submitting context.
use std::io;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use rustix::io::Errno;

use crate::engine::AllocMode;
use crate::error::Error;
use crate::request::BlockRequest;

/// Whether the submitting context may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecContext {
    /// A normal task context. Blocking and allocation are allowed.
    Task,
    /// An interrupt-like context. Nothing may block, so the work is deferred.
    Atomic,
}

impl ExecContext {
    pub(crate) fn alloc_mode(self) -> AllocMode {
        match self {
            Self::Task => AllocMode::NoIo,
            Self::Atomic => AllocMode::Atomic,
        }
    }
}

pub(crate) type Handler = Box<dyn FnOnce(BlockRequest) + Send>;

/// A request packaged with the handler to run on it.
struct Work {
    req: BlockRequest,
    handler: Handler,
}

#[derive(Debug, Default)]
pub(crate) struct DeferQueue {
    tx: Mutex<Option<mpsc::Sender<Work>>>,
    worker: Mutex<Option<JoinHandle<io::Result<()>>>>,
}

impl DeferQueue {
    /// Spawn the worker thread and wait until it is ready to take work.
    pub fn start(&self, name: &str, io_flusher: bool) -> Result<(), Error> {
        assert!(self.tx.lock().is_none(), "queue already started");
        let (tx, rx) = mpsc::channel::<Work>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<()>(1);
        let worker = thread::Builder::new()
            .name(format!("defer-{name}"))
            .spawn(move || {
                let _io_flusher_guard = io_flusher
                    .then(|| {
                        rustix::process::configure_io_flusher_behavior(true)?;
                        tracing::debug!("set thread as IO_FLUSHER");
                        Ok::<_, Errno>(scopeguard::guard((), |()| {
                            if let Err(err) = rustix::process::configure_io_flusher_behavior(false)
                            {
                                tracing::error!(%err, "failed to reset IO_FLUSHER state");
                            }
                        }))
                    })
                    .transpose()?;
                // Receiver may be gone if the starter panicked.
                let _ = ready_tx.send(());
                drop(ready_tx);

                for Work { req, handler } in rx {
                    handler(req);
                }
                Ok(())
            })
            .map_err(Error::Worker)?;

        // The channel is closed without a message only if the worker failed early.
        if ready_rx.recv().is_err() {
            let err = match worker.join() {
                Ok(Err(err)) => err,
                Ok(Ok(())) => io::Error::other("worker exited before ready"),
                Err(_) => io::Error::other("worker panicked"),
            };
            tracing::error!(name, %err, "failed to start background queue");
            return Err(Error::Worker(err));
        }
        *self.tx.lock() = Some(tx);
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.tx.lock().is_some()
    }

    /// Queue `handler` to run on `req` in the worker thread.
    ///
    /// If the queue is not running, `req` is completed with `ENODEV`.
    pub fn push(&self, req: BlockRequest, handler: Handler) {
        let work = Work { req, handler };
        let ret = match &*self.tx.lock() {
            Some(tx) => tx.send(work).map_err(|mpsc::SendError(work)| work),
            None => Err(work),
        };
        if let Err(work) = ret {
            tracing::warn!(offset = work.req.offset, "background queue is not running");
            work.req.end(Err(Errno::NODEV));
        }
    }

    /// Stop accepting work and wait for the work already queued.
    pub fn stop(&self) {
        drop(self.tx.lock().take());
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        // Dropping the last device reference inside a handler stops the queue from its own worker.
        if worker.thread().id() == thread::current().id() {
            return;
        }
        match worker.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(%err, "background queue failed"),
            Err(_) => tracing::error!("background queue panicked"),
        }
    }
}

impl Drop for DeferQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
