//! Lifecycle of exported devices.
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustix::io::Errno;

use crate::defer::ExecContext;
use crate::dispatch::Frontend;
use crate::engine::Volume;
use crate::error::Error;
use crate::limits::{QueueFeatures, QueueLimits};
use crate::request::BlockRequest;

/// Callbacks of an exported device, invoked by the registration layer.
pub trait DeviceOps: Send + Sync {
    /// Compute the device limits given the limits of the backing device.
    fn set_geometry(&self, backing: &QueueLimits) -> Result<QueueLimits, Error>;

    fn queue_features(&self, backing: &QueueLimits) -> QueueFeatures;

    fn submit_bio(&self, req: BlockRequest, ctx: ExecContext);
}

impl<V: Volume> DeviceOps for Arc<Frontend<V>> {
    fn set_geometry(&self, backing: &QueueLimits) -> Result<QueueLimits, Error> {
        Frontend::set_geometry(self, backing)
    }

    fn queue_features(&self, backing: &QueueLimits) -> QueueFeatures {
        Frontend::queue_features(self, backing)
    }

    fn submit_bio(&self, req: BlockRequest, ctx: ExecContext) {
        Frontend::submit_bio(self, req, ctx);
    }
}

/// The registration layer publishing a device under a name.
pub trait ExportedObject: Send + Sync {
    /// Publish the device. It must call [`DeviceOps::set_geometry`] before requests are
    /// submitted.
    fn create(&self, name: &str, ops: Arc<dyn DeviceOps>) -> Result<(), Error>;

    /// Unpublish the device. Only called while locked.
    fn destroy(&self) -> Result<(), Errno>;

    /// Take the exclusive maintenance lock. Fails with `EBUSY` if the device is in use.
    fn lock(&self) -> Result<(), Errno>;

    fn unlock(&self);

    /// Release resources outliving the registration.
    fn cleanup(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// Never published.
    Uninitialized,
    /// Published and accepting requests.
    Valid,
    /// Unpublished.
    Invalid,
}

#[derive(Debug)]
struct Inner {
    state: DeviceState,
    locked: bool,
    needs_cleanup: bool,
}

/// A virtual block device exported on top of an engine volume.
pub struct ExportedDevice<V> {
    front: Arc<Frontend<V>>,
    obj: Box<dyn ExportedObject>,
    inner: Mutex<Inner>,
}

impl<V> fmt::Debug for ExportedDevice<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedDevice")
            .field("front", &self.front)
            .field("inner", &*self.inner.lock())
            .finish_non_exhaustive()
    }
}

impl<V: Volume> ExportedDevice<V> {
    pub fn new(front: Frontend<V>, obj: impl ExportedObject + 'static) -> Self {
        Self {
            front: Arc::new(front),
            obj: Box::new(obj),
            inner: Mutex::new(Inner {
                state: DeviceState::Uninitialized,
                locked: false,
                needs_cleanup: false,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.front.name()
    }

    #[must_use]
    pub fn frontend(&self) -> &Arc<Frontend<V>> {
        &self.front
    }

    #[must_use]
    pub fn state(&self) -> DeviceState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.lock().locked
    }

    /// Start the background queue and publish the device.
    ///
    /// # Panics
    ///
    /// Panic if the device is already published.
    pub fn create(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        assert_ne!(inner.state, DeviceState::Valid, "device is already created");
        let name = self.front.name();
        let io_flusher = self.front.params().io_flusher;
        if let Err(err) = self.front.defer.start(name, io_flusher) {
            tracing::error!(name, %err, "cannot create exported object");
            return Err(err);
        }
        let queue_guard = scopeguard::guard(&self.front.defer, |defer| defer.stop());
        let ops: Arc<dyn DeviceOps> = Arc::new(Arc::clone(&self.front));
        if let Err(err) = self.obj.create(name, ops) {
            tracing::error!(name, %err, "cannot create exported object");
            return Err(err);
        }
        scopeguard::ScopeGuard::into_inner(queue_guard);
        inner.state = DeviceState::Valid;
        inner.needs_cleanup = true;
        tracing::info!(name, "created exported device");
        Ok(())
    }

    /// Take the maintenance lock. A no-op if the device is not published.
    pub fn lock(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.state != DeviceState::Valid {
            return Ok(());
        }
        match self.obj.lock() {
            Ok(()) => {
                inner.locked = true;
                Ok(())
            }
            Err(Errno::BUSY) => {
                tracing::warn!(name = self.name(), "stopping failed, device in use");
                Err(Error::DeviceBusy)
            }
            Err(err) => {
                tracing::warn!(name = self.name(), %err, "stopping failed, device unavailable");
                Err(Error::DeviceUnavailable)
            }
        }
    }

    pub fn unlock(&self) {
        let mut inner = self.inner.lock();
        if inner.locked {
            self.obj.unlock();
            inner.locked = false;
        }
    }

    /// Unpublish a locked device, then release the lock.
    ///
    /// # Panics
    ///
    /// Panic if the device is published but not locked.
    pub fn stop(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let mut ret = Ok(());
        if inner.state == DeviceState::Valid {
            assert!(inner.locked, "stopping an unlocked device");
            tracing::info!(name = self.name(), "stopping device");
            match self.obj.destroy() {
                Ok(()) => {
                    inner.state = DeviceState::Invalid;
                    self.front.defer.stop();
                }
                Err(err) => {
                    tracing::error!(name = self.name(), %err, "failed to unregister device");
                    ret = Err(Error::Registration(err));
                }
            }
        }
        if inner.locked {
            self.obj.unlock();
            inner.locked = false;
        }
        ret
    }

    /// Release what outlives the registration. Idempotent.
    ///
    /// A device still published, after a failed stop, keeps its resources until a later stop
    /// succeeds.
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock();
        if inner.state == DeviceState::Valid {
            return;
        }
        if std::mem::take(&mut inner.needs_cleanup) {
            self.obj.cleanup();
        }
    }

    /// Lock, stop and clean up a single device. A no-op if the device is not published.
    pub fn destroy(&self) -> Result<(), Error> {
        if self.state() != DeviceState::Valid {
            return Ok(());
        }
        self.lock()?;
        self.stop()?;
        self.cleanup();
        Ok(())
    }
}

/// Stop all `devices` at once, or none of them if any cannot be locked.
///
/// If a device fails to lock, devices locked so far are unlocked again and the error is returned.
/// Otherwise every device is stopped and cleaned up, and the first stop failure is returned.
/// Devices failing to stop stay published and are not cleaned up.
pub fn stop_all<V: Volume>(devices: &[ExportedDevice<V>]) -> Result<(), Error> {
    for (i, dev) in devices.iter().enumerate() {
        if let Err(err) = dev.lock() {
            for dev in &devices[..i] {
                dev.unlock();
            }
            return Err(err);
        }
    }

    let mut ret = Ok(());
    for dev in devices {
        if let Err(err) = dev.stop() {
            if ret.is_ok() {
                ret = Err(err);
            }
        }
    }
    for dev in devices {
        dev.cleanup();
    }
    ret
}
