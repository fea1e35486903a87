//! An in-memory device namespace where exported devices are published and opened.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use casblk_front::{
    BlockRequest, DeviceOps, Error, ExecContext, ExportedObject, Page, QueueFeatures, QueueLimits,
    ReqFlags, ReqOp, Segment, PAGE_SIZE,
};
use parking_lot::Mutex;
use rustix::io::Errno;
use tokio::sync::oneshot;

/// A published device.
struct Disk {
    name: String,
    ops: Arc<dyn DeviceOps>,
    limits: QueueLimits,
    openers: AtomicUsize,
    /// Submitted requests not completed yet.
    in_flight: Arc<AtomicUsize>,
    locked: AtomicBool,
}

impl fmt::Debug for Disk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disk")
            .field("name", &self.name)
            .field("limits", &self.limits)
            .field("openers", &self.openers)
            .field("in_flight", &self.in_flight)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

/// All published devices by name.
#[derive(Debug, Default)]
pub struct Namespace {
    disks: Mutex<BTreeMap<String, Arc<Disk>>>,
}

impl Namespace {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// Names and limits of published devices, ordered by name.
    #[must_use]
    pub fn list(&self) -> Vec<(String, QueueLimits)> {
        self.disks
            .lock()
            .values()
            .map(|disk| (disk.name.clone(), disk.limits.clone()))
            .collect()
    }

    /// Open a published device. Fails with `EBUSY` while it is locked for maintenance.
    pub fn open(&self, name: &str) -> Result<DiskHandle, Errno> {
        let disk = self.disks.lock().get(name).cloned().ok_or(Errno::NOENT)?;
        disk.openers.fetch_add(1, Ordering::SeqCst);
        if disk.locked.load(Ordering::SeqCst) {
            disk.openers.fetch_sub(1, Ordering::SeqCst);
            return Err(Errno::BUSY);
        }
        Ok(DiskHandle { disk })
    }
}

/// The registration of one exported device in a [`Namespace`].
#[derive(Debug)]
pub struct MemoryDisk {
    ns: Arc<Namespace>,
    backing: QueueLimits,
    disk: Mutex<Option<Arc<Disk>>>,
}

impl MemoryDisk {
    #[must_use]
    pub fn new(ns: Arc<Namespace>, backing: QueueLimits) -> Self {
        Self {
            ns,
            backing,
            disk: Mutex::new(None),
        }
    }

    fn disk(&self) -> Result<Arc<Disk>, Errno> {
        self.disk.lock().clone().ok_or(Errno::NODEV)
    }
}

impl ExportedObject for MemoryDisk {
    fn create(&self, name: &str, ops: Arc<dyn DeviceOps>) -> Result<(), Error> {
        let mut disks = self.ns.disks.lock();
        if disks.contains_key(name) {
            return Err(Error::Registration(Errno::EXIST));
        }
        let mut limits = ops.set_geometry(&self.backing)?;
        limits.features = ops.queue_features(&self.backing);
        let disk = Arc::new(Disk {
            name: name.to_owned(),
            ops,
            limits,
            openers: AtomicUsize::new(0),
            in_flight: Arc::default(),
            locked: AtomicBool::new(false),
        });
        disks.insert(name.to_owned(), disk.clone());
        *self.disk.lock() = Some(disk);
        Ok(())
    }

    fn destroy(&self) -> Result<(), Errno> {
        let disk = self.disk()?;
        assert!(disk.locked.load(Ordering::SeqCst), "destroying an unlocked disk");
        self.ns.disks.lock().remove(&disk.name);
        Ok(())
    }

    fn lock(&self) -> Result<(), Errno> {
        let disk = self.disk()?;
        if disk.locked.swap(true, Ordering::SeqCst) {
            return Err(Errno::BUSY);
        }
        // No new request can be submitted without an opener, so both only go down from here.
        let busy =
            disk.openers.load(Ordering::SeqCst) != 0 || disk.in_flight.load(Ordering::SeqCst) != 0;
        if busy {
            disk.locked.store(false, Ordering::SeqCst);
            return Err(Errno::BUSY);
        }
        Ok(())
    }

    fn unlock(&self) {
        if let Ok(disk) = self.disk() {
            disk.locked.store(false, Ordering::SeqCst);
        }
    }

    fn cleanup(&self) {
        // Release the device ops, and with them the last reference to the request path.
        self.disk.lock().take();
    }
}

/// An open reference to a published device.
#[derive(Debug)]
pub struct DiskHandle {
    disk: Arc<Disk>,
}

impl Drop for DiskHandle {
    fn drop(&mut self) {
        self.disk.openers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DiskHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.disk.name
    }

    #[must_use]
    pub fn limits(&self) -> &QueueLimits {
        &self.disk.limits
    }

    #[must_use]
    pub fn features(&self) -> QueueFeatures {
        self.disk.limits.features
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.disk.limits.capacity.bytes()
    }

    pub fn submit(&self, req: BlockRequest, ctx: ExecContext) {
        let in_flight = self.disk.in_flight.clone();
        in_flight.fetch_add(1, Ordering::SeqCst);
        let req = req.on_end(move || {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
        self.disk.ops.submit_bio(req, ctx);
    }

    async fn submit_wait(
        &self,
        ctx: ExecContext,
        make: impl FnOnce(Box<dyn FnOnce(u64, Result<(), Errno>) + Send>) -> BlockRequest,
    ) -> Result<(), Errno> {
        let (tx, rx) = oneshot::channel();
        let req = make(Box::new(move |_, ret| {
            let _ = tx.send(ret);
        }));
        self.submit(req, ctx);
        // A dropped request never completes, which is a bug of the request path.
        rx.await.expect("request dropped without completion")
    }

    pub async fn read(&self, offset: u64, len: usize, ctx: ExecContext) -> Result<Vec<u8>, Errno> {
        let segs = (0..len)
            .step_by(PAGE_SIZE)
            .map(|pos| Segment::new(Page::new(), 0, (len - pos).min(PAGE_SIZE) as u32))
            .collect::<Vec<_>>();
        self.submit_wait(ctx, |done| {
            BlockRequest::new(ReqOp::Read, offset, segs.clone(), done)
        })
        .await?;
        let mut buf = vec![0u8; len];
        for (seg, chunk) in segs.iter().zip(buf.chunks_mut(PAGE_SIZE)) {
            seg.copy_to(chunk);
        }
        Ok(buf)
    }

    pub async fn write(
        &self,
        offset: u64,
        data: &[u8],
        flags: ReqFlags,
        ctx: ExecContext,
    ) -> Result<(), Errno> {
        let segs = data.chunks(PAGE_SIZE).map(Segment::from_slice).collect::<Vec<_>>();
        self.submit_wait(ctx, |done| {
            BlockRequest::new(ReqOp::Write, offset, segs, done).with_flags(flags)
        })
        .await
    }

    pub async fn flush(&self, ctx: ExecContext) -> Result<(), Errno> {
        self.submit_wait(ctx, |done| BlockRequest::flush(done)).await
    }

    pub async fn discard(&self, offset: u64, len: u64, ctx: ExecContext) -> Result<(), Errno> {
        self.submit_wait(ctx, |done| BlockRequest::discard(offset, len, done))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullOps;

    impl DeviceOps for NullOps {
        fn set_geometry(&self, backing: &QueueLimits) -> Result<QueueLimits, Error> {
            Ok(backing.clone())
        }

        fn queue_features(&self, _: &QueueLimits) -> QueueFeatures {
            QueueFeatures::Fua
        }

        fn submit_bio(&self, req: BlockRequest, _: ExecContext) {
            req.end(Ok(()));
        }
    }

    /// Holds submitted requests until they are ended by hand.
    #[derive(Default, Clone)]
    struct HoldOps(Arc<Mutex<Vec<BlockRequest>>>);

    impl DeviceOps for HoldOps {
        fn set_geometry(&self, backing: &QueueLimits) -> Result<QueueLimits, Error> {
            Ok(backing.clone())
        }

        fn queue_features(&self, _: &QueueLimits) -> QueueFeatures {
            QueueFeatures::empty()
        }

        fn submit_bio(&self, req: BlockRequest, _: ExecContext) {
            self.0.lock().push(req);
        }
    }

    #[test]
    fn in_flight_request_blocks_lock() {
        let ns = Namespace::new();
        let obj = MemoryDisk::new(ns.clone(), QueueLimits::new());
        let ops = HoldOps::default();
        obj.create("cas1-1", Arc::new(ops.clone())).unwrap();

        let handle = ns.open("cas1-1").unwrap();
        let ended = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let ended = ended.clone();
            let req = BlockRequest::flush(move |_, ret| {
                assert_eq!(ret, Ok(()));
                ended.fetch_add(1, Ordering::SeqCst);
            });
            handle.submit(req, ExecContext::Task);
        }
        drop(handle);

        assert_eq!(obj.lock(), Err(Errno::BUSY));
        // A failed lock leaves the device usable.
        drop(ns.open("cas1-1").unwrap());
        let mut held = std::mem::take(&mut *ops.0.lock());
        held.pop().unwrap().end(Ok(()));
        assert_eq!(obj.lock(), Err(Errno::BUSY));
        held.pop().unwrap().end(Ok(()));
        assert_eq!(ended.load(Ordering::SeqCst), 2);
        obj.lock().unwrap();
        obj.destroy().unwrap();
    }

    #[test]
    fn open_blocks_lock_and_lock_blocks_open() {
        let ns = Namespace::new();
        let obj = MemoryDisk::new(ns.clone(), QueueLimits::new());
        obj.create("cas1-1", Arc::new(NullOps)).unwrap();
        assert!(matches!(
            obj.create("cas1-1", Arc::new(NullOps)),
            Err(Error::Registration(Errno::EXIST))
        ));
        assert_eq!(ns.list()[0].1.features, QueueFeatures::Fua);

        let handle = ns.open("cas1-1").unwrap();
        assert_eq!(obj.lock(), Err(Errno::BUSY));
        drop(handle);
        obj.lock().unwrap();
        assert_eq!(ns.open("cas1-1").unwrap_err(), Errno::BUSY);
        assert_eq!(obj.lock(), Err(Errno::BUSY));

        obj.destroy().unwrap();
        obj.unlock();
        obj.cleanup();
        assert_eq!(ns.open("cas1-1").unwrap_err(), Errno::NOENT);
        assert!(ns.list().is_empty());
        assert_eq!(obj.lock(), Err(Errno::NODEV));
    }
}
