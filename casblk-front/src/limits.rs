//! Queue limits of exported devices, derived from the devices they stack on.
use crate::error::Error;
use crate::Sector;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueueFeatures: u32 {
        /// The device has a volatile write cache and needs flushes.
        const WriteCache = 1 << 0;
        const Fua = 1 << 1;
        const Rotational = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardLimits {
    pub alignment: u32,
    pub granularity: u32,
    pub max_sectors: Sector,
}

/// Queue limits of a block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueLimits {
    pub capacity: Sector,
    /// Power of two of at least a sector.
    pub logical_block_size: u32,
    pub physical_block_size: u32,
    pub io_min: u32,
    /// Optimal request size in bytes, or 0 if unknown.
    pub io_opt: u32,
    /// Maximum request size, or 0 for unlimited.
    pub max_sectors: Sector,
    pub chunk_sectors: Sector,
    pub discard: Option<DiscardLimits>,
    pub features: QueueFeatures,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueLimits {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            capacity: Sector(0),
            logical_block_size: 512,
            physical_block_size: 512,
            io_min: 512,
            io_opt: 0,
            max_sectors: Sector(0),
            chunk_sectors: Sector(0),
            discard: None,
            features: QueueFeatures::empty(),
        }
    }

    /// Combine with the limits of a device `self` is stacked on top of.
    fn stack(&mut self, bottom: &Self) {
        self.logical_block_size = self.logical_block_size.max(bottom.logical_block_size);
        self.physical_block_size = self.physical_block_size.max(bottom.physical_block_size);
        self.io_min = self.io_min.max(bottom.io_min);
        self.io_opt = self.io_opt.max(bottom.io_opt);
        self.max_sectors = match (self.max_sectors, bottom.max_sectors) {
            (Sector(0), other) | (other, Sector(0)) => other,
            (a, b) => a.min(b),
        };
    }
}

/// Properties of the cache a core device is exported through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheProperties {
    /// Limits of the cache device.
    pub limits: QueueLimits,
    /// The cache needs flushes.
    pub flush: bool,
    pub fua: bool,
    /// Cache line size in bytes.
    pub line_size: u32,
}

/// How an exported device derives its limits from its backing device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Geometry {
    /// A core device accelerated by the cache.
    ///
    /// Discards are served by the caching engine rather than passed down to the core, so a core
    /// device always supports them. Without backing support they are granular to cache lines.
    Core(CacheProperties),
    /// The cache device itself.
    Cache,
}

impl Geometry {
    /// Compute the limits of an exported device of `capacity` backed by a device with limits
    /// `backing`.
    pub fn apply(&self, capacity: Sector, backing: &QueueLimits) -> Result<QueueLimits, Error> {
        let mut limits = match self {
            Self::Core(cache) => {
                let mut limits = cache.limits.clone();
                if limits.logical_block_size > backing.logical_block_size {
                    tracing::error!(
                        exported = limits.logical_block_size,
                        backing = backing.logical_block_size,
                        "cache logical block size exceeds the core device",
                    );
                    return Err(Error::UnalignedConfiguration);
                }
                limits.discard = Some(backing.discard.unwrap_or(DiscardLimits {
                    alignment: 0,
                    granularity: cache.line_size,
                    max_sectors: Sector(capacity.0.min(u32::MAX.into())),
                }));
                limits
            }
            Self::Cache => backing.clone(),
        };
        limits.capacity = capacity;
        limits.stack(backing);
        limits.chunk_sectors = Sector(0);
        limits.features = self.queue_features(backing);
        Ok(limits)
    }

    #[must_use]
    pub fn queue_features(&self, backing: &QueueLimits) -> QueueFeatures {
        match self {
            Self::Core(cache) => {
                let mut features = QueueFeatures::empty();
                features.set(
                    QueueFeatures::WriteCache,
                    cache.flush || backing.features.contains(QueueFeatures::WriteCache),
                );
                features.set(
                    QueueFeatures::Fua,
                    cache.fua || backing.features.contains(QueueFeatures::Fua),
                );
                features
            }
            Self::Cache => backing.features,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_limits() -> QueueLimits {
        QueueLimits {
            capacity: Sector(1 << 20),
            physical_block_size: 4096,
            io_min: 4096,
            io_opt: 64 << 10,
            max_sectors: Sector(256),
            chunk_sectors: Sector(128),
            features: QueueFeatures::Rotational,
            ..QueueLimits::new()
        }
    }

    fn cache(logical_block_size: u32) -> CacheProperties {
        CacheProperties {
            limits: QueueLimits {
                logical_block_size,
                max_sectors: Sector(1024),
                ..QueueLimits::new()
            },
            flush: true,
            fua: false,
            line_size: 4096,
        }
    }

    #[test]
    fn core_stacks_on_backing() {
        let limits = Geometry::Core(cache(512))
            .apply(Sector(1000), &core_limits())
            .unwrap();
        assert_eq!(
            limits,
            QueueLimits {
                capacity: Sector(1000),
                logical_block_size: 512,
                physical_block_size: 4096,
                io_min: 4096,
                io_opt: 64 << 10,
                max_sectors: Sector(256),
                chunk_sectors: Sector(0),
                discard: Some(DiscardLimits {
                    alignment: 0,
                    granularity: 4096,
                    max_sectors: Sector(1000),
                }),
                features: QueueFeatures::WriteCache,
            },
        );
    }

    #[test]
    fn core_copies_backing_discard() {
        let discard = DiscardLimits {
            alignment: 512,
            granularity: 8192,
            max_sectors: Sector(64),
        };
        let backing = QueueLimits {
            discard: Some(discard),
            features: QueueFeatures::Fua,
            ..core_limits()
        };
        let limits = Geometry::Core(cache(512))
            .apply(Sector(1 << 30), &backing)
            .unwrap();
        assert_eq!(limits.discard, Some(discard));
        assert_eq!(limits.features, QueueFeatures::WriteCache | QueueFeatures::Fua);
    }

    #[test]
    fn huge_core_caps_discard_size() {
        let limits = Geometry::Core(cache(512))
            .apply(Sector(1 << 40), &core_limits())
            .unwrap();
        assert_eq!(limits.discard.unwrap().max_sectors, Sector(u32::MAX.into()));
    }

    #[test]
    fn core_rejects_larger_logical_block() {
        let ret = Geometry::Core(cache(4096)).apply(Sector(8), &core_limits());
        assert!(matches!(ret, Err(Error::UnalignedConfiguration)));
    }

    #[test]
    fn cache_device_inherits_backing() {
        let limits = Geometry::Cache.apply(Sector(42), &core_limits()).unwrap();
        assert_eq!(limits.capacity, Sector(42));
        assert_eq!(limits.max_sectors, Sector(256));
        assert_eq!(limits.chunk_sectors, Sector(0));
        assert_eq!(limits.features, QueueFeatures::Rotational);
        assert_eq!(limits.discard, None);
    }

    #[test]
    fn unlimited_max_sectors() {
        let backing = QueueLimits {
            max_sectors: Sector(0),
            ..core_limits()
        };
        let limits = Geometry::Cache.apply(Sector(1), &backing).unwrap();
        assert_eq!(limits.max_sectors, Sector(0));
        let limits = Geometry::Core(cache(512)).apply(Sector(1), &backing).unwrap();
        assert_eq!(limits.max_sectors, Sector(1024));
    }
}
