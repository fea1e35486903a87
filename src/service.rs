//! A cache exporting one device for itself and one for each core it accelerates.
//!
//! Every exported device sits on an engine volume of the in-memory engine. Core volumes share the
//! cache's line cache. Devices are published in a [`Namespace`] under their well-known names:
//!
//! ```text
//! cas-cache-{cache_id}    // The cache device itself.
//! cas{cache_id}-{core_id} // Core devices.
//! ```
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use casblk_front::{
    stop_all, CacheProperties, DeviceState, DiscardLimits, ExportedDevice, FrontParams, Frontend,
    Geometry, QueueFeatures, QueueLimits, RoundRobin, Sector,
};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

use crate::memory_disk::{MemoryDisk, Namespace};
use crate::memory_engine::{CompletionMode, LineCache, MemoryVolume};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub cache: CacheConfig,
    #[serde(rename = "core", default)]
    pub cores: Vec<CoreConfig>,
    #[serde(default)]
    pub io: IoConfig,
}

#[serde_inline_default]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    pub id: u16,
    #[serde(with = "serde_sector")]
    pub size: Sector,
    #[serde_inline_default(4096)]
    #[serde(deserialize_with = "de_size")]
    pub line_size: u32,
    #[serde_inline_default(512)]
    pub logical_block_size: u32,
    #[serde_inline_default(true)]
    pub flush: bool,
    #[serde_inline_default(true)]
    pub fua: bool,
}

#[serde_inline_default]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    pub id: u16,
    #[serde(with = "serde_sector")]
    pub size: Sector,
    #[serde_inline_default(512)]
    pub logical_block_size: u32,
    #[serde_inline_default(false)]
    pub write_cache: bool,
    #[serde_inline_default(false)]
    pub fua: bool,
    #[serde_inline_default(true)]
    pub discard: bool,
}

#[serde_inline_default]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IoConfig {
    #[serde_inline_default(FrontParams::DEFAULT_MAX_IO_SIZE)]
    #[serde(deserialize_with = "de_size")]
    pub max_io_size: u64,
    #[serde_inline_default(FrontParams::DEFAULT_SPLIT_ALIGNMENT)]
    #[serde(deserialize_with = "de_size")]
    pub split_alignment: u64,
    /// Engine queues per volume. 0 for the available parallelism.
    #[serde_inline_default(0)]
    pub queues: usize,
    #[serde_inline_default(false)]
    pub io_flusher: bool,
    #[serde_inline_default(NonZeroUsize::new(1024).unwrap())]
    pub cache_lines: NonZeroUsize,
    #[serde(default)]
    pub completion: CompletionMode,
    #[serde_inline_default(Duration::from_micros(500))]
    #[serde(with = "serde_duration")]
    pub max_completion_delay: Duration,
}

impl Default for IoConfig {
    fn default() -> Self {
        toml::from_str("").expect("all fields have defaults")
    }
}

mod serde_sector {
    use casblk_front::Sector;
    use serde::de::{Deserialize, Deserializer, Error};
    use serde::Serializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Sector, D::Error> {
        let n = bytesize::ByteSize::deserialize(de)?;
        Sector::try_from_bytes(n.0)
            .ok_or_else(|| D::Error::custom(format_args!("not aligned to 512B sectors: {}", n.0)))
    }

    // Required by serde interface.
    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(n: &Sector, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(n.bytes())
    }
}

mod serde_duration {
    use std::time::Duration;

    use serde::de::{Deserialize, Deserializer, Error};
    use serde::Serializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(de)?;
        humantime::parse_duration(&s).map_err(D::Error::custom)
    }

    // Required by serde interface.
    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_str(&humantime::format_duration(*d))
    }
}

fn de_size<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: serde::de::Deserializer<'de>,
    T: TryFrom<u64>,
{
    use serde::de::{Deserialize, Error};

    let n = bytesize::ByteSize::deserialize(de)?;
    n.0.try_into()
        .map_err(|_| D::Error::custom(format_args!("overflow: {}", n.0)))
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let check_lbs = |lbs: u32| lbs.is_power_of_two() && (512..=4096).contains(&lbs);
        ensure!(
            check_lbs(self.cache.logical_block_size),
            "cache `logical_block_size` must be a power of two in range [512, 4096]",
        );
        ensure!(
            self.cache.line_size.is_power_of_two()
                && self.cache.line_size >= self.cache.logical_block_size,
            "`line_size` must be a power of two not less than the logical block size",
        );
        ensure!(self.cache.size != Sector(0), "cache `size` must not be zero");

        let mut ids = BTreeSet::new();
        for core in &self.cores {
            ensure!(ids.insert(core.id), "duplicated core id {}", core.id);
            ensure!(core.size != Sector(0), "size of core {} must not be zero", core.id);
            ensure!(
                check_lbs(core.logical_block_size),
                "`logical_block_size` of core {} must be a power of two in range [512, 4096]",
                core.id,
            );
            ensure!(
                core.size.bytes() % u64::from(core.logical_block_size) == 0,
                "size of core {} must be a multiple of its logical block size",
                core.id,
            );
        }

        self.front_params()
            .validate()
            .context("invalid `max_io_size` or `split_alignment`")?;
        Ok(())
    }

    #[must_use]
    pub fn front_params(&self) -> FrontParams {
        FrontParams {
            max_io_size: self.io.max_io_size,
            split_alignment: self.io.split_alignment,
            io_flusher: self.io.io_flusher,
        }
    }

    /// Limits of the device caching data.
    #[must_use]
    pub fn cache_limits(&self) -> QueueLimits {
        let mut features = QueueFeatures::empty();
        features.set(QueueFeatures::WriteCache, self.cache.flush);
        features.set(QueueFeatures::Fua, self.cache.fua);
        QueueLimits {
            capacity: self.cache.size,
            logical_block_size: self.cache.logical_block_size,
            physical_block_size: 4096,
            io_min: 4096,
            max_sectors: Sector::from_bytes(1 << 20),
            features,
            ..QueueLimits::new()
        }
    }

    /// Limits of a backing core device.
    #[must_use]
    pub fn core_limits(core: &CoreConfig) -> QueueLimits {
        let mut features = QueueFeatures::Rotational;
        features.set(QueueFeatures::WriteCache, core.write_cache);
        features.set(QueueFeatures::Fua, core.fua);
        QueueLimits {
            capacity: core.size,
            logical_block_size: core.logical_block_size,
            physical_block_size: core.logical_block_size,
            io_min: core.logical_block_size,
            max_sectors: Sector::from_bytes(512 << 10),
            discard: core.discard.then_some(DiscardLimits {
                alignment: 0,
                granularity: core.logical_block_size,
                max_sectors: Sector(u32::MAX.into()),
            }),
            features,
            ..QueueLimits::new()
        }
    }
}

#[must_use]
pub fn cache_device_name(cache_id: u16) -> String {
    format!("cas-cache-{cache_id}")
}

#[must_use]
pub fn core_device_name(cache_id: u16, core_id: u16) -> String {
    format!("cas{cache_id}-{core_id}")
}

/// A running cache with its exported devices.
#[derive(Debug)]
pub struct Cache {
    id: u16,
    line_cache: Arc<LineCache>,
    device: ExportedDevice<MemoryVolume>,
    cores: Vec<ExportedDevice<MemoryVolume>>,
}

impl Cache {
    /// Build the volumes and exported devices of `config`, without publishing them yet.
    ///
    /// Threaded completions run on `rt`.
    pub fn new(config: &Config, ns: &Arc<Namespace>, rt: &tokio::runtime::Handle) -> Result<Self> {
        config.validate()?;
        let params = config.front_params();
        let nr_queues = match config.io.queues {
            0 => std::thread::available_parallelism()
                .context("failed to get available parallelism")?
                .get(),
            n => n,
        };
        let line_cache = Arc::new(LineCache::new(config.io.cache_lines));
        let volume = |id: u16, size: Sector| {
            let vol = MemoryVolume::new(id, size.bytes(), config.cache.line_size, nr_queues);
            match config.io.completion {
                CompletionMode::Inline => vol,
                CompletionMode::Threaded => {
                    vol.with_threaded_completion(rt.clone(), config.io.max_completion_delay)
                }
            }
        };

        let cache_limits = config.cache_limits();
        let front = Frontend::new(
            cache_device_name(config.cache.id),
            Arc::new(volume(0, config.cache.size)),
            Geometry::Cache,
            params,
        )?;
        let device = ExportedDevice::new(front, MemoryDisk::new(ns.clone(), cache_limits.clone()));

        let props = CacheProperties {
            limits: cache_limits,
            flush: config.cache.flush,
            fua: config.cache.fua,
            line_size: config.cache.line_size,
        };
        let cores = config
            .cores
            .iter()
            .map(|core| {
                let vol = volume(core.id, core.size).with_line_cache(line_cache.clone());
                let front = Frontend::new(
                    core_device_name(config.cache.id, core.id),
                    Arc::new(vol),
                    Geometry::Core(props.clone()),
                    params,
                )?;
                let front = match config.io.queues {
                    0 => front,
                    _ => front.with_queue_policy(RoundRobin::default()),
                };
                let obj = MemoryDisk::new(ns.clone(), Config::core_limits(core));
                Ok(ExportedDevice::new(front, obj))
            })
            .collect::<Result<Vec<_>, casblk_front::Error>>()?;

        Ok(Self {
            id: config.cache.id,
            line_cache,
            device,
            cores,
        })
    }

    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[must_use]
    pub fn device(&self) -> &ExportedDevice<MemoryVolume> {
        &self.device
    }

    #[must_use]
    pub fn cores(&self) -> &[ExportedDevice<MemoryVolume>] {
        &self.cores
    }

    #[must_use]
    pub fn line_cache(&self) -> &LineCache {
        &self.line_cache
    }

    /// Publish the cache device and all core devices.
    ///
    /// On failure, devices published so far are removed again.
    pub fn start(&self) -> Result<()> {
        let guard = scopeguard::guard((), |()| {
            if let Err(err) = self.stop() {
                tracing::error!(%err, "failed to roll back a partially started cache");
            }
        });
        self.device
            .create()
            .with_context(|| format!("failed to create {}", self.device.name()))?;
        for core in &self.cores {
            core.create()
                .with_context(|| format!("failed to create {}", core.name()))?;
        }
        scopeguard::ScopeGuard::into_inner(guard);
        tracing::info!(cache = self.id, cores = self.cores.len(), "cache started");
        Ok(())
    }

    /// Stop all core devices at once. Either all of them are stopped or none is.
    pub fn stop_cores(&self) -> Result<(), casblk_front::Error> {
        stop_all(&self.cores)
    }

    /// Stop core devices and then the cache device.
    pub fn stop(&self) -> Result<()> {
        self.stop_cores().context("failed to stop core devices")?;
        self.device
            .destroy()
            .with_context(|| format!("failed to stop {}", self.device.name()))?;
        Ok(())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.device.state() == DeviceState::Valid
    }
}
