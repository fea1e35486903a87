//! Front-end I/O path of a block cache.
//!
//! Incoming [`BlockRequest`]s of an exported device are classified into flush, discard or data
//! requests, split into engine-sized pieces and submitted to a caching engine [`Volume`]. The
//! completions of all pieces are folded back into exactly one completion of the original request.
//! [`ExportedDevice`] manages the lifecycle of the virtual device on top of an external
//! registration layer ([`ExportedObject`]).
mod aggregate;
mod buffer;
mod defer;
mod device;
mod dispatch;
mod engine;
mod error;
mod limits;
mod request;
mod split;

use std::{fmt, ops};

pub use aggregate::{LoopRef, SubRef};
pub use buffer::adapt_segments;
pub use defer::ExecContext;
pub use device::{stop_all, DeviceOps, DeviceState, ExportedDevice, ExportedObject};
pub use dispatch::{FrontParams, Frontend};
pub use engine::{
    AllocMode, DataVec, Direction, EngineError, EngineIo, Fixed, IoCompletion, IoDesc, PerCpu,
    QueuePolicy, RoundRobin, Volume,
};
pub use error::Error;
pub use limits::{CacheProperties, DiscardLimits, Geometry, QueueFeatures, QueueLimits};
pub use request::{BlockRequest, IoDone, Page, ReqFlags, ReqOp, Segment, SplitRequest, PAGE_SIZE};
pub use split::SplitPlan;

/// Size or offset in unit of sectors (512bytes).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sector(pub u64);

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)?;
        "s".fmt(f)
    }
}

impl Sector {
    pub const SHIFT: u32 = 9;
    pub const SIZE: u32 = 1 << Self::SHIFT;

    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Self {
        match Self::try_from_bytes(bytes) {
            Some(sec) => sec,
            None => panic!("bytes is not multiples of sectors"),
        }
    }

    #[must_use]
    pub const fn try_from_bytes(bytes: u64) -> Option<Self> {
        if bytes % Self::SIZE as u64 == 0 {
            Some(Self(bytes >> Self::SHIFT))
        } else {
            None
        }
    }

    /// Round down to whole sectors.
    #[must_use]
    pub const fn from_bytes_floor(bytes: u64) -> Self {
        Self(bytes >> Self::SHIFT)
    }

    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self.0.checked_mul(Self::SIZE as u64) {
            Some(bytes) => bytes,
            None => panic!("overflow"),
        }
    }
}

impl ops::Add for Sector {
    type Output = Sector;

    fn add(self, rhs: Sector) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl ops::Sub for Sector {
    type Output = Sector;

    fn sub(self, rhs: Sector) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl ops::Mul<u64> for Sector {
    type Output = Self;

    fn mul(self, rhs: u64) -> Self::Output {
        Self(self.0 * rhs)
    }
}
