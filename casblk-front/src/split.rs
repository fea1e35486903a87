//! Splitting of oversized data requests into engine submissions.
use rustix::io::Errno;

use crate::aggregate::LoopRef;
use crate::buffer::adapt_segments;
use crate::dispatch::FrontParams;
use crate::engine::{AllocMode, Direction, EngineError, EngineIo, IoDesc, Volume};
use crate::request::{BlockRequest, IoDone, ReqFlags, ReqOp, SplitRequest};

/// The `(offset, len)` pieces a data request is split into.
///
/// Every piece but the last ends on an absolute multiple of the alignment, and no piece is longer
/// than the maximum size.
#[derive(Debug, Clone)]
pub struct SplitPlan {
    offset: u64,
    remaining: u64,
    max_size: u64,
    alignment: u64,
}

impl SplitPlan {
    /// # Panics
    ///
    /// Panic if `alignment` is not a power of two, or `max_size` is not a non-zero multiple of it.
    #[must_use]
    pub fn new(offset: u64, len: u64, max_size: u64, alignment: u64) -> Self {
        assert!(alignment.is_power_of_two());
        assert!(max_size != 0 && max_size % alignment == 0);
        Self {
            offset,
            remaining: len,
            max_size,
            alignment,
        }
    }
}

impl Iterator for SplitPlan {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let len = if self.remaining <= self.max_size {
            self.remaining
        } else {
            self.max_size - (self.offset & (self.alignment - 1))
        };
        let piece = (self.offset, len);
        self.offset += len;
        self.remaining -= len;
        Some(piece)
    }
}

/// The progress of the splitting loop: before the first submission the caller's completion is
/// still held directly, afterwards it belongs to the aggregator.
enum Stage {
    Unstarted(IoDone),
    Started(LoopRef),
}

/// Split a read or write request and submit every piece to `volume`.
pub(crate) fn handle_data<V: Volume + ?Sized>(
    volume: &V,
    queue: usize,
    params: &FrontParams,
    req: BlockRequest,
    mode: AllocMode,
) {
    let BlockRequest {
        op,
        flags,
        offset,
        len,
        class,
        segments,
        done,
    } = req;
    if len == 0 {
        tracing::warn!(offset, "empty data request");
        done.end(0, Err(Errno::INVAL));
        return;
    }
    if offset.checked_add(len).is_none() {
        tracing::warn!(offset, len, "data request beyond the addressable range");
        done.end(len, Err(Errno::INVAL));
        return;
    }
    let dir = match op {
        ReqOp::Read => Direction::Read,
        ReqOp::Write => Direction::Write,
        ReqOp::Flush | ReqOp::Discard => unreachable!("{op:?} request on the data path"),
    };

    let mut rest = SplitRequest {
        offset,
        len,
        segments,
    };
    let mut stage = Stage::Unstarted(done);
    for (_, piece_len) in SplitPlan::new(offset, len, params.max_io_size, params.split_alignment) {
        let piece = if piece_len == rest.len {
            rest.take_all()
        } else {
            rest.take_front(piece_len)
        };
        let desc = IoDesc {
            offset: piece.offset,
            len: piece.len,
            dir,
            class,
            flags: flags - ReqFlags::Preflush,
        };
        stage = match submit_split(volume, queue, len, desc, piece, mode, stage) {
            Ok(stage) => stage,
            Err((Stage::Unstarted(done), err)) => return done.end(len, Err(err.to_errno())),
            Err((Stage::Started(lref), err)) => return lref.release(Some(err)),
        };
    }
    match stage {
        Stage::Started(lref) => lref.release(None),
        Stage::Unstarted(_) => unreachable!("non-empty request produced no piece"),
    }
}

fn submit_split<V: Volume + ?Sized>(
    volume: &V,
    queue: usize,
    total: u64,
    desc: IoDesc,
    piece: SplitRequest,
    mode: AllocMode,
    stage: Stage,
) -> Result<Stage, (Stage, EngineError)> {
    let Ok(data) = adapt_segments(volume, piece.segments, mode) else {
        return Err((stage, EngineError::NO_MEM));
    };
    let Some(mut io) = volume.new_io(queue, desc) else {
        tracing::warn!(offset = desc.offset, len = desc.len, "cannot allocate engine request");
        return Err((stage, EngineError::NO_MEM));
    };
    if let Err(err) = io.set_data(data) {
        tracing::error!(%err, offset = desc.offset, "cannot attach buffer to engine request");
        return Err((stage, EngineError::INVAL));
    }

    let lref = match stage {
        Stage::Unstarted(done) => LoopRef::begin(done, total),
        Stage::Started(lref) => lref,
    };
    let sref = lref.add_reference();
    io.set_completion(Box::new(move |ret| sref.complete(ret)));
    volume.submit_io(io);
    Ok(Stage::Started(lref))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;
    const KIB: u64 = 1 << 10;

    fn plan(offset: u64, len: u64) -> Vec<(u64, u64)> {
        SplitPlan::new(offset, len, 32 * MIB, 128 * KIB).collect()
    }

    #[test]
    fn fits_in_one_piece() {
        assert_eq!(plan(4096, 32 * MIB), [(4096, 32 * MIB)]);
        assert_eq!(plan(0, 512), [(0, 512)]);
        assert_eq!(plan(0, 0), []);
    }

    #[test]
    fn aligned_split() {
        assert_eq!(plan(0, 40 * MIB), [(0, 32 * MIB), (32 * MIB, 8 * MIB)]);
    }

    #[test]
    fn unaligned_start() {
        let pieces = plan(4 * KIB, 70 * MIB);
        assert_eq!(
            pieces,
            [
                (4 * KIB, 32 * MIB - 4 * KIB),
                (32 * MIB, 32 * MIB),
                (64 * MIB, 6 * MIB + 4 * KIB),
            ],
        );
    }

    #[test]
    fn pieces_are_contiguous_and_aligned() {
        for (offset, len) in [(512, 100 * MIB + 3), (128 * KIB - 1, 65 * MIB), (7, 33 * MIB)] {
            let pieces = plan(offset, len);
            assert_eq!(pieces.iter().map(|p| p.1).sum::<u64>(), len);
            assert_eq!(pieces[0].0, offset);
            for w in pieces.windows(2) {
                assert_eq!(w[0].0 + w[0].1, w[1].0);
                assert_eq!(w[1].0 % (128 * KIB), 0);
            }
            assert!(pieces.iter().all(|p| 0 < p.1 && p.1 <= 32 * MIB));
        }
    }

    #[test]
    #[should_panic]
    fn non_power_of_two_alignment() {
        let _ = SplitPlan::new(0, 1, 3 * 4096, 3 * 1024);
    }
}
