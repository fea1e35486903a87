use crate::engine::{AllocMode, DataVec, Volume};
use crate::error::Error;
use crate::request::Segment;

/// Move a request's scatter list into an engine-owned buffer descriptor sized to exactly the
/// number of segments.
///
/// # Panics
///
/// Panic if the engine returns a descriptor too small for the segments.
pub fn adapt_segments<V: Volume + ?Sized>(
    volume: &V,
    segments: Vec<Segment>,
    mode: AllocMode,
) -> Result<DataVec, Error> {
    let Some(mut data) = volume.alloc_data(segments.len(), mode) else {
        tracing::warn!(nr_segments = segments.len(), ?mode, "cannot allocate buffer descriptor");
        return Err(Error::AllocationFailure);
    };
    for seg in segments {
        data.push(seg);
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, EngineIo, IoCompletion, IoDesc};
    use crate::request::Page;

    struct Io;

    impl EngineIo for Io {
        fn set_data(&mut self, _: DataVec) -> Result<(), EngineError> {
            Ok(())
        }

        fn set_completion(&mut self, _: IoCompletion) {}
    }

    struct Vol {
        capacity_bonus: isize,
    }

    impl Volume for Vol {
        type Io = Io;

        fn nr_queues(&self) -> usize {
            1
        }

        fn length(&self) -> u64 {
            0
        }

        fn new_io(&self, _: usize, _: IoDesc) -> Option<Io> {
            None
        }

        fn alloc_data(&self, nr_segments: usize, _: AllocMode) -> Option<DataVec> {
            if self.capacity_bonus == isize::MIN {
                return None;
            }
            DataVec::try_with_capacity(nr_segments.checked_add_signed(self.capacity_bonus)?)
        }

        fn submit_io(&self, _: Io) {}
        fn submit_discard(&self, _: Io) {}
        fn submit_flush(&self, _: Io) {}
    }

    fn segments() -> Vec<Segment> {
        let page = Page::new();
        vec![
            Segment::new(page.clone(), 0, 512),
            Segment::new(page, 512, 1024),
            Segment::new(Page::new(), 0, 4096),
        ]
    }

    #[test]
    fn exact_capacity() {
        let data = adapt_segments(&Vol { capacity_bonus: 0 }, segments(), AllocMode::NoIo).unwrap();
        assert_eq!(data.capacity(), 3);
        assert_eq!(data.len_bytes(), 512 + 1024 + 4096);
        let layout = data
            .segments()
            .iter()
            .map(|s| (s.offset(), s.len()))
            .collect::<Vec<_>>();
        assert_eq!(layout, [(0, 512), (512, 1024), (0, 4096)]);
    }

    #[test]
    fn allocation_failure() {
        let ret = adapt_segments(&Vol { capacity_bonus: isize::MIN }, segments(), AllocMode::Atomic);
        assert!(matches!(ret, Err(Error::AllocationFailure)));
    }

    #[test]
    #[should_panic = "exceeds buffer capacity"]
    fn undersized_descriptor_is_a_bug() {
        let _ = adapt_segments(&Vol { capacity_bonus: -1 }, segments(), AllocMode::NoIo);
    }
}
