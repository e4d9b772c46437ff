use bytes::Bytes;

use crate::{BidiError, BidiResult, Checksum, SegmentRules};

/// A bounded slice of an upload, stamped with its own checksum and the running
/// checksum of the whole object up to and including it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub offset: u64,
    pub bytes: Bytes,
    pub checksum: Checksum,
    /// `None` when the running checksum of the object is unknown (e.g. after a takeover
    /// whose server response carried no checksum)
    pub cumulative: Option<Checksum>,
    /// Last segment cut from its input buffer
    pub is_final: bool,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn end_offset(&self) -> u64 {
        self.offset + self.bytes.len() as u64
    }
}

/// Cuts buffers into segments no larger than `max_segment` bytes.
///
/// Every segment except possibly the last one of a buffer is at least `min_segment` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSegmenter {
    min_segment: usize,
    max_segment: usize,
}

impl ChunkSegmenter {
    pub fn new(min_segment: usize, max_segment: usize) -> BidiResult<Self> {
        if max_segment == 0 {
            return Err(BidiError::invalid("max segment size must be greater than zero"));
        }
        if min_segment > max_segment {
            return Err(BidiError::invalid(format!(
                "min segment size {} exceeds max segment size {}",
                min_segment, max_segment
            )));
        }
        Ok(Self {
            min_segment,
            max_segment,
        })
    }

    pub fn from_rules(rules: &SegmentRules) -> BidiResult<Self> {
        Self::new(rules.min_segment_bytes, rules.max_segment_bytes)
    }

    pub fn min_segment(&self) -> usize {
        self.min_segment
    }

    pub fn max_segment(&self) -> usize {
        self.max_segment
    }

    /// Segment a buffer that starts a new object
    pub fn segment(&self, data: Bytes) -> Segments {
        self.segment_at(data, 0, Some(Checksum::EMPTY))
    }

    /// Segment a buffer whose first byte sits at `offset` of the object, continuing the
    /// running checksum `running`
    pub fn segment_at(&self, data: Bytes, offset: u64, running: Option<Checksum>) -> Segments {
        Segments {
            data,
            offset,
            running,
            min_segment: self.min_segment,
            max_segment: self.max_segment,
            hold_short_tail: false,
        }
    }
}

/// Lazy iterator over the segments of one buffer
#[derive(Debug)]
pub struct Segments {
    data: Bytes,
    offset: u64,
    running: Option<Checksum>,
    min_segment: usize,
    max_segment: usize,
    hold_short_tail: bool,
}

impl Segments {
    /// Stop before a trailing piece shorter than the minimum segment size instead of
    /// yielding it; the piece stays available through [`Segments::remainder`]
    pub fn hold_short_tail(mut self) -> Self {
        self.hold_short_tail = true;
        self
    }

    /// Bytes not yet turned into segments
    pub fn remainder(&self) -> &Bytes {
        &self.data
    }

    /// Object offset of the next byte to be segmented
    pub fn next_offset(&self) -> u64 {
        self.offset
    }

    /// Running checksum through the last yielded segment
    pub fn running(&self) -> Option<Checksum> {
        self.running
    }
}

impl Iterator for Segments {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.data.is_empty() {
            return None;
        }
        let len = self.data.len().min(self.max_segment);
        if self.hold_short_tail && len < self.min_segment {
            return None;
        }

        let bytes = self.data.split_to(len);
        let checksum = Checksum::of(&bytes);
        let cumulative = self.running.map(|running| running.concat(&checksum));
        let offset = self.offset;

        self.running = cumulative;
        self.offset += len as u64;

        Some(Segment {
            offset,
            bytes,
            checksum,
            cumulative,
            is_final: self.data.is_empty(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let full = self.data.len().div_ceil(self.max_segment);
        if self.hold_short_tail {
            (0, Some(full))
        } else {
            (full, Some(full))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ten_bytes_in_threes() {
        let data = Bytes::from_static(b"0123456789");
        let segmenter = ChunkSegmenter::new(3, 3).unwrap();

        let segments: Vec<Segment> = segmenter.segment(data.clone()).collect();

        let lengths: Vec<usize> = segments.iter().map(Segment::len).collect();
        assert_eq!(lengths, vec![3, 3, 3, 1]);

        let bounds: Vec<(u64, u64)> = segments
            .iter()
            .map(|s| (s.offset, s.end_offset()))
            .collect();
        assert_eq!(bounds, vec![(0, 3), (3, 6), (6, 9), (9, 10)]);

        for segment in &segments {
            let start = segment.offset as usize;
            let expected = &data[start..start + segment.len()];
            assert_eq!(segment.checksum, Checksum::of(expected));
            assert_eq!(segment.cumulative, Some(Checksum::of(&data[..segment.end_offset() as usize])));
        }
        assert_eq!(segments.last().unwrap().cumulative, Some(Checksum::of(&data)));
        assert!(segments.last().unwrap().is_final);
        assert!(!segments[0].is_final);
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        let segmenter = ChunkSegmenter::new(1, 8).unwrap();
        assert_eq!(segmenter.segment(Bytes::new()).count(), 0);
    }

    #[test]
    fn test_hold_short_tail_keeps_remainder() {
        let segmenter = ChunkSegmenter::new(4, 4).unwrap();
        let mut segments = segmenter
            .segment_at(Bytes::from_static(b"abcdefghij"), 100, None)
            .hold_short_tail();

        let produced: Vec<Segment> = segments.by_ref().collect();

        assert_eq!(produced.len(), 2);
        assert_eq!(produced[0].offset, 100);
        assert_eq!(produced[1].offset, 104);
        assert!(produced.iter().all(|s| s.cumulative.is_none()));
        assert_eq!(segments.remainder().as_ref(), b"ij");
        assert_eq!(segments.next_offset(), 108);
    }

    #[test]
    fn test_rejects_inverted_window() {
        assert!(ChunkSegmenter::new(8, 4).is_err());
        assert!(ChunkSegmenter::new(0, 0).is_err());
    }

    proptest! {
        #[test]
        fn prop_segments_cover_input_exactly(
            data in proptest::collection::vec(any::<u8>(), 0..512),
            min in 1usize..32,
            extra in 0usize..32,
        ) {
            let max = min + extra;
            let segmenter = ChunkSegmenter::new(min, max).unwrap();
            let segments: Vec<Segment> = segmenter.segment(Bytes::from(data.clone())).collect();

            let mut rebuilt = Vec::with_capacity(data.len());
            let mut expected_offset = 0u64;
            for (i, segment) in segments.iter().enumerate() {
                prop_assert!(segment.len() <= max);
                if i + 1 < segments.len() {
                    prop_assert!(segment.len() >= min);
                }
                prop_assert_eq!(segment.offset, expected_offset);
                expected_offset = segment.end_offset();
                rebuilt.extend_from_slice(&segment.bytes);
            }
            prop_assert_eq!(&rebuilt, &data);
            if let Some(last) = segments.last() {
                prop_assert_eq!(last.cumulative, Some(Checksum::of(&data)));
            }
        }
    }
}
