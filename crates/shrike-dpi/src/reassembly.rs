//! TCP segment reassembly for classification
//!
//! Per flow and per direction, out-of-order segments are buffered against
//! the expected sequence number so inspectors always see a contiguous byte
//! stream. This exists only to give the classification loop a contiguous
//! view: once a flow is classified (or given up on), the tracker is no
//! longer consulted and raw bytes pass straight through.
//!
//! Buffering is bounded. Unbounded buffering is a denial-of-service vector,
//! so both the segment count and the total buffered bytes are capped; on
//! overflow the newest segment is dropped and an overflow indicator is
//! recorded, after which delivery degrades to best-effort in-order.

use std::collections::BTreeMap;

/// Maximum number of buffered out-of-order segments per direction.
pub const MAX_BUFFERED_SEGMENTS: usize = 32;

/// Maximum total buffered bytes per direction.
pub const MAX_BUFFERED_BYTES: usize = 64 * 1024;

/// What happened to a segment handed to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentDisposition {
    /// The segment (or its unseen suffix) was delivered contiguously,
    /// possibly together with previously buffered segments.
    Delivered,
    /// Ahead of the expected sequence number; buffered for later.
    Buffered,
    /// Entirely behind the expected sequence number; duplicate, discarded.
    Duplicate,
    /// Buffer limits exceeded; the segment was dropped.
    Dropped,
}

/// Sequence-number comparison on the 32-bit circle.
#[inline(always)]
fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Per-direction reassembly state.
#[derive(Debug, Default)]
pub struct ReassemblyTracker {
    /// Next in-order sequence number; `None` until the first segment seeds it.
    expected_seq: Option<u32>,
    /// Out-of-order segments keyed by sequence number.
    buffered: BTreeMap<u32, Vec<u8>>,
    buffered_bytes: usize,
    overflowed: bool,
}

impl ReassemblyTracker {
    /// Fresh tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the expected sequence number (from a SYN: ISN + 1).
    pub fn seed(&mut self, seq: u32) {
        if self.expected_seq.is_none() {
            self.expected_seq = Some(seq);
        }
    }

    /// Next expected in-order sequence number, if known.
    pub fn expected_seq(&self) -> Option<u32> {
        self.expected_seq
    }

    /// Whether the buffer cap was ever hit for this direction.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Number of segments currently buffered.
    pub fn buffered_segments(&self) -> usize {
        self.buffered.len()
    }

    /// Offer one segment; contiguous bytes (if any) are appended to `out`.
    pub fn push(&mut self, seq: u32, payload: &[u8], out: &mut Vec<u8>) -> SegmentDisposition {
        if payload.is_empty() {
            return SegmentDisposition::Duplicate;
        }
        let expected = match self.expected_seq {
            Some(e) => e,
            None => {
                // First data segment seen seeds the stream position.
                self.expected_seq = Some(seq);
                seq
            }
        };

        let seg_end = seq.wrapping_add(payload.len() as u32);
        if seq == expected {
            out.extend_from_slice(payload);
            self.expected_seq = Some(seg_end);
            self.drain_contiguous(out);
            SegmentDisposition::Delivered
        } else if seq_before(seq, expected) {
            if !seq_before(expected, seg_end) {
                // Fully below the watermark: already delivered.
                return SegmentDisposition::Duplicate;
            }
            // Partial overlap: deliver only the unseen suffix.
            let skip = expected.wrapping_sub(seq) as usize;
            out.extend_from_slice(&payload[skip..]);
            self.expected_seq = Some(seg_end);
            self.drain_contiguous(out);
            SegmentDisposition::Delivered
        } else {
            // Ahead of the stream: hold it until the gap fills.
            if self.buffered.contains_key(&seq) {
                // Retransmit of an already-buffered segment.
                return SegmentDisposition::Duplicate;
            }
            if self.buffered.len() >= MAX_BUFFERED_SEGMENTS
                || self.buffered_bytes + payload.len() > MAX_BUFFERED_BYTES
            {
                self.overflowed = true;
                return SegmentDisposition::Dropped;
            }
            self.buffered_bytes += payload.len();
            self.buffered.insert(seq, payload.to_vec());
            SegmentDisposition::Buffered
        }
    }

    /// Drain buffered segments that became contiguous, ascending by sequence.
    fn drain_contiguous(&mut self, out: &mut Vec<u8>) {
        while let Some(expected) = self.expected_seq {
            let Some((&seq, _)) = self.buffered.iter().next() else {
                break;
            };
            if seq_before(expected, seq) {
                break; // still a gap
            }
            let Some(data) = self.buffered.remove(&seq) else {
                break;
            };
            self.buffered_bytes -= data.len();
            let seg_end = seq.wrapping_add(data.len() as u32);
            if seq == expected {
                out.extend_from_slice(&data);
                self.expected_seq = Some(seg_end);
            } else if seq_before(expected, seg_end) {
                // Overlaps the watermark: deliver the unseen suffix.
                let skip = expected.wrapping_sub(seq) as usize;
                out.extend_from_slice(&data[skip..]);
                self.expected_seq = Some(seg_end);
            }
            // else: entirely stale, just dropped from the buffer.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deliver(tracker: &mut ReassemblyTracker, seq: u32, data: &[u8]) -> (SegmentDisposition, Vec<u8>) {
        let mut out = Vec::new();
        let disp = tracker.push(seq, data, &mut out);
        (disp, out)
    }

    #[test]
    fn in_order_passthrough() {
        let mut t = ReassemblyTracker::new();
        let (d, out) = deliver(&mut t, 0, b"abcd");
        assert_eq!(d, SegmentDisposition::Delivered);
        assert_eq!(out, b"abcd");
        assert_eq!(t.expected_seq(), Some(4));
    }

    #[test]
    fn out_of_order_converges_to_in_order_stream() {
        // [0,4), [8,12), [4,8) must yield the same bytes as [0,12) in order.
        let mut t = ReassemblyTracker::new();
        let mut stream = Vec::new();

        let mut out = Vec::new();
        assert_eq!(t.push(0, b"0123", &mut out), SegmentDisposition::Delivered);
        stream.extend_from_slice(&out);

        let mut out = Vec::new();
        assert_eq!(t.push(8, b"89ab", &mut out), SegmentDisposition::Buffered);
        stream.extend_from_slice(&out);

        let mut out = Vec::new();
        assert_eq!(t.push(4, b"4567", &mut out), SegmentDisposition::Delivered);
        stream.extend_from_slice(&out);

        assert_eq!(stream, b"0123456789ab");
        assert_eq!(t.expected_seq(), Some(12));
        assert_eq!(t.buffered_segments(), 0);
    }

    #[test]
    fn duplicate_is_discarded() {
        let mut t = ReassemblyTracker::new();
        let (_, _) = deliver(&mut t, 100, b"abcd");
        let (d, out) = deliver(&mut t, 100, b"abcd");
        assert_eq!(d, SegmentDisposition::Duplicate);
        assert!(out.is_empty());
    }

    #[test]
    fn partial_overlap_delivers_suffix_only() {
        let mut t = ReassemblyTracker::new();
        let (_, _) = deliver(&mut t, 0, b"abcd");
        let (d, out) = deliver(&mut t, 2, b"cdEF");
        assert_eq!(d, SegmentDisposition::Delivered);
        assert_eq!(out, b"EF");
        assert_eq!(t.expected_seq(), Some(6));
    }

    #[test]
    fn buffer_cap_drops_newest_and_records_overflow() {
        let mut t = ReassemblyTracker::new();
        t.seed(0);
        let mut out = Vec::new();
        // Fill the buffer with disjoint ahead-of-stream segments.
        for i in 0..MAX_BUFFERED_SEGMENTS as u32 {
            let seq = 1000 + i * 10;
            assert_eq!(t.push(seq, b"x", &mut out), SegmentDisposition::Buffered);
        }
        assert!(!t.overflowed());
        assert_eq!(
            t.push(900_000, b"y", &mut out),
            SegmentDisposition::Dropped
        );
        assert!(t.overflowed());
        assert_eq!(t.buffered_segments(), MAX_BUFFERED_SEGMENTS);
    }

    #[test]
    fn byte_cap_is_enforced() {
        let mut t = ReassemblyTracker::new();
        t.seed(0);
        let mut out = Vec::new();
        let big = vec![0u8; MAX_BUFFERED_BYTES];
        assert_eq!(t.push(10, &big, &mut out), SegmentDisposition::Buffered);
        assert_eq!(
            t.push(1_000_000, b"z", &mut out),
            SegmentDisposition::Dropped
        );
        assert!(t.overflowed());
    }

    #[test]
    fn sequence_wraparound() {
        let mut t = ReassemblyTracker::new();
        let (d, out) = deliver(&mut t, u32::MAX - 1, b"ab");
        assert_eq!(d, SegmentDisposition::Delivered);
        assert_eq!(out, b"ab");
        assert_eq!(t.expected_seq(), Some(0));
        let (d, out) = deliver(&mut t, 0, b"cd");
        assert_eq!(d, SegmentDisposition::Delivered);
        assert_eq!(out, b"cd");
    }
}
