//! Engine statistics
//!
//! Lock-free counters shared by all partitions; readers take a consistent
//! enough snapshot with relaxed loads.

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide counters (cache-line aligned).
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Packets processed.
    pub packets: AtomicU64,
    /// Payload bytes processed.
    pub bytes: AtomicU64,
    /// Flows created.
    pub flows_created: AtomicU64,
    /// Flows removed by TCP teardown.
    pub flows_terminated: AtomicU64,
    /// Flows removed by idle eviction.
    pub flows_evicted: AtomicU64,
    /// Flows that resolved to a concrete protocol.
    pub classified: AtomicU64,
    /// Flows that resolved Unknown.
    pub unknown: AtomicU64,
    /// Out-of-order segments buffered for reassembly.
    pub segments_buffered: AtomicU64,
    /// Segments dropped because a reassembly buffer was full.
    pub segments_dropped: AtomicU64,
}

impl EngineStats {
    #[inline(always)]
    pub(crate) fn record_packet(&self, payload_len: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload_len as u64, Ordering::Relaxed);
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            flows_created: self.flows_created.load(Ordering::Relaxed),
            flows_terminated: self.flows_terminated.load(Ordering::Relaxed),
            flows_evicted: self.flows_evicted.load(Ordering::Relaxed),
            classified: self.classified.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            segments_buffered: self.segments_buffered.load(Ordering::Relaxed),
            segments_dropped: self.segments_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StatsSnapshot {
    pub packets: u64,
    pub bytes: u64,
    pub flows_created: u64,
    pub flows_terminated: u64,
    pub flows_evicted: u64,
    pub classified: u64,
    pub unknown: u64,
    pub segments_buffered: u64,
    pub segments_dropped: u64,
}
