//! The engine façade: one entry point per packet
//!
//! [`DpiEngine`] ties the partitioned flow table, the TCP trackers, the
//! reassembly buffers and the classification loop together. The caller
//! dissects packets itself and hands the engine a [`DissectionInfo`] plus
//! the L7 payload slice; the engine does the rest and reports what the flow
//! resolved to.

use std::sync::atomic::Ordering;

use serde::Deserialize;
use tracing::debug;

use shrike_common::{Direction, DissectionInfo, TcpHeaderFlags, Timestamp};

use crate::classify::{
    AccuracyConfig, Classifier, ClassifyOutcome, DEFAULT_MAX_TRIALS,
};
use crate::inspectors::InspectorRegistry;
use crate::proto::{L7Resolution, ProtocolMask};
use crate::reassembly::SegmentDisposition;
use crate::stats::{EngineStats, StatsSnapshot};
use crate::table::{FindOrCreate, FlowCleaner, FlowTable, TableConfig, TableError};
use crate::tracking::TcpPhase;

/// Default idle-eviction threshold, in caller ticks.
pub const DEFAULT_IDLE_TIMEOUT: u64 = 30;

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DpiConfig {
    /// Flow-table sizing and capacity policy.
    pub table: TableConfig,
    /// Protocols new flows are inspected for. Changing this affects future
    /// flows only; existing flows keep the mask they were created with.
    pub protocols_to_inspect: ProtocolMask,
    /// Classification-attempt budget per flow.
    pub max_trials: u16,
    /// Inspector accuracy levels.
    pub accuracy: AccuracyConfig,
    /// Whether new TCP flows get in-order reassembly. Snapshot per flow at
    /// creation time.
    pub tcp_reordering: bool,
    /// Flows idle for more than this many ticks are removed by
    /// [`DpiEngine::evict_idle`].
    pub idle_timeout: u64,
}

impl Default for DpiConfig {
    fn default() -> Self {
        Self {
            table: TableConfig::default(),
            protocols_to_inspect: ProtocolMask::ALL,
            max_trials: DEFAULT_MAX_TRIALS,
            accuracy: AccuracyConfig::default(),
            tcp_reordering: true,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// What one packet did to its flow.
#[derive(Debug, Clone)]
pub struct PacketOutcome {
    /// Classification state of the flow after this packet.
    pub l7: L7Resolution,
    /// True when this packet created the flow.
    pub flow_created: bool,
    /// True when this packet completed TCP teardown and the flow was
    /// removed from the table.
    pub flow_terminated: bool,
}

/// The deep-packet-inspection engine.
pub struct DpiEngine {
    config: DpiConfig,
    table: FlowTable,
    registry: InspectorRegistry,
    stats: EngineStats,
}

impl DpiEngine {
    /// Engine with the built-in inspector set.
    pub fn new(config: DpiConfig) -> Self {
        Self::with_registry(config, InspectorRegistry::with_defaults())
    }

    /// Engine with a caller-assembled inspector registry.
    pub fn with_registry(config: DpiConfig, registry: InspectorRegistry) -> Self {
        let table = FlowTable::new(config.table.clone());
        Self {
            config,
            table,
            registry,
            stats: EngineStats::default(),
        }
    }

    /// The flow table, for direct lookups and deferred-deletion control.
    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    /// Engine-wide counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Install the flow cleanup callback on the underlying table.
    pub fn set_cleanup_callback(&self, cleaner: FlowCleaner) {
        self.table.set_cleanup_callback(cleaner);
    }

    /// Process one dissected packet.
    ///
    /// Looks up (or creates) the flow, advances TCP tracking, feeds the
    /// payload through reassembly while the flow is undetermined, runs one
    /// classification attempt on any contiguous bytes, and removes the flow
    /// when TCP teardown completes.
    pub fn process_packet(
        &self,
        info: &DissectionInfo,
        payload: &[u8],
        timestamp: Timestamp,
    ) -> Result<PacketOutcome, TableError> {
        self.stats.record_packet(payload.len());

        let (mut flow, status) = self.table.find_or_create(
            info,
            self.config.protocols_to_inspect,
            self.config.tcp_reordering,
            timestamp,
        )?;
        let flow_created = status == FindOrCreate::Created;
        if flow_created {
            self.stats.flows_created.fetch_add(1, Ordering::Relaxed);
        }

        // The record was found via the verbatim key or its reverse, so the
        // orientation is always recoverable.
        let direction = flow
            .key
            .direction_of(info)
            .unwrap_or(Direction::ClientToServer);

        flow.touch(payload.len(), timestamp);

        if let Some(meta) = &info.tcp {
            if let Some(tcp) = flow.tcp.as_mut() {
                tcp.observe(direction, meta);
            }
            if meta.flags.contains(TcpHeaderFlags::SYN) {
                if let Some(reasm) = flow.reassembly.as_mut() {
                    // Data starts one past the ISN.
                    reasm.get_mut(direction).seed(meta.seq.wrapping_add(1));
                }
            }
        }

        // While the flow is undetermined, TCP payload goes through the
        // per-direction reassembler so inspectors only ever see contiguous
        // bytes. Resolved flows skip all of this.
        let mut delivered = Vec::new();
        let data: &[u8] = match (&info.tcp, flow.l7.is_undetermined()) {
            (Some(meta), true) => {
                if let Some(reasm) = flow.reassembly.as_mut() {
                    let disposition =
                        reasm.get_mut(direction).push(meta.seq, payload, &mut delivered);
                    match disposition {
                        SegmentDisposition::Buffered => {
                            self.stats
                                .segments_buffered
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        SegmentDisposition::Dropped => {
                            self.stats
                                .segments_dropped
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        SegmentDisposition::Delivered | SegmentDisposition::Duplicate => {}
                    }
                    &delivered
                } else {
                    payload
                }
            }
            _ => payload,
        };

        // Empty payloads (pure ACKs, buffered-only segments) never consume
        // a classification trial.
        if !data.is_empty() && flow.l7.is_undetermined() {
            let classifier = Classifier::new(
                &self.registry,
                &self.config.accuracy,
                self.config.max_trials,
            );
            match classifier.classify_packet(&mut flow, info, data) {
                ClassifyOutcome::Classified(proto) => {
                    debug!(protocol = proto.name(), "flow classified");
                    self.stats
                        .classified
                        .fetch_add(1, Ordering::Relaxed);
                    // Inspectors are done with this flow; release the
                    // reassembly buffers.
                    flow.reassembly = None;
                }
                ClassifyOutcome::GaveUp => {
                    self.stats
                        .unknown
                        .fetch_add(1, Ordering::Relaxed);
                }
                ClassifyOutcome::Pending | ClassifyOutcome::Skipped => {}
            }
        }

        let l7 = flow.l7;
        let flow_terminated = flow.tcp_phase() == Some(TcpPhase::Closed);
        if flow_terminated {
            debug!("tcp teardown complete, removing flow");
            self.stats
                .flows_terminated
                .fetch_add(1, Ordering::Relaxed);
            self.table.delete(flow);
        }

        Ok(PacketOutcome {
            l7,
            flow_created,
            flow_terminated,
        })
    }

    /// Run one idle-eviction sweep at time `now`; returns flows removed.
    pub fn evict_idle(&self, now: Timestamp) -> usize {
        let evicted = self.table.evict_idle(now, self.config.idle_timeout);
        self.stats
            .flows_evicted
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }
}
