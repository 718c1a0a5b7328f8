//! Partitioned flow table
//!
//! The table owns N independent partitions, each a hash index over a slab
//! arena of flow slots. A flow's partition is chosen by its
//! direction-insensitive hash and never changes, which is what makes
//! shared-nothing parallel processing safe: one worker per partition, no
//! cross-partition coordination on the packet path.
//!
//! Each partition is guarded by its own `parking_lot::Mutex` — never a
//! global lock — so callers that serialize per partition pay only
//! uncontended lock traffic.
//!
//! Records live in slab slots addressed by index. Deferred deletion
//! (`delete_later`) unlinks the record from the hash index immediately but
//! recycles the slot only on `flush_deferred`, so a reference obtained
//! earlier in the same processing pass is never freed underneath its user.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use shrike_common::{flow_hash, DissectionInfo, FlowKey, KeyError, L4Proto, Timestamp};

use crate::proto::ProtocolMask;
use crate::tracking::FlowRecord;

/// Flow-table errors.
#[derive(Debug, Error)]
pub enum TableError {
    /// Strict mode: the target partition is at capacity and refuses new flows.
    #[error("flow table partition at capacity (strict mode)")]
    CapacityExceeded,

    /// The dissection record could not produce a flow hash.
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Invoked exactly once per record immediately before its memory is
/// reclaimed; external collaborators release attached resources here.
pub type FlowCleaner = Box<dyn Fn(&mut FlowRecord) + Send + Sync>;

/// How the table allocates flow slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableMode {
    /// Size the index for the expected load; slots are allocated on demand
    /// up to that bound.
    Dynamic {
        /// Expected number of concurrent flows across all partitions.
        expected_flows: usize,
    },
    /// Pre-allocate a fixed pool of flow slots up front, trading
    /// flexibility for allocation-latency predictability.
    Pooled {
        /// Total pool size across all partitions.
        start_pool_size: usize,
    },
}

/// Flow-table configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// Allocation mode.
    pub mode: TableMode,
    /// At capacity: `true` rejects new flows (fails closed), `false` evicts
    /// the least-recently-seen flow in the target partition to make room
    /// (fails open — this may discard the classification state of an
    /// unrelated flow, a trade-off the caller accepts by choosing it).
    pub strict: bool,
    /// Number of independent partitions (≥ 1).
    pub num_partitions: u16,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            mode: TableMode::Dynamic {
                expected_flows: 1 << 16,
            },
            strict: false,
            num_partitions: 1,
        }
    }
}

/// One slab slot.
type Slot = Option<FlowRecord>;

/// An independently-owned shard of the table.
#[derive(Debug)]
struct Partition {
    /// Key → slot index for live, reachable flows.
    index: HashMap<FlowKey, usize>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    /// Slots unlinked by `delete_later`, awaiting `flush_deferred`.
    deferred: Vec<usize>,
    /// Slots in use (reachable + deferred).
    occupied: usize,
    capacity: usize,
    preallocated: bool,
}

impl Partition {
    fn new(capacity: usize, preallocated: bool) -> Self {
        let capacity = capacity.max(1);
        let (slots, free) = if preallocated {
            let slots: Vec<Slot> = (0..capacity).map(|_| None).collect();
            let free: Vec<usize> = (0..capacity).rev().collect();
            (slots, free)
        } else {
            (Vec::new(), Vec::new())
        };
        Self {
            index: HashMap::with_capacity(capacity.min(1 << 20)),
            slots,
            free,
            deferred: Vec::new(),
            occupied: 0,
            capacity,
            preallocated,
        }
    }

    fn lookup(&self, key: &FlowKey) -> Option<usize> {
        self.index
            .get(key)
            .or_else(|| self.index.get(&key.reverse()))
            .copied()
    }

    fn at_capacity(&self) -> bool {
        self.occupied >= self.capacity
    }

    fn take_slot(&mut self) -> Option<usize> {
        if let Some(slot) = self.free.pop() {
            return Some(slot);
        }
        if !self.preallocated && self.slots.len() < self.capacity {
            self.slots.push(None);
            return Some(self.slots.len() - 1);
        }
        None
    }

    fn insert(&mut self, record: FlowRecord) -> usize {
        let slot = self
            .take_slot()
            .expect("caller ensured a free slot exists");
        self.index.insert(record.key, slot);
        self.slots[slot] = Some(record);
        self.occupied += 1;
        slot
    }

    /// The reachable flow with the oldest last-seen stamp.
    fn oldest(&self) -> Option<usize> {
        self.index
            .values()
            .copied()
            .min_by_key(|&slot| self.slots[slot].as_ref().map(|r| r.last_seen))
    }

    /// Reclaim one slot, running the cleaner on its record.
    fn reclaim(&mut self, slot: usize, cleaner: Option<&FlowCleaner>) {
        if let Some(mut record) = self.slots[slot].take() {
            if let Some(clean) = cleaner {
                clean(&mut record);
            }
            self.index.remove(&record.key);
            self.occupied -= 1;
            self.free.push(slot);
        }
    }

    /// Unlink from the index now, reclaim the slot later.
    fn unlink(&mut self, slot: usize) {
        if let Some(record) = self.slots[slot].as_ref() {
            self.index.remove(&record.key);
            self.deferred.push(slot);
        }
    }

    fn flush_deferred(&mut self, cleaner: Option<&FlowCleaner>) -> usize {
        let deferred = std::mem::take(&mut self.deferred);
        let count = deferred.len();
        for slot in deferred {
            if let Some(mut record) = self.slots[slot].take() {
                if let Some(clean) = cleaner {
                    clean(&mut record);
                }
                self.occupied -= 1;
                self.free.push(slot);
            }
        }
        count
    }
}

/// Whether `find_or_create` found an existing record or made a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindOrCreate {
    /// The key already had a live record.
    Found,
    /// A record was created for a never-seen key.
    Created,
}

/// Exclusive reference to one live flow record.
///
/// Holds the owning partition's lock for its lifetime, so the record cannot
/// be evicted or mutated elsewhere while the reference is alive.
#[derive(Debug)]
pub struct FlowRef<'a> {
    guard: MutexGuard<'a, Partition>,
    slot: usize,
}

impl FlowRef<'_> {
    fn record(&self) -> &FlowRecord {
        self.guard.slots[self.slot]
            .as_ref()
            .expect("FlowRef always points at an occupied slot")
    }

    fn record_mut(&mut self) -> &mut FlowRecord {
        self.guard.slots[self.slot]
            .as_mut()
            .expect("FlowRef always points at an occupied slot")
    }
}

impl Deref for FlowRef<'_> {
    type Target = FlowRecord;

    fn deref(&self) -> &FlowRecord {
        self.record()
    }
}

impl DerefMut for FlowRef<'_> {
    fn deref_mut(&mut self) -> &mut FlowRecord {
        self.record_mut()
    }
}

/// The partitioned flow table.
pub struct FlowTable {
    partitions: Vec<Mutex<Partition>>,
    cleaner: RwLock<Option<FlowCleaner>>,
    strict: bool,
    evictions: AtomicU64,
}

impl FlowTable {
    /// Allocate partitions sized for the configured load.
    pub fn new(config: TableConfig) -> Self {
        let num_partitions = config.num_partitions.max(1) as usize;
        let (total, preallocated) = match config.mode {
            TableMode::Dynamic { expected_flows } => (expected_flows, false),
            TableMode::Pooled { start_pool_size } => (start_pool_size, true),
        };
        let per_partition = total.div_ceil(num_partitions);
        let partitions = (0..num_partitions)
            .map(|_| Mutex::new(Partition::new(per_partition, preallocated)))
            .collect();
        info!(
            num_partitions,
            per_partition_capacity = per_partition,
            preallocated,
            strict = config.strict,
            "flow table created"
        );
        Self {
            partitions,
            cleaner: RwLock::new(None),
            strict: config.strict,
            evictions: AtomicU64::new(0),
        }
    }

    /// Number of partitions.
    pub fn num_partitions(&self) -> u16 {
        self.partitions.len() as u16
    }

    /// Deterministic, stable hash → partition mapping. The same key always
    /// resolves to the same partition for the lifetime of the table.
    #[inline(always)]
    pub fn partition_for(&self, hash: u32) -> u16 {
        (hash % self.partitions.len() as u32) as u16
    }

    /// Live (reachable) flows across all partitions.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().index.len()).sum()
    }

    /// True when no live flows exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flows evicted under capacity pressure so far.
    pub fn capacity_evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Install the cleanup callback. It runs exactly once per record,
    /// immediately before the record's memory is reclaimed.
    pub fn set_cleanup_callback(&self, cleaner: FlowCleaner) {
        *self.cleaner.write() = Some(cleaner);
    }

    /// Read-path lookup in one partition. Never mutates; `None` on absence.
    pub fn find(&self, partition_id: u16, info: &DissectionInfo) -> Option<FlowRef<'_>> {
        let guard = self.partitions.get(partition_id as usize)?.lock();
        let key = FlowKey::from_dissection(info);
        let slot = guard.lookup(&key)?;
        Some(FlowRef { guard, slot })
    }

    /// Partition-atomic lookup-then-insert.
    ///
    /// On creation the record is seeded with the given candidate mask and
    /// reordering flag (both fixed for the flow's lifetime) and stamped for
    /// aging.
    pub fn find_or_create(
        &self,
        info: &DissectionInfo,
        protocols_to_inspect: ProtocolMask,
        tcp_reordering_enabled: bool,
        timestamp: Timestamp,
    ) -> Result<(FlowRef<'_>, FindOrCreate), TableError> {
        let hash = flow_hash(info)?;
        let partition_id = self.partition_for(hash);
        let mut guard = self.partitions[partition_id as usize].lock();
        let key = FlowKey::from_dissection(info);

        if let Some(slot) = guard.lookup(&key) {
            return Ok((FlowRef { guard, slot }, FindOrCreate::Found));
        }

        if guard.at_capacity() {
            if self.strict {
                return Err(TableError::CapacityExceeded);
            }
            // Fail open: sacrifice the least-recently-seen flow in this
            // partition. Deferred slots are not candidates; if everything
            // is deferred there is genuinely no room.
            let Some(victim) = guard.oldest() else {
                return Err(TableError::CapacityExceeded);
            };
            debug!(partition_id, "evicting flow under capacity pressure");
            let cleaner = self.cleaner.read();
            guard.reclaim(victim, cleaner.as_ref());
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        let record = FlowRecord::new(
            key,
            hash,
            protocols_to_inspect,
            tcp_reordering_enabled,
            timestamp,
            info.l4_proto == L4Proto::Tcp,
        );
        let slot = guard.insert(record);
        Ok((FlowRef { guard, slot }, FindOrCreate::Created))
    }

    /// Remove a flow immediately, reclaiming its slot.
    pub fn delete(&self, flow: FlowRef<'_>) {
        let FlowRef { mut guard, slot } = flow;
        let cleaner = self.cleaner.read();
        guard.reclaim(slot, cleaner.as_ref());
    }

    /// Unlink a flow from its partition now, reclaim its memory later.
    ///
    /// The record stops being reachable via `find`/`find_or_create`, but
    /// its slot survives until [`FlowTable::flush_deferred`], so any
    /// reference fetched earlier in the current processing pass stays
    /// valid.
    pub fn delete_later(&self, flow: FlowRef<'_>) {
        let FlowRef { mut guard, slot } = flow;
        guard.unlink(slot);
    }

    /// Reclaim every slot parked by `delete_later`. Call when the current
    /// processing pass (e.g. packet batch) is finished.
    pub fn flush_deferred(&self) -> usize {
        let cleaner = self.cleaner.read();
        self.partitions
            .iter()
            .map(|p| p.lock().flush_deferred(cleaner.as_ref()))
            .sum()
    }

    /// Cooperative aging sweep: remove flows idle for longer than
    /// `idle_timeout` ticks relative to `now`. The table runs no timer of
    /// its own; the caller picks the cadence.
    pub fn evict_idle(&self, now: Timestamp, idle_timeout: u64) -> usize {
        let cleaner = self.cleaner.read();
        let mut evicted = 0;
        for partition in &self.partitions {
            let mut guard = partition.lock();
            let stale: Vec<usize> = guard
                .index
                .values()
                .copied()
                .filter(|&slot| {
                    guard.slots[slot]
                        .as_ref()
                        .is_some_and(|r| now.since(r.last_seen) > idle_timeout)
                })
                .collect();
            for slot in stale {
                guard.reclaim(slot, cleaner.as_ref());
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, "idle flows evicted");
        }
        evicted
    }
}

impl Drop for FlowTable {
    fn drop(&mut self) {
        // Releasing the table releases every live record, deferred ones
        // included, invoking the cleanup callback for each.
        let cleaner = self.cleaner.read();
        for partition in &self.partitions {
            let mut guard = partition.lock();
            guard.flush_deferred(cleaner.as_ref());
            let live: Vec<usize> = guard.index.values().copied().collect();
            for slot in live {
                guard.reclaim(slot, cleaner.as_ref());
            }
        }
    }
}
