//! Shrike DPI - Flow tracking and protocol classification
//!
//! A deep-packet-inspection engine built around three pieces:
//! - A partitioned flow table with deterministic hash-to-partition mapping,
//!   bidirectional flow identity, and per-partition locking for
//!   shared-nothing parallelism
//! - An iterative classification loop that narrows a per-flow candidate set
//!   packet by packet under a bounded trial budget
//! - TCP connection tracking with optional in-order reassembly, so
//!   inspectors only ever see contiguous stream bytes
//!
//! The caller owns packet capture, header dissection and time: every packet
//! arrives as a [`shrike_common::DissectionInfo`] plus a payload slice and a
//! caller-chosen [`shrike_common::Timestamp`].
//!
//! ```
//! use shrike_dpi::{DpiConfig, DpiEngine};
//! use shrike_common::{DissectionInfo, Timestamp};
//!
//! let engine = DpiEngine::new(DpiConfig::default());
//! let info = DissectionInfo::udp(
//!     "192.168.1.10".parse().unwrap(), 17500,
//!     "192.168.1.255".parse().unwrap(), 17500,
//! );
//! let beacon = br#"{"host_int": 1, "namespaces": [], "version": [2, 0], "port": 17500}"#;
//! let outcome = engine.process_packet(&info, beacon, Timestamp::new(1)).unwrap();
//! println!("flow resolved to {:?}", outcome.l7);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod classify;
pub mod engine;
pub mod inspectors;
pub mod proto;
pub mod reassembly;
pub mod stats;
pub mod table;
pub mod tracking;

pub use classify::{AccuracyConfig, ClassifyOutcome, DEFAULT_MAX_TRIALS};
pub use engine::{DpiConfig, DpiEngine, PacketOutcome, DEFAULT_IDLE_TIMEOUT};
pub use inspectors::{InspectContext, Inspector, InspectorRegistry, InspectorVerdict};
pub use proto::{Accuracy, L7Resolution, ProtocolId, ProtocolMask};
pub use stats::{EngineStats, StatsSnapshot};
pub use table::{
    FindOrCreate, FlowCleaner, FlowRef, FlowTable, TableConfig, TableError, TableMode,
};
pub use tracking::{DecodedFields, FlowRecord, TcpPhase, TcpSeen, TcpTracking};
