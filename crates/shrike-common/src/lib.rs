//! Shrike Common - Shared types for the Shrike DPI engine
//!
//! This crate provides the primitives shared between the flow table and
//! its callers:
//! - Flow identity (bidirectional 5-tuple keys and their hashes)
//! - The normalized dissection-info record the caller supplies per packet
//! - Caller-driven timestamps for flow aging
//! - Error handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dissection;
pub mod error;
pub mod flow;

pub use dissection::*;
pub use error::*;
pub use flow::*;

/// Caller-supplied monotonic timestamp used for flow aging.
///
/// The engine never reads a clock of its own: every packet carries one of
/// these, and idle eviction compares them. The unit is whatever the caller
/// chooses (seconds, ticks, packet counts) as long as values never decrease.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The zero timestamp.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw tick value.
    #[inline(always)]
    pub const fn new(ticks: u64) -> Self {
        Self(ticks)
    }

    /// Raw tick value.
    #[inline(always)]
    pub const fn ticks(self) -> u64 {
        self.0
    }

    /// Ticks elapsed since `earlier` (zero if `earlier` is in the future).
    #[inline(always)]
    pub const fn since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl From<u64> for Timestamp {
    fn from(ticks: u64) -> Self {
        Self(ticks)
    }
}
