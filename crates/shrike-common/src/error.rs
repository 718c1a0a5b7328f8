//! Error types shared across the Shrike crates

use thiserror::Error;

/// Errors produced when deriving flow identity from a dissection record.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    /// An IPv4-only operation was given IPv6 addresses.
    #[error("dissection info does not carry IPv4 addresses")]
    V4Required,

    /// An IPv6-only operation was given IPv4 addresses.
    #[error("dissection info does not carry IPv6 addresses")]
    V6Required,

    /// Source and destination addresses belong to different families.
    #[error("source and destination address families differ")]
    MixedFamilies,
}
