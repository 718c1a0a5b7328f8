//! L7 protocol identifiers, candidate masks, and accuracy levels

use serde::{Deserialize, Serialize};

/// Application-layer protocols Shrike can classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolId {
    /// WhatsApp funny-character handshake (static byte signature).
    Whatsapp,
    /// Dropbox LAN sync discovery beacon (UDP 17500).
    Dropbox,
    /// SIP signalling.
    Sip,
    /// HTTP/1.x.
    Http,
}

impl ProtocolId {
    /// All supported protocols, in bit order.
    pub const ALL: [ProtocolId; 4] = [
        ProtocolId::Whatsapp,
        ProtocolId::Dropbox,
        ProtocolId::Sip,
        ProtocolId::Http,
    ];

    /// Number of supported protocols.
    pub const COUNT: usize = Self::ALL.len();

    /// Stable bit position inside a [`ProtocolMask`].
    #[inline(always)]
    pub const fn bit(self) -> u8 {
        self as u8
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            ProtocolId::Whatsapp => "whatsapp",
            ProtocolId::Dropbox => "dropbox",
            ProtocolId::Sip => "sip",
            ProtocolId::Http => "http",
        }
    }
}

/// Set of L7 protocols not yet ruled out for a flow.
///
/// Starts as the set of enabled protocols and only ever shrinks: inspectors
/// returning a definitive no-match clear their bit, a definitive match
/// collapses the mask to a single bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolMask(u8);

impl ProtocolMask {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Every supported protocol.
    pub const ALL: Self = Self((1 << ProtocolId::COUNT as u8) - 1);

    /// Set containing exactly `proto`.
    #[inline(always)]
    pub const fn only(proto: ProtocolId) -> Self {
        Self(1 << proto.bit())
    }

    /// Whether `proto` is still in the set.
    #[inline(always)]
    pub const fn contains(self, proto: ProtocolId) -> bool {
        self.0 & (1 << proto.bit()) != 0
    }

    /// Add `proto`.
    #[inline(always)]
    pub fn insert(&mut self, proto: ProtocolId) {
        self.0 |= 1 << proto.bit();
    }

    /// Remove `proto`.
    #[inline(always)]
    pub fn remove(&mut self, proto: ProtocolId) {
        self.0 &= !(1 << proto.bit());
    }

    /// Number of protocols in the set.
    #[inline(always)]
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// True when no candidates remain.
    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every member of `self` is also in `other`.
    #[inline(always)]
    pub const fn is_subset_of(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Iterate the protocols still present, in bit order.
    pub fn iter(self) -> impl Iterator<Item = ProtocolId> {
        ProtocolId::ALL.into_iter().filter(move |p| self.contains(*p))
    }

    /// The single remaining protocol, if exactly one is left.
    pub fn sole_candidate(self) -> Option<ProtocolId> {
        if self.len() == 1 {
            self.iter().next()
        } else {
            None
        }
    }
}

impl FromIterator<ProtocolId> for ProtocolMask {
    fn from_iter<I: IntoIterator<Item = ProtocolId>>(iter: I) -> Self {
        let mut mask = Self::EMPTY;
        for p in iter {
            mask.insert(p);
        }
        mask
    }
}

/// Per-inspector strictness, trading false-negative rate for check cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Accuracy {
    /// Cheapest check, loosest match.
    Low,
    /// Intermediate.
    Medium,
    /// Most evidence required before declaring a match.
    #[default]
    High,
}

/// The classification status of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum L7Resolution {
    /// Classification is still in progress.
    #[default]
    NotDetermined,
    /// Classification gave up: no candidate matched within the trial budget.
    Unknown,
    /// A definitive match.
    Known(ProtocolId),
}

impl L7Resolution {
    /// True while the classification loop should still run for the flow.
    #[inline(always)]
    pub const fn is_undetermined(self) -> bool {
        matches!(self, L7Resolution::NotDetermined)
    }
}
