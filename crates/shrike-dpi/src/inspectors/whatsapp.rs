//! WhatsApp signature inspector
//!
//! WhatsApp's funny-character handshake opens every connection with a fixed
//! 15-byte sequence. The signature can arrive split across any number of
//! segments, so the scratch slot remembers how far into the sequence the
//! flow has matched; any byte that disagrees rules the protocol out.

use crate::inspectors::{InspectContext, Inspector, InspectorVerdict};
use crate::proto::ProtocolId;
use crate::tracking::ProtocolState;

/// The handshake prelude, shared read-only across all partitions.
pub(crate) const WHATSAPP_SEQUENCE: [u8; 15] = [
    0x45, 0x44, 0x00, 0x01, 0x00, 0x00, 0x02, 0x08, 0x00, 0x57, 0x41, 0x02, 0x00, 0x00, 0x00,
];

/// Cross-packet signature progress.
#[derive(Debug, Default)]
pub struct WhatsappScratch {
    /// Bytes of the signature matched so far.
    pub matched: usize,
}

/// Matches the static WhatsApp handshake signature.
pub struct WhatsappInspector;

impl Inspector for WhatsappInspector {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Whatsapp
    }

    fn inspect(
        &self,
        _ctx: &InspectContext<'_>,
        payload: &[u8],
        scratch: &mut ProtocolState,
    ) -> InspectorVerdict {
        let ProtocolState::Whatsapp(state) = scratch else {
            return InspectorVerdict::NoMatch;
        };
        if payload.is_empty() {
            return InspectorVerdict::MoreDataNeeded;
        }

        let remaining = &WHATSAPP_SEQUENCE[state.matched..];
        let check_len = remaining.len().min(payload.len());
        if payload[..check_len] != remaining[..check_len] {
            return InspectorVerdict::NoMatch;
        }
        state.matched += payload.len();
        if state.matched >= WHATSAPP_SEQUENCE.len() {
            InspectorVerdict::Matches
        } else {
            InspectorVerdict::MoreDataNeeded
        }
    }
}
