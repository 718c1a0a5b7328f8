//! Dropbox LAN sync discovery inspector
//!
//! Dropbox clients announce themselves on the LAN with a JSON beacon sent
//! over UDP, port 17500 on both ends. The beacon always carries a
//! `"host_int"` field; stricter accuracy levels demand the rarer fields too,
//! trading check cost for confidence in the match.

use memchr::memmem;

use crate::inspectors::{InspectContext, Inspector, InspectorVerdict};
use crate::proto::{Accuracy, ProtocolId};
use crate::tracking::ProtocolState;
use shrike_common::L4Proto;

/// The discovery port on both ends of a beacon.
pub const DROPBOX_PORT: u16 = 17500;

#[inline]
fn has(payload: &[u8], needle: &str) -> bool {
    memmem::find(payload, needle.as_bytes()).is_some()
}

fn low_check(payload: &[u8]) -> bool {
    has(payload, "\"host_int\"")
}

fn mid_check(payload: &[u8]) -> bool {
    has(payload, "\"namespaces\"")
}

fn high_check(payload: &[u8]) -> bool {
    has(payload, "\"version\"") && has(payload, "\"port\"")
}

fn has_dropbox_fields(payload: &[u8], accuracy: Accuracy) -> bool {
    match accuracy {
        Accuracy::Low => low_check(payload),
        Accuracy::Medium => low_check(payload) && mid_check(payload),
        Accuracy::High => low_check(payload) && mid_check(payload) && high_check(payload),
    }
}

/// Recognizes the LAN sync discovery beacon.
pub struct DropboxInspector;

impl Inspector for DropboxInspector {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Dropbox
    }

    fn inspect(
        &self,
        ctx: &InspectContext<'_>,
        payload: &[u8],
        _scratch: &mut ProtocolState,
    ) -> InspectorVerdict {
        let info = ctx.info;
        if info.l4_proto == L4Proto::Udp
            && info.port_src == DROPBOX_PORT
            && info.port_dst == DROPBOX_PORT
            && payload.len() > 2
            && has_dropbox_fields(payload, ctx.accuracy)
        {
            InspectorVerdict::Matches
        } else {
            InspectorVerdict::NoMatch
        }
    }
}
