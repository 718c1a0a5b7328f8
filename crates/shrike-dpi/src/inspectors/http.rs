//! HTTP/1.x inspector
//!
//! Recognizes request method tokens and status lines. The scratch slot
//! keeps a small partial-token buffer so a method split across segments
//! (e.g. `GE` then `T / HTTP/1.1`) is still recognized.

use memchr::memmem;

use crate::inspectors::{InspectContext, Inspector, InspectorVerdict};
use crate::proto::{Accuracy, ProtocolId};
use crate::tracking::ProtocolState;
use shrike_common::L4Proto;

/// Request method tokens, each expected to be followed by a space.
const METHODS: &[&[u8]] = &[
    b"GET ",
    b"POST ",
    b"PUT ",
    b"HEAD ",
    b"DELETE ",
    b"OPTIONS ",
    b"CONNECT ",
    b"TRACE ",
    b"PATCH ",
];

/// Status-line opener.
const RESPONSE: &[u8] = b"HTTP/1.";

/// Longest token we ever need to buffer across segments.
const MAX_TOKEN: usize = 8; // "OPTIONS "

/// Partial first-line token carried between segments.
#[derive(Debug, Default)]
pub struct HttpScratch {
    pending: Vec<u8>,
}

/// Recognizes HTTP/1.x request and status lines.
pub struct HttpInspector;

impl Inspector for HttpInspector {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Http
    }

    fn inspect(
        &self,
        ctx: &InspectContext<'_>,
        payload: &[u8],
        scratch: &mut ProtocolState,
    ) -> InspectorVerdict {
        let ProtocolState::Http(state) = scratch else {
            return InspectorVerdict::NoMatch;
        };
        if ctx.info.l4_proto != L4Proto::Tcp {
            return InspectorVerdict::NoMatch;
        }
        if payload.is_empty() {
            return InspectorVerdict::MoreDataNeeded;
        }

        let take = payload.len().min(MAX_TOKEN - state.pending.len().min(MAX_TOKEN));
        state.pending.extend_from_slice(&payload[..take]);
        let head: &[u8] = &state.pending;

        let token_hit = head.starts_with(RESPONSE)
            || METHODS.iter().any(|m| head.starts_with(m));
        if !token_hit {
            let still_prefix = RESPONSE.starts_with(head)
                || METHODS.iter().any(|m| m.starts_with(head));
            return if still_prefix {
                InspectorVerdict::MoreDataNeeded
            } else {
                InspectorVerdict::NoMatch
            };
        }

        if ctx.accuracy == Accuracy::Low || head.starts_with(RESPONSE) {
            return InspectorVerdict::Matches;
        }
        // Stricter levels insist the request line names an HTTP/1.x version.
        match memmem::find(payload, b"\r\n") {
            Some(eol) => {
                if memmem::find(&payload[..eol], b" HTTP/1.").is_some() {
                    InspectorVerdict::Matches
                } else {
                    InspectorVerdict::NoMatch
                }
            }
            None => InspectorVerdict::MoreDataNeeded,
        }
    }
}
