//! SIP inspector
//!
//! Recognizes SIP signalling from the request/status line and, when the
//! message carries an SDP body, collects the advertised media endpoints.
//! The endpoint list is a capacity-checked container: once full, further
//! entries are rejected and an overflow indicator is recorded — never
//! written out of bounds.

use std::net::IpAddr;

use memchr::memmem;

use crate::inspectors::{InspectContext, Inspector, InspectorVerdict};
use crate::proto::{Accuracy, ProtocolId};
use crate::tracking::ProtocolState;
use shrike_common::L4Proto;

/// Maximum media endpoints tracked per flow.
pub const SIP_MAX_MEDIA_HOSTS: usize = 20;

/// SIP request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Info,
    Subscribe,
    Notify,
    Message,
    Update,
    Refer,
    Publish,
    Prack,
    /// A status line (`SIP/2.0 ...`) rather than a request.
    Response,
}

const METHODS: &[(&[u8], SipMethod)] = &[
    (b"INVITE", SipMethod::Invite),
    (b"ACK", SipMethod::Ack),
    (b"BYE", SipMethod::Bye),
    (b"CANCEL", SipMethod::Cancel),
    (b"REGISTER", SipMethod::Register),
    (b"OPTIONS", SipMethod::Options),
    (b"INFO", SipMethod::Info),
    (b"SUBSCRIBE", SipMethod::Subscribe),
    (b"NOTIFY", SipMethod::Notify),
    (b"MESSAGE", SipMethod::Message),
    (b"UPDATE", SipMethod::Update),
    (b"REFER", SipMethod::Refer),
    (b"PUBLISH", SipMethod::Publish),
    (b"PRACK", SipMethod::Prack),
];

const SIP_VERSION: &[u8] = b"SIP/2.0";

/// One media endpoint advertised in an SDP body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaEndpoint {
    /// Connection address from the nearest `c=` line, when present.
    pub addr: Option<IpAddr>,
    /// Media port from the `m=` line.
    pub port: u16,
}

/// Bounded media-endpoint list with an explicit capacity-exceeded signal.
#[derive(Debug, Default)]
pub struct MediaEndpointList {
    entries: Vec<MediaEndpoint>,
    overflowed: bool,
}

impl MediaEndpointList {
    /// Try to record one endpoint; `false` (and the overflow flag) once full.
    pub fn push(&mut self, endpoint: MediaEndpoint) -> bool {
        if self.entries.len() >= SIP_MAX_MEDIA_HOSTS {
            self.overflowed = true;
            return false;
        }
        self.entries.push(endpoint);
        true
    }

    /// Endpoints recorded so far.
    pub fn entries(&self) -> &[MediaEndpoint] {
        &self.entries
    }

    /// True once an endpoint has been rejected for capacity.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }
}

/// Per-flow SIP scratch: parsed method plus collected media endpoints.
#[derive(Debug, Default)]
pub struct SipScratch {
    /// Method of the first recognized message.
    pub method: Option<SipMethod>,
    /// Media endpoints from SDP bodies.
    pub media: MediaEndpointList,
}

fn first_line(payload: &[u8]) -> &[u8] {
    match memmem::find(payload, b"\r\n") {
        Some(pos) => &payload[..pos],
        None => payload,
    }
}

fn starting_method(payload: &[u8]) -> Option<SipMethod> {
    if payload.starts_with(SIP_VERSION) {
        return Some(SipMethod::Response);
    }
    for (name, method) in METHODS {
        if payload.len() > name.len()
            && payload.starts_with(name)
            && payload[name.len()] == b' '
        {
            return Some(*method);
        }
    }
    None
}

/// Could `payload` still grow into a SIP start line?
fn is_start_line_prefix(payload: &[u8]) -> bool {
    if SIP_VERSION.starts_with(payload) {
        return true;
    }
    METHODS
        .iter()
        .any(|(name, _)| name.starts_with(payload))
}

/// Pull media endpoints out of an SDP body (`c=`/`m=` lines).
fn collect_media(payload: &[u8], media: &mut MediaEndpointList) {
    let mut current_addr: Option<IpAddr> = None;
    for line in payload.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if let Some(rest) = line.strip_prefix(b"c=") {
            // c=IN IP4 203.0.113.7
            current_addr = rest
                .split(|&b| b == b' ')
                .nth(2)
                .and_then(|tok| std::str::from_utf8(tok).ok())
                .and_then(|s| s.trim().parse().ok());
        } else if let Some(rest) = line.strip_prefix(b"m=") {
            // m=audio 49170 RTP/AVP 0
            let port = rest
                .split(|&b| b == b' ')
                .nth(1)
                .and_then(|tok| std::str::from_utf8(tok).ok())
                .and_then(|s| s.parse::<u16>().ok());
            if let Some(port) = port {
                media.push(MediaEndpoint {
                    addr: current_addr,
                    port,
                });
            }
        }
    }
}

/// Recognizes SIP start lines and harvests SDP media endpoints.
pub struct SipInspector;

impl Inspector for SipInspector {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Sip
    }

    fn inspect(
        &self,
        ctx: &InspectContext<'_>,
        payload: &[u8],
        scratch: &mut ProtocolState,
    ) -> InspectorVerdict {
        let ProtocolState::Sip(state) = scratch else {
            return InspectorVerdict::NoMatch;
        };
        if matches!(ctx.info.l4_proto, L4Proto::Other(_)) {
            return InspectorVerdict::NoMatch;
        }
        if payload.is_empty() {
            return InspectorVerdict::MoreDataNeeded;
        }

        let Some(method) = starting_method(payload) else {
            // A short first segment may still be a truncated method token.
            if is_start_line_prefix(payload) {
                return InspectorVerdict::MoreDataNeeded;
            }
            return InspectorVerdict::NoMatch;
        };

        let line = first_line(payload);
        let confident = match ctx.accuracy {
            Accuracy::Low => true,
            // A request line must end in the SIP version; for responses the
            // version opens the line. Either way it sits on the first line.
            Accuracy::Medium | Accuracy::High => {
                memmem::find(line, SIP_VERSION).is_some()
                    && (ctx.accuracy == Accuracy::Medium
                        || memmem::find(payload, b"\r\nVia:").is_some()
                        || memmem::find(payload, b"\r\nv:").is_some())
            }
        };
        if !confident {
            if memmem::find(payload, b"\r\n").is_none() {
                // The first line has not fully arrived yet.
                return InspectorVerdict::MoreDataNeeded;
            }
            return InspectorVerdict::NoMatch;
        }

        state.method = Some(method);
        if memmem::find(payload, b"application/sdp").is_some()
            || memmem::find(payload, b"\r\n\r\nv=0").is_some()
        {
            if let Some(body_at) = memmem::find(payload, b"\r\n\r\n") {
                collect_media(&payload[body_at + 4..], &mut state.media);
            }
        }
        InspectorVerdict::Matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shrike_common::DissectionInfo;

    fn info() -> DissectionInfo {
        DissectionInfo::udp(
            "10.1.1.1".parse().unwrap(),
            5060,
            "10.1.1.2".parse().unwrap(),
            5060,
        )
    }

    fn inspect(payload: &[u8], accuracy: Accuracy) -> (InspectorVerdict, ProtocolState) {
        let info = info();
        let ctx = InspectContext {
            info: &info,
            accuracy,
        };
        let mut scratch = ProtocolState::new_for(ProtocolId::Sip);
        let verdict = SipInspector.inspect(&ctx, payload, &mut scratch);
        (verdict, scratch)
    }

    const INVITE: &[u8] = b"INVITE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.1.1.1:5060\r\n\
Content-Type: application/sdp\r\n\
\r\n\
v=0\r\n\
c=IN IP4 203.0.113.7\r\n\
m=audio 49170 RTP/AVP 0\r\n\
m=video 51372 RTP/AVP 31\r\n";

    #[test]
    fn invite_with_sdp_matches_and_collects_media() {
        let (verdict, scratch) = inspect(INVITE, Accuracy::High);
        assert_eq!(verdict, InspectorVerdict::Matches);
        let ProtocolState::Sip(state) = scratch else {
            unreachable!()
        };
        assert_eq!(state.method, Some(SipMethod::Invite));
        let media = state.media.entries();
        assert_eq!(media.len(), 2);
        assert_eq!(media[0].port, 49170);
        assert_eq!(media[0].addr, Some("203.0.113.7".parse().unwrap()));
        assert_eq!(media[1].port, 51372);
        assert!(!state.media.overflowed());
    }

    #[test]
    fn status_line_matches_as_response() {
        let (verdict, scratch) = inspect(b"SIP/2.0 200 OK\r\nVia: SIP/2.0/UDP x\r\n\r\n", Accuracy::High);
        assert_eq!(verdict, InspectorVerdict::Matches);
        let ProtocolState::Sip(state) = scratch else {
            unreachable!()
        };
        assert_eq!(state.method, Some(SipMethod::Response));
    }

    #[test]
    fn truncated_method_wants_more_data() {
        let (verdict, _) = inspect(b"INVIT", Accuracy::Low);
        assert_eq!(verdict, InspectorVerdict::MoreDataNeeded);
    }

    #[test]
    fn non_sip_text_is_ruled_out() {
        let (verdict, _) = inspect(b"HELLO WORLD\r\n", Accuracy::Low);
        assert_eq!(verdict, InspectorVerdict::NoMatch);
    }

    #[test]
    fn medium_requires_version_on_first_line() {
        let (verdict, _) = inspect(b"INVITE sip:bob@example.com FOO/1.0\r\n\r\n", Accuracy::Medium);
        assert_eq!(verdict, InspectorVerdict::NoMatch);
        let (verdict, _) = inspect(b"INVITE sip:bob@example.com FOO/1.0\r\n\r\n", Accuracy::Low);
        assert_eq!(verdict, InspectorVerdict::Matches);
    }

    #[test]
    fn media_list_is_capacity_checked() {
        let mut list = MediaEndpointList::default();
        for port in 0..SIP_MAX_MEDIA_HOSTS as u16 {
            assert!(list.push(MediaEndpoint {
                addr: None,
                port: 5000 + port,
            }));
        }
        assert!(!list.overflowed());
        assert!(!list.push(MediaEndpoint { addr: None, port: 1 }));
        assert!(list.overflowed());
        assert_eq!(list.entries().len(), SIP_MAX_MEDIA_HOSTS);
    }

    #[test]
    fn overlong_sdp_sets_overflow_indicator() {
        let mut msg = Vec::from(&b"INVITE sip:a@b SIP/2.0\r\nVia: SIP/2.0/UDP h\r\nContent-Type: application/sdp\r\n\r\nv=0\r\n"[..]);
        for port in 0..(SIP_MAX_MEDIA_HOSTS + 5) {
            msg.extend_from_slice(format!("m=audio {} RTP/AVP 0\r\n", 6000 + port).as_bytes());
        }
        let (verdict, scratch) = inspect(&msg, Accuracy::High);
        assert_eq!(verdict, InspectorVerdict::Matches);
        let ProtocolState::Sip(state) = scratch else {
            unreachable!()
        };
        assert_eq!(state.media.entries().len(), SIP_MAX_MEDIA_HOSTS);
        assert!(state.media.overflowed());
    }
}
