//! Per-flow state: public decoded fields plus private tracking state
//!
//! One [`FlowRecord`] exists per live flow. The public side carries the
//! classification outcome, decoded attributes, and traffic accounting; the
//! private side carries everything the classification loop needs between
//! packets (trial budget, candidate mask, TCP connection phase, reassembly
//! trackers, per-protocol inspector scratch).

use std::any::Any;

use bitflags::bitflags;
use shrike_common::{
    Direction, FlowKey, PerDirection, TcpHeaderFlags, TcpSegmentMeta, Timestamp,
};

use crate::inspectors::http::HttpScratch;
use crate::inspectors::sip::{MediaEndpoint, SipMethod, SipScratch};
use crate::inspectors::whatsapp::WhatsappScratch;
use crate::proto::{L7Resolution, ProtocolId, ProtocolMask};
use crate::reassembly::ReassemblyTracker;

bitflags! {
    /// TCP control-flag observations, monotonic for the life of a record.
    ///
    /// The packed `:1`/`:2` bitfields of classic C flow trackers, as an
    /// explicit flag set. Flags are only ever inserted, never removed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TcpSeen: u8 {
        /// SYN observed.
        const SYN = 0x01;
        /// SYN-ACK observed.
        const SYN_ACK = 0x02;
        /// Handshake-completing ACK observed.
        const ACK = 0x04;
        /// FIN observed from the initiator.
        const FIN_C2S = 0x08;
        /// FIN observed from the responder.
        const FIN_S2C = 0x10;
        /// ACK acknowledging a FIN observed.
        const FIN_ACK = 0x20;
        /// RST observed.
        const RST = 0x40;
    }
}

/// Connection phase, driven only by control flags observed on the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TcpPhase {
    /// No complete handshake yet.
    #[default]
    Embryonic,
    /// SYN, SYN-ACK and ACK all observed.
    Established,
    /// First FIN observed, graceful teardown in progress.
    Closing,
    /// Teardown complete (FIN/FIN-ACK sequence or RST). Deletion trigger.
    Closed,
}

/// TCP connection tracking for one flow.
#[derive(Debug, Default)]
pub struct TcpTracking {
    phase: TcpPhase,
    seen: TcpSeen,
    /// Highest acknowledgment number seen per direction; kept for
    /// reassembly gap detection, not a teardown signal.
    pub highest_ack: PerDirection<u32>,
}

impl TcpTracking {
    /// Current connection phase.
    pub fn phase(&self) -> TcpPhase {
        self.phase
    }

    /// Flags observed so far.
    pub fn seen(&self) -> TcpSeen {
        self.seen
    }

    /// Feed one segment's control flags; returns the phase afterwards.
    pub fn observe(&mut self, dir: Direction, meta: &TcpSegmentMeta) -> TcpPhase {
        let f = meta.flags;

        if f.contains(TcpHeaderFlags::ACK) {
            let ack = self.highest_ack.get_mut(dir);
            if (meta.ack.wrapping_sub(*ack) as i32) > 0 || *ack == 0 {
                *ack = meta.ack;
            }
        }

        if f.contains(TcpHeaderFlags::RST) {
            // RST short-circuits graceful sequencing from any phase.
            self.seen.insert(TcpSeen::RST);
            self.phase = TcpPhase::Closed;
            return self.phase;
        }

        if f.contains(TcpHeaderFlags::SYN) {
            if f.contains(TcpHeaderFlags::ACK) {
                self.seen.insert(TcpSeen::SYN_ACK);
            } else {
                self.seen.insert(TcpSeen::SYN);
            }
        }

        if f.contains(TcpHeaderFlags::FIN) {
            let fin_flag = match dir {
                Direction::ClientToServer => TcpSeen::FIN_C2S,
                Direction::ServerToClient => TcpSeen::FIN_S2C,
            };
            // A FIN carrying an ACK while the peer's FIN is already on
            // record completes the exchange.
            if self.phase == TcpPhase::Closing && f.contains(TcpHeaderFlags::ACK) {
                self.seen.insert(TcpSeen::FIN_ACK);
            }
            self.seen.insert(fin_flag);
        } else if f.contains(TcpHeaderFlags::ACK)
            && self.phase == TcpPhase::Closing
            && self.fin_seen_from(dir.flip())
        {
            self.seen.insert(TcpSeen::FIN_ACK);
        }

        self.phase = self.next_phase(f);
        self.phase
    }

    fn fin_seen_from(&self, dir: Direction) -> bool {
        match dir {
            Direction::ClientToServer => self.seen.contains(TcpSeen::FIN_C2S),
            Direction::ServerToClient => self.seen.contains(TcpSeen::FIN_S2C),
        }
    }

    fn next_phase(&self, segment_flags: TcpHeaderFlags) -> TcpPhase {
        let both_fins =
            self.seen.contains(TcpSeen::FIN_C2S) && self.seen.contains(TcpSeen::FIN_S2C);
        match self.phase {
            TcpPhase::Closed => TcpPhase::Closed,
            TcpPhase::Closing => {
                if both_fins || self.seen.contains(TcpSeen::FIN_ACK) {
                    TcpPhase::Closed
                } else {
                    TcpPhase::Closing
                }
            }
            TcpPhase::Established => {
                if segment_flags.contains(TcpHeaderFlags::FIN) {
                    if both_fins || self.seen.contains(TcpSeen::FIN_ACK) {
                        TcpPhase::Closed
                    } else {
                        TcpPhase::Closing
                    }
                } else {
                    TcpPhase::Established
                }
            }
            TcpPhase::Embryonic => {
                if segment_flags.contains(TcpHeaderFlags::FIN) {
                    TcpPhase::Closing
                } else if self.seen.contains(TcpSeen::SYN)
                    && self.seen.contains(TcpSeen::SYN_ACK)
                    && segment_flags.contains(TcpHeaderFlags::ACK)
                {
                    TcpPhase::Established
                } else {
                    TcpPhase::Embryonic
                }
            }
        }
    }
}

/// Per-protocol inspector scratch: one live variant per protocol that is
/// still a candidate and has state to keep between packets.
#[derive(Debug)]
pub enum ProtocolState {
    /// Signature-prefix progress for the WhatsApp inspector.
    Whatsapp(WhatsappScratch),
    /// The Dropbox beacon check is stateless.
    Dropbox,
    /// SIP method and bounded media-endpoint list.
    Sip(SipScratch),
    /// Partial token buffer for the HTTP inspector.
    Http(HttpScratch),
}

impl ProtocolState {
    /// Fresh scratch for `proto`.
    pub fn new_for(proto: ProtocolId) -> Self {
        match proto {
            ProtocolId::Whatsapp => ProtocolState::Whatsapp(WhatsappScratch::default()),
            ProtocolId::Dropbox => ProtocolState::Dropbox,
            ProtocolId::Sip => ProtocolState::Sip(SipScratch::default()),
            ProtocolId::Http => ProtocolState::Http(HttpScratch::default()),
        }
    }

    /// Which protocol this scratch belongs to.
    pub fn protocol(&self) -> ProtocolId {
        match self {
            ProtocolState::Whatsapp(_) => ProtocolId::Whatsapp,
            ProtocolState::Dropbox => ProtocolId::Dropbox,
            ProtocolState::Sip(_) => ProtocolId::Sip,
            ProtocolState::Http(_) => ProtocolId::Http,
        }
    }
}

/// Decoded attributes exposed to callers once (or while) a protocol is
/// recognized.
#[derive(Debug, Default, Clone)]
pub struct DecodedFields {
    /// SIP request method, when the flow classified as SIP.
    pub sip_method: Option<SipMethod>,
    /// Media endpoints collected from SDP bodies (bounded).
    pub sip_media: Vec<MediaEndpoint>,
    /// True when more media endpoints were present than the tracker keeps.
    pub sip_media_overflowed: bool,
}

/// The mutable per-flow state: identity, public fields, private tracking.
pub struct FlowRecord {
    /// The 5-tuple, kept verbatim for collision verification.
    pub key: FlowKey,
    /// Direction-insensitive hash of the key (also selects the partition).
    pub hash: u32,

    // Public fields.
    /// Classification outcome.
    pub l7: L7Resolution,
    /// Decoded per-protocol attributes.
    pub decoded: DecodedFields,
    /// Packets seen on this flow (both directions).
    pub packets: u64,
    /// Payload bytes seen on this flow (both directions).
    pub bytes: u64,
    /// Creation stamp.
    pub created_at: Timestamp,
    /// Last packet stamp, drives idle eviction.
    pub last_seen: Timestamp,

    // Private tracking state.
    pub(crate) trials: u16,
    pub(crate) candidate_mask: ProtocolMask,
    tcp_reordering_enabled: bool,
    pub(crate) tcp: Option<TcpTracking>,
    pub(crate) reassembly: Option<Box<PerDirection<ReassemblyTracker>>>,
    pub(crate) scratch: Vec<ProtocolState>,

    /// Opaque per-flow payload owned by the external attacher; released via
    /// the table's cleanup callback, never by the table itself.
    pub user_data: Option<Box<dyn Any + Send>>,
}

impl std::fmt::Debug for FlowRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRecord")
            .field("key", &self.key)
            .field("l7", &self.l7)
            .field("trials", &self.trials)
            .field("candidates", &self.candidate_mask)
            .field("packets", &self.packets)
            .finish_non_exhaustive()
    }
}

impl FlowRecord {
    /// Seed a record for a newly observed flow.
    pub(crate) fn new(
        key: FlowKey,
        hash: u32,
        protocols_to_inspect: ProtocolMask,
        tcp_reordering_enabled: bool,
        timestamp: Timestamp,
        is_tcp: bool,
    ) -> Self {
        Self {
            key,
            hash,
            l7: L7Resolution::NotDetermined,
            decoded: DecodedFields::default(),
            packets: 0,
            bytes: 0,
            created_at: timestamp,
            last_seen: timestamp,
            trials: 0,
            candidate_mask: protocols_to_inspect,
            tcp_reordering_enabled,
            tcp: is_tcp.then(TcpTracking::default),
            reassembly: (is_tcp && tcp_reordering_enabled)
                .then(|| Box::new(PerDirection::<ReassemblyTracker>::default())),
            scratch: Vec::new(),
            user_data: None,
        }
    }

    /// Classification attempts made so far.
    pub fn trials(&self) -> u16 {
        self.trials
    }

    /// Protocols not yet ruled out.
    pub fn candidates(&self) -> ProtocolMask {
        self.candidate_mask
    }

    /// Fixed at flow creation from the table's configuration at that moment;
    /// never changes afterwards, even if the global setting does.
    pub fn tcp_reordering_enabled(&self) -> bool {
        self.tcp_reordering_enabled
    }

    /// TCP connection phase, `None` for non-TCP flows.
    pub fn tcp_phase(&self) -> Option<TcpPhase> {
        self.tcp.as_ref().map(TcpTracking::phase)
    }

    /// Account one packet.
    pub(crate) fn touch(&mut self, payload_len: usize, timestamp: Timestamp) {
        self.packets += 1;
        self.bytes += payload_len as u64;
        self.last_seen = timestamp;
    }

    /// Scratch slot for `proto`, created lazily on first use.
    pub(crate) fn scratch_for(&mut self, proto: ProtocolId) -> &mut ProtocolState {
        if let Some(pos) = self.scratch.iter().position(|s| s.protocol() == proto) {
            return &mut self.scratch[pos];
        }
        self.scratch.push(ProtocolState::new_for(proto));
        let last = self.scratch.len() - 1;
        &mut self.scratch[last]
    }

    /// Remove `proto` from the candidate set and reclaim its scratch.
    pub(crate) fn eliminate(&mut self, proto: ProtocolId) {
        self.candidate_mask.remove(proto);
        self.scratch.retain(|s| s.protocol() != proto);
    }

    /// Fix the flow's protocol: collapse the mask and drop foreign scratch.
    pub(crate) fn resolve(&mut self, proto: ProtocolId) {
        self.l7 = L7Resolution::Known(proto);
        self.candidate_mask = ProtocolMask::only(proto);
        self.scratch.retain(|s| s.protocol() == proto);
    }

    /// Give up: classification attempts stop permanently.
    pub(crate) fn give_up(&mut self) {
        self.l7 = L7Resolution::Unknown;
        self.scratch.clear();
        self.reassembly = None;
    }
}
