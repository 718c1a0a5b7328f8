//! Protocol inspectors
//!
//! An inspector is a pluggable predicate that judges whether a payload
//! segment is consistent with one specific L7 protocol. Inspectors are
//! invoked by the classification loop with the flow's private scratch slot
//! for their protocol; they must confine all side effects to that slot.

pub mod dropbox;
pub mod http;
pub mod sip;
pub mod whatsapp;

use std::collections::HashMap;

use shrike_common::DissectionInfo;

use crate::proto::{Accuracy, ProtocolId};
use crate::tracking::ProtocolState;

pub use dropbox::DropboxInspector;
pub use http::HttpInspector;
pub use sip::SipInspector;
pub use whatsapp::WhatsappInspector;

/// Inspector answer for one payload segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectorVerdict {
    /// Definitive: the flow speaks this protocol.
    Matches,
    /// Definitive: the flow does not speak this protocol.
    NoMatch,
    /// Undecided; scratch state has been advanced, retry on the next packet.
    MoreDataNeeded,
}

/// Read-only context handed to inspectors alongside the payload.
pub struct InspectContext<'a> {
    /// Parsed headers for the packet under inspection.
    pub info: &'a DissectionInfo,
    /// Configured accuracy for this inspector's protocol.
    pub accuracy: Accuracy,
}

/// The per-protocol predicate the classification engine calls.
pub trait Inspector: Send + Sync {
    /// The protocol this inspector recognizes.
    fn protocol(&self) -> ProtocolId;

    /// Judge one contiguous payload view.
    ///
    /// `scratch` is this flow's private slot for the inspector's protocol;
    /// it is the only state an inspector may mutate.
    fn inspect(
        &self,
        ctx: &InspectContext<'_>,
        payload: &[u8],
        scratch: &mut ProtocolState,
    ) -> InspectorVerdict;
}

/// The set of inspectors the engine consults, keyed by protocol.
pub struct InspectorRegistry {
    inspectors: HashMap<ProtocolId, Box<dyn Inspector>>,
}

impl InspectorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            inspectors: HashMap::new(),
        }
    }

    /// Registry with every built-in inspector.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register(Box::new(WhatsappInspector));
        reg.register(Box::new(DropboxInspector));
        reg.register(Box::new(SipInspector));
        reg.register(Box::new(HttpInspector));
        reg
    }

    /// Add or replace the inspector for its protocol.
    pub fn register(&mut self, inspector: Box<dyn Inspector>) {
        self.inspectors.insert(inspector.protocol(), inspector);
    }

    /// Inspector for `proto`, if registered.
    pub fn get(&self, proto: ProtocolId) -> Option<&dyn Inspector> {
        self.inspectors.get(&proto).map(Box::as_ref)
    }
}

impl Default for InspectorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
