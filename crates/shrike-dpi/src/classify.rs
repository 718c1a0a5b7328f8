//! The iterative protocol-classification loop
//!
//! For each packet of an undetermined flow the classifier offers the
//! contiguous payload view to every inspector whose protocol is still in the
//! flow's candidate mask. Definitive answers shrink the mask (or fix the
//! protocol); undecided inspectors are retried on the next packet. The
//! number of attempts is bounded: once the trial budget is spent, the flow
//! is resolved Unknown and no inspector ever runs for it again. Malformed
//! or unrecognizable traffic therefore degrades to Unknown, never to an
//! error.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::trace;

use shrike_common::DissectionInfo;

use crate::inspectors::{InspectContext, InspectorRegistry, InspectorVerdict};
use crate::proto::{Accuracy, ProtocolId};
use crate::tracking::{FlowRecord, ProtocolState};

/// Default classification-attempt budget per flow.
pub const DEFAULT_MAX_TRIALS: u16 = 16;

/// Per-protocol accuracy settings with a global fallback.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccuracyConfig {
    /// Fallback for protocols without an explicit entry.
    pub default: Accuracy,
    /// Per-protocol overrides.
    pub per_protocol: HashMap<ProtocolId, Accuracy>,
}

impl Default for AccuracyConfig {
    fn default() -> Self {
        Self {
            default: Accuracy::default(),
            per_protocol: HashMap::new(),
        }
    }
}

impl AccuracyConfig {
    /// Accuracy configured for `proto`.
    pub fn for_protocol(&self, proto: ProtocolId) -> Accuracy {
        self.per_protocol.get(&proto).copied().unwrap_or(self.default)
    }

    /// Set an override for one protocol.
    pub fn set(&mut self, proto: ProtocolId, accuracy: Accuracy) {
        self.per_protocol.insert(proto, accuracy);
    }
}

/// Result of one classification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifyOutcome {
    /// The flow was already resolved (or out of budget); nothing ran.
    Skipped,
    /// Candidates remain; retry on the next packet.
    Pending,
    /// An inspector answered definitively.
    Classified(ProtocolId),
    /// Candidate set emptied or trial budget exhausted; resolved Unknown.
    GaveUp,
}

/// The classification engine: inspector registry plus attempt policy.
pub struct Classifier<'a> {
    registry: &'a InspectorRegistry,
    accuracy: &'a AccuracyConfig,
    max_trials: u16,
}

impl<'a> Classifier<'a> {
    /// Bind a classifier to a registry and accuracy configuration.
    pub fn new(
        registry: &'a InspectorRegistry,
        accuracy: &'a AccuracyConfig,
        max_trials: u16,
    ) -> Self {
        Self {
            registry,
            accuracy,
            max_trials,
        }
    }

    /// Run one classification attempt for `record` against `payload`.
    ///
    /// Side effects are confined to `record`'s own tracking state.
    pub fn classify_packet(
        &self,
        record: &mut FlowRecord,
        info: &DissectionInfo,
        payload: &[u8],
    ) -> ClassifyOutcome {
        if !record.l7.is_undetermined() || record.trials >= self.max_trials {
            return ClassifyOutcome::Skipped;
        }

        let candidates: Vec<ProtocolId> = record.candidate_mask.iter().collect();
        let mut matched = None;
        for proto in candidates {
            let Some(inspector) = self.registry.get(proto) else {
                // No predicate registered: the protocol can never match.
                record.eliminate(proto);
                continue;
            };
            let ctx = InspectContext {
                info,
                accuracy: self.accuracy.for_protocol(proto),
            };
            let verdict = {
                let scratch = record.scratch_for(proto);
                inspector.inspect(&ctx, payload, scratch)
            };
            trace!(protocol = proto.name(), ?verdict, "inspector verdict");
            match verdict {
                InspectorVerdict::Matches => {
                    matched = Some(proto);
                    break;
                }
                InspectorVerdict::NoMatch => record.eliminate(proto),
                InspectorVerdict::MoreDataNeeded => {}
            }
        }

        record.trials += 1;

        if let Some(proto) = matched {
            record.resolve(proto);
            publish_decoded(record);
            return ClassifyOutcome::Classified(proto);
        }

        // No definitive match this attempt. A lone surviving candidate is
        // NOT promoted: "not yet ruled out" is weaker than a match, so the
        // loop keeps polling it until it answers or the budget runs out.
        if record.candidate_mask.is_empty() || record.trials >= self.max_trials {
            record.give_up();
            ClassifyOutcome::GaveUp
        } else {
            ClassifyOutcome::Pending
        }
    }
}

/// Copy caller-visible decoded attributes out of the winning scratch slot.
fn publish_decoded(record: &mut FlowRecord) {
    if let Some(ProtocolState::Sip(state)) = record.scratch.first() {
        record.decoded.sip_method = state.method;
        record.decoded.sip_media = state.media.entries().to_vec();
        record.decoded.sip_media_overflowed = state.media.overflowed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspectors::Inspector;
    use crate::proto::{L7Resolution, ProtocolMask};
    use crate::tracking::FlowRecord;
    use parking_lot::Mutex;
    use shrike_common::{FlowKey, Timestamp};
    use std::net::IpAddr;

    /// Inspector that replays a scripted verdict sequence.
    struct Scripted {
        proto: ProtocolId,
        verdicts: Mutex<Vec<InspectorVerdict>>,
    }

    impl Scripted {
        fn new(proto: ProtocolId, verdicts: &[InspectorVerdict]) -> Box<Self> {
            Box::new(Self {
                proto,
                verdicts: Mutex::new(verdicts.to_vec()),
            })
        }
    }

    impl Inspector for Scripted {
        fn protocol(&self) -> ProtocolId {
            self.proto
        }

        fn inspect(
            &self,
            _ctx: &InspectContext<'_>,
            _payload: &[u8],
            _scratch: &mut ProtocolState,
        ) -> InspectorVerdict {
            let mut v = self.verdicts.lock();
            if v.is_empty() {
                InspectorVerdict::MoreDataNeeded
            } else {
                v.remove(0)
            }
        }
    }

    fn udp_info() -> DissectionInfo {
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        DissectionInfo::udp(a, 1111, b, 2222)
    }

    fn record(mask: ProtocolMask) -> FlowRecord {
        let info = udp_info();
        FlowRecord::new(
            FlowKey::from_dissection(&info),
            0,
            mask,
            false,
            Timestamp::ZERO,
            false,
        )
    }

    fn classify(
        registry: &InspectorRegistry,
        record: &mut FlowRecord,
        max_trials: u16,
    ) -> ClassifyOutcome {
        let accuracy = AccuracyConfig::default();
        let classifier = Classifier::new(registry, &accuracy, max_trials);
        classifier.classify_packet(record, &udp_info(), b"payload")
    }

    #[test]
    fn match_collapses_mask_and_stops() {
        let mut registry = InspectorRegistry::new();
        registry.register(Scripted::new(
            ProtocolId::Whatsapp,
            &[InspectorVerdict::Matches],
        ));
        registry.register(Scripted::new(
            ProtocolId::Dropbox,
            &[InspectorVerdict::MoreDataNeeded],
        ));

        let mask: ProtocolMask = [ProtocolId::Whatsapp, ProtocolId::Dropbox]
            .into_iter()
            .collect();
        let mut rec = record(mask);
        let outcome = classify(&registry, &mut rec, 4);
        assert_eq!(outcome, ClassifyOutcome::Classified(ProtocolId::Whatsapp));
        assert_eq!(rec.l7, L7Resolution::Known(ProtocolId::Whatsapp));
        assert_eq!(rec.candidates(), ProtocolMask::only(ProtocolId::Whatsapp));

        // Stopped permanently: later packets skip the loop.
        assert_eq!(classify(&registry, &mut rec, 4), ClassifyOutcome::Skipped);
    }

    #[test]
    fn mask_shrinks_monotonically() {
        let mut registry = InspectorRegistry::new();
        registry.register(Scripted::new(
            ProtocolId::Whatsapp,
            &[InspectorVerdict::NoMatch],
        ));
        registry.register(Scripted::new(
            ProtocolId::Dropbox,
            &[
                InspectorVerdict::MoreDataNeeded,
                InspectorVerdict::NoMatch,
            ],
        ));
        registry.register(Scripted::new(
            ProtocolId::Sip,
            &[
                InspectorVerdict::MoreDataNeeded,
                InspectorVerdict::MoreDataNeeded,
            ],
        ));

        let mask: ProtocolMask = [ProtocolId::Whatsapp, ProtocolId::Dropbox, ProtocolId::Sip]
            .into_iter()
            .collect();
        let mut rec = record(mask);

        let mut previous = rec.candidates();
        for _ in 0..3 {
            classify(&registry, &mut rec, 16);
            let current = rec.candidates();
            assert!(current.is_subset_of(previous));
            previous = current;
        }
        assert_eq!(rec.candidates(), ProtocolMask::only(ProtocolId::Sip));
    }

    #[test]
    fn empty_mask_gives_up() {
        let mut registry = InspectorRegistry::new();
        registry.register(Scripted::new(
            ProtocolId::Whatsapp,
            &[InspectorVerdict::NoMatch],
        ));

        let mut rec = record(ProtocolMask::only(ProtocolId::Whatsapp));
        assert_eq!(classify(&registry, &mut rec, 8), ClassifyOutcome::GaveUp);
        assert_eq!(rec.l7, L7Resolution::Unknown);
    }

    #[test]
    fn trial_budget_is_bounded() {
        let mut registry = InspectorRegistry::new();
        // Never answers definitively.
        registry.register(Scripted::new(ProtocolId::Whatsapp, &[]));
        registry.register(Scripted::new(ProtocolId::Dropbox, &[]));

        let mask: ProtocolMask = [ProtocolId::Whatsapp, ProtocolId::Dropbox]
            .into_iter()
            .collect();
        let mut rec = record(mask);

        let max_trials = 3;
        for i in 0..max_trials {
            let outcome = classify(&registry, &mut rec, max_trials);
            if i + 1 < max_trials {
                assert_eq!(outcome, ClassifyOutcome::Pending);
            } else {
                assert_eq!(outcome, ClassifyOutcome::GaveUp);
            }
        }
        assert_eq!(rec.l7, L7Resolution::Unknown);
        assert_eq!(rec.trials(), max_trials);

        // After exhaustion no inspector is ever invoked again.
        assert_eq!(
            classify(&registry, &mut rec, max_trials),
            ClassifyOutcome::Skipped
        );
        assert_eq!(rec.trials(), max_trials);
    }

    #[test]
    fn lone_candidate_is_not_auto_promoted() {
        let mut registry = InspectorRegistry::new();
        registry.register(Scripted::new(ProtocolId::Sip, &[]));

        let mut rec = record(ProtocolMask::only(ProtocolId::Sip));
        let max_trials = 4;
        for _ in 0..max_trials - 1 {
            assert_eq!(
                classify(&registry, &mut rec, max_trials),
                ClassifyOutcome::Pending
            );
            assert_eq!(rec.l7, L7Resolution::NotDetermined);
        }
        assert_eq!(
            classify(&registry, &mut rec, max_trials),
            ClassifyOutcome::GaveUp
        );
        assert_eq!(rec.l7, L7Resolution::Unknown);
    }

    #[test]
    fn lone_candidate_match_is_authoritative() {
        let mut registry = InspectorRegistry::new();
        registry.register(Scripted::new(
            ProtocolId::Sip,
            &[InspectorVerdict::MoreDataNeeded, InspectorVerdict::Matches],
        ));

        let mut rec = record(ProtocolMask::only(ProtocolId::Sip));
        assert_eq!(classify(&registry, &mut rec, 8), ClassifyOutcome::Pending);
        assert_eq!(
            classify(&registry, &mut rec, 8),
            ClassifyOutcome::Classified(ProtocolId::Sip)
        );
        assert_eq!(rec.l7, L7Resolution::Known(ProtocolId::Sip));
    }

    #[test]
    fn unregistered_protocol_is_eliminated() {
        let registry = InspectorRegistry::new();
        let mut rec = record(ProtocolMask::only(ProtocolId::Http));
        assert_eq!(classify(&registry, &mut rec, 8), ClassifyOutcome::GaveUp);
        assert!(rec.candidates().is_empty());
    }

    #[test]
    fn accuracy_config_overrides() {
        let mut cfg = AccuracyConfig::default();
        assert_eq!(cfg.for_protocol(ProtocolId::Dropbox), Accuracy::High);
        cfg.set(ProtocolId::Dropbox, Accuracy::Low);
        assert_eq!(cfg.for_protocol(ProtocolId::Dropbox), Accuracy::Low);
        assert_eq!(cfg.for_protocol(ProtocolId::Sip), Accuracy::High);
    }

    #[test]
    fn accuracy_config_deserializes() {
        let cfg: AccuracyConfig = serde_json::from_str(
            r#"{"default": "medium", "per_protocol": {"dropbox": "low"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.default, Accuracy::Medium);
        assert_eq!(cfg.for_protocol(ProtocolId::Dropbox), Accuracy::Low);
        assert_eq!(cfg.for_protocol(ProtocolId::Http), Accuracy::Medium);
    }
}
