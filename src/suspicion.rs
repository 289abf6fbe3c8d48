/***************************************************************************************************
A closed enumeration of protocol-violation codes, and the append-only log
that records them. Every code below is distinct: `PR_TIME_WRONG` and
`CM_TIME_WRONG` get their own numbers rather than sharing one with
`PR_DIGEST_WRONG` (see DESIGN.md, Open Question 2).
***************************************************************************************************/

use std::collections::HashMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::ids::{InstId, NodeName};

/// A closed, stable enumeration of protocol-violation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SuspicionCode {
    PprToPrimary = 1,
    DuplicatePprSent = 2,
    DuplicatePrSent = 3,
    UnknownPrSent = 4,
    PrDigestWrong = 5,
    UnknownCmSent = 6,
    CmDigestWrong = 7,
    DuplicateCmSent = 8,
    PprFrmNonPrimary = 9,
    PrFrmPrimary = 10,
    PprDigestWrong = 11,
    DuplicateInstChng = 12,
    FrequentInstChng = 13,
    DuplicateNomSent = 14,
    DuplicatePriSent = 15,
    DuplicateRelSent = 16,
    WrongPpSeqNo = 17,
    PrTimeWrong = 18,
    CmTimeWrong = 19,
}

impl SuspicionCode {
    pub fn reason(self) -> &'static str {
        use SuspicionCode::*;
        match self {
            PprToPrimary => "PRE-PREPARE being sent to primary",
            DuplicatePprSent => {
                "PRE-PREPARE being sent twice with the same view no and sequence no"
            }
            DuplicatePrSent => "PREPARE request already received",
            UnknownPrSent => "PREPARE request for unknown PRE-PREPARE request",
            PrDigestWrong => "PREPARE request digest is incorrect",
            UnknownCmSent => "Commit requests when no prepares received",
            CmDigestWrong => "Commit requests has incorrect digest",
            DuplicateCmSent => "COMMIT message has already been received",
            PprFrmNonPrimary => "Pre-Prepare received from non primary",
            PrFrmPrimary => "Prepare received from primary",
            PprDigestWrong => "Pre-Prepare message has incorrect digest",
            DuplicateInstChng => "Duplicate instance change message received",
            FrequentInstChng => "Too many instance change messages received",
            DuplicateNomSent => "NOMINATION request already received",
            DuplicatePriSent => "PRIMARY request already received",
            DuplicateRelSent => "REELECTION request already received",
            WrongPpSeqNo => "Wrong PRE-PREPARE seq number",
            PrTimeWrong => "PREPARE time does not match with PRE-PREPARE",
            CmTimeWrong => "COMMIT time does not match with PRE-PREPARE",
        }
    }
}

/// A single recorded protocol-violation event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspicion {
    pub offender: NodeName,
    pub code: SuspicionCode,
    pub timestamp: crate::ids::Timestamp,
}

/// Policy hook consulted once a sender's duplicate count exceeds the one
/// tolerated duplicate. Blacklisting is pluggable rather than baked into
/// the core contract; the default implementation is a no-op.
pub trait BlacklistPolicy {
    fn on_repeat_offender(&mut self, offender: &NodeName, code: SuspicionCode, count: u32);
}

/// A policy that never blacklists anyone.
#[derive(Debug, Default)]
pub struct NoopBlacklistPolicy;

impl BlacklistPolicy for NoopBlacklistPolicy {
    fn on_repeat_offender(&mut self, _offender: &NodeName, _code: SuspicionCode, _count: u32) {}
}

/// Append-only suspicion log plus the duplicate-message bookkeeping used to
/// decide when to consult the `BlacklistPolicy`.
#[derive(Debug, Default)]
pub struct SuspicionRegistry {
    log: Vec<Suspicion>,
    /// One tolerated duplicate per `(msgType-ish code, instId, sender)`
    /// pairing; the second occurrence is recorded here and escalated to
    /// the policy. Keyed per instance since a node runs `f+1` independent
    /// `Replica`s (plus one `Elector`) over a single shared registry, and
    /// a duplicate on one instance must not count against another.
    duplicate_counts: HashMap<(SuspicionCode, InstId, NodeName), u32>,
}

impl SuspicionRegistry {
    pub fn new() -> Self {
        SuspicionRegistry::default()
    }

    /// Record a suspicion against `offender` on `inst_id`. Returns the
    /// running count of suspicions of this exact `(code, instId)` pair
    /// against this offender.
    pub fn raise(
        &mut self,
        offender: &NodeName,
        code: SuspicionCode,
        inst_id: InstId,
        now: crate::ids::Timestamp,
        policy: &mut dyn BlacklistPolicy,
    ) -> u32 {
        warn!(target: "suspicion", "{} suspected of {:?} on {}: {}", offender, code, inst_id, code.reason());
        self.log.push(Suspicion {
            offender: offender.clone(),
            code,
            timestamp: now,
        });
        let key = (code, inst_id, offender.clone());
        let count = self.duplicate_counts.entry(key).or_insert(0);
        *count += 1;
        if *count > 1 {
            policy.on_repeat_offender(offender, code, *count);
        }
        *count
    }

    /// Record an out-of-view event at debug level. This is stale-view
    /// housekeeping, not a protocol fault, so it never raises a suspicion.
    pub fn discard_out_of_view(&self, detail: &str) {
        debug!(target: "suspicion", "discarding out-of-view message: {}", detail);
    }

    pub fn log(&self) -> &[Suspicion] {
        &self.log
    }

    /// Reset duplicate counters. Called on view transition; duplicate
    /// counting only needs to bound abuse within a single view.
    pub fn reset_duplicate_counts(&mut self) {
        self.duplicate_counts.clear();
    }
}
