/***************************************************************************************************
The three-phase ordering pipeline: PRE-PREPARE -> PREPARE -> COMMIT, with
monotone per-view sequencing, suspicion-raising on protocol violations,
stash-for-later-view queueing, and a view-change reset.
***************************************************************************************************/

use std::collections::{HashMap, HashSet, VecDeque};

use log::debug;

use crate::collab::BlacklistPolicy;
use crate::ids::{Digest, InstId, NodeName, ReqKey, SeqNo, Timestamp, ViewNo};
use crate::messages::{CommitMsg, PrePrepareMsg, PrepareMsg, Request, ThreePhaseMessage};
use crate::suspicion::{SuspicionCode, SuspicionRegistry};

/// Capability handle a `Replica` uses to act on the world, instead of
/// holding a back-pointer into its owning `Node`.
pub trait ReplicaHandle {
    fn broadcast(&mut self, msg: ThreePhaseMessage);
    fn send_to(&mut self, to: NodeName, msg: ThreePhaseMessage);
    fn schedule_seq_gap_timeout(&mut self, inst_id: InstId, view_no: ViewNo, seq_no: SeqNo);
    fn notify_committed(
        &mut self,
        inst_id: InstId,
        seq_no: SeqNo,
        req_key: ReqKey,
        operation: Vec<u8>,
    );
    fn now(&self) -> Timestamp;
    fn digest(&self, bytes: &[u8]) -> Digest;
}

type QuorumKey = (ViewNo, SeqNo, Digest);

/// One participant in one protocol instance, running the 3-phase pipeline.
#[derive(Debug)]
pub struct Replica {
    pub inst_id: InstId,
    self_name: NodeName,
    f: u32,
    view: ViewNo,
    is_primary: Option<bool>,
    primary_name: Option<NodeName>,
    /// Next sequence number this replica would assign, if primary.
    next_seq_num: SeqNo,
    /// Highest sequence number accepted via `PrePrepare` this view.
    last_accepted_seq: SeqNo,
    pre_prepares: HashMap<(ViewNo, SeqNo), PrePrepareMsg>,
    prepares: HashMap<QuorumKey, HashSet<NodeName>>,
    commits: HashMap<QuorumKey, HashSet<NodeName>>,
    prepared_certificate: HashSet<QuorumKey>,
    committed_certificate: HashSet<QuorumKey>,
    stashed_for_later_view: VecDeque<(NodeName, ThreePhaseMessage)>,
    /// `PrePrepare`s received out of sequence order, awaiting the gap.
    out_of_order: HashMap<SeqNo, (NodeName, PrePrepareMsg)>,
    /// `PrePrepare`s received before this replica's own `Elector` has
    /// decided a primary for the current view, awaiting `set_primary`.
    pending_primary: VecDeque<(NodeName, PrePrepareMsg)>,
    known_requests: HashMap<ReqKey, Request>,
}

impl Replica {
    pub fn new(inst_id: InstId, self_name: NodeName, f: u32) -> Self {
        Replica {
            inst_id,
            self_name,
            f,
            view: ViewNo::genesis(),
            is_primary: None,
            primary_name: None,
            next_seq_num: SeqNo::zero(),
            last_accepted_seq: SeqNo::zero(),
            pre_prepares: HashMap::new(),
            prepares: HashMap::new(),
            commits: HashMap::new(),
            prepared_certificate: HashSet::new(),
            committed_certificate: HashSet::new(),
            stashed_for_later_view: VecDeque::new(),
            out_of_order: HashMap::new(),
            pending_primary: VecDeque::new(),
            known_requests: HashMap::new(),
        }
    }

    fn quorum(&self) -> usize {
        (2 * self.f + 1) as usize
    }

    pub fn view(&self) -> ViewNo {
        self.view
    }

    pub fn is_primary(&self) -> Option<bool> {
        self.is_primary
    }

    pub fn primary_name(&self) -> Option<&NodeName> {
        self.primary_name.as_ref()
    }

    pub fn is_committed(&self, view_no: ViewNo, seq_no: SeqNo, digest: Digest) -> bool {
        self.committed_certificate.contains(&(view_no, seq_no, digest))
    }

    /// Called by the `Elector` once a primary is decided for this instance.
    /// Returns any `PrePrepare`s that arrived from the now-known primary
    /// before the decision landed, ready for immediate replay.
    pub fn set_primary(&mut self, primary: NodeName) -> Vec<(NodeName, PrePrepareMsg)> {
        self.is_primary = Some(primary == self.self_name);
        self.primary_name = Some(primary.clone());

        let mut ready = Vec::new();
        // Anything not from the now-known primary was always a non-primary
        // send; it is simply dropped rather than kept any longer.
        for (sender, pp) in self.pending_primary.drain(..) {
            if sender == primary {
                ready.push((sender, pp));
            }
        }
        ready
    }

    /// Discards all non-committed three-phase state and moves to
    /// `new_view`. Sequence numbers are per-view, so counters reset;
    /// committed certificates are retained (agreement/validity must hold
    /// across views).
    pub fn on_view_change(&mut self, new_view: ViewNo) -> Vec<(NodeName, ThreePhaseMessage)> {
        self.view = new_view;
        self.is_primary = None;
        self.primary_name = None;
        self.next_seq_num = SeqNo::zero();
        self.last_accepted_seq = SeqNo::zero();
        self.pre_prepares.clear();
        self.prepares.clear();
        self.commits.clear();
        self.prepared_certificate.clear();
        self.out_of_order.clear();
        self.pending_primary.clear();
        self.replay_stashed(new_view)
    }

    fn replay_stashed(&mut self, now_view: ViewNo) -> Vec<(NodeName, ThreePhaseMessage)> {
        let mut ready = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some((sender, msg)) = self.stashed_for_later_view.pop_front() {
            if msg.view_no() == now_view {
                ready.push((sender, msg));
            } else if msg.view_no() > now_view {
                remaining.push_back((sender, msg));
            }
            // messages now strictly behind `now_view` are simply dropped.
        }
        self.stashed_for_later_view = remaining;
        ready
    }

    /// Accepted only if this replica is primary of the current view; the
    /// `Node` is responsible for forwarding otherwise.
    pub fn on_client_request(
        &mut self,
        req: Request,
        handle: &mut dyn ReplicaHandle,
    ) -> Option<PrePrepareMsg> {
        if self.is_primary != Some(true) {
            return None;
        }
        if self.known_requests.contains_key(&req.key()) {
            debug!(target: "replica", "{} ignoring already-known request {:?}", self.self_name, req.key());
            return None;
        }

        let seq_no = self.next_seq_num.next();
        self.next_seq_num = seq_no;
        self.last_accepted_seq = seq_no;

        let digest = handle.digest(&req.canonical_bytes());
        let pp = PrePrepareMsg {
            inst_id: self.inst_id,
            view_no: self.view,
            seq_no,
            digest,
            timestamp: handle.now(),
            req_key: req.key(),
            request: req.clone(),
        };

        self.known_requests.insert(req.key(), req);
        self.pre_prepares.insert((self.view, seq_no), pp.clone());
        self.prepares
            .insert((self.view, seq_no, digest), [self.self_name.clone()].iter().cloned().collect());

        handle.broadcast(ThreePhaseMessage::PrePrepare(pp.clone()));
        Some(pp)
    }

    /// Returns `Pending` for messages to be re-tried later (future view or
    /// sequence gap), and whatever is queued in `out` has already been
    /// broadcast by `handle`.
    pub fn on_three_phase(
        &mut self,
        msg: ThreePhaseMessage,
        sender: NodeName,
        handle: &mut dyn ReplicaHandle,
        suspicions: &mut SuspicionRegistry,
        policy: &mut dyn BlacklistPolicy,
    ) {
        if msg.view_no() < self.view {
            suspicions.discard_out_of_view(&format!(
                "{:?} from {} is for past view {} (current {})",
                msg, sender, msg.view_no().0, self.view.0
            ));
            return;
        }
        if msg.view_no() > self.view {
            self.stashed_for_later_view.push_back((sender, msg));
            return;
        }

        match msg {
            ThreePhaseMessage::PrePrepare(pp) => {
                self.handle_pre_prepare(pp, sender, handle, suspicions, policy)
            }
            ThreePhaseMessage::Prepare(pr) => {
                self.handle_prepare(pr, sender, handle, suspicions, policy)
            }
            ThreePhaseMessage::Commit(cm) => {
                self.handle_commit(cm, sender, handle, suspicions, policy)
            }
        }

        // A gap-fill may have unblocked buffered higher sequence numbers.
        self.drain_out_of_order(handle, suspicions, policy);
    }

    fn handle_pre_prepare(
        &mut self,
        pp: PrePrepareMsg,
        sender: NodeName,
        handle: &mut dyn ReplicaHandle,
        suspicions: &mut SuspicionRegistry,
        policy: &mut dyn BlacklistPolicy,
    ) {
        let now = handle.now();

        if self.is_primary == Some(true) {
            suspicions.raise(&sender, SuspicionCode::PprToPrimary, self.inst_id, now, policy);
            return;
        }

        if self.primary_name.is_none() {
            // No primary decided yet for this view: defer rather than
            // suspect, since a just-elected legitimate primary can start
            // broadcasting before this replica's own election has landed.
            self.pending_primary.push_back((sender, pp));
            return;
        }

        if self.primary_name.as_ref() != Some(&sender) {
            suspicions.raise(&sender, SuspicionCode::PprFrmNonPrimary, self.inst_id, now, policy);
            return;
        }

        if let Some(existing) = self.pre_prepares.get(&(pp.view_no, pp.seq_no)) {
            if existing == &pp {
                debug!(target: "replica", "{} re-delivery of already-accepted PrePrepare {:?}, ignoring", self.self_name, pp.seq_no);
            }
            suspicions.raise(&sender, SuspicionCode::DuplicatePprSent, self.inst_id, now, policy);
            return;
        }

        let expected_digest = handle.digest(&pp.request.canonical_bytes());
        if expected_digest != pp.digest || pp.req_key != pp.request.key() {
            suspicions.raise(&sender, SuspicionCode::PprDigestWrong, self.inst_id, now, policy);
            return;
        }

        let expected_seq = self.last_accepted_seq.next();
        if pp.seq_no != expected_seq {
            if pp.seq_no.0 > expected_seq.0 {
                // Out of order: stash briefly, await the gap.
                handle.schedule_seq_gap_timeout(self.inst_id, pp.view_no, pp.seq_no);
                self.out_of_order.insert(pp.seq_no, (sender, pp));
                return;
            }
            suspicions.raise(&sender, SuspicionCode::WrongPpSeqNo, self.inst_id, now, policy);
            return;
        }

        self.accept_pre_prepare(pp, sender, handle);
    }

    fn accept_pre_prepare(
        &mut self,
        pp: PrePrepareMsg,
        sender: NodeName,
        handle: &mut dyn ReplicaHandle,
    ) {
        self.last_accepted_seq = pp.seq_no;
        self.known_requests.insert(pp.req_key.clone(), pp.request.clone());
        self.pre_prepares.insert((pp.view_no, pp.seq_no), pp.clone());
        self.prepares
            .entry((pp.view_no, pp.seq_no, pp.digest))
            .or_insert_with(HashSet::new)
            .insert(sender);

        let pr = PrepareMsg {
            inst_id: self.inst_id,
            view_no: pp.view_no,
            seq_no: pp.seq_no,
            digest: pp.digest,
            timestamp: pp.timestamp,
        };
        handle.broadcast(ThreePhaseMessage::Prepare(pr));
    }

    /// A previously-reported gap-timeout fired without the gap being
    /// filled: treat it as a missing-link failure (fed to the `Monitor`
    /// by the owning `Node`) and raise `WRONG_PPSEQ_NO` against whichever
    /// out-of-order sender is still stuck.
    pub fn on_seq_gap_timeout(
        &mut self,
        view_no: ViewNo,
        seq_no: SeqNo,
        now: Timestamp,
        suspicions: &mut SuspicionRegistry,
        policy: &mut dyn BlacklistPolicy,
    ) -> bool {
        if view_no != self.view {
            return false;
        }
        if let Some((sender, _)) = self.out_of_order.remove(&seq_no) {
            suspicions.raise(&sender, SuspicionCode::WrongPpSeqNo, self.inst_id, now, policy);
            true
        } else {
            false
        }
    }

    fn drain_out_of_order(
        &mut self,
        handle: &mut dyn ReplicaHandle,
        suspicions: &mut SuspicionRegistry,
        policy: &mut dyn BlacklistPolicy,
    ) {
        loop {
            let expected = self.last_accepted_seq.next();
            match self.out_of_order.remove(&expected) {
                Some((sender, pp)) => {
                    let expected_digest = handle.digest(&pp.request.canonical_bytes());
                    if expected_digest != pp.digest || pp.req_key != pp.request.key() {
                        suspicions.raise(&sender, SuspicionCode::PprDigestWrong, self.inst_id, handle.now(), policy);
                        continue;
                    }
                    self.accept_pre_prepare(pp, sender, handle);
                }
                None => break,
            }
        }
    }

    fn handle_prepare(
        &mut self,
        pr: PrepareMsg,
        sender: NodeName,
        handle: &mut dyn ReplicaHandle,
        suspicions: &mut SuspicionRegistry,
        policy: &mut dyn BlacklistPolicy,
    ) {
        let now = handle.now();

        if self.primary_name.as_ref() == Some(&sender) {
            suspicions.raise(&sender, SuspicionCode::PrFrmPrimary, self.inst_id, now, policy);
            return;
        }

        let pp = match self.pre_prepares.get(&(pr.view_no, pr.seq_no)) {
            Some(pp) => pp.clone(),
            None => {
                suspicions.raise(&sender, SuspicionCode::UnknownPrSent, self.inst_id, now, policy);
                return;
            }
        };

        if pr.digest != pp.digest {
            suspicions.raise(&sender, SuspicionCode::PrDigestWrong, self.inst_id, now, policy);
            return;
        }
        if pr.timestamp.0 != pp.timestamp.0 {
            suspicions.raise(&sender, SuspicionCode::PrTimeWrong, self.inst_id, now, policy);
            return;
        }

        let key = (pr.view_no, pr.seq_no, pr.digest);
        let set = self.prepares.entry(key).or_insert_with(HashSet::new);
        if set.contains(&sender) {
            suspicions.raise(&sender, SuspicionCode::DuplicatePrSent, self.inst_id, now, policy);
            return;
        }
        set.insert(sender);

        if set.len() >= self.quorum() && !self.prepared_certificate.contains(&key) {
            self.prepared_certificate.insert(key);
            let cm = CommitMsg {
                inst_id: self.inst_id,
                view_no: pr.view_no,
                seq_no: pr.seq_no,
                digest: pr.digest,
                timestamp: pp.timestamp,
            };
            self.commits
                .entry(key)
                .or_insert_with(HashSet::new)
                .insert(self.self_name.clone());
            handle.broadcast(ThreePhaseMessage::Commit(cm));
        }
    }

    fn handle_commit(
        &mut self,
        cm: CommitMsg,
        sender: NodeName,
        handle: &mut dyn ReplicaHandle,
        suspicions: &mut SuspicionRegistry,
        policy: &mut dyn BlacklistPolicy,
    ) {
        let now = handle.now();

        let pp = match self.pre_prepares.get(&(cm.view_no, cm.seq_no)) {
            Some(pp) => pp.clone(),
            None => {
                suspicions.raise(&sender, SuspicionCode::UnknownCmSent, self.inst_id, now, policy);
                return;
            }
        };

        if cm.digest != pp.digest {
            suspicions.raise(&sender, SuspicionCode::CmDigestWrong, self.inst_id, now, policy);
            return;
        }
        if cm.timestamp.0 != pp.timestamp.0 {
            suspicions.raise(&sender, SuspicionCode::CmTimeWrong, self.inst_id, now, policy);
            return;
        }

        let key = (cm.view_no, cm.seq_no, cm.digest);
        let set = self.commits.entry(key).or_insert_with(HashSet::new);
        if set.contains(&sender) {
            suspicions.raise(&sender, SuspicionCode::DuplicateCmSent, self.inst_id, now, policy);
            return;
        }
        set.insert(sender);

        if set.len() >= self.quorum() && !self.committed_certificate.contains(&key) {
            self.committed_certificate.insert(key);
            handle.notify_committed(self.inst_id, cm.seq_no, pp.req_key.clone(), pp.request.operation.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Request;
    use crate::suspicion::NoopBlacklistPolicy;

    #[derive(Default)]
    struct TestHandle {
        broadcasts: Vec<ThreePhaseMessage>,
        committed: Vec<(InstId, SeqNo, ReqKey, Vec<u8>)>,
    }

    impl ReplicaHandle for TestHandle {
        fn broadcast(&mut self, msg: ThreePhaseMessage) {
            self.broadcasts.push(msg);
        }
        fn send_to(&mut self, _to: NodeName, msg: ThreePhaseMessage) {
            self.broadcasts.push(msg);
        }
        fn schedule_seq_gap_timeout(&mut self, _inst_id: InstId, _view_no: ViewNo, _seq_no: SeqNo) {}
        fn notify_committed(&mut self, inst_id: InstId, seq_no: SeqNo, req_key: ReqKey, operation: Vec<u8>) {
            self.committed.push((inst_id, seq_no, req_key, operation));
        }
        fn now(&self) -> Timestamp {
            Timestamp::ZERO
        }
        fn digest(&self, bytes: &[u8]) -> Digest {
            Digest::of(bytes)
        }
    }

    fn request() -> Request {
        Request { client: "alice".into(), req_id: 1, operation: b"SET x = 1".to_vec(), signature: Vec::new() }
    }

    fn pre_prepare(h: &TestHandle, req: &Request) -> PrePrepareMsg {
        PrePrepareMsg {
            inst_id: InstId(0),
            view_no: ViewNo::genesis(),
            seq_no: SeqNo(1),
            digest: h.digest(&req.canonical_bytes()),
            timestamp: Timestamp::ZERO,
            req_key: req.key(),
            request: req.clone(),
        }
    }

    /// A backup that receives a valid `PrePrepare` from the primary and
    /// `Prepare`/`Commit` from the other two non-primary replicas (N=4,
    /// f=1, quorum=3) orders the request and reports it exactly once.
    #[test]
    fn happy_path_backup_orders_request() {
        let mut replica = Replica::new(InstId(0), NodeName::from("B"), 1);
        replica.set_primary(NodeName::from("A"));
        let mut h = TestHandle::default();
        let mut suspicions = SuspicionRegistry::new();
        let mut policy = NoopBlacklistPolicy::default();

        let req = request();
        let pp = pre_prepare(&h, &req);

        replica.on_three_phase(ThreePhaseMessage::PrePrepare(pp.clone()), NodeName::from("A"), &mut h, &mut suspicions, &mut policy);
        assert!(matches!(h.broadcasts.last(), Some(ThreePhaseMessage::Prepare(_))));

        let pr = PrepareMsg { inst_id: InstId(0), view_no: pp.view_no, seq_no: pp.seq_no, digest: pp.digest, timestamp: pp.timestamp };
        // The primary never sends a Prepare of its own; quorum is reached
        // by this replica's own implicit vote plus the two other backups.
        replica.on_three_phase(ThreePhaseMessage::Prepare(pr.clone()), NodeName::from("C"), &mut h, &mut suspicions, &mut policy);
        assert!(!matches!(h.broadcasts.last(), Some(ThreePhaseMessage::Commit(_))));
        replica.on_three_phase(ThreePhaseMessage::Prepare(pr), NodeName::from("D"), &mut h, &mut suspicions, &mut policy);
        assert!(matches!(h.broadcasts.last(), Some(ThreePhaseMessage::Commit(_))));

        let cm = CommitMsg { inst_id: InstId(0), view_no: pp.view_no, seq_no: pp.seq_no, digest: pp.digest, timestamp: pp.timestamp };
        replica.on_three_phase(ThreePhaseMessage::Commit(cm.clone()), NodeName::from("C"), &mut h, &mut suspicions, &mut policy);
        assert!(h.committed.is_empty());
        replica.on_three_phase(ThreePhaseMessage::Commit(cm), NodeName::from("D"), &mut h, &mut suspicions, &mut policy);

        assert_eq!(h.committed.len(), 1);
        let (inst_id, seq_no, req_key, operation) = &h.committed[0];
        assert_eq!(*inst_id, InstId(0));
        assert_eq!(*seq_no, SeqNo(1));
        assert_eq!(*req_key, req.key());
        assert_eq!(*operation, req.operation);
        assert!(suspicions.log().is_empty());
    }

    /// A `Commit` naming a digest that disagrees with the accepted
    /// `PrePrepare` is suspected and never counted toward the commit
    /// quorum for the real digest.
    #[test]
    fn commit_with_wrong_digest_is_suspected_and_discarded() {
        let mut replica = Replica::new(InstId(0), NodeName::from("B"), 1);
        replica.set_primary(NodeName::from("A"));
        let mut h = TestHandle::default();
        let mut suspicions = SuspicionRegistry::new();
        let mut policy = NoopBlacklistPolicy::default();

        let req = request();
        let pp = pre_prepare(&h, &req);
        replica.on_three_phase(ThreePhaseMessage::PrePrepare(pp.clone()), NodeName::from("A"), &mut h, &mut suspicions, &mut policy);

        let forged_digest = Digest::of(b"not the real request");
        let bad_commit = CommitMsg { inst_id: InstId(0), view_no: pp.view_no, seq_no: pp.seq_no, digest: forged_digest, timestamp: pp.timestamp };
        replica.on_three_phase(ThreePhaseMessage::Commit(bad_commit), NodeName::from("D"), &mut h, &mut suspicions, &mut policy);

        assert!(h.committed.is_empty());
        assert_eq!(suspicions.log().len(), 1);
        assert_eq!(suspicions.log()[0].offender, NodeName::from("D"));
        assert_eq!(suspicions.log()[0].code, SuspicionCode::CmDigestWrong);
    }

    /// Once a view change has moved the replica to a new view, a `Prepare`
    /// still carrying the old view number is discarded outright — not
    /// stashed, not acted on.
    #[test]
    fn stale_view_prepare_is_discarded_after_view_change() {
        let mut replica = Replica::new(InstId(0), NodeName::from("B"), 1);
        replica.set_primary(NodeName::from("A"));
        let mut h = TestHandle::default();
        let mut suspicions = SuspicionRegistry::new();
        let mut policy = NoopBlacklistPolicy::default();

        let req = request();
        let pp = pre_prepare(&h, &req);
        replica.on_three_phase(ThreePhaseMessage::PrePrepare(pp.clone()), NodeName::from("A"), &mut h, &mut suspicions, &mut policy);
        h.broadcasts.clear();

        replica.on_view_change(ViewNo(1));

        let stale_prepare = PrepareMsg { inst_id: InstId(0), view_no: ViewNo::genesis(), seq_no: pp.seq_no, digest: pp.digest, timestamp: pp.timestamp };
        replica.on_three_phase(ThreePhaseMessage::Prepare(stale_prepare), NodeName::from("C"), &mut h, &mut suspicions, &mut policy);

        assert!(h.broadcasts.is_empty());
        assert!(suspicions.log().is_empty(), "a stale-view message is discarded, not suspected");
    }
}
