/***************************************************************************************************
Per-view primary election: nominate-then-vote with re-election under ties.

State is kept in fixed-size `Vec`s indexed by `InstId`, since the instance
count is fixed for the node's lifetime and a hash lookup buys nothing over
direct indexing.
***************************************************************************************************/

use std::collections::{HashMap, VecDeque};

use log::{debug, info};
use rand::Rng;

use crate::collab::BlacklistPolicy;
use crate::ids::{InstId, NodeName, Timestamp, ViewNo};
use crate::messages::{ElectionMessage, Nomination, Primary, Reelection};
use crate::suspicion::{SuspicionCode, SuspicionRegistry};

/// Capability handle an `Elector` uses to act on the world.
pub trait ElectorHandle {
    fn broadcast(&mut self, msg: ElectionMessage);
    /// Schedule a primary-decision retry `ticks` time units from now,
    /// returning a handle the elector can later check for expiry.
    fn schedule_primary_decision(&mut self, inst_id: InstId, ticks: u32);
    /// Schedule a re-nomination after `ticks` (used for tie backoff,
    /// `random.randint(1, 3)` in the original).
    fn schedule_renomination(&mut self, inst_id: InstId, ticks: u32);
    fn is_participating(&self) -> bool;
    fn now(&self) -> Timestamp;
    fn notify_primary_found(&mut self, inst_id: InstId, primary: NodeName);
}

#[derive(Debug, Default)]
struct InstanceElection {
    nominations: HashMap<NodeName, NodeName>,
    primary_declarations: HashMap<NodeName, NodeName>,
    re_election_proposals: HashMap<NodeName, Vec<NodeName>>,
    re_election_round: u32,
    primary_decision_scheduled: bool,
    decided: bool,
}

impl InstanceElection {
    fn reset(&mut self) {
        self.nominations.clear();
        self.primary_declarations.clear();
        self.re_election_proposals.clear();
        self.primary_decision_scheduled = false;
        // `re_election_round` and `decided` survive a within-view reset;
        // `decided` is cleared explicitly by the caller on view change.
    }
}

/// Runs nomination/primary/re-election independently per `InstId`, one
/// `Elector` per `Node`.
#[derive(Debug)]
pub struct Elector {
    self_name: NodeName,
    n: u32,
    f: u32,
    view: ViewNo,
    instances: Vec<InstanceElection>,
    /// Which instance this node last nominated itself for. Nomination
    /// happens concurrently for every undecided instance at view start, so
    /// this is a last-write marker rather than a gate — see DESIGN.md.
    replica_nominated_for_itself: Option<InstId>,
    pending_for_later_view: HashMap<ViewNo, VecDeque<(NodeName, ElectionMessage)>>,
}

impl Elector {
    pub fn new(self_name: NodeName, n: u32, f: u32) -> Self {
        let instances = (0..=f).map(|_| InstanceElection::default()).collect();
        Elector {
            self_name,
            n,
            f,
            view: ViewNo::genesis(),
            instances,
            replica_nominated_for_itself: None,
            pending_for_later_view: HashMap::new(),
        }
    }

    fn quorum(&self) -> usize {
        (2 * self.f + 1) as usize
    }

    pub fn view(&self) -> ViewNo {
        self.view
    }

    fn inst(&mut self, inst_id: InstId) -> &mut InstanceElection {
        &mut self.instances[inst_id.0 as usize]
    }

    /// A new view begins: nominate self for every instance whose primary
    /// is not yet known.
    pub fn start_election(&mut self, undecided: &[InstId], handle: &mut dyn ElectorHandle) {
        if !handle.is_participating() {
            debug!(target: "elector", "{} deferring nomination, still catching up", self.self_name);
            return;
        }
        for &inst_id in undecided {
            self.nominate_self(inst_id, handle);
        }
    }

    fn nominate_self(&mut self, inst_id: InstId, handle: &mut dyn ElectorHandle) {
        let self_name = self.self_name.clone();
        let view = self.view;
        let already = self.inst(inst_id).nominations.get(&self_name).cloned();
        if already.is_some() {
            debug!(target: "elector", "{} already nominated for {}, standing down", self.self_name, inst_id);
            return;
        }
        self.inst(inst_id)
            .nominations
            .insert(self_name.clone(), self_name.clone());
        self.replica_nominated_for_itself = Some(inst_id);
        info!(target: "elector", "{} nominating itself for {}", self.self_name, inst_id);
        handle.broadcast(ElectionMessage::Nomination(Nomination {
            inst_id,
            view_no: view,
            name: self_name,
        }));
    }

    /// Filters an inbound election message by view: past-view messages
    /// are dropped, future-view ones are stashed. Returns `Some` if it
    /// should be processed now.
    fn filter_by_view(
        &mut self,
        sender: NodeName,
        msg: ElectionMessage,
        suspicions: &SuspicionRegistry,
    ) -> Option<(NodeName, ElectionMessage)> {
        let msg_view = msg.view_no();
        if msg_view < self.view {
            suspicions.discard_out_of_view(&format!(
                "{:?} from {} is for past view {} (current {})",
                msg, sender, msg_view.0, self.view.0
            ));
            None
        } else if msg_view > self.view {
            debug!(target: "elector", "{} queueing {:?} from {} for later view {}", self.self_name, msg, sender, msg_view.0);
            self.pending_for_later_view
                .entry(msg_view)
                .or_insert_with(VecDeque::new)
                .push_back((sender, msg));
            None
        } else {
            Some((sender, msg))
        }
    }

    pub fn handle(
        &mut self,
        sender: NodeName,
        msg: ElectionMessage,
        handle: &mut dyn ElectorHandle,
        suspicions: &mut SuspicionRegistry,
        policy: &mut dyn BlacklistPolicy,
    ) {
        let (sender, msg) = match self.filter_by_view(sender, msg, suspicions) {
            Some(x) => x,
            None => return,
        };
        match msg {
            ElectionMessage::Nomination(nom) => self.process_nominate(nom, sender, handle, suspicions, policy),
            ElectionMessage::Primary(prim) => self.process_primary(prim, sender, handle, suspicions, policy),
            ElectionMessage::Reelection(rel) => self.process_reelection(rel, sender, handle, suspicions, policy),
        }
    }

    fn process_nominate(
        &mut self,
        nom: Nomination,
        sender: NodeName,
        handle: &mut dyn ElectorHandle,
        suspicions: &mut SuspicionRegistry,
        policy: &mut dyn BlacklistPolicy,
    ) {
        let inst_id = nom.inst_id;
        let now = handle.now();

        if self.inst(inst_id).nominations.contains_key(&sender) {
            suspicions.raise(&sender, SuspicionCode::DuplicateNomSent, inst_id, now, policy);
            return;
        }

        self.inst(inst_id)
            .nominations
            .insert(sender.clone(), nom.name.clone());

        if self.inst(inst_id).nominations.len() >= self.quorum() {
            self.decide_primary(inst_id, handle, suspicions, policy);
        }
    }

    fn process_primary(
        &mut self,
        prim: Primary,
        sender: NodeName,
        handle: &mut dyn ElectorHandle,
        suspicions: &mut SuspicionRegistry,
        policy: &mut dyn BlacklistPolicy,
    ) {
        let inst_id = prim.inst_id;
        let now = handle.now();

        if self.instances[inst_id.0 as usize].decided {
            debug!(target: "elector", "{} already decided primary for {}, ignoring PRIMARY", self.self_name, inst_id);
            return;
        }

        if self.inst(inst_id).primary_declarations.contains_key(&sender) {
            suspicions.raise(&sender, SuspicionCode::DuplicatePriSent, inst_id, now, policy);
            return;
        }

        self.inst(inst_id)
            .primary_declarations
            .insert(sender, prim.name);

        if self.inst(inst_id).primary_declarations.len() >= self.quorum() {
            let winner = most_common(self.inst(inst_id).primary_declarations.values());
            if let Some(winner) = winner {
                self.instances[inst_id.0 as usize].decided = true;
                if self.replica_nominated_for_itself == Some(inst_id) {
                    self.replica_nominated_for_itself = None;
                }
                info!(target: "elector", "{} elected {} as primary for {} (view {})", self.self_name, winner, inst_id, self.view.0);
                handle.notify_primary_found(inst_id, winner);
            }
        }
    }

    fn process_reelection(
        &mut self,
        rel: Reelection,
        sender: NodeName,
        handle: &mut dyn ElectorHandle,
        suspicions: &mut SuspicionRegistry,
        policy: &mut dyn BlacklistPolicy,
    ) {
        let inst_id = rel.inst_id;
        let now = handle.now();

        let expected_round_diff = if self.inst(inst_id).re_election_proposals.contains_key(&self.self_name) {
            0
        } else {
            1
        };
        let expected_round = self.instances[inst_id.0 as usize].re_election_round + expected_round_diff;
        if rel.round != expected_round {
            suspicions.discard_out_of_view(&format!(
                "reelection from {} with round {} does not match expected {}",
                sender, rel.round, expected_round
            ));
            return;
        }

        if self.inst(inst_id).re_election_proposals.contains_key(&sender) {
            suspicions.raise(&sender, SuspicionCode::DuplicateRelSent, inst_id, now, policy);
            return;
        }

        self.inst(inst_id)
            .re_election_proposals
            .insert(sender, rel.tie_among);

        if self.inst(inst_id).re_election_proposals.len() >= self.quorum() {
            let ties: Vec<&Vec<NodeName>> = self.inst(inst_id).re_election_proposals.values().collect();
            let tie_among = most_common_vec(&ties).unwrap_or_default();

            self.inst(inst_id).reset();

            if tie_among.contains(&self.self_name) {
                let ticks = rand::thread_rng().gen_range(1, 4);
                handle.schedule_renomination(inst_id, ticks);
            } else {
                self.nominate_self(inst_id, handle);
            }
        }
    }

    /// Decides whether the current nomination tally settles on a primary,
    /// needs to wait for more votes, or must force a reelection on a tie.
    pub fn decide_primary(
        &mut self,
        inst_id: InstId,
        handle: &mut dyn ElectorHandle,
        _suspicions: &mut SuspicionRegistry,
        _policy: &mut dyn BlacklistPolicy,
    ) {
        if self.instances[inst_id.0 as usize].decided {
            return;
        }
        if self.inst(inst_id).primary_declarations.contains_key(&self.self_name) {
            return;
        }
        if self.inst(inst_id).re_election_proposals.contains_key(&self.self_name) {
            return;
        }
        if self.inst(inst_id).nominations.len() < self.quorum() {
            return;
        }

        let candidates = top_candidates(self.inst(inst_id).nominations.values());
        let has_all = self.inst(inst_id).nominations.len() as u32 == self.n;
        let timer_expired = self.instances[inst_id.0 as usize].primary_decision_scheduled;

        if candidates.len() == 1 {
            let (name, votes) = candidates[0].clone();
            if has_all || timer_expired {
                self.send_primary(inst_id, name, handle);
                return;
            }
            let votes_needed = ((self.n as f64 + 1.0) / 2.0).ceil() as usize;
            if votes >= votes_needed {
                self.send_primary(inst_id, name, handle);
            } else {
                self.schedule_primary_decision(inst_id, handle);
            }
        } else if has_all || timer_expired {
            let tie_among: Vec<NodeName> = candidates.into_iter().map(|(n, _)| n).collect();
            self.send_reelection(inst_id, tie_among, handle);
        } else {
            self.schedule_primary_decision(inst_id, handle);
        }
    }

    fn send_primary(&mut self, inst_id: InstId, name: NodeName, handle: &mut dyn ElectorHandle) {
        let self_name = self.self_name.clone();
        self.inst(inst_id)
            .primary_declarations
            .insert(self_name, name.clone());
        self.instances[inst_id.0 as usize].primary_decision_scheduled = false;
        handle.broadcast(ElectionMessage::Primary(Primary {
            inst_id,
            view_no: self.view,
            name,
        }));
    }

    fn send_reelection(&mut self, inst_id: InstId, tie_among: Vec<NodeName>, handle: &mut dyn ElectorHandle) {
        self.instances[inst_id.0 as usize].re_election_round += 1;
        let round = self.instances[inst_id.0 as usize].re_election_round;
        let self_name = self.self_name.clone();
        self.inst(inst_id)
            .re_election_proposals
            .insert(self_name, tie_among.clone());
        self.instances[inst_id.0 as usize].primary_decision_scheduled = false;
        info!(target: "elector", "{} proposing reelection round {} for {} among {:?}", self.self_name, round, inst_id, tie_among);
        handle.broadcast(ElectionMessage::Reelection(Reelection {
            inst_id,
            view_no: self.view,
            round,
            tie_among,
        }));
    }

    fn schedule_primary_decision(&mut self, inst_id: InstId, handle: &mut dyn ElectorHandle) {
        if !self.instances[inst_id.0 as usize].primary_decision_scheduled {
            self.instances[inst_id.0 as usize].primary_decision_scheduled = true;
            handle.schedule_primary_decision(inst_id, self.n);
        }
    }

    /// View transition: reset all election state, clear duplicate
    /// counters (owned by `SuspicionRegistry`), and drain
    /// `pendingForLaterView` entries whose view is now current, oldest
    /// first.
    pub fn on_view_change(&mut self, new_view: ViewNo, handle: &mut dyn ElectorHandle) -> Vec<(NodeName, ElectionMessage)> {
        self.view = new_view;
        for inst in &mut self.instances {
            inst.reset();
            inst.decided = false;
        }
        self.replica_nominated_for_itself = None;

        let mut ready = Vec::new();
        let mut remaining = HashMap::new();
        for (view, mut queue) in self.pending_for_later_view.drain() {
            if view == new_view {
                ready.extend(queue.drain(..));
            } else if view > new_view {
                remaining.insert(view, queue);
            }
        }
        self.pending_for_later_view = remaining;

        let undecided: Vec<InstId> = (0..self.instances.len())
            .map(|i| InstId(i as u32))
            .filter(|i| !self.instances[i.0 as usize].decided)
            .collect();
        self.start_election(&undecided, handle);

        ready
    }
}

fn most_common<'a, I: Iterator<Item = &'a NodeName>>(iter: I) -> Option<NodeName> {
    let mut counts: HashMap<&NodeName, usize> = HashMap::new();
    for name in iter {
        *counts.entry(name).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(name, _)| name.clone())
}

fn most_common_vec(ties: &[&Vec<NodeName>]) -> Option<Vec<NodeName>> {
    let mut counts: HashMap<Vec<NodeName>, usize> = HashMap::new();
    for tie in ties {
        let mut sorted = (*tie).clone();
        sorted.sort();
        *counts.entry(sorted).or_insert(0) += 1;
    }
    counts.into_iter().max_by_key(|(_, c)| *c).map(|(t, _)| t)
}

/// All candidates tied for the maximum vote count, deterministically
/// ordered by name.
fn top_candidates<'a, I: Iterator<Item = &'a NodeName>>(iter: I) -> Vec<(NodeName, usize)> {
    let mut counts: HashMap<NodeName, usize> = HashMap::new();
    for name in iter {
        *counts.entry(name.clone()).or_insert(0) += 1;
    }
    let max = counts.values().copied().max().unwrap_or(0);
    let mut top: Vec<(NodeName, usize)> = counts.into_iter().filter(|(_, c)| *c == max).collect();
    top.sort_by(|a, b| a.0.cmp(&b.0));
    top
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suspicion::NoopBlacklistPolicy;

    #[derive(Default)]
    struct TestHandle {
        participating: bool,
        broadcasts: Vec<ElectionMessage>,
        decided: Vec<(InstId, NodeName)>,
    }

    impl TestHandle {
        fn participating() -> Self {
            TestHandle { participating: true, ..Default::default() }
        }
    }

    impl ElectorHandle for TestHandle {
        fn broadcast(&mut self, msg: ElectionMessage) {
            self.broadcasts.push(msg);
        }
        fn schedule_primary_decision(&mut self, _inst_id: InstId, _ticks: u32) {}
        fn schedule_renomination(&mut self, _inst_id: InstId, _ticks: u32) {}
        fn is_participating(&self) -> bool {
            self.participating
        }
        fn now(&self) -> Timestamp {
            Timestamp::ZERO
        }
        fn notify_primary_found(&mut self, inst_id: InstId, primary: NodeName) {
            self.decided.push((inst_id, primary));
        }
    }

    fn nominate(elector: &mut Elector, h: &mut TestHandle, suspicions: &mut SuspicionRegistry, policy: &mut dyn BlacklistPolicy, sender: &str, candidate: &str) {
        elector.handle(
            NodeName::from(sender),
            ElectionMessage::Nomination(Nomination { inst_id: InstId(0), view_no: ViewNo::genesis(), name: NodeName::from(candidate) }),
            h,
            suspicions,
            policy,
        );
    }

    /// N=4, f=1: three nominations split 2-1 just schedule a retry, but
    /// once the fourth arrives splitting the vote 2-2, every node
    /// broadcasts `Reelection` naming both tied candidates.
    #[test]
    fn election_tie_broadcasts_reelection() {
        let mut elector = Elector::new(NodeName::from("A"), 4, 1);
        let mut h = TestHandle::participating();
        let mut suspicions = SuspicionRegistry::new();
        let mut policy = NoopBlacklistPolicy::default();

        nominate(&mut elector, &mut h, &mut suspicions, &mut policy, "A", "A");
        nominate(&mut elector, &mut h, &mut suspicions, &mut policy, "B", "B");
        nominate(&mut elector, &mut h, &mut suspicions, &mut policy, "C", "A");
        assert!(h.broadcasts.is_empty(), "quorum of 3 with a 2-1 split should only schedule a retry");

        nominate(&mut elector, &mut h, &mut suspicions, &mut policy, "D", "B");

        assert_eq!(h.broadcasts.len(), 1);
        match &h.broadcasts[0] {
            ElectionMessage::Reelection(rel) => {
                assert_eq!(rel.round, 1);
                let mut tie = rel.tie_among.clone();
                tie.sort();
                assert_eq!(tie, vec![NodeName::from("A"), NodeName::from("B")]);
            }
            other => panic!("expected Reelection, got {:?}", other),
        }
    }

    /// A clean 3-vote quorum all naming the same candidate elects them as
    /// soon as a quorum of `Primary` declarations has been seen.
    #[test]
    fn unanimous_nominations_lead_to_primary_decision() {
        let mut elector = Elector::new(NodeName::from("A"), 4, 1);
        let mut h = TestHandle::participating();
        let mut suspicions = SuspicionRegistry::new();
        let mut policy = NoopBlacklistPolicy::default();

        nominate(&mut elector, &mut h, &mut suspicions, &mut policy, "A", "A");
        nominate(&mut elector, &mut h, &mut suspicions, &mut policy, "B", "A");
        nominate(&mut elector, &mut h, &mut suspicions, &mut policy, "C", "A");

        match &h.broadcasts[0] {
            ElectionMessage::Primary(prim) => assert_eq!(prim.name, NodeName::from("A")),
            other => panic!("expected Primary, got {:?}", other),
        }
        assert!(h.decided.is_empty(), "self's own declaration is not yet a quorum of Primary messages");

        elector.handle(
            NodeName::from("B"),
            ElectionMessage::Primary(Primary { inst_id: InstId(0), view_no: ViewNo::genesis(), name: NodeName::from("A") }),
            &mut h,
            &mut suspicions,
            &mut policy,
        );
        elector.handle(
            NodeName::from("C"),
            ElectionMessage::Primary(Primary { inst_id: InstId(0), view_no: ViewNo::genesis(), name: NodeName::from("A") }),
            &mut h,
            &mut suspicions,
            &mut policy,
        );

        assert_eq!(h.decided, vec![(InstId(0), NodeName::from("A"))]);
    }

    /// A `Nomination` for a view ahead of the elector's current one is
    /// stashed, not processed, and replayed exactly once when the elector
    /// reaches that view.
    #[test]
    fn future_view_nomination_is_stashed_then_replayed_once() {
        let mut elector = Elector::new(NodeName::from("A"), 4, 1);
        let mut h = TestHandle::participating();
        let mut suspicions = SuspicionRegistry::new();
        let mut policy = NoopBlacklistPolicy::default();

        let future_msg = ElectionMessage::Nomination(Nomination { inst_id: InstId(0), view_no: ViewNo(2), name: NodeName::from("Y") });
        elector.handle(NodeName::from("Y"), future_msg.clone(), &mut h, &mut suspicions, &mut policy);

        let ready_at_v1 = elector.on_view_change(ViewNo(1), &mut h);
        assert!(ready_at_v1.is_empty(), "a view-2 message must not be replayed while only reaching view 1");

        let ready_at_v2 = elector.on_view_change(ViewNo(2), &mut h);
        assert_eq!(ready_at_v2, vec![(NodeName::from("Y"), future_msg)]);

        let ready_again = elector.on_view_change(ViewNo(2), &mut h);
        assert!(ready_again.is_empty(), "the stash must not replay the same message twice");
    }

    /// A sender repeating the same `Nomination` is tolerated once (logged
    /// but silent), suspected on the second repeat, and escalated to the
    /// blacklist policy from the third repeat on.
    #[test]
    fn duplicate_nomination_escalates_to_blacklist_policy() {
        #[derive(Default)]
        struct RecordingPolicy {
            offenses: Vec<(NodeName, SuspicionCode, u32)>,
        }
        impl BlacklistPolicy for RecordingPolicy {
            fn on_repeat_offender(&mut self, offender: &NodeName, code: SuspicionCode, count: u32) {
                self.offenses.push((offender.clone(), code, count));
            }
        }

        let mut elector = Elector::new(NodeName::from("A"), 4, 1);
        let mut h = TestHandle::participating();
        let mut suspicions = SuspicionRegistry::new();
        let mut policy = RecordingPolicy::default();

        nominate(&mut elector, &mut h, &mut suspicions, &mut policy, "B", "B");
        assert!(suspicions.log().is_empty());

        nominate(&mut elector, &mut h, &mut suspicions, &mut policy, "B", "B");
        assert_eq!(suspicions.log().len(), 1);
        assert!(policy.offenses.is_empty(), "a single repeat is not yet a repeat offender");

        nominate(&mut elector, &mut h, &mut suspicions, &mut policy, "B", "B");
        assert_eq!(suspicions.log().len(), 2);
        assert_eq!(policy.offenses, vec![(NodeName::from("B"), SuspicionCode::DuplicateNomSent, 2)]);
    }
}
