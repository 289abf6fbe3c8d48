/***************************************************************************************************
`Node`: owns one `Elector`, `I = f+1` `Replica`s and one `Monitor`; turns
inbound wire bytes into dispatched calls and buffers outbound wire bytes
for the host to hand to its `Transport`.

The timer heap is a `BinaryHeap` of timed entries popped one at a time
against an injected clock, scoped to one node's own replicas and timers
rather than an entire simulated pool. Inbound envelopes are classified by
tag and handed to whichever component owns the reply.
***************************************************************************************************/

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use log::{debug, warn};

use crate::collab::{Clock, CommittedEntry, Crypto, Destination, Ledger, NodeObserver, PoolConfig, Transport};
use crate::elector::{Elector, ElectorHandle};
use crate::error::{CoreError, CoreResult};
use crate::ids::{Digest, InstId, NodeName, ReqKey, SeqNo, Timestamp, ViewNo};
use crate::messages::{ElectionMessage, InboundMessage, InstanceChange, Request, ThreePhaseMessage};
use crate::monitor::{Monitor, MonitorConfig};
use crate::replica::{Replica, ReplicaHandle};
use crate::router::{self, RouteSink};
use crate::suspicion::{BlacklistPolicy, SuspicionCode, SuspicionRegistry};

/// A gap-fill wait before a stuck out-of-order `PrePrepare` is treated as
/// a missing-link failure.
const SEQ_GAP_TIMEOUT_TICKS: u32 = 5;

/// One pending outbound wire message, queued until the host drains it.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: Destination,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    SeqGapTimeout { inst_id: InstId, view_no: ViewNo, seq_no: SeqNo },
    PrimaryDecision { inst_id: InstId, view_no: ViewNo },
    Renomination { inst_id: InstId, view_no: ViewNo },
    MonitorCheck,
}

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    due: Timestamp,
    id: u64,
    kind: TimerKind,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.id == other.id
    }
}
impl Eq for TimerEntry {}

// Reversed so the min-due entry sorts as the BinaryHeap maximum and is
// popped first: std's BinaryHeap is a max-heap, this needs a min-heap.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due).then_with(|| other.id.cmp(&self.id))
    }
}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Borrows a disjoint subset of `Node`'s fields so it can be handed to a
/// `Replica`/`Elector` as their capability object while the caller still
/// holds a separate mutable borrow of `node.replicas`/`node.elector`.
struct NodeCtx<'a> {
    self_name: NodeName,
    view: ViewNo,
    participating: bool,
    outbox: &'a mut VecDeque<Outbound>,
    timers: &'a mut BinaryHeap<TimerEntry>,
    next_timer_id: &'a mut u64,
    crypto: &'a dyn Crypto,
    clock: &'a mut dyn Clock,
    committed: &'a mut Vec<(InstId, SeqNo, ReqKey, Vec<u8>)>,
    decided: &'a mut Vec<(InstId, NodeName)>,
}

impl<'a> NodeCtx<'a> {
    fn send_envelope(&mut self, to: Destination, msg: InboundMessage) {
        match serde_json::to_vec(&msg) {
            Ok(bytes) => {
                debug!(target: "node", "{} queueing {:?} to {:?}", self.self_name, msg, to);
                self.outbox.push_back(Outbound { to, bytes });
            }
            Err(e) => warn!(target: "node", "failed to encode outbound message: {}", e),
        }
    }

    fn schedule(&mut self, ticks: u32, kind: TimerKind) {
        // The returned handle is a hint for the host's wake-up scheduling;
        // `Node`'s own timer heap is authoritative for due-ness.
        let _ = self.clock.schedule_after(ticks);
        let due = Timestamp(self.clock.now().0 + f64::from(ticks));
        let id = *self.next_timer_id;
        *self.next_timer_id += 1;
        self.timers.push(TimerEntry { due, id, kind });
    }
}

impl<'a> ReplicaHandle for NodeCtx<'a> {
    fn broadcast(&mut self, msg: ThreePhaseMessage) {
        self.send_envelope(Destination::Broadcast, InboundMessage::ThreePhase(msg));
    }

    fn send_to(&mut self, to: NodeName, msg: ThreePhaseMessage) {
        self.send_envelope(Destination::To(to), InboundMessage::ThreePhase(msg));
    }

    fn schedule_seq_gap_timeout(&mut self, inst_id: InstId, view_no: ViewNo, seq_no: SeqNo) {
        self.schedule(SEQ_GAP_TIMEOUT_TICKS, TimerKind::SeqGapTimeout { inst_id, view_no, seq_no });
    }

    fn notify_committed(&mut self, inst_id: InstId, seq_no: SeqNo, req_key: ReqKey, operation: Vec<u8>) {
        self.committed.push((inst_id, seq_no, req_key, operation));
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn digest(&self, bytes: &[u8]) -> Digest {
        self.crypto.digest(bytes)
    }
}

impl<'a> ElectorHandle for NodeCtx<'a> {
    fn broadcast(&mut self, msg: ElectionMessage) {
        self.send_envelope(Destination::Broadcast, InboundMessage::Election(msg));
    }

    fn schedule_primary_decision(&mut self, inst_id: InstId, ticks: u32) {
        let view_no = self.view;
        self.schedule(ticks, TimerKind::PrimaryDecision { inst_id, view_no });
    }

    fn schedule_renomination(&mut self, inst_id: InstId, ticks: u32) {
        let view_no = self.view;
        self.schedule(ticks, TimerKind::Renomination { inst_id, view_no });
    }

    fn is_participating(&self) -> bool {
        self.participating
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn notify_primary_found(&mut self, inst_id: InstId, primary: NodeName) {
        self.decided.push((inst_id, primary));
    }
}

/// A participant in the pool: one `Elector`, `I = f+1` `Replica`s and a
/// `Monitor`, wired to host-supplied collaborators.
pub struct Node {
    self_name: NodeName,
    replicas: Vec<Replica>,
    elector: Elector,
    monitor: Monitor,
    suspicions: SuspicionRegistry,
    blacklist: Box<dyn BlacklistPolicy>,
    transport: Box<dyn Transport>,
    clock: Box<dyn Clock>,
    crypto: Box<dyn Crypto>,
    ledger: Box<dyn Ledger>,
    pool: Box<dyn PoolConfig>,
    observer: Box<dyn NodeObserver>,
    outbox: VecDeque<Outbound>,
    timers: BinaryHeap<TimerEntry>,
    next_timer_id: u64,
    view: ViewNo,
    participating: bool,
    instance_change_votes: HashMap<ViewNo, HashSet<NodeName>>,
    request_received_at: HashMap<ReqKey, Timestamp>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Box<dyn PoolConfig>,
        transport: Box<dyn Transport>,
        clock: Box<dyn Clock>,
        crypto: Box<dyn Crypto>,
        ledger: Box<dyn Ledger>,
        observer: Box<dyn NodeObserver>,
        blacklist: Box<dyn BlacklistPolicy>,
        monitor_config: MonitorConfig,
    ) -> Self {
        let f = pool.f();
        let n = pool.n();
        let instance_count = pool.replicas_per_node();
        let self_name = pool.self_name().clone();

        let replicas = (0..instance_count)
            .map(|i| Replica::new(InstId(i), self_name.clone(), f))
            .collect();
        let elector = Elector::new(self_name.clone(), n, f);
        let monitor = Monitor::new(instance_count, monitor_config);

        let mut node = Node {
            self_name,
            replicas,
            elector,
            monitor,
            suspicions: SuspicionRegistry::new(),
            blacklist,
            transport,
            clock,
            crypto,
            ledger,
            pool,
            observer,
            outbox: VecDeque::new(),
            timers: BinaryHeap::new(),
            next_timer_id: 0,
            view: ViewNo::genesis(),
            participating: true,
            instance_change_votes: HashMap::new(),
            request_received_at: HashMap::new(),
        };

        let check_period = node.monitor.config().check_period as u32;
        node.schedule_raw(check_period, TimerKind::MonitorCheck);

        let undecided: Vec<InstId> = (0..instance_count).map(InstId).collect();
        node.start_election(&undecided);
        node
    }

    pub fn is_participating(&self) -> bool {
        self.participating
    }

    /// Called by the host once this node has finished catching up; kicks
    /// off nomination for every instance that is still undecided.
    pub fn set_participating(&mut self, participating: bool) {
        self.participating = participating;
        if participating {
            let undecided: Vec<InstId> = self.replicas.iter().map(|r| r.inst_id).collect();
            self.start_election(&undecided);
        }
    }

    pub fn view(&self) -> ViewNo {
        self.view
    }

    /// Submit a request on behalf of a client, to be ordered by every
    /// owned instance independently: backup instances replay the same
    /// workload so the monitor can measure the master's comparative
    /// performance.
    pub fn submit_client_request(&mut self, req: Request) {
        self.handle_client_request(req);
    }

    /// Everything queued for the host's `Transport` to actually send
    /// since the last call.
    pub fn take_outbox(&mut self) -> VecDeque<Outbound> {
        std::mem::replace(&mut self.outbox, VecDeque::new())
    }

    pub fn suspicions(&self) -> &SuspicionRegistry {
        &self.suspicions
    }

    pub fn ledger(&self) -> &dyn Ledger {
        self.ledger.as_ref()
    }

    /// Pop and dispatch at most one due timer or one inbound message.
    /// Returns `Ok(true)` if there was work to do.
    pub fn tick(&mut self) -> CoreResult<bool> {
        if let Some(top) = self.timers.peek() {
            if top.due <= self.clock.now() {
                let entry = self.timers.pop().expect("just peeked");
                self.fire_timer(entry);
                return Ok(true);
            }
        }

        if let Some((sender, bytes)) = self.transport.try_recv() {
            let msg: InboundMessage = serde_json::from_slice(&bytes)
                .map_err(|e| CoreError::Malformed(format!("{}: {}", sender, e)))?;
            router::dispatch(self, sender, msg);
            return Ok(true);
        }

        Ok(false)
    }

    /// Runs `tick` up to `limit` times, stopping early once there is
    /// nothing left to do.
    pub fn drain(&mut self, limit: usize) -> CoreResult<usize> {
        let mut done = 0;
        while done < limit {
            if self.tick()? {
                done += 1;
            } else {
                break;
            }
        }
        Ok(done)
    }

    fn schedule_raw(&mut self, ticks: u32, kind: TimerKind) {
        let _ = self.clock.schedule_after(ticks);
        let due = Timestamp(self.clock.now().0 + f64::from(ticks));
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.push(TimerEntry { due, id, kind });
    }

    fn fire_timer(&mut self, entry: TimerEntry) {
        match entry.kind {
            TimerKind::SeqGapTimeout { inst_id, view_no, seq_no } => {
                let now = self.clock.now();
                if let Some(replica) = self.replicas.iter_mut().find(|r| r.inst_id == inst_id) {
                    replica.on_seq_gap_timeout(view_no, seq_no, now, &mut self.suspicions, self.blacklist.as_mut());
                }
            }
            TimerKind::PrimaryDecision { inst_id, view_no } => {
                if view_no != self.view {
                    return;
                }
                let decided = self.with_elector_ctx(|elector, ctx, suspicions, policy| {
                    elector.decide_primary(inst_id, ctx, suspicions, policy);
                });
                self.apply_decided(decided);
            }
            TimerKind::Renomination { inst_id, view_no } => {
                if view_no != self.view {
                    return;
                }
                let decided = self.with_elector_ctx(|elector, ctx, _suspicions, _policy| {
                    elector.start_election(&[inst_id], ctx);
                });
                self.apply_decided(decided);
            }
            TimerKind::MonitorCheck => {
                let now = self.clock.now();
                if self.monitor.check_performance(now) {
                    self.propose_instance_change();
                }
                let check_period = self.monitor.config().check_period as u32;
                self.schedule_raw(check_period, TimerKind::MonitorCheck);
            }
        }
    }

    /// Builds a `NodeCtx` over every field except `elector`, runs `f`
    /// against `(elector, ctx, suspicions, blacklist)`, and returns
    /// whatever primaries were decided along the way.
    fn with_elector_ctx(
        &mut self,
        f: impl FnOnce(&mut Elector, &mut NodeCtx, &mut SuspicionRegistry, &mut dyn BlacklistPolicy),
    ) -> Vec<(InstId, NodeName)> {
        let mut decided = Vec::new();
        let mut committed_scratch = Vec::new();
        {
            let Node {
                elector,
                suspicions,
                blacklist,
                outbox,
                timers,
                next_timer_id,
                crypto,
                clock,
                self_name,
                view,
                participating,
                ..
            } = self;
            let mut ctx = NodeCtx {
                self_name: self_name.clone(),
                view: *view,
                participating: *participating,
                outbox,
                timers,
                next_timer_id,
                crypto: crypto.as_ref(),
                clock: clock.as_mut(),
                committed: &mut committed_scratch,
                decided: &mut decided,
            };
            f(elector, &mut ctx, suspicions, blacklist.as_mut());
        }
        decided
    }

    fn apply_decided(&mut self, decided: Vec<(InstId, NodeName)>) {
        let mut ready = Vec::new();
        for (inst_id, primary) in decided {
            if let Some(replica) = self.replicas.iter_mut().find(|r| r.inst_id == inst_id) {
                ready.extend(replica.set_primary(primary.clone()));
            }
            self.observer.on_primary_elected(inst_id, primary);
        }
        for (sender, pp) in ready {
            self.on_three_phase(sender, ThreePhaseMessage::PrePrepare(pp));
        }
    }

    fn apply_committed(&mut self, committed: Vec<(InstId, SeqNo, ReqKey, Vec<u8>)>) {
        for (inst_id, seq_no, req_key, operation) in committed {
            let now = self.clock.now();
            let latency = self
                .request_received_at
                .remove(&req_key)
                .map(|received| now.0 - received.0)
                .unwrap_or(0.0);
            self.monitor.record_ordered(inst_id, &req_key.client, latency);

            // Backup instances replay the same workload purely so the
            // `Monitor` can compare their throughput against the master's;
            // only the master's commits are client-facing.
            if inst_id.is_master() {
                let digest = self.crypto.digest(&operation);
                self.ledger.append(CommittedEntry {
                    seq_no,
                    req_key: req_key.clone(),
                    digest,
                    operation: operation.clone(),
                });
                self.observer.on_committed(seq_no, req_key, operation);
            }
        }
    }

    fn start_election(&mut self, undecided: &[InstId]) {
        let decided = self.with_elector_ctx(|elector, ctx, _suspicions, _policy| {
            elector.start_election(undecided, ctx);
        });
        self.apply_decided(decided);
    }

    fn handle_client_request(&mut self, req: Request) {
        if !self.participating {
            debug!(target: "node", "{} not participating yet, dropping client request", self.self_name);
            return;
        }
        self.request_received_at.entry(req.key()).or_insert_with(|| self.clock.now());

        let mut committed = Vec::new();
        {
            let Node {
                replicas,
                outbox,
                timers,
                next_timer_id,
                crypto,
                clock,
                self_name,
                view,
                participating,
                ..
            } = self;
            let mut decided_scratch = Vec::new();
            let mut ctx = NodeCtx {
                self_name: self_name.clone(),
                view: *view,
                participating: *participating,
                outbox,
                timers,
                next_timer_id,
                crypto: crypto.as_ref(),
                clock: clock.as_mut(),
                committed: &mut committed,
                decided: &mut decided_scratch,
            };
            for replica in replicas.iter_mut() {
                replica.on_client_request(req.clone(), &mut ctx);
            }
        }
        self.apply_committed(committed);
    }

    fn propose_instance_change(&mut self) {
        let proposed = self.view.next();
        let msg = InboundMessage::InstanceChange(InstanceChange { proposed_view: proposed });
        if let Ok(bytes) = serde_json::to_vec(&msg) {
            self.outbox.push_back(Outbound { to: Destination::Broadcast, bytes });
        }
        let self_name = self.self_name.clone();
        let voters = self.instance_change_votes.entry(proposed).or_insert_with(HashSet::new);
        voters.insert(self_name);
        if voters.len() as u32 >= self.pool.quorum() {
            self.on_view_change(proposed);
        }
    }

    fn on_view_change(&mut self, new_view: ViewNo) {
        let old_view = self.view;
        self.view = new_view;
        self.suspicions.reset_duplicate_counts();
        self.monitor.on_view_change();
        self.instance_change_votes.retain(|v, _| *v > new_view);

        let mut ready_three_phase = Vec::new();
        for replica in &mut self.replicas {
            ready_three_phase.extend(replica.on_view_change(new_view));
        }

        let mut ready_election = Vec::new();
        let decided = self.with_elector_ctx(|elector, ctx, _suspicions, _policy| {
            ready_election = elector.on_view_change(new_view, ctx);
        });
        self.apply_decided(decided);

        for (sender, msg) in ready_election {
            self.on_election(sender, msg);
        }
        for (sender, msg) in ready_three_phase {
            self.on_three_phase(sender, msg);
        }

        self.observer.on_view_change(old_view, new_view);
    }

    fn on_election(&mut self, sender: NodeName, msg: ElectionMessage) {
        let mut decided = Vec::new();
        let mut committed_scratch = Vec::new();
        {
            let Node {
                elector,
                suspicions,
                blacklist,
                outbox,
                timers,
                next_timer_id,
                crypto,
                clock,
                self_name,
                view,
                participating,
                ..
            } = self;
            let mut ctx = NodeCtx {
                self_name: self_name.clone(),
                view: *view,
                participating: *participating,
                outbox,
                timers,
                next_timer_id,
                crypto: crypto.as_ref(),
                clock: clock.as_mut(),
                committed: &mut committed_scratch,
                decided: &mut decided,
            };
            elector.handle(sender, msg, &mut ctx, suspicions, blacklist.as_mut());
        }
        self.apply_decided(decided);
    }

    fn on_three_phase(&mut self, sender: NodeName, msg: ThreePhaseMessage) {
        let inst_id = msg.inst_id();
        let mut committed = Vec::new();
        {
            let Node {
                replicas,
                suspicions,
                blacklist,
                outbox,
                timers,
                next_timer_id,
                crypto,
                clock,
                self_name,
                view,
                participating,
                ..
            } = self;
            let mut decided_scratch = Vec::new();
            let mut ctx = NodeCtx {
                self_name: self_name.clone(),
                view: *view,
                participating: *participating,
                outbox,
                timers,
                next_timer_id,
                crypto: crypto.as_ref(),
                clock: clock.as_mut(),
                committed: &mut committed,
                decided: &mut decided_scratch,
            };
            if let Some(replica) = replicas.iter_mut().find(|r| r.inst_id == inst_id) {
                replica.on_three_phase(msg, sender, &mut ctx, suspicions, blacklist.as_mut());
            } else {
                warn!(target: "node", "no replica owns {}", inst_id);
            }
        }
        self.apply_committed(committed);
    }

    fn on_instance_change(&mut self, sender: NodeName, msg: InstanceChange) {
        let proposed = msg.proposed_view;
        let now = self.clock.now();

        if proposed <= self.view {
            self.suspicions.discard_out_of_view(&format!(
                "instance change to {} from {} is not ahead of current view {}",
                proposed.0, sender, self.view.0
            ));
            return;
        }

        let already_voted = self
            .instance_change_votes
            .get(&proposed)
            .map(|voters| voters.contains(&sender))
            .unwrap_or(false);
        if already_voted {
            // InstanceChange is a node-wide signal, not tied to one
            // Replica; the master instance stands in for the node here.
            self.suspicions.raise(&sender, SuspicionCode::DuplicateInstChng, InstId::MASTER, now, self.blacklist.as_mut());
            return;
        }

        let quorum = self.pool.quorum();
        let voters = self.instance_change_votes.entry(proposed).or_insert_with(HashSet::new);
        voters.insert(sender);
        if voters.len() as u32 >= quorum {
            self.on_view_change(proposed);
        }
    }
}

impl RouteSink for Node {
    fn on_client_request(&mut self, _sender: NodeName, req: Request) {
        self.handle_client_request(req);
    }

    fn on_election(&mut self, sender: NodeName, msg: ElectionMessage) {
        Node::on_election(self, sender, msg);
    }

    fn on_three_phase(&mut self, sender: NodeName, msg: ThreePhaseMessage) {
        Node::on_three_phase(self, sender, msg);
    }

    fn on_instance_change(&mut self, sender: NodeName, msg: InstanceChange) {
        Node::on_instance_change(self, sender, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::NullObserver;
    use crate::ids::ClientId;
    use crate::sim::{SimClock, SimCrypto, SimLedger, SimPoolConfig, SimTransport, SimWorld};
    use crate::suspicion::NoopBlacklistPolicy;

    fn four_node_pool() -> (Vec<NodeName>, std::rc::Rc<std::cell::RefCell<SimWorld>>) {
        let names: Vec<NodeName> = ["n1", "n2", "n3", "n4"].iter().map(|n| NodeName::from(*n)).collect();
        let world = SimWorld::new(names.clone(), 0.0, 1, 1);
        (names, world)
    }

    fn build_node(name: &NodeName, names: &[NodeName], world: &std::rc::Rc<std::cell::RefCell<SimWorld>>) -> (Node, SimTransport) {
        let pool = Box::new(SimPoolConfig::new(name.clone(), names.to_vec()));
        let transport = Box::new(SimTransport::new(name.clone(), world.clone()));
        let clock = Box::new(SimClock::new(world.clone()));
        let crypto = Box::new(SimCrypto::new(name.clone()));
        let ledger = Box::new(SimLedger::new());
        let observer = Box::new(NullObserver::default());
        let blacklist = Box::new(NoopBlacklistPolicy::default());
        let node = Node::new(pool, transport, clock, crypto, ledger, observer, blacklist, MonitorConfig::default());
        let sender = SimTransport::new(name.clone(), world.clone());
        (node, sender)
    }

    /// Four cooperating `Node`s (N=4, f=1) given one client request all
    /// converge on the same committed entry within a bounded number of
    /// rounds, with the host pumping each node's outbox by hand.
    #[test]
    fn happy_path_four_nodes_commit_client_request() {
        let (names, world) = four_node_pool();
        let mut nodes: Vec<Node> = Vec::new();
        let mut senders: Vec<SimTransport> = Vec::new();
        for name in &names {
            let (node, sender) = build_node(name, &names, &world);
            nodes.push(node);
            senders.push(sender);
        }

        nodes[0].submit_client_request(Request {
            client: ClientId::from("alice"),
            req_id: 1,
            operation: b"SET x = 1".to_vec(),
            signature: Vec::new(),
        });

        let mut rounds = 0;
        loop {
            rounds += 1;
            assert!(rounds <= 50, "request did not commit within the round budget");
            world.borrow_mut().advance(1);
            for (node, sender) in nodes.iter_mut().zip(senders.iter_mut()) {
                for outbound in node.take_outbox() {
                    sender.send(outbound.to, outbound.bytes);
                }
                node.drain(16).expect("well-formed envelopes only");
            }
            if nodes.iter().all(|n| n.ledger().latest_seq() == SeqNo(1)) {
                break;
            }
        }

        for node in &nodes {
            let snapshot = node.ledger().snapshot();
            assert_eq!(snapshot.len(), 1);
            assert_eq!(snapshot[0].operation.as_slice(), b"SET x = 1");
            assert!(node.suspicions().log().is_empty());
        }
    }

    /// Enough `InstanceChange` votes (a quorum) move every honest node to
    /// the next view, resetting its replicas' primaries.
    #[test]
    fn instance_change_quorum_advances_view() {
        let (names, world) = four_node_pool();
        let (mut node, _sender) = build_node(&names[0], &names, &world);
        assert_eq!(node.view(), ViewNo::genesis());

        for peer in &names[1..] {
            node.on_instance_change(peer.clone(), InstanceChange { proposed_view: ViewNo(1) });
        }

        assert_eq!(node.view(), ViewNo(1));
    }
}
