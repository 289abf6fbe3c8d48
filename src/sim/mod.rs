/***************************************************************************************************
In-memory `Transport`/`Clock`/`Crypto`/`Ledger` collaborators for tests and
the `pbft-demo` binary: many `Node`s driven cooperatively in one process,
each holding its own handle onto one shared `SimWorld`.

`SimWorld`'s delivery queue follows an omission-probability / min-max-delay
model; its global tick is advanced explicitly by the driver loop between
rounds. Delivery is a bag of pending envelopes scanned for due-ness rather
than a second `BinaryHeap`, since `Node`'s own timer heap (`node.rs`) is
already the authoritative due-time structure for callbacks; the network
side only needs "is it due yet".
***************************************************************************************************/

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::debug;
use rand::rngs::ThreadRng;
use rand::Rng;

use crate::collab::{Clock, CommittedEntry, Crypto, Destination, Ledger, PoolConfig, Transport, TimerHandle};
use crate::ids::{Digest, NodeName, SeqNo, Timestamp};

struct PendingEnvelope {
    due: Timestamp,
    from: NodeName,
    bytes: Vec<u8>,
}

/// Shared state behind every `SimTransport`/`SimClock` handed out for one
/// run: the global tick, per-node inboxes, and the omission/delay model.
pub struct SimWorld {
    now: Timestamp,
    next_handle: u64,
    omission_prob: f64,
    delay_min: u32,
    delay_max: u32,
    rng: ThreadRng,
    names: Vec<NodeName>,
    inboxes: HashMap<NodeName, Vec<PendingEnvelope>>,
}

impl SimWorld {
    /// `omission_prob` in `[0.0, 1.0]`; `delay_min`/`delay_max` in ticks
    /// (the same unit `Clock::schedule_after` counts in).
    pub fn new(names: Vec<NodeName>, omission_prob: f64, delay_min: u32, delay_max: u32) -> Rc<RefCell<SimWorld>> {
        let mut inboxes = HashMap::with_capacity(names.len());
        for name in &names {
            inboxes.insert(name.clone(), Vec::new());
        }
        Rc::new(RefCell::new(SimWorld {
            now: Timestamp::ZERO,
            next_handle: 0,
            omission_prob,
            delay_min,
            delay_max,
            rng: rand::thread_rng(),
            names,
            inboxes,
        }))
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Advances the global clock by `ticks`. Does not itself cause any
    /// delivery or firing; callers drain `Transport::try_recv` and
    /// `Node::tick` afterwards, exactly as the host would against a real
    /// transport.
    pub fn advance(&mut self, ticks: u32) {
        self.now.0 += f64::from(ticks);
    }

    fn delay(&mut self) -> u32 {
        if self.delay_min >= self.delay_max {
            self.delay_min
        } else {
            self.rng.gen_range(self.delay_min, self.delay_max)
        }
    }

    fn enqueue_one(&mut self, from: NodeName, to: NodeName, bytes: Vec<u8>) {
        if self.omission_prob > 0.0 && self.rng.gen::<f64>() <= self.omission_prob {
            debug!(target: "sim", "dropping message {} -> {}", from, to);
            return;
        }
        let due = Timestamp(self.now.0 + f64::from(self.delay()));
        if let Some(inbox) = self.inboxes.get_mut(&to) {
            inbox.push(PendingEnvelope { due, from, bytes });
        }
    }

    fn enqueue(&mut self, from: NodeName, to: Destination, bytes: Vec<u8>) {
        match to {
            Destination::Broadcast => {
                let others: Vec<NodeName> = self.names.iter().filter(|n| **n != from).cloned().collect();
                for name in others {
                    self.enqueue_one(from.clone(), name, bytes.clone());
                }
            }
            Destination::To(to) => self.enqueue_one(from, to, bytes),
        }
    }

    /// The earliest due envelope addressed to `who`, if any has reached
    /// its due time.
    fn try_recv(&mut self, who: &NodeName) -> Option<(NodeName, Vec<u8>)> {
        let now = self.now;
        let inbox = self.inboxes.get_mut(who)?;
        let idx = inbox
            .iter()
            .enumerate()
            .filter(|(_, e)| e.due <= now)
            .min_by_key(|(_, e)| e.due)
            .map(|(idx, _)| idx)?;
        let envelope = inbox.remove(idx);
        Some((envelope.from, envelope.bytes))
    }
}

/// One node's view of the shared in-memory network.
pub struct SimTransport {
    self_name: NodeName,
    world: Rc<RefCell<SimWorld>>,
}

impl SimTransport {
    pub fn new(self_name: NodeName, world: Rc<RefCell<SimWorld>>) -> Self {
        SimTransport { self_name, world }
    }
}

impl Transport for SimTransport {
    fn send(&mut self, to: Destination, bytes: Vec<u8>) {
        self.world.borrow_mut().enqueue(self.self_name.clone(), to, bytes);
    }

    fn try_recv(&mut self) -> Option<(NodeName, Vec<u8>)> {
        self.world.borrow_mut().try_recv(&self.self_name)
    }
}

/// The shared global clock every `Node` in a run reads `now()` from.
/// `schedule_after`/`cancel` only hand out bookkeeping handles: a `Node`'s
/// own timer heap (`node.rs`) is what actually fires callbacks, so the
/// handle here is never consulted again.
pub struct SimClock {
    world: Rc<RefCell<SimWorld>>,
}

impl SimClock {
    pub fn new(world: Rc<RefCell<SimWorld>>) -> Self {
        SimClock { world }
    }
}

impl Clock for SimClock {
    fn now(&self) -> Timestamp {
        self.world.borrow().now()
    }

    fn schedule_after(&mut self, _delay_ticks: u32) -> TimerHandle {
        let mut world = self.world.borrow_mut();
        let handle = TimerHandle(world.next_handle);
        world.next_handle += 1;
        handle
    }

    fn cancel(&mut self, _handle: TimerHandle) {}
}

/// A non-cryptographic stand-in for `Crypto`, for tests and the demo
/// binary where real key management would only add noise. Signatures are
/// just the signer's own name; `verify` checks the claimed signer matches.
#[derive(Debug, Default)]
pub struct SimCrypto {
    self_name: NodeName,
}

impl SimCrypto {
    pub fn new(self_name: NodeName) -> Self {
        SimCrypto { self_name }
    }
}

impl Crypto for SimCrypto {
    fn digest(&self, bytes: &[u8]) -> Digest {
        Digest::of(bytes)
    }

    fn sign(&self, _bytes: &[u8]) -> Vec<u8> {
        self.self_name.0.clone().into_bytes()
    }

    fn verify(&self, who: &NodeName, _bytes: &[u8], sig: &[u8]) -> bool {
        sig == who.0.as_bytes()
    }
}

/// A fixed pool membership list, for tests and the demo binary. No public
/// keys: paired with `SimCrypto`, which never consults them.
#[derive(Debug, Clone)]
pub struct SimPoolConfig {
    n: u32,
    self_name: NodeName,
    names: Vec<NodeName>,
}

impl SimPoolConfig {
    pub fn new(self_name: NodeName, names: Vec<NodeName>) -> Self {
        SimPoolConfig {
            n: names.len() as u32,
            self_name,
            names,
        }
    }
}

impl PoolConfig for SimPoolConfig {
    fn n(&self) -> u32 {
        self.n
    }

    fn self_name(&self) -> &NodeName {
        &self.self_name
    }

    fn all_names(&self) -> &[NodeName] {
        &self.names
    }

    fn public_key(&self, _name: &NodeName) -> Option<&[u8]> {
        None
    }
}

/// An in-memory append-only ledger, for tests and the demo binary.
#[derive(Debug, Default)]
pub struct SimLedger {
    entries: Vec<CommittedEntry>,
}

impl SimLedger {
    pub fn new() -> Self {
        SimLedger::default()
    }
}

impl Ledger for SimLedger {
    fn append(&mut self, entry: CommittedEntry) {
        self.entries.push(entry);
    }

    fn latest_seq(&self) -> SeqNo {
        self.entries.last().map(|e| e.seq_no).unwrap_or_else(SeqNo::zero)
    }

    fn snapshot(&self) -> Vec<CommittedEntry> {
        self.entries.clone()
    }
}
