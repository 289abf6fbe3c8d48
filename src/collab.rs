/***************************************************************************************************
Collaborator interfaces consumed by the core: Transport, Clock, Crypto,
Ledger, PoolConfig, plus the NodeObserver the host registers to receive
`onCommitted`/`onPrimaryElected`/`onViewChange` events.

The core never constructs a concrete Transport/Ledger itself; a `Node` is
generic over these traits so the host's CLI, wallet, ledger and transport
layers can supply their own. `crate::sim` provides an in-memory
implementation for tests and demos.
***************************************************************************************************/

use crate::ids::{Digest, NodeName, ReqKey, SeqNo, Timestamp, ViewNo};

/// Where an outbound message is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Broadcast,
    To(NodeName),
}

/// Authenticated, point-to-point, in-order-per-peer, possibly-lossy
/// message transport. The core treats `bytes` as an opaque canonical
/// encoding of an `InboundMessage`.
pub trait Transport {
    fn send(&mut self, to: Destination, bytes: Vec<u8>);
    fn try_recv(&mut self) -> Option<(NodeName, Vec<u8>)>;
}

/// A handle to a scheduled callback, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// Monotonic clock plus a scheduler for delayed callbacks. Suspension
/// points never block: a handler schedules a future callback and
/// returns; the callback becomes an ordinary inbox event on due time.
pub trait Clock {
    fn now(&self) -> Timestamp;
    fn schedule_after(&mut self, delay_ticks: u32) -> TimerHandle;
    fn cancel(&mut self, handle: TimerHandle);
}

/// Black-box digest/sign/verify primitive; designing the cryptographic
/// scheme itself is out of scope for this crate.
pub trait Crypto {
    fn digest(&self, bytes: &[u8]) -> Digest {
        Digest::of(bytes)
    }
    fn sign(&self, bytes: &[u8]) -> Vec<u8>;
    fn verify(&self, who: &NodeName, bytes: &[u8], sig: &[u8]) -> bool;
}

/// An entry durably recorded once a master-instance request commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedEntry {
    pub seq_no: SeqNo,
    pub req_key: ReqKey,
    pub digest: Digest,
    pub operation: Vec<u8>,
}

/// Append-only ledger collaborator; the Merkle store and on-disk log
/// backing it are out of scope for this crate.
pub trait Ledger {
    fn append(&mut self, entry: CommittedEntry);
    fn latest_seq(&self) -> SeqNo;
    fn snapshot(&self) -> Vec<CommittedEntry>;
}

/// The pool's membership and sizing, as seen by this node.
pub trait PoolConfig {
    fn n(&self) -> u32;
    fn f(&self) -> u32 {
        (self.n().saturating_sub(1)) / 3
    }
    fn replicas_per_node(&self) -> u32 {
        self.f() + 1
    }
    fn quorum(&self) -> u32 {
        2 * self.f() + 1
    }
    fn self_name(&self) -> &NodeName;
    fn all_names(&self) -> &[NodeName];
    fn public_key(&self, name: &NodeName) -> Option<&[u8]>;
}

/// Boundary events the `Node` exposes to the host.
pub trait NodeObserver {
    fn on_committed(&mut self, seq_no: SeqNo, req_key: ReqKey, payload: Vec<u8>);
    fn on_primary_elected(&mut self, inst_id: crate::ids::InstId, primary: NodeName);
    fn on_view_change(&mut self, old_view: ViewNo, new_view: ViewNo);
}

/// An observer that does nothing; useful in tests that only care about
/// internal state, not external callbacks.
#[derive(Debug, Default)]
pub struct NullObserver;

impl NodeObserver for NullObserver {
    fn on_committed(&mut self, _seq_no: SeqNo, _req_key: ReqKey, _payload: Vec<u8>) {}
    fn on_primary_elected(&mut self, _inst_id: crate::ids::InstId, _primary: NodeName) {}
    fn on_view_change(&mut self, _old_view: ViewNo, _new_view: ViewNo) {}
}
