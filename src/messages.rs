/***************************************************************************************************
Wire messages: election messages (Nomination/Primary/Reelection), three-phase
messages (PrePrepare/Prepare/Commit), client requests and instance-change.

Field names are chosen so two honest peers agree byte-for-byte on the
digest of a logical message once canonically encoded (`serde_json` with
sorted keys, see `Request::canonical_bytes`).
***************************************************************************************************/

use serde::{Deserialize, Serialize};

use crate::ids::{ClientId, Digest, InstId, NodeName, ReqKey, SeqNo, Timestamp, ViewNo};

/// A client-submitted request. `(client, reqId)` is unique over the
/// client's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub client: ClientId,
    #[serde(rename = "reqId")]
    pub req_id: u64,
    pub operation: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Request {
    pub fn key(&self) -> ReqKey {
        ReqKey {
            client: self.client.clone(),
            req_id: self.req_id,
        }
    }

    /// Canonical bytes this request's digest is computed over (client,
    /// reqId and operation; the signature itself is not part of the
    /// digested payload).
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.operation.len() + self.client.0.len() + 8);
        buf.extend_from_slice(self.client.0.as_bytes());
        buf.extend_from_slice(&self.req_id.to_be_bytes());
        buf.extend_from_slice(&self.operation);
        buf
    }
}

/// A vote nominating `candidate` as primary of `(instId, viewNo)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nomination {
    #[serde(rename = "instId")]
    pub inst_id: InstId,
    #[serde(rename = "viewNo")]
    pub view_no: ViewNo,
    pub name: NodeName,
}

/// A declaration that `name` won the election for `(instId, viewNo)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Primary {
    #[serde(rename = "instId")]
    pub inst_id: InstId,
    #[serde(rename = "viewNo")]
    pub view_no: ViewNo,
    pub name: NodeName,
}

/// A proposal to re-run the election because of a tie among `tieAmong`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reelection {
    #[serde(rename = "instId")]
    pub inst_id: InstId,
    #[serde(rename = "viewNo")]
    pub view_no: ViewNo,
    pub round: u32,
    #[serde(rename = "tieAmong")]
    pub tie_among: Vec<NodeName>,
}

/// The three election message tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "electionTag")]
pub enum ElectionMessage {
    Nomination(Nomination),
    Primary(Primary),
    Reelection(Reelection),
}

impl ElectionMessage {
    pub fn inst_id(&self) -> InstId {
        match self {
            ElectionMessage::Nomination(m) => m.inst_id,
            ElectionMessage::Primary(m) => m.inst_id,
            ElectionMessage::Reelection(m) => m.inst_id,
        }
    }

    pub fn view_no(&self) -> ViewNo {
        match self {
            ElectionMessage::Nomination(m) => m.view_no,
            ElectionMessage::Primary(m) => m.view_no,
            ElectionMessage::Reelection(m) => m.view_no,
        }
    }
}

/// Sent by the primary: assigns `seqNo` to `reqKey`, carrying the full
/// request inline so backups can recompute and verify `digest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepareMsg {
    #[serde(rename = "instId")]
    pub inst_id: InstId,
    #[serde(rename = "viewNo")]
    pub view_no: ViewNo,
    #[serde(rename = "seqNo")]
    pub seq_no: SeqNo,
    pub digest: Digest,
    pub timestamp: Timestamp,
    #[serde(rename = "reqKey")]
    pub req_key: ReqKey,
    pub request: Request,
}

/// Sent by backups once a `PrePrepare` has been accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareMsg {
    #[serde(rename = "instId")]
    pub inst_id: InstId,
    #[serde(rename = "viewNo")]
    pub view_no: ViewNo,
    #[serde(rename = "seqNo")]
    pub seq_no: SeqNo,
    pub digest: Digest,
    pub timestamp: Timestamp,
}

/// Sent by every replica (primary included) once `prepared`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMsg {
    #[serde(rename = "instId")]
    pub inst_id: InstId,
    #[serde(rename = "viewNo")]
    pub view_no: ViewNo,
    #[serde(rename = "seqNo")]
    pub seq_no: SeqNo,
    pub digest: Digest,
    pub timestamp: Timestamp,
}

/// The three-phase message tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phaseTag")]
pub enum ThreePhaseMessage {
    PrePrepare(PrePrepareMsg),
    Prepare(PrepareMsg),
    Commit(CommitMsg),
}

impl ThreePhaseMessage {
    pub fn inst_id(&self) -> InstId {
        match self {
            ThreePhaseMessage::PrePrepare(m) => m.inst_id,
            ThreePhaseMessage::Prepare(m) => m.inst_id,
            ThreePhaseMessage::Commit(m) => m.inst_id,
        }
    }

    pub fn view_no(&self) -> ViewNo {
        match self {
            ThreePhaseMessage::PrePrepare(m) => m.view_no,
            ThreePhaseMessage::Prepare(m) => m.view_no,
            ThreePhaseMessage::Commit(m) => m.view_no,
        }
    }

    pub fn seq_no(&self) -> SeqNo {
        match self {
            ThreePhaseMessage::PrePrepare(m) => m.seq_no,
            ThreePhaseMessage::Prepare(m) => m.seq_no,
            ThreePhaseMessage::Commit(m) => m.seq_no,
        }
    }
}

/// A proposal to move to `proposedView`, issued by the `Monitor` (or a
/// peer) when the master's throughput falls below the configured ratio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceChange {
    #[serde(rename = "proposedView")]
    pub proposed_view: ViewNo,
}

/// Every message tag the `Router` dispatches, as a closed tagged union —
/// one `match` arm per kind rather than a reflective handler registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msgTag")]
pub enum InboundMessage {
    ClientRequest(Request),
    Election(ElectionMessage),
    ThreePhase(ThreePhaseMessage),
    InstanceChange(InstanceChange),
}
