//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs and friends, carried by a transport.rs implementation
//! what: RaftMessage, Envelope, ErrorCode, json byte encoding

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::{NodeId, Seq, Term};

/// why a peer refused a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// the request carried an older term than the receiver's
    StaleTerm,
    /// another node is already leader for this term
    LeaderMismatch,
    /// numeric fields or entry framing did not validate
    Malformed,
    /// the entry at `prev_index` does not carry `prev_term`
    Mismatch,
    NotLeader,
    NoLeader,
    LeaderChanged,
    Timeout,
    Storage,
    StateMachine,
    NoStateMachine,
    Transport,
    /// the receiver is closing or otherwise unable to serve
    Unavailable,
}

/// All messages exchanged between nodes
///
/// entries in `Append` are stored log bodies (term prefix included);
/// entries in `Propose` are raw client payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaftMessage {
    /// Request a vote during leader election
    VoteRequest {
        term: Term,
        prev_term: Term,
        prev_index: Seq,
    },
    /// Response to a vote request
    Vote {
        term: Term,
        granted: bool,
        group: Option<String>,
    },
    /// Replicate log entries (also serves as heartbeat when entries is empty)
    Append {
        term: Term,
        prev_term: Term,
        prev_index: Seq,
        commit_index: Seq,
        entries: Vec<Vec<u8>>,
    },
    /// client append forwarded to the leader
    Propose { term: Term, entries: Vec<Vec<u8>> },
    /// client read forwarded to the leader
    Read { term: Term, cmd: Vec<u8> },
    /// success; `seq` is the last index covered, `results` come from the state machine
    Ack {
        term: Term,
        seq: Seq,
        results: Vec<Vec<u8>>,
    },
    /// failure; `hint` is the follower's last index on a mismatch
    Err {
        term: Term,
        code: ErrorCode,
        message: String,
        hint: Option<Seq>,
    },
}

impl RaftMessage {
    pub fn term(&self) -> Term {
        match self {
            Self::VoteRequest { term, .. }
            | Self::Vote { term, .. }
            | Self::Append { term, .. }
            | Self::Propose { term, .. }
            | Self::Read { term, .. }
            | Self::Ack { term, .. }
            | Self::Err { term, .. } => *term,
        }
    }

    /// responses are routed to the pending request with the same id
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Vote { .. } | Self::Ack { .. } | Self::Err { .. })
    }

    pub fn ack(term: Term, seq: Seq) -> Self {
        Self::Ack {
            term,
            seq,
            results: Vec::new(),
        }
    }

    pub fn error(term: Term, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Err {
            term,
            code,
            message: message.into(),
            hint: None,
        }
    }

    /// report a local failure to the requesting peer
    pub fn from_error(term: Term, err: &RaftError) -> Self {
        Self::error(term, err.code(), err.to_string())
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::VoteRequest { .. } => "vote_request",
            Self::Vote { .. } => "vote",
            Self::Append { .. } => "append",
            Self::Propose { .. } => "propose",
            Self::Read { .. } => "read",
            Self::Ack { .. } => "ack",
            Self::Err { .. } => "err",
        }
    }
}

/// a message with its sender and correlation id
///
/// requests carry an id chosen by the sender; responses echo it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub from: NodeId,
    pub message: RaftMessage,
}

impl Envelope {
    pub fn new(id: u64, from: NodeId, message: RaftMessage) -> Self {
        Self { id, from, message }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RaftError::Malformed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| RaftError::Malformed(e.to_string()))
    }
}
