//! # error
//!
//! why: one error type for every consensus failure, local or remote
//! relations: wraps raft-storage's LogError; converted to and from message.rs ErrorCode on the wire
//! what: RaftError enum, Result alias

use std::time::Duration;

use raft_storage::LogError;
use thiserror::Error;

use crate::message::ErrorCode;
use crate::Term;

#[derive(Debug, Error)]
pub enum RaftError {
    /// the durable log failed underneath the node
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// a bounded wait expired; always soft, the caller may retry
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("no known leader")]
    NoLeader,

    #[error("not the leader")]
    NotLeader,

    /// the entry was replaced by another leader's entry before it committed
    #[error("leadership changed before the entry committed")]
    LeaderChanged,

    /// a peer has moved on to a newer term
    #[error("stale term, peer is at term {0}")]
    StaleTerm(u64),

    #[error("malformed message: {0}")]
    Malformed(String),

    /// a peer answered with an error we have no local equivalent for
    #[error("remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("state machine error: {0}")]
    StateMachine(String),

    #[error("no state machine configured")]
    NoStateMachine,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("node is closed")]
    Closed,
}

impl RaftError {
    /// wire code used when this error is reported to a peer
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Log(_) => ErrorCode::Storage,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::NoLeader => ErrorCode::NoLeader,
            Self::NotLeader => ErrorCode::NotLeader,
            Self::LeaderChanged => ErrorCode::LeaderChanged,
            Self::StaleTerm(_) => ErrorCode::StaleTerm,
            Self::Malformed(_) => ErrorCode::Malformed,
            Self::Remote { code, .. } => *code,
            Self::Transport(_) => ErrorCode::Transport,
            Self::StateMachine(_) => ErrorCode::StateMachine,
            Self::NoStateMachine => ErrorCode::NoStateMachine,
            Self::Config(_) | Self::Closed => ErrorCode::Unavailable,
        }
    }

    /// rebuild an error reported by a peer at `term`
    pub fn from_remote(term: Term, code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::StaleTerm => Self::StaleTerm(term),
            ErrorCode::NoLeader => Self::NoLeader,
            ErrorCode::NotLeader => Self::NotLeader,
            ErrorCode::LeaderChanged => Self::LeaderChanged,
            ErrorCode::NoStateMachine => Self::NoStateMachine,
            code => Self::Remote { code, message },
        }
    }
}

pub type Result<T, E = RaftError> = std::result::Result<T, E>;
