//! # error
//!
//! why: give every log failure a typed, matchable kind
//! relations: returned by log.rs, txn.rs, iter.rs and codec.rs; wrapped by raft-core
//! what: LogError enum and the crate Result alias

use std::io;
use thiserror::Error;

use crate::Seq;

/// errors produced by the durable log
#[derive(Debug, Error)]
pub enum LogError {
    /// storage could not be opened, read, written, synced or truncated
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// an append named a sequence number that breaks the gapless invariant
    #[error("sequence mismatch: expected {expected}, got {actual}")]
    Sequence { expected: Seq, actual: Seq },

    /// the codec rejected bytes read back from storage
    #[error("corrupt {what}: {reason}")]
    Corrupt { what: String, reason: String },

    /// the transaction handle was already committed or aborted
    #[error("transaction already committed or aborted")]
    TxnFinished,

    /// the log is not open
    #[error("log is closed")]
    Closed,

    /// the log is shutting down and accepts no new transactions
    #[error("log is closing")]
    Closing,

    /// the operation needs the log to be closed first
    #[error("log is open")]
    Open,

    /// append_batch was called with no bodies
    #[error("empty batch")]
    EmptyBatch,

    /// a sequence number below the -1 sentinel
    #[error("invalid sequence number {0}")]
    InvalidSeq(Seq),

    /// a caller-supplied hook failed
    #[error("hook failed: {0}")]
    Hook(String),
}

impl LogError {
    /// shorthand for a codec corruption error
    pub fn corrupt(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            what: what.into(),
            reason: reason.into(),
        }
    }
}

/// result alias used across the crate
pub type Result<T, E = LogError> = std::result::Result<T, E>;
