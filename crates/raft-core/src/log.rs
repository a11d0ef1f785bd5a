//! # log
//!
//! why: frame replicated commands with the term that created them
//! relations: bodies written through raft-storage; decoded by replication.rs and apply.rs
//! what: LogEntry (8-byte big-endian term prefix + payload), term lookups

use raft_storage::{Log, Record};

use crate::error::{RaftError, Result};
use crate::{Seq, Term};

const TERM_LEN: usize = 8;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The command to be applied to the state machine
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: Term, payload: Vec<u8>) -> Self {
        Self { term, payload }
    }

    /// empty entry a new leader appends to commit its predecessors' entries
    pub fn noop(term: Term) -> Self {
        Self::new(term, Vec::new())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TERM_LEN + self.payload.len());
        buf.extend_from_slice(&self.term.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let term = Self::term_of(bytes)?;
        Ok(Self::new(term, bytes[TERM_LEN..].to_vec()))
    }

    /// read only the term prefix
    pub fn term_of(bytes: &[u8]) -> Result<Term> {
        let prefix: [u8; TERM_LEN] = bytes
            .get(..TERM_LEN)
            .and_then(|p| p.try_into().ok())
            .ok_or_else(|| {
                RaftError::Malformed(format!("entry of {} bytes has no term", bytes.len()))
            })?;
        Ok(Term::from_be_bytes(prefix))
    }
}

/// term of the entry at `seq`; the empty log position -1 has term 0
pub(crate) async fn term_at(log: &Log, seq: Seq) -> Result<Option<Term>> {
    if seq < 0 {
        return Ok(Some(0));
    }
    match log.get(seq).await? {
        Some(record) => LogEntry::term_of(&record.body).map(Some),
        None => Ok(None),
    }
}

/// (last index, last term) of a record-level head
pub(crate) fn tail_of(head: Option<&Record>) -> Result<(Seq, Term)> {
    match head {
        Some(record) => Ok((record.seq, LogEntry::term_of(&record.body)?)),
        None => Ok((-1, 0)),
    }
}
