//! # raft-storage
//!
//! why: provide a crash-safe, transactional write-ahead log for raft entries
//! relations: used by raft-core, which only sees sequence numbers, transactions and iterators
//! what: Log, Txn, LogIter, Codec, LogConfig
//!
//! each log is three files under one directory: `<name>.body` holds record
//! bodies, `<name>.index` holds one fixed-size entry per record and
//! `<name>.lock` holds the rollback point of a write in flight. a lock left
//! behind by a crash is undone on the next `open`.

pub mod codec;
pub mod config;
pub mod error;
mod iter;
mod log;
mod streams;
mod txn;

pub use codec::{Codec, Crc32Codec, IndexEntry};
pub use config::{LogConfig, LogHooks, NoopHooks, DEFAULT_STEP};
pub use error::{LogError, Result};
pub use iter::LogIter;
pub use log::Log;
pub use txn::{Txn, TxnLock};

/// record sequence number; records start at 0 and -1 means "empty"
pub type Seq = i64;

/// one stored record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub seq: Seq,
    /// offset of the encoded body in the body stream
    pub offset: u64,
    /// length of the encoded body
    pub length: u64,
    pub body: Vec<u8>,
}
