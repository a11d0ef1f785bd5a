//! # state_machine
//!
//! why: let applications consume the agreed-upon sequence of commands
//! relations: driven by apply.rs, queried by client.rs reads
//! what: StateMachine trait

use async_trait::async_trait;

use crate::error::Result;
use crate::Seq;

/// Application state built from committed entries
///
/// implementations that never suspend simply do not await. a new leader's
/// no-op entry is delivered as an empty payload.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// apply committed payloads in order; `start` is the index of the first
    ///
    /// returns one result per payload; missing results are treated as empty
    async fn apply(&self, payloads: &[Vec<u8>], start: Seq) -> Result<Vec<Vec<u8>>>;

    /// answer a query against the applied state
    async fn read(&self, cmd: &[u8]) -> Result<Vec<u8>>;
}
