//! # raft-core
//!
//! why: replicate a durable log across a cluster with raft-style leader election
//! relations: persists through raft-storage; transport and state machine are injected by the application
//! what: RaftNode, configuration, quorum policies, wire messages, events

pub mod config;
pub mod error;
pub mod event;
pub mod log;
pub mod message;
pub mod quorum;
pub mod state_machine;
pub mod transport;

mod apply;
mod client;
mod election;
mod node;
mod replication;
mod state;

pub use client::AppendOutcome;
pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use event::{NodeEvent, NodeStatus};
pub use log::LogEntry;
pub use message::{Envelope, ErrorCode, RaftMessage};
pub use node::{RaftNode, RaftNodeBuilder};
pub use quorum::{Quorum, Voter};
pub use state::NodeState;
pub use state_machine::StateMachine;
pub use transport::Transport;

pub use raft_storage::Seq;

/// election term; only ever grows on a node
pub type Term = u64;

pub type NodeId = u64;
