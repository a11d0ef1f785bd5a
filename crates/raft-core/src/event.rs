//! # event
//!
//! why: let callers observe the node without polling it
//! relations: emitted by node.rs and the driver modules over a tokio broadcast channel
//! what: NodeEvent, NodeStatus snapshot

use std::sync::Arc;

use serde::Serialize;

use crate::error::RaftError;
use crate::state::NodeState;
use crate::{NodeId, Seq, Term};

/// point-in-time view of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: NodeState,
    pub term: Term,
    pub leader: Option<NodeId>,
    /// replication targets, only populated on the leader
    pub followers: Vec<NodeId>,
    pub last_index: Seq,
    pub commit: Seq,
    pub applied: Seq,
}

#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// role, term, leader or follower set changed
    Change(NodeStatus),
    Commit(Seq),
    Apply(Seq),
    /// soft failure, retried by the node itself
    Warn(Arc<RaftError>),
    /// structural failure surfaced to whoever is listening
    Error(Arc<RaftError>),
}
