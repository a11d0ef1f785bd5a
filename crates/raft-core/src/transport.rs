//! # transport
//!
//! why: decouple the node from how bytes move between processes
//! relations: called by node.rs for every outbound request and response; inbound traffic enters via RaftNode::on_receive
//! what: Transport trait

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Envelope;
use crate::NodeId;

/// outbound message channel to the other nodes
///
/// delivery may be lossy; every wait on a reply is bounded by the node's
/// own timeouts. `send` should hand the envelope off rather than wait for
/// the peer to process it.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, to: NodeId, envelope: Envelope) -> Result<()>;
}
