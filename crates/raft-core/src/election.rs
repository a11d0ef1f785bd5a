//! # election
//!
//! why: pick at most one leader per term
//! relations: extends NodeInner from node.rs; rules live in state.rs; a win starts replication.rs
//! what: candidacy, vote collection, leader takeover, heartbeat loop, no-op supervisor, vote handling

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::RaftError;
use crate::log::LogEntry;
use crate::message::RaftMessage;
use crate::node::NodeInner;
use crate::state::NodeState;
use crate::{NodeId, Seq, Term};

impl NodeInner {
    /// become a candidate and ask every peer for its vote
    pub(crate) fn run_election(self: &Arc<Self>) {
        if !self.is_running() {
            return;
        }
        let size = self.cluster_size();
        let (term, won, last_index, last_term) = self.update(|st| {
            let term = st.start_election();
            let won = st.has_quorum(&self.quorum, size);
            (term, won, st.last_index, st.last_term)
        });
        info!(node = self.id(), term, last_index, "starting election");

        if won {
            self.become_leader(term);
            return;
        }
        for peer in self.config.peers() {
            let inner = self.clone();
            self.tasks
                .spawn(async move { inner.request_vote(peer, term, last_term, last_index).await });
        }
    }

    async fn request_vote(self: Arc<Self>, peer: NodeId, term: Term, last_term: Term, last_index: Seq) {
        let request = RaftMessage::VoteRequest {
            term,
            prev_term: last_term,
            prev_index: last_index,
        };
        let reply = match self.rpc(peer, request, self.config.vote_timeout, "vote").await {
            Ok(reply) => reply,
            Err(RaftError::Closed) => return,
            Err(e) => {
                self.warn(e);
                return;
            }
        };

        match reply {
            reply if reply.term() > term => self.step_down(reply.term()),
            RaftMessage::Vote {
                term: voted_in,
                granted,
                group,
            } => {
                debug!(node = self.id(), peer, term, granted, "vote received");
                let size = self.cluster_size();
                let won = self.update(|st| {
                    st.record_vote(peer, voted_in, granted, group, &self.quorum, size)
                });
                if won {
                    self.become_leader(term);
                }
            }
            RaftMessage::Err {
                term, code, message, ..
            } => {
                self.warn(RaftError::from_remote(term, code, message));
            }
            other => self.warn(RaftError::Malformed(format!(
                "{} reply to a vote request",
                other.kind()
            ))),
        }
    }

    /// take over as leader of `term` if this node is still campaigning in it
    fn become_leader(self: &Arc<Self>, term: Term) {
        let peers: Vec<NodeId> = self.config.peers().collect();
        let established = self.update(|st| {
            if st.role != NodeState::Candidate || st.term != term {
                return None;
            }
            st.become_leader(peers);
            Some(st.established)
        });
        let Some(established) = established else {
            return;
        };
        info!(node = self.id(), term, "elected leader");

        let inner = self.clone();
        self.tasks.spawn(async move { inner.heartbeat_loop(term).await });
        self.replicate_all();
        if !established {
            let inner = self.clone();
            self.tasks.spawn(async move { inner.append_noop(term).await });
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, term: Term) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if !self.state().is_leader_in(term) {
                debug!(node = self.id(), term, "heartbeat stopped");
                return;
            }
            self.replicate_all();
        }
    }

    /// append the term's no-op entry, retrying with capped backoff
    ///
    /// stops once the entry is in the log or leadership of `term` is lost
    async fn append_noop(self: Arc<Self>, term: Term) {
        let body = LogEntry::noop(term).encode();
        let mut backoff = self.config.heartbeat_interval;
        loop {
            if !self.state().is_leader_in(term) {
                return;
            }
            match self
                .leader_append(term, std::slice::from_ref(&body), false)
                .await
            {
                Ok(appended) => {
                    debug!(node = self.id(), term, seq = appended.first, "no-op appended");
                    self.replicate_all();
                    return;
                }
                Err(RaftError::NotLeader | RaftError::Closed) => return,
                Err(e) => self.warn(e),
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.election_timeout);
        }
    }

    pub(crate) async fn handle_vote_request(
        &self,
        from: NodeId,
        term: Term,
        prev_term: Term,
        prev_index: Seq,
    ) -> RaftMessage {
        let _serial = self.serial.lock().await;
        let decision = self.update(|st| {
            st.handle_vote_request(from, term, prev_term, prev_index)
                .map(|granted| (granted, st.term))
        });
        match decision {
            Ok((granted, current)) => {
                debug!(node = self.id(), peer = from, term, granted, "vote request");
                RaftMessage::Vote {
                    term: current,
                    granted,
                    group: self.config.group.clone(),
                }
            }
            Err(e) => {
                let reply = RaftMessage::from_error(self.state().term, &e);
                self.fail(e);
                reply
            }
        }
    }
}
