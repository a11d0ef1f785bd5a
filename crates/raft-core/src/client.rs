//! # client
//!
//! why: give applications one entry point on every node, leader or not
//! relations: leaders go through replication.rs and apply.rs; followers forward over the transport
//! what: append, append_batch, read, and the leader-side handlers for forwarded calls

use std::sync::Arc;

use raft_storage::LogError;
use tracing::debug;

use crate::error::{RaftError, Result};
use crate::log::{term_at, LogEntry};
use crate::message::RaftMessage;
use crate::node::{NodeInner, RaftNode};
use crate::state::NodeState;
use crate::{Seq, Term};

/// where a client append landed
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppendOutcome {
    /// index of the first appended entry
    pub seq: Seq,
    /// one state machine result per entry; empty without a state machine
    pub results: Vec<Vec<u8>>,
}

impl RaftNode {
    pub async fn append(&self, payload: impl Into<Vec<u8>>) -> Result<AppendOutcome> {
        self.append_batch(vec![payload.into()]).await
    }

    /// replicate `payloads` as consecutive entries and wait until they are committed
    ///
    /// followers forward the batch to the leader they know of
    pub async fn append_batch(&self, payloads: Vec<Vec<u8>>) -> Result<AppendOutcome> {
        let inner = &self.inner;
        inner.ensure_running()?;
        if payloads.is_empty() {
            return Err(LogError::EmptyBatch.into());
        }
        let (term, role, leader) = {
            let st = inner.state();
            (st.term, st.role, st.leader)
        };
        if role == NodeState::Leader {
            return inner.submit(term, payloads).await;
        }

        let leader = leader.ok_or(RaftError::NoLeader)?;
        debug!(node = inner.id(), leader, count = payloads.len(), "forwarding append");
        let request = RaftMessage::Propose {
            term,
            entries: payloads,
        };
        match inner
            .rpc(leader, request, inner.config.append_timeout, "append")
            .await?
        {
            RaftMessage::Ack { seq, results, .. } => Ok(AppendOutcome { seq, results }),
            RaftMessage::Err {
                term, code, message, ..
            } => Err(RaftError::from_remote(term, code, message)),
            other => Err(RaftError::Malformed(format!(
                "{} reply to a propose",
                other.kind()
            ))),
        }
    }

    /// query the state machine with linearizable read-index semantics
    pub async fn read(&self, cmd: impl Into<Vec<u8>>) -> Result<Vec<u8>> {
        let inner = &self.inner;
        inner.ensure_running()?;
        if inner.state_machine.is_none() {
            return Err(RaftError::NoStateMachine);
        }
        let cmd = cmd.into();
        let (term, role, leader) = {
            let st = inner.state();
            (st.term, st.role, st.leader)
        };
        if role == NodeState::Leader {
            return inner.leader_read(term, &cmd).await;
        }

        let leader = leader.ok_or(RaftError::NoLeader)?;
        let request = RaftMessage::Read { term, cmd };
        match inner
            .rpc(leader, request, inner.config.read_timeout, "read")
            .await?
        {
            RaftMessage::Ack { results, .. } => Ok(results.into_iter().next().unwrap_or_default()),
            RaftMessage::Err {
                term, code, message, ..
            } => Err(RaftError::from_remote(term, code, message)),
            other => Err(RaftError::Malformed(format!(
                "{} reply to a read",
                other.kind()
            ))),
        }
    }
}

/// drops the result slots of a submission that stopped waiting
struct Waiters<'a> {
    inner: &'a NodeInner,
    first: Seq,
    last: Seq,
    term: Term,
}

impl Drop for Waiters<'_> {
    fn drop(&mut self) {
        let mut slots = self.inner.results();
        for seq in self.first..=self.last {
            if slots.get(&seq).is_some_and(|slot| slot.term == self.term) {
                slots.remove(&seq);
            }
        }
    }
}

impl NodeInner {
    /// leader path of an append, bounded by `append_timeout`
    pub(crate) async fn submit(self: &Arc<Self>, term: Term, payloads: Vec<Vec<u8>>) -> Result<AppendOutcome> {
        let after = self.config.append_timeout;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(RaftError::Closed),
            outcome = tokio::time::timeout(after, self.commit_entries(term, payloads)) => {
                outcome.unwrap_or(Err(RaftError::Timeout { op: "append", after }))
            }
        }
    }

    async fn commit_entries(self: &Arc<Self>, term: Term, payloads: Vec<Vec<u8>>) -> Result<AppendOutcome> {
        let bodies: Vec<Vec<u8>> = payloads
            .into_iter()
            .map(|payload| LogEntry::new(term, payload).encode())
            .collect();
        let appended = self
            .leader_append(term, &bodies, self.state_machine.is_some())
            .await?;
        let _waiters = Waiters {
            inner: self,
            first: appended.first,
            last: appended.last,
            term,
        };
        self.replicate_all();

        let mut commits = self.commit_tx.subscribe();
        commits
            .wait_for(|commit| *commit >= appended.last)
            .await
            .map_err(|_| RaftError::Closed)?;
        // the index may have been committed with another leader's entry
        if term_at(&self.log, appended.last).await? != Some(term) {
            return Err(RaftError::LeaderChanged);
        }

        let mut results = Vec::with_capacity(appended.results.len());
        for rx in appended.results {
            results.push(rx.await.map_err(|_| RaftError::LeaderChanged)?);
        }
        Ok(AppendOutcome {
            seq: appended.first,
            results,
        })
    }

    /// leader path of a read, bounded by `read_timeout`
    pub(crate) async fn leader_read(self: &Arc<Self>, term: Term, cmd: &[u8]) -> Result<Vec<u8>> {
        let state_machine = self.state_machine.clone().ok_or(RaftError::NoStateMachine)?;
        let after = self.config.read_timeout;
        let read = async {
            self.wait_established(term).await?;
            let commit = self.state().commit;
            self.confirm_leadership(term).await?;
            let mut applied = self.applied_tx.subscribe();
            applied
                .wait_for(|applied| *applied >= commit)
                .await
                .map_err(|_| RaftError::Closed)?;
            state_machine.read(cmd).await
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(RaftError::Closed),
            result = tokio::time::timeout(after, read) => {
                result.unwrap_or(Err(RaftError::Timeout { op: "read", after }))
            }
        }
    }

    /// wait until this leader has committed an entry of its own term
    async fn wait_established(&self, term: Term) -> Result<()> {
        let mut commits = self.commit_tx.subscribe();
        loop {
            {
                let st = self.state();
                if !st.is_leader_in(term) {
                    return Err(RaftError::NotLeader);
                }
                if st.established {
                    return Ok(());
                }
            }
            tokio::select! {
                changed = commits.changed() => changed.map_err(|_| RaftError::Closed)?,
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
            }
        }
    }

    pub(crate) async fn handle_propose(self: &Arc<Self>, term: Term, entries: Vec<Vec<u8>>) -> RaftMessage {
        let current = match self.check_forwarded(term) {
            Ok(current) => current,
            Err(reply) => return reply,
        };
        if entries.is_empty() {
            return RaftMessage::from_error(current, &LogError::EmptyBatch.into());
        }
        match self.submit(current, entries).await {
            Ok(outcome) => RaftMessage::Ack {
                term: current,
                seq: outcome.seq,
                results: outcome.results,
            },
            Err(e) => RaftMessage::from_error(current, &e),
        }
    }

    pub(crate) async fn handle_read(self: &Arc<Self>, term: Term, cmd: Vec<u8>) -> RaftMessage {
        let current = match self.check_forwarded(term) {
            Ok(current) => current,
            Err(reply) => return reply,
        };
        match self.leader_read(current, &cmd).await {
            Ok(result) => {
                let applied = self.state().applied;
                RaftMessage::Ack {
                    term: current,
                    seq: applied,
                    results: vec![result],
                }
            }
            Err(e) => RaftMessage::from_error(current, &e),
        }
    }

    /// the leader's term if this node may serve a forwarded call
    fn check_forwarded(&self, term: Term) -> std::result::Result<Term, RaftMessage> {
        if term > self.state().term {
            self.step_down(term);
        }
        let st = self.state();
        if st.role == NodeState::Leader {
            Ok(st.term)
        } else {
            Err(RaftMessage::from_error(st.term, &RaftError::NotLeader))
        }
    }
}
