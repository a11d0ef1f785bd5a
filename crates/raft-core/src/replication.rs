//! # replication
//!
//! why: copy the leader's log to every follower and decide what is committed
//! relations: extends NodeInner; cursors and commit rules in state.rs; commits feed apply.rs
//! what: leader appends, per-follower append loop, follower append handling, read-index round

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use raft_storage::TxnLock;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{RaftError, Result};
use crate::log::{term_at, LogEntry};
use crate::message::{ErrorCode, RaftMessage};
use crate::node::{NodeInner, ResultSlot};
use crate::quorum::Voter;
use crate::state::NodeState;
use crate::{NodeId, Seq, Term};

/// fields of an inbound `Append`
#[derive(Debug)]
pub(crate) struct AppendRequest {
    pub term: Term,
    pub prev_term: Term,
    pub prev_index: Seq,
    pub commit_index: Seq,
    pub entries: Vec<Vec<u8>>,
}

/// entries written by the leader, with their result receivers if requested
pub(crate) struct Appended {
    pub first: Seq,
    pub last: Seq,
    pub results: Vec<oneshot::Receiver<Vec<u8>>>,
}

impl NodeInner {
    // -- leader side --

    /// append encoded entries to the leader's own log at the next index
    pub(crate) async fn leader_append(
        &self,
        term: Term,
        bodies: &[Vec<u8>],
        with_results: bool,
    ) -> Result<Appended> {
        let _serial = self.serial.lock().await;
        let next = {
            let st = self.state();
            if !st.is_leader_in(term) {
                return Err(RaftError::NotLeader);
            }
            st.last_index + 1
        };

        let first = match self.log.append_batch(bodies, Some(next)).await {
            Ok(first) => first,
            Err(e) => {
                if let Err(resync) = self.resync_tail() {
                    self.fail(resync);
                }
                return Err(e.into());
            }
        };
        let last = first + bodies.len() as Seq - 1;

        // waiters are registered before anything can commit these indexes
        let results = {
            let mut st = self.state();
            st.record_append(first, last, term);
            if with_results {
                let mut slots = self.results();
                (first..=last)
                    .map(|seq| {
                        let (reply, rx) = oneshot::channel();
                        slots.insert(seq, ResultSlot { term, reply });
                        rx
                    })
                    .collect()
            } else {
                Vec::new()
            }
        };
        debug!(node = self.id(), term, seq = first, count = bodies.len(), "appended");
        Ok(Appended { first, last, results })
    }

    /// recompute the commit index and start a round to every idle follower
    pub(crate) fn replicate_all(self: &Arc<Self>) {
        self.try_advance_commit();
        let (term, idle) = {
            let mut st = self.state();
            if st.role != NodeState::Leader {
                return;
            }
            let peers: Vec<NodeId> = st.progress.keys().copied().collect();
            let idle: Vec<NodeId> = peers
                .into_iter()
                .filter(|peer| st.inflight.insert(*peer))
                .collect();
            (st.term, idle)
        };
        for peer in idle {
            let inner = self.clone();
            self.tasks
                .spawn(async move { inner.replicate_to(peer, term).await });
        }
    }

    pub(crate) fn try_advance_commit(self: &Arc<Self>) {
        let size = self.cluster_size();
        let advanced = self.state().advance_commit(&self.quorum, size);
        if let Some(commit) = advanced {
            self.publish_commit(commit);
        }
    }

    async fn replicate_to(self: Arc<Self>, peer: NodeId, term: Term) {
        loop {
            match self.replicate_once(peer, term).await {
                Ok(true) => continue,
                Ok(false) | Err(RaftError::Closed) => break,
                Err(e) => {
                    self.warn(e);
                    break;
                }
            }
        }
        let mut st = self.state();
        if st.term == term {
            st.inflight.remove(&peer);
        }
    }

    /// one append rpc to `peer`; true when another should follow right away
    async fn replicate_once(self: &Arc<Self>, peer: NodeId, term: Term) -> Result<bool> {
        let (next, last_index, last_term, commit) = {
            let st = self.state();
            if !st.is_leader_in(term) {
                return Ok(false);
            }
            let Some(progress) = st.progress.get(&peer) else {
                return Ok(false);
            };
            (progress.next, st.last_index, st.last_term, st.commit)
        };
        let prev_index = next - 1;
        let prev_term = if prev_index == last_index {
            last_term
        } else {
            match term_at(&self.log, prev_index).await? {
                Some(prev_term) => prev_term,
                None => return Ok(false),
            }
        };

        let mut entries = Vec::new();
        if next <= last_index {
            let mut iter = self.log.iter(next)?;
            while entries.len() < self.config.max_entries_per_rpc {
                match iter.next().await? {
                    Some(record) if record.seq <= last_index => entries.push(record.body),
                    _ => break,
                }
            }
            iter.close();
        }
        let sent = entries.len();

        let request = RaftMessage::Append {
            term,
            prev_term,
            prev_index,
            commit_index: commit,
            entries,
        };
        let reply = self
            .rpc(peer, request, self.config.append_timeout, "append")
            .await?;

        match reply {
            reply if reply.term() > term => {
                self.step_down(reply.term());
                Ok(false)
            }
            RaftMessage::Ack { term: acked_in, seq, .. } if acked_in == term => {
                let more = self.update(|st| {
                    if !st.is_leader_in(term) {
                        return false;
                    }
                    st.ack(peer, seq);
                    seq < st.last_index && (seq > prev_index || last_index < st.last_index)
                });
                debug!(node = self.id(), peer, seq, sent, "append acked");
                self.try_advance_commit();
                Ok(more)
            }
            RaftMessage::Err {
                code: ErrorCode::Mismatch,
                hint,
                ..
            } => {
                debug!(node = self.id(), peer, prev_index, ?hint, "log mismatch");
                let max_scan = self.config.max_conflict_scan;
                self.update(|st| {
                    if st.is_leader_in(term) {
                        st.mismatch(peer, hint, max_scan);
                    }
                });
                Ok(true)
            }
            RaftMessage::Err {
                term, code, message, ..
            } => Err(RaftError::from_remote(term, code, message)),
            other => Err(RaftError::Malformed(format!(
                "{} reply to an append",
                other.kind()
            ))),
        }
    }

    /// read index: a quorum must still accept this node as leader of `term`
    ///
    /// the round's heartbeats bypass `inflight` and may overlap a replication
    /// rpc to the same follower. they carry no entries and their replies never
    /// move replication cursors.
    pub(crate) async fn confirm_leadership(self: &Arc<Self>, term: Term) -> Result<()> {
        let size = self.cluster_size();
        let after = self.config.read_timeout;
        let (mut acks, last_index, last_term, commit) = {
            let st = self.state();
            if !st.is_leader_in(term) {
                return Err(RaftError::NotLeader);
            }
            (vec![st.voter()], st.last_index, st.last_term, st.commit)
        };
        if self.quorum.is_satisfied(&acks, size) {
            return Ok(());
        }

        let mut round: FuturesUnordered<_> = self
            .config
            .peers()
            .map(|peer| {
                let heartbeat = RaftMessage::Append {
                    term,
                    prev_term: last_term,
                    prev_index: last_index,
                    commit_index: commit,
                    entries: Vec::new(),
                };
                async move { (peer, self.rpc(peer, heartbeat, after, "read index").await) }
            })
            .collect();

        while let Some((peer, reply)) = round.next().await {
            match reply {
                Ok(reply) if reply.term() > term => {
                    self.step_down(reply.term());
                    return Err(RaftError::NotLeader);
                }
                Ok(RaftMessage::Ack { term: seen, .. })
                | Ok(RaftMessage::Err {
                    term: seen,
                    code: ErrorCode::Mismatch,
                    ..
                }) if seen == term => {
                    let group = self.state().groups.get(&peer).cloned().flatten();
                    acks.push(Voter::new(peer, group));
                    if self.quorum.is_satisfied(&acks, size) {
                        return Ok(());
                    }
                }
                Ok(other) => debug!(node = self.id(), peer, kind = other.kind(), "read index refused"),
                Err(RaftError::Closed) => return Err(RaftError::Closed),
                Err(e) => debug!(node = self.id(), peer, error = %e, "read index unanswered"),
            }
        }
        Err(RaftError::Timeout {
            op: "read index",
            after,
        })
    }

    // -- follower side --

    pub(crate) async fn handle_append(self: &Arc<Self>, from: NodeId, request: AppendRequest) -> RaftMessage {
        let _serial = self.serial.lock().await;

        if let Err(e) = validate(&request) {
            let reply = RaftMessage::from_error(self.state().term, &e);
            self.fail(e);
            return reply;
        }
        let accepted = self.update(|st| {
            st.accept_append(from, request.term)
                .map_err(|code| (code, st.term))
        });
        if let Err((code, current)) = accepted {
            debug!(node = self.id(), peer = from, term = request.term, ?code, "append refused");
            return RaftMessage::error(current, code, format!("append in term {}", request.term));
        }

        let term = request.term;
        match self.append_entries(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                if let Err(resync) = self.resync_tail() {
                    self.fail(resync);
                }
                let reply = RaftMessage::from_error(term, &e);
                self.fail(e);
                reply
            }
        }
    }

    async fn append_entries(self: &Arc<Self>, request: &AppendRequest) -> Result<RaftMessage> {
        let (last_index, last_term, commit) = {
            let st = self.state();
            (st.last_index, st.last_term, st.commit)
        };
        let term = request.term;
        let prev_index = request.prev_index;

        if prev_index == last_index && request.prev_term == last_term {
            if !request.entries.is_empty() {
                self.log
                    .append_batch(&request.entries, Some(last_index + 1))
                    .await?;
            }
        } else {
            if prev_index > last_index {
                return Ok(mismatch(term, last_index, "log ends before prev_index"));
            }
            let local = if prev_index == last_index {
                Some(last_term)
            } else {
                term_at(&self.log, prev_index).await?
            };
            if local != Some(request.prev_term) {
                let hint = (prev_index - 1).min(last_index);
                return Ok(mismatch(term, hint, "term differs at prev_index"));
            }
            self.reconcile(request, last_index, commit).await?;
        }

        self.resync_tail()?;
        let verified = prev_index + request.entries.len() as Seq;
        let advanced = self.state().follow_commit(request.commit_index, verified);
        if let Some(commit) = advanced {
            self.publish_commit(commit);
        }
        Ok(RaftMessage::ack(term, verified))
    }

    /// overwrite the suffix that diverges from the leader in one transaction
    async fn reconcile(&self, request: &AppendRequest, last_index: Seq, commit: Seq) -> Result<()> {
        let mut same = 0;
        if !request.entries.is_empty() {
            let mut iter = self.log.iter(request.prev_index + 1)?;
            while same < request.entries.len() {
                match iter.next().await? {
                    Some(record) if record.body == request.entries[same] => same += 1,
                    _ => break,
                }
            }
            iter.close();
        }
        let rest = &request.entries[same..];
        if rest.is_empty() {
            return Ok(());
        }

        let divergence = request.prev_index + 1 + same as Seq;
        if divergence > last_index {
            self.log.append_batch(rest, Some(divergence)).await?;
            return Ok(());
        }
        if divergence <= commit {
            return Err(RaftError::Malformed(format!(
                "append rewrites committed index {divergence}"
            )));
        }

        warn!(
            node = self.id(),
            seq = divergence,
            dropped = last_index - divergence + 1,
            "truncating conflicting entries"
        );
        let mut txn = self.log.txn(TxnLock::None).await?;
        let written = match txn.trim(divergence - 1).await {
            Ok(()) => txn.append_batch(rest).await.map(|_| ()),
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => {
                txn.commit().await?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = txn.abort().await {
                    warn!(node = self.id(), error = %abort, "abort after failed overwrite also failed");
                }
                Err(e.into())
            }
        }
    }
}

fn validate(request: &AppendRequest) -> Result<()> {
    if request.prev_index < -1 || request.commit_index < -1 {
        return Err(RaftError::Malformed(format!(
            "append with prev_index {} commit_index {}",
            request.prev_index, request.commit_index
        )));
    }
    for body in &request.entries {
        let term = LogEntry::term_of(body)?;
        if term > request.term {
            return Err(RaftError::Malformed(format!(
                "entry of term {term} in an append of term {}",
                request.term
            )));
        }
    }
    Ok(())
}

fn mismatch(term: Term, hint: Seq, reason: &str) -> RaftMessage {
    RaftMessage::Err {
        term,
        code: ErrorCode::Mismatch,
        message: reason.to_string(),
        hint: Some(hint),
    }
}
