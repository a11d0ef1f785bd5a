//! # apply
//!
//! why: feed committed entries to the state machine exactly once, in order
//! relations: extends NodeInner; woken by replication.rs commits, answers client.rs waiters
//! what: commit publication, single-flight apply loop, applied watermark

use std::sync::Arc;

use raft_storage::LogError;
use tracing::{debug, error};

use crate::error::Result;
use crate::event::NodeEvent;
use crate::log::LogEntry;
use crate::node::NodeInner;
use crate::Seq;

impl NodeInner {
    pub(crate) fn publish_commit(self: &Arc<Self>, commit: Seq) {
        self.commit_tx.send_replace(commit);
        debug!(node = self.id(), seq = commit, "commit advanced");
        self.emit(NodeEvent::Commit(commit));
        self.schedule_apply();
    }

    fn schedule_apply(self: &Arc<Self>) {
        let inner = self.clone();
        self.tasks.spawn(async move { inner.apply_committed().await });
    }

    async fn apply_committed(self: Arc<Self>) {
        let _flight = self.apply_lock.lock().await;
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            let (applied, commit) = {
                let st = self.state();
                (st.applied, st.commit)
            };
            if applied >= commit {
                return;
            }
            if let Err(e) = self.apply_from(applied + 1, commit).await {
                if self.shutdown.is_cancelled() {
                    return;
                }
                if let Err(resync) = self.resync_tail() {
                    self.fail(resync);
                }
                error!(node = self.id(), seq = applied + 1, error = %e, "apply failed");
                self.fail(e);
                return;
            }
        }
    }

    /// apply one batch starting at `start`, never past `commit`
    async fn apply_from(&self, start: Seq, commit: Seq) -> Result<()> {
        let Some(state_machine) = self.state_machine.clone() else {
            self.mark_applied(commit);
            return Ok(());
        };
        let end = commit.min(start + self.config.max_apply_batch as Seq - 1);

        let mut terms = Vec::new();
        let mut payloads = Vec::new();
        let mut iter = self.log.iter(start)?;
        while let Some(record) = iter.next().await? {
            if record.seq > end {
                break;
            }
            let entry = LogEntry::decode(&record.body)?;
            terms.push(entry.term);
            payloads.push(entry.payload);
        }
        iter.close();
        if payloads.len() as Seq != end - start + 1 {
            return Err(LogError::corrupt(
                "log",
                format!("committed index {end} is missing"),
            )
            .into());
        }

        let mut results = state_machine.apply(&payloads, start).await?.into_iter();
        {
            let mut slots = self.results();
            for (seq, term) in (start..).zip(terms) {
                let result = results.next().unwrap_or_default();
                // a slot from another term belongs to a truncated entry
                if let Some(slot) = slots.remove(&seq) {
                    if slot.term == term {
                        let _ = slot.reply.send(result);
                    }
                }
            }
        }
        self.mark_applied(end);
        Ok(())
    }

    fn mark_applied(&self, seq: Seq) {
        {
            let mut st = self.state();
            if seq <= st.applied {
                return;
            }
            st.applied = seq;
        }
        self.applied_tx.send_replace(seq);
        debug!(node = self.id(), seq, "applied");
        self.emit(NodeEvent::Apply(seq));
    }
}
