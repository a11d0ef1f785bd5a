//! # txn
//!
//! why: make every mutation of the log exclusive and crash-atomic
//! relations: created by log.rs, writes through streams.rs
//! what: Txn handle, TxnLock mode, commit/abort protocol

use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;

use crate::codec::IndexEntry;
use crate::error::{LogError, Result};
use crate::log::Shared;
use crate::{Record, Seq};

/// how a transaction records its rollback point on acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnLock {
    /// lock at the current sequence number (the append path)
    Current,
    /// write no lock record until the first mutation
    None,
    /// lock at an explicit sequence number (the truncation path)
    At(Seq),
}

/// exclusive unit of work against a log
///
/// appends and trims are durable as they happen, but only `commit` clears
/// the lock record; `abort` (or a crash) rolls storage back to the lock
pub struct Txn {
    shared: Arc<Shared>,
    guard: Option<OwnedMutexGuard<()>>,
    /// value currently stored in the lock record
    lock: Option<Seq>,
    seq: Seq,
    head: Option<Record>,
    finished: bool,
}

impl Txn {
    pub(crate) async fn begin(
        shared: Arc<Shared>,
        guard: OwnedMutexGuard<()>,
        mode: TxnLock,
    ) -> Result<Self> {
        let (seq, head) = {
            let view = shared.view();
            (view.seq, view.head.clone())
        };
        let mut txn = Self {
            shared,
            guard: Some(guard),
            lock: None,
            seq,
            head,
            finished: false,
        };
        match mode {
            TxnLock::Current => txn.write_lock(seq).await?,
            TxnLock::At(at) => txn.write_lock(at).await?,
            TxnLock::None => {}
        }
        Ok(txn)
    }

    /// tail sequence number including this transaction's appends
    pub fn seq(&self) -> Seq {
        self.seq
    }

    /// tail record including this transaction's appends
    pub fn head(&self) -> Option<&Record> {
        self.head.as_ref()
    }

    pub async fn append(&mut self, body: &[u8]) -> Result<Seq> {
        self.append_batch(&[body]).await
    }

    /// append records with consecutive sequence numbers, returning the first
    pub async fn append_batch<B>(&mut self, bodies: &[B]) -> Result<Seq>
    where
        B: AsRef<[u8]> + Sync,
    {
        self.ensure_live()?;
        if bodies.is_empty() {
            return Err(LogError::EmptyBatch);
        }
        if self.lock.is_none() {
            self.write_lock(self.seq).await?;
        }

        let codec = self.shared.config.codec.clone();
        let mut guard = self.shared.streams.lock().await;
        let streams = guard.as_mut().ok_or(LogError::Closed)?;

        let first = self.seq + 1;
        let mut offset = streams.body_len();
        let mut body_buf = Vec::new();
        let mut index_buf = Vec::with_capacity(bodies.len() * codec.index_entry_size());
        let mut last = None;
        for (i, body) in bodies.iter().enumerate() {
            let body = body.as_ref();
            let seq = first + i as Seq;
            let encoded = codec.encode_body(seq, body);
            let entry = IndexEntry {
                seq,
                offset,
                length: encoded.len() as u64,
            };
            index_buf.extend_from_slice(&codec.encode_index(&entry));
            body_buf.extend_from_slice(&encoded);
            offset = entry.end();
            last = Some(Record {
                seq,
                offset: entry.offset,
                length: entry.length,
                body: body.to_vec(),
            });
        }

        streams
            .append(codec.as_ref(), first, &body_buf, &index_buf)
            .await?;
        self.seq = first + bodies.len() as Seq - 1;
        self.head = last;
        Ok(first)
    }

    /// rewrite the lock record
    pub async fn lock(&mut self, seq: Seq) -> Result<()> {
        self.ensure_live()?;
        self.write_lock(seq).await
    }

    /// discard every record after `seq`
    ///
    /// the lock is lowered to `seq` first, so a crash finishes the trim
    /// rather than undoing it
    pub async fn trim(&mut self, seq: Seq) -> Result<()> {
        self.ensure_live()?;
        if seq < -1 {
            return Err(LogError::InvalidSeq(seq));
        }
        if seq >= self.seq {
            return Ok(());
        }
        if self.lock.map_or(true, |lock| lock > seq) {
            self.write_lock(seq).await?;
        }

        let codec = self.shared.config.codec.clone();
        let head = {
            let mut guard = self.shared.streams.lock().await;
            let streams = guard.as_mut().ok_or(LogError::Closed)?;
            streams.truncate_to(codec.as_ref(), seq).await?;
            let head = if seq >= 0 {
                Some(streams.read_record(codec.as_ref(), seq).await?)
            } else {
                None
            };
            self.shared.publish_trim(seq, head.clone());
            head
        };
        self.seq = seq;
        self.head = head;

        tracing::debug!(seq, "log trimmed");
        self.shared.config.hooks.post_truncate(seq).await
    }

    /// make everything durable, run the pre-commit hook, clear the lock
    ///
    /// a failed commit rolls the log back before returning the error
    pub async fn commit(&mut self) -> Result<Seq> {
        self.ensure_live()?;
        self.finished = true;
        match self.finish_commit().await {
            Ok(()) => {
                self.guard.take();
                Ok(self.seq)
            }
            Err(e) => {
                if let Err(rollback) = self.shared.rollback().await {
                    tracing::warn!(error = %rollback, "rollback after failed commit also failed");
                }
                self.guard.take();
                Err(e)
            }
        }
    }

    /// roll storage back to the lock record and rebuild the view from disk
    pub async fn abort(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.finished = true;
        let result = if self.lock.is_some() {
            self.shared.rollback().await
        } else {
            Ok(())
        };
        self.guard.take();
        result
    }

    async fn finish_commit(&mut self) -> Result<()> {
        if self.lock.is_none() {
            return Ok(());
        }
        {
            let guard = self.shared.streams.lock().await;
            let streams = guard.as_ref().ok_or(LogError::Closed)?;
            streams.sync().await?;
        }
        self.shared.config.hooks.pre_commit(self.seq).await?;
        {
            let mut guard = self.shared.streams.lock().await;
            let streams = guard.as_mut().ok_or(LogError::Closed)?;
            streams.clear_lock().await?;
        }
        self.lock = None;
        self.shared.publish(self.seq, self.head.clone());
        Ok(())
    }

    async fn write_lock(&mut self, seq: Seq) -> Result<()> {
        if seq < -1 {
            return Err(LogError::InvalidSeq(seq));
        }
        let mut guard = self.shared.streams.lock().await;
        let streams = guard.as_mut().ok_or(LogError::Closed)?;
        streams.write_lock(seq).await?;
        self.lock = Some(seq);
        Ok(())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.finished {
            Err(LogError::TxnFinished)
        } else {
            Ok(())
        }
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(guard) = self.guard.take() else {
            return;
        };
        if self.lock.is_none() {
            return;
        }
        let shared = self.shared.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _guard = guard;
                    if let Err(e) = shared.rollback().await {
                        tracing::warn!(error = %e, "rollback of dropped transaction failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!("transaction dropped outside a runtime; next open will recover it");
            }
        }
    }
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("lock", &self.lock)
            .field("seq", &self.seq)
            .field("finished", &self.finished)
            .finish()
    }
}
