//! # log
//!
//! why: expose the durable log's public contract over the raw streams
//! relations: owns streams.rs; hands out txn.rs transactions and iter.rs iterators
//! what: Log handle, shared state, committed view, iterator cursor registry

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use tokio::sync::Mutex;

use crate::config::LogConfig;
use crate::error::{LogError, Result};
use crate::iter::LogIter;
use crate::streams::Streams;
use crate::txn::{Txn, TxnLock};
use crate::{Record, Seq};

/// committed, in-memory view of the log
#[derive(Debug, Clone)]
pub(crate) struct View {
    pub open: bool,
    pub closing: bool,
    pub seq: Seq,
    pub head: Option<Record>,
}

impl Default for View {
    fn default() -> Self {
        Self {
            open: false,
            closing: false,
            seq: -1,
            head: None,
        }
    }
}

/// shared bookkeeping between one iterator and the log that feeds it
#[derive(Debug)]
pub(crate) struct Cursor {
    bound: AtomicI64,
    position: AtomicI64,
    closed: AtomicBool,
}

impl Cursor {
    fn new(start: Seq, bound: Seq) -> Self {
        Self {
            bound: AtomicI64::new(bound),
            position: AtomicI64::new(start),
            closed: AtomicBool::new(false),
        }
    }

    pub fn bound(&self) -> Seq {
        self.bound.load(Ordering::Acquire)
    }

    pub fn set_position(&self, seq: Seq) {
        self.position.store(seq, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// records after `seq` are gone: close if the next record is among them,
    /// otherwise stop at `seq`
    fn truncated(&self, seq: Seq) {
        if seq < self.position.load(Ordering::Acquire) {
            self.close();
        } else {
            self.bound.fetch_min(seq, Ordering::AcqRel);
        }
    }
}

/// state shared by the log handle, its transactions and its iterators
pub(crate) struct Shared {
    pub config: LogConfig,
    /// positioned i/o must not interleave; always taken after `writer`
    pub streams: Mutex<Option<Streams>>,
    /// exclusive write lock; tokio's mutex queues waiters in fifo order
    pub writer: Arc<Mutex<()>>,
    opening: Mutex<()>,
    view: StdMutex<View>,
    cursors: StdMutex<Vec<Weak<Cursor>>>,
}

impl Shared {
    pub fn view(&self) -> MutexGuard<'_, View> {
        self.view.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cursors(&self) -> MutexGuard<'_, Vec<Weak<Cursor>>> {
        self.cursors.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ensure_accepting(&self) -> Result<()> {
        let view = self.view();
        if view.closing {
            Err(LogError::Closing)
        } else if !view.open {
            Err(LogError::Closed)
        } else {
            Ok(())
        }
    }

    /// publish a committed tail
    pub fn publish(&self, seq: Seq, head: Option<Record>) {
        let mut view = self.view();
        view.seq = seq;
        view.head = head;
    }

    /// publish a truncation and stop every iterator that would read past it
    pub fn publish_trim(&self, seq: Seq, head: Option<Record>) {
        let mut view = self.view();
        if view.seq > seq {
            view.seq = seq;
            view.head = head;
        }
        let mut cursors = self.cursors();
        cursors.retain(|weak| match weak.upgrade() {
            Some(cursor) => {
                cursor.truncated(seq);
                true
            }
            None => false,
        });
    }

    fn register(&self, start: Seq) -> Arc<Cursor> {
        let view = self.view();
        let cursor = Arc::new(Cursor::new(start, view.seq));
        if start > view.seq {
            cursor.close();
        }
        let mut cursors = self.cursors();
        cursors.retain(|weak| weak.strong_count() > 0);
        cursors.push(Arc::downgrade(&cursor));
        cursor
    }

    fn close_cursors(&self) {
        for cursor in self.cursors().drain(..).filter_map(|weak| weak.upgrade()) {
            cursor.close();
        }
    }

    /// rebuild the view from disk after an abandoned write
    ///
    /// truncates back to the lock record, exactly like crash recovery
    pub async fn rollback(&self) -> Result<()> {
        let codec = self.config.codec.clone();
        let mut guard = self.streams.lock().await;
        let streams = guard.as_mut().ok_or(LogError::Closed)?;
        streams.sync().await?;
        let lock = streams.recover(codec.as_ref()).await?;
        let (seq, head) = streams.load_head(codec.as_ref()).await?;
        drop(guard);

        if let Some(lock) = lock {
            tracing::debug!(lock, seq, "rolled back transaction");
        }
        let previous = self.view().seq;
        if seq < previous {
            self.publish_trim(seq, head);
        } else {
            self.publish(seq, head);
        }
        Ok(())
    }
}

/// append-only, sequence-numbered, transactional, crash-recoverable record store
///
/// cloning yields another handle to the same log
#[derive(Clone)]
pub struct Log {
    shared: Arc<Shared>,
}

impl Log {
    pub fn new(config: LogConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                streams: Mutex::new(None),
                writer: Arc::new(Mutex::new(())),
                opening: Mutex::new(()),
                view: StdMutex::new(View::default()),
                cursors: StdMutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &LogConfig {
        &self.shared.config
    }

    /// recover from any crash, then open storage and load the tail
    ///
    /// idempotent; concurrent callers queue behind the first open
    pub async fn open(&self) -> Result<()> {
        let _opening = self.shared.opening.lock().await;
        if self.shared.view().open {
            return Ok(());
        }

        let codec = self.shared.config.codec.clone();
        let mut streams = Streams::open(&self.shared.config).await?;
        streams.recover(codec.as_ref()).await?;
        let (seq, head) = streams.load_head(codec.as_ref()).await?;
        *self.shared.streams.lock().await = Some(streams);

        *self.shared.view() = View {
            open: true,
            closing: false,
            seq,
            head,
        };
        tracing::info!(name = %self.shared.config.name, seq, "log opened");
        Ok(())
    }

    /// wait for the in-flight transaction, then release storage
    ///
    /// idempotent
    pub async fn close(&self) -> Result<()> {
        let _opening = self.shared.opening.lock().await;
        {
            let mut view = self.shared.view();
            if !view.open {
                return Ok(());
            }
            view.closing = true;
        }

        let _writer = self.shared.writer.clone().lock_owned().await;
        let mut streams = self.shared.streams.lock().await;
        self.shared.close_cursors();
        streams.take();
        drop(streams);
        *self.shared.view() = View::default();
        tracing::info!(name = %self.shared.config.name, "log closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.shared.view().open
    }

    /// last committed sequence number, -1 when empty or closed
    pub fn seq(&self) -> Seq {
        self.shared.view().seq
    }

    /// last committed record
    pub fn head(&self) -> Option<Record> {
        self.shared.view().head.clone()
    }

    /// take the exclusive write lock
    pub async fn txn(&self, lock: TxnLock) -> Result<Txn> {
        self.shared.ensure_accepting()?;
        let guard = self.shared.writer.clone().lock_owned().await;
        self.shared.ensure_accepting()?;
        Txn::begin(self.shared.clone(), guard, lock).await
    }

    /// append one record; `seq`, if given, must be the next sequence number
    pub async fn append(&self, body: &[u8], seq: Option<Seq>) -> Result<Seq> {
        self.append_batch(&[body], seq).await
    }

    /// append records atomically, returning the first assigned sequence number
    pub async fn append_batch<B>(&self, bodies: &[B], seq: Option<Seq>) -> Result<Seq>
    where
        B: AsRef<[u8]> + Sync,
    {
        if bodies.is_empty() {
            return Err(LogError::EmptyBatch);
        }
        let mut txn = self.txn(TxnLock::None).await?;
        if let Some(actual) = seq {
            let expected = txn.seq() + 1;
            if actual != expected {
                txn.abort().await?;
                return Err(LogError::Sequence { expected, actual });
            }
        }

        match txn.append_batch(bodies).await {
            Ok(first) => {
                txn.commit().await?;
                Ok(first)
            }
            Err(e) => {
                if let Err(abort) = txn.abort().await {
                    tracing::warn!(error = %abort, "abort after failed append also failed");
                }
                Err(e)
            }
        }
    }

    /// discard every record after `seq`; -1 empties the log
    ///
    /// fail-forward: on error the log is consistent but may be trimmed
    /// further than its previous state, never restored
    pub async fn trim(&self, seq: Seq) -> Result<()> {
        if seq < -1 {
            return Err(LogError::InvalidSeq(seq));
        }
        let mut txn = self.txn(TxnLock::None).await?;
        if seq >= txn.seq() {
            txn.commit().await?;
            return Ok(());
        }
        match txn.trim(seq).await {
            Ok(()) => {
                txn.commit().await?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = txn.abort().await {
                    tracing::warn!(error = %abort, "abort after failed trim also failed");
                }
                Err(e)
            }
        }
    }

    /// lazy iterator over `[seq, current seq]` as of now
    pub fn iter(&self, seq: Seq) -> Result<LogIter> {
        if seq < 0 {
            return Err(LogError::InvalidSeq(seq));
        }
        if !self.is_open() {
            return Err(LogError::Closed);
        }
        let cursor = self.shared.register(seq);
        Ok(LogIter::new(self.shared.clone(), cursor, seq))
    }

    /// read a single committed record
    pub async fn get(&self, seq: Seq) -> Result<Option<Record>> {
        if seq < 0 || seq > self.seq() {
            return Ok(None);
        }
        let codec = self.shared.config.codec.clone();
        let mut guard = self.shared.streams.lock().await;
        let streams = guard.as_mut().ok_or(LogError::Closed)?;
        // a trim may have landed while we waited for the streams
        if seq > self.seq() {
            return Ok(None);
        }
        streams.read_record(codec.as_ref(), seq).await.map(Some)
    }

    /// remove all on-disk state; the log must be closed
    pub async fn del(&self) -> Result<()> {
        let _opening = self.shared.opening.lock().await;
        if self.shared.view().open {
            return Err(LogError::Open);
        }
        let config = &self.shared.config;
        for path in [config.body_path(), config.index_path(), config.lock_path()] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let view = self.shared.view();
        f.debug_struct("Log")
            .field("name", &self.shared.config.name)
            .field("open", &view.open)
            .field("seq", &view.seq)
            .finish()
    }
}
