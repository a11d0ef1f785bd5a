//! # iter
//!
//! why: read ranges of the log lazily without holding the write lock
//! relations: created by log.rs; reads through streams.rs; closed by trims and close
//! what: LogIter bounded forward cursor, Stream adapter

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, Stream};

use crate::error::Result;
use crate::log::{Cursor, Shared};
use crate::{Record, Seq};

/// bounded, forward-only iterator over a snapshot of the log
///
/// the upper bound is the log's sequence number when the iterator was
/// created. index entries are fetched `step` at a time and their bodies in
/// one covering read. once closed, `next` keeps returning `Ok(None)`; an
/// i/o or corruption error is returned exactly once and closes it
pub struct LogIter {
    shared: Arc<Shared>,
    cursor: Arc<Cursor>,
    /// next sequence number to fetch from storage
    fetch_at: Seq,
    buffer: VecDeque<Record>,
}

impl LogIter {
    pub(crate) fn new(shared: Arc<Shared>, cursor: Arc<Cursor>, start: Seq) -> Self {
        Self {
            shared,
            cursor,
            fetch_at: start,
            buffer: VecDeque::new(),
        }
    }

    /// inclusive upper bound; it only ever drops (when the log is trimmed)
    pub fn bound(&self) -> Seq {
        self.cursor.bound()
    }

    pub fn is_closed(&self) -> bool {
        self.cursor.is_closed()
    }

    /// stop the iterator; abandoning it without calling this is also fine
    pub fn close(&mut self) {
        self.cursor.close();
        self.buffer.clear();
    }

    pub async fn next(&mut self) -> Result<Option<Record>> {
        loop {
            if self.cursor.is_closed() {
                self.buffer.clear();
                return Ok(None);
            }
            let bound = self.cursor.bound();
            if let Some(record) = self.buffer.pop_front() {
                if record.seq > bound {
                    self.close();
                    return Ok(None);
                }
                self.cursor.set_position(record.seq + 1);
                return Ok(Some(record));
            }
            if self.fetch_at > bound {
                self.close();
                return Ok(None);
            }
            if let Err(e) = self.fetch().await {
                self.close();
                return Err(e);
            }
        }
    }

    /// collect everything that is left
    pub async fn collect_bodies(mut self) -> Result<Vec<Vec<u8>>> {
        let mut bodies = Vec::new();
        while let Some(record) = self.next().await? {
            bodies.push(record.body);
        }
        Ok(bodies)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Record>> + Send {
        stream::unfold(self, |mut iter| async move {
            match iter.next().await {
                Ok(Some(record)) => Some((Ok(record), iter)),
                Ok(None) => None,
                Err(e) => Some((Err(e), iter)),
            }
        })
    }

    async fn fetch(&mut self) -> Result<()> {
        let codec = self.shared.config.codec.clone();
        let step = self.shared.config.step as Seq;
        let mut guard = self.shared.streams.lock().await;

        // trims and close update the cursor while holding the streams lock
        if self.cursor.is_closed() {
            return Ok(());
        }
        let bound = self.cursor.bound();
        if self.fetch_at > bound {
            return Ok(());
        }
        let Some(streams) = guard.as_mut() else {
            // the log closed underneath us
            self.cursor.close();
            return Ok(());
        };

        let count = (bound - self.fetch_at + 1).min(step);
        let entries = streams
            .read_index(codec.as_ref(), self.fetch_at, count as u64)
            .await?;
        let records = streams.read_records(codec.as_ref(), &entries).await?;
        self.fetch_at += count;
        self.buffer.extend(records);
        Ok(())
    }
}

impl std::fmt::Debug for LogIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogIter")
            .field("fetch_at", &self.fetch_at)
            .field("bound", &self.cursor.bound())
            .field("buffered", &self.buffer.len())
            .field("closed", &self.cursor.is_closed())
            .finish()
    }
}
