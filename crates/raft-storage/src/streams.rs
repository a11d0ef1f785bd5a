//! # streams
//!
//! why: own the three on-disk streams (body, index, lock) and their raw i/o
//! relations: held by log.rs behind a mutex; driven by txn.rs and iter.rs
//! what: Streams handle, lock record encoding, truncation and crash recovery

use std::io::SeekFrom;
use std::path::Path;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::codec::{Codec, IndexEntry};
use crate::config::LogConfig;
use crate::error::{LogError, Result};
use crate::{Record, Seq};

/// encoded lock record: big-endian seq followed by its crc32
const LOCK_LEN: u64 = 12;

/// open handles to one log's storage
#[derive(Debug)]
pub(crate) struct Streams {
    body: File,
    index: File,
    lock: File,
    body_len: u64,
    index_len: u64,
}

impl Streams {
    /// open or create all three streams, syncing anything newly created
    pub async fn open(config: &LogConfig) -> Result<Self> {
        fs::create_dir_all(config.dir()).await?;

        let (body, body_created) = open_stream(&config.body_path()).await?;
        let (index, index_created) = open_stream(&config.index_path()).await?;
        let (lock, lock_created) = open_stream(&config.lock_path()).await?;
        if body_created || index_created || lock_created {
            sync_dir(config.dir()).await?;
        }

        let body_len = body.metadata().await?.len();
        let index_len = index.metadata().await?.len();
        Ok(Self {
            body,
            index,
            lock,
            body_len,
            index_len,
        })
    }

    /// number of complete index entries
    pub fn entry_count(&self, codec: &dyn Codec) -> u64 {
        self.index_len / codec.index_entry_size() as u64
    }

    // -- lock record --

    /// read the lock record; a torn or unreadable record counts as absent
    pub async fn read_lock(&mut self) -> Result<Option<Seq>> {
        let len = self.lock.metadata().await?.len();
        if len == 0 {
            return Ok(None);
        }
        if len != LOCK_LEN {
            tracing::warn!(len, "ignoring torn lock record");
            return Ok(None);
        }
        let bytes = read_at(&mut self.lock, 0, LOCK_LEN as usize).await?;
        let (seq, crc) = bytes.split_at(8);
        if crc32fast::hash(seq).to_be_bytes() != crc {
            tracing::warn!("ignoring lock record with bad checksum");
            return Ok(None);
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(seq);
        Ok(Some(i64::from_be_bytes(raw)))
    }

    pub async fn write_lock(&mut self, seq: Seq) -> Result<()> {
        let mut buf = seq.to_be_bytes().to_vec();
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        write_at(&mut self.lock, 0, &buf).await?;
        self.lock.set_len(LOCK_LEN).await?;
        self.lock.sync_all().await?;
        Ok(())
    }

    pub async fn clear_lock(&mut self) -> Result<()> {
        self.lock.set_len(0).await?;
        self.lock.sync_all().await?;
        Ok(())
    }

    // -- reads --

    /// read `count` consecutive index entries starting at `first`
    pub async fn read_index(
        &mut self,
        codec: &dyn Codec,
        first: Seq,
        count: u64,
    ) -> Result<Vec<IndexEntry>> {
        let size = codec.index_entry_size();
        let start = first as u64 * size as u64;
        let bytes = read_at(&mut self.index, start, count as usize * size).await?;

        let mut entries = Vec::with_capacity(count as usize);
        for (i, chunk) in bytes.chunks_exact(size).enumerate() {
            let entry = codec.decode_index(chunk)?;
            let expected = first + i as Seq;
            if entry.seq != expected {
                return Err(LogError::corrupt(
                    "index",
                    format!("entry {expected} describes seq {}", entry.seq),
                ));
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// read the bodies described by consecutive index entries in one read
    pub async fn read_records(
        &mut self,
        codec: &dyn Codec,
        entries: &[IndexEntry],
    ) -> Result<Vec<Record>> {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(Vec::new());
        };
        let base = first.offset;
        let bytes = read_at(&mut self.body, base, (last.end() - base) as usize).await?;

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let start = (entry.offset - base) as usize;
            let end = start + entry.length as usize;
            let raw = bytes.get(start..end).ok_or_else(|| {
                LogError::corrupt(format!("body {}", entry.seq), "index range outside read")
            })?;
            records.push(Record {
                seq: entry.seq,
                offset: entry.offset,
                length: entry.length,
                body: codec.decode_body(entry.seq, raw)?,
            });
        }
        Ok(records)
    }

    pub async fn read_record(&mut self, codec: &dyn Codec, seq: Seq) -> Result<Record> {
        let entries = self.read_index(codec, seq, 1).await?;
        let mut records = self.read_records(codec, &entries).await?;
        records
            .pop()
            .ok_or_else(|| LogError::corrupt(format!("body {seq}"), "missing"))
    }

    /// last sequence number and its record, or (-1, None) when empty
    pub async fn load_head(&mut self, codec: &dyn Codec) -> Result<(Seq, Option<Record>)> {
        let count = self.entry_count(codec);
        if count == 0 {
            return Ok((-1, None));
        }
        let seq = count as Seq - 1;
        let head = self.read_record(codec, seq).await?;
        Ok((seq, Some(head)))
    }

    // -- writes --

    /// write pre-encoded bodies and index entries for records starting at `first`
    ///
    /// both streams are written contiguously, then synced concurrently
    pub async fn append(
        &mut self,
        codec: &dyn Codec,
        first: Seq,
        bodies: &[u8],
        index: &[u8],
    ) -> Result<()> {
        let index_at = first as u64 * codec.index_entry_size() as u64;
        write_at(&mut self.body, self.body_len, bodies).await?;
        write_at(&mut self.index, index_at, index).await?;
        tokio::try_join!(self.body.sync_all(), self.index.sync_all())?;

        self.body_len += bodies.len() as u64;
        self.index_len = index_at + index.len() as u64;
        Ok(())
    }

    pub fn body_len(&self) -> u64 {
        self.body_len
    }

    /// sync body and index together
    pub async fn sync(&self) -> Result<()> {
        tokio::try_join!(self.body.sync_all(), self.index.sync_all())?;
        Ok(())
    }

    /// drop every record after `seq`; index first so it never points past the body
    pub async fn truncate_to(&mut self, codec: &dyn Codec, seq: Seq) -> Result<()> {
        let body_end = if seq >= 0 {
            self.read_index(codec, seq, 1).await?[0].end()
        } else {
            0
        };
        let index_end = (seq + 1) as u64 * codec.index_entry_size() as u64;

        self.index.set_len(index_end).await?;
        self.body.set_len(body_end).await?;
        self.sync().await?;

        self.index_len = index_end;
        self.body_len = body_end;
        Ok(())
    }

    /// undo any write interrupted before its lock was cleared
    ///
    /// returns the lock value that was found, if any
    pub async fn recover(&mut self, codec: &dyn Codec) -> Result<Option<Seq>> {
        let size = codec.index_entry_size() as u64;
        let lock = self.read_lock().await?;

        if let Some(seq) = lock {
            let count = self.entry_count(codec);
            if seq < -1 {
                return Err(LogError::corrupt("lock", format!("invalid value {seq}")));
            }
            if ((seq + 1) as u64) <= count {
                tracing::info!(seq, entries = count, "rolling back interrupted write");
                self.truncate_to(codec, seq).await?;
            } else {
                tracing::warn!(seq, entries = count, "lock record is ahead of the index");
            }
        }

        if self.index_len % size != 0 {
            let whole = self.index_len - self.index_len % size;
            tracing::warn!(len = self.index_len, keep = whole, "cutting partial index entry");
            self.index.set_len(whole).await?;
            self.index.sync_all().await?;
            self.index_len = whole;
        }

        let count = self.entry_count(codec);
        let end = if count > 0 {
            self.read_index(codec, count as Seq - 1, 1).await?[0].end()
        } else {
            0
        };
        if self.body_len > end {
            tracing::warn!(len = self.body_len, keep = end, "cutting unindexed body tail");
            self.body.set_len(end).await?;
            self.body.sync_all().await?;
            self.body_len = end;
        } else if self.body_len < end {
            return Err(LogError::corrupt(
                "body",
                format!("index expects {end} bytes, stream has {}", self.body_len),
            ));
        }

        if lock.is_some() {
            self.clear_lock().await?;
        }
        Ok(lock)
    }
}

async fn open_stream(path: &Path) -> Result<(File, bool)> {
    let existed = fs::try_exists(path).await?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .await?;
    if !existed {
        file.sync_all().await?;
    }
    Ok((file, !existed))
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

async fn read_at(file: &mut File, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(offset)).await?;
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_at(file: &mut File, offset: u64, bytes: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}
