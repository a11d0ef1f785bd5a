//! # codec
//!
//! why: keep the on-disk byte layout out of the log's control flow
//! relations: injected through LogConfig, called by log.rs, txn.rs and iter.rs
//! what: IndexEntry, the Codec trait, Crc32Codec default implementation

use crate::error::{LogError, Result};
use crate::Seq;

/// position of one record inside the body stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub seq: Seq,
    /// byte offset of the encoded body
    pub offset: u64,
    /// length of the encoded body
    pub length: u64,
}

impl IndexEntry {
    /// offset one past the last byte of this record's body
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// encodes and decodes index entries and record bodies
///
/// implementations may add checksums or encryption; the log only relies on
/// index entries having a fixed encoded size
pub trait Codec: Send + Sync + 'static {
    /// encoded size of every index entry
    fn index_entry_size(&self) -> usize;

    fn encode_index(&self, entry: &IndexEntry) -> Vec<u8>;

    fn decode_index(&self, bytes: &[u8]) -> Result<IndexEntry>;

    fn encode_body(&self, seq: Seq, body: &[u8]) -> Vec<u8>;

    fn decode_body(&self, seq: Seq, bytes: &[u8]) -> Result<Vec<u8>>;
}

// -- crc32 codec --

const CRC_LEN: usize = 4;
const INDEX_PAYLOAD_LEN: usize = 24;

/// default codec: big-endian index triples and bodies, each followed by a crc32
#[derive(Debug, Default, Clone, Copy)]
pub struct Crc32Codec;

impl Codec for Crc32Codec {
    fn index_entry_size(&self) -> usize {
        INDEX_PAYLOAD_LEN + CRC_LEN
    }

    fn encode_index(&self, entry: &IndexEntry) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.index_entry_size());
        buf.extend_from_slice(&entry.seq.to_be_bytes());
        buf.extend_from_slice(&entry.offset.to_be_bytes());
        buf.extend_from_slice(&entry.length.to_be_bytes());
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode_index(&self, bytes: &[u8]) -> Result<IndexEntry> {
        if bytes.len() != self.index_entry_size() {
            return Err(LogError::corrupt(
                "index entry",
                format!("expected {} bytes, got {}", self.index_entry_size(), bytes.len()),
            ));
        }
        let (payload, crc) = bytes.split_at(INDEX_PAYLOAD_LEN);
        if crc32fast::hash(payload).to_be_bytes() != crc {
            return Err(LogError::corrupt("index entry", "checksum mismatch"));
        }
        Ok(IndexEntry {
            seq: i64::from_be_bytes(be8(&payload[0..8])),
            offset: u64::from_be_bytes(be8(&payload[8..16])),
            length: u64::from_be_bytes(be8(&payload[16..24])),
        })
    }

    fn encode_body(&self, _seq: Seq, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(body.len() + CRC_LEN);
        buf.extend_from_slice(body);
        buf.extend_from_slice(&crc32fast::hash(body).to_be_bytes());
        buf
    }

    fn decode_body(&self, seq: Seq, bytes: &[u8]) -> Result<Vec<u8>> {
        if bytes.len() < CRC_LEN {
            return Err(LogError::corrupt(
                format!("body {seq}"),
                format!("{} bytes is shorter than the checksum", bytes.len()),
            ));
        }
        let (body, crc) = bytes.split_at(bytes.len() - CRC_LEN);
        if crc32fast::hash(body).to_be_bytes() != crc {
            return Err(LogError::corrupt(format!("body {seq}"), "checksum mismatch"));
        }
        Ok(body.to_vec())
    }
}

fn be8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes);
    out
}
