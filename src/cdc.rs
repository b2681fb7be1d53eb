//! Change-data-capture event model.
//!
//! Every message on the change topic is a tag byte followed by a fixed
//! layout payload. SU_* tags carry fragments of one root's state update;
//! WRITE_* and DELETE_BLOCK carry opaque block metadata for the rawdb
//! collaborator. Block numbers are little-endian; stream offsets persist as
//! zigzag varints under `cdc-log-{topic}-offset`.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ArchiveError, Result};
use crate::kv::KeyValueStore;
use crate::types::Hash;

pub const OP_SU_PARENT: u8 = 0;
pub const OP_SU_DESTRUCT: u8 = 1;
pub const OP_SU_ACCOUNT: u8 = 2;
pub const OP_SU_STORAGE: u8 = 3;
pub const OP_SU_DONE: u8 = 4;
pub const OP_WRITE_BODY: u8 = 5;
pub const OP_WRITE_HEADER: u8 = 6;
pub const OP_WRITE_RECEIPTS: u8 = 7;
pub const OP_WRITE_TD: u8 = 8;
pub const OP_DELETE_BLOCK: u8 = 9;

/// One decoded change event: tag, payload, and its position on the stream.
#[derive(Debug, Clone)]
pub struct Operation {
    pub op: u8,
    pub data: Vec<u8>,
    pub offset: i64,
    pub topic: String,
}

impl Operation {
    pub fn from_bytes(raw: &[u8], topic: &str, offset: i64) -> Result<Self> {
        if raw.is_empty() {
            return Err(ArchiveError::Decode("empty message".into()));
        }
        Ok(Self {
            op: raw[0],
            data: raw[1..].to_vec(),
            offset,
            topic: topic.to_string(),
        })
    }

    /// Wire form: tag byte followed by the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.data.len());
        out.push(self.op);
        out.extend_from_slice(&self.data);
        out
    }

    /// Extract the 32-byte hash starting at `at`, with bounds checking.
    pub fn hash_at(&self, at: usize) -> Result<Hash> {
        let end = at + 32;
        if self.data.len() < end {
            return Err(ArchiveError::Decode(format!(
                "payload of op {} truncated at byte {at}",
                self.op
            )));
        }
        Hash::from_slice(&self.data[at..end])
    }

    /// Extract the little-endian block number starting at `at`.
    pub fn number_at(&self, at: usize) -> Result<u64> {
        let end = at + 8;
        if self.data.len() < end {
            return Err(ArchiveError::Decode(format!(
                "payload of op {} truncated at byte {at}",
                self.op
            )));
        }
        Ok(u64::from_le_bytes(
            self.data[at..end].try_into().expect("length checked"),
        ))
    }

    /// Payload remainder from `at` onward.
    pub fn tail(&self, at: usize) -> Result<&[u8]> {
        if self.data.len() < at {
            return Err(ArchiveError::Decode(format!(
                "payload of op {} truncated at byte {at}",
                self.op
            )));
        }
        Ok(&self.data[at..])
    }
}

fn bare(op: u8, data: Vec<u8>) -> Operation {
    Operation {
        op,
        data,
        offset: 0,
        topic: String::new(),
    }
}

/// Fragment sequence the writer emits for one state update: parent link,
/// then every destruct, account, and storage entry, then the commit marker.
pub fn state_update_ops(
    root: &Hash,
    parent: &Hash,
    destructs: &BTreeSet<Hash>,
    accounts: &BTreeMap<Hash, Vec<u8>>,
    storage: &BTreeMap<Hash, BTreeMap<Hash, Vec<u8>>>,
) -> Vec<Operation> {
    let mut ops = vec![bare(
        OP_SU_PARENT,
        [root.as_ref(), parent.as_ref()].concat(),
    )];
    for account in destructs {
        ops.push(bare(
            OP_SU_DESTRUCT,
            [root.as_ref(), account.as_ref()].concat(),
        ));
    }
    for (account, data) in accounts {
        ops.push(bare(
            OP_SU_ACCOUNT,
            [root.as_ref(), account.as_ref(), data.as_slice()].concat(),
        ));
    }
    for (account, slots) in storage {
        for (slot, value) in slots {
            ops.push(bare(
                OP_SU_STORAGE,
                [
                    root.as_ref(),
                    account.as_ref(),
                    slot.as_ref(),
                    value.as_slice(),
                ]
                .concat(),
            ));
        }
    }
    ops.push(bare(OP_SU_DONE, root.as_ref().to_vec()));
    ops
}

fn block_op(op: u8, hash: &Hash, number: u64, data: &[u8]) -> Operation {
    bare(op, [hash.as_ref(), &number.to_le_bytes()[..], data].concat())
}

pub fn write_body(hash: &Hash, number: u64, data: &[u8]) -> Operation {
    block_op(OP_WRITE_BODY, hash, number, data)
}

pub fn write_header(hash: &Hash, number: u64, data: &[u8]) -> Operation {
    block_op(OP_WRITE_HEADER, hash, number, data)
}

pub fn write_receipts(hash: &Hash, number: u64, data: &[u8]) -> Operation {
    block_op(OP_WRITE_RECEIPTS, hash, number, data)
}

pub fn write_td(hash: &Hash, number: u64, data: &[u8]) -> Operation {
    block_op(OP_WRITE_TD, hash, number, data)
}

pub fn delete_block(hash: &Hash, number: u64) -> Operation {
    block_op(OP_DELETE_BLOCK, hash, number, &[])
}

/// Durable stream position: last applied offset plus the wall-clock second
/// it was recorded, for staleness reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetRecord {
    pub topic: String,
    pub offset: i64,
    pub timestamp: i64,
}

impl OffsetRecord {
    pub fn now(topic: &str, offset: i64) -> Self {
        Self {
            topic: topic.to_string(),
            offset,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn key(&self) -> Vec<u8> {
        offset_key(&self.topic)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20);
        put_varint(&mut out, self.offset);
        put_varint(&mut out, self.timestamp);
        out
    }

    pub fn decode(topic: &str, raw: &[u8]) -> Result<Self> {
        let (offset, read) = take_varint(raw)?;
        let (timestamp, _) = take_varint(&raw[read..])?;
        Ok(Self {
            topic: topic.to_string(),
            offset,
            timestamp,
        })
    }
}

pub fn offset_key(topic: &str) -> Vec<u8> {
    format!("cdc-log-{topic}-offset").into_bytes()
}

/// Last applied stream position for `topic`, if any update was ever applied.
pub fn read_offset(db: &dyn KeyValueStore, topic: &str) -> Result<Option<OffsetRecord>> {
    match db.get(&offset_key(topic))? {
        Some(raw) => Ok(Some(OffsetRecord::decode(topic, &raw)?)),
        None => Ok(None),
    }
}

/// Durably record `offset` as the last consumed position for `topic`.
/// Offset 0 is a real stream position and is recorded like any other; the
/// absence of the record is what marks a never-consumed topic.
pub fn persist_offset(db: &dyn KeyValueStore, topic: &str, offset: i64) -> Result<()> {
    let record = OffsetRecord::now(topic, offset);
    db.put(&record.key(), &record.encode())
}

// Zigzag varints, compatible with the writer's signed-varint encoding.

fn put_varint(out: &mut Vec<u8>, value: i64) {
    let mut encoded = ((value << 1) ^ (value >> 63)) as u64;
    while encoded >= 0x80 {
        out.push((encoded as u8) | 0x80);
        encoded >>= 7;
    }
    out.push(encoded as u8);
}

fn take_varint(raw: &[u8]) -> Result<(i64, usize)> {
    let mut value: u64 = 0;
    for (i, byte) in raw.iter().enumerate() {
        if i >= 10 {
            break;
        }
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            let decoded = ((value >> 1) as i64) ^ -((value & 1) as i64);
            return Ok((decoded, i + 1));
        }
    }
    Err(ArchiveError::Decode("truncated varint".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip() {
        for value in [0i64, 1, -1, 10, 63, 64, -65, 300, i64::MAX, i64::MIN] {
            let mut buf = Vec::new();
            put_varint(&mut buf, value);
            let (decoded, read) = take_varint(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(read, buf.len());
        }
    }

    #[test]
    fn varint_known_vectors() {
        // Zigzag: 10 -> 20 -> single byte 0x14.
        let mut buf = Vec::new();
        put_varint(&mut buf, 10);
        assert_eq!(buf, vec![0x14]);

        let mut buf = Vec::new();
        put_varint(&mut buf, -3);
        assert_eq!(buf, vec![0x05]);
    }

    #[test]
    fn offset_zero_is_a_recordable_position() {
        let db = crate::kv::MemoryKv::new();
        assert!(read_offset(&db, "chain").unwrap().is_none());

        persist_offset(&db, "chain", 0).unwrap();
        let record = read_offset(&db, "chain").unwrap().unwrap();
        assert_eq!(record.offset, 0);
    }

    #[test]
    fn offset_record_roundtrip() {
        let record = OffsetRecord {
            topic: "chain".into(),
            offset: 1234,
            timestamp: 1_700_000_000,
        };
        assert_eq!(record.key(), b"cdc-log-chain-offset".to_vec());
        let decoded = OffsetRecord::decode("chain", &record.encode()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn operation_wire_roundtrip() {
        let root = Hash::digest(b"root");
        let parent = Hash::digest(b"parent");
        let op = bare(OP_SU_PARENT, [root.as_ref(), parent.as_ref()].concat());
        let decoded = Operation::from_bytes(&op.to_bytes(), "chain", 42).unwrap();
        assert_eq!(decoded.op, OP_SU_PARENT);
        assert_eq!(decoded.hash_at(0).unwrap(), root);
        assert_eq!(decoded.hash_at(32).unwrap(), parent);
        assert_eq!(decoded.offset, 42);
    }

    #[test]
    fn truncated_payload_is_a_decode_error() {
        let op = bare(OP_SU_ACCOUNT, vec![0u8; 40]);
        assert!(op.hash_at(32).is_err());
        assert!(Operation::from_bytes(&[], "chain", 0).is_err());
    }

    #[test]
    fn state_update_ops_bracket_fragments() {
        let root = Hash::digest(b"root");
        let parent = Hash::digest(b"parent");
        let mut accounts = BTreeMap::new();
        accounts.insert(Hash::digest(b"acct"), b"data".to_vec());
        let ops = state_update_ops(&root, &parent, &BTreeSet::new(), &accounts, &BTreeMap::new());

        assert_eq!(ops.first().unwrap().op, OP_SU_PARENT);
        assert_eq!(ops.last().unwrap().op, OP_SU_DONE);
        assert_eq!(ops.len(), 3);
    }
}
