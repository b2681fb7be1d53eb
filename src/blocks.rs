//! Block-metadata sink fed by the WRITE_* / DELETE_BLOCK change events.
//!
//! The payloads are opaque to the replica; this store only keys them,
//! maintains the canonical-number index, and tracks the latest block for
//! which both header and body have arrived.

use std::sync::Arc;

use tracing::debug;

use crate::error::{ArchiveError, Result};
use crate::kv::{KeyValueStore, WriteBatch};
use crate::types::Hash;

/// Capability contract the applier routes block events through.
pub trait BlockWriter: Send + Sync {
    fn write_body(&self, hash: &Hash, number: u64, data: &[u8]) -> Result<()>;
    fn write_header(&self, hash: &Hash, number: u64, data: &[u8]) -> Result<()>;
    fn write_td(&self, hash: &Hash, number: u64, data: &[u8]) -> Result<()>;
    fn write_receipts(&self, hash: &Hash, number: u64, data: &[u8]) -> Result<()>;
    fn delete_block(&self, hash: &Hash, number: u64) -> Result<()>;
}

const HEADER_PREFIX: &[u8] = b"bh";
const BODY_PREFIX: &[u8] = b"bb";
const TD_PREFIX: &[u8] = b"bt";
const RECEIPTS_PREFIX: &[u8] = b"bq";
const CANONICAL_PREFIX: &[u8] = b"bn";
const HEAD_BLOCK_KEY: &[u8] = b"LastBlock";

fn block_key(prefix: &[u8], number: u64, hash: &Hash) -> Vec<u8> {
    [prefix, &number.to_be_bytes()[..], hash.as_ref()].concat()
}

fn canonical_key(number: u64) -> Vec<u8> {
    [CANONICAL_PREFIX, &number.to_be_bytes()[..]].concat()
}

/// KV-backed block store.
pub struct BlockStore {
    db: Arc<dyn KeyValueStore>,
}

impl BlockStore {
    pub fn new(db: Arc<dyn KeyValueStore>) -> Self {
        Self { db }
    }

    pub fn header(&self, hash: &Hash, number: u64) -> Result<Option<Vec<u8>>> {
        self.db.get(&block_key(HEADER_PREFIX, number, hash))
    }

    pub fn body(&self, hash: &Hash, number: u64) -> Result<Option<Vec<u8>>> {
        self.db.get(&block_key(BODY_PREFIX, number, hash))
    }

    pub fn td(&self, hash: &Hash, number: u64) -> Result<Option<Vec<u8>>> {
        self.db.get(&block_key(TD_PREFIX, number, hash))
    }

    pub fn receipts(&self, hash: &Hash, number: u64) -> Result<Option<Vec<u8>>> {
        self.db.get(&block_key(RECEIPTS_PREFIX, number, hash))
    }

    pub fn canonical_hash(&self, number: u64) -> Result<Option<Hash>> {
        match self.db.get(&canonical_key(number))? {
            Some(raw) => Ok(Some(Hash::from_slice(&raw).map_err(|_| {
                ArchiveError::Corruption(format!("canonical hash at number {number}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Latest (number, hash) for which header and body are both present.
    pub fn head_block(&self) -> Result<Option<(u64, Hash)>> {
        match self.db.get(HEAD_BLOCK_KEY)? {
            Some(raw) => {
                if raw.len() != 40 {
                    return Err(ArchiveError::Corruption("head block record".into()));
                }
                let number = u64::from_be_bytes(raw[..8].try_into().expect("length checked"));
                Ok(Some((number, Hash::from_slice(&raw[8..])?)))
            }
            None => Ok(None),
        }
    }

    /// Advance the head record once a block is complete. Out-of-order
    /// deliveries for older numbers leave the head untouched.
    fn maybe_advance_head(&self, batch: &mut WriteBatch, hash: &Hash, number: u64) -> Result<()> {
        let header_present = self.db.has(&block_key(HEADER_PREFIX, number, hash))?;
        let body_present = self.db.has(&block_key(BODY_PREFIX, number, hash))?;
        if !(header_present && body_present) {
            return Ok(());
        }
        if let Some((head_number, _)) = self.head_block()? {
            if number <= head_number {
                return Ok(());
            }
        }
        let mut record = Vec::with_capacity(40);
        record.extend(number.to_be_bytes());
        record.extend(hash.as_ref());
        batch.put(HEAD_BLOCK_KEY.to_vec(), record);
        debug!(number, hash = %hash, "advanced head block");
        Ok(())
    }

    fn write_part(&self, prefix: &[u8], hash: &Hash, number: u64, data: &[u8]) -> Result<()> {
        self.db.put(&block_key(prefix, number, hash), data)?;
        if prefix == HEADER_PREFIX || prefix == BODY_PREFIX {
            let mut batch = WriteBatch::new();
            batch.put(canonical_key(number), hash.as_ref().to_vec());
            self.maybe_advance_head(&mut batch, hash, number)?;
            self.db.write(batch)?;
        }
        Ok(())
    }
}

impl BlockWriter for BlockStore {
    fn write_body(&self, hash: &Hash, number: u64, data: &[u8]) -> Result<()> {
        self.write_part(BODY_PREFIX, hash, number, data)
    }

    fn write_header(&self, hash: &Hash, number: u64, data: &[u8]) -> Result<()> {
        self.write_part(HEADER_PREFIX, hash, number, data)
    }

    fn write_td(&self, hash: &Hash, number: u64, data: &[u8]) -> Result<()> {
        self.write_part(TD_PREFIX, hash, number, data)
    }

    fn write_receipts(&self, hash: &Hash, number: u64, data: &[u8]) -> Result<()> {
        self.write_part(RECEIPTS_PREFIX, hash, number, data)
    }

    fn delete_block(&self, hash: &Hash, number: u64) -> Result<()> {
        let mut batch = WriteBatch::new();
        for prefix in [HEADER_PREFIX, BODY_PREFIX, TD_PREFIX, RECEIPTS_PREFIX] {
            batch.delete(block_key(prefix, number, hash));
        }
        batch.delete(canonical_key(number));
        self.db.write(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn block_store() -> BlockStore {
        BlockStore::new(Arc::new(MemoryKv::new()))
    }

    #[test]
    fn head_advances_only_when_block_is_complete() {
        let store = block_store();
        let hash = Hash::digest(b"block-1");

        store.write_header(&hash, 1, b"header").unwrap();
        assert_eq!(store.head_block().unwrap(), None);

        store.write_body(&hash, 1, b"body").unwrap();
        assert_eq!(store.head_block().unwrap(), Some((1, hash)));
        assert_eq!(store.canonical_hash(1).unwrap(), Some(hash));
    }

    #[test]
    fn stale_numbers_do_not_rewind_the_head() {
        let store = block_store();
        let newer = Hash::digest(b"block-5");
        store.write_header(&newer, 5, b"header").unwrap();
        store.write_body(&newer, 5, b"body").unwrap();

        let older = Hash::digest(b"block-3");
        store.write_header(&older, 3, b"header").unwrap();
        store.write_body(&older, 3, b"body").unwrap();

        assert_eq!(store.head_block().unwrap(), Some((5, newer)));
    }

    #[test]
    fn delete_removes_every_part() {
        let store = block_store();
        let hash = Hash::digest(b"block-2");
        store.write_header(&hash, 2, b"header").unwrap();
        store.write_body(&hash, 2, b"body").unwrap();
        store.write_td(&hash, 2, b"td").unwrap();
        store.write_receipts(&hash, 2, b"receipts").unwrap();

        store.delete_block(&hash, 2).unwrap();
        assert_eq!(store.header(&hash, 2).unwrap(), None);
        assert_eq!(store.body(&hash, 2).unwrap(), None);
        assert_eq!(store.td(&hash, 2).unwrap(), None);
        assert_eq!(store.receipts(&hash, 2).unwrap(), None);
        assert_eq!(store.canonical_hash(2).unwrap(), None);
    }
}
