use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::keys;
use super::records::{self, KeyVersion, RootRecord, StrandRecord, UNBOUNDED};
use crate::cdc::OffsetRecord;
use crate::error::{ArchiveError, Result};
use crate::kv::{KeyValueStore, WriteBatch};
use crate::types::{Hash, EMPTY_ROOT};

/// A fully assembled per-root state update, as reassembled from the change
/// feed or produced directly by tests.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub root: Hash,
    pub parent: Hash,
    pub destructs: BTreeSet<Hash>,
    pub accounts: BTreeMap<Hash, Vec<u8>>,
    pub storage: BTreeMap<Hash, BTreeMap<Hash, Vec<u8>>>,
}

impl StateUpdate {
    pub fn new(root: Hash, parent: Hash) -> Self {
        Self {
            root,
            parent,
            ..Self::default()
        }
    }

    pub fn destruct(mut self, account: Hash) -> Self {
        self.destructs.insert(account);
        self
    }

    pub fn account(mut self, account: Hash, data: impl Into<Vec<u8>>) -> Self {
        self.accounts.insert(account, data.into());
        self
    }

    pub fn storage(mut self, account: Hash, slot: Hash, value: impl Into<Vec<u8>>) -> Self {
        self.storage
            .entry(account)
            .or_default()
            .insert(slot, value.into());
        self
    }
}

/// Read-through cache over immutable substrate entries. Value blobs are
/// content-addressed and root records never change after commit, so cached
/// copies can never go stale. Mutable records (strands, counters, versions)
/// are deliberately not cached.
struct ReadCache {
    inner: Mutex<LruCache<Vec<u8>, Vec<u8>>>,
}

impl ReadCache {
    fn new(capacity: usize) -> Option<Self> {
        NonZeroUsize::new(capacity).map(|size| Self {
            inner: Mutex::new(LruCache::new(size)),
        })
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.lock().get(key).cloned()
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        self.inner.lock().put(key, value);
    }
}

/// The versioned archive index over the flat substrate.
///
/// Writers hold the shared side of the lock: each `update` commits through a
/// single atomic batch and content-addressed writes are idempotent, so
/// concurrent updates cannot corrupt one another. The exclusive side is
/// reserved for administrative operations.
pub struct ArchiveStore {
    db: Arc<dyn KeyValueStore>,
    cache: Option<ReadCache>,
    lock: RwLock<()>,
}

impl ArchiveStore {
    pub fn new(db: Arc<dyn KeyValueStore>, cache_size: usize) -> Self {
        Self {
            db,
            cache: ReadCache::new(cache_size),
            lock: RwLock::new(()),
        }
    }

    pub fn db(&self) -> &Arc<dyn KeyValueStore> {
        &self.db
    }

    /// Apply a complete state update for `update.root`. Applying the same
    /// root twice is a no-op; the whole mutation set commits in one batch,
    /// so readers observe either all of the root or none of it.
    pub fn update(&self, update: &StateUpdate) -> Result<()> {
        self.update_with_offset(update, None)
    }

    /// As [`update`](Self::update), folding the stream offset record into
    /// the same atomic batch. A duplicate root still persists the offset so
    /// a restarted replica does not reprocess the event.
    pub fn update_with_offset(
        &self,
        update: &StateUpdate,
        offset: Option<&OffsetRecord>,
    ) -> Result<()> {
        let _guard = self.lock.read();

        if self.db.has(&keys::root_key(&update.root))? {
            if let Some(record) = offset {
                self.db.put(&record.key(), &record.encode())?;
            }
            return Ok(());
        }

        let (strand_id, mut strand) = self.resolve_strand(update)?;
        strand.head += 1;

        let mut batch = WriteBatch::new();
        let destruct_head = strand.head.to_be_bytes();
        for account in &update.destructs {
            self.add_key(
                &mut batch,
                &strand_id,
                strand.head,
                &keys::destruct_key(account),
                &destruct_head,
            )?;
        }
        for (account, data) in &update.accounts {
            self.add_key(
                &mut batch,
                &strand_id,
                strand.head,
                &keys::account_key(account),
                data,
            )?;
        }
        for (account, slots) in &update.storage {
            for (slot, value) in slots {
                self.add_key(
                    &mut batch,
                    &strand_id,
                    strand.head,
                    &keys::slot_key(account, slot),
                    value,
                )?;
            }
        }

        let root = RootRecord {
            strand: strand_id,
            parent_root: update.parent,
            index: strand.head,
        };
        batch.put(keys::strand_key(&strand_id), records::encode(&strand)?);
        batch.put(keys::root_key(&update.root), records::encode(&root)?);
        if let Some(record) = offset {
            batch.put(record.key(), record.encode());
        }
        self.db.write(batch)?;

        debug!(root = %update.root, strand = %strand_id, head = strand.head, "committed state update");
        Ok(())
    }

    /// Value of `key` as of `root`, walking the strand tree. `Ok(None)` is
    /// the distinguished "not found"; errors are substrate or integrity
    /// failures.
    pub fn lookup(&self, root: &Hash, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(record) = self.root_record(root)? else {
            return Ok(None);
        };
        self.lookup_in_strand(&record.strand, key, record.index, 0)
    }

    pub fn has_root(&self, root: &Hash) -> Result<bool> {
        self.db.has(&keys::root_key(root))
    }

    /// Search one strand (and, when unbounded, its ancestors) for the
    /// version of `key` current at `target`.
    ///
    /// The binary search probes the latest version first and uses the
    /// strand's full count as its initial bound; the containment test
    /// against `[lo, hi)` keeps old-root lookups correct. A non-zero
    /// `min_head` marks a destruction bound: versions below it are
    /// invisible, and the parent strand is not consulted.
    pub(crate) fn lookup_in_strand(
        &self,
        strand: &Hash,
        key: &[u8],
        target: u64,
        min_head: u64,
    ) -> Result<Option<Vec<u8>>> {
        let mut strand_id = *strand;
        let mut target = target;
        let mut min_head = min_head;

        loop {
            let count = self.state_count(&strand_id, key)?;
            if count > 0 {
                let mut low = 0u64;
                let mut high = count;
                let mut n = count - 1;
                loop {
                    let version = self.key_version(&strand_id, key, n)?.ok_or_else(|| {
                        ArchiveError::Corruption(format!(
                            "missing key version {n} of {count} in strand {strand_id}"
                        ))
                    })?;
                    if version.contains(target) {
                        if version.lo < min_head {
                            // Written before the account was destructed.
                            return Ok(None);
                        }
                        let value = self.value_blob(&version.value)?.ok_or_else(|| {
                            ArchiveError::Corruption(format!(
                                "dangling value blob {}",
                                version.value
                            ))
                        })?;
                        return Ok(Some(value));
                    }
                    if target < version.lo {
                        high = n;
                    } else {
                        low = n + 1;
                    }
                    if low >= high {
                        break;
                    }
                    n = (low + high) / 2;
                }
            }

            // The key has no version at `target` in this strand.
            if min_head > 0 {
                // The destruction bound does not extend across strands;
                // anything older is invisible.
                return Ok(None);
            }
            let record = self
                .strand_record(&strand_id)?
                .ok_or(ArchiveError::StrandMissing(strand_id))?;
            match record.parent_strand {
                Some(parent) => {
                    target = record.base_index;
                    min_head = 0;
                    strand_id = parent;
                }
                None => return Ok(None),
            }
        }
    }

    /// Apply the fork rule: extend the parent's strand when the parent is
    /// still its tip, otherwise start a child strand identified by
    /// `H(parent ‖ root)`. The empty sentinel starts a fresh strand whose
    /// identity is the root itself.
    fn resolve_strand(&self, update: &StateUpdate) -> Result<(Hash, StrandRecord)> {
        if update.parent == EMPTY_ROOT {
            return Ok((
                update.root,
                StrandRecord {
                    head: 0,
                    parent_strand: None,
                    base_index: 0,
                },
            ));
        }
        let parent = self
            .root_record(&update.parent)?
            .ok_or(ArchiveError::ParentMissing(update.parent))?;
        let strand = self
            .strand_record(&parent.strand)?
            .ok_or(ArchiveError::StrandMissing(parent.strand))?;
        if strand.head > parent.index {
            // The strand has moved past the parent root: fork.
            Ok((
                Hash::digest_pair(&update.parent, &update.root),
                StrandRecord {
                    head: 0,
                    parent_strand: Some(parent.strand),
                    base_index: parent.index,
                },
            ))
        } else {
            Ok((parent.strand, strand))
        }
    }

    /// Append a new version of `inner` at `head`, closing the previous
    /// version's window. Reads go to committed state; all writes stage into
    /// `batch`.
    fn add_key(
        &self,
        batch: &mut WriteBatch,
        strand: &Hash,
        head: u64,
        inner: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let count = self.state_count(strand, inner)?;
        if count > 0 {
            let mut previous = self.key_version(strand, inner, count - 1)?.ok_or_else(|| {
                ArchiveError::Corruption(format!(
                    "missing latest key version {} in strand {strand}",
                    count - 1
                ))
            })?;
            previous.hi = head;
            batch.put(
                keys::version_key(strand, inner, count - 1),
                records::encode(&previous)?,
            );
        }
        let version = KeyVersion {
            lo: head,
            hi: UNBOUNDED,
            value: Hash::digest(value),
        };
        batch.put(
            keys::version_key(strand, inner, count),
            records::encode(&version)?,
        );
        batch.put(keys::value_key(&version.value), value.to_vec());
        batch.put(
            keys::counter_key(strand, inner),
            (count + 1).to_be_bytes().to_vec(),
        );
        Ok(())
    }

    pub fn root_record(&self, root: &Hash) -> Result<Option<RootRecord>> {
        let key = keys::root_key(root);
        if let Some(cache) = &self.cache {
            if let Some(raw) = cache.get(&key) {
                return Ok(Some(records::decode(&raw)?));
            }
        }
        match self.db.get(&key)? {
            Some(raw) => {
                let record = records::decode(&raw)
                    .map_err(|_| ArchiveError::Corruption(format!("root record {root}")))?;
                if let Some(cache) = &self.cache {
                    cache.put(key, raw);
                }
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn strand_record(&self, strand: &Hash) -> Result<Option<StrandRecord>> {
        match self.db.get(&keys::strand_key(strand))? {
            Some(raw) => Ok(Some(records::decode(&raw).map_err(|_| {
                ArchiveError::Corruption(format!("strand record {strand}"))
            })?)),
            None => Ok(None),
        }
    }

    fn state_count(&self, strand: &Hash, inner: &[u8]) -> Result<u64> {
        match self.db.get(&keys::counter_key(strand, inner))? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
                    ArchiveError::Corruption(format!("state counter in strand {strand}"))
                })?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    fn key_version(&self, strand: &Hash, inner: &[u8], ordinal: u64) -> Result<Option<KeyVersion>> {
        match self.db.get(&keys::version_key(strand, inner, ordinal))? {
            Some(raw) => Ok(Some(records::decode(&raw).map_err(|_| {
                ArchiveError::Corruption(format!("key version {ordinal} in strand {strand}"))
            })?)),
            None => Ok(None),
        }
    }

    fn value_blob(&self, content: &Hash) -> Result<Option<Vec<u8>>> {
        let key = keys::value_key(content);
        if let Some(cache) = &self.cache {
            if let Some(value) = cache.get(&key) {
                return Ok(Some(value));
            }
        }
        match self.db.get(&key)? {
            Some(value) => {
                if let Some(cache) = &self.cache {
                    cache.put(key, value.clone());
                }
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}
