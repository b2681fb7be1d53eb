//! Reassembles the granular change feed into atomic per-root updates.
//!
//! SU_* fragments accumulate in a bounded pending map keyed by root;
//! SU_DONE flushes the assembled update and the stream offset in one batch.
//! Duplicate commits are suppressed by a two-generation set of recently
//! applied roots, which bounds dedup memory across the write horizon.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::archive::{ArchiveStore, StateUpdate};
use crate::blocks::BlockWriter;
use crate::cdc::{self, OffsetRecord, Operation};
use crate::error::Result;
use crate::types::Hash;

/// Fragments of one root's update collected so far.
#[derive(Debug, Default)]
struct PartialUpdate {
    parent: Option<Hash>,
    update: StateUpdate,
}

/// Serial consumer of one topic's change events.
pub struct OpProcessor {
    archive: Arc<ArchiveStore>,
    blocks: Arc<dyn BlockWriter>,
    pending: HashMap<Hash, PartialUpdate>,
    arrival: VecDeque<Hash>,
    recent: HashSet<Hash>,
    older: HashSet<Hash>,
    dedup_capacity: usize,
    pending_capacity: usize,
}

impl OpProcessor {
    pub fn new(
        archive: Arc<ArchiveStore>,
        blocks: Arc<dyn BlockWriter>,
        dedup_capacity: usize,
        pending_capacity: usize,
    ) -> Self {
        Self {
            archive,
            blocks,
            pending: HashMap::new(),
            arrival: VecDeque::new(),
            recent: HashSet::new(),
            older: HashSet::new(),
            dedup_capacity: dedup_capacity.max(1),
            pending_capacity: pending_capacity.max(1),
        }
    }

    /// Number of roots currently being reassembled.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Apply one event. Fragment events only mutate in-memory state;
    /// SU_DONE and block events touch the substrate. Errors returned here
    /// are transient substrate failures — everything unrecoverable is logged
    /// and dropped with the offset advanced, so a poison event can never
    /// wedge the stream.
    pub fn apply(&mut self, op: &Operation) -> Result<()> {
        match op.op {
            cdc::OP_SU_PARENT => {
                let root = op.hash_at(0)?;
                let parent = op.hash_at(32)?;
                if let Some(partial) = self.fragment_slot(root) {
                    partial.parent = Some(parent);
                    partial.update.parent = parent;
                }
                Ok(())
            }
            cdc::OP_SU_DESTRUCT => {
                let root = op.hash_at(0)?;
                let account = op.hash_at(32)?;
                if let Some(partial) = self.fragment_slot(root) {
                    partial.update.destructs.insert(account);
                }
                Ok(())
            }
            cdc::OP_SU_ACCOUNT => {
                let root = op.hash_at(0)?;
                let account = op.hash_at(32)?;
                let data = op.tail(64)?.to_vec();
                if let Some(partial) = self.fragment_slot(root) {
                    partial.update.accounts.insert(account, data);
                }
                Ok(())
            }
            cdc::OP_SU_STORAGE => {
                let root = op.hash_at(0)?;
                let account = op.hash_at(32)?;
                let slot = op.hash_at(64)?;
                let value = op.tail(96)?.to_vec();
                if let Some(partial) = self.fragment_slot(root) {
                    partial
                        .update
                        .storage
                        .entry(account)
                        .or_default()
                        .insert(slot, value);
                }
                Ok(())
            }
            cdc::OP_SU_DONE => self.commit(op),
            cdc::OP_WRITE_BODY => self.block_write(op, |blocks, hash, number, data| {
                blocks.write_body(hash, number, data)
            }),
            cdc::OP_WRITE_HEADER => self.block_write(op, |blocks, hash, number, data| {
                blocks.write_header(hash, number, data)
            }),
            cdc::OP_WRITE_RECEIPTS => self.block_write(op, |blocks, hash, number, data| {
                blocks.write_receipts(hash, number, data)
            }),
            cdc::OP_WRITE_TD => self.block_write(op, |blocks, hash, number, data| {
                blocks.write_td(hash, number, data)
            }),
            cdc::OP_DELETE_BLOCK => self.block_write(op, |blocks, hash, number, _| {
                blocks.delete_block(hash, number)
            }),
            other => {
                warn!(op = other, offset = op.offset, "unknown change event tag, skipping");
                self.advance_offset(op)
            }
        }
    }

    /// Pending slot for `root`, creating it unless the root was already
    /// committed (fragments arriving after their SU_DONE are dropped).
    fn fragment_slot(&mut self, root: Hash) -> Option<&mut PartialUpdate> {
        if self.recent.contains(&root) || self.older.contains(&root) {
            return None;
        }
        if !self.pending.contains_key(&root) {
            while self.pending.len() >= self.pending_capacity {
                match self.arrival.pop_front() {
                    Some(oldest) => {
                        if self.pending.remove(&oldest).is_some() {
                            warn!(root = %oldest, "pending update cap reached, dropping oldest partial update");
                        }
                    }
                    None => break,
                }
            }
            let mut partial = PartialUpdate::default();
            partial.update.root = root;
            self.pending.insert(root, partial);
            self.arrival.push_back(root);
        }
        self.pending.get_mut(&root)
    }

    fn commit(&mut self, op: &Operation) -> Result<()> {
        let root = op.hash_at(0)?;
        if self.recent.contains(&root) || self.older.contains(&root) {
            // Already written; don't do it again.
            return self.advance_offset(op);
        }
        let complete = match self.pending.get(&root) {
            Some(partial) => partial.parent.is_some(),
            None => false,
        };
        if !complete {
            warn!(root = %root, offset = op.offset, "commit marker for incomplete update, dropping");
            return self.advance_offset(op);
        }
        let partial = self.pending.remove(&root).expect("checked above");

        let offset = OffsetRecord::now(&op.topic, op.offset);
        if let Err(err) = self
            .archive
            .update_with_offset(&partial.update, Some(&offset))
        {
            if err.is_transient() {
                // Put the update back so the retried event finds it intact;
                // its arrival entry is still in place.
                self.pending.insert(root, partial);
                return Err(err);
            }
            self.forget_arrival(&root);
            warn!(root = %root, offset = op.offset, %err, "state update cannot be applied, dropping");
            return self.advance_offset(op);
        }

        self.forget_arrival(&root);
        debug!(root = %root, offset = op.offset, "applied state update");
        self.remember(root);
        Ok(())
    }

    /// Drop `root`'s arrival entry once it has left `pending` for good, so
    /// the eviction queue tracks only live partial updates.
    fn forget_arrival(&mut self, root: &Hash) {
        self.arrival.retain(|entry| entry != root);
    }

    fn block_write<F>(&mut self, op: &Operation, write: F) -> Result<()>
    where
        F: FnOnce(&dyn BlockWriter, &Hash, u64, &[u8]) -> Result<()>,
    {
        let hash = op.hash_at(0)?;
        let number = op.number_at(32)?;
        let data = op.tail(40)?;
        write(self.blocks.as_ref(), &hash, number, data)?;
        self.advance_offset(op)
    }

    /// Persist the offset for events that did not go through an update
    /// batch (block writes, drops, duplicates).
    fn advance_offset(&self, op: &Operation) -> Result<()> {
        cdc::persist_offset(self.archive.db().as_ref(), &op.topic, op.offset)
    }

    fn remember(&mut self, root: Hash) {
        self.recent.insert(root);
        if self.recent.len() > self.dedup_capacity {
            self.older = std::mem::take(&mut self.recent);
        }
    }
}
