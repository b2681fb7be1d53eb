use std::sync::Arc;

use super::keys;
use super::store::ArchiveStore;
use crate::error::{ArchiveError, Result};
use crate::types::{Account, Hash};

/// Read handle bound to one committed state root.
#[derive(Clone)]
pub struct ArchiveLayer {
    store: Arc<ArchiveStore>,
    root: Hash,
}

impl ArchiveLayer {
    /// Bind to `root`, returning `None` if the root was never committed.
    pub fn new(store: Arc<ArchiveStore>, root: Hash) -> Result<Option<Self>> {
        if !store.has_root(&root)? {
            return Ok(None);
        }
        Ok(Some(Self { store, root }))
    }

    pub fn root(&self) -> Hash {
        self.root
    }

    /// Raw account blob as emitted by the authoritative writer.
    pub fn account_rlp(&self, account: &Hash) -> Result<Option<Vec<u8>>> {
        self.store.lookup(&self.root, &keys::account_key(account))
    }

    pub fn account(&self, account: &Hash) -> Result<Option<Account>> {
        match self.account_rlp(account)? {
            Some(raw) if raw.is_empty() => Ok(None),
            Some(raw) => Ok(Some(Account::decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Storage slot value, honoring the account's destruct marker: versions
    /// written before the recorded destruction head are invisible, while
    /// writes from the destructing root onward (recreation) resolve
    /// normally.
    pub fn storage(&self, account: &Hash, slot: &Hash) -> Result<Option<Vec<u8>>> {
        let destruct_head = match self.store.lookup(&self.root, &keys::destruct_key(account))? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
                    ArchiveError::Corruption(format!("destruct marker for account {account}"))
                })?;
                u64::from_be_bytes(bytes)
            }
            None => 0,
        };
        let Some(root) = self.store.root_record(&self.root)? else {
            return Ok(None);
        };
        self.store.lookup_in_strand(
            &root.strand,
            &keys::slot_key(account, slot),
            root.index,
            destruct_head,
        )
    }
}
