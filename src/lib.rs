//! # stranddb
//!
//! Versioned archive state store for read-only chain replicas.
//!
//! An authoritative writer emits an ordered log of granular mutation events;
//! a replica reassembles them into atomic per-root updates against a
//! content-addressed, multi-version index kept in a flat key-value store.
//! History is modelled as a tree of *strands* — linear runs of state roots —
//! so that "what was the value of key K at root R?" resolves with a binary
//! search over per-key version windows, falling back through parent strands.
//!
//! ```ignore
//! use std::sync::Arc;
//! use stranddb::{ArchiveStore, RocksKv, StateUpdate, EMPTY_ROOT};
//!
//! let db = Arc::new(RocksKv::open("./replica/archive")?);
//! let archive = Arc::new(ArchiveStore::new(db, 4096));
//! archive.update(&StateUpdate::new(root, EMPTY_ROOT).account(account, blob))?;
//! let layer = stranddb::ArchiveLayer::new(archive, root)?.unwrap();
//! let value = layer.storage(&account, &slot)?;
//! ```

pub mod applier;
pub mod archive;
pub mod blocks;
pub mod cdc;
pub mod config;
pub mod error;
pub mod kv;
pub mod logging;
pub mod replica;
pub mod transport;
pub mod types;

pub use applier::OpProcessor;
pub use archive::{ArchiveLayer, ArchiveStore, StateUpdate};
pub use blocks::{BlockStore, BlockWriter};
pub use config::ReplicaConfig;
pub use error::{ArchiveError, Result};
pub use kv::{KeyValueStore, MemoryKv, RocksKv, WriteBatch};
pub use replica::Replica;
pub use transport::{
    mock_log_pair, ChangeLogConsumer, LogMessage, MockLogProducer, MockTransactionProducer,
    TransactionProducer,
};
pub use types::{Account, Hash, EMPTY_ROOT};
