use std::io;

use thiserror::Error;

use crate::types::Hash;

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Error type shared by the archive store, the applier, and the transport
/// seams.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("corrupt record: {0}")]
    Corruption(String),
    #[error("malformed change event: {0}")]
    Decode(String),
    #[error("parent root {0} not available")]
    ParentMissing(Hash),
    #[error("strand {0} not available")]
    StrandMissing(Hash),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl ArchiveError {
    /// Whether retrying the same operation can succeed. Substrate I/O
    /// failures are retried without advancing the stream offset; everything
    /// else is dropped and the offset advances.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }
}

impl From<rocksdb::Error> for ArchiveError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ArchiveError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ArchiveError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Deserialization(err.to_string())
    }
}

impl From<toml::de::Error> for ArchiveError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for ArchiveError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Config(err.to_string())
    }
}
