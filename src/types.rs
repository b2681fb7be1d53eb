use std::fmt;

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ArchiveError, Result};

/// Opaque 32-byte identifier used for state roots, strand ids, account and
/// slot hashes, and content addresses.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Hash(pub [u8; 32]);

/// Root hash of an empty account trie, used as the parent sentinel for the
/// first root of a fresh history.
pub const EMPTY_ROOT: Hash = Hash(hex_literal(
    b"56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421",
));

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Content address of a value blob.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Identity of a strand forked at `parent` with first child `child`.
    pub fn digest_pair(parent: &Hash, child: &Hash) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(parent.0);
        hasher.update(child.0);
        Self(hasher.finalize().into())
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = data
            .try_into()
            .map_err(|_| ArchiveError::Decode(format!("expected 32 bytes, got {}", data.len())))?;
        Ok(Self(bytes))
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({self})")
    }
}

// Const so EMPTY_ROOT can live in a constant; panics on malformed input,
// which only a source-level typo can produce.
const fn hex_literal(src: &[u8; 64]) -> [u8; 32] {
    const fn nibble(c: u8) -> u8 {
        match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            _ => panic!("invalid hex digit"),
        }
    }
    let mut out = [0u8; 32];
    let mut i = 0;
    while i < 32 {
        out[i] = (nibble(src[i * 2]) << 4) | nibble(src[i * 2 + 1]);
        i += 1;
    }
    out
}

/// Flat account record as emitted by the authoritative writer. The archive
/// store itself treats account payloads as opaque bytes; this codec exists
/// for callers that want decoded fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: Hash,
    pub code_hash: Hash,
}

impl Account {
    pub const ENCODED_LEN: usize = 8 + 32 + 32 + 32;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        buf.extend(self.nonce.to_le_bytes());
        let mut balance = [0u8; 32];
        self.balance.to_big_endian(&mut balance);
        buf.extend(balance);
        buf.extend(self.storage_root.0);
        buf.extend(self.code_hash.0);
        buf
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() != Self::ENCODED_LEN {
            return Err(ArchiveError::Corruption(format!(
                "account record must be {} bytes, got {}",
                Self::ENCODED_LEN,
                raw.len()
            )));
        }
        let nonce = u64::from_le_bytes(raw[..8].try_into().expect("length checked"));
        let balance = U256::from_big_endian(&raw[8..40]);
        let storage_root = Hash::from_slice(&raw[40..72])?;
        let code_hash = Hash::from_slice(&raw[72..104])?;
        Ok(Self {
            nonce,
            balance,
            storage_root,
            code_hash,
        })
    }
}
