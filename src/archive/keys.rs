//! Encoded key layout of the versioned index.
//!
//! Outer families are distinct substrate prefixes; the `a`/`d`/account‖slot
//! namespaces apply to the inner key carried inside counter and version
//! records, so they cannot collide with substrate-level prefixes.

use crate::types::Hash;

const ROOT_PREFIX: &[u8] = b"_R";
const STRAND_PREFIX: &[u8] = b"_s";
const COUNTER_PREFIX: &[u8] = b"_c";
const VERSION_PREFIX: &[u8] = b"_r";
const VALUE_PREFIX: &[u8] = b"_v";

const ACCOUNT_NAMESPACE: &[u8] = b"a";
const DESTRUCT_NAMESPACE: &[u8] = b"d";

pub fn root_key(root: &Hash) -> Vec<u8> {
    [ROOT_PREFIX, root.as_ref()].concat()
}

pub fn strand_key(strand: &Hash) -> Vec<u8> {
    [STRAND_PREFIX, strand.as_ref()].concat()
}

pub fn counter_key(strand: &Hash, inner: &[u8]) -> Vec<u8> {
    [COUNTER_PREFIX, strand.as_ref(), inner].concat()
}

pub fn version_key(strand: &Hash, inner: &[u8], ordinal: u64) -> Vec<u8> {
    [
        VERSION_PREFIX,
        strand.as_ref(),
        inner,
        &ordinal.to_be_bytes()[..],
    ]
    .concat()
}

pub fn value_key(content: &Hash) -> Vec<u8> {
    [VALUE_PREFIX, content.as_ref()].concat()
}

/// Substrate prefix covering every value blob, for integrity sweeps.
pub fn value_prefix() -> Vec<u8> {
    VALUE_PREFIX.to_vec()
}

pub fn account_key(account: &Hash) -> Vec<u8> {
    [ACCOUNT_NAMESPACE, account.as_ref()].concat()
}

pub fn destruct_key(account: &Hash) -> Vec<u8> {
    [DESTRUCT_NAMESPACE, account.as_ref()].concat()
}

pub fn slot_key(account: &Hash, slot: &Hash) -> Vec<u8> {
    [account.as_ref(), slot.as_ref()].concat()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_do_not_collide() {
        let strand = Hash::digest(b"strand");
        let account = Hash::digest(b"account");
        let keys = [
            root_key(&account),
            strand_key(&strand),
            counter_key(&strand, &account_key(&account)),
            version_key(&strand, &account_key(&account), 0),
            value_key(&account),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn version_ordinals_sort_lexicographically() {
        let strand = Hash::digest(b"strand");
        let inner = account_key(&Hash::digest(b"account"));
        assert!(version_key(&strand, &inner, 1) < version_key(&strand, &inner, 2));
        assert!(version_key(&strand, &inner, 255) < version_key(&strand, &inner, 256));
    }
}
