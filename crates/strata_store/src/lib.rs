//! Copy-on-write versioned file store.
//!
//! A store holds named repositories. Each repository is addressed through one
//! path namespace, `<repo>/<ref>/<file-path>`, where `<ref>` is either a
//! branch name or a commit id. Reads through a branch see the branch head
//! overlaid with the branch's open (uncommitted) writes; reads through a
//! commit id see exactly that immutable snapshot.
//!
//! This crate ships the [`Store`] contract and `MemStore`, the in-memory
//! reference engine. On-disk engines implement the same trait externally.

mod mem;
mod store;

pub use mem::MemStore;
pub use store::{CommitDelta, FileFrame, Store, StoreError, Walk};

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x00000100000001b3;

/// Stable FNV-1a 64-bit hash.
///
/// The constants are part of the wire contract: every node (in any language)
/// must agree on where a path lives, so the hash can never change.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    fnv1a64_extend(FNV_OFFSET_BASIS, bytes)
}

/// Continue an FNV-1a 64-bit hash over more bytes.
pub fn fnv1a64_extend(mut hash: u64, bytes: &[u8]) -> u64 {
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
