//! Content-defined node boundaries.
//!
//! A node boundary falls after any entry whose key hashes below the bucket
//! threshold. The decision depends only on the key bytes and the tree level,
//! so equal key sets chunk identically on every replica regardless of the
//! order mutations arrived in.

use cid::multihash::{Code, MultihashDigest};

/// Average number of entries per node.
pub(crate) const BUCKET_FACTOR: u32 = 3;

pub(crate) fn is_boundary(level: u64, key: &[u8]) -> bool {
    let mut buf = Vec::with_capacity(8 + key.len());
    buf.extend_from_slice(&level.to_le_bytes());
    buf.extend_from_slice(key);
    let digest = Code::Sha2_256.digest(&buf);
    let head = digest.digest();
    u32::from_be_bytes([head[0], head[1], head[2], head[3]]) % BUCKET_FACTOR == 0
}

/// Split `items` into chunks, closing a chunk after each boundary key.
pub(crate) fn chunk<T>(level: u64, items: Vec<T>, key_of: impl Fn(&T) -> &[u8]) -> Vec<Vec<T>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    for item in items {
        let boundary = is_boundary(level, key_of(&item));
        current.push(item);
        if boundary {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
