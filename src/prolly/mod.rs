//! A prolly tree: an immutable, balanced search tree with content-defined
//! node boundaries, persisted as content-addressed blocks.
//!
//! Keys are opaque byte strings compared lexicographically; values are
//! arbitrary ipld. Because node boundaries depend only on the key set, equal
//! key sets produce equal root cids no matter what order mutations were
//! applied in, which is what lets replicas compare materialisations by root.
//!
//! All mutating operations return a new [`Tree`] plus the blocks that back
//! it; callers insert the blocks into their store (inserts are idempotent,
//! and unchanged subtrees re-encode to the cids already present).

mod chunker;
mod node;

use std::collections::BTreeMap;
use std::ops::Bound;

use cid::Cid;
use libipld::Ipld;
use tracing::trace;

use crate::error::Result;
use crate::store::{Block, BlockStore};

use self::node::{BranchEntry, LeafEntry, Node};

/// One entry of a bulk update.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkEntry {
    Put { key: Vec<u8>, value: Ipld },
    Del { key: Vec<u8> },
}

impl BulkEntry {
    pub fn put(key: impl Into<Vec<u8>>, value: Ipld) -> Self {
        BulkEntry::Put {
            key: key.into(),
            value,
        }
    }

    pub fn del(key: impl Into<Vec<u8>>) -> Self {
        BulkEntry::Del { key: key.into() }
    }
}

/// An immutable ordered map rooted at a single block.
#[derive(Debug, Clone)]
pub struct Tree<S> {
    store: S,
    root: Cid,
}

impl<S: BlockStore> Tree<S> {
    /// Open an existing tree by root cid.
    pub async fn load(store: S, root: Cid) -> Result<Self> {
        // decode eagerly so a bad root surfaces here, not mid-query
        let block = store.get(&root).await?;
        Node::decode(&root, block.data())?;
        Ok(Self { store, root })
    }

    /// Build a fresh tree from a batch. Blocks are emitted bottom-up; the
    /// last block is the root.
    pub async fn create(store: S, batch: Vec<BulkEntry>) -> Result<(Self, Vec<Block>)> {
        let mut entries = BTreeMap::new();
        apply(&mut entries, batch);
        let (root, blocks) = build(entries)?;
        Ok((Self { store, root }, blocks))
    }

    pub fn root(&self) -> &Cid {
        &self.root
    }

    async fn node(&self, cid: &Cid) -> Result<Node> {
        let block = self.store.get(cid).await?;
        Node::decode(cid, block.data())
    }

    /// Apply a batch of puts and deletes, producing a new tree.
    ///
    /// Entries apply in order, so a later entry for the same key wins.
    /// Equal batches applied to equal trees yield equal roots.
    pub async fn bulk(&self, batch: Vec<BulkEntry>) -> Result<(Self, Vec<Block>)> {
        let mut entries: BTreeMap<Vec<u8>, Ipld> = self.all().await?;
        apply(&mut entries, batch);
        let (root, blocks) = build(entries)?;
        trace!(old = %self.root, new = %root, blocks = blocks.len(), "bulk update");
        Ok((
            Self {
                store: self.store.clone(),
                root,
            },
            blocks,
        ))
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Ipld>> {
        let mut cid = self.root;
        loop {
            match self.node(&cid).await? {
                Node::Leaf(entries) => {
                    return Ok(entries
                        .binary_search_by(|e| e.key.as_slice().cmp(key))
                        .ok()
                        .map(|i| entries[i].value.clone()));
                }
                Node::Branch { entries, .. } => {
                    let idx = entries.partition_point(|e| e.key.as_slice() <= key);
                    if idx == 0 {
                        return Ok(None);
                    }
                    cid = entries[idx - 1].link;
                }
            }
        }
    }

    /// Look up many keys, preserving input order and skipping misses.
    pub async fn get_many(&self, keys: &[Vec<u8>]) -> Result<Vec<Ipld>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                out.push(value);
            }
        }
        Ok(out)
    }

    /// All entries with `lo <= key <= hi` (per the given bounds), in key
    /// order.
    pub async fn range(
        &self,
        lo: Bound<Vec<u8>>,
        hi: Bound<Vec<u8>>,
    ) -> Result<Vec<(Vec<u8>, Ipld)>> {
        let mut out = Vec::new();
        // depth-first, children pushed in reverse so entries pop in order
        let mut stack = vec![self.root];
        while let Some(cid) = stack.pop() {
            match self.node(&cid).await? {
                Node::Leaf(entries) => {
                    for e in entries {
                        if above_lower(&e.key, &lo) && below_upper(&e.key, &hi) {
                            out.push((e.key, e.value));
                        }
                    }
                }
                Node::Branch { entries, .. } => {
                    for (i, e) in entries.iter().enumerate().rev() {
                        // child i covers [key_i, key_{i+1})
                        if !below_upper(&e.key, &hi) {
                            continue;
                        }
                        if let Some(next) = entries.get(i + 1) {
                            if let Bound::Included(b) | Bound::Excluded(b) = &lo {
                                if next.key.as_slice() <= b.as_slice() {
                                    continue;
                                }
                            }
                        }
                        stack.push(e.link);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Full scan in key order.
    pub async fn all(&self) -> Result<BTreeMap<Vec<u8>, Ipld>> {
        let entries = self.range(Bound::Unbounded, Bound::Unbounded).await?;
        Ok(entries.into_iter().collect())
    }
}

fn apply(entries: &mut BTreeMap<Vec<u8>, Ipld>, batch: Vec<BulkEntry>) {
    for entry in batch {
        match entry {
            BulkEntry::Put { key, value } => {
                entries.insert(key, value);
            }
            BulkEntry::Del { key } => {
                entries.remove(&key);
            }
        }
    }
}

fn above_lower(key: &[u8], lo: &Bound<Vec<u8>>) -> bool {
    match lo {
        Bound::Unbounded => true,
        Bound::Included(b) => key >= b.as_slice(),
        Bound::Excluded(b) => key > b.as_slice(),
    }
}

fn below_upper(key: &[u8], hi: &Bound<Vec<u8>>) -> bool {
    match hi {
        Bound::Unbounded => true,
        Bound::Included(b) => key <= b.as_slice(),
        Bound::Excluded(b) => key < b.as_slice(),
    }
}

/// Build the full tree for a sorted entry set, bottom-up. Returns the root
/// cid and every node block, root last.
fn build(entries: BTreeMap<Vec<u8>, Ipld>) -> Result<(Cid, Vec<Block>)> {
    let mut blocks = Vec::new();

    let leaves: Vec<LeafEntry> = entries
        .into_iter()
        .map(|(key, value)| LeafEntry { key, value })
        .collect();
    if leaves.is_empty() {
        let block = Node::Leaf(vec![]).encode()?;
        let root = *block.cid();
        blocks.push(block);
        return Ok((root, blocks));
    }

    let mut level_entries: Vec<BranchEntry> = Vec::new();
    for chunk in chunker::chunk(0, leaves, |e| e.key.as_slice()) {
        let key = chunk[0].key.clone();
        let block = Node::Leaf(chunk).encode()?;
        level_entries.push(BranchEntry {
            key,
            link: *block.cid(),
        });
        blocks.push(block);
    }

    let mut level = 1u64;
    while level_entries.len() > 1 {
        let prev_len = level_entries.len();
        let mut next: Vec<BranchEntry> = Vec::new();
        for chunk in chunker::chunk(level, level_entries, |e| e.key.as_slice()) {
            let key = chunk[0].key.clone();
            let block = Node::Branch {
                level,
                entries: chunk,
            }
            .encode()?;
            next.push(BranchEntry {
                key,
                link: *block.cid(),
            });
            blocks.push(block);
        }
        // a level where every key is a boundary would never shrink; collapse
        // it into a single node to keep the height finite
        if next.len() == prev_len && next.len() > 1 {
            let key = next[0].key.clone();
            level += 1;
            let block = Node::Branch {
                level,
                entries: next,
            }
            .encode()?;
            next = vec![BranchEntry {
                key,
                link: *block.cid(),
            }];
            blocks.push(block);
        }
        level_entries = next;
        level += 1;
    }

    let root = level_entries[0].link;
    Ok((root, blocks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    async fn store_all(store: &MemStore, blocks: &[Block]) {
        for b in blocks {
            store.put(b.clone()).await.unwrap();
        }
    }

    fn entry(i: u32) -> BulkEntry {
        BulkEntry::put(format!("key{i:04}"), Ipld::Integer(i as i128))
    }

    #[tokio::test]
    async fn test_create_get() {
        let store = MemStore::new();
        let batch: Vec<BulkEntry> = (0..200).map(entry).collect();
        let (tree, blocks) = Tree::create(store.clone(), batch).await.unwrap();
        store_all(&store, &blocks).await;

        assert_eq!(
            tree.get(b"key0007").await.unwrap(),
            Some(Ipld::Integer(7)),
        );
        assert_eq!(tree.get(b"nope").await.unwrap(), None);
        // below the first key
        assert_eq!(tree.get(b"a").await.unwrap(), None);
        assert_eq!(tree.all().await.unwrap().len(), 200);
    }

    #[tokio::test]
    async fn test_history_independence() {
        let store = MemStore::new();

        // one shot
        let batch: Vec<BulkEntry> = (0..100).map(entry).collect();
        let (one_shot, blocks) = Tree::create(store.clone(), batch).await.unwrap();
        store_all(&store, &blocks).await;

        // same keys in two batches, reverse order
        let (empty, blocks) = Tree::create(store.clone(), vec![]).await.unwrap();
        store_all(&store, &blocks).await;
        let first: Vec<BulkEntry> = (50..100).rev().map(entry).collect();
        let (t1, blocks) = empty.bulk(first).await.unwrap();
        store_all(&store, &blocks).await;
        let second: Vec<BulkEntry> = (0..50).rev().map(entry).collect();
        let (t2, blocks) = t1.bulk(second).await.unwrap();
        store_all(&store, &blocks).await;

        assert_eq!(one_shot.root(), t2.root());
    }

    #[tokio::test]
    async fn test_delete_restores_root() {
        let store = MemStore::new();
        let batch: Vec<BulkEntry> = (0..50).map(entry).collect();
        let (base, blocks) = Tree::create(store.clone(), batch).await.unwrap();
        store_all(&store, &blocks).await;

        let (grown, blocks) = base
            .bulk(vec![BulkEntry::put("zzz", Ipld::Null)])
            .await
            .unwrap();
        store_all(&store, &blocks).await;
        assert_ne!(base.root(), grown.root());
        assert_eq!(grown.get(b"zzz").await.unwrap(), Some(Ipld::Null));

        let (shrunk, blocks) = grown.bulk(vec![BulkEntry::del("zzz")]).await.unwrap();
        store_all(&store, &blocks).await;
        assert_eq!(base.root(), shrunk.root());
        assert_eq!(shrunk.get(b"zzz").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_tree() {
        let store = MemStore::new();
        let (tree, blocks) = Tree::create(store.clone(), vec![]).await.unwrap();
        store_all(&store, &blocks).await;
        assert_eq!(tree.get(b"any").await.unwrap(), None);
        assert!(tree.all().await.unwrap().is_empty());

        // deleting everything returns to the empty root
        let (full, blocks) = tree
            .bulk(vec![BulkEntry::put("a", Ipld::Integer(1))])
            .await
            .unwrap();
        store_all(&store, &blocks).await;
        let (drained, blocks) = full.bulk(vec![BulkEntry::del("a")]).await.unwrap();
        store_all(&store, &blocks).await;
        assert_eq!(tree.root(), drained.root());
    }

    #[tokio::test]
    async fn test_range() {
        let store = MemStore::new();
        let batch: Vec<BulkEntry> = (0..100).map(entry).collect();
        let (tree, blocks) = Tree::create(store.clone(), batch).await.unwrap();
        store_all(&store, &blocks).await;

        let rows = tree
            .range(
                Bound::Included(b"key0010".to_vec()),
                Bound::Included(b"key0019".to_vec()),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0].0, b"key0010".to_vec());
        assert_eq!(rows[9].0, b"key0019".to_vec());
        // sorted
        let mut sorted = rows.clone();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(rows, sorted);

        let rows = tree
            .range(
                Bound::Included(b"key0095".to_vec()),
                Bound::Unbounded,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 5);

        let rows = tree
            .range(
                Bound::Excluded(b"key0098".to_vec()),
                Bound::Excluded(b"key0099".to_vec()),
            )
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_get_many_skips_missing() {
        let store = MemStore::new();
        let batch: Vec<BulkEntry> = (0..10).map(entry).collect();
        let (tree, blocks) = Tree::create(store.clone(), batch).await.unwrap();
        store_all(&store, &blocks).await;

        let keys = vec![
            b"key0003".to_vec(),
            b"missing".to_vec(),
            b"key0001".to_vec(),
        ];
        let values = tree.get_many(&keys).await.unwrap();
        assert_eq!(values, vec![Ipld::Integer(3), Ipld::Integer(1)]);
    }
}
