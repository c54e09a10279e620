//! Secondary indexes.
//!
//! An [`Index`] projects documents through a user map function into an
//! ordered, range-queryable tree. Two trees back each index: the forward
//! tree maps the dag-cbor encoding of `[emitted_key, doc_id]` to the
//! emitted value, and the byId tree maps each doc id to its current set of
//! forward keys so a changed document can have its previous emissions
//! invalidated before the new ones land.
//!
//! Indexes refresh lazily: `query` first pulls whatever changed in the
//! database since the index last looked, then scans.

use std::fmt;

use cid::Cid;
use libipld::Ipld;
use tokio::sync::Mutex;
use tracing::debug;

use crate::codec;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::prolly::{BulkEntry, Tree};
use crate::store::BlockStore;

/// A document as seen by a map function: the database key is the id, the
/// value carries the fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub value: Ipld,
}

impl Document {
    /// Field access for map-style values.
    pub fn field(&self, name: &str) -> Option<&Ipld> {
        match &self.value {
            Ipld::Map(map) => map.get(name),
            _ => None,
        }
    }
}

/// Collects the emissions of one map-function invocation.
#[derive(Debug, Default)]
pub struct Emitter {
    rows: Vec<(Ipld, Ipld)>,
}

impl Emitter {
    pub fn emit(&mut self, key: Ipld, value: Ipld) {
        self.rows.push((key, value));
    }
}

/// User projection from a document to zero or more `(key, value)` entries.
/// Must be deterministic and side-effect free.
pub type MapFn = Box<dyn Fn(&Document, &mut Emitter) -> anyhow::Result<()> + Send + Sync>;

/// One row of a query result.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub id: String,
    pub key: Ipld,
    pub value: Ipld,
}

#[derive(Debug, Clone, Default)]
struct IndexState {
    index_root: Option<Cid>,
    by_id_root: Option<Cid>,
    db_head: Vec<Cid>,
}

/// A secondary index over a database.
///
/// Holds a read handle back to the database (its change feed and block
/// store); the database does not know about its indexes.
pub struct Index<S: BlockStore> {
    db: Database<S>,
    map_fn: MapFn,
    state: Mutex<IndexState>,
}

impl<S: BlockStore> fmt::Debug for Index<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index").field("db", &self.db).finish_non_exhaustive()
    }
}

impl<S: BlockStore> Index<S> {
    pub fn new(
        db: &Database<S>,
        map_fn: impl Fn(&Document, &mut Emitter) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            db: db.clone(),
            map_fn: Box::new(map_fn),
            state: Mutex::new(IndexState::default()),
        }
    }

    /// Query all entries whose emitted key falls in `range` (inclusive on
    /// both ends), refreshing the index first.
    #[tracing::instrument(skip(self, range))]
    pub async fn query(&self, range: Option<(Ipld, Ipld)>) -> Result<Vec<QueryRow>> {
        let mut state = self.state.lock().await;
        self.update_index(&mut state).await?;
        let Some(root) = state.index_root else {
            return Ok(vec![]);
        };
        self.scan(root, range).await
    }

    /// Query a historical snapshot by forward-tree root, without
    /// refreshing.
    pub async fn query_at(&self, root: Cid, range: Option<(Ipld, Ipld)>) -> Result<Vec<QueryRow>> {
        self.scan(root, range).await
    }

    /// The current forward-tree root, for later [`Self::query_at`] calls.
    pub async fn root(&self) -> Option<Cid> {
        self.state.lock().await.index_root
    }

    /// Fold every database change since the last refresh into the two
    /// index trees. Either the whole refresh applies or none of it does.
    async fn update_index(&self, state: &mut IndexState) -> Result<()> {
        let had_head = !state.db_head.is_empty();
        let since = if had_head {
            Some(state.db_head.clone())
        } else {
            None
        };
        let changes = self.db.changes_since(since.as_deref()).await?;
        if changes.rows.is_empty() {
            state.db_head = changes.head;
            return Ok(());
        }

        let store = self.db.store().clone();
        let mut forward_batch: Vec<BulkEntry> = Vec::new();
        let mut by_id_batch: Vec<BulkEntry> = Vec::new();

        // Invalidate the previous emissions of every changed doc.
        if had_head {
            if let Some(by_id_root) = state.by_id_root {
                let by_id = Tree::load(store.clone(), by_id_root).await?;
                for row in &changes.rows {
                    let Some(prior) = by_id.get(row.key.as_bytes()).await? else {
                        continue;
                    };
                    let Ipld::List(keys) = prior else {
                        return Err(Error::Decode {
                            cid: by_id_root,
                            reason: "malformed byId entry".to_string(),
                        });
                    };
                    for key in keys {
                        if let Ipld::Bytes(bytes) = key {
                            forward_batch.push(BulkEntry::del(bytes));
                        }
                    }
                }
            }
        }

        // Re-run the map function for every live doc. Any failure aborts
        // the refresh before the trees are touched.
        for row in &changes.rows {
            if row.del {
                by_id_batch.push(BulkEntry::del(row.key.as_bytes()));
                continue;
            }
            let doc = Document {
                id: row.key.clone(),
                value: row.value.clone().unwrap_or(Ipld::Null),
            };
            let mut emitter = Emitter::default();
            (self.map_fn)(&doc, &mut emitter).map_err(Error::IndexBuild)?;

            let mut forward_keys = Vec::with_capacity(emitter.rows.len());
            for (key, value) in emitter.rows {
                let composite = composite_key(&key, &doc.id)?;
                forward_batch.push(BulkEntry::put(composite.clone(), value));
                forward_keys.push(Ipld::Bytes(composite));
            }
            if forward_keys.is_empty() {
                by_id_batch.push(BulkEntry::del(doc.id.as_bytes()));
            } else {
                by_id_batch.push(BulkEntry::put(doc.id.as_bytes(), Ipld::List(forward_keys)));
            }
        }

        // Deletes from invalidation sit ahead of the new puts in the batch,
        // so a re-emitted key survives.
        let index_root = apply(&store, state.index_root, forward_batch).await?;
        let by_id_root = apply(&store, state.by_id_root, by_id_batch).await?;

        debug!(rows = changes.rows.len(), %index_root, "index refreshed");
        state.index_root = Some(index_root);
        state.by_id_root = Some(by_id_root);
        state.db_head = changes.head;
        Ok(())
    }

    async fn scan(&self, root: Cid, range: Option<(Ipld, Ipld)>) -> Result<Vec<QueryRow>> {
        use std::ops::Bound;

        let store = self.db.store().clone();
        let tree = Tree::load(store, root).await?;
        let (lo, hi) = match &range {
            Some((lo_key, hi_key)) => {
                let lo = composite_prefix(lo_key)?;
                let hi = match prefix_successor(composite_prefix(hi_key)?) {
                    Some(bytes) => Bound::Excluded(bytes),
                    None => Bound::Unbounded,
                };
                (Bound::Included(lo), hi)
            }
            None => (Bound::Unbounded, Bound::Unbounded),
        };

        let mut rows = Vec::new();
        for (bytes, value) in tree.range(lo, hi).await? {
            let (key, id) = decode_composite(&root, &bytes)?;
            rows.push(QueryRow { id, key, value });
        }
        Ok(rows)
    }
}

async fn apply<S: BlockStore>(
    store: &S,
    root: Option<Cid>,
    batch: Vec<BulkEntry>,
) -> Result<Cid> {
    let (tree, blocks) = match root {
        Some(root) => Tree::load(store.clone(), root).await?.bulk(batch).await?,
        None => Tree::create(store.clone(), batch).await?,
    };
    for block in &blocks {
        if !store.has(block.cid()).await? {
            store.put(block.clone()).await?;
        }
    }
    Ok(*tree.root())
}

/// Forward-tree key for one emission: dag-cbor of `[emitted_key, doc_id]`.
fn composite_key(key: &Ipld, id: &str) -> Result<Vec<u8>> {
    codec::encode_bytes(&Ipld::List(vec![
        key.clone(),
        Ipld::String(id.to_string()),
    ]))
}

/// Every composite key for emitted key `k` starts with the two-element
/// array header followed by the encoding of `k`; dag-cbor encodings are
/// self-delimiting, so this prefix selects exactly the `[k, *]` range.
fn composite_prefix(key: &Ipld) -> Result<Vec<u8>> {
    let mut bytes = vec![0x82];
    bytes.extend(codec::encode_bytes(key)?);
    Ok(bytes)
}

/// The smallest byte string greater than every string starting with
/// `prefix`, or `None` when no such bound exists.
fn prefix_successor(mut prefix: Vec<u8>) -> Option<Vec<u8>> {
    while let Some(&last) = prefix.last() {
        if last == 0xff {
            prefix.pop();
        } else {
            *prefix.last_mut().unwrap() = last + 1;
            return Some(prefix);
        }
    }
    None
}

fn decode_composite(root: &Cid, bytes: &[u8]) -> Result<(Ipld, String)> {
    let malformed = || Error::Decode {
        cid: *root,
        reason: "malformed index key".to_string(),
    };
    let Ipld::List(mut parts) = codec::decode(root, bytes)? else {
        return Err(malformed());
    };
    if parts.len() != 2 {
        return Err(malformed());
    }
    let Some(Ipld::String(id)) = parts.pop() else {
        return Err(malformed());
    };
    let key = parts.pop().ok_or_else(malformed)?;
    Ok((key, id))
}
