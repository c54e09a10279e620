//! The database engine.
//!
//! A [`Database`] ties the merkle clock to a prolly-tree materialisation:
//! every `put`/`del` appends an event with the current head as parents, then
//! folds the change into the tree. `advance` merges events produced
//! elsewhere (on a shared or replicated block store) and re-resolves the
//! touched keys, so replicas that have seen the same events hold the same
//! head and the same root cid.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use cid::Cid;
use libipld::Ipld;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::{self, Event, EventData};
use crate::error::{Error, Result};
use crate::prolly::{BulkEntry, Tree};
use crate::store::{Block, BlockStore};
use crate::subscribe::{DbUpdate, Subscriptions, DEFAULT_DEBOUNCE};

/// Outcome of a successful `put` or `del`.
#[derive(Debug, Clone)]
pub struct PutResult {
    pub event: Event,
    pub head: Vec<Cid>,
    pub root: Cid,
    /// Tree blocks produced by the update. They are already inserted into
    /// this database's store; replicas applying the event elsewhere insert
    /// any they are missing.
    pub additions: Vec<Block>,
}

/// One row of a change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    pub key: String,
    pub value: Option<Ipld>,
    pub del: bool,
}

/// Changes between two heads.
#[derive(Debug, Clone)]
pub struct Changes {
    pub rows: Vec<ChangeRow>,
    /// The head the rows were computed at; pass it back to `changes_since`
    /// to continue from here.
    pub head: Vec<Cid>,
}

/// Serialized clock handle, for persistence by an embedding layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockHandle {
    pub clock: Vec<String>,
}

impl ClockHandle {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn cids(&self) -> Result<Vec<Cid>> {
        self.clock
            .iter()
            .map(|s| Cid::try_from(s.as_str()).map_err(Error::from))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
struct State {
    head: Vec<Cid>,
    root: Option<Cid>,
}

struct Inner<S> {
    store: S,
    state: Mutex<State>,
    subs: Subscriptions,
}

impl<S: fmt::Debug> fmt::Debug for Inner<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("store", &self.store)
            .field("subs", &self.subs)
            .finish_non_exhaustive()
    }
}

/// A handle to one replica of the database. Cheap to clone; all clones
/// share the same head, root and subscriber set.
#[derive(Debug, Clone)]
pub struct Database<S: BlockStore> {
    inner: Arc<Inner<S>>,
}

/// Open a database on the given block store, starting from an empty clock.
pub fn open<S: BlockStore>(store: S) -> Database<S> {
    Database::open(store)
}

impl<S: BlockStore> Database<S> {
    pub fn open(store: S) -> Self {
        Self::with_debounce(store, DEFAULT_DEBOUNCE)
    }

    /// Open with a custom subscriber debounce interval.
    pub fn with_debounce(store: S, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                state: Mutex::new(State::default()),
                subs: Subscriptions::new(interval),
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Write a value under a key.
    #[tracing::instrument(skip(self, value))]
    pub async fn put(&self, key: &str, value: Ipld) -> Result<PutResult> {
        self.append(EventData::Put {
            key: key.to_string(),
            value,
        })
        .await
    }

    /// Remove a key.
    #[tracing::instrument(skip(self))]
    pub async fn del(&self, key: &str) -> Result<PutResult> {
        self.append(EventData::Del {
            key: key.to_string(),
        })
        .await
    }

    async fn append(&self, data: EventData) -> Result<PutResult> {
        let store = &self.inner.store;
        let mut state = self.inner.state.lock().await;

        let (event, block) = Event::new(state.head.clone(), data)?;
        store.put(block).await?;

        let batch = vec![match &event.data {
            EventData::Put { key, value } => BulkEntry::put(key.as_bytes(), value.clone()),
            EventData::Del { key } => BulkEntry::del(key.as_bytes()),
        }];
        let (root, additions) = apply_batch(store, state.root, batch).await?;

        state.head = vec![event.cid];
        state.root = Some(root);
        debug!(event = %event.cid, %root, "appended");
        self.publish(&state);

        Ok(PutResult {
            head: state.head.clone(),
            root,
            additions,
            event,
        })
    }

    /// Read the current value of a key.
    #[tracing::instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<Ipld> {
        let state = self.inner.state.lock().await;
        let Some(root) = state.root else {
            return Err(Error::KeyNotFound(key.to_string()));
        };
        let tree = Tree::load(self.inner.store.clone(), root).await?;
        tree.get(key.as_bytes())
            .await?
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    /// All live entries in key order.
    pub async fn get_all(&self) -> Result<Vec<(String, Ipld)>> {
        let state = self.inner.state.lock().await;
        self.scan(&state).await
    }

    async fn scan(&self, state: &State) -> Result<Vec<(String, Ipld)>> {
        let Some(root) = state.root else {
            return Ok(vec![]);
        };
        let tree = Tree::load(self.inner.store.clone(), root).await?;
        let entries = tree.range(Bound::Unbounded, Bound::Unbounded).await?;
        entries
            .into_iter()
            .map(|(key, value)| {
                let key = String::from_utf8(key).map_err(|_| Error::Decode {
                    cid: root,
                    reason: "non-utf8 key in tree".to_string(),
                })?;
                Ok((key, value))
            })
            .collect()
    }

    /// The latest state of every key changed since `since`.
    ///
    /// With no `since` head (or an empty one) this is a full snapshot.
    /// Otherwise the clock delta is walked in its deterministic linear
    /// order and deduplicated per key, the entry closest to the head
    /// winning.
    #[tracing::instrument(skip(self))]
    pub async fn changes_since(&self, since: Option<&[Cid]>) -> Result<Changes> {
        let state = self.inner.state.lock().await;
        let since = since.filter(|h| !h.is_empty());

        let rows = match since {
            None => self
                .scan(&state)
                .await?
                .into_iter()
                .map(|(key, value)| ChangeRow {
                    key,
                    value: Some(value),
                    del: false,
                })
                .collect(),
            Some(since) => {
                let delta = clock::since(&self.inner.store, &state.head, since).await?;
                let mut latest: BTreeMap<String, ChangeRow> = BTreeMap::new();
                for event in delta {
                    let row = match event.data {
                        EventData::Put { key, value } => ChangeRow {
                            key,
                            value: Some(value),
                            del: false,
                        },
                        EventData::Del { key } => ChangeRow {
                            key,
                            value: None,
                            del: true,
                        },
                    };
                    latest.insert(row.key.clone(), row);
                }
                latest.into_values().collect()
            }
        };
        Ok(Changes {
            rows,
            head: state.head.clone(),
        })
    }

    /// Merge an event produced elsewhere into this replica.
    ///
    /// The keys touched by the new history are re-resolved against the full
    /// merged clock, so the resulting root is a pure function of the event
    /// set: replicas converge no matter the order events arrive in.
    #[tracing::instrument(skip(self))]
    pub async fn advance(&self, event: Cid) -> Result<Vec<Cid>> {
        let store = &self.inner.store;
        let mut state = self.inner.state.lock().await;

        let head = clock::advance(store, &state.head, event).await?;
        if head == state.head {
            return Ok(head);
        }

        let delta = clock::since(store, &head, &state.head).await?;
        let keys: std::collections::BTreeSet<String> = delta
            .iter()
            .map(|e| e.data.key().to_string())
            .collect();
        let mut batch = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(winner) = clock::winner(store, &key, &head).await? {
                batch.push(match winner.data {
                    EventData::Put { key, value } => BulkEntry::put(key.into_bytes(), value),
                    EventData::Del { key } => BulkEntry::del(key.into_bytes()),
                });
            }
        }
        let (root, _additions) = apply_batch(store, state.root, batch).await?;

        debug!(%event, tips = head.len(), %root, "advanced");
        state.head = head.clone();
        state.root = Some(root);
        self.publish(&state);
        Ok(head)
    }

    /// Reset the clock to a head restored from external persistence and
    /// rebuild the materialisation for it.
    #[tracing::instrument(skip(self))]
    pub async fn set_clock(&self, head: Vec<Cid>) -> Result<()> {
        let store = &self.inner.store;
        let mut state = self.inner.state.lock().await;

        let head = clock::canonical(head);
        if head == state.head {
            return Ok(());
        }
        if head.is_empty() {
            state.head = head;
            state.root = None;
            self.publish(&state);
            return Ok(());
        }

        // Full rebuild: resolve every key ever written in this history.
        // Restores are rare; everything else stays incremental.
        let events = clock::since(store, &head, &[]).await?;
        let keys: std::collections::BTreeSet<String> = events
            .iter()
            .map(|e| e.data.key().to_string())
            .collect();
        let mut batch = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(winner) = clock::winner(store, &key, &head).await? {
                if let EventData::Put { key, value } = winner.data {
                    batch.push(BulkEntry::put(key.into_bytes(), value));
                }
            }
        }
        let (root, _additions) = apply_batch(store, None, batch).await?;

        debug!(tips = head.len(), %root, "clock set");
        state.head = head;
        state.root = Some(root);
        self.publish(&state);
        Ok(())
    }

    /// The current head as a serializable handle.
    pub async fn get_clock(&self) -> ClockHandle {
        let state = self.inner.state.lock().await;
        ClockHandle {
            clock: state.head.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Restore from a handle previously produced by [`Self::get_clock`].
    pub async fn set_clock_handle(&self, handle: &ClockHandle) -> Result<()> {
        self.set_clock(handle.cids()?).await
    }

    /// The current head.
    pub async fn head(&self) -> Vec<Cid> {
        self.inner.state.lock().await.head.clone()
    }

    /// The current materialised tree root, if any entry was ever written.
    pub async fn root(&self) -> Option<Cid> {
        self.inner.state.lock().await.root
    }

    /// Register a callback fired (debounced) after mutations.
    pub fn subscribe(&self, label: &str, callback: impl Fn(&DbUpdate) + Send + Sync + 'static) {
        self.inner.subs.subscribe(label, callback);
    }

    pub fn unsubscribe(&self, label: &str) -> bool {
        self.inner.subs.unsubscribe(label)
    }

    fn publish(&self, state: &State) {
        self.inner.subs.publish(DbUpdate {
            head: state.head.clone(),
            root: state.root,
        });
    }
}

/// Apply a batch to the tree at `root` (or a fresh tree) and persist the
/// resulting blocks.
async fn apply_batch<S: BlockStore>(
    store: &S,
    root: Option<Cid>,
    batch: Vec<BulkEntry>,
) -> Result<(Cid, Vec<Block>)> {
    let (tree, blocks) = match root {
        Some(root) => {
            Tree::load(store.clone(), root)
                .await?
                .bulk(batch)
                .await?
        }
        None => Tree::create(store.clone(), batch).await?,
    };
    for block in &blocks {
        if !store.has(block.cid()).await? {
            store.put(block.clone()).await?;
        }
    }
    Ok((*tree.root(), blocks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn val(s: &str) -> Ipld {
        Ipld::String(s.to_string())
    }

    #[tokio::test]
    async fn test_put_get() {
        let db = open(MemStore::new());
        let res = db.put("key", val("v1")).await.unwrap();
        assert_eq!(res.head, vec![res.event.cid]);
        assert_eq!(db.get("key").await.unwrap(), val("v1"));

        db.put("key", val("v2")).await.unwrap();
        assert_eq!(db.get("key").await.unwrap(), val("v2"));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let db = open(MemStore::new());
        assert!(matches!(
            db.get("nope").await,
            Err(Error::KeyNotFound(_))
        ));
        db.put("some", val("x")).await.unwrap();
        assert!(matches!(
            db.get("nope").await,
            Err(Error::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_clock_handle_json() {
        let db = open(MemStore::new());
        db.put("a", val("1")).await.unwrap();
        let handle = db.get_clock().await;
        let json = handle.to_json().unwrap();
        let back = ClockHandle::from_json(&json).unwrap();
        assert_eq!(handle, back);
        assert_eq!(back.cids().unwrap(), db.head().await);
    }
}
