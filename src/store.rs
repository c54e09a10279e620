//! Content-addressed block storage.
//!
//! The engine consumes any [`BlockStore`] implementation. [`MemStore`] is the
//! built-in in-memory backend; persistent backends implement the same trait.

use std::fmt;
use std::sync::{Arc, RwLock};

use ahash::AHashMap;
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::trace;

use crate::error::{Error, Result};

/// An immutable content-addressed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    cid: Cid,
    data: Bytes,
}

impl Block {
    pub fn new(cid: Cid, data: Bytes) -> Self {
        Self { cid, data }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Check that the data hashes to the multihash declared by the cid.
    pub fn validate(&self) -> Result<()> {
        let code = self.cid.hash().code();
        let mh = Code::try_from(code)
            .map_err(|_| Error::Store(anyhow!("unsupported multihash code {code}")))?
            .digest(&self.data);
        if mh.digest() != self.cid.hash().digest() {
            return Err(Error::InvalidBlock(self.cid));
        }
        Ok(())
    }

    pub fn into_parts(self) -> (Cid, Bytes) {
        (self.cid, self.data)
    }
}

/// Storage consumed by the engine.
///
/// Writes from a single database instance are serialised by the engine;
/// reads may happen concurrently. `put` is idempotent on the cid.
#[async_trait]
pub trait BlockStore: Send + Sync + fmt::Debug + Clone + 'static {
    async fn get(&self, cid: &Cid) -> Result<Block>;

    async fn put(&self, block: Block) -> Result<()>;

    async fn has(&self, cid: &Cid) -> Result<bool>;

    /// All blocks currently in the store, for tests and replication.
    async fn entries(&self) -> Result<BoxStream<'static, Block>>;
}

#[async_trait]
impl<S: BlockStore> BlockStore for Arc<S> {
    async fn get(&self, cid: &Cid) -> Result<Block> {
        self.as_ref().get(cid).await
    }

    async fn put(&self, block: Block) -> Result<()> {
        self.as_ref().put(block).await
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        self.as_ref().has(cid).await
    }

    async fn entries(&self) -> Result<BoxStream<'static, Block>> {
        self.as_ref().entries().await
    }
}

/// An in-memory block store.
///
/// Clones share the same underlying map, so separate database instances
/// opened on clones of one `MemStore` see each other's blocks.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    blocks: Arc<RwLock<AHashMap<Cid, Bytes>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().unwrap().is_empty()
    }
}

#[async_trait]
impl BlockStore for MemStore {
    async fn get(&self, cid: &Cid) -> Result<Block> {
        let blocks = self.blocks.read().unwrap();
        match blocks.get(cid) {
            Some(data) => Ok(Block::new(*cid, data.clone())),
            None => Err(Error::BlockNotFound(*cid)),
        }
    }

    async fn put(&self, block: Block) -> Result<()> {
        {
            let blocks = self.blocks.read().unwrap();
            if blocks.contains_key(block.cid()) {
                return Ok(());
            }
        }
        // Content is verified on first insert only.
        block.validate()?;
        trace!(cid = %block.cid(), len = block.data().len(), "put block");
        let (cid, data) = block.into_parts();
        self.blocks.write().unwrap().insert(cid, data);
        Ok(())
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.blocks.read().unwrap().contains_key(cid))
    }

    async fn entries(&self) -> Result<BoxStream<'static, Block>> {
        let snapshot: Vec<Block> = self
            .blocks
            .read()
            .unwrap()
            .iter()
            .map(|(cid, data)| Block::new(*cid, data.clone()))
            .collect();
        Ok(stream::iter(snapshot).boxed())
    }
}
