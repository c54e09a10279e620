//! Synchronous facade.
//!
//! Wraps the async engine in an owned current-thread runtime for embedders
//! without an async context. Do not use from inside another tokio runtime;
//! use the async [`crate::Database`] directly there.

use cid::Cid;
use libipld::Ipld;
use tokio::runtime::{Builder, Runtime};

use crate::db::{Changes, ClockHandle, PutResult};
use crate::error::Result;
use crate::store::BlockStore;

/// A blocking handle over [`crate::Database`].
#[derive(Debug)]
pub struct Database<S: BlockStore> {
    rt: Runtime,
    db: crate::Database<S>,
}

impl<S: BlockStore> Database<S> {
    pub fn open(store: S) -> Result<Self> {
        let rt = Builder::new_current_thread().enable_time().build()?;
        let db = crate::Database::open(store);
        Ok(Self { rt, db })
    }

    /// The wrapped async handle, for mixing styles in one program.
    pub fn as_async(&self) -> &crate::Database<S> {
        &self.db
    }

    pub fn put(&self, key: &str, value: Ipld) -> Result<PutResult> {
        self.rt.block_on(self.db.put(key, value))
    }

    pub fn del(&self, key: &str) -> Result<PutResult> {
        self.rt.block_on(self.db.del(key))
    }

    pub fn get(&self, key: &str) -> Result<Ipld> {
        self.rt.block_on(self.db.get(key))
    }

    pub fn get_all(&self) -> Result<Vec<(String, Ipld)>> {
        self.rt.block_on(self.db.get_all())
    }

    pub fn changes_since(&self, since: Option<&[Cid]>) -> Result<Changes> {
        self.rt.block_on(self.db.changes_since(since))
    }

    pub fn advance(&self, event: Cid) -> Result<Vec<Cid>> {
        self.rt.block_on(self.db.advance(event))
    }

    pub fn set_clock(&self, head: Vec<Cid>) -> Result<()> {
        self.rt.block_on(self.db.set_clock(head))
    }

    pub fn get_clock(&self) -> ClockHandle {
        self.rt.block_on(self.db.get_clock())
    }

    pub fn head(&self) -> Vec<Cid> {
        self.rt.block_on(self.db.head())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    #[test]
    fn test_blocking_roundtrip() {
        let db = Database::open(MemStore::new()).unwrap();
        db.put("k", Ipld::String("v".to_string())).unwrap();
        assert_eq!(db.get("k").unwrap(), Ipld::String("v".to_string()));
        assert_eq!(db.get_all().unwrap().len(), 1);

        db.del("k").unwrap();
        assert!(db.get("k").is_err());
    }
}
