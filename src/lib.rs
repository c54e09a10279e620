//! An embedded, content-addressed document database with conflict-free
//! replicated semantics.
//!
//! History is a merkle clock: a DAG of put/del event blocks linked by
//! parent cids, whose frontier (the head) advances and merges
//! commutatively. Materialised state lives in a prolly tree, an immutable
//! balanced search tree with content-defined node boundaries, so replicas
//! holding the same events hold byte-identical roots. Secondary indexes
//! project documents through user map functions into further prolly trees
//! and refresh lazily from the change feed.
//!
//! ```no_run
//! # async fn example() -> Result<(), tidepool::Error> {
//! use libipld::Ipld;
//! use tidepool::MemStore;
//!
//! let db = tidepool::open(MemStore::new());
//! db.put("alice", Ipld::String("builder".to_string())).await?;
//! let value = db.get("alice").await?;
//! # Ok(())
//! # }
//! ```
//!
//! Everything I/O-bearing is async; [`blocking`] offers a synchronous
//! facade for embedding without a runtime.

mod codec;

pub mod blocking;
pub mod clock;
pub mod db;
pub mod error;
pub mod index;
pub mod prolly;
pub mod store;
pub mod subscribe;

pub use crate::clock::{Event, EventData};
pub use crate::db::{open, ChangeRow, Changes, ClockHandle, Database, PutResult};
pub use crate::error::{Error, Result};
pub use crate::index::{Document, Emitter, Index, MapFn, QueryRow};
pub use crate::prolly::{BulkEntry, Tree};
pub use crate::store::{Block, BlockStore, MemStore};
pub use crate::subscribe::{DbUpdate, Debounce, DEFAULT_DEBOUNCE};
