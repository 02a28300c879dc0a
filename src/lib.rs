//! # Keystone
//!
//! Client-side multi-document ACID transactions over a document store
//! that only offers per-document compare-and-swap and sub-document
//! operations.
//!
//! Applications enlist reads, inserts, replaces and removes inside a
//! transactional closure; the engine guarantees that either every
//! mutation becomes visible atomically, or none does, even under
//! process crashes and concurrent transactions touching the same keys.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use keystone::{Transactions, TransactionConfig, KeyspaceRef};
//! use keystone::mem::MemCluster;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemCluster::new());
//!     let txns = Transactions::new(store, TransactionConfig::default());
//!     let ks = KeyspaceRef::default_collection("orders");
//!
//!     let result = txns.run(|ctx| {
//!         let doc = ctx.get(&ks, "order-17")?;
//!         let mut body = doc.content().clone();
//!         body["status"] = "shipped".into();
//!         ctx.replace(&doc, body)?;
//!         Ok(())
//!     })?;
//!     assert!(result.unstaging_complete);
//!
//!     txns.close();
//!     Ok(())
//! }
//! ```
//!
//! The [`Transactions`] struct is the entry point. Background cleanup of
//! attempts abandoned by crashed clients starts with it and stops at
//! [`Transactions::close`].
//!
//! Internal crates (`keystone-kv`, `keystone-engine`) are not stable;
//! only the surface re-exported here is.

pub use keystone_engine::{
    AttemptContext, AttemptState, TransactionConfig, TransactionError, TransactionGetResult,
    TransactionOperationFailed, TransactionResult, Transactions,
};
pub use keystone_kv::{DurabilityLevel, KeyspaceRef, KvError, KvStore};

/// In-memory document store, mainly for tests and examples.
pub mod mem {
    pub use keystone_kv::mem::MemCluster;
}
