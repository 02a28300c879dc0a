//! Document-store capability surface for keystone.
//!
//! The transaction engine consumes a small capability set — get /
//! insert / replace / remove plus sub-document lookup and mutation,
//! every write CAS-guarded — expressed here as the [`KvStore`] trait.
//! Production deployments implement it over their cluster client;
//! [`mem::MemCluster`] is a complete in-memory implementation used by
//! the test suites.

#![warn(clippy::all)]

pub mod error;
pub mod mem;
pub mod store;
pub mod subdoc;
pub mod types;

pub use error::{KvError, KvResult};
pub use store::{GetResult, KvStore, LookupResult, MutateResult, QueryOptions, QueryResult};
pub use subdoc::{LookupOptions, LookupSpec, Macro, MutateOptions, MutateSpec, MutateValue};
pub use types::{Cas, DurabilityLevel, KeyspaceRef, StoreSemantics};
