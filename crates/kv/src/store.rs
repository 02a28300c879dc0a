//! The `KvStore` capability trait.
//!
//! This is the seam between the transaction engine and whatever client
//! actually talks to the cluster. Implementations must be safe to call
//! concurrently from multiple threads.

use crate::error::KvResult;
use crate::subdoc::{LookupOptions, LookupSpec, MutateOptions, MutateSpec};
use crate::types::{Cas, DurabilityLevel, KeyspaceRef};
use crate::KvError;
use serde_json::Value;

/// Result of a full-document read.
#[derive(Debug, Clone, PartialEq)]
pub struct GetResult {
    /// Document body
    pub body: Value,
    /// Current CAS
    pub cas: Cas,
    /// Whether the document is a tombstone
    pub is_deleted: bool,
}

/// Result of a sub-document lookup.
///
/// `entries` aligns with the spec list passed in; an entry is `None`
/// when its path did not exist.
#[derive(Debug, Clone)]
pub struct LookupResult {
    /// Current CAS of the document
    pub cas: Cas,
    /// Whether the document is a tombstone
    pub is_deleted: bool,
    /// Fetched values, one per spec
    pub entries: Vec<Option<Value>>,
}

impl LookupResult {
    /// The value fetched by spec `idx`, if its path existed.
    pub fn entry(&self, idx: usize) -> Option<&Value> {
        self.entries.get(idx).and_then(|v| v.as_ref())
    }
}

/// Result of a sub-document mutation.
#[derive(Debug, Clone, Copy)]
pub struct MutateResult {
    /// CAS assigned to the mutation
    pub cas: Cas,
}

/// Options for a query statement.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Named parameters
    pub named_params: Vec<(String, Value)>,
    /// Positional parameters
    pub positional_params: Vec<Value>,
}

/// Result rows of a query statement.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Result rows
    pub rows: Vec<Value>,
}

/// Capability set the transaction engine consumes.
pub trait KvStore: Send + Sync {
    /// Read a document body with its CAS.
    fn get(&self, keyspace: &KeyspaceRef, id: &str) -> KvResult<GetResult>;

    /// Create a document; fails with [`KvError::DocumentExists`] if the
    /// key is live.
    fn insert(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        body: Value,
        durability: DurabilityLevel,
    ) -> KvResult<Cas>;

    /// Replace a document body under a CAS guard.
    fn replace(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        body: Value,
        cas: Cas,
        durability: DurabilityLevel,
    ) -> KvResult<Cas>;

    /// Delete a document under a CAS guard (0 = unguarded).
    fn remove(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        cas: Cas,
        durability: DurabilityLevel,
    ) -> KvResult<()>;

    /// Whether a live document exists under the key.
    fn exists(&self, keyspace: &KeyspaceRef, id: &str) -> KvResult<bool>;

    /// Fetch a set of paths (body, xattr, or virtual) in one atomic
    /// snapshot of the document.
    fn lookup_in(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        specs: &[LookupSpec],
        options: LookupOptions,
    ) -> KvResult<LookupResult>;

    /// Apply a set of sub-document mutations atomically.
    fn mutate_in(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        specs: &[MutateSpec],
        options: MutateOptions,
    ) -> KvResult<MutateResult>;

    /// Execute a query statement, when the store supports one.
    ///
    /// The default implementation reports the capability as absent.
    fn query(&self, _statement: &str, _options: &QueryOptions) -> KvResult<QueryResult> {
        Err(KvError::Invalid("query capability not supported".into()))
    }
}
