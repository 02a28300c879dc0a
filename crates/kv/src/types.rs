//! Shared vocabulary of the document store: keyspaces, CAS tokens,
//! durability requirements and store semantics.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Compare-and-swap token.
///
/// Opaque, monotonically increasing per document revision. `0` means
/// "no CAS requirement" on writes.
pub type Cas = u64;

/// Fully qualified collection address: bucket / scope / collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyspaceRef {
    /// Bucket name
    pub bucket: String,
    /// Scope name within the bucket
    pub scope: String,
    /// Collection name within the scope
    pub collection: String,
}

impl KeyspaceRef {
    /// Create a keyspace reference from its three parts.
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
        }
    }

    /// The `_default._default` collection of a bucket, where
    /// transaction metadata documents live unless overridden.
    pub fn default_collection(bucket: impl Into<String>) -> Self {
        Self::new(bucket, "_default", "_default")
    }

    /// Same bucket, default scope and collection.
    pub fn with_default_collection(&self) -> Self {
        Self::default_collection(self.bucket.clone())
    }
}

impl fmt::Display for KeyspaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.bucket, self.scope, self.collection)
    }
}

/// Durability requirement attached to every mutation of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityLevel {
    /// No durability requirement
    None,
    /// Replicated to a majority of nodes
    #[default]
    Majority,
    /// Majority, and persisted on the active node
    MajorityPersistActive,
    /// Persisted on a majority of nodes
    PersistMajority,
}

/// Document-level semantics of a sub-document mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreSemantics {
    /// Document must already exist
    #[default]
    Replace,
    /// Create the document if missing
    Upsert,
    /// Document must not exist
    Insert,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyspace_display() {
        let ks = KeyspaceRef::new("travel", "inventory", "hotels");
        assert_eq!(ks.to_string(), "travel.inventory.hotels");
    }

    #[test]
    fn test_default_collection() {
        let ks = KeyspaceRef::default_collection("travel");
        assert_eq!(ks.scope, "_default");
        assert_eq!(ks.collection, "_default");
        let other = KeyspaceRef::new("travel", "inventory", "hotels");
        assert_eq!(other.with_default_collection(), ks);
    }
}
