//! Sub-document operation builders.
//!
//! Lookups and mutations address paths inside a document's body or its
//! extended-attribute (xattr) region. Values written by a mutation are
//! either literal JSON or a server-expanded macro.

use crate::types::{Cas, DurabilityLevel, StoreSemantics};
use serde_json::Value;

/// Virtual xattr exposing document metadata: `cas`, `revid`, `exptime`,
/// `value_crc32c`.
pub const VATTR_DOCUMENT: &str = "$document";

/// Virtual xattr exposing the server clock: `{"HLC": {"now": "<secs>"}}`.
pub const VATTR_VBUCKET: &str = "$vbucket";

/// Server-side macros, expanded at mutation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Macro {
    /// The CAS assigned to this mutation (nanosecond HLC value).
    Cas,
    /// CRC of the document body after the mutation.
    ValueCrc32,
}

/// A value written by a mutation spec.
#[derive(Debug, Clone, PartialEq)]
pub enum MutateValue {
    /// Literal JSON
    Json(Value),
    /// Server-expanded macro; implies xattr
    Expand(Macro),
}

impl From<Value> for MutateValue {
    fn from(v: Value) -> Self {
        MutateValue::Json(v)
    }
}

/// One entry of a sub-document lookup.
#[derive(Debug, Clone)]
pub struct LookupSpec {
    pub(crate) path: String,
    pub(crate) xattr: bool,
}

impl LookupSpec {
    /// Fetch the value at `path`.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            xattr: false,
        }
    }

    /// Fetch the entire document body.
    pub fn full_doc() -> Self {
        Self {
            path: String::new(),
            xattr: false,
        }
    }

    /// Address the xattr region instead of the body.
    pub fn xattr(mut self) -> Self {
        self.xattr = true;
        self
    }

    /// The addressed path (empty for full-document).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether this spec addresses the xattr region.
    pub fn is_xattr(&self) -> bool {
        self.xattr
    }

    /// Whether this spec fetches the whole body.
    pub fn is_full_doc(&self) -> bool {
        !self.xattr && self.path.is_empty()
    }
}

/// The kind of a sub-document mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutateKind {
    /// Create the path; fails if it exists
    Insert(MutateValue),
    /// Create or replace the path
    Upsert(MutateValue),
    /// Remove the path; fails if absent
    Remove,
    /// Append to the array at the path
    ArrayAppend(MutateValue),
    /// Replace the entire document body
    FullDocUpsert(Value),
    /// Delete the whole document
    FullDocRemove,
}

/// One entry of a sub-document mutation.
#[derive(Debug, Clone)]
pub struct MutateSpec {
    pub(crate) path: String,
    pub(crate) kind: MutateKind,
    pub(crate) xattr: bool,
    pub(crate) create_path: bool,
}

impl MutateSpec {
    /// Insert `value` at `path`, failing if the path exists.
    pub fn insert(path: impl Into<String>, value: impl Into<MutateValue>) -> Self {
        Self::of(path, MutateKind::Insert(value.into()))
    }

    /// Create or replace `path` with `value`.
    pub fn upsert(path: impl Into<String>, value: impl Into<MutateValue>) -> Self {
        Self::of(path, MutateKind::Upsert(value.into()))
    }

    /// Remove `path`.
    pub fn remove(path: impl Into<String>) -> Self {
        Self::of(path, MutateKind::Remove)
    }

    /// Append `value` to the array at `path`.
    pub fn array_append(path: impl Into<String>, value: impl Into<MutateValue>) -> Self {
        Self::of(path, MutateKind::ArrayAppend(value.into()))
    }

    /// Replace the whole document body.
    pub fn full_doc_upsert(value: Value) -> Self {
        Self::of("", MutateKind::FullDocUpsert(value))
    }

    /// Delete the whole document.
    pub fn full_doc_remove() -> Self {
        Self::of("", MutateKind::FullDocRemove)
    }

    fn of(path: impl Into<String>, kind: MutateKind) -> Self {
        Self {
            path: path.into(),
            kind,
            xattr: false,
            create_path: false,
        }
    }

    /// Address the xattr region instead of the body.
    pub fn xattr(mut self) -> Self {
        self.xattr = true;
        self
    }

    /// Create missing intermediate objects along the path.
    pub fn create_path(mut self) -> Self {
        self.create_path = true;
        self
    }
}

/// Options for a sub-document lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct LookupOptions {
    /// Serve tombstoned documents as well
    pub access_deleted: bool,
}

impl LookupOptions {
    /// Serve tombstoned documents as well.
    pub fn access_deleted(mut self, v: bool) -> Self {
        self.access_deleted = v;
        self
    }
}

/// Options for a sub-document mutation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutateOptions {
    /// CAS guard; 0 means unguarded
    pub cas: Cas,
    /// Operate on tombstoned documents as well
    pub access_deleted: bool,
    /// When creating the document, create it as a tombstone
    pub create_as_deleted: bool,
    /// Document-level create/replace semantics
    pub store_semantics: StoreSemantics,
    /// Durability requirement for this write
    pub durability: DurabilityLevel,
}

impl MutateOptions {
    /// Set the CAS guard.
    pub fn cas(mut self, cas: Cas) -> Self {
        self.cas = cas;
        self
    }

    /// Operate on tombstoned documents as well.
    pub fn access_deleted(mut self, v: bool) -> Self {
        self.access_deleted = v;
        self
    }

    /// When creating the document, create it as a tombstone.
    pub fn create_as_deleted(mut self, v: bool) -> Self {
        self.create_as_deleted = v;
        self
    }

    /// Set the document-level store semantics.
    pub fn store_semantics(mut self, s: StoreSemantics) -> Self {
        self.store_semantics = s;
        self
    }

    /// Set the durability requirement.
    pub fn durability(mut self, d: DurabilityLevel) -> Self {
        self.durability = d;
        self
    }
}
