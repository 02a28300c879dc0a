//! Document views handed to the application and threaded through the
//! engine: metadata snapshots and transactional get-results.

use crate::fields;
use crate::links::{lookup_index, TransactionLinks};
use keystone_kv::{
    Cas, KeyspaceRef, KvError, KvResult, KvStore, LookupOptions, LookupResult, LookupSpec,
};
use serde_json::Value;

/// Snapshot of the `$document` virtual attribute at read time.
#[derive(Debug, Clone, Default)]
pub struct DocumentMetadata {
    /// CAS at read time
    pub cas: Option<Cas>,
    /// Revision id at read time
    pub revid: Option<u64>,
    /// Expiry at read time
    pub exptime: Option<u64>,
    /// Body CRC at read time
    pub crc32: Option<u64>,
}

impl DocumentMetadata {
    /// Decode from the `$document` lookup value.
    pub fn from_value(v: &Value) -> Self {
        Self {
            cas: v.get("CAS").and_then(Value::as_u64),
            revid: v.get("revid").and_then(Value::as_u64),
            exptime: v.get("exptime").and_then(Value::as_u64),
            crc32: v.get("value_crc32c").and_then(Value::as_u64),
        }
    }
}

/// A document as seen from inside a transaction.
///
/// Carries the content the attempt should observe (which may be staged
/// content rather than the visible body), the CAS to use for subsequent
/// CAS-guarded writes, and the decoded transaction links.
#[derive(Debug, Clone)]
pub struct TransactionGetResult {
    id: String,
    keyspace: KeyspaceRef,
    content: Value,
    cas: Cas,
    links: TransactionLinks,
    metadata: Option<DocumentMetadata>,
}

impl TransactionGetResult {
    /// Assemble a get-result.
    pub(crate) fn new(
        keyspace: KeyspaceRef,
        id: impl Into<String>,
        content: Value,
        cas: Cas,
        links: TransactionLinks,
        metadata: Option<DocumentMetadata>,
    ) -> Self {
        Self {
            id: id.into(),
            keyspace,
            content,
            cas,
            links,
            metadata,
        }
    }

    /// Build from a standard staged-document lookup, overriding the
    /// observed content where staging demands it.
    pub(crate) fn from_lookup(
        keyspace: &KeyspaceRef,
        id: &str,
        res: &LookupResult,
        content: Value,
    ) -> Self {
        let links = TransactionLinks::from_lookup(res);
        let metadata = res
            .entry(lookup_index::DOCUMENT_META)
            .map(DocumentMetadata::from_value);
        Self::new(keyspace.clone(), id, content, res.cas, links, metadata)
    }

    /// Document id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Collection holding the document.
    pub fn keyspace(&self) -> &KeyspaceRef {
        &self.keyspace
    }

    /// The content this attempt observes.
    pub fn content(&self) -> &Value {
        &self.content
    }

    /// Deserialize the observed content.
    pub fn content_as<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.content.clone())
    }

    /// CAS to carry into a replace/remove of this document.
    pub fn cas(&self) -> Cas {
        self.cas
    }

    pub(crate) fn set_cas(&mut self, cas: Cas) {
        self.cas = cas;
    }

    pub(crate) fn set_content(&mut self, content: Value) {
        self.content = content;
    }

    /// Decoded transaction links.
    pub fn links(&self) -> &TransactionLinks {
        &self.links
    }

    /// Metadata snapshot from read time.
    pub fn metadata(&self) -> Option<&DocumentMetadata> {
        self.metadata.as_ref()
    }
}

/// The standard staged-document lookup, in [`lookup_index`] order.
pub(crate) fn standard_lookup_specs() -> Vec<LookupSpec> {
    vec![
        LookupSpec::get(fields::ATR_ID).xattr(),
        LookupSpec::get(fields::TXN_ID).xattr(),
        LookupSpec::get(fields::ATTEMPT_ID).xattr(),
        LookupSpec::get(fields::STAGED_DATA).xattr(),
        LookupSpec::get(fields::ATR_BUCKET).xattr(),
        LookupSpec::get(fields::ATR_SCOPE).xattr(),
        LookupSpec::get(fields::ATR_COLLECTION).xattr(),
        LookupSpec::get(fields::OP_TYPE).xattr(),
        LookupSpec::get(fields::CRC32_OF_STAGING).xattr(),
        LookupSpec::get(fields::RESTORE_PREFIX).xattr(),
        LookupSpec::get(fields::FORWARD_COMPAT).xattr(),
        LookupSpec::get("$document").xattr(),
        LookupSpec::full_doc(),
    ]
}

/// Fetch a document with its transaction links, tombstones included.
///
/// `Ok(None)` when the document does not exist at all. The returned
/// content is the visible body (`Null` for tombstones); staged content
/// is available via the links.
pub(crate) fn fetch_doc(
    kv: &dyn KvStore,
    keyspace: &KeyspaceRef,
    id: &str,
) -> KvResult<Option<(TransactionGetResult, LookupResult)>> {
    let res = match kv.lookup_in(
        keyspace,
        id,
        &standard_lookup_specs(),
        LookupOptions::default().access_deleted(true),
    ) {
        Ok(res) => res,
        Err(KvError::DocumentNotFound) => return Ok(None),
        Err(e) => return Err(e),
    };
    let body = res
        .entry(lookup_index::FULL_DOC)
        .cloned()
        .unwrap_or(Value::Null);
    let doc = TransactionGetResult::from_lookup(keyspace, id, &res, body);
    Ok(Some((doc, res)))
}
