//! The per-document transaction link: the decoded `txn` xattr.
//!
//! A staged document carries the location of its owning ATR, the ids of
//! the transaction and attempt that staged it, the staged operation,
//! and the pre-transaction identity used during conflict resolution.

use keystone_kv::{Cas, KeyspaceRef, LookupResult};
use serde_json::Value;

/// Lookup spec order used by [`TransactionLinks::from_lookup`]. Every
/// read of a potentially-staged document fetches exactly these paths.
pub mod lookup_index {
    /// `txn.atr.id`
    pub const ATR_ID: usize = 0;
    /// `txn.id.txn`
    pub const TXN_ID: usize = 1;
    /// `txn.id.atmpt`
    pub const ATTEMPT_ID: usize = 2;
    /// `txn.op.stgd`
    pub const STAGED_DATA: usize = 3;
    /// `txn.atr.bkt`
    pub const ATR_BUCKET: usize = 4;
    /// `txn.atr.scp`
    pub const ATR_SCOPE: usize = 5;
    /// `txn.atr.coll`
    pub const ATR_COLLECTION: usize = 6;
    /// `txn.op.type`
    pub const OP_TYPE: usize = 7;
    /// `txn.op.crc32`
    pub const CRC32_OF_STAGING: usize = 8;
    /// `txn.restore`
    pub const RESTORE: usize = 9;
    /// `txn.fc`
    pub const FORWARD_COMPAT: usize = 10;
    /// `$document`
    pub const DOCUMENT_META: usize = 11;
    /// full body
    pub const FULL_DOC: usize = 12;
    /// Number of specs in the standard staged-document lookup.
    pub const COUNT: usize = 13;
}

/// Decoded `txn` xattr of one document.
#[derive(Debug, Clone, Default)]
pub struct TransactionLinks {
    /// Owning ATR document id
    pub atr_id: Option<String>,
    /// Owning ATR bucket
    pub atr_bucket: Option<String>,
    /// Owning ATR scope
    pub atr_scope: Option<String>,
    /// Owning ATR collection
    pub atr_collection: Option<String>,
    /// Transaction that staged this document
    pub staged_transaction_id: Option<String>,
    /// Attempt that staged this document
    pub staged_attempt_id: Option<String>,
    /// Staged content (absent for removes)
    pub staged_content: Option<Value>,
    /// Staged operation kind: `insert` | `replace` | `remove`
    pub op: Option<String>,
    /// Body CRC at stage time
    pub crc32_of_staging: Option<u64>,
    /// Pre-transaction CAS
    pub restore_cas: Option<Cas>,
    /// Pre-transaction revision
    pub restore_revid: Option<u64>,
    /// Pre-transaction expiry
    pub restore_exptime: Option<u64>,
    /// Forward-compatibility hints
    pub forward_compat: Option<Value>,
    /// Whether the staged document is a tombstone
    pub is_deleted: bool,
}

impl TransactionLinks {
    /// Decode the links from a standard staged-document lookup (see
    /// [`lookup_index`]).
    pub fn from_lookup(res: &LookupResult) -> Self {
        let restore = res.entry(lookup_index::RESTORE);
        Self {
            atr_id: string_entry(res, lookup_index::ATR_ID),
            atr_bucket: string_entry(res, lookup_index::ATR_BUCKET),
            atr_scope: string_entry(res, lookup_index::ATR_SCOPE),
            atr_collection: string_entry(res, lookup_index::ATR_COLLECTION),
            staged_transaction_id: string_entry(res, lookup_index::TXN_ID),
            staged_attempt_id: string_entry(res, lookup_index::ATTEMPT_ID),
            staged_content: res.entry(lookup_index::STAGED_DATA).cloned(),
            op: string_entry(res, lookup_index::OP_TYPE),
            crc32_of_staging: res
                .entry(lookup_index::CRC32_OF_STAGING)
                .and_then(Value::as_u64),
            restore_cas: restore.and_then(|r| r.get("CAS")).and_then(Value::as_u64),
            restore_revid: restore.and_then(|r| r.get("revid")).and_then(Value::as_u64),
            restore_exptime: restore
                .and_then(|r| r.get("exptime"))
                .and_then(Value::as_u64),
            forward_compat: res.entry(lookup_index::FORWARD_COMPAT).cloned(),
            is_deleted: res.is_deleted,
        }
    }

    /// Whether the document carries any transaction metadata at all.
    pub fn is_document_in_transaction(&self) -> bool {
        self.atr_id.is_some()
    }

    /// Whether the document has a staged write (any op recorded).
    pub fn has_staged_write(&self) -> bool {
        self.staged_attempt_id.is_some()
    }

    /// Whether the staged operation is a remove.
    pub fn is_document_being_removed(&self) -> bool {
        self.op.as_deref() == Some("remove")
    }

    /// Whether staged content is present (inserts and replaces).
    pub fn has_staged_content(&self) -> bool {
        self.staged_content.is_some()
    }

    /// Keyspace of the owning ATR, when all three parts are present.
    pub fn atr_keyspace(&self) -> Option<KeyspaceRef> {
        Some(KeyspaceRef::new(
            self.atr_bucket.clone()?,
            self.atr_scope.clone()?,
            self.atr_collection.clone()?,
        ))
    }
}

fn string_entry(res: &LookupResult, idx: usize) -> Option<String> {
    res.entry(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lookup_with(entries: Vec<Option<Value>>) -> LookupResult {
        LookupResult {
            cas: 42,
            is_deleted: false,
            entries,
        }
    }

    #[test]
    fn test_absent_xattr_is_not_in_transaction() {
        let mut entries = vec![None; lookup_index::COUNT];
        entries[lookup_index::FULL_DOC] = Some(json!({"a": 1}));
        let links = TransactionLinks::from_lookup(&lookup_with(entries));
        assert!(!links.is_document_in_transaction());
        assert!(!links.has_staged_write());
    }

    #[test]
    fn test_staged_remove_decode() {
        let mut entries = vec![None; lookup_index::COUNT];
        entries[lookup_index::ATR_ID] = Some(json!("_txn:atr-3-#3"));
        entries[lookup_index::ATR_BUCKET] = Some(json!("b"));
        entries[lookup_index::ATR_SCOPE] = Some(json!("_default"));
        entries[lookup_index::ATR_COLLECTION] = Some(json!("_default"));
        entries[lookup_index::TXN_ID] = Some(json!("t1"));
        entries[lookup_index::ATTEMPT_ID] = Some(json!("a1"));
        entries[lookup_index::OP_TYPE] = Some(json!("remove"));
        entries[lookup_index::RESTORE] =
            Some(json!({"CAS": 7u64, "revid": 3u64, "exptime": 0u64}));
        let links = TransactionLinks::from_lookup(&lookup_with(entries));
        assert!(links.is_document_in_transaction());
        assert!(links.is_document_being_removed());
        assert!(!links.has_staged_content());
        assert_eq!(links.restore_cas, Some(7));
        assert_eq!(
            links.atr_keyspace().unwrap(),
            KeyspaceRef::default_collection("b")
        );
    }
}
