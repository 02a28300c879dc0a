//! Active Transaction Records: id derivation, entry decoding, and the
//! CAS-timestamped mutations that advance an attempt's durable state.
//!
//! One ATR document carries a map `attempts: { attempt_id → entry }`.
//! Every client derives the same ATR id for a given document key, so a
//! cleanup scanner on any client finds attempts written by any other.

use crate::fields;
use crate::state::AttemptState;
use keystone_kv::{
    Cas, DurabilityLevel, KeyspaceRef, KvError, KvResult, KvStore, LookupOptions, LookupSpec,
    Macro, MutateOptions, MutateSpec, MutateValue, StoreSemantics,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// Number of ATR documents per bucket.
pub const NUM_ATRS: u32 = 1024;

/// Key → vbucket derivation: CRC32 of the key, bits 16..30, modulo the
/// vbucket count. Must be identical on every client.
pub fn vbucket_for_key(key: &str) -> u32 {
    ((crc32fast::hash(key.as_bytes()) >> 16) & 0x7fff) % NUM_ATRS
}

/// The ATR id anchored to a vbucket.
pub fn atr_id_for_vbucket(vbucket: u32) -> String {
    format!("_txn:atr-{}-#{:x}", vbucket, vbucket)
}

/// The ATR id a mutation of `key` anchors to.
pub fn atr_id_for_key(key: &str) -> String {
    atr_id_for_vbucket(vbucket_for_key(key))
}

/// All ATR ids of a bucket, in vbucket order.
pub fn all_atr_ids() -> impl Iterator<Item = String> {
    (0..NUM_ATRS).map(atr_id_for_vbucket)
}

/// Location of one document named by an ATR entry's `ins`/`rep`/`rem`
/// arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocRecord {
    /// Collection holding the document
    pub keyspace: KeyspaceRef,
    /// Document id
    pub id: String,
}

impl DocRecord {
    /// Record for a document.
    pub fn new(keyspace: KeyspaceRef, id: impl Into<String>) -> Self {
        Self {
            keyspace,
            id: id.into(),
        }
    }

    /// Encode for the ATR array.
    pub fn to_value(&self) -> Value {
        json!({
            fields::ATR_FIELD_PER_DOC_ID: self.id,
            fields::ATR_FIELD_PER_DOC_BUCKET: self.keyspace.bucket,
            fields::ATR_FIELD_PER_DOC_SCOPE: self.keyspace.scope,
            fields::ATR_FIELD_PER_DOC_COLLECTION: self.keyspace.collection,
        })
    }

    /// Decode from an ATR array element.
    pub fn from_value(v: &Value) -> Option<Self> {
        Some(Self {
            keyspace: KeyspaceRef::new(
                v.get(fields::ATR_FIELD_PER_DOC_BUCKET)?.as_str()?,
                v.get(fields::ATR_FIELD_PER_DOC_SCOPE)?.as_str()?,
                v.get(fields::ATR_FIELD_PER_DOC_COLLECTION)?.as_str()?,
            ),
            id: v.get(fields::ATR_FIELD_PER_DOC_ID)?.as_str()?.to_string(),
        })
    }
}

/// One decoded attempt entry of an ATR.
#[derive(Debug, Clone)]
pub struct AtrEntry {
    /// Attempt id (the map key)
    pub attempt_id: String,
    /// Transaction id recorded at `set_pending`
    pub transaction_id: Option<String>,
    /// Durable state
    pub state: AttemptState,
    /// Start timestamp, ms (CAS-derived)
    pub timestamp_start_ms: Option<u64>,
    /// Commit-start timestamp, ms
    pub timestamp_commit_ms: Option<u64>,
    /// Expiry window in ms from start
    pub expires_after_ms: Option<u64>,
    /// Documents staged for insert
    pub inserted: Vec<DocRecord>,
    /// Documents staged for replace
    pub replaced: Vec<DocRecord>,
    /// Documents staged for remove
    pub removed: Vec<DocRecord>,
    /// Forward-compatibility hints
    pub forward_compat: Option<Value>,
}

impl AtrEntry {
    /// Decode one entry of the `attempts` map.
    pub fn from_value(attempt_id: &str, v: &Value) -> Self {
        Self {
            attempt_id: attempt_id.to_string(),
            transaction_id: v
                .get(fields::ATR_FIELD_TRANSACTION_ID)
                .and_then(Value::as_str)
                .map(str::to_string),
            state: v
                .get(fields::ATR_FIELD_STATUS)
                .and_then(Value::as_str)
                .map(AttemptState::parse)
                .unwrap_or(AttemptState::NotStarted),
            timestamp_start_ms: cas_field_ms(v, fields::ATR_FIELD_START_TIMESTAMP),
            timestamp_commit_ms: cas_field_ms(v, fields::ATR_FIELD_START_COMMIT),
            expires_after_ms: v
                .get(fields::ATR_FIELD_EXPIRES_AFTER_MS)
                .and_then(Value::as_u64),
            inserted: doc_records(v, fields::ATR_FIELD_DOCS_INSERTED),
            replaced: doc_records(v, fields::ATR_FIELD_DOCS_REPLACED),
            removed: doc_records(v, fields::ATR_FIELD_DOCS_REMOVED),
            forward_compat: v.get(fields::ATR_FIELD_FORWARD_COMPAT).cloned(),
        }
    }

    /// Whether the attempt's expiry window (plus `safety_margin_ms`)
    /// has elapsed at server time `now_ms`.
    pub fn has_expired(&self, now_ms: u64, safety_margin_ms: u64) -> bool {
        match (self.timestamp_start_ms, self.expires_after_ms) {
            (Some(tst), Some(exp)) => now_ms > tst + exp + safety_margin_ms,
            // An entry without a readable start time cannot be aged
            _ => false,
        }
    }

    /// Age of the attempt at server time `now_ms`.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp_start_ms.unwrap_or(now_ms))
    }
}

/// CAS-macro timestamp fields land as nanosecond numbers; expose ms.
fn cas_field_ms(v: &Value, field: &str) -> Option<u64> {
    v.get(field).and_then(Value::as_u64).map(|ns| ns / 1_000_000)
}

fn doc_records(v: &Value, field: &str) -> Vec<DocRecord> {
    v.get(field)
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(DocRecord::from_value).collect())
        .unwrap_or_default()
}

/// A fetched ATR document.
#[derive(Debug, Clone)]
pub struct ActiveTransactionRecord {
    /// ATR document id
    pub id: String,
    /// CAS of the ATR document at fetch time
    pub cas: Cas,
    /// Server time at fetch, ms
    pub now_ms: u64,
    /// Decoded attempt entries
    pub entries: Vec<AtrEntry>,
}

impl ActiveTransactionRecord {
    /// Fetch and decode an ATR. `Ok(None)` when the document does not
    /// exist.
    pub fn fetch(
        kv: &dyn KvStore,
        keyspace: &KeyspaceRef,
        atr_id: &str,
    ) -> KvResult<Option<Self>> {
        let res = match kv.lookup_in(
            keyspace,
            atr_id,
            &[
                LookupSpec::get(fields::ATR_FIELD_ATTEMPTS),
                LookupSpec::get("$vbucket.HLC").xattr(),
            ],
            LookupOptions::default(),
        ) {
            Ok(res) => res,
            Err(KvError::DocumentNotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        let now_ms = res
            .entry(1)
            .and_then(|hlc| hlc.get("now"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<u64>().ok())
            .map(|secs| secs * 1000)
            .unwrap_or(0);
        let entries = res
            .entry(0)
            .and_then(Value::as_object)
            .map(|attempts| {
                attempts
                    .iter()
                    .map(|(id, v)| AtrEntry::from_value(id, v))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some(Self {
            id: atr_id.to_string(),
            cas: res.cas,
            now_ms,
            entries,
        }))
    }

    /// The entry for one attempt, if present.
    pub fn entry(&self, attempt_id: &str) -> Option<&AtrEntry> {
        self.entries.iter().find(|e| e.attempt_id == attempt_id)
    }
}

/// Writer for one attempt's entry in one ATR document.
///
/// All mutations carry server timestamps via CAS macros; the client
/// clock is never written.
pub struct AtrManager {
    kv: Arc<dyn KvStore>,
    keyspace: KeyspaceRef,
    atr_id: String,
    durability: DurabilityLevel,
}

impl AtrManager {
    /// Writer for `atr_id` in `keyspace`.
    pub fn new(
        kv: Arc<dyn KvStore>,
        keyspace: KeyspaceRef,
        atr_id: impl Into<String>,
        durability: DurabilityLevel,
    ) -> Self {
        Self {
            kv,
            keyspace,
            atr_id: atr_id.into(),
            durability,
        }
    }

    /// The ATR document id this writer targets.
    pub fn atr_id(&self) -> &str {
        &self.atr_id
    }

    /// Collection holding the ATR.
    pub fn keyspace(&self) -> &KeyspaceRef {
        &self.keyspace
    }

    fn entry_path(&self, attempt_id: &str, field: &str) -> String {
        format!("{}.{}.{}", fields::ATR_FIELD_ATTEMPTS, attempt_id, field)
    }

    /// Create the attempt entry in `PENDING`.
    ///
    /// Returns `Err(PathExists)` only when the entry already exists
    /// under a different transaction id; re-creating our own entry
    /// (ambiguous first write) is treated as success.
    pub fn set_pending(
        &self,
        attempt_id: &str,
        transaction_id: &str,
        expires_after_ms: u64,
    ) -> KvResult<()> {
        let specs = [
            MutateSpec::insert(self.entry_path(attempt_id, fields::ATR_FIELD_TRANSACTION_ID), json!(transaction_id))
                .create_path(),
            MutateSpec::insert(
                self.entry_path(attempt_id, fields::ATR_FIELD_STATUS),
                json!(AttemptState::Pending.as_str()),
            )
            .create_path(),
            MutateSpec::insert(
                self.entry_path(attempt_id, fields::ATR_FIELD_START_TIMESTAMP),
                MutateValue::Expand(Macro::Cas),
            )
            .create_path(),
            MutateSpec::insert(
                self.entry_path(attempt_id, fields::ATR_FIELD_EXPIRES_AFTER_MS),
                json!(expires_after_ms),
            )
            .create_path(),
        ];
        match self.kv.mutate_in(
            &self.keyspace,
            &self.atr_id,
            &specs,
            MutateOptions::default()
                .store_semantics(StoreSemantics::Upsert)
                .durability(self.durability),
        ) {
            Ok(_) => Ok(()),
            Err(KvError::PathExists(p)) => {
                // Entry exists: ours (ambiguous retry) or a colliding id
                match self.read_entry(attempt_id)? {
                    Some(entry) if entry.transaction_id.as_deref() == Some(transaction_id) => {
                        Ok(())
                    }
                    _ => Err(KvError::PathExists(p)),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Append a doc-record to the entry's `ins`/`rep`/`rem` array.
    pub fn append_doc_record(
        &self,
        attempt_id: &str,
        array_field: &str,
        record: &DocRecord,
    ) -> KvResult<()> {
        self.kv
            .mutate_in(
                &self.keyspace,
                &self.atr_id,
                &[MutateSpec::array_append(
                    self.entry_path(attempt_id, array_field),
                    record.to_value(),
                )
                .create_path()],
                MutateOptions::default().durability(self.durability),
            )
            .map(|_| ())
    }

    /// Advance the durable state, writing the matching timestamp field.
    ///
    /// Illegal transitions are rejected locally before any write.
    pub fn set_state(
        &self,
        attempt_id: &str,
        from: AttemptState,
        to: AttemptState,
    ) -> KvResult<Cas> {
        if !from.can_transition_to(to) {
            return Err(KvError::Invalid(format!(
                "illegal attempt state transition {} -> {}",
                from, to
            )));
        }
        let ts_field = match to {
            AttemptState::Committed => fields::ATR_FIELD_START_COMMIT,
            AttemptState::Completed => fields::ATR_FIELD_TIMESTAMP_COMPLETE,
            AttemptState::Aborted => fields::ATR_FIELD_TIMESTAMP_ROLLBACK_START,
            AttemptState::RolledBack => fields::ATR_FIELD_TIMESTAMP_ROLLBACK_COMPLETE,
            _ => unreachable!("transition table only admits durable states"),
        };
        let specs = [
            MutateSpec::upsert(
                self.entry_path(attempt_id, fields::ATR_FIELD_STATUS),
                json!(to.as_str()),
            ),
            MutateSpec::upsert(
                self.entry_path(attempt_id, ts_field),
                MutateValue::Expand(Macro::Cas),
            ),
        ];
        self.kv
            .mutate_in(
                &self.keyspace,
                &self.atr_id,
                &specs,
                MutateOptions::default().durability(self.durability),
            )
            .map(|r| r.cas)
    }

    /// Read back one attempt entry. `Ok(None)` when the ATR or the
    /// entry is absent.
    pub fn read_entry(&self, attempt_id: &str) -> KvResult<Option<AtrEntry>> {
        let atr = ActiveTransactionRecord::fetch(self.kv.as_ref(), &self.keyspace, &self.atr_id)?;
        Ok(atr.and_then(|atr| atr.entry(attempt_id).cloned()))
    }

    /// Remove the attempt entry entirely (after COMPLETED/ROLLED_BACK).
    pub fn remove_entry(&self, attempt_id: &str) -> KvResult<()> {
        let path = format!("{}.{}", fields::ATR_FIELD_ATTEMPTS, attempt_id);
        self.kv
            .mutate_in(
                &self.keyspace,
                &self.atr_id,
                &[
                    MutateSpec::upsert(path.clone(), Value::Null),
                    MutateSpec::remove(path),
                ],
                MutateOptions::default().durability(self.durability),
            )
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_kv::mem::MemCluster;

    #[test]
    fn test_vbucket_derivation_is_stable() {
        // Same key, same vbucket, every time and everywhere
        let a = vbucket_for_key("user::1234");
        assert_eq!(a, vbucket_for_key("user::1234"));
        assert!(a < NUM_ATRS);
        assert_eq!(atr_id_for_key("user::1234"), atr_id_for_vbucket(a));
    }

    #[test]
    fn test_all_atr_ids_enumerates_1024() {
        let ids: Vec<String> = all_atr_ids().collect();
        assert_eq!(ids.len(), NUM_ATRS as usize);
        assert_eq!(ids[0], "_txn:atr-0-#0");
        assert_eq!(ids[1023], "_txn:atr-1023-#3ff");
        // Every derived id is in the enumerated set
        assert!(ids.contains(&atr_id_for_key("any-key")));
    }

    #[test]
    fn test_set_pending_and_read_entry() {
        let kv = Arc::new(MemCluster::new());
        let ks = KeyspaceRef::default_collection("b");
        let mgr = AtrManager::new(kv, ks, "_txn:atr-0-#0", DurabilityLevel::None);
        mgr.set_pending("attempt-1", "txn-1", 15_000).unwrap();
        let entry = mgr.read_entry("attempt-1").unwrap().unwrap();
        assert_eq!(entry.state, AttemptState::Pending);
        assert_eq!(entry.transaction_id.as_deref(), Some("txn-1"));
        assert_eq!(entry.expires_after_ms, Some(15_000));
        assert!(entry.timestamp_start_ms.unwrap() > 0);
    }

    #[test]
    fn test_set_pending_conflict_on_foreign_txn() {
        let kv = Arc::new(MemCluster::new());
        let ks = KeyspaceRef::default_collection("b");
        let mgr = AtrManager::new(kv, ks, "_txn:atr-0-#0", DurabilityLevel::None);
        mgr.set_pending("attempt-1", "txn-1", 15_000).unwrap();
        // Same attempt id, same transaction: idempotent
        mgr.set_pending("attempt-1", "txn-1", 15_000).unwrap();
        // Same attempt id, different transaction: conflict
        let err = mgr.set_pending("attempt-1", "txn-2", 15_000).unwrap_err();
        assert!(matches!(err, KvError::PathExists(_)));
    }

    #[test]
    fn test_state_transitions_guarded() {
        let kv = Arc::new(MemCluster::new());
        let ks = KeyspaceRef::default_collection("b");
        let mgr = AtrManager::new(kv, ks, "_txn:atr-0-#0", DurabilityLevel::None);
        mgr.set_pending("a1", "t1", 15_000).unwrap();

        let err = mgr
            .set_state("a1", AttemptState::Committed, AttemptState::Aborted)
            .unwrap_err();
        assert!(matches!(err, KvError::Invalid(_)));

        mgr.set_state("a1", AttemptState::Pending, AttemptState::Committed)
            .unwrap();
        let entry = mgr.read_entry("a1").unwrap().unwrap();
        assert_eq!(entry.state, AttemptState::Committed);
        assert!(entry.timestamp_commit_ms.unwrap() > 0);

        mgr.set_state("a1", AttemptState::Committed, AttemptState::Completed)
            .unwrap();
        mgr.remove_entry("a1").unwrap();
        assert!(mgr.read_entry("a1").unwrap().is_none());
    }

    #[test]
    fn test_append_doc_record() {
        let kv = Arc::new(MemCluster::new());
        let ks = KeyspaceRef::default_collection("b");
        let mgr = AtrManager::new(kv, ks.clone(), "_txn:atr-0-#0", DurabilityLevel::None);
        mgr.set_pending("a1", "t1", 15_000).unwrap();
        let rec = DocRecord::new(ks, "doc-1");
        mgr.append_doc_record("a1", fields::ATR_FIELD_DOCS_REPLACED, &rec)
            .unwrap();
        mgr.append_doc_record("a1", fields::ATR_FIELD_DOCS_REPLACED, &rec)
            .unwrap();
        let entry = mgr.read_entry("a1").unwrap().unwrap();
        assert_eq!(entry.replaced.len(), 2);
        assert_eq!(entry.replaced[0], DocRecord::new(KeyspaceRef::default_collection("b"), "doc-1"));
        assert!(entry.inserted.is_empty());
    }
}
