//! In-memory document store.
//!
//! A complete [`KvStore`] implementation backed by a [`DashMap`]:
//! per-document CAS, xattr region, tombstones, the `$document` and
//! `$vbucket` virtual attributes, and server-side macro expansion. CAS
//! values are drawn from a process-wide monotonic nanosecond clock, so
//! they double as the HLC the transaction engine reads for server time.
//!
//! A pluggable fault hook lets tests fail (or apply-then-fail) chosen
//! operations, standing in for the network and node failures a real
//! cluster produces.

use crate::error::{KvError, KvResult};
use crate::store::{GetResult, KvStore, LookupResult, MutateResult};
use crate::subdoc::{
    LookupOptions, LookupSpec, Macro, MutateKind, MutateOptions, MutateSpec, MutateValue,
    VATTR_DOCUMENT, VATTR_VBUCKET,
};
use crate::types::{Cas, DurabilityLevel, KeyspaceRef, StoreSemantics};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Where a fault hook is consulted.
#[derive(Debug)]
pub struct FaultPoint<'a> {
    /// Operation name: `get`, `insert`, `replace`, `remove`, `exists`,
    /// `lookup_in`, `mutate_in`
    pub op: &'a str,
    /// Target keyspace
    pub keyspace: &'a KeyspaceRef,
    /// Target document id
    pub id: &'a str,
}

/// What a fault hook asks the store to do.
pub enum FaultAction {
    /// Return the error without applying the operation.
    Fail(KvError),
    /// Apply the operation, then return the error anyway — simulates an
    /// ambiguous outcome (applied but unacknowledged).
    FailAfterApply(KvError),
}

type FaultHook = dyn Fn(&FaultPoint<'_>) -> Option<FaultAction> + Send + Sync;

#[derive(Debug, Clone)]
struct MemDoc {
    body: Value,
    xattrs: Value,
    cas: Cas,
    revid: u64,
    deleted: bool,
}

impl MemDoc {
    fn crc32(&self) -> u32 {
        let bytes = serde_json::to_vec(&self.body).unwrap_or_default();
        crc32fast::hash(&bytes)
    }
}

/// In-memory cluster of buckets/scopes/collections.
pub struct MemCluster {
    docs: DashMap<(KeyspaceRef, String), MemDoc>,
    hlc: AtomicU64,
    fault: RwLock<Option<Arc<FaultHook>>>,
}

impl Default for MemCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        Self {
            docs: DashMap::new(),
            hlc: AtomicU64::new(now_ns),
            fault: RwLock::new(None),
        }
    }

    /// Install a fault hook consulted before every operation.
    pub fn set_fault_hook<F>(&self, hook: F)
    where
        F: Fn(&FaultPoint<'_>) -> Option<FaultAction> + Send + Sync + 'static,
    {
        *self.fault.write() = Some(Arc::new(hook));
    }

    /// Remove the installed fault hook.
    pub fn clear_fault_hook(&self) {
        *self.fault.write() = None;
    }

    /// Current server time in nanoseconds; every call advances it.
    pub fn now_ns(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        // Monotonic even if the wall clock stalls within one ns tick
        self.hlc
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(prev.max(wall).saturating_add(1))
            })
            .map(|prev| prev.max(wall).saturating_add(1))
            .unwrap_or(wall)
    }

    /// Upsert a live document directly, outside any transaction.
    /// Returns the new CAS. Test convenience.
    pub fn upsert_raw(&self, keyspace: &KeyspaceRef, id: &str, body: Value) -> Cas {
        let cas = self.now_ns();
        let key = (keyspace.clone(), id.to_string());
        let mut entry = self.docs.entry(key).or_insert_with(|| MemDoc {
            body: Value::Null,
            xattrs: json!({}),
            cas: 0,
            revid: 0,
            deleted: false,
        });
        entry.body = body;
        entry.xattrs = json!({});
        entry.cas = cas;
        entry.revid += 1;
        entry.deleted = false;
        cas
    }

    /// Raw view of a document for assertions: `(body, xattrs, deleted)`.
    pub fn raw_doc(&self, keyspace: &KeyspaceRef, id: &str) -> Option<(Value, Value, bool)> {
        self.docs
            .get(&(keyspace.clone(), id.to_string()))
            .map(|d| (d.body.clone(), d.xattrs.clone(), d.deleted))
    }

    fn check_fault(&self, point: &FaultPoint<'_>) -> Option<FaultAction> {
        let hook = self.fault.read().clone();
        let action = hook.and_then(|h| (*h)(point));
        if action.is_some() {
            trace!(op = point.op, id = point.id, "fault hook fired");
        }
        action
    }

    fn virtual_attr(&self, doc: &MemDoc, path: &str) -> Option<Value> {
        let (root, rest) = match path.split_once('.') {
            Some((r, rest)) => (r, Some(rest)),
            None => (path, None),
        };
        let value = match root {
            VATTR_DOCUMENT => json!({
                "CAS": doc.cas,
                "revid": doc.revid,
                "exptime": 0,
                "value_crc32c": doc.crc32(),
            }),
            VATTR_VBUCKET => {
                let now_secs = self.now_ns() / 1_000_000_000;
                json!({ "HLC": { "now": now_secs.to_string() } })
            }
            _ => return None,
        };
        match rest {
            None => Some(value),
            Some(rest) => path_get(&value, rest).cloned(),
        }
    }
}

impl KvStore for MemCluster {
    fn get(&self, keyspace: &KeyspaceRef, id: &str) -> KvResult<GetResult> {
        if let Some(FaultAction::Fail(e)) | Some(FaultAction::FailAfterApply(e)) =
            self.check_fault(&FaultPoint { op: "get", keyspace, id })
        {
            return Err(e);
        }
        let doc = self
            .docs
            .get(&(keyspace.clone(), id.to_string()))
            .ok_or(KvError::DocumentNotFound)?;
        if doc.deleted {
            return Err(KvError::DocumentNotFound);
        }
        Ok(GetResult {
            body: doc.body.clone(),
            cas: doc.cas,
            is_deleted: false,
        })
    }

    fn insert(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        body: Value,
        _durability: DurabilityLevel,
    ) -> KvResult<Cas> {
        let fault = self.check_fault(&FaultPoint { op: "insert", keyspace, id });
        if let Some(FaultAction::Fail(e)) = fault {
            return Err(e);
        }
        let cas = self.now_ns();
        let key = (keyspace.clone(), id.to_string());
        {
            let mut entry = self.docs.entry(key).or_insert_with(|| MemDoc {
                body: Value::Null,
                xattrs: json!({}),
                cas: 0,
                revid: 0,
                deleted: true,
            });
            if !entry.deleted && entry.revid > 0 {
                return Err(KvError::DocumentExists);
            }
            // Insert over a tombstone replaces it and drops its xattrs
            entry.body = body;
            entry.xattrs = json!({});
            entry.cas = cas;
            entry.revid += 1;
            entry.deleted = false;
        }
        match fault {
            Some(FaultAction::FailAfterApply(e)) => Err(e),
            _ => Ok(cas),
        }
    }

    fn replace(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        body: Value,
        cas: Cas,
        _durability: DurabilityLevel,
    ) -> KvResult<Cas> {
        let fault = self.check_fault(&FaultPoint { op: "replace", keyspace, id });
        if let Some(FaultAction::Fail(e)) = fault {
            return Err(e);
        }
        let new_cas = self.now_ns();
        {
            let mut doc = self
                .docs
                .get_mut(&(keyspace.clone(), id.to_string()))
                .ok_or(KvError::DocumentNotFound)?;
            if doc.deleted {
                return Err(KvError::DocumentNotFound);
            }
            if cas != 0 && doc.cas != cas {
                return Err(KvError::CasMismatch);
            }
            doc.body = body;
            doc.cas = new_cas;
            doc.revid += 1;
        }
        match fault {
            Some(FaultAction::FailAfterApply(e)) => Err(e),
            _ => Ok(new_cas),
        }
    }

    fn remove(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        cas: Cas,
        _durability: DurabilityLevel,
    ) -> KvResult<()> {
        let fault = self.check_fault(&FaultPoint { op: "remove", keyspace, id });
        if let Some(FaultAction::Fail(e)) = fault {
            return Err(e);
        }
        {
            let mut doc = self
                .docs
                .get_mut(&(keyspace.clone(), id.to_string()))
                .ok_or(KvError::DocumentNotFound)?;
            if doc.deleted {
                return Err(KvError::DocumentNotFound);
            }
            if cas != 0 && doc.cas != cas {
                return Err(KvError::CasMismatch);
            }
            doc.body = Value::Null;
            doc.xattrs = json!({});
            doc.cas = self.now_ns();
            doc.revid += 1;
            doc.deleted = true;
        }
        match fault {
            Some(FaultAction::FailAfterApply(e)) => Err(e),
            _ => Ok(()),
        }
    }

    fn exists(&self, keyspace: &KeyspaceRef, id: &str) -> KvResult<bool> {
        if let Some(FaultAction::Fail(e)) | Some(FaultAction::FailAfterApply(e)) =
            self.check_fault(&FaultPoint { op: "exists", keyspace, id })
        {
            return Err(e);
        }
        Ok(self
            .docs
            .get(&(keyspace.clone(), id.to_string()))
            .map(|d| !d.deleted)
            .unwrap_or(false))
    }

    fn lookup_in(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        specs: &[LookupSpec],
        options: LookupOptions,
    ) -> KvResult<LookupResult> {
        if let Some(FaultAction::Fail(e)) | Some(FaultAction::FailAfterApply(e)) =
            self.check_fault(&FaultPoint { op: "lookup_in", keyspace, id })
        {
            return Err(e);
        }
        let doc = self
            .docs
            .get(&(keyspace.clone(), id.to_string()))
            .ok_or(KvError::DocumentNotFound)?;
        if doc.deleted && !options.access_deleted {
            return Err(KvError::DocumentNotFound);
        }
        let mut entries = Vec::with_capacity(specs.len());
        for spec in specs {
            let value = if spec.is_full_doc() {
                if doc.deleted {
                    None
                } else {
                    Some(doc.body.clone())
                }
            } else if spec.path.starts_with('$') {
                self.virtual_attr(&doc, &spec.path)
            } else if spec.xattr {
                path_get(&doc.xattrs, &spec.path).cloned()
            } else {
                path_get(&doc.body, &spec.path).cloned()
            };
            entries.push(value);
        }
        Ok(LookupResult {
            cas: doc.cas,
            is_deleted: doc.deleted,
            entries,
        })
    }

    fn mutate_in(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        specs: &[MutateSpec],
        options: MutateOptions,
    ) -> KvResult<MutateResult> {
        let fault = self.check_fault(&FaultPoint { op: "mutate_in", keyspace, id });
        if let Some(FaultAction::Fail(e)) = fault {
            return Err(e);
        }
        let new_cas = self.now_ns();
        let key = (keyspace.clone(), id.to_string());

        {
            // The dashmap entry holds the shard lock for the whole
            // batch, which is what makes CAS checks race-free.
            let entry = self.docs.entry(key);
            let visible = match &entry {
                Entry::Occupied(occ) => !occ.get().deleted || options.access_deleted,
                Entry::Vacant(_) => false,
            };

            let mut doc = if visible {
                let d = match &entry {
                    Entry::Occupied(occ) => occ.get().clone(),
                    Entry::Vacant(_) => unreachable!(),
                };
                if options.cas != 0 && d.cas != options.cas {
                    return Err(KvError::CasMismatch);
                }
                if options.cas == 0 && options.store_semantics == StoreSemantics::Insert {
                    return Err(KvError::DocumentExists);
                }
                d
            } else {
                if options.cas != 0 {
                    return Err(KvError::DocumentNotFound);
                }
                if options.store_semantics == StoreSemantics::Replace {
                    return Err(KvError::DocumentNotFound);
                }
                MemDoc {
                    body: Value::Null,
                    xattrs: json!({}),
                    cas: 0,
                    revid: 0,
                    deleted: options.create_as_deleted,
                }
            };

            // Apply specs in order; the whole batch is atomic, so any
            // path failure aborts before publication.
            let mut removed = false;
            let mut macros: Vec<(bool, String, Macro)> = Vec::new();
            for spec in specs {
                apply_spec(&mut doc, spec, &mut removed, &mut macros)?;
            }

            if removed {
                if let Entry::Occupied(occ) = entry {
                    occ.remove();
                }
            } else {
                doc.cas = new_cas;
                doc.revid += 1;
                let crc = doc.crc32();
                for (xattr, path, m) in macros {
                    let value = match m {
                        Macro::Cas => json!(new_cas),
                        Macro::ValueCrc32 => json!(crc),
                    };
                    let root = if xattr { &mut doc.xattrs } else { &mut doc.body };
                    path_set(root, &path, value, true, false)?;
                }
                match entry {
                    Entry::Occupied(mut occ) => {
                        *occ.get_mut() = doc;
                    }
                    Entry::Vacant(vac) => {
                        vac.insert(doc);
                    }
                }
            }
        }

        match fault {
            Some(FaultAction::FailAfterApply(e)) => Err(e),
            _ => Ok(MutateResult { cas: new_cas }),
        }
    }
}

fn apply_spec(
    doc: &mut MemDoc,
    spec: &MutateSpec,
    removed: &mut bool,
    macros: &mut Vec<(bool, String, Macro)>,
) -> KvResult<()> {
    match &spec.kind {
        MutateKind::FullDocUpsert(value) => {
            doc.body = value.clone();
            doc.deleted = false;
            Ok(())
        }
        MutateKind::FullDocRemove => {
            *removed = true;
            Ok(())
        }
        MutateKind::Insert(value) => {
            let value = literal_or_defer(value, spec, macros);
            let root = region(doc, spec);
            path_set(root, &spec.path, value, spec.create_path, true)
        }
        MutateKind::Upsert(value) => {
            let value = literal_or_defer(value, spec, macros);
            let root = region(doc, spec);
            path_set(root, &spec.path, value, spec.create_path, false)
        }
        MutateKind::Remove => {
            let root = region(doc, spec);
            path_remove(root, &spec.path)
        }
        MutateKind::ArrayAppend(value) => {
            let value = literal_or_defer(value, spec, macros);
            let root = region(doc, spec);
            array_append(root, &spec.path, value, spec.create_path)
        }
    }
}

fn region<'a>(doc: &'a mut MemDoc, spec: &MutateSpec) -> &'a mut Value {
    if spec.xattr {
        &mut doc.xattrs
    } else {
        &mut doc.body
    }
}

/// Macro values get a placeholder now and their final value once the
/// mutation CAS and body CRC are known.
fn literal_or_defer(
    value: &MutateValue,
    spec: &MutateSpec,
    macros: &mut Vec<(bool, String, Macro)>,
) -> Value {
    match value {
        MutateValue::Json(v) => v.clone(),
        MutateValue::Expand(m) => {
            macros.push((spec.xattr, spec.path.clone(), *m));
            Value::Null
        }
    }
}

// ---------------------------------------------------------------------
// Dotted-path navigation over serde_json values
// ---------------------------------------------------------------------

fn path_get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = root;
    for seg in path.split('.') {
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

fn path_set(
    root: &mut Value,
    path: &str,
    value: Value,
    create_path: bool,
    insert_only: bool,
) -> KvResult<()> {
    if root.is_null() {
        *root = json!({});
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut cur = root;
    for seg in &segments[..segments.len() - 1] {
        let obj = cur
            .as_object_mut()
            .ok_or_else(|| KvError::PathNotFound(path.to_string()))?;
        if !obj.contains_key(*seg) {
            if !create_path {
                return Err(KvError::PathNotFound(path.to_string()));
            }
            obj.insert(seg.to_string(), json!({}));
        }
        cur = obj.get_mut(*seg).unwrap();
    }
    let last = segments[segments.len() - 1];
    let obj = cur
        .as_object_mut()
        .ok_or_else(|| KvError::PathNotFound(path.to_string()))?;
    if insert_only && obj.contains_key(last) {
        return Err(KvError::PathExists(path.to_string()));
    }
    obj.insert(last.to_string(), value);
    Ok(())
}

fn path_remove(root: &mut Value, path: &str) -> KvResult<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut cur = root;
    for seg in &segments[..segments.len() - 1] {
        cur = cur
            .as_object_mut()
            .and_then(|o| o.get_mut(*seg))
            .ok_or_else(|| KvError::PathNotFound(path.to_string()))?;
    }
    let last = segments[segments.len() - 1];
    cur.as_object_mut()
        .and_then(|o| o.remove(last))
        .map(|_| ())
        .ok_or_else(|| KvError::PathNotFound(path.to_string()))
}

fn array_append(root: &mut Value, path: &str, value: Value, create_path: bool) -> KvResult<()> {
    if path_get(root, path).is_none() {
        if !create_path {
            return Err(KvError::PathNotFound(path.to_string()));
        }
        path_set(root, path, json!([]), true, false)?;
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut cur = &mut *root;
    for seg in &segments {
        cur = cur
            .as_object_mut()
            .and_then(|o| o.get_mut(*seg))
            .ok_or_else(|| KvError::PathNotFound(path.to_string()))?;
    }
    cur.as_array_mut()
        .ok_or_else(|| KvError::PathNotFound(path.to_string()))?
        .push(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ks() -> KeyspaceRef {
        KeyspaceRef::default_collection("test")
    }

    #[test]
    fn test_insert_get_roundtrip() {
        let store = MemCluster::new();
        let cas = store.insert(&ks(), "a", json!({"x": 1}), DurabilityLevel::None).unwrap();
        let got = store.get(&ks(), "a").unwrap();
        assert_eq!(got.body, json!({"x": 1}));
        assert_eq!(got.cas, cas);
    }

    #[test]
    fn test_insert_existing_fails() {
        let store = MemCluster::new();
        store.insert(&ks(), "a", json!(1), DurabilityLevel::None).unwrap();
        assert_eq!(
            store.insert(&ks(), "a", json!(2), DurabilityLevel::None),
            Err(KvError::DocumentExists)
        );
    }

    #[test]
    fn test_replace_cas_guard() {
        let store = MemCluster::new();
        let cas = store.insert(&ks(), "a", json!(1), DurabilityLevel::None).unwrap();
        assert_eq!(
            store.replace(&ks(), "a", json!(2), cas + 1, DurabilityLevel::None),
            Err(KvError::CasMismatch)
        );
        let cas2 = store.replace(&ks(), "a", json!(2), cas, DurabilityLevel::None).unwrap();
        assert!(cas2 > cas);
    }

    #[test]
    fn test_remove_leaves_tombstone() {
        let store = MemCluster::new();
        let cas = store.insert(&ks(), "a", json!(1), DurabilityLevel::None).unwrap();
        store.remove(&ks(), "a", cas, DurabilityLevel::None).unwrap();
        assert_eq!(store.get(&ks(), "a"), Err(KvError::DocumentNotFound));
        assert!(!store.exists(&ks(), "a").unwrap());
        let res = store
            .lookup_in(
                &ks(),
                "a",
                &[LookupSpec::full_doc()],
                LookupOptions::default().access_deleted(true),
            )
            .unwrap();
        assert!(res.is_deleted);
    }

    #[test]
    fn test_xattr_mutation_and_lookup() {
        let store = MemCluster::new();
        let cas = store.insert(&ks(), "a", json!({"v": 1}), DurabilityLevel::None).unwrap();
        store
            .mutate_in(
                &ks(),
                "a",
                &[MutateSpec::upsert("txn.id.txn", json!("t-1"))
                    .xattr()
                    .create_path()],
                MutateOptions::default().cas(cas),
            )
            .unwrap();
        let res = store
            .lookup_in(
                &ks(),
                "a",
                &[
                    LookupSpec::get("txn.id.txn").xattr(),
                    LookupSpec::get("txn.missing").xattr(),
                    LookupSpec::full_doc(),
                ],
                LookupOptions::default(),
            )
            .unwrap();
        assert_eq!(res.entry(0), Some(&json!("t-1")));
        assert_eq!(res.entry(1), None);
        assert_eq!(res.entry(2), Some(&json!({"v": 1})));
    }

    #[test]
    fn test_create_as_deleted_tombstone_insert() {
        let store = MemCluster::new();
        store
            .mutate_in(
                &ks(),
                "a",
                &[MutateSpec::upsert("txn.op.type", json!("insert"))
                    .xattr()
                    .create_path()],
                MutateOptions::default()
                    .store_semantics(StoreSemantics::Insert)
                    .create_as_deleted(true)
                    .access_deleted(true),
            )
            .unwrap();
        // Invisible to plain reads
        assert!(!store.exists(&ks(), "a").unwrap());
        assert_eq!(store.get(&ks(), "a"), Err(KvError::DocumentNotFound));
        // Visible with access_deleted
        let res = store
            .lookup_in(
                &ks(),
                "a",
                &[LookupSpec::get("txn.op.type").xattr()],
                LookupOptions::default().access_deleted(true),
            )
            .unwrap();
        assert_eq!(res.entry(0), Some(&json!("insert")));
        // A second tombstone insert with cas 0 conflicts
        let err = store
            .mutate_in(
                &ks(),
                "a",
                &[MutateSpec::upsert("txn.op.type", json!("insert")).xattr()],
                MutateOptions::default()
                    .store_semantics(StoreSemantics::Insert)
                    .create_as_deleted(true)
                    .access_deleted(true),
            )
            .unwrap_err();
        assert_eq!(err, KvError::DocumentExists);
    }

    #[test]
    fn test_macro_expansion() {
        let store = MemCluster::new();
        let cas = store.insert(&ks(), "a", json!({"v": 1}), DurabilityLevel::None).unwrap();
        let res = store
            .mutate_in(
                &ks(),
                "a",
                &[
                    MutateSpec::upsert("txn.op.crc32", MutateValue::Expand(Macro::ValueCrc32))
                        .xattr()
                        .create_path(),
                    MutateSpec::upsert("txn.ts", MutateValue::Expand(Macro::Cas))
                        .xattr()
                        .create_path(),
                ],
                MutateOptions::default().cas(cas),
            )
            .unwrap();
        let look = store
            .lookup_in(
                &ks(),
                "a",
                &[
                    LookupSpec::get("txn.ts").xattr(),
                    LookupSpec::get("txn.op.crc32").xattr(),
                    LookupSpec::get("$document").xattr(),
                ],
                LookupOptions::default(),
            )
            .unwrap();
        assert_eq!(look.entry(0), Some(&json!(res.cas)));
        // Staging CRC matches the $document CRC while the body is untouched
        let doc_crc = look.entry(2).unwrap()["value_crc32c"].clone();
        assert_eq!(look.entry(1), Some(&doc_crc));
    }

    #[test]
    fn test_vbucket_hlc_is_monotonic() {
        let store = MemCluster::new();
        store.insert(&ks(), "a", json!(1), DurabilityLevel::None).unwrap();
        let fetch = |store: &MemCluster| -> u64 {
            let res = store
                .lookup_in(
                    &ks(),
                    "a",
                    &[LookupSpec::get("$vbucket.HLC").xattr()],
                    LookupOptions::default(),
                )
                .unwrap();
            res.entry(0).unwrap()["now"].as_str().unwrap().parse().unwrap()
        };
        let a = fetch(&store);
        let b = fetch(&store);
        assert!(b >= a);
    }

    #[test]
    fn test_atomicity_of_failed_batch() {
        let store = MemCluster::new();
        let cas = store.insert(&ks(), "a", json!({"v": 1}), DurabilityLevel::None).unwrap();
        // Second spec fails → first must not be visible
        let err = store
            .mutate_in(
                &ks(),
                "a",
                &[
                    MutateSpec::upsert("txn.id", json!("x")).xattr().create_path(),
                    MutateSpec::remove("txn.absent").xattr(),
                ],
                MutateOptions::default().cas(cas),
            )
            .unwrap_err();
        assert!(matches!(err, KvError::PathNotFound(_)));
        let res = store
            .lookup_in(
                &ks(),
                "a",
                &[LookupSpec::get("txn.id").xattr()],
                LookupOptions::default(),
            )
            .unwrap();
        assert_eq!(res.entry(0), None);
        assert_eq!(res.cas, cas);
    }

    #[test]
    fn test_fault_hook_fail_after_apply() {
        let store = MemCluster::new();
        store.insert(&ks(), "a", json!(1), DurabilityLevel::None).unwrap();
        store.set_fault_hook(|p| {
            (p.op == "replace").then(|| FaultAction::FailAfterApply(KvError::Ambiguous))
        });
        let err = store
            .replace(&ks(), "a", json!(2), 0, DurabilityLevel::None)
            .unwrap_err();
        assert_eq!(err, KvError::Ambiguous);
        store.clear_fault_hook();
        // The write landed anyway
        assert_eq!(store.get(&ks(), "a").unwrap().body, json!(2));
    }

    #[test]
    fn test_full_doc_remove_spec() {
        let store = MemCluster::new();
        store.insert(&ks(), "a", json!(1), DurabilityLevel::None).unwrap();
        store
            .mutate_in(
                &ks(),
                "a",
                &[MutateSpec::full_doc_remove()],
                MutateOptions::default(),
            )
            .unwrap();
        assert!(store.raw_doc(&ks(), "a").is_none());
    }
}
