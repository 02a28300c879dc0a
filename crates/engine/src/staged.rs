//! In-memory log of the mutations an attempt has staged.
//!
//! The log is the authoritative source for read-your-own-writes and
//! drives commit-time unstaging. One live entry per (collection, id):
//! re-staging the same key consolidates rather than appends, so the
//! entry's kind always describes the net effect against the
//! pre-transaction state:
//!
//! | existing | incoming | result |
//! |----------|----------|--------|
//! | remove   | insert   | replace (new content) |
//! | insert   | replace  | insert (new content) |
//! | insert   | remove   | entry dropped |
//! | replace  | remove   | remove |
//! | replace  | replace  | replace (new content) |
//!
//! Pure in-memory; all access is serialized by the owning attempt.

use crate::doc::TransactionGetResult;
use keystone_kv::KeyspaceRef;
use serde_json::Value;

/// Net kind of a staged mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedKind {
    /// The document will be created at commit.
    Insert,
    /// The document body will be replaced at commit.
    Replace,
    /// The document will be deleted at commit.
    Remove,
}

impl StagedKind {
    /// Wire name recorded in `txn.op.type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            StagedKind::Insert => "insert",
            StagedKind::Replace => "replace",
            StagedKind::Remove => "remove",
        }
    }
}

/// One pending mutation.
#[derive(Debug, Clone)]
pub struct StagedMutation {
    /// Net operation kind
    pub kind: StagedKind,
    /// Document snapshot carrying the CAS observed at stage time
    pub doc: TransactionGetResult,
    /// Staged content; `None` for removes
    pub content: Option<Value>,
}

impl StagedMutation {
    fn key(&self) -> (&KeyspaceRef, &str) {
        (self.doc.keyspace(), self.doc.id())
    }
}

/// Ordered set of pending mutations with per-key consolidation.
#[derive(Debug, Default)]
pub struct StagedMutationLog {
    entries: Vec<StagedMutation>,
}

impl StagedMutationLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing has been staged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The live entry for a key, if any.
    pub fn find(&self, keyspace: &KeyspaceRef, id: &str) -> Option<&StagedMutation> {
        self.entries.iter().find(|e| e.key() == (keyspace, id))
    }

    /// Record a staged mutation, consolidating against any live entry
    /// for the same key.
    pub fn add(&mut self, kind: StagedKind, doc: TransactionGetResult, content: Option<Value>) {
        let pos = self
            .entries
            .iter()
            .position(|e| e.key() == (doc.keyspace(), doc.id()));
        let Some(pos) = pos else {
            self.entries.push(StagedMutation { kind, doc, content });
            return;
        };

        let existing = &mut self.entries[pos];
        match (existing.kind, kind) {
            (StagedKind::Remove, StagedKind::Insert) => {
                existing.kind = StagedKind::Replace;
                existing.doc = doc;
                existing.content = content;
            }
            (StagedKind::Insert, StagedKind::Replace) => {
                existing.doc = doc;
                existing.content = content;
            }
            (StagedKind::Insert, StagedKind::Remove) => {
                self.entries.remove(pos);
            }
            (StagedKind::Replace, StagedKind::Remove) => {
                existing.kind = StagedKind::Remove;
                existing.doc = doc;
                existing.content = None;
            }
            (StagedKind::Replace, StagedKind::Replace) => {
                existing.doc = doc;
                existing.content = content;
            }
            // Remaining combinations are rejected by the attempt before
            // any staging write happens; net-update keeps the log sane
            // if one slips through.
            (_, incoming) => {
                existing.kind = incoming;
                existing.doc = doc;
                existing.content = content;
            }
        }
    }

    /// Entries in insertion order, for commit-time unstaging.
    pub fn entries(&self) -> &[StagedMutation] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::TransactionLinks;
    use serde_json::json;

    fn ks() -> KeyspaceRef {
        KeyspaceRef::default_collection("b")
    }

    fn doc(id: &str, cas: u64) -> TransactionGetResult {
        TransactionGetResult::new(
            ks(),
            id,
            Value::Null,
            cas,
            TransactionLinks::default(),
            None,
        )
    }

    fn add(log: &mut StagedMutationLog, kind: StagedKind, id: &str, content: Option<Value>) {
        log.add(kind, doc(id, 1), content);
    }

    #[test]
    fn test_find_returns_last_net_entry() {
        let mut log = StagedMutationLog::new();
        add(&mut log, StagedKind::Replace, "a", Some(json!(1)));
        add(&mut log, StagedKind::Replace, "a", Some(json!(2)));
        let entry = log.find(&ks(), "a").unwrap();
        assert_eq!(entry.kind, StagedKind::Replace);
        assert_eq!(entry.content, Some(json!(2)));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_insert_after_remove_becomes_replace() {
        let mut log = StagedMutationLog::new();
        add(&mut log, StagedKind::Remove, "a", None);
        add(&mut log, StagedKind::Insert, "a", Some(json!(5)));
        let entry = log.find(&ks(), "a").unwrap();
        assert_eq!(entry.kind, StagedKind::Replace);
        assert_eq!(entry.content, Some(json!(5)));
    }

    #[test]
    fn test_replace_after_insert_stays_insert() {
        let mut log = StagedMutationLog::new();
        add(&mut log, StagedKind::Insert, "a", Some(json!(1)));
        add(&mut log, StagedKind::Replace, "a", Some(json!(2)));
        let entry = log.find(&ks(), "a").unwrap();
        assert_eq!(entry.kind, StagedKind::Insert);
        assert_eq!(entry.content, Some(json!(2)));
    }

    #[test]
    fn test_remove_after_insert_drops_entry() {
        let mut log = StagedMutationLog::new();
        add(&mut log, StagedKind::Insert, "a", Some(json!(1)));
        add(&mut log, StagedKind::Remove, "a", None);
        assert!(log.find(&ks(), "a").is_none());
        assert!(log.is_empty());
    }

    #[test]
    fn test_remove_after_replace_becomes_remove() {
        let mut log = StagedMutationLog::new();
        add(&mut log, StagedKind::Replace, "a", Some(json!(1)));
        add(&mut log, StagedKind::Remove, "a", None);
        let entry = log.find(&ks(), "a").unwrap();
        assert_eq!(entry.kind, StagedKind::Remove);
        assert_eq!(entry.content, None);
    }

    #[test]
    fn test_distinct_keys_do_not_consolidate() {
        let mut log = StagedMutationLog::new();
        add(&mut log, StagedKind::Insert, "a", Some(json!(1)));
        add(&mut log, StagedKind::Remove, "b", None);
        assert_eq!(log.len(), 2);
        let order: Vec<&str> = log.entries().iter().map(|e| e.doc.id()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    mod consolidation_properties {
        use super::*;
        use proptest::prelude::*;

        /// Reference model: fold one key's operation sequence through
        /// the consolidation table.
        fn model(ops: &[StagedKind]) -> Option<(StagedKind, Option<u64>)> {
            let mut state: Option<(StagedKind, Option<u64>)> = None;
            for (i, op) in ops.iter().enumerate() {
                let content = Some(i as u64);
                state = match (state, op) {
                    (None, k) => Some((*k, content.filter(|_| *k != StagedKind::Remove))),
                    (Some((StagedKind::Remove, _)), StagedKind::Insert) => {
                        Some((StagedKind::Replace, content))
                    }
                    (Some((StagedKind::Insert, _)), StagedKind::Replace) => {
                        Some((StagedKind::Insert, content))
                    }
                    (Some((StagedKind::Insert, _)), StagedKind::Remove) => None,
                    (Some((StagedKind::Replace, _)), StagedKind::Remove) => {
                        Some((StagedKind::Remove, None))
                    }
                    (Some((StagedKind::Replace, _)), StagedKind::Replace) => {
                        Some((StagedKind::Replace, content))
                    }
                    (Some(_), k) => {
                        Some((*k, content.filter(|_| *k != StagedKind::Remove)))
                    }
                };
            }
            state
        }

        fn kind_strategy() -> impl Strategy<Value = StagedKind> {
            prop_oneof![
                Just(StagedKind::Insert),
                Just(StagedKind::Replace),
                Just(StagedKind::Remove),
            ]
        }

        proptest! {
            #[test]
            fn find_matches_consolidation_table(ops in proptest::collection::vec(kind_strategy(), 1..12)) {
                let mut log = StagedMutationLog::new();
                for (i, op) in ops.iter().enumerate() {
                    let content = (*op != StagedKind::Remove).then(|| json!(i as u64));
                    log.add(*op, doc("k", 1), content);
                }
                let expect = model(&ops);
                let got = log
                    .find(&ks(), "k")
                    .map(|e| (e.kind, e.content.as_ref().and_then(|c| c.as_u64())));
                prop_assert_eq!(got, expect);
                prop_assert!(log.len() <= 1);
            }
        }
    }
}
