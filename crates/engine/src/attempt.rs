//! The attempt state machine.
//!
//! One `AttemptContext` drives one execution of the user body from
//! `NotStarted` through `Completed` or `RolledBack`: it stages
//! mutations into document xattrs, anchors them to an ATR entry,
//! resolves conflicts against other in-flight transactions, and
//! unstages at commit. Exclusive access (`&mut self`) gives the
//! per-attempt serial-execution guarantee; every store call is a
//! suspension point and every critical section ends in a CAS-checked
//! write.

use crate::atr::{self, ActiveTransactionRecord, AtrManager, DocRecord};
use crate::cleanup::entry::{commit_forward_doc, remove_txn_links, rollback_staged_insert};
use crate::cleanup::queue::{CleanupEntry, CleanupQueue};
use crate::config::TransactionConfig;
use crate::context::TransactionMeta;
use crate::doc::{fetch_doc, TransactionGetResult};
use crate::error::{
    retry_op, retry_op_bounded, retry_op_exponential, ErrorClass, FailureCause, OpError,
    TransactionOperationFailed, TxnResult, RETRY_OP_BUDGET, RETRY_OP_DELAY,
};
use crate::fields;
use crate::forward_compat::{self, ForwardCompatStage};
use crate::hooks::{AttemptHooks, Hook};
use crate::links::TransactionLinks;
use crate::staged::{StagedKind, StagedMutation, StagedMutationLog};
use crate::state::AttemptState;
use keystone_kv::{
    Cas, KeyspaceRef, KvError, KvStore, Macro, MutateOptions, MutateSpec, MutateValue,
    QueryOptions, QueryResult, StoreSemantics,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

/// Which flavor of attempt this is; query mode is entered on the first
/// `query()` call and is one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptMode {
    Kv,
    Query,
}

/// Outcome of commit-ambiguity resolution.
enum CommitAmbiguity {
    Committed,
    StillPending,
}

/// Context for one attempt of a transaction, handed to the user body.
pub struct AttemptContext {
    kv: Arc<dyn KvStore>,
    config: TransactionConfig,
    meta: Arc<TransactionMeta>,
    cleanup_queue: Arc<CleanupQueue>,
    hooks: Arc<AttemptHooks>,

    id: String,
    start: Instant,
    state: AttemptState,
    mode: AttemptMode,
    staged: StagedMutationLog,
    recorded_arrays: HashSet<(KeyspaceRef, String, &'static str)>,
    atr: Option<AtrManager>,
    atr_placement_offset: u32,
    expiry_overtime_mode: bool,
    is_done: bool,
    has_error: bool,
    unstaging_complete: bool,
}

impl AttemptContext {
    pub(crate) fn new(
        kv: Arc<dyn KvStore>,
        config: TransactionConfig,
        meta: Arc<TransactionMeta>,
        cleanup_queue: Arc<CleanupQueue>,
        hooks: Arc<AttemptHooks>,
        atr_placement_offset: u32,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        trace!(txn = %meta.id(), attempt = %id, "new attempt");
        Self {
            kv,
            config,
            meta,
            cleanup_queue,
            hooks,
            id,
            start: Instant::now(),
            state: AttemptState::NotStarted,
            mode: AttemptMode::Kv,
            staged: StagedMutationLog::new(),
            recorded_arrays: HashSet::new(),
            atr: None,
            atr_placement_offset,
            expiry_overtime_mode: false,
            is_done: false,
            has_error: false,
            unstaging_complete: true,
        }
    }

    /// Attempt id.
    pub fn attempt_id(&self) -> &str {
        &self.id
    }

    /// Transaction id.
    pub fn transaction_id(&self) -> &str {
        self.meta.id()
    }

    /// Current in-memory state.
    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Whether the attempt has committed or rolled back.
    pub fn is_done(&self) -> bool {
        self.is_done
    }

    pub(crate) fn unstaging_complete(&self) -> bool {
        self.unstaging_complete
    }

    pub(crate) fn atr_info(&self) -> Option<(String, KeyspaceRef)> {
        self.atr
            .as_ref()
            .map(|a| (a.atr_id().to_string(), a.keyspace().clone()))
    }

    // -----------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------

    /// Read a document. Absent documents are an error; see
    /// [`AttemptContext::get_optional`].
    pub fn get(&mut self, keyspace: &KeyspaceRef, id: &str) -> TxnResult<TransactionGetResult> {
        self.get_optional(keyspace, id)?.ok_or_else(|| {
            TransactionOperationFailed::new(
                ErrorClass::DocNotFound,
                format!("document {id} not found"),
            )
            .cause(FailureCause::DocumentNotFound)
        })
    }

    /// Read a document, `Ok(None)` when absent (or removed by this
    /// attempt).
    pub fn get_optional(
        &mut self,
        keyspace: &KeyspaceRef,
        id: &str,
    ) -> TxnResult<Option<TransactionGetResult>> {
        self.cache_error(|this| {
            let result = this.do_get(keyspace, id)?;
            if let Some(doc) = &result {
                forward_compat::check(
                    ForwardCompatStage::Gets,
                    doc.links().forward_compat.as_ref(),
                )?;
            }
            Ok(result)
        })
    }

    /// Stage a document creation.
    pub fn insert(
        &mut self,
        keyspace: &KeyspaceRef,
        id: &str,
        content: Value,
    ) -> TxnResult<TransactionGetResult> {
        self.cache_error(|this| this.do_insert(keyspace, id, content))
    }

    /// Stage a body replacement for a document previously read or
    /// mutated in this attempt.
    pub fn replace(
        &mut self,
        doc: &TransactionGetResult,
        content: Value,
    ) -> TxnResult<TransactionGetResult> {
        self.cache_error(|this| this.do_replace(doc, content))
    }

    /// Stage a document removal.
    pub fn remove(&mut self, doc: &TransactionGetResult) -> TxnResult<()> {
        self.cache_error(|this| this.do_remove(doc))
    }

    /// Run a query statement inside the transaction. Switches the
    /// attempt into query mode; key-value operations are unavailable
    /// afterwards.
    pub fn query(&mut self, statement: &str, options: QueryOptions) -> TxnResult<QueryResult> {
        self.cache_error(|this| {
            if this.is_done {
                return Err(TransactionOperationFailed::new(
                    ErrorClass::Other,
                    "attempt already committed or rolled back",
                )
                .no_rollback());
            }
            this.check_expiry_pre_commit("query", None)?;
            this.mode = AttemptMode::Query;
            this.kv
                .query(statement, &options)
                .map_err(|e| TransactionOperationFailed::from_kv(&e, "query").no_rollback())
        })
    }

    /// Commit the attempt: record `COMMITTED` (the point of no return),
    /// unstage every mutation in staging order, then complete.
    pub fn commit(&mut self) -> TxnResult<()> {
        debug!(attempt = %self.id, "commit");
        if self.has_error {
            return Err(self.previous_operation_failed());
        }
        self.check_expiry_pre_commit("before_commit", None)?;

        if self.is_done {
            return Err(TransactionOperationFailed::new(
                ErrorClass::Other,
                "commit called on a finished attempt",
            )
            .no_rollback());
        }
        if self.atr.is_none() || self.staged.is_empty() {
            // Read-only attempt: nothing durable happened
            debug!(attempt = %self.id, "no mutations, skipping commit");
            self.is_done = true;
            self.state = AttemptState::Completed;
            return Ok(());
        }

        self.state = AttemptState::Committing;
        self.atr_commit()?;

        // Past the point of no return: failures below never roll back
        if let Err(e) = (*self.hooks.after_atr_commit)(&self.id) {
            self.unstaging_complete = false;
            self.is_done = true;
            return Err(
                TransactionOperationFailed::from_kv(&e, "interrupted after commit point")
                    .no_rollback()
                    .failed_post_commit(),
            );
        }

        let items: Vec<StagedMutation> = self.staged.entries().to_vec();
        for item in &items {
            let unstage = match item.kind {
                StagedKind::Remove => self.unstage_remove(item),
                StagedKind::Insert | StagedKind::Replace => self.unstage_commit(item),
            };
            if let Err(e) = unstage {
                warn!(
                    attempt = %self.id,
                    doc = item.doc.id(),
                    "unstage failed, deferring to cleanup: {e}"
                );
                self.unstaging_complete = false;
                self.is_done = true;
                return Err(e);
            }
        }

        self.atr_complete();
        self.is_done = true;
        Ok(())
    }

    /// Roll the attempt back: record `ABORTED`, restore every staged
    /// document, then record `ROLLED_BACK`.
    pub fn rollback(&mut self) -> TxnResult<()> {
        debug!(attempt = %self.id, "rollback");
        self.check_expiry_during_commit_or_rollback("rollback", None);
        if self.atr.is_none() || self.state == AttemptState::NotStarted {
            debug!(attempt = %self.id, "rollback with no mutations");
            self.is_done = true;
            self.state = AttemptState::RolledBack;
            return Ok(());
        }
        if self.is_done {
            return Err(TransactionOperationFailed::new(
                ErrorClass::Other,
                "attempt already finished, cannot roll back",
            )
            .no_rollback());
        }

        self.state = AttemptState::Aborting;
        self.atr_abort()?;

        let items: Vec<StagedMutation> = self.staged.entries().to_vec();
        for item in &items {
            match item.kind {
                StagedKind::Insert => self.rollback_staged_insert_doc(item)?,
                StagedKind::Replace | StagedKind::Remove => {
                    self.rollback_staged_replace_or_remove(item)?
                }
            }
        }
        debug!(attempt = %self.id, "rollback unstaged all docs");

        self.atr_rollback_complete()?;
        self.is_done = true;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------

    fn do_get(
        &mut self,
        keyspace: &KeyspaceRef,
        id: &str,
    ) -> TxnResult<Option<TransactionGetResult>> {
        self.check_if_done()?;
        self.check_expiry_pre_commit("get", Some(id))?;

        // Read-your-own-writes comes straight from the staged log
        if let Some(own) = self.staged.find(keyspace, id) {
            return match own.kind {
                StagedKind::Remove => {
                    debug!(attempt = %self.id, doc = id, "own staged remove, absent");
                    Ok(None)
                }
                _ => {
                    debug!(attempt = %self.id, doc = id, "returning own staged write");
                    let mut doc = own.doc.clone();
                    doc.set_content(own.content.clone().unwrap_or(Value::Null));
                    Ok(Some(doc))
                }
            };
        }

        let fetched = fetch_doc(self.kv.as_ref(), keyspace, id)
            .map_err(|e| self.classify_get_failure(&e))?;
        let Some((doc, res)) = fetched else {
            return Ok(None);
        };

        if !doc.links().is_document_in_transaction() {
            if res.is_deleted {
                return Ok(None);
            }
            return Ok(Some(doc));
        }

        debug!(attempt = %self.id, doc = id, "document is staged by a transaction");
        self.resolve_staged_read(doc, res.is_deleted)
    }

    /// A document with a `txn` xattr: decide what this attempt sees.
    fn resolve_staged_read(
        &mut self,
        doc: TransactionGetResult,
        is_deleted: bool,
    ) -> TxnResult<Option<TransactionGetResult>> {
        let links = doc.links().clone();

        if links.staged_attempt_id.as_deref() == Some(self.id.as_str()) {
            // Our own stage, observed through the store (e.g. after an
            // ambiguous staging write)
            if links.is_document_being_removed() {
                return Ok(None);
            }
            let mut out = doc;
            let staged = links.staged_content.clone().unwrap_or(Value::Null);
            out.set_content(staged);
            return Ok(Some(out));
        }

        let entry = match links.atr_keyspace().zip(links.atr_id.clone()) {
            Some((atr_ks, atr_id)) => {
                match ActiveTransactionRecord::fetch(self.kv.as_ref(), &atr_ks, &atr_id) {
                    Ok(Some(atr)) => {
                        let found = links
                            .staged_attempt_id
                            .as_deref()
                            .and_then(|aid| atr.entry(aid).cloned());
                        found.map(|e| (e, atr.now_ms))
                    }
                    Ok(None) => None,
                    Err(e) => {
                        debug!(doc = doc.id(), "could not read owning ATR ({e}), treating as absent");
                        None
                    }
                }
            }
            None => None,
        };

        match entry {
            Some((entry, now_ms)) => {
                forward_compat::check(
                    ForwardCompatStage::GetsReadingAtr,
                    entry.forward_compat.as_ref(),
                )?;
                match entry.state {
                    AttemptState::Committed | AttemptState::Completed => {
                        // The staged content is the effective value
                        if links.is_document_being_removed() {
                            Ok(None)
                        } else {
                            let mut out = doc;
                            let staged = links.staged_content.clone().unwrap_or(Value::Null);
                            out.set_content(staged);
                            Ok(Some(out))
                        }
                    }
                    _ => {
                        if entry.has_expired(now_ms, 0) {
                            // Abandoned: queue a rollback and take the
                            // pre-transaction view
                            debug!(doc = doc.id(), "foreign attempt expired, queueing cleanup");
                            self.queue_foreign_cleanup(&links);
                        }
                        pre_transaction_view(doc, is_deleted)
                    }
                }
            }
            // Entry (or whole ATR) gone: the writer finished long ago
            // or was cleaned up; take the pre-transaction view
            None => pre_transaction_view(doc, is_deleted),
        }
    }

    fn classify_get_failure(&self, e: &KvError) -> TransactionOperationFailed {
        match ErrorClass::from(e) {
            ErrorClass::Transient | ErrorClass::Ambiguous => {
                TransactionOperationFailed::from_kv(e, "get").retry()
            }
            ErrorClass::Hard => TransactionOperationFailed::from_kv(e, "get").no_rollback(),
            _ => TransactionOperationFailed::from_kv(e, "get"),
        }
    }

    /// Queue an expired foreign attempt for immediate cleanup.
    fn queue_foreign_cleanup(&self, links: &TransactionLinks) {
        if let (Some(atr_ks), Some(atr_id), Some(attempt_id)) = (
            links.atr_keyspace(),
            links.atr_id.clone(),
            links.staged_attempt_id.clone(),
        ) {
            self.cleanup_queue
                .push(CleanupEntry::new(atr_ks, atr_id, attempt_id, Instant::now(), true));
        }
    }

    // -----------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------

    fn do_insert(
        &mut self,
        keyspace: &KeyspaceRef,
        id: &str,
        content: Value,
    ) -> TxnResult<TransactionGetResult> {
        self.check_if_done()?;
        self.check_expiry_pre_commit("insert", Some(id))?;

        match self
            .staged
            .find(keyspace, id)
            .map(|e| (e.kind, e.doc.clone()))
        {
            Some((StagedKind::Remove, prior)) => {
                // Insert over our own staged remove: restage as replace
                debug!(attempt = %self.id, doc = id, "insert over own remove, restaging as replace");
                return self.stage_replace_like(&prior, content, StagedKind::Insert);
            }
            Some(_) => {
                return Err(TransactionOperationFailed::new(
                    ErrorClass::DocExists,
                    format!("document {id} already mutated in this transaction"),
                )
                .cause(FailureCause::DocumentExists));
            }
            None => {}
        }

        self.select_atr_if_needed(keyspace, id);
        self.set_atr_pending_if_first_mutation()?;
        self.record_doc_array(keyspace, id, fields::ATR_FIELD_DOCS_INSERTED)?;

        // Staged-insert loop: an existing tombstone or staged insert is
        // retried with its CAS; anything live and committed is a plain
        // document-exists failure.
        let mut cas: Cas = 0;
        let out = retry_op(|| self.create_staged_insert(keyspace, id, content.clone(), &mut cas))?;

        self.staged.add(StagedKind::Insert, out.clone(), Some(content));
        Ok(out)
    }

    fn create_staged_insert(
        &mut self,
        keyspace: &KeyspaceRef,
        id: &str,
        content: Value,
        cas: &mut Cas,
    ) -> Result<TransactionGetResult, OpError> {
        self.error_if_expired_and_not_in_overtime("create_staged_insert", Some(id))?;
        self.hook_as_op(self.hooks.before_staged_insert.clone(), id)?;
        trace!(attempt = %self.id, doc = id, cas = *cas, "staging insert");

        let specs = self.stage_specs(StagedKind::Insert, Some(&content));
        let semantics = if *cas == 0 {
            StoreSemantics::Insert
        } else {
            StoreSemantics::Replace
        };
        let result = self.kv.mutate_in(
            keyspace,
            id,
            &specs,
            MutateOptions::default()
                .cas(*cas)
                .access_deleted(true)
                .create_as_deleted(true)
                .store_semantics(semantics)
                .durability(self.config.durability),
        );

        match result {
            Ok(res) => {
                trace!(attempt = %self.id, doc = id, cas = res.cas, "staged insert");
                let atr = self.atr.as_ref().expect("ATR selected before staging");
                let links = TransactionLinks {
                    atr_id: Some(atr.atr_id().to_string()),
                    atr_bucket: Some(atr.keyspace().bucket.clone()),
                    atr_scope: Some(atr.keyspace().scope.clone()),
                    atr_collection: Some(atr.keyspace().collection.clone()),
                    staged_transaction_id: Some(self.meta.id().to_string()),
                    staged_attempt_id: Some(self.id.clone()),
                    staged_content: Some(content.clone()),
                    op: Some("insert".to_string()),
                    is_deleted: true,
                    ..TransactionLinks::default()
                };
                Ok(TransactionGetResult::new(
                    keyspace.clone(),
                    id,
                    content,
                    res.cas,
                    links,
                    None,
                ))
            }
            Err(e) => {
                if self.expiry_overtime_mode {
                    return Err(OpError::Fail(
                        TransactionOperationFailed::from_kv(&e, "staged insert").expired(),
                    ));
                }
                match ErrorClass::from(&e) {
                    ErrorClass::Ambiguous => Err(OpError::Retry("ambiguous staged insert".into())),
                    ErrorClass::Transient => Err(OpError::Fail(
                        TransactionOperationFailed::from_kv(&e, "staged insert").retry(),
                    )),
                    ErrorClass::DocExists | ErrorClass::CasMismatch => {
                        self.handle_insert_exists(keyspace, id, cas)
                    }
                    ErrorClass::Hard => Err(OpError::Fail(
                        TransactionOperationFailed::from_kv(&e, "staged insert").no_rollback(),
                    )),
                    _ => Err(OpError::Fail(
                        TransactionOperationFailed::from_kv(&e, "staged insert").retry(),
                    )),
                }
            }
        }
    }

    /// The insert hit an existing document (or tombstone): decide
    /// whether it blocks us, can be overwritten, or is a plain
    /// conflict. On the overwrite paths, `cas` is updated for the next
    /// staging try.
    fn handle_insert_exists(
        &mut self,
        keyspace: &KeyspaceRef,
        id: &str,
        cas: &mut Cas,
    ) -> Result<TransactionGetResult, OpError> {
        debug!(attempt = %self.id, doc = id, "insert found existing document");
        let fetched = fetch_doc(self.kv.as_ref(), keyspace, id).map_err(|e| {
            OpError::Fail(TransactionOperationFailed::from_kv(&e, "insert recovery read").retry())
        })?;
        let Some((doc, res)) = fetched else {
            return Err(OpError::Fail(
                TransactionOperationFailed::new(
                    ErrorClass::DocNotFound,
                    "document vanished between insert and recovery read",
                )
                .retry(),
            ));
        };
        forward_compat::check(
            ForwardCompatStage::WwcInsertingGet,
            doc.links().forward_compat.as_ref(),
        )
        .map_err(OpError::Fail)?;

        if !doc.links().is_document_in_transaction() {
            if res.is_deleted {
                // Plain tombstone: retry staging over it with its CAS
                trace!(doc = id, cas = doc.cas(), "tombstone found, retrying with CAS");
                *cas = doc.cas();
                return Err(OpError::Retry("staging over tombstone".into()));
            }
            return Err(OpError::Fail(
                TransactionOperationFailed::new(
                    ErrorClass::DocExists,
                    format!("document {id} already exists"),
                )
                .cause(FailureCause::DocumentExists),
            ));
        }

        // Only a staged insert may be overwritten; anything else means
        // the document properly exists
        if doc.links().op.as_deref() != Some("insert") {
            return Err(OpError::Fail(
                TransactionOperationFailed::new(
                    ErrorClass::DocExists,
                    format!("document {id} exists with a non-insert stage"),
                )
                .cause(FailureCause::DocumentExists),
            ));
        }

        if doc.links().staged_transaction_id.as_deref() != Some(self.meta.id()) {
            let record = DocRecord::new(keyspace.clone(), id);
            self.check_blocking_writer(doc.links(), record)
                .map_err(OpError::Fail)?;
        }

        trace!(doc = id, cas = doc.cas(), "staged insert resolved, retrying with CAS");
        *cas = doc.cas();
        Err(OpError::Retry("staging over resolved staged insert".into()))
    }

    fn do_replace(
        &mut self,
        doc: &TransactionGetResult,
        content: Value,
    ) -> TxnResult<TransactionGetResult> {
        self.check_if_done()?;
        self.check_expiry_pre_commit("replace", Some(doc.id()))?;
        trace!(attempt = %self.id, doc = doc.id(), "replace");

        let own = self
            .staged
            .find(doc.keyspace(), doc.id())
            .map(|e| e.doc.clone());
        match own {
            Some(prior) => self.stage_replace_like(&prior, content, StagedKind::Replace),
            None => {
                self.check_and_handle_blocking(doc, ForwardCompatStage::WwcReplacing)?;
                self.stage_replace_like(doc, content, StagedKind::Replace)
            }
        }
    }

    fn do_remove(&mut self, doc: &TransactionGetResult) -> TxnResult<()> {
        self.check_if_done()?;
        self.check_expiry_pre_commit("remove", Some(doc.id()))?;
        trace!(attempt = %self.id, doc = doc.id(), "remove");

        let own = self
            .staged
            .find(doc.keyspace(), doc.id())
            .map(|e| (e.kind, e.doc.clone()));
        match own {
            Some((StagedKind::Insert, prior)) => {
                // Net no-op: tear down the staged tombstone and drop
                // the log entry
                debug!(attempt = %self.id, doc = doc.id(), "remove of own insert, dropping stage");
                let record = DocRecord::new(prior.keyspace().clone(), prior.id());
                rollback_staged_insert(self.kv.as_ref(), self.config.durability, &self.id, &record)
                    .map_err(|e| {
                        TransactionOperationFailed::from_kv(&e, "dropping staged insert")
                    })?;
                self.staged.add(StagedKind::Remove, prior, None);
                Ok(())
            }
            Some((_, prior)) => self.stage_remove(&prior).map(|_| ()),
            None => {
                self.check_and_handle_blocking(doc, ForwardCompatStage::WwcRemoving)?;
                self.stage_remove(doc).map(|_| ())
            }
        }
    }

    /// Stage a replace-shaped write (`op.type = replace`) and record it
    /// in the log under `log_kind`, consolidating as needed.
    fn stage_replace_like(
        &mut self,
        doc: &TransactionGetResult,
        content: Value,
        log_kind: StagedKind,
    ) -> TxnResult<TransactionGetResult> {
        self.select_atr_if_needed(doc.keyspace(), doc.id());
        self.set_atr_pending_if_first_mutation()?;
        self.record_doc_array(doc.keyspace(), doc.id(), fields::ATR_FIELD_DOCS_REPLACED)?;
        self.hook_as_txn(
            self.hooks.before_staged_replace.clone(),
            doc.id(),
            "staged replace",
        )?;

        let mut specs = self.stage_specs(StagedKind::Replace, Some(&content));
        self.push_restore_specs(&mut specs, doc);

        trace!(attempt = %self.id, doc = doc.id(), cas = doc.cas(), "staging replace");
        let res = self
            .kv
            .mutate_in(
                doc.keyspace(),
                doc.id(),
                &specs,
                MutateOptions::default()
                    .cas(doc.cas())
                    .access_deleted(doc.links().is_deleted)
                    .durability(self.config.durability),
            )
            .map_err(|e| self.classify_stage_failure(&e, "staged replace"))?;

        let mut out = doc.clone();
        out.set_cas(res.cas);
        out.set_content(content.clone());
        self.staged.add(log_kind, out.clone(), Some(content));
        Ok(out)
    }

    fn stage_remove(&mut self, doc: &TransactionGetResult) -> TxnResult<TransactionGetResult> {
        self.select_atr_if_needed(doc.keyspace(), doc.id());
        self.set_atr_pending_if_first_mutation()?;
        self.record_doc_array(doc.keyspace(), doc.id(), fields::ATR_FIELD_DOCS_REMOVED)?;
        self.hook_as_txn(
            self.hooks.before_staged_remove.clone(),
            doc.id(),
            "staged remove",
        )?;

        let mut specs = self.stage_specs(StagedKind::Remove, None);
        self.push_restore_specs(&mut specs, doc);

        trace!(attempt = %self.id, doc = doc.id(), cas = doc.cas(), "staging remove");
        let res = self
            .kv
            .mutate_in(
                doc.keyspace(),
                doc.id(),
                &specs,
                MutateOptions::default()
                    .cas(doc.cas())
                    .access_deleted(doc.links().is_deleted)
                    .durability(self.config.durability),
            )
            .map_err(|e| self.classify_stage_failure(&e, "staged remove"))?;

        let mut out = doc.clone();
        out.set_cas(res.cas);
        self.staged.add(StagedKind::Remove, out.clone(), None);
        Ok(out)
    }

    /// The common `txn.*` staging specs, including the staging CRC.
    fn stage_specs(&self, kind: StagedKind, content: Option<&Value>) -> Vec<MutateSpec> {
        let atr = self.atr.as_ref().expect("ATR selected before staging");
        let mut specs = vec![
            MutateSpec::upsert(fields::TXN_ID, json!(self.meta.id()))
                .xattr()
                .create_path(),
            MutateSpec::upsert(fields::ATTEMPT_ID, json!(self.id))
                .xattr()
                .create_path(),
            MutateSpec::upsert(fields::ATR_ID, json!(atr.atr_id()))
                .xattr()
                .create_path(),
            MutateSpec::upsert(fields::ATR_BUCKET, json!(atr.keyspace().bucket))
                .xattr()
                .create_path(),
            MutateSpec::upsert(fields::ATR_SCOPE, json!(atr.keyspace().scope))
                .xattr()
                .create_path(),
            MutateSpec::upsert(fields::ATR_COLLECTION, json!(atr.keyspace().collection))
                .xattr()
                .create_path(),
            MutateSpec::upsert(fields::OP_TYPE, json!(kind.as_str()))
                .xattr()
                .create_path(),
            MutateSpec::upsert(fields::CRC32_OF_STAGING, MutateValue::Expand(Macro::ValueCrc32))
                .xattr()
                .create_path(),
        ];
        if let Some(content) = content {
            specs.push(
                MutateSpec::upsert(fields::STAGED_DATA, content.clone())
                    .xattr()
                    .create_path(),
            );
        }
        specs
    }

    /// Record the pre-transaction identity used by conflict resolution.
    fn push_restore_specs(&self, specs: &mut Vec<MutateSpec>, doc: &TransactionGetResult) {
        let cas = doc.metadata().and_then(|m| m.cas).unwrap_or(doc.cas());
        specs.push(
            MutateSpec::upsert(fields::PRE_TXN_CAS, json!(cas))
                .xattr()
                .create_path(),
        );
        if let Some(revid) = doc.metadata().and_then(|m| m.revid) {
            specs.push(
                MutateSpec::upsert(fields::PRE_TXN_REVID, json!(revid))
                    .xattr()
                    .create_path(),
            );
        }
        if let Some(exptime) = doc.metadata().and_then(|m| m.exptime) {
            specs.push(
                MutateSpec::upsert(fields::PRE_TXN_EXPTIME, json!(exptime))
                    .xattr()
                    .create_path(),
            );
        }
    }

    fn classify_stage_failure(&self, e: &KvError, context: &str) -> TransactionOperationFailed {
        match ErrorClass::from(e) {
            ErrorClass::DocNotFound => TransactionOperationFailed::from_kv(e, context)
                .cause(FailureCause::DocumentNotFound),
            ErrorClass::DocExists
            | ErrorClass::CasMismatch
            | ErrorClass::Transient
            | ErrorClass::Ambiguous => TransactionOperationFailed::from_kv(e, context).retry(),
            ErrorClass::Hard => TransactionOperationFailed::from_kv(e, context).no_rollback(),
            _ => TransactionOperationFailed::from_kv(e, context),
        }
    }

    // -----------------------------------------------------------------
    // ATR bookkeeping
    // -----------------------------------------------------------------

    fn select_atr_if_needed(&mut self, keyspace: &KeyspaceRef, id: &str) {
        if self.atr.is_some() {
            return;
        }
        let atr_id = match &self.hooks.atr_id_override {
            Some(id) => id.clone(),
            None => {
                let vbucket = (atr::vbucket_for_key(id) + self.atr_placement_offset) % atr::NUM_ATRS;
                atr::atr_id_for_vbucket(vbucket)
            }
        };
        let atr_keyspace = self.config.metadata_keyspace_for(&keyspace.bucket);
        debug!(attempt = %self.id, doc = id, atr = %atr_id, "first mutated doc selects ATR");
        self.meta.set_atr(&atr_id, &atr_keyspace);
        self.atr = Some(AtrManager::new(
            Arc::clone(&self.kv),
            atr_keyspace,
            atr_id,
            self.config.durability,
        ));
    }

    fn set_atr_pending_if_first_mutation(&mut self) -> TxnResult<()> {
        if !self.staged.is_empty() || self.state != AttemptState::NotStarted {
            return Ok(());
        }
        self.error_if_expired_and_not_in_overtime("atr_pending", None)
            .map_err(op_to_txn)?;
        self.hook_as_txn(self.hooks.before_atr_pending.clone(), &self.id.clone(), "atr pending")?;

        let attempt_id = self.id.clone();
        let txn_id = self.meta.id().to_string();
        let expiry = self.config.expiration_ms();
        let atr = self.atr.as_ref().expect("ATR selected before pending");
        debug!(attempt = %attempt_id, atr = atr.atr_id(), "recording PENDING");

        retry_op(|| match atr.set_pending(&attempt_id, &txn_id, expiry) {
            Ok(()) => Ok(()),
            Err(e) => match ErrorClass::from(&e) {
                ErrorClass::Ambiguous => Err(OpError::Retry("ambiguous ATR pending write".into())),
                ErrorClass::AtrFull => Err(OpError::Fail(
                    TransactionOperationFailed::from_kv(&e, "ATR pending")
                        .cause(FailureCause::AtrFull)
                        .retry(),
                )),
                ErrorClass::PathExists => Err(OpError::Fail(
                    TransactionOperationFailed::new(
                        ErrorClass::WriteWriteConflict,
                        "attempt entry exists under another transaction",
                    )
                    .retry(),
                )),
                ErrorClass::Transient => Err(OpError::Fail(
                    TransactionOperationFailed::from_kv(&e, "ATR pending").retry(),
                )),
                ErrorClass::Hard => Err(OpError::Fail(
                    TransactionOperationFailed::from_kv(&e, "ATR pending").no_rollback(),
                )),
                _ => Err(OpError::Fail(TransactionOperationFailed::from_kv(&e, "ATR pending"))),
            },
        })?;
        self.state = AttemptState::Pending;
        Ok(())
    }

    /// Append the doc-record for a staged document to the ATR array
    /// matching the staged op, once per (key, array), before the stage
    /// itself lands. A spurious record from a failed stage is harmless;
    /// a stage without its record would be invisible to cleanup.
    fn record_doc_array(
        &mut self,
        keyspace: &KeyspaceRef,
        id: &str,
        array: &'static str,
    ) -> TxnResult<()> {
        let key = (keyspace.clone(), id.to_string(), array);
        if self.recorded_arrays.contains(&key) {
            return Ok(());
        }
        let atr = self.atr.as_ref().expect("ATR selected before staging");
        atr.append_doc_record(&self.id, array, &DocRecord::new(keyspace.clone(), id))
            .map_err(|e| self.classify_stage_failure(&e, "ATR doc-record append"))?;
        self.recorded_arrays.insert(key);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Conflict resolution
    // -----------------------------------------------------------------

    /// A write found the target staged by someone: decide whether to
    /// proceed, wait, or retry the transaction.
    fn check_and_handle_blocking(
        &mut self,
        doc: &TransactionGetResult,
        stage: ForwardCompatStage,
    ) -> TxnResult<()> {
        if !doc.links().has_staged_write() {
            return Ok(());
        }
        // Transaction id, not attempt id: a retried attempt of our own
        // transaction may overwrite its predecessor's stage
        if doc.links().staged_transaction_id.as_deref() == Some(self.meta.id()) {
            debug!(doc = doc.id(), "staged by this transaction, continuing");
            return Ok(());
        }
        forward_compat::check(stage, doc.links().forward_compat.as_ref())?;
        let record = DocRecord::new(doc.keyspace().clone(), doc.id());
        self.check_blocking_writer(doc.links(), record)
    }

    /// Wait (bounded) for the foreign attempt staging this document to
    /// reach a terminal state; help a decided attempt along on this one
    /// document.
    fn check_blocking_writer(
        &mut self,
        links: &TransactionLinks,
        record: DocRecord,
    ) -> TxnResult<()> {
        let Some((atr_ks, atr_id)) = links.atr_keyspace().zip(links.atr_id.clone()) else {
            // Not enough metadata to find the writer; proceed and let
            // CAS arbitrate
            debug!("staged document lacks ATR location, proceeding");
            return Ok(());
        };
        let foreign_attempt = links.staged_attempt_id.clone().unwrap_or_default();

        let outcome = retry_op_exponential(
            Duration::from_millis(50),
            Duration::from_millis(500),
            Duration::from_secs(1),
            || {
                let atr = ActiveTransactionRecord::fetch(self.kv.as_ref(), &atr_ks, &atr_id)
                    .map_err(|e| {
                        OpError::Fail(
                            TransactionOperationFailed::from_kv(&e, "blocking-writer ATR read")
                                .retry(),
                        )
                    })?;
                let Some(atr) = atr else {
                    debug!(atr = %atr_id, "writer's ATR absent, proceeding");
                    return Ok(());
                };
                let Some(entry) = atr.entry(&foreign_attempt) else {
                    debug!(attempt = %foreign_attempt, "no blocking entry, proceeding");
                    return Ok(());
                };
                forward_compat::check(
                    ForwardCompatStage::WwcReadingAtr,
                    entry.forward_compat.as_ref(),
                )
                .map_err(OpError::Fail)?;

                if entry.has_expired(atr.now_ms, 0) {
                    debug!(
                        attempt = %foreign_attempt,
                        age_ms = entry.age_ms(atr.now_ms),
                        "blocking attempt expired, queueing cleanup and proceeding"
                    );
                    self.queue_foreign_cleanup(links);
                    return Ok(());
                }
                match entry.state {
                    AttemptState::Completed | AttemptState::RolledBack => {
                        debug!(attempt = %foreign_attempt, state = %entry.state, "writer finished");
                        Ok(())
                    }
                    AttemptState::Committed => {
                        // Help the decided writer forward on this one
                        // document, then let CAS arbitrate our write
                        let _ = commit_forward_doc(
                            self.kv.as_ref(),
                            self.config.durability,
                            &foreign_attempt,
                            &record,
                        );
                        Ok(())
                    }
                    AttemptState::Aborted => {
                        let _ = remove_txn_links(
                            self.kv.as_ref(),
                            self.config.durability,
                            &foreign_attempt,
                            &record,
                        );
                        Ok(())
                    }
                    _ => {
                        trace!(attempt = %foreign_attempt, state = %entry.state, "writer still live");
                        Err(OpError::Retry("blocking attempt still live".into()))
                    }
                }
            },
        );
        match outcome {
            Ok(()) => Ok(()),
            Err(OpError::Fail(e)) => Err(e),
            Err(OpError::Retry(_)) => Err(TransactionOperationFailed::new(
                ErrorClass::WriteWriteConflict,
                "document is staged by another live transaction",
            )
            .retry()),
        }
    }

    // -----------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------

    fn atr_commit(&mut self) -> TxnResult<()> {
        let deadline = Instant::now() + RETRY_OP_BUDGET;
        loop {
            self.error_if_expired_and_not_in_overtime("atr_commit", None)
                .map_err(op_to_txn)?;
            self.hook_as_txn(self.hooks.before_atr_commit.clone(), &self.id.clone(), "atr commit")?;

            let atr = self.atr.as_ref().expect("commit requires an ATR");
            let result = atr.set_state(&self.id, AttemptState::Pending, AttemptState::Committed);
            match result {
                Ok(_) => {
                    debug!(attempt = %self.id, "COMMITTED recorded, point of no return");
                    self.state = AttemptState::Committed;
                    return Ok(());
                }
                Err(e) => match ErrorClass::from(&e) {
                    ErrorClass::Ambiguous => {
                        debug!(attempt = %self.id, "ambiguous ATR commit, resolving");
                        match self.resolve_commit_ambiguity()? {
                            CommitAmbiguity::Committed => {
                                self.state = AttemptState::Committed;
                                return Ok(());
                            }
                            CommitAmbiguity::StillPending => {
                                if Instant::now() >= deadline {
                                    return Err(TransactionOperationFailed::from_kv(
                                        &e,
                                        "ATR commit",
                                    )
                                    .no_rollback()
                                    .ambiguous());
                                }
                                std::thread::sleep(RETRY_OP_DELAY);
                                continue;
                            }
                        }
                    }
                    ErrorClass::Transient => {
                        return Err(TransactionOperationFailed::from_kv(&e, "ATR commit").retry())
                    }
                    ErrorClass::Hard => {
                        return Err(
                            TransactionOperationFailed::from_kv(&e, "ATR commit").no_rollback()
                        )
                    }
                    _ => {
                        error!(attempt = %self.id, "failed to record COMMITTED: {e}");
                        return Err(TransactionOperationFailed::from_kv(&e, "ATR commit"));
                    }
                },
            }
        }
    }

    /// The COMMITTED write returned ambiguously: read the entry back to
    /// learn what actually happened.
    fn resolve_commit_ambiguity(&mut self) -> TxnResult<CommitAmbiguity> {
        let attempt_id = self.id.clone();
        let overtime = self.expiry_overtime_mode;
        let expired = self.has_expired_client_side("commit_ambiguity_resolution");
        if !overtime && expired {
            self.expiry_overtime_mode = true;
            return Err(TransactionOperationFailed::new(
                ErrorClass::Expiry,
                "expired while resolving commit ambiguity",
            )
            .no_rollback()
            .ambiguous());
        }
        let atr = self.atr.as_ref().expect("commit requires an ATR");
        retry_op(|| match atr.read_entry(&attempt_id) {
            Ok(Some(entry)) => match entry.state {
                AttemptState::Committed | AttemptState::Completed => Ok(CommitAmbiguity::Committed),
                AttemptState::Aborted | AttemptState::RolledBack => Err(OpError::Fail(
                    TransactionOperationFailed::new(
                        ErrorClass::Other,
                        "transaction rolled back externally",
                    )
                    .no_rollback(),
                )),
                _ => Ok(CommitAmbiguity::StillPending),
            },
            Ok(None) => Err(OpError::Fail(
                TransactionOperationFailed::new(
                    ErrorClass::Other,
                    "attempt entry vanished during commit",
                )
                .cause(FailureCause::AtrEntryNotFound)
                .no_rollback(),
            )),
            Err(e) => match ErrorClass::from(&e) {
                ErrorClass::Hard => Err(OpError::Fail(
                    TransactionOperationFailed::from_kv(&e, "ambiguity resolution").no_rollback(),
                )),
                _ => Err(OpError::Retry("ambiguity resolution read failed".into())),
            },
        })
    }

    /// Publish one staged insert/replace.
    fn unstage_commit(&mut self, item: &StagedMutation) -> TxnResult<()> {
        let mut ambiguity_mode = false;
        let mut cas_zero = false;
        let kv_timeout = self.config.kv_timeout;
        retry_op_bounded(kv_timeout, || {
            self.check_expiry_during_commit_or_rollback("commit_doc", Some(item.doc.id()));
            self.hook_post_commit(self.hooks.before_doc_committed.clone(), item.doc.id())?;
            let content = item.content.clone().unwrap_or(Value::Null);
            trace!(
                attempt = %self.id,
                doc = item.doc.id(),
                cas_zero,
                ambiguity_mode,
                "unstaging"
            );
            let result = if item.kind == StagedKind::Insert && !cas_zero {
                // Staged inserts are tombstones; committing creates the
                // live document
                self.kv
                    .insert(item.doc.keyspace(), item.doc.id(), content, self.config.durability)
                    .map(|_| ())
            } else {
                self.kv
                    .mutate_in(
                        item.doc.keyspace(),
                        item.doc.id(),
                        &[
                            MutateSpec::upsert(fields::TXN_PREFIX, Value::Null).xattr(),
                            MutateSpec::remove(fields::TXN_PREFIX).xattr(),
                            MutateSpec::full_doc_upsert(content),
                        ],
                        MutateOptions::default()
                            .cas(if cas_zero { 0 } else { item.doc.cas() })
                            .access_deleted(true)
                            .durability(self.config.durability),
                    )
                    .map(|_| ())
            };
            match result {
                Ok(()) => Ok(()),
                Err(e) => {
                    if self.expiry_overtime_mode {
                        return Err(OpError::Fail(
                            TransactionOperationFailed::from_kv(&e, "unstage")
                                .no_rollback()
                                .failed_post_commit(),
                        ));
                    }
                    match ErrorClass::from(&e) {
                        ErrorClass::Ambiguous => {
                            ambiguity_mode = true;
                            Err(OpError::Retry("ambiguous unstage".into()))
                        }
                        ErrorClass::CasMismatch | ErrorClass::DocExists => {
                            if ambiguity_mode {
                                Err(OpError::Fail(
                                    TransactionOperationFailed::from_kv(&e, "unstage")
                                        .no_rollback()
                                        .failed_post_commit(),
                                ))
                            } else {
                                ambiguity_mode = true;
                                cas_zero = true;
                                Err(OpError::Retry("unstage CAS mismatch".into()))
                            }
                        }
                        _ => Err(OpError::Fail(
                            TransactionOperationFailed::from_kv(&e, "unstage")
                                .no_rollback()
                                .failed_post_commit(),
                        )),
                    }
                }
            }
        })
        .map_err(|e| e.no_rollback().failed_post_commit())
    }

    /// Apply one staged remove.
    fn unstage_remove(&mut self, item: &StagedMutation) -> TxnResult<()> {
        let mut cas_zero = false;
        let kv_timeout = self.config.kv_timeout;
        retry_op_bounded(kv_timeout, || {
            self.check_expiry_during_commit_or_rollback("remove_doc", Some(item.doc.id()));
            self.hook_post_commit(self.hooks.before_doc_removed.clone(), item.doc.id())?;
            match self.kv.remove(
                item.doc.keyspace(),
                item.doc.id(),
                if cas_zero { 0 } else { item.doc.cas() },
                self.config.durability,
            ) {
                Ok(()) => Ok(()),
                Err(KvError::DocumentNotFound) => Ok(()),
                Err(e) => {
                    if self.expiry_overtime_mode {
                        return Err(OpError::Fail(
                            TransactionOperationFailed::from_kv(&e, "unstage remove")
                                .no_rollback()
                                .failed_post_commit(),
                        ));
                    }
                    match ErrorClass::from(&e) {
                        ErrorClass::Ambiguous => Err(OpError::Retry("ambiguous remove".into())),
                        ErrorClass::CasMismatch if !cas_zero => {
                            cas_zero = true;
                            Err(OpError::Retry("remove CAS mismatch".into()))
                        }
                        _ => Err(OpError::Fail(
                            TransactionOperationFailed::from_kv(&e, "unstage remove")
                                .no_rollback()
                                .failed_post_commit(),
                        )),
                    }
                }
            }
        })
        .map_err(|e| e.no_rollback().failed_post_commit())
    }

    /// Record `COMPLETED` and drop the entry. The transaction is
    /// already durable; failures here are logged, not surfaced.
    fn atr_complete(&mut self) {
        if let Err(e) = (*self.hooks.before_atr_complete)(&self.id) {
            warn!(attempt = %self.id, "completion interrupted: {e}");
            return;
        }
        let atr = self.atr.as_ref().expect("commit requires an ATR");
        match atr.set_state(&self.id, AttemptState::Committed, AttemptState::Completed) {
            Ok(_) => {
                if let Err(e) = atr.remove_entry(&self.id) {
                    debug!(attempt = %self.id, "could not remove completed entry: {e}");
                }
                self.state = AttemptState::Completed;
            }
            Err(e) => {
                debug!(attempt = %self.id, "could not record COMPLETED: {e}");
            }
        }
    }

    // -----------------------------------------------------------------
    // Rollback
    // -----------------------------------------------------------------

    fn atr_abort(&mut self) -> TxnResult<()> {
        let result = retry_op(|| {
            if !self.expiry_overtime_mode && self.has_expired_client_side("atr_abort") {
                debug!(attempt = %self.id, "expired, aborting in overtime mode");
                self.expiry_overtime_mode = true;
            }
            self.hook_as_op(self.hooks.before_atr_abort.clone(), &self.id.clone())?;
            let atr = self.atr.as_ref().expect("rollback requires an ATR");
            match atr.set_state(&self.id, AttemptState::Pending, AttemptState::Aborted) {
                Ok(_) => Ok(()),
                Err(e) => {
                    if self.expiry_overtime_mode {
                        return Err(OpError::Fail(
                            TransactionOperationFailed::from_kv(&e, "ATR abort")
                                .no_rollback()
                                .expired(),
                        ));
                    }
                    match ErrorClass::from(&e) {
                        ErrorClass::PathNotFound => Err(OpError::Fail(
                            TransactionOperationFailed::from_kv(&e, "ATR abort")
                                .cause(FailureCause::AtrEntryNotFound)
                                .no_rollback(),
                        )),
                        ErrorClass::DocNotFound | ErrorClass::AtrFull | ErrorClass::Hard => {
                            Err(OpError::Fail(
                                TransactionOperationFailed::from_kv(&e, "ATR abort").no_rollback(),
                            ))
                        }
                        _ => Err(OpError::Retry("retrying ATR abort".into())),
                    }
                }
            }
        });
        result?;
        self.state = AttemptState::Aborted;
        debug!(attempt = %self.id, "ABORTED recorded");
        Ok(())
    }

    fn rollback_staged_insert_doc(&mut self, item: &StagedMutation) -> TxnResult<()> {
        retry_op(|| {
            trace!(attempt = %self.id, doc = item.doc.id(), "rolling back staged insert");
            if !self.expiry_overtime_mode && self.has_expired_client_side("rollback_insert") {
                self.expiry_overtime_mode = true;
            }
            self.hook_post_commit(self.hooks.before_doc_rolled_back.clone(), item.doc.id())?;
            match self.kv.mutate_in(
                item.doc.keyspace(),
                item.doc.id(),
                &[MutateSpec::remove(fields::TXN_PREFIX).xattr()],
                MutateOptions::default()
                    .cas(item.doc.cas())
                    .access_deleted(true)
                    .durability(self.config.durability),
            ) {
                Ok(_) => Ok(()),
                Err(KvError::DocumentNotFound) | Err(KvError::PathNotFound(_)) => Ok(()),
                Err(e) => rollback_doc_failure(self.expiry_overtime_mode, &e),
            }
        })
    }

    fn rollback_staged_replace_or_remove(&mut self, item: &StagedMutation) -> TxnResult<()> {
        retry_op(|| {
            trace!(attempt = %self.id, doc = item.doc.id(), "rolling back staged write");
            if !self.expiry_overtime_mode && self.has_expired_client_side("rollback_doc") {
                self.expiry_overtime_mode = true;
            }
            self.hook_post_commit(self.hooks.before_doc_rolled_back.clone(), item.doc.id())?;
            match self.kv.mutate_in(
                item.doc.keyspace(),
                item.doc.id(),
                &[
                    MutateSpec::upsert(fields::TXN_PREFIX, Value::Null).xattr(),
                    MutateSpec::remove(fields::TXN_PREFIX).xattr(),
                ],
                MutateOptions::default()
                    .cas(item.doc.cas())
                    .access_deleted(item.doc.links().is_deleted)
                    .durability(self.config.durability),
            ) {
                Ok(_) => Ok(()),
                Err(KvError::PathNotFound(_)) => Ok(()),
                Err(e) => rollback_doc_failure(self.expiry_overtime_mode, &e),
            }
        })
    }

    fn atr_rollback_complete(&mut self) -> TxnResult<()> {
        let result = retry_op(|| {
            if !self.expiry_overtime_mode && self.has_expired_client_side("atr_rollback_complete") {
                self.expiry_overtime_mode = true;
            }
            let atr = self.atr.as_ref().expect("rollback requires an ATR");
            match atr
                .set_state(&self.id, AttemptState::Aborted, AttemptState::RolledBack)
                .and_then(|_| atr.remove_entry(&self.id))
            {
                Ok(_) => Ok(()),
                Err(KvError::DocumentNotFound) | Err(KvError::PathNotFound(_)) => {
                    debug!(attempt = %self.id, "ATR entry already gone");
                    Ok(())
                }
                Err(e) => match ErrorClass::from(&e) {
                    ErrorClass::Hard => Err(OpError::Fail(
                        TransactionOperationFailed::from_kv(&e, "ATR rollback complete")
                            .no_rollback(),
                    )),
                    _ => Err(OpError::Retry("retrying ATR rollback complete".into())),
                },
            }
        });
        result?;
        self.state = AttemptState::RolledBack;
        debug!(attempt = %self.id, "ROLLED_BACK recorded");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Expiry
    // -----------------------------------------------------------------

    fn has_expired_client_side(&self, stage: &str) -> bool {
        if self.hooks.expire_at_stage.map(|s| s == stage).unwrap_or(false) {
            debug!(attempt = %self.id, stage, "forced expiry");
            return true;
        }
        let expired = self.meta.has_expired() || self.start.elapsed() >= self.config.expiration;
        if expired {
            debug!(attempt = %self.id, stage, "attempt expired");
        }
        expired
    }

    /// Pre-commit deadline check: past the deadline the attempt enters
    /// overtime and heads for rollback.
    fn check_expiry_pre_commit(&mut self, stage: &str, doc_id: Option<&str>) -> TxnResult<()> {
        if self.has_expired_client_side(stage) {
            debug!(
                attempt = %self.id,
                stage,
                doc = doc_id.unwrap_or(""),
                "expired, one rollback pass in overtime mode"
            );
            self.expiry_overtime_mode = true;
            return Err(TransactionOperationFailed::new(
                ErrorClass::Expiry,
                format!("attempt expired in {stage}"),
            )
            .expired());
        }
        Ok(())
    }

    /// Deadline check for steps that must not start once expired, but
    /// are exempt during the overtime pass.
    fn error_if_expired_and_not_in_overtime(
        &self,
        stage: &str,
        doc_id: Option<&str>,
    ) -> Result<(), OpError> {
        if self.expiry_overtime_mode {
            trace!(stage, "overtime mode, skipping expiry check");
            return Ok(());
        }
        if self.has_expired_client_side(stage) {
            debug!(stage, doc = doc_id.unwrap_or(""), "expired");
            return Err(OpError::Fail(
                TransactionOperationFailed::new(
                    ErrorClass::Expiry,
                    format!("attempt expired in {stage}"),
                )
                .expired(),
            ));
        }
        Ok(())
    }

    /// During commit/rollback, crossing the deadline only switches to
    /// overtime: the phase gets one margin-free pass to finish.
    fn check_expiry_during_commit_or_rollback(&mut self, stage: &str, doc_id: Option<&str>) {
        if self.expiry_overtime_mode {
            trace!(stage, "in overtime, continuing");
        } else if self.has_expired_client_side(stage) {
            debug!(stage, doc = doc_id.unwrap_or(""), "expired, entering overtime mode");
            self.expiry_overtime_mode = true;
        }
    }

    // -----------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------

    fn check_if_done(&self) -> TxnResult<()> {
        if self.mode == AttemptMode::Query {
            return Err(TransactionOperationFailed::new(
                ErrorClass::Other,
                "key-value operations are unavailable in query mode",
            )
            .no_rollback());
        }
        if self.is_done {
            return Err(TransactionOperationFailed::new(
                ErrorClass::Other,
                "attempt already committed or rolled back",
            )
            .no_rollback());
        }
        Ok(())
    }

    fn previous_operation_failed(&self) -> TransactionOperationFailed {
        TransactionOperationFailed::new(ErrorClass::Other, "a previous operation failed")
            .cause(FailureCause::PreviousOperationFailed)
    }

    /// Fail fast once any operation of this attempt has failed, and
    /// remember new failures.
    fn cache_error<T>(&mut self, f: impl FnOnce(&mut Self) -> TxnResult<T>) -> TxnResult<T> {
        if self.has_error {
            return Err(self.previous_operation_failed());
        }
        match f(self) {
            Ok(v) => Ok(v),
            Err(e) => {
                self.has_error = true;
                Err(e)
            }
        }
    }

    fn hook_as_txn(&self, hook: Hook, arg: &str, context: &str) -> TxnResult<()> {
        (*hook)(arg).map_err(|e| self.classify_stage_failure(&e, context))
    }

    fn hook_as_op(&self, hook: Hook, arg: &str) -> Result<(), OpError> {
        (*hook)(arg).map_err(|e| match ErrorClass::from(&e) {
            ErrorClass::Ambiguous => OpError::Retry("hook-injected ambiguity".into()),
            ErrorClass::Hard => OpError::Fail(
                TransactionOperationFailed::from_kv(&e, "injected failure").no_rollback(),
            ),
            _ => OpError::Fail(TransactionOperationFailed::from_kv(&e, "injected failure").retry()),
        })
    }

    fn hook_post_commit(&self, hook: Hook, arg: &str) -> Result<(), OpError> {
        (*hook)(arg).map_err(|e| {
            OpError::Fail(
                TransactionOperationFailed::from_kv(&e, "injected failure")
                    .no_rollback()
                    .failed_post_commit(),
            )
        })
    }
}

/// The document as it stood before a foreign attempt staged it: the
/// visible body with the pre-transaction CAS.
fn pre_transaction_view(
    mut doc: TransactionGetResult,
    is_deleted: bool,
) -> TxnResult<Option<TransactionGetResult>> {
    if is_deleted || doc.content().is_null() {
        // Being inserted: not visible yet
        return Ok(None);
    }
    if let Some(pre_cas) = doc.links().restore_cas {
        doc.set_cas(pre_cas);
    }
    Ok(Some(doc))
}

fn op_to_txn(e: OpError) -> TransactionOperationFailed {
    match e {
        OpError::Fail(e) => e,
        OpError::Retry(reason) => {
            TransactionOperationFailed::new(ErrorClass::Transient, reason).retry()
        }
    }
}

fn rollback_doc_failure(overtime: bool, e: &KvError) -> Result<(), OpError> {
    if overtime {
        return Err(OpError::Fail(
            TransactionOperationFailed::from_kv(e, "rollback in overtime")
                .no_rollback()
                .expired(),
        ));
    }
    match ErrorClass::from(e) {
        ErrorClass::Hard | ErrorClass::CasMismatch => Err(OpError::Fail(
            TransactionOperationFailed::from_kv(e, "rollback doc").no_rollback(),
        )),
        _ => Err(OpError::Retry("retrying doc rollback".into())),
    }
}
