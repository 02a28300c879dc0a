//! Resolution of one abandoned attempt.
//!
//! `clean()` re-reads the attempt's ATR entry and drives it to a
//! terminal state: committed attempts are rolled forward, pending and
//! aborted ones are rolled back. Every per-document action re-verifies
//! that the document still belongs to the attempt (attempt id and
//! staging CRC) and is CAS-guarded, so cleanup is idempotent and safe
//! under concurrent cleaners.

use crate::atr::{ActiveTransactionRecord, AtrManager, DocRecord};
use crate::cleanup::queue::CleanupEntry;
use crate::config::{TransactionConfig, CLEANUP_SAFETY_MARGIN_MS};
use crate::doc::fetch_doc;
use crate::fields;
use crate::forward_compat::{self, ForwardCompatStage};
use crate::state::AttemptState;
use keystone_kv::{
    DurabilityLevel, KvError, KvResult, KvStore, MutateOptions, MutateSpec,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Result of one `clean()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The attempt is in a terminal state (or was already gone).
    Done,
    /// The safety margin has not elapsed yet; try again later.
    Requeue,
}

impl CleanupEntry {
    /// Drive the attempt to a terminal state.
    pub fn clean(
        &self,
        kv: &Arc<dyn KvStore>,
        config: &TransactionConfig,
    ) -> KvResult<CleanupOutcome> {
        trace!(atr = %self.atr_id, attempt = %self.attempt_id, "cleaning attempt");
        let Some(atr) = ActiveTransactionRecord::fetch(kv.as_ref(), &self.atr_keyspace, &self.atr_id)?
        else {
            return Ok(CleanupOutcome::Done);
        };
        let Some(entry) = atr.entry(&self.attempt_id).cloned() else {
            return Ok(CleanupOutcome::Done);
        };

        if self.check_if_expired && !entry.has_expired(atr.now_ms, CLEANUP_SAFETY_MARGIN_MS) {
            trace!(
                atr = %self.atr_id,
                attempt = %self.attempt_id,
                "safety margin not elapsed, requeueing"
            );
            return Ok(CleanupOutcome::Requeue);
        }

        if let Err(e) =
            forward_compat::check(ForwardCompatStage::CleanupEntry, entry.forward_compat.as_ref())
        {
            debug!(attempt = %self.attempt_id, "leaving attempt to a newer client: {e}");
            return Ok(CleanupOutcome::Done);
        }

        let durability = config.durability;
        let mgr = AtrManager::new(
            Arc::clone(kv),
            self.atr_keyspace.clone(),
            self.atr_id.clone(),
            durability,
        );

        match entry.state {
            AttemptState::Committed => {
                for record in entry.inserted.iter().chain(entry.replaced.iter()) {
                    commit_forward_doc(kv.as_ref(), durability, &self.attempt_id, record)?;
                }
                for record in &entry.removed {
                    remove_staged_doc(kv.as_ref(), durability, &self.attempt_id, record)?;
                }
                finish_entry(&mgr, &self.attempt_id, AttemptState::Committed, AttemptState::Completed);
            }
            AttemptState::Pending => {
                if let Err(e) =
                    mgr.set_state(&self.attempt_id, AttemptState::Pending, AttemptState::Aborted)
                {
                    warn!(attempt = %self.attempt_id, "could not record ABORTED: {e}");
                    return Err(e);
                }
                self.rollback_docs(kv.as_ref(), durability, &entry.inserted, &entry.replaced, &entry.removed)?;
                finish_entry(&mgr, &self.attempt_id, AttemptState::Aborted, AttemptState::RolledBack);
            }
            AttemptState::Aborted => {
                self.rollback_docs(kv.as_ref(), durability, &entry.inserted, &entry.replaced, &entry.removed)?;
                finish_entry(&mgr, &self.attempt_id, AttemptState::Aborted, AttemptState::RolledBack);
            }
            AttemptState::Completed | AttemptState::RolledBack => {
                if let Err(e) = mgr.remove_entry(&self.attempt_id) {
                    warn!(attempt = %self.attempt_id, "could not remove finished entry: {e}");
                }
            }
            other => {
                trace!(attempt = %self.attempt_id, state = %other, "nothing to clean");
            }
        }
        debug!(atr = %self.atr_id, attempt = %self.attempt_id, "cleaned attempt");
        Ok(CleanupOutcome::Done)
    }

    fn rollback_docs(
        &self,
        kv: &dyn KvStore,
        durability: DurabilityLevel,
        inserted: &[DocRecord],
        replaced: &[DocRecord],
        removed: &[DocRecord],
    ) -> KvResult<()> {
        for record in inserted {
            rollback_staged_insert(kv, durability, &self.attempt_id, record)?;
        }
        for record in replaced.iter().chain(removed.iter()) {
            remove_txn_links(kv, durability, &self.attempt_id, record)?;
        }
        Ok(())
    }
}

/// Record the terminal state and drop the entry; failures here are
/// tolerated, another cleaner will finish.
fn finish_entry(mgr: &AtrManager, attempt_id: &str, from: AttemptState, to: AttemptState) {
    if let Err(e) = mgr.set_state(attempt_id, from, to) {
        warn!(attempt = %attempt_id, "could not record {to}: {e}");
        return;
    }
    if let Err(e) = mgr.remove_entry(attempt_id) {
        warn!(attempt = %attempt_id, "could not remove entry: {e}");
    }
}

/// Shared guard: the document still carries this attempt's stage.
///
/// `require_crc` additionally demands that the body has not been
/// touched since staging (an unrelated interleaved write voids the
/// staged CRC).
fn staged_by(
    kv: &dyn KvStore,
    attempt_id: &str,
    record: &DocRecord,
    require_crc: bool,
) -> KvResult<Option<crate::doc::TransactionGetResult>> {
    let Some((doc, _res)) = fetch_doc(kv, &record.keyspace, &record.id)? else {
        trace!(id = %record.id, "document gone, skipping");
        return Ok(None);
    };
    let links = doc.links();
    if !links.has_staged_write()
        || !(links.has_staged_content() || links.is_document_being_removed())
    {
        trace!(id = %record.id, "no staged content, assuming committed elsewhere");
        return Ok(None);
    }
    if links.staged_attempt_id.as_deref() != Some(attempt_id) {
        trace!(id = %record.id, "staged by a different attempt, skipping");
        return Ok(None);
    }
    if require_crc {
        let meta_crc = doc.metadata().and_then(|m| m.crc32);
        if meta_crc.is_none()
            || links.crc32_of_staging.is_none()
            || meta_crc != links.crc32_of_staging
        {
            debug!(id = %record.id, "body changed since staging, skipping");
            return Ok(None);
        }
    }
    Ok(Some(doc))
}

/// Publish the staged content of an insert/replace (idempotent).
pub(crate) fn commit_forward_doc(
    kv: &dyn KvStore,
    durability: DurabilityLevel,
    attempt_id: &str,
    record: &DocRecord,
) -> KvResult<()> {
    let Some(doc) = staged_by(kv, attempt_id, record, true)? else {
        return Ok(());
    };
    if doc.links().is_document_being_removed() {
        return Ok(());
    }
    let content = doc
        .links()
        .staged_content
        .clone()
        .unwrap_or(Value::Null);
    let outcome = if doc.links().is_deleted {
        // Staged insert: the tombstone becomes a live document
        kv.insert(&record.keyspace, &record.id, content, durability)
            .map(|_| ())
    } else {
        kv.mutate_in(
            &record.keyspace,
            &record.id,
            &[
                MutateSpec::upsert(fields::TXN_PREFIX, Value::Null).xattr(),
                MutateSpec::remove(fields::TXN_PREFIX).xattr(),
                MutateSpec::full_doc_upsert(content),
            ],
            MutateOptions::default().cas(doc.cas()).durability(durability),
        )
        .map(|_| ())
    };
    match outcome {
        Ok(()) => {
            trace!(id = %record.id, "committed forward");
            Ok(())
        }
        Err(KvError::CasMismatch) | Err(KvError::DocumentExists) | Err(KvError::DocumentNotFound) => {
            trace!(id = %record.id, "document moved on, skipping");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Apply a staged remove (idempotent).
pub(crate) fn remove_staged_doc(
    kv: &dyn KvStore,
    durability: DurabilityLevel,
    attempt_id: &str,
    record: &DocRecord,
) -> KvResult<()> {
    let Some(doc) = staged_by(kv, attempt_id, record, true)? else {
        return Ok(());
    };
    if !doc.links().is_document_being_removed() {
        trace!(id = %record.id, "not staged for removal, skipping");
        return Ok(());
    }
    match kv.remove(&record.keyspace, &record.id, doc.cas(), durability) {
        Ok(()) => Ok(()),
        Err(KvError::CasMismatch) | Err(KvError::DocumentNotFound) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Undo a staged insert: drop the staged tombstone, or the document if
/// an ambiguous write made it live.
pub(crate) fn rollback_staged_insert(
    kv: &dyn KvStore,
    durability: DurabilityLevel,
    attempt_id: &str,
    record: &DocRecord,
) -> KvResult<()> {
    let Some(doc) = staged_by(kv, attempt_id, record, true)? else {
        return Ok(());
    };
    let outcome = if doc.links().is_deleted {
        kv.mutate_in(
            &record.keyspace,
            &record.id,
            &[MutateSpec::remove(fields::TXN_PREFIX).xattr()],
            MutateOptions::default()
                .cas(doc.cas())
                .access_deleted(true)
                .durability(durability),
        )
        .map(|_| ())
    } else {
        kv.remove(&record.keyspace, &record.id, doc.cas(), durability)
    };
    match outcome {
        Ok(()) => Ok(()),
        Err(KvError::CasMismatch)
        | Err(KvError::DocumentNotFound)
        | Err(KvError::PathNotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Strip the `txn` xattr from a staged replace/remove, restoring the
/// pre-transaction view.
pub(crate) fn remove_txn_links(
    kv: &dyn KvStore,
    durability: DurabilityLevel,
    attempt_id: &str,
    record: &DocRecord,
) -> KvResult<()> {
    let Some(doc) = staged_by(kv, attempt_id, record, false)? else {
        return Ok(());
    };
    match kv.mutate_in(
        &record.keyspace,
        &record.id,
        &[
            MutateSpec::upsert(fields::TXN_PREFIX, Value::Null).xattr(),
            MutateSpec::remove(fields::TXN_PREFIX).xattr(),
        ],
        MutateOptions::default()
            .cas(doc.cas())
            .access_deleted(true)
            .durability(durability),
    ) {
        Ok(_) => Ok(()),
        Err(KvError::CasMismatch)
        | Err(KvError::DocumentNotFound)
        | Err(KvError::PathNotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}
