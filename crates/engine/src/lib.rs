//! Client-side multi-document transactions over a CAS document store.
//!
//! The engine layers ACID semantics on top of per-document
//! compare-and-swap and sub-document operations: mutations are staged
//! into document xattrs, anchored to an Active Transaction Record, and
//! atomically published (or restored) when the attempt's durable state
//! flips. A background service reconciles attempts abandoned by crashed
//! clients.
//!
//! [`Transactions`] is the entry point; applications express their
//! logic as a closure over an [`AttemptContext`] and the engine owns
//! retries, conflict resolution, expiry and cleanup.

#![warn(clippy::all)]

pub mod atr;
pub mod attempt;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod doc;
pub mod error;
pub mod fields;
pub mod forward_compat;
pub mod hooks;
pub mod links;
pub mod staged;
pub mod state;

pub use attempt::AttemptContext;
pub use cleanup::CleanupService;
pub use config::TransactionConfig;
pub use context::{TransactionAttempt, TransactionMeta, TransactionResult};
pub use doc::{DocumentMetadata, TransactionGetResult};
pub use error::{
    ErrorClass, FailureCause, FinalErrorKind, TransactionError, TransactionOperationFailed,
    TxnResult,
};
pub use hooks::AttemptHooks;
pub use state::AttemptState;

use crate::context::TransactionAttempt as AttemptSummary;
use crate::error::transaction_retry_delay;
use keystone_kv::KvStore;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// The transactions facility: owns configuration and the background
/// cleanup service, and runs transaction bodies.
pub struct Transactions {
    kv: Arc<dyn KvStore>,
    config: TransactionConfig,
    hooks: Arc<AttemptHooks>,
    cleanup: CleanupService,
}

impl Transactions {
    /// Create the facility and start background cleanup.
    pub fn new(kv: Arc<dyn KvStore>, config: TransactionConfig) -> Self {
        Self::with_hooks(kv, config, AttemptHooks::default())
    }

    /// Like [`Transactions::new`] with attempt interception points
    /// installed; used by fault-injection tests.
    pub fn with_hooks(kv: Arc<dyn KvStore>, config: TransactionConfig, hooks: AttemptHooks) -> Self {
        info!("creating transactions facility");
        let cleanup = CleanupService::start(Arc::clone(&kv), config.clone());
        Self {
            kv,
            config,
            hooks: Arc::new(hooks),
            cleanup,
        }
    }

    /// The background cleanup service.
    pub fn cleanup(&self) -> &CleanupService {
        &self.cleanup
    }

    /// Run a transaction.
    ///
    /// The body may execute several times (one attempt per retryable
    /// failure) until the configured timeout; it must therefore be free
    /// of side effects outside the transaction. On success the body's
    /// staged mutations are visible atomically; `unstaging_complete`
    /// reports whether post-commit publication finished inline or was
    /// deferred to cleanup.
    pub fn run<F>(&self, mut body: F) -> Result<TransactionResult, TransactionError>
    where
        F: FnMut(&mut AttemptContext) -> TxnResult<()>,
    {
        let meta = Arc::new(context::TransactionMeta::new(self.config.timeout));
        info!(txn = %meta.id(), "starting transaction");
        let mut attempts: Vec<AttemptSummary> = Vec::new();
        let mut atr_offset = 0u32;
        let mut iteration = 0u32;

        loop {
            let mut ctx = AttemptContext::new(
                Arc::clone(&self.kv),
                self.config.clone(),
                Arc::clone(&meta),
                self.cleanup.queue(),
                Arc::clone(&self.hooks),
                atr_offset,
            );
            debug!(txn = %meta.id(), attempt = ctx.attempt_id(), iteration, "starting attempt");

            let outcome = body(&mut ctx).and_then(|()| {
                if ctx.is_done() {
                    Ok(())
                } else {
                    ctx.commit()
                }
            });

            // Lost-attempt cleanup needs to know about every bucket we
            // ever anchored metadata in
            if let Some((_, keyspace)) = ctx.atr_info() {
                self.cleanup.register_keyspace(keyspace);
            }

            match outcome {
                Ok(()) => {
                    attempts.push(AttemptSummary {
                        id: ctx.attempt_id().to_string(),
                        state: ctx.state(),
                    });
                    self.record_for_cleanup(&ctx);
                    let result =
                        self.make_result(&meta, attempts, ctx.unstaging_complete());
                    info!(txn = %meta.id(), "transaction committed");
                    return Ok(result);
                }
                Err(e) => {
                    warn!(
                        txn = %meta.id(),
                        attempt = ctx.attempt_id(),
                        "attempt failed: {e}"
                    );
                    if e.should_rollback() && !ctx.is_done() {
                        if let Err(rb) = ctx.rollback() {
                            debug!(attempt = ctx.attempt_id(), "auto-rollback failed: {rb}");
                            attempts.push(AttemptSummary {
                                id: ctx.attempt_id().to_string(),
                                state: ctx.state(),
                            });
                            self.record_for_cleanup(&ctx);
                            return self.finish(&meta, attempts, e, ctx.unstaging_complete());
                        }
                    }
                    attempts.push(AttemptSummary {
                        id: ctx.attempt_id().to_string(),
                        state: ctx.state(),
                    });
                    self.record_for_cleanup(&ctx);

                    if e.failure_cause() == FailureCause::AtrFull {
                        // Steer the next attempt to a different record
                        atr_offset = atr_offset.wrapping_add(1);
                    }
                    if e.should_retry() {
                        if !meta.has_expired() {
                            let delay = transaction_retry_delay(iteration).min(meta.remaining());
                            trace!(
                                txn = %meta.id(),
                                delay_us = delay.as_micros() as u64,
                                "retrying after backoff"
                            );
                            std::thread::sleep(delay);
                            iteration += 1;
                            continue;
                        }
                        debug!(txn = %meta.id(), "retryable failure but transaction expired");
                        let result = self.make_result(&meta, attempts, false);
                        return Err(TransactionError::Expired { result });
                    }
                    return self.finish(&meta, attempts, e, ctx.unstaging_complete());
                }
            }
        }
    }

    /// Stop background cleanup, draining within the shutdown budget.
    pub fn close(&self) {
        info!("closing transactions facility");
        self.cleanup.close();
    }

    fn record_for_cleanup(&self, ctx: &AttemptContext) {
        self.cleanup
            .add_attempt(ctx.state(), ctx.atr_info(), ctx.attempt_id());
    }

    fn make_result(
        &self,
        meta: &context::TransactionMeta,
        attempts: Vec<AttemptSummary>,
        unstaging_complete: bool,
    ) -> TransactionResult {
        let atr = meta.atr();
        TransactionResult {
            transaction_id: meta.id().to_string(),
            atr_id: atr.as_ref().map(|(id, _)| id.clone()),
            atr_collection: atr.map(|(_, ks)| ks),
            attempts,
            unstaging_complete,
        }
    }

    fn finish(
        &self,
        meta: &context::TransactionMeta,
        attempts: Vec<AttemptSummary>,
        e: TransactionOperationFailed,
        unstaging_complete: bool,
    ) -> Result<TransactionResult, TransactionError> {
        let result = self.make_result(meta, attempts, unstaging_complete);
        match e.final_kind() {
            FinalErrorKind::Failed => Err(TransactionError::Failed {
                result,
                cause: e.failure_cause(),
                msg: e.message().to_string(),
            }),
            FinalErrorKind::Expired => Err(TransactionError::Expired { result }),
            FinalErrorKind::CommitAmbiguous => Err(TransactionError::CommitAmbiguous { result }),
            // The transaction is committed; cleanup owns the rest
            FinalErrorKind::FailedPostCommit => Ok(result),
        }
    }
}

impl Drop for Transactions {
    fn drop(&mut self) {
        self.cleanup.close();
    }
}
