//! Error classification and propagation.
//!
//! Raw store failures are caught at the facade boundary and mapped into
//! an [`ErrorClass`]. Everything that goes wrong inside an attempt is,
//! or is converted into, a [`TransactionOperationFailed`] carrying the
//! flags the transaction context consumes to decide between retrying
//! with a fresh attempt, rolling back, or surfacing a final error.

use crate::context::TransactionResult;
use keystone_kv::KvError;
use rand::Rng;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Classification of a raw document-store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Unrecoverable: auth, malformed request, unsupported operation
    Hard,
    /// Unclassified failure
    Other,
    /// Transient failure; a retry may succeed
    Transient,
    /// Outcome unknown: the operation may have been applied
    Ambiguous,
    /// Insert hit an existing document
    DocExists,
    /// Document absent
    DocNotFound,
    /// Sub-document path absent
    PathNotFound,
    /// Sub-document path already present
    PathExists,
    /// CAS guard failed
    CasMismatch,
    /// Document staged by a live foreign attempt
    WriteWriteConflict,
    /// ATR attempt map cannot grow further
    AtrFull,
    /// Attempt deadline passed
    Expiry,
}

impl From<&KvError> for ErrorClass {
    fn from(e: &KvError) -> Self {
        match e {
            KvError::DocumentNotFound => ErrorClass::DocNotFound,
            KvError::DocumentExists => ErrorClass::DocExists,
            KvError::CasMismatch => ErrorClass::CasMismatch,
            KvError::PathNotFound(_) => ErrorClass::PathNotFound,
            KvError::PathExists(_) => ErrorClass::PathExists,
            KvError::ValueTooLarge => ErrorClass::AtrFull,
            KvError::Timeout | KvError::Ambiguous => ErrorClass::Ambiguous,
            // An unmet durability requirement is retryable: the cluster
            // may re-form a majority
            KvError::Temporary | KvError::DurabilityImpossible => ErrorClass::Transient,
            KvError::Access(_) | KvError::Invalid(_) => ErrorClass::Hard,
        }
    }
}

/// Underlying condition reported to the application alongside the
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureCause {
    /// Nothing more specific is known
    #[default]
    Unknown,
    /// A document the body addressed does not exist
    DocumentNotFound,
    /// A document the body tried to insert already exists
    DocumentExists,
    /// A forward-compatibility requirement was not met
    ForwardCompatibility,
    /// The ATR attempt map is full
    AtrFull,
    /// The attempt's ATR entry disappeared
    AtrEntryNotFound,
    /// An earlier operation in the same attempt already failed
    PreviousOperationFailed,
}

/// Which public error a failed attempt surfaces as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalErrorKind {
    /// `TransactionError::Failed`
    #[default]
    Failed,
    /// `TransactionError::Expired`
    Expired,
    /// Post-commit failure: the transaction is committed, cleanup will
    /// finish unstaging; reported via `unstaging_complete = false`
    FailedPostCommit,
    /// `TransactionError::CommitAmbiguous`
    CommitAmbiguous,
}

/// Failure of one operation inside an attempt.
///
/// Flags (§ error classification):
/// - `retry` — the context should run a fresh attempt,
/// - `rollback` — the current attempt must roll back first,
/// - `raise` — what to surface if no retry happens.
///
/// Permitted combinations: `{retry, rollback}`, `{rollback}`,
/// `{commit_ambiguous}` (no rollback past the commit point), `{final}`.
#[derive(Debug, Clone, Error)]
#[error("transaction operation failed ({class:?}): {msg}")]
pub struct TransactionOperationFailed {
    class: ErrorClass,
    retry: bool,
    rollback: bool,
    raise: FinalErrorKind,
    cause: FailureCause,
    msg: String,
}

impl TransactionOperationFailed {
    /// New failure: not retryable, rollback required, surfaces as
    /// `Failed`.
    pub fn new(class: ErrorClass, msg: impl Into<String>) -> Self {
        Self {
            class,
            retry: false,
            rollback: true,
            raise: FinalErrorKind::Failed,
            cause: FailureCause::Unknown,
            msg: msg.into(),
        }
    }

    /// Classify and wrap a raw store failure.
    pub fn from_kv(e: &KvError, context: &str) -> Self {
        Self::new(ErrorClass::from(e), format!("{context}: {e}"))
    }

    /// Ask the context to retry with a fresh attempt.
    pub fn retry(mut self) -> Self {
        self.retry = true;
        debug_assert!(self.rollback, "retry without rollback is not a legal combination");
        self
    }

    /// The attempt must not (or can no longer) roll back.
    pub fn no_rollback(mut self) -> Self {
        self.rollback = false;
        self.retry = false;
        self
    }

    /// Surface as `Expired`.
    pub fn expired(mut self) -> Self {
        self.raise = FinalErrorKind::Expired;
        self
    }

    /// Post-commit failure; cleanup finishes the transaction.
    pub fn failed_post_commit(mut self) -> Self {
        self.raise = FinalErrorKind::FailedPostCommit;
        self
    }

    /// Surface as `CommitAmbiguous`.
    pub fn ambiguous(mut self) -> Self {
        self.raise = FinalErrorKind::CommitAmbiguous;
        self
    }

    /// Attach a specific cause.
    pub fn cause(mut self, cause: FailureCause) -> Self {
        self.cause = cause;
        self
    }

    /// Shorthand for the forward-compatibility cause.
    pub fn forward_compat(self) -> Self {
        self.cause(FailureCause::ForwardCompatibility)
    }

    /// Error class observed at the facade.
    pub fn class(&self) -> ErrorClass {
        self.class
    }

    /// Whether the context should retry with a fresh attempt.
    pub fn should_retry(&self) -> bool {
        self.retry
    }

    /// Whether the current attempt must roll back.
    pub fn should_rollback(&self) -> bool {
        self.rollback
    }

    /// What to surface if no retry happens.
    pub fn final_kind(&self) -> FinalErrorKind {
        self.raise
    }

    /// Underlying condition.
    pub fn failure_cause(&self) -> FailureCause {
        self.cause
    }

    /// Human-readable description.
    pub fn message(&self) -> &str {
        &self.msg
    }
}

/// Result alias for operations executed inside a transaction body.
pub type TxnResult<T> = Result<T, TransactionOperationFailed>;

/// Failure of a whole transaction, surfaced by `run()`.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The transaction failed and was rolled back.
    #[error("transaction {} failed: {msg}", result.transaction_id)]
    Failed {
        /// Attempt log and ids
        result: TransactionResult,
        /// Underlying condition
        cause: FailureCause,
        /// Description of the final failure
        msg: String,
    },

    /// The transaction ran out of time.
    #[error("transaction {} expired", result.transaction_id)]
    Expired {
        /// Attempt log and ids
        result: TransactionResult,
    },

    /// The commit outcome is unknown; cleanup may still complete it.
    #[error("transaction {} commit ambiguous", result.transaction_id)]
    CommitAmbiguous {
        /// Attempt log and ids
        result: TransactionResult,
    },
}

impl TransactionError {
    /// The attempt log carried by every variant.
    pub fn result(&self) -> &TransactionResult {
        match self {
            TransactionError::Failed { result, .. }
            | TransactionError::Expired { result }
            | TransactionError::CommitAmbiguous { result } => result,
        }
    }
}

// ---------------------------------------------------------------------
// Bounded retry of individual protocol steps
// ---------------------------------------------------------------------

/// Outcome of one iteration of a bounded retry loop.
pub(crate) enum OpError {
    /// Run the closure again after a short delay.
    Retry(String),
    /// Give up with this failure.
    Fail(TransactionOperationFailed),
}

impl From<TransactionOperationFailed> for OpError {
    fn from(e: TransactionOperationFailed) -> Self {
        OpError::Fail(e)
    }
}

pub(crate) const RETRY_OP_DELAY: Duration = Duration::from_millis(50);
pub(crate) const RETRY_OP_BUDGET: Duration = Duration::from_millis(500);

/// Re-run `f` on [`OpError::Retry`] with a fixed delay until `budget`
/// elapses; an exhausted budget fails as a retryable transient.
pub(crate) fn retry_op_bounded<T>(
    budget: Duration,
    mut f: impl FnMut() -> Result<T, OpError>,
) -> TxnResult<T> {
    let deadline = Instant::now() + budget;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(OpError::Fail(e)) => return Err(e),
            Err(OpError::Retry(reason)) => {
                if Instant::now() + RETRY_OP_DELAY >= deadline {
                    return Err(TransactionOperationFailed::new(
                        ErrorClass::Transient,
                        format!("retries exhausted: {reason}"),
                    )
                    .retry());
                }
                std::thread::sleep(RETRY_OP_DELAY);
            }
        }
    }
}

/// [`retry_op_bounded`] with the default 500 ms budget.
pub(crate) fn retry_op<T>(f: impl FnMut() -> Result<T, OpError>) -> TxnResult<T> {
    retry_op_bounded(RETRY_OP_BUDGET, f)
}

/// Exponential backoff between iterations, for waits on foreign
/// attempts: `initial` doubling to `cap`, bounded by `budget`.
pub(crate) fn retry_op_exponential<T>(
    initial: Duration,
    cap: Duration,
    budget: Duration,
    mut f: impl FnMut() -> Result<T, OpError>,
) -> Result<T, OpError> {
    let deadline = Instant::now() + budget;
    let mut delay = initial;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(OpError::Fail(e)) => return Err(OpError::Fail(e)),
            Err(OpError::Retry(reason)) => {
                if Instant::now() + delay >= deadline {
                    return Err(OpError::Retry(reason));
                }
                std::thread::sleep(delay);
                delay = (delay * 2).min(cap);
            }
        }
    }
}

/// Delay before retrying a whole transaction: 1 ms doubling to 100 ms,
/// with ±50% jitter.
pub(crate) fn transaction_retry_delay(iteration: u32) -> Duration {
    let base_ms = 1u64 << iteration.min(7);
    let base_ms = base_ms.min(100);
    let jittered = rand::thread_rng().gen_range((base_ms as f64 * 0.5)..=(base_ms as f64 * 1.5));
    Duration::from_micros((jittered * 1000.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_error_classification() {
        assert_eq!(
            ErrorClass::from(&KvError::DocumentNotFound),
            ErrorClass::DocNotFound
        );
        assert_eq!(ErrorClass::from(&KvError::Timeout), ErrorClass::Ambiguous);
        assert_eq!(
            ErrorClass::from(&KvError::DurabilityImpossible),
            ErrorClass::Transient
        );
        assert_eq!(
            ErrorClass::from(&KvError::Access("denied".into())),
            ErrorClass::Hard
        );
        assert_eq!(
            ErrorClass::from(&KvError::ValueTooLarge),
            ErrorClass::AtrFull
        );
    }

    #[test]
    fn test_flag_combinations() {
        let e = TransactionOperationFailed::new(ErrorClass::Transient, "x");
        assert!(!e.should_retry());
        assert!(e.should_rollback());

        let e = e.retry();
        assert!(e.should_retry() && e.should_rollback());

        // no_rollback clears retry: rollback-less retry is not legal
        let e = TransactionOperationFailed::new(ErrorClass::Hard, "x")
            .retry()
            .no_rollback();
        assert!(!e.should_retry());
        assert!(!e.should_rollback());
    }

    #[test]
    fn test_retry_op_budget_exhaustion() {
        let start = Instant::now();
        let res: TxnResult<()> = retry_op_bounded(Duration::from_millis(120), || {
            Err(OpError::Retry("still conflicted".into()))
        });
        let err = res.unwrap_err();
        assert!(err.should_retry());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_retry_op_eventually_succeeds() {
        let mut left = 2;
        let res = retry_op(|| {
            if left == 0 {
                Ok(7)
            } else {
                left -= 1;
                Err(OpError::Retry("not yet".into()))
            }
        });
        assert_eq!(res.unwrap(), 7);
    }

    #[test]
    fn test_transaction_retry_delay_caps() {
        for i in 0..20 {
            let d = transaction_retry_delay(i);
            assert!(d <= Duration::from_millis(150), "iteration {i} gave {d:?}");
        }
    }
}
