//! Per-transaction bookkeeping shared across attempts.
//!
//! Attempts never hold references to each other or to their owning
//! transaction object; everything they share lives here as plain data
//! behind an `Arc`.

use crate::state::AttemptState;
use keystone_kv::KeyspaceRef;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Identity and deadline of one logical transaction, shared by all of
/// its attempts.
#[derive(Debug)]
pub struct TransactionMeta {
    id: String,
    start: Instant,
    timeout: Duration,
    atr: Mutex<Option<(String, KeyspaceRef)>>,
}

impl TransactionMeta {
    /// New transaction identity with deadline `now + timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            start: Instant::now(),
            timeout,
            atr: Mutex::new(None),
        }
    }

    /// Transaction id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the transaction began.
    pub fn start(&self) -> Instant {
        self.start
    }

    /// Whether the global deadline has passed.
    pub fn has_expired(&self) -> bool {
        self.start.elapsed() >= self.timeout
    }

    /// Time left before the global deadline.
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.start.elapsed())
    }

    /// Record the ATR the transaction anchored to.
    pub fn set_atr(&self, atr_id: &str, keyspace: &KeyspaceRef) {
        let mut atr = self.atr.lock();
        if atr.is_none() {
            *atr = Some((atr_id.to_string(), keyspace.clone()));
        }
    }

    /// The ATR the transaction anchored to, if any mutation happened.
    pub fn atr(&self) -> Option<(String, KeyspaceRef)> {
        self.atr.lock().clone()
    }
}

/// Summary of one attempt, kept for the final result and error reports.
#[derive(Debug, Clone)]
pub struct TransactionAttempt {
    /// Attempt id
    pub id: String,
    /// State the attempt ended in
    pub state: AttemptState,
}

/// Outcome of a successful (or committed-but-deferred) transaction.
#[derive(Debug, Clone)]
pub struct TransactionResult {
    /// Transaction id
    pub transaction_id: String,
    /// ATR the transaction anchored to; `None` for read-only bodies
    pub atr_id: Option<String>,
    /// Collection holding that ATR
    pub atr_collection: Option<KeyspaceRef>,
    /// Every attempt, in execution order
    pub attempts: Vec<TransactionAttempt>,
    /// `false` when post-commit unstaging was deferred to cleanup
    pub unstaging_complete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline() {
        let meta = TransactionMeta::new(Duration::from_millis(50));
        assert!(!meta.has_expired());
        std::thread::sleep(Duration::from_millis(60));
        assert!(meta.has_expired());
        assert_eq!(meta.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_first_atr_sticks() {
        let meta = TransactionMeta::new(Duration::from_secs(1));
        let ks = KeyspaceRef::default_collection("b");
        meta.set_atr("_txn:atr-1-#1", &ks);
        meta.set_atr("_txn:atr-2-#2", &ks);
        assert_eq!(meta.atr().unwrap().0, "_txn:atr-1-#1");
    }
}
