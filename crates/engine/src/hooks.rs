//! Test interception points.
//!
//! Fault-injection scenarios (crash between protocol steps, expiry at a
//! chosen stage, ATR placement overrides) hook the attempt at named
//! points. Production code paths never set these; the default hook set
//! is entirely inert.

use keystone_kv::KvError;
use std::sync::Arc;

/// Callback invoked at an interception point. Returning an error makes
/// the attempt observe it as if the store had produced it.
pub type Hook = Arc<dyn Fn(&str) -> Result<(), KvError> + Send + Sync>;

fn inert() -> Hook {
    Arc::new(|_| Ok(()))
}

/// Interception points of one attempt.
#[derive(Clone)]
pub struct AttemptHooks {
    /// Before the ATR entry is created
    pub before_atr_pending: Hook,
    /// Before a staged insert write (arg: doc id)
    pub before_staged_insert: Hook,
    /// Before a staged replace write (arg: doc id)
    pub before_staged_replace: Hook,
    /// Before a staged remove write (arg: doc id)
    pub before_staged_remove: Hook,
    /// Before the COMMITTED record is written
    pub before_atr_commit: Hook,
    /// After the COMMITTED record, before any unstage (arg: attempt id)
    pub after_atr_commit: Hook,
    /// Before one document is unstaged at commit (arg: doc id)
    pub before_doc_committed: Hook,
    /// Before one staged remove is applied at commit (arg: doc id)
    pub before_doc_removed: Hook,
    /// Before the ABORTED record is written
    pub before_atr_abort: Hook,
    /// Before one document is restored at rollback (arg: doc id)
    pub before_doc_rolled_back: Hook,
    /// Before the attempt entry is removed after completion
    pub before_atr_complete: Hook,
    /// Overrides ATR placement when set (arg ignored)
    pub atr_id_override: Option<String>,
    /// Forces the client-side expiry check at the named stage
    pub expire_at_stage: Option<&'static str>,
}

impl Default for AttemptHooks {
    fn default() -> Self {
        Self {
            before_atr_pending: inert(),
            before_staged_insert: inert(),
            before_staged_replace: inert(),
            before_staged_remove: inert(),
            before_atr_commit: inert(),
            after_atr_commit: inert(),
            before_doc_committed: inert(),
            before_doc_removed: inert(),
            before_atr_abort: inert(),
            before_doc_rolled_back: inert(),
            before_atr_complete: inert(),
            atr_id_override: None,
            expire_at_stage: None,
        }
    }
}

impl std::fmt::Debug for AttemptHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptHooks")
            .field("atr_id_override", &self.atr_id_override)
            .field("expire_at_stage", &self.expire_at_stage)
            .finish_non_exhaustive()
    }
}
