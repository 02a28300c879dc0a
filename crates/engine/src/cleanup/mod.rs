//! Background cleanup of abandoned attempts.
//!
//! Three dedicated threads per process:
//! - `keystone-heartbeat` maintains this client's registry entry and
//!   shard assignment in every known bucket,
//! - `keystone-lost-scan` walks the assigned ATR shard once per
//!   cleanup window, pacing reads to spread load, and queues attempts
//!   whose expiry (plus safety margin) has passed,
//! - `keystone-cleanup` drains the queue and drives each entry to a
//!   terminal state.
//!
//! All loops wake promptly on shutdown via a shared condition variable;
//! the dispatcher gets a bounded final drain, after which remaining
//! work is abandoned to the other clients.

pub mod client_record;
pub mod entry;
pub mod queue;

pub use client_record::ClientRecordDetails;
pub use entry::CleanupOutcome;
pub use queue::{CleanupEntry, CleanupQueue};

use crate::atr::{self, ActiveTransactionRecord};
use crate::config::{TransactionConfig, CLEANUP_SAFETY_MARGIN_MS, HEARTBEAT_INTERVAL};
use crate::state::AttemptState;
use keystone_kv::{KeyspaceRef, KvStore};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

struct ServiceInner {
    kv: Arc<dyn KvStore>,
    config: TransactionConfig,
    client_uuid: String,
    running: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
    queue: Arc<CleanupQueue>,
    keyspaces: Mutex<HashSet<KeyspaceRef>>,
    assignments: Mutex<HashMap<KeyspaceRef, ClientRecordDetails>>,
}

impl ServiceInner {
    /// Sleep up to `dur`, returning early (false) on shutdown.
    fn interruptible_wait(&self, dur: Duration) -> bool {
        let mut guard = self.wake_lock.lock();
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        let _ = self.wake.wait_for(&mut guard, dur);
        self.running.load(Ordering::Acquire)
    }

    fn known_keyspaces(&self) -> Vec<KeyspaceRef> {
        self.keyspaces.lock().iter().cloned().collect()
    }
}

/// Handle on the background cleanup machinery of one
/// [`crate::Transactions`] instance.
pub struct CleanupService {
    inner: Arc<ServiceInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl CleanupService {
    pub(crate) fn start(kv: Arc<dyn KvStore>, config: TransactionConfig) -> Self {
        let inner = Arc::new(ServiceInner {
            kv,
            client_uuid: Uuid::new_v4().to_string(),
            running: AtomicBool::new(true),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
            queue: Arc::new(CleanupQueue::new()),
            keyspaces: Mutex::new(HashSet::new()),
            assignments: Mutex::new(HashMap::new()),
            config,
        });
        let mut threads = Vec::new();

        if inner.config.cleanup_lost_attempts {
            let hb = Arc::clone(&inner);
            threads.push(
                std::thread::Builder::new()
                    .name("keystone-heartbeat".into())
                    .spawn(move || heartbeat_loop(&hb))
                    .expect("failed to spawn heartbeat thread"),
            );
            let scan = Arc::clone(&inner);
            threads.push(
                std::thread::Builder::new()
                    .name("keystone-lost-scan".into())
                    .spawn(move || lost_attempts_loop(&scan))
                    .expect("failed to spawn lost-attempt scanner"),
            );
        }
        if inner.config.cleanup_client_attempts || inner.config.cleanup_lost_attempts {
            let disp = Arc::clone(&inner);
            threads.push(
                std::thread::Builder::new()
                    .name("keystone-cleanup".into())
                    .spawn(move || dispatcher_loop(&disp))
                    .expect("failed to spawn cleanup dispatcher"),
            );
        }
        info!(client = %inner.client_uuid, threads = threads.len(), "cleanup service started");
        Self {
            inner,
            threads: Mutex::new(threads),
        }
    }

    /// This process's registry uuid.
    pub fn client_uuid(&self) -> &str {
        &self.inner.client_uuid
    }

    pub(crate) fn queue(&self) -> Arc<CleanupQueue> {
        Arc::clone(&self.inner.queue)
    }

    /// Make a bucket's metadata collection known to the heartbeat and
    /// scanner loops.
    pub(crate) fn register_keyspace(&self, keyspace: KeyspaceRef) {
        if self.inner.keyspaces.lock().insert(keyspace.clone()) {
            debug!(keyspace = %keyspace, "registered for lost-attempt cleanup");
        }
    }

    /// Queue one of this client's own attempts that could not be
    /// finished inline.
    pub(crate) fn add_attempt(
        &self,
        state: AttemptState,
        atr: Option<(String, KeyspaceRef)>,
        attempt_id: &str,
    ) {
        if !self.inner.config.cleanup_client_attempts {
            trace!(attempt = %attempt_id, "client-attempt cleanup disabled");
            return;
        }
        if matches!(state, AttemptState::NotStarted) || state.is_terminal() {
            trace!(attempt = %attempt_id, state = %state, "nothing for cleanup");
            return;
        }
        let Some((atr_id, keyspace)) = atr else { return };
        debug!(attempt = %attempt_id, state = %state, "queueing own attempt for cleanup");
        self.inner.queue.push(CleanupEntry::new(
            keyspace,
            atr_id,
            attempt_id,
            Instant::now() + self.inner.config.expiration,
            false,
        ));
    }

    /// Drain the queue immediately, ignoring eligibility times. Returns
    /// the number of entries driven to a terminal state.
    pub fn force_cleanup_queue(&self) -> usize {
        let mut cleaned = 0;
        while let Some(entry) = self.inner.queue.pop(false) {
            match entry.clean(&self.inner.kv, &self.inner.config) {
                Ok(CleanupOutcome::Done) => cleaned += 1,
                Ok(CleanupOutcome::Requeue) => {
                    // Forced: act regardless of the safety margin
                    let mut entry = entry;
                    entry.check_if_expired = false;
                    entry.min_start_time = Instant::now();
                    if entry.clean(&self.inner.kv, &self.inner.config).is_ok() {
                        cleaned += 1;
                    }
                }
                Err(e) => warn!(atr = %entry.atr_id, "forced cleanup failed: {e}"),
            }
        }
        cleaned
    }

    /// Clean every attempt found in one ATR, ignoring expiry windows.
    pub fn force_cleanup_atr(&self, keyspace: &KeyspaceRef, atr_id: &str) -> usize {
        let atr = match ActiveTransactionRecord::fetch(self.inner.kv.as_ref(), keyspace, atr_id) {
            Ok(Some(atr)) => atr,
            Ok(None) => return 0,
            Err(e) => {
                warn!(atr = %atr_id, "could not read ATR for forced cleanup: {e}");
                return 0;
            }
        };
        let mut cleaned = 0;
        for e in &atr.entries {
            let entry = CleanupEntry::new(
                keyspace.clone(),
                atr_id,
                e.attempt_id.clone(),
                Instant::now(),
                false,
            );
            match entry.clean(&self.inner.kv, &self.inner.config) {
                Ok(_) => cleaned += 1,
                Err(err) => warn!(attempt = %e.attempt_id, "forced cleanup failed: {err}"),
            }
        }
        cleaned
    }

    /// Stop all background work: wake every loop, give the dispatcher
    /// its bounded final drain, join the threads, and deregister from
    /// every known bucket.
    pub fn close(&self) {
        info!(client = %self.inner.client_uuid, "cleanup service stopping");
        {
            let _guard = self.inner.wake_lock.lock();
            self.inner.running.store(false, Ordering::Release);
            self.inner.wake.notify_all();
        }
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        if self.inner.config.cleanup_lost_attempts {
            for keyspace in self.inner.known_keyspaces() {
                if let Err(e) = client_record::remove_client_record(
                    self.inner.kv.as_ref(),
                    &keyspace,
                    &self.inner.client_uuid,
                    self.inner.config.durability,
                ) {
                    warn!(keyspace = %keyspace, "could not remove client record: {e}");
                }
            }
        }
        info!(client = %self.inner.client_uuid, "cleanup service stopped");
    }
}

fn heartbeat_loop(inner: &ServiceInner) {
    debug!("heartbeat loop starting");
    loop {
        for keyspace in inner.known_keyspaces() {
            match client_record::process_client_record(
                inner.kv.as_ref(),
                &keyspace,
                &inner.client_uuid,
                inner.config.durability,
            ) {
                Ok(details) => {
                    inner.assignments.lock().insert(keyspace, details);
                }
                Err(e) => debug!(keyspace = %keyspace, "heartbeat failed: {e}"),
            }
        }
        if !inner.interruptible_wait(HEARTBEAT_INTERVAL) {
            debug!("heartbeat loop stopping");
            return;
        }
    }
}

fn lost_attempts_loop(inner: &ServiceInner) {
    debug!("lost-attempt scanner starting");
    loop {
        let window_start = Instant::now();
        for keyspace in inner.known_keyspaces() {
            if !inner.running.load(Ordering::Acquire) {
                return;
            }
            scan_keyspace(inner, &keyspace);
        }
        let elapsed = window_start.elapsed();
        let wait = inner.config.cleanup_window.saturating_sub(elapsed);
        if !inner.interruptible_wait(wait.max(Duration::from_millis(10))) {
            debug!("lost-attempt scanner stopping");
            return;
        }
    }
}

/// Walk this client's share of a bucket's ATRs, spreading the reads
/// roughly uniformly across the cleanup window.
fn scan_keyspace(inner: &ServiceInner, keyspace: &KeyspaceRef) {
    let details = inner.assignments.lock().get(keyspace).cloned();
    let details = match details {
        Some(d) => d,
        None => match client_record::process_client_record(
            inner.kv.as_ref(),
            keyspace,
            &inner.client_uuid,
            inner.config.durability,
        ) {
            Ok(d) => d,
            Err(e) => {
                debug!(keyspace = %keyspace, "no shard assignment: {e}");
                return;
            }
        },
    };
    let assigned = details.num_active_clients.max(1) as u64;
    let share = (atr::NUM_ATRS as u64 / assigned).max(1);
    let delay = inner.config.cleanup_window / share as u32;
    debug!(
        keyspace = %keyspace,
        clients = details.num_active_clients,
        index = details.index_of_this_client,
        delay_ms = delay.as_millis() as u64,
        "scanning assigned ATRs"
    );
    for index in details.assigned_atr_indexes(atr::NUM_ATRS) {
        if !inner.running.load(Ordering::Acquire) {
            return;
        }
        scan_atr(inner, keyspace, &atr::atr_id_for_vbucket(index));
        if !inner.interruptible_wait(delay) {
            return;
        }
    }
}

fn scan_atr(inner: &ServiceInner, keyspace: &KeyspaceRef, atr_id: &str) {
    match inner.kv.exists(keyspace, atr_id) {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            trace!(atr = %atr_id, "exists check failed: {e}");
            return;
        }
    }
    let atr = match ActiveTransactionRecord::fetch(inner.kv.as_ref(), keyspace, atr_id) {
        Ok(Some(atr)) => atr,
        Ok(None) => return,
        Err(e) => {
            debug!(atr = %atr_id, "could not read ATR: {e}");
            return;
        }
    };
    for entry in &atr.entries {
        if entry.has_expired(atr.now_ms, CLEANUP_SAFETY_MARGIN_MS) {
            debug!(
                atr = %atr_id,
                attempt = %entry.attempt_id,
                state = %entry.state,
                "found expired attempt"
            );
            inner.queue.push(CleanupEntry::new(
                keyspace.clone(),
                atr_id,
                entry.attempt_id.clone(),
                Instant::now(),
                true,
            ));
        }
    }
}

const DISPATCH_POLL: Duration = Duration::from_millis(100);

fn dispatcher_loop(inner: &ServiceInner) {
    debug!("cleanup dispatcher starting");
    loop {
        if !inner.interruptible_wait(DISPATCH_POLL) {
            final_drain(inner);
            debug!("cleanup dispatcher stopping");
            return;
        }
        while let Some(entry) = inner.queue.pop(true) {
            if !inner.running.load(Ordering::Acquire) {
                final_drain(inner);
                return;
            }
            dispatch_one(inner, entry);
        }
    }
}

fn dispatch_one(inner: &ServiceInner, entry: CleanupEntry) {
    match entry.clean(&inner.kv, &inner.config) {
        Ok(CleanupOutcome::Done) => {}
        Ok(CleanupOutcome::Requeue) => {
            let mut entry = entry;
            entry.min_start_time = Instant::now() + Duration::from_millis(CLEANUP_SAFETY_MARGIN_MS);
            inner.queue.push(entry);
        }
        Err(e) => {
            // Leave it: the lost-attempt scan (ours or another
            // client's) will find the attempt again
            debug!(atr = %entry.atr_id, attempt = %entry.attempt_id, "cleanup failed: {e}");
        }
    }
}

/// Bounded drain on shutdown; leftover work is abandoned to the other
/// clients.
fn final_drain(inner: &ServiceInner) {
    let deadline = Instant::now() + inner.config.shutdown_budget;
    while Instant::now() < deadline {
        let Some(entry) = inner.queue.pop(false) else { return };
        match entry.clean(&inner.kv, &inner.config) {
            Ok(CleanupOutcome::Done) => {}
            Ok(CleanupOutcome::Requeue) => {}
            Err(e) => {
                debug!(atr = %entry.atr_id, "cleanup during drain failed: {e}");
            }
        }
    }
    let left = inner.queue.len();
    if left > 0 {
        info!(entries = left, "shutdown budget exceeded, abandoning cleanup");
    }
}
