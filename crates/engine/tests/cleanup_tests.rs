//! Cleanup semantics: idempotency, concurrent cleaners, lost-attempt
//! takeover by another client, and registry behavior.

use keystone_engine::atr::{atr_id_for_key, AtrManager, DocRecord};
use keystone_engine::cleanup::{CleanupEntry, CleanupOutcome};
use keystone_engine::{
    fields, AttemptHooks, TransactionConfig, Transactions,
};
use keystone_kv::mem::MemCluster;
use keystone_kv::{
    DurabilityLevel, KeyspaceRef, KvError, KvStore, LookupOptions, LookupSpec, MutateOptions,
    MutateSpec,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn test_config() -> TransactionConfig {
    TransactionConfig::default()
        .with_timeout(Duration::from_secs(5))
        .with_expiration(Duration::from_secs(5))
        .with_durability(DurabilityLevel::None)
        .with_kv_timeout(Duration::from_millis(250))
        .with_cleanup_lost_attempts(false)
}

/// A transaction that crashes right after its COMMITTED record, leaving
/// both documents staged. Returns the (atr_id, attempt_id) to clean.
fn committed_but_unstaged(
    store: &Arc<MemCluster>,
    ks: &KeyspaceRef,
) -> (String, String) {
    let crash_once = Arc::new(AtomicBool::new(true));
    let flag = crash_once.clone();
    let mut hooks = AttemptHooks::default();
    hooks.after_atr_commit = Arc::new(move |_| {
        if flag.swap(false, Ordering::SeqCst) {
            Err(KvError::Temporary)
        } else {
            Ok(())
        }
    });
    let txns = Transactions::with_hooks(
        store.clone(),
        test_config().with_cleanup_client_attempts(false),
        hooks,
    );
    store.upsert_raw(ks, "a", json!({"val": 1}));
    store.upsert_raw(ks, "b", json!({"val": 2}));
    let result = txns
        .run(|ctx| {
            let a = ctx.get(ks, "a")?;
            ctx.replace(&a, json!({"val": 10}))?;
            let b = ctx.get(ks, "b")?;
            ctx.replace(&b, json!({"val": 20}))?;
            Ok(())
        })
        .unwrap();
    assert!(!result.unstaging_complete);
    (
        result.atr_id.unwrap(),
        result.attempts.last().unwrap().id.clone(),
    )
}

fn xattr_clean(store: &MemCluster, ks: &KeyspaceRef, id: &str) -> bool {
    store
        .raw_doc(ks, id)
        .map(|(_, xattrs, _)| xattrs.get(fields::TXN_PREFIX).is_none())
        .unwrap_or(true)
}

// ============================================================================
// SECTION 1: clean() semantics
// ============================================================================

#[test]
fn test_clean_commits_forward_and_is_idempotent() {
    let store = Arc::new(MemCluster::new());
    let ks = KeyspaceRef::default_collection("test");
    let (atr_id, attempt_id) = committed_but_unstaged(&store, &ks);

    let kv: Arc<dyn KvStore> = store.clone();
    let config = test_config();
    let entry = CleanupEntry::new(ks.clone(), atr_id.as_str(), attempt_id.as_str(), Instant::now(), false);

    assert_eq!(entry.clean(&kv, &config).unwrap(), CleanupOutcome::Done);
    assert_eq!(store.get(&ks, "a").unwrap().body, json!({"val": 10}));
    assert_eq!(store.get(&ks, "b").unwrap().body, json!({"val": 20}));
    assert!(xattr_clean(&store, &ks, "a"));
    assert!(xattr_clean(&store, &ks, "b"));

    // Second run: entry is gone, documents untouched
    let before_a = store.get(&ks, "a").unwrap().cas;
    assert_eq!(entry.clean(&kv, &config).unwrap(), CleanupOutcome::Done);
    assert_eq!(store.get(&ks, "a").unwrap().cas, before_a);
    assert_eq!(store.get(&ks, "a").unwrap().body, json!({"val": 10}));
}

#[test]
fn test_concurrent_cleaners_leave_consistent_state() {
    let store = Arc::new(MemCluster::new());
    let ks = KeyspaceRef::default_collection("test");
    let (atr_id, attempt_id) = committed_but_unstaged(&store, &ks);

    let mut handles = Vec::new();
    for _ in 0..2 {
        let store = store.clone();
        let ks = ks.clone();
        let atr_id = atr_id.clone();
        let attempt_id = attempt_id.clone();
        handles.push(thread::spawn(move || {
            let kv: Arc<dyn KvStore> = store;
            let entry = CleanupEntry::new(ks, atr_id.as_str(), attempt_id.as_str(), Instant::now(), false);
            entry.clean(&kv, &test_config())
        }));
    }
    for h in handles {
        h.join().unwrap().expect("concurrent cleanup must not fail");
    }

    assert_eq!(store.get(&ks, "a").unwrap().body, json!({"val": 10}));
    assert_eq!(store.get(&ks, "b").unwrap().body, json!({"val": 20}));
    assert!(xattr_clean(&store, &ks, "a"));
    assert!(xattr_clean(&store, &ks, "b"));
}

/// An abandoned PENDING attempt is rolled back: its staged documents
/// are restored and the entry removed.
#[test]
fn test_clean_rolls_back_abandoned_pending_attempt() {
    let store = Arc::new(MemCluster::new());
    let ks = KeyspaceRef::default_collection("test");
    let pre_cas = store.upsert_raw(&ks, "a", json!({"val": 1}));

    let atr_id = atr_id_for_key("a");
    let mgr = AtrManager::new(store.clone(), ks.clone(), atr_id.as_str(), DurabilityLevel::None);
    mgr.set_pending("dead", "dead-txn", 0).unwrap();
    mgr.append_doc_record("dead", "rep", &DocRecord::new(ks.clone(), "a"))
        .unwrap();
    store
        .mutate_in(
            &ks,
            "a",
            &[
                MutateSpec::upsert(fields::TXN_ID, json!("dead-txn"))
                    .xattr()
                    .create_path(),
                MutateSpec::upsert(fields::ATTEMPT_ID, json!("dead"))
                    .xattr()
                    .create_path(),
                MutateSpec::upsert(fields::ATR_ID, json!(atr_id.clone()))
                    .xattr()
                    .create_path(),
                MutateSpec::upsert(fields::OP_TYPE, json!("replace"))
                    .xattr()
                    .create_path(),
                MutateSpec::upsert(fields::STAGED_DATA, json!({"val": 99}))
                    .xattr()
                    .create_path(),
                MutateSpec::upsert(fields::PRE_TXN_CAS, json!(pre_cas))
                    .xattr()
                    .create_path(),
            ],
            MutateOptions::default(),
        )
        .unwrap();

    let kv: Arc<dyn KvStore> = store.clone();
    let entry = CleanupEntry::new(ks.clone(), atr_id.as_str(), "dead", Instant::now(), false);
    assert_eq!(entry.clean(&kv, &test_config()).unwrap(), CleanupOutcome::Done);

    assert_eq!(store.get(&ks, "a").unwrap().body, json!({"val": 1}));
    assert!(xattr_clean(&store, &ks, "a"));
    let res = store
        .lookup_in(
            &ks,
            &atr_id,
            &[LookupSpec::get("attempts.dead")],
            LookupOptions::default(),
        )
        .unwrap();
    assert!(res.entry(0).is_none(), "entry should be removed");
}

/// Entries inside their safety margin are requeued, not acted on.
#[test]
fn test_clean_respects_safety_margin() {
    let store = Arc::new(MemCluster::new());
    let ks = KeyspaceRef::default_collection("test");
    let atr_id = atr_id_for_key("a");
    let mgr = AtrManager::new(store.clone(), ks.clone(), atr_id.as_str(), DurabilityLevel::None);
    // Generous expiry window: nowhere near expired
    mgr.set_pending("young", "young-txn", 600_000).unwrap();

    let kv: Arc<dyn KvStore> = store.clone();
    let entry = CleanupEntry::new(ks.clone(), atr_id.as_str(), "young", Instant::now(), true);
    assert_eq!(
        entry.clean(&kv, &test_config()).unwrap(),
        CleanupOutcome::Requeue
    );
    // Still PENDING
    let e = mgr.read_entry("young").unwrap().unwrap();
    assert_eq!(e.state, keystone_engine::AttemptState::Pending);
}

// ============================================================================
// SECTION 2: Lost-attempt takeover by another client
// ============================================================================

#[test]
fn test_second_client_finishes_lost_attempt() {
    let store = Arc::new(MemCluster::new());
    let ks = KeyspaceRef::default_collection("test");

    // Client A commits but dies before unstaging; its own cleanup is
    // off, so only a foreign scanner can finish the job. The attempt's
    // expiry window is tiny so takeover is legal quickly.
    let crash = Arc::new(AtomicBool::new(true));
    let flag = crash.clone();
    let mut hooks = AttemptHooks::default();
    hooks.after_atr_commit = Arc::new(move |_| {
        if flag.swap(false, Ordering::SeqCst) {
            Err(KvError::Temporary)
        } else {
            Ok(())
        }
    });
    let client_a = Transactions::with_hooks(
        store.clone(),
        test_config()
            .with_expiration(Duration::from_millis(200))
            .with_cleanup_client_attempts(false),
        hooks,
    );
    store.upsert_raw(&ks, "a", json!({"val": 1}));
    store.upsert_raw(&ks, "b", json!({"val": 2}));
    let result = client_a
        .run(|ctx| {
            let a = ctx.get(&ks, "a")?;
            ctx.replace(&a, json!({"val": 10}))?;
            let b = ctx.get(&ks, "b")?;
            ctx.replace(&b, json!({"val": 20}))?;
            Ok(())
        })
        .unwrap();
    assert!(!result.unstaging_complete);
    drop(client_a);

    // Client B scans the bucket in the background
    let client_b = Transactions::new(
        store.clone(),
        TransactionConfig::default()
            .with_durability(DurabilityLevel::None)
            .with_cleanup_window(Duration::from_millis(500)),
    );
    // B learns the bucket by running any transaction in it
    client_b
        .run(|ctx| {
            let probe = ctx.insert(&ks, "probe", json!({"x": 1}))?;
            let _ = probe;
            Ok(())
        })
        .unwrap();

    // Takeover needs the expiry window + safety margin + scan latency
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let a_done = store.get(&ks, "a").map(|r| r.body == json!({"val": 10})).unwrap_or(false);
        let b_done = store.get(&ks, "b").map(|r| r.body == json!({"val": 20})).unwrap_or(false);
        if a_done && b_done && xattr_clean(&store, &ks, "a") && xattr_clean(&store, &ks, "b") {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "lost attempt was not taken over in time: a={:?} b={:?}",
            store.get(&ks, "a"),
            store.get(&ks, "b"),
        );
        thread::sleep(Duration::from_millis(100));
    }
    client_b.close();
}

// ============================================================================
// SECTION 3: Registry integration
// ============================================================================

#[test]
fn test_clients_register_and_deregister() {
    let store = Arc::new(MemCluster::new());
    let ks = KeyspaceRef::default_collection("test");
    store.upsert_raw(&ks, "a", json!({"val": 1}));

    let lost_config = || {
        TransactionConfig::default()
            .with_durability(DurabilityLevel::None)
            .with_cleanup_window(Duration::from_secs(60))
    };
    let client_a = Transactions::new(store.clone(), lost_config());
    let client_b = Transactions::new(store.clone(), lost_config());

    // Both learn the bucket
    for t in [&client_a, &client_b] {
        t.run(|ctx| {
            let a = ctx.get(&ks, "a")?;
            ctx.replace(&a, json!({"val": 1}))?;
            Ok(())
        })
        .unwrap();
    }

    let clients_registered = |want: usize| {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let n = store
                .raw_doc(&ks, fields::CLIENT_RECORD_ID)
                .and_then(|(body, _, _)| {
                    body.get("clients").and_then(|c| c.as_object().map(|m| m.len()))
                })
                .unwrap_or(0);
            if n == want {
                return true;
            }
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(100));
        }
    };
    assert!(clients_registered(2), "both heartbeats should appear");

    client_a.close();
    assert!(clients_registered(1), "closing removes the registry entry");
    client_b.close();
}
