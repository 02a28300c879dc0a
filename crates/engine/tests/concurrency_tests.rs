//! Behavior under concurrent transactions: conflict retry, isolation,
//! and forward progress.

use keystone_engine::{
    fields, AttemptHooks, TransactionConfig, TransactionError, Transactions,
};
use keystone_kv::mem::MemCluster;
use keystone_kv::{DurabilityLevel, KeyspaceRef, KvError, KvStore};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn test_config() -> TransactionConfig {
    TransactionConfig::default()
        .with_timeout(Duration::from_secs(10))
        .with_expiration(Duration::from_secs(10))
        .with_durability(DurabilityLevel::None)
        .with_kv_timeout(Duration::from_millis(250))
        .with_cleanup_lost_attempts(false)
}

fn counter(store: &MemCluster, ks: &KeyspaceRef, id: &str) -> i64 {
    store.get(ks, id).unwrap().body["n"].as_i64().unwrap()
}

// ============================================================================
// SECTION 1: Write-write conflicts
// ============================================================================

/// Two transactions replacing the same document concurrently: one wins
/// the stage, the other retries; no update is lost.
#[test]
fn test_conflicting_writers_both_commit() {
    let store = Arc::new(MemCluster::new());
    let ks = KeyspaceRef::default_collection("test");
    store.upsert_raw(&ks, "counter", json!({"n": 0}));
    let txns = Arc::new(Transactions::new(store.clone(), test_config()));

    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads));
    let mut handles = Vec::new();
    for _ in 0..threads {
        let txns = Arc::clone(&txns);
        let ks = ks.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            txns.run(|ctx| {
                let doc = ctx.get(&ks, "counter")?;
                let n = doc.content()["n"].as_i64().unwrap();
                ctx.replace(&doc, json!({"n": n + 1}))?;
                Ok(())
            })
        }));
    }
    for h in handles {
        h.join().unwrap().expect("every writer should eventually commit");
    }

    assert_eq!(counter(&store, &ks, "counter"), threads as i64);
    let (_, xattrs, _) = store.raw_doc(&ks, "counter").unwrap();
    assert!(xattrs.get(fields::TXN_PREFIX).is_none());
}

/// Concurrent inserts of the same key: exactly one transaction wins.
#[test]
fn test_conflicting_inserts_one_winner() {
    let store = Arc::new(MemCluster::new());
    let ks = KeyspaceRef::default_collection("test");
    let txns = Arc::new(Transactions::new(store.clone(), test_config()));

    let threads = 3;
    let barrier = Arc::new(Barrier::new(threads));
    let mut handles = Vec::new();
    for i in 0..threads {
        let txns = Arc::clone(&txns);
        let ks = ks.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            txns.run(|ctx| {
                ctx.insert(&ks, "once", json!({"writer": i}))?;
                Ok(())
            })
        }));
    }
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one insert should commit: {outcomes:?}");
    assert!(store.exists(&ks, "once").unwrap());
}

// ============================================================================
// SECTION 2: Read-committed isolation
// ============================================================================

/// While a writer is PENDING, readers see none of its mutations; once
/// its COMMITTED record exists, readers see all of them — even before
/// unstaging finishes.
#[test]
fn test_no_partial_visibility_across_commit_point() {
    let store = Arc::new(MemCluster::new());
    let ks = KeyspaceRef::default_collection("test");
    store.upsert_raw(&ks, "a", json!({"val": 1}));
    store.upsert_raw(&ks, "b", json!({"val": 2}));

    // Writer: fail unstaging of "b" so the attempt parks between
    // COMMITTED and COMPLETED
    let mut hooks = AttemptHooks::default();
    hooks.before_doc_committed = Arc::new(|doc_id| {
        if doc_id == "b" {
            Err(KvError::Temporary)
        } else {
            Ok(())
        }
    });
    let writer = Transactions::with_hooks(store.clone(), test_config(), hooks);

    let result = writer
        .run(|ctx| {
            let a = ctx.get(&ks, "a")?;
            ctx.replace(&a, json!({"val": 10}))?;
            let b = ctx.get(&ks, "b")?;
            ctx.replace(&b, json!({"val": 20}))?;
            Ok(())
        })
        .expect("commit point was crossed, so the transaction reports success");
    assert!(!result.unstaging_complete);

    // "a" is unstaged, "b" is not — but a reader must see both new
    // values because the ATR entry is COMMITTED
    assert_eq!(store.get(&ks, "a").unwrap().body, json!({"val": 10}));
    assert_eq!(store.get(&ks, "b").unwrap().body, json!({"val": 2}));

    let reader = Transactions::new(store.clone(), test_config());
    reader
        .run(|ctx| {
            assert_eq!(ctx.get(&ks, "a")?.content(), &json!({"val": 10}));
            assert_eq!(ctx.get(&ks, "b")?.content(), &json!({"val": 20}));
            Ok(())
        })
        .unwrap();

    // Cleanup finishes publication
    let cleaned = writer.cleanup().force_cleanup_queue();
    assert_eq!(cleaned, 1);
    assert_eq!(store.get(&ks, "b").unwrap().body, json!({"val": 20}));
}

/// A reader racing a PENDING writer sees the pre-transaction values.
#[test]
fn test_pending_writer_is_invisible() {
    let store = Arc::new(MemCluster::new());
    let ks = KeyspaceRef::default_collection("test");
    store.upsert_raw(&ks, "a", json!({"val": 1}));
    store.upsert_raw(&ks, "b", json!({"val": 2}));

    // Park the writer right before its COMMITTED record
    let gate = Arc::new(Barrier::new(2));
    let released = Arc::new(AtomicBool::new(false));
    let mut hooks = AttemptHooks::default();
    {
        let gate = Arc::clone(&gate);
        let released = Arc::clone(&released);
        hooks.before_atr_commit = Arc::new(move |_| {
            if !released.swap(true, Ordering::SeqCst) {
                gate.wait(); // reader goes first
                gate.wait(); // reader done
            }
            Ok(())
        });
    }
    let writer = Arc::new(Transactions::with_hooks(
        store.clone(),
        test_config(),
        hooks,
    ));

    let writer_thread = {
        let writer = Arc::clone(&writer);
        let ks = ks.clone();
        thread::spawn(move || {
            writer.run(|ctx| {
                let a = ctx.get(&ks, "a")?;
                ctx.replace(&a, json!({"val": 10}))?;
                let b = ctx.get(&ks, "b")?;
                ctx.replace(&b, json!({"val": 20}))?;
                Ok(())
            })
        })
    };

    gate.wait(); // writer is parked with both documents staged
    let reader = Transactions::new(store.clone(), test_config());
    reader
        .run(|ctx| {
            assert_eq!(ctx.get(&ks, "a")?.content(), &json!({"val": 1}));
            assert_eq!(ctx.get(&ks, "b")?.content(), &json!({"val": 2}));
            Ok(())
        })
        .unwrap();
    gate.wait(); // release the writer

    writer_thread.join().unwrap().unwrap();
    assert_eq!(store.get(&ks, "a").unwrap().body, json!({"val": 10}));
    assert_eq!(store.get(&ks, "b").unwrap().body, json!({"val": 20}));
}

// ============================================================================
// SECTION 3: Forward progress and expiry
// ============================================================================

/// A transaction blocked forever by a live foreign stage expires within
/// its configured timeout instead of hanging.
#[test]
fn test_blocked_transaction_expires() {
    let store = Arc::new(MemCluster::new());
    let ks = KeyspaceRef::default_collection("test");
    let pre_cas = store.upsert_raw(&ks, "a", json!({"val": 1}));

    // A foreign PENDING attempt with a generous window that will never
    // finish
    use keystone_engine::atr::{atr_id_for_key, AtrManager};
    let atr_id = atr_id_for_key("a");
    let mgr = AtrManager::new(store.clone(), ks.clone(), atr_id.as_str(), DurabilityLevel::None);
    mgr.set_pending("live-attempt", "live-txn", 600_000).unwrap();
    store
        .mutate_in(
            &ks,
            "a",
            &[
                keystone_kv::MutateSpec::upsert(fields::TXN_ID, json!("live-txn"))
                    .xattr()
                    .create_path(),
                keystone_kv::MutateSpec::upsert(fields::ATTEMPT_ID, json!("live-attempt"))
                    .xattr()
                    .create_path(),
                keystone_kv::MutateSpec::upsert(fields::ATR_ID, json!(atr_id))
                    .xattr()
                    .create_path(),
                keystone_kv::MutateSpec::upsert(fields::ATR_BUCKET, json!("test"))
                    .xattr()
                    .create_path(),
                keystone_kv::MutateSpec::upsert(fields::ATR_SCOPE, json!("_default"))
                    .xattr()
                    .create_path(),
                keystone_kv::MutateSpec::upsert(fields::ATR_COLLECTION, json!("_default"))
                    .xattr()
                    .create_path(),
                keystone_kv::MutateSpec::upsert(fields::OP_TYPE, json!("replace"))
                    .xattr()
                    .create_path(),
                keystone_kv::MutateSpec::upsert(fields::STAGED_DATA, json!({"val": 50}))
                    .xattr()
                    .create_path(),
                keystone_kv::MutateSpec::upsert(fields::PRE_TXN_CAS, json!(pre_cas))
                    .xattr()
                    .create_path(),
            ],
            keystone_kv::MutateOptions::default(),
        )
        .unwrap();

    let config = test_config().with_timeout(Duration::from_secs(3));
    let txns = Transactions::new(store.clone(), config);
    let started = Instant::now();
    let err = txns
        .run(|ctx| {
            let a = ctx.get(&ks, "a")?;
            ctx.replace(&a, json!({"val": 2}))?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, TransactionError::Expired { .. }), "{err:?}");
    // Bounded: deadline plus one conflict-wait round, not forever
    assert!(started.elapsed() < Duration::from_secs(8));
    // The committed value is untouched
    assert_eq!(store.get(&ks, "a").unwrap().body, json!({"val": 1}));
}

/// Monotonic reads inside one attempt: a second get returns the same
/// snapshot when nothing else intervened.
#[test]
fn test_repeated_get_is_stable() {
    let store = Arc::new(MemCluster::new());
    let ks = KeyspaceRef::default_collection("test");
    store.upsert_raw(&ks, "a", json!({"val": 1}));
    let txns = Transactions::new(store.clone(), test_config());

    txns.run(|ctx| {
        let first = ctx.get(&ks, "a")?;
        let second = ctx.get(&ks, "a")?;
        assert_eq!(first.content(), second.content());
        assert_eq!(first.cas(), second.cas());
        Ok(())
    })
    .unwrap();
}
