mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::register_memory_driver;
use udbc::error::DbError;

fn conn_ptr(conn: &Arc<dyn udbc::Connection>) -> usize {
    Arc::as_ptr(conn) as *const () as usize
}

// Two concurrent scoped checkouts on a one-connection pool: the second waits
// for the first release and gets the same physical connection.
#[tokio::test]
async fn test_saturated_checkout_waits_and_reuses() {
    register_memory_driver("pool1");
    let db = udbc::open("pool1://localhost/db?max_pool_size=1&initial_pool_size=1")
        .await
        .unwrap();

    let db2 = db.clone();
    let holder = tokio::spawn(async move {
        db2.using_connection(|conn| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(conn_ptr(&conn))
        })
        .await
        .unwrap()
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    let start = Instant::now();
    let second = db
        .using_connection(|conn| async move { Ok(conn_ptr(&conn)) })
        .await
        .unwrap();
    let waited = start.elapsed();
    let first = holder.await.unwrap();

    assert_eq!(first, second, "second checkout should reuse the connection");
    assert!(waited >= Duration::from_millis(60), "waited {:?}", waited);
}

// A saturated pool fails the second checkout with PoolTimeout after roughly
// the configured checkout_timeout.
#[tokio::test]
async fn test_checkout_timeout() {
    register_memory_driver("pool2");
    let db = udbc::open("pool2://localhost/db?max_pool_size=1&checkout_timeout=0.05")
        .await
        .unwrap();

    let guard = db.pool().checkout().await.unwrap();
    let start = Instant::now();
    let err = db.pool().checkout().await.unwrap_err();
    let waited = start.elapsed();

    assert!(matches!(err, DbError::PoolTimeout(_)), "got {:?}", err);
    assert!(waited >= Duration::from_millis(40), "waited {:?}", waited);
    assert!(waited < Duration::from_millis(500), "waited {:?}", waited);
    guard.release().await;
}

// Releases over the idle cap discard instead of pooling.
#[tokio::test]
async fn test_idle_cap_discards_excess() {
    let probe = register_memory_driver("pool3");
    let db = udbc::open(
        "pool3://localhost/db?max_pool_size=2&max_idle_pool_size=1&initial_pool_size=0",
    )
    .await
    .unwrap();

    let a = db.pool().checkout().await.unwrap();
    let b = db.pool().checkout().await.unwrap();
    assert_eq!(db.pool().counts().await.total, 2);

    a.release().await;
    b.release().await;

    let counts = db.pool().counts().await;
    assert_eq!(counts.available, 1);
    assert_eq!(counts.total, 1);
    assert_eq!(probe.closed(), 1);
}

// Warm-up never leaves more idle connections than the idle cap allows.
#[tokio::test]
async fn test_warm_respects_idle_cap() {
    let probe = register_memory_driver("pool10");
    let db = udbc::open(
        "pool10://localhost/db?initial_pool_size=3&max_idle_pool_size=1&max_pool_size=5",
    )
    .await
    .unwrap();

    let counts = db.pool().counts().await;
    assert_eq!(counts.available, 1);
    assert_eq!(counts.total, 1);
    assert_eq!(counts.in_use, 0);
    assert_eq!(probe.built(), 1);
}

// max_pool_size=0 means unbounded.
#[tokio::test]
async fn test_unbounded_pool() {
    register_memory_driver("pool4");
    let db = udbc::open(
        "pool4://localhost/db?max_pool_size=0&initial_pool_size=0&max_idle_pool_size=10",
    )
    .await
    .unwrap();

    let a = db.pool().checkout().await.unwrap();
    let b = db.pool().checkout().await.unwrap();
    let c = db.pool().checkout().await.unwrap();
    assert_eq!(db.pool().counts().await.total, 3);

    a.release().await;
    b.release().await;
    c.release().await;
    assert_eq!(db.pool().counts().await.available, 3);
}

// checkout_some returns reused=true exactly when a candidate was alive and
// idle at the time of the call.
#[tokio::test]
async fn test_checkout_some_prefers_candidates() {
    register_memory_driver("pool5");
    let db = udbc::open(
        "pool5://localhost/db?max_pool_size=2&max_idle_pool_size=2&initial_pool_size=0",
    )
    .await
    .unwrap();
    let pool = db.pool();

    let guard = pool.checkout().await.unwrap();
    let id = guard.entry().id();
    let weak = Arc::downgrade(guard.entry());
    guard.release().await;

    let (guard, reused) = pool.checkout_some(&[weak.clone()]).await.unwrap();
    assert!(reused);
    assert_eq!(guard.entry().id(), id);
    guard.release().await;

    // No candidates: plain checkout.
    let (guard, reused) = pool.checkout_some(&[]).await.unwrap();
    assert!(!reused);
    guard.release().await;

    // A candidate that is no longer idle is not reused.
    let holder = pool.checkout_some(&[weak.clone()]).await.unwrap().0;
    let (other, reused) = pool.checkout_some(&[weak]).await.unwrap();
    assert!(!reused);
    assert_ne!(other.entry().id(), holder.entry().id());
    holder.release().await;
    other.release().await;
}

// A broken connection is discarded on release, decrementing total.
#[tokio::test]
async fn test_broken_release_discards() {
    let probe = register_memory_driver("pool6");
    let db = udbc::open("pool6://localhost/db?max_pool_size=1&initial_pool_size=1")
        .await
        .unwrap();

    let guard = db.pool().checkout().await.unwrap();
    guard.mark_broken();
    guard.release().await;

    let counts = db.pool().counts().await;
    assert_eq!(counts.total, 0);
    assert_eq!(counts.available, 0);
    assert_eq!(probe.closed(), 1);

    // The freed slot admits a fresh connection.
    let guard = db.pool().checkout().await.unwrap();
    guard.release().await;
    assert_eq!(probe.built(), 2); // the warmed connection plus its replacement
}

// Closing the pool fails pending and subsequent checkouts and closes every
// idle connection.
#[tokio::test]
async fn test_close_wakes_waiters_and_rejects() {
    let probe = register_memory_driver("pool7");
    let db = udbc::open("pool7://localhost/db?max_pool_size=1&initial_pool_size=1&checkout_timeout=5")
        .await
        .unwrap();

    let guard = db.pool().checkout().await.unwrap();
    let pool = db.pool().clone();
    let waiter = tokio::spawn(async move { pool.checkout().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    db.pool().close().await;
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, DbError::PoolClosed), "got {:?}", err);

    let err = db.pool().checkout().await.unwrap_err();
    assert!(matches!(err, DbError::PoolClosed), "got {:?}", err);

    // The outstanding connection is closed on release.
    guard.release().await;
    assert_eq!(probe.closed(), probe.built());
    assert_eq!(db.pool().counts().await.total, 0);
}

// Pool counters stay within bounds under concurrent checkout/release.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checkout_release_respects_bounds() {
    register_memory_driver("pool9");
    let db = udbc::open(
        "pool9://localhost/db?max_pool_size=3&max_idle_pool_size=2&initial_pool_size=0&checkout_timeout=5",
    )
    .await
    .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let db = db.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                let guard = db.pool().checkout().await.unwrap();
                let counts = db.pool().counts().await;
                assert!(counts.total <= 3, "total {} over bound", counts.total);
                assert!(counts.in_use <= 3, "in_use {} over bound", counts.in_use);
                tokio::time::sleep(Duration::from_millis(1)).await;
                guard.release().await;
                let counts = db.pool().counts().await;
                assert!(counts.available <= 2, "idle {} over cap", counts.available);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let counts = db.pool().counts().await;
    assert_eq!(counts.in_use, 0);
    assert!(counts.total <= 3);
    assert!(counts.available <= 2);
}

// Dropping a guard without an explicit release (task cancellation) still
// returns the connection.
#[tokio::test]
async fn test_cancelled_checkout_returns_connection() {
    register_memory_driver("pool8");
    let db = udbc::open("pool8://localhost/db?max_pool_size=1&initial_pool_size=1")
        .await
        .unwrap();

    let db2 = db.clone();
    let task = tokio::spawn(async move {
        db2.using_connection(|_conn| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    task.abort();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The lease came back; this would otherwise time out.
    db.using_connection(|_conn| async move { Ok(()) })
        .await
        .unwrap();
}
