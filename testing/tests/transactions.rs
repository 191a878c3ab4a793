//! Commit and rollback semantics of `TransactionRunner`, driven through the
//! in-memory database.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect
#![allow(clippy::panic)] // Panic propagation is under test

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use txkit_core::{TransactionRunner, TxContext, TxError, TxStarter};
use txkit_testing::InMemoryDatabase;

fn setup() -> (InMemoryDatabase, TransactionRunner<InMemoryDatabase>) {
    let db = InMemoryDatabase::new();
    (db.clone(), TransactionRunner::new(db))
}

#[tokio::test]
async fn test_ok_commits() {
    let (db, runner) = setup();

    let value = runner
        .run_in_new(None, |ctx| {
            Box::pin(async move {
                ctx.tx()?.put("order:1", b"placed".to_vec());
                Ok(7)
            })
        })
        .await
        .unwrap();

    assert_eq!(value, 7);
    assert_eq!(db.commits(), 1);
    assert_eq!(db.rollbacks(), 0);
    assert_eq!(db.get("order:1"), Some(b"placed".to_vec()));
}

#[tokio::test]
async fn test_error_rolls_back() {
    let (db, runner) = setup();

    let err = runner
        .run_in_new(None, |ctx| {
            Box::pin(async move {
                ctx.tx()?.put("order:1", b"placed".to_vec());
                Err::<(), _>(TxError::app("payment declined"))
            })
        })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "payment declined");
    assert_eq!(db.commits(), 0);
    assert_eq!(db.rollbacks(), 1);
    assert_eq!(db.get("order:1"), None);
}

#[tokio::test]
async fn test_not_found_commits_and_is_returned() {
    let (db, runner) = setup();

    let err = runner
        .run_in_new(None, |ctx| {
            Box::pin(async move {
                ctx.tx()?.put("lookup:miss", b"1".to_vec());
                Err::<(), _>(TxError::NotFound)
            })
        })
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(db.commits(), 1);
    assert!(db.get("lookup:miss").is_some());
}

#[tokio::test]
async fn test_no_rollback_commits_and_unwraps() {
    let (db, runner) = setup();

    let err = runner
        .run_in_new(None, |ctx| {
            Box::pin(async move {
                ctx.tx()?.put("audit:1", b"attempt".to_vec());
                Err::<(), _>(TxError::no_rollback(TxError::app("limit exceeded")))
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TxError::Application(_)));
    assert_eq!(err.to_string(), "limit exceeded");
    assert_eq!(db.commits(), 1);
    assert!(db.get("audit:1").is_some());
}

#[tokio::test]
async fn test_hooks_run_in_order_after_commit() {
    let (_db, runner) = setup();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&calls);
    runner
        .run_in_new(None, move |ctx| {
            Box::pin(async move {
                for i in 1..=3 {
                    let seen = Arc::clone(&seen);
                    ctx.on_commit(move || seen.lock().unwrap().push(i));
                }
                assert!(seen.lock().unwrap().is_empty());
                Ok(())
            })
        })
        .await
        .unwrap();

    assert_eq!(*calls.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_hooks_skipped_on_rollback() {
    let (_db, runner) = setup();
    let calls = Arc::new(Mutex::new(0));

    let seen = Arc::clone(&calls);
    let _ = runner
        .run_in_new(None, move |ctx| {
            Box::pin(async move {
                ctx.on_commit(move || *seen.lock().unwrap() += 1);
                Err::<(), _>(TxError::app("boom"))
            })
        })
        .await;

    assert_eq!(*calls.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_panic_rolls_back_and_skips_hooks() {
    let (db, runner) = setup();
    let calls = Arc::new(Mutex::new(0));

    let seen = Arc::clone(&calls);
    let outcome = AssertUnwindSafe(runner.run_in_new(None, move |ctx| {
        Box::pin(async move {
            ctx.on_commit(move || *seen.lock().unwrap() += 1);
            ctx.tx()?.put("half:done", b"1".to_vec());
            if ctx.pending_hooks() == 1 {
                panic!("handler bug");
            }
            Ok(())
        })
    }))
    .catch_unwind()
    .await;

    assert!(outcome.is_err());
    assert_eq!(db.rollbacks(), 1);
    assert_eq!(db.commits(), 0);
    assert_eq!(db.get("half:done"), None);
    assert_eq!(*calls.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_nested_new_transaction_is_rejected() {
    let (db, runner) = setup();
    let mut ambient = runner.begin(None).await.unwrap();

    let err = runner
        .run_in_new(Some(&mut ambient), |_| Box::pin(async { Ok(()) }))
        .await
        .unwrap_err();
    assert!(matches!(err, TxError::AlreadyActive));

    assert!(matches!(runner.begin(Some(&mut ambient)).await, Err(TxError::AlreadyActive)));

    ambient.finish(Ok(())).await.unwrap();
    assert_eq!(db.begins(), 1);
    assert_eq!(db.commits(), 1);
}

// Holds for every starter, so a tower service can box the future.
fn begin_send<S: TxStarter>(
    runner: &TransactionRunner<S>,
) -> impl Future<Output = Result<TxContext<S::Tx>, TxError>> + Send + '_ {
    runner.begin(None)
}

#[tokio::test]
async fn test_begin_can_be_spawned() {
    let (db, runner) = setup();

    let handle = tokio::spawn(async move {
        let ctx = begin_send(&runner).await?;
        ctx.finish(Ok(())).await
    });
    handle.await.unwrap().unwrap();

    assert_eq!(db.begins(), 1);
    assert_eq!(db.commits(), 1);
}

#[tokio::test]
async fn test_run_in_existing_requires_transaction() {
    let (_db, runner) = setup();

    let err = runner
        .run_in_existing(None, |_| Box::pin(async { Ok(()) }))
        .await
        .unwrap_err();
    assert!(matches!(err, TxError::NoTransaction));

    let mut finished = runner.begin(None).await.unwrap();
    finished.rollback().await.unwrap();
    let err = runner
        .run_in_existing(Some(&mut finished), |_| Box::pin(async { Ok(()) }))
        .await
        .unwrap_err();
    assert!(matches!(err, TxError::NoTransaction));
}

#[tokio::test]
async fn test_run_in_existing_shares_the_transaction() {
    let (db, runner) = setup();
    let mut ctx = runner.begin(None).await.unwrap();

    runner
        .run_in_existing(Some(&mut ctx), |ctx| {
            Box::pin(async move {
                ctx.tx()?.put("step:1", b"1".to_vec());
                Ok(())
            })
        })
        .await
        .unwrap();

    assert_eq!(db.get("step:1"), None);
    assert_eq!(db.commits(), 0);

    ctx.finish(Ok(())).await.unwrap();
    assert!(db.get("step:1").is_some());
}

#[tokio::test]
async fn test_run_in_existing_error_rolls_back_the_outer_transaction() {
    let (db, runner) = setup();
    let mut ctx = runner.begin(None).await.unwrap();
    ctx.tx().unwrap().put("outer", b"1".to_vec());

    let err = runner
        .run_in_existing(Some(&mut ctx), |_| {
            Box::pin(async { Err::<(), _>(TxError::Database("constraint violated".to_string())) })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TxError::Database(_)));
    assert!(ctx.is_finished());
    assert_eq!(db.rollbacks(), 1);

    // finishing an already rolled back context only hands the result back
    ctx.finish(Ok(())).await.unwrap();
    assert_eq!(db.commits(), 0);
    assert_eq!(db.get("outer"), None);
}

#[tokio::test]
async fn test_run_in_existing_rollback_failure_is_logged_not_returned() {
    let (db, runner) = setup();
    let mut ctx = runner.begin(None).await.unwrap();
    db.fail_next_rollback();

    let err = runner
        .run_in_existing(Some(&mut ctx), |_| {
            Box::pin(async { Err::<(), _>(TxError::app("invalid input")) })
        })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "invalid input");
}

#[tokio::test]
async fn test_run_in_existing_not_found_keeps_transaction() {
    let (_db, runner) = setup();
    let mut ctx = runner.begin(None).await.unwrap();

    let err = runner
        .run_in_existing(Some(&mut ctx), |_| Box::pin(async { Err::<(), _>(TxError::NotFound) }))
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert!(!ctx.is_finished());
    ctx.finish(Ok(())).await.unwrap();
}

#[tokio::test]
async fn test_run_in_any_dispatches() {
    let (db, runner) = setup();

    runner
        .run_in_any(None, |ctx| {
            Box::pin(async move {
                ctx.tx()?.put("fresh", b"1".to_vec());
                Ok(())
            })
        })
        .await
        .unwrap();
    assert_eq!(db.begins(), 1);
    assert_eq!(db.commits(), 1);

    let mut ctx = runner.begin(None).await.unwrap();
    runner
        .run_in_any(Some(&mut ctx), |ctx| {
            Box::pin(async move {
                ctx.tx()?.put("joined", b"1".to_vec());
                Ok(())
            })
        })
        .await
        .unwrap();
    assert_eq!(db.begins(), 2);
    assert_eq!(db.get("joined"), None);
    ctx.finish(Ok(())).await.unwrap();
    assert!(db.get("joined").is_some());
}

#[tokio::test]
async fn test_commit_failure_reports_both_errors() {
    let (db, runner) = setup();
    db.fail_next_commit();

    let err = runner
        .run_in_new(None, |_| {
            Box::pin(async { Err::<(), _>(TxError::no_rollback(TxError::app("partial"))) })
        })
        .await
        .unwrap_err();

    let TxError::Commit { commit, original } = &err else {
        panic!("expected commit error, got {err:?}");
    };
    assert!(matches!(**commit, TxError::Database(_)));
    assert_eq!(original.as_ref().unwrap().to_string(), "partial");
    assert_eq!(
        err.to_string(),
        "error during commit: database error: could not serialize access, original error was: partial"
    );
}

#[tokio::test]
async fn test_commit_failure_skips_hooks() {
    let (db, runner) = setup();
    db.fail_next_commit();
    let calls = Arc::new(Mutex::new(0));

    let seen = Arc::clone(&calls);
    let err = runner
        .run_in_new(None, move |ctx| {
            Box::pin(async move {
                ctx.on_commit(move || *seen.lock().unwrap() += 1);
                Ok(())
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TxError::Commit { original: None, .. }));
    assert_eq!(*calls.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_rollback_failure_reports_both_errors() {
    let (db, runner) = setup();
    db.fail_next_rollback();

    let err = runner
        .run_in_new(None, |_| Box::pin(async { Err::<(), _>(TxError::app("insert failed")) }))
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "error during rollback: database error: connection reset due to error: insert failed"
    );
}

#[tokio::test]
async fn test_begin_failure_is_returned() {
    let (db, runner) = setup();
    db.fail_next_begin();

    let err = runner
        .run_in_new(None, |_| Box::pin(async { Ok(()) }))
        .await
        .unwrap_err();

    assert!(matches!(err, TxError::Database(_)));
}

#[tokio::test]
async fn test_commit_and_chain_keeps_earlier_work() {
    let (db, runner) = setup();
    let calls = Arc::new(Mutex::new(0));

    let seen = Arc::clone(&calls);
    let _ = runner
        .run_in_new(None, move |ctx| {
            Box::pin(async move {
                ctx.tx()?.put("batch:1", b"1".to_vec());
                ctx.on_commit(move || *seen.lock().unwrap() += 1);
                ctx.commit_and_chain().await?;

                ctx.tx()?.put("batch:2", b"2".to_vec());
                Err::<(), _>(TxError::app("second batch failed"))
            })
        })
        .await;

    assert!(db.get("batch:1").is_some());
    assert!(db.get("batch:2").is_none());
    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(db.commits(), 1);
    assert_eq!(db.rollbacks(), 1);
}

#[tokio::test]
async fn test_manual_rollback_then_ok() {
    let (db, runner) = setup();

    runner
        .run_in_new(None, |ctx| {
            Box::pin(async move {
                ctx.tx()?.put("draft", b"1".to_vec());
                ctx.rollback().await?;
                assert!(matches!(ctx.tx(), Err(TxError::Done)));
                Ok(())
            })
        })
        .await
        .unwrap();

    assert_eq!(db.commits(), 0);
    assert_eq!(db.rollbacks(), 1);
    assert_eq!(db.get("draft"), None);
}

#[tokio::test]
async fn test_savepoint_undo_inside_transaction() {
    let (db, runner) = setup();

    runner
        .run_in_new(None, |ctx| {
            Box::pin(async move {
                ctx.tx()?.put("record", b"pending".to_vec());
                ctx.savepoint("work").await?;
                ctx.tx()?.put("side-effect", b"1".to_vec());
                ctx.rollback_to_savepoint("work").await?;
                Ok(())
            })
        })
        .await
        .unwrap();

    assert!(db.get("record").is_some());
    assert!(db.get("side-effect").is_none());
}

#[tokio::test]
async fn test_savepoint_undo_discards_later_hooks() {
    let (_db, runner) = setup();
    let ran = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&ran);

    runner
        .run_in_new(None, move |ctx| {
            Box::pin(async move {
                let before = Arc::clone(&log);
                ctx.on_commit(move || before.lock().unwrap().push("before"));
                ctx.savepoint("work").await?;
                let after = Arc::clone(&log);
                ctx.on_commit(move || after.lock().unwrap().push("after"));
                ctx.rollback_to_savepoint("work").await?;
                assert_eq!(ctx.pending_hooks(), 1);
                Ok(())
            })
        })
        .await
        .unwrap();

    assert_eq!(*ran.lock().unwrap(), vec!["before"]);
}
