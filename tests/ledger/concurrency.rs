//! Concurrent writers against one database file.

#[path = "../common/mod.rs"]
mod common;
use common::*;

use std::sync::{Arc, Barrier};
use std::thread;

use vendorplan::ledger::apply_snapshot;

#[tokio::test]
async fn test_concurrent_syncs_apply_once() {
    let env = TestEnv::new();
    let (plans, shop) = {
        let conn = env.conn();
        (seed_plans(&conn), create_test_shop(&conn, "Race Shop"))
    };
    let sub = subscribe(&env, &shop.id, &plans.starter).await.subscription;
    let snapshot = env.gateway.update(&sub.external_subscription_id, |s| {
        s.status = SubscriptionStatus::Active;
    });

    const THREADS: usize = 8;
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let pool = env.state.db.clone();
            let barrier = barrier.clone();
            let snapshot = snapshot.clone();
            thread::spawn(move || {
                let mut conn = pool.get().unwrap();
                barrier.wait();
                apply_snapshot(&mut conn, &snapshot).unwrap()
            })
        })
        .collect();
    let outcomes: Vec<SyncOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let applied = outcomes
        .iter()
        .filter(|o| matches!(o, SyncOutcome::Applied(_)))
        .count();
    let unchanged = outcomes
        .iter()
        .filter(|o| matches!(o, SyncOutcome::Unchanged(_)))
        .count();
    assert_eq!(applied, 1, "exactly one sync writes: {:?}", outcomes);
    assert_eq!(unchanged, THREADS - 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_leave_one_valid_subscription() {
    let env = TestEnv::new();
    let (plans, shop) = {
        let conn = env.conn();
        (seed_plans(&conn), create_test_shop(&conn, "Double Click"))
    };

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let state = env.state.clone();
            let shop_id = shop.id.clone();
            let plan_id = plans.starter.id.clone();
            tokio::spawn(async move {
                SubscriptionLedger::from_state(&state)
                    .create(&shop_id, &plan_id, TEST_PAYMENT_METHOD, None)
                    .await
                    .map(|s| s.subscription.id)
            })
        })
        .collect();

    let mut succeeded = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(AppError::BadRequest(_)) | Err(AppError::Conflict(_)) => {}
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(
        queries::count_valid_subscriptions_for_shop(&env.conn(), &shop.id).unwrap(),
        1
    );
}
