//! Maintenance jobs and their leases.

#[path = "../common/mod.rs"]
mod common;
use common::*;

use vendorplan::jobs::{
    JobLease, JobOutcome, MONTHLY_RESET_JOB, STORAGE_RECOMPUTE_JOB, run_monthly_reset,
    run_storage_recompute,
};
use vendorplan::usage::BYTES_PER_MB;

fn setup() -> (TestEnv, Shop) {
    let env = TestEnv::new();
    let shop = {
        let conn = env.conn();
        seed_plans(&conn);
        create_test_shop(&conn, "Jobs Shop")
    };
    (env, shop)
}

#[test]
fn test_lease_is_exclusive_until_dropped() {
    let (env, _) = setup();
    let pool = &env.state.db;

    let lease = JobLease::try_acquire(pool, MONTHLY_RESET_JOB).unwrap();
    assert!(lease.is_some());
    assert!(JobLease::try_acquire(pool, MONTHLY_RESET_JOB).unwrap().is_none());

    // Different jobs do not contend.
    assert!(JobLease::try_acquire(pool, STORAGE_RECOMPUTE_JOB).unwrap().is_some());

    drop(lease);
    assert!(JobLease::try_acquire(pool, MONTHLY_RESET_JOB).unwrap().is_some());
}

#[test]
fn test_monthly_reset_schedule() {
    let (env, shop) = setup();
    let pool = &env.state.db;
    set_usage(&env.conn(), &shop.id, ResourceKind::Orders, 40);
    // 2024-02-15 UTC
    let now = 1_708_000_000;

    // First check records a baseline only.
    assert_eq!(run_monthly_reset(pool, now, false).unwrap(), JobOutcome::NotDue);
    assert_eq!(env.shop(&shop.id).orders_this_month, 40);

    assert_eq!(run_monthly_reset(pool, now + 60, false).unwrap(), JobOutcome::NotDue);

    let next_month = now + 30 * ONE_DAY;
    assert_eq!(run_monthly_reset(pool, next_month, false).unwrap(), JobOutcome::Ran(1));
    let shop_after = env.shop(&shop.id);
    assert_eq!(shop_after.orders_this_month, 0);
    assert_eq!(shop_after.last_usage_reset_at, Some(next_month));
    assert_eq!(
        queries::get_job_last_run(&env.conn(), MONTHLY_RESET_JOB).unwrap(),
        Some(next_month)
    );

    assert_eq!(
        run_monthly_reset(pool, next_month + ONE_DAY, false).unwrap(),
        JobOutcome::NotDue
    );
}

#[test]
fn test_forced_reset_runs_immediately() {
    let (env, shop) = setup();
    set_usage(&env.conn(), &shop.id, ResourceKind::Orders, 3);

    let outcome = run_monthly_reset(&env.state.db, queries::now(), true).unwrap();

    assert_eq!(outcome, JobOutcome::Ran(1));
    assert_eq!(env.shop(&shop.id).orders_this_month, 0);
}

#[test]
fn test_jobs_skip_when_lease_held() {
    let (env, shop) = setup();
    set_usage(&env.conn(), &shop.id, ResourceKind::Orders, 3);
    let pool = &env.state.db;

    let _held = JobLease::try_acquire(pool, MONTHLY_RESET_JOB).unwrap().unwrap();
    assert_eq!(
        run_monthly_reset(pool, queries::now(), true).unwrap(),
        JobOutcome::LeaseHeld
    );
    assert_eq!(env.shop(&shop.id).orders_this_month, 3);

    let _held = JobLease::try_acquire(pool, STORAGE_RECOMPUTE_JOB).unwrap().unwrap();
    assert_eq!(
        run_storage_recompute(pool, queries::now(), true).unwrap(),
        JobOutcome::LeaseHeld
    );
}

#[test]
fn test_storage_recompute_runs_daily() {
    let (env, shop) = setup();
    let pool = &env.state.db;
    queries::create_media(
        &env.conn(),
        &shop.id,
        &CreateMedia {
            kind: MediaKind::Logo,
            path: "logo.svg".into(),
            size_bytes: 3 * BYTES_PER_MB,
        },
    )
    .unwrap();
    let now = queries::now();

    assert_eq!(run_storage_recompute(pool, now, false).unwrap(), JobOutcome::Ran(1));
    assert_eq!(env.shop(&shop.id).storage_used_mb, 3);

    assert_eq!(
        run_storage_recompute(pool, now + ONE_DAY / 2, false).unwrap(),
        JobOutcome::NotDue
    );
    assert_eq!(
        run_storage_recompute(pool, now + ONE_DAY / 2, true).unwrap(),
        JobOutcome::Ran(1)
    );
    assert_eq!(
        run_storage_recompute(pool, now + 2 * ONE_DAY, false).unwrap(),
        JobOutcome::Ran(1)
    );
}
