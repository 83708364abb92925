//! Periodic maintenance: the monthly order reset and storage recomputation.
//!
//! Each job runs under a row lease in `job_leases`, so several scheduler
//! instances against one database never run the same job at once. Jobs are
//! safe to re-run; the lease only prevents wasted overlap.

use std::time::Duration;

use uuid::Uuid;

use crate::db::{AppState, DbPool, queries};
use crate::error::{AppError, Result};
use crate::usage;

pub const MONTHLY_RESET_JOB: &str = "monthly_usage_reset";
pub const STORAGE_RECOMPUTE_JOB: &str = "storage_recompute";

/// A crashed holder's lease becomes stealable after this long.
const LEASE_TTL_SECS: i64 = 15 * 60;

const STORAGE_RECOMPUTE_EVERY_SECS: i64 = 24 * 60 * 60;

/// Held job lease. Released when dropped, on every exit path.
pub struct JobLease {
    pool: DbPool,
    name: &'static str,
    holder: String,
}

impl JobLease {
    /// Take the lease for `name`, or `None` if another runner holds it.
    pub fn try_acquire(pool: &DbPool, name: &'static str) -> Result<Option<Self>> {
        let holder = format!("{}-{}", std::process::id(), Uuid::new_v4().as_simple());
        let conn = pool.get()?;
        if !queries::try_acquire_job_lease(&conn, name, &holder, LEASE_TTL_SECS)? {
            return Ok(None);
        }
        Ok(Some(Self {
            pool: pool.clone(),
            name,
            holder,
        }))
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        let released = self
            .pool
            .get()
            .map_err(AppError::from)
            .and_then(|conn| queries::release_job_lease(&conn, self.name, &self.holder));
        if let Err(e) = released {
            // The TTL frees it eventually.
            tracing::warn!("Failed to release job lease {}: {}", self.name, e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job ran and touched this many shops.
    Ran(usize),
    NotDue,
    /// Another runner holds the lease.
    LeaseHeld,
}

/// Reset monthly order counters if no reset has completed this month.
///
/// The first ever check only records a baseline, so deploying mid-month
/// does not wipe the month's counts. `force` runs regardless.
pub fn run_monthly_reset(pool: &DbPool, now: i64, force: bool) -> Result<JobOutcome> {
    let Some(_lease) = JobLease::try_acquire(pool, MONTHLY_RESET_JOB)? else {
        return Ok(JobOutcome::LeaseHeld);
    };
    let conn = pool.get()?;

    if !force {
        match queries::get_job_last_run(&conn, MONTHLY_RESET_JOB)? {
            None => {
                queries::record_job_run(&conn, MONTHLY_RESET_JOB, now, 0)?;
                return Ok(JobOutcome::NotDue);
            }
            Some(last) if usage::month_start(last) >= usage::month_start(now) => {
                return Ok(JobOutcome::NotDue);
            }
            Some(_) => {}
        }
    }

    let reset = usage::reset_period(&conn, now)?;
    queries::record_job_run(&conn, MONTHLY_RESET_JOB, now, reset as i64)?;
    Ok(JobOutcome::Ran(reset))
}

/// Rebuild every shop's storage counter, at most once a day unless forced.
pub fn run_storage_recompute(pool: &DbPool, now: i64, force: bool) -> Result<JobOutcome> {
    let Some(_lease) = JobLease::try_acquire(pool, STORAGE_RECOMPUTE_JOB)? else {
        return Ok(JobOutcome::LeaseHeld);
    };
    let conn = pool.get()?;

    if !force
        && queries::get_job_last_run(&conn, STORAGE_RECOMPUTE_JOB)?
            .is_some_and(|last| now - last < STORAGE_RECOMPUTE_EVERY_SECS)
    {
        return Ok(JobOutcome::NotDue);
    }

    let processed = usage::recompute_all_storage(&conn)?;
    queries::record_job_run(&conn, STORAGE_RECOMPUTE_JOB, now, processed as i64)?;
    Ok(JobOutcome::Ran(processed))
}

fn log_outcome(job: &str, outcome: Result<JobOutcome>) {
    match outcome {
        Ok(JobOutcome::Ran(n)) => tracing::info!("Job {} completed ({} shops)", job, n),
        Ok(JobOutcome::NotDue) => tracing::debug!("Job {} not due", job),
        Ok(JobOutcome::LeaseHeld) => tracing::debug!("Job {} running elsewhere, skipped", job),
        Err(e) => tracing::warn!("Job {} failed: {}", job, e),
    }
}

/// Background scheduler. Checks both jobs every `maintenance_interval_secs`.
pub fn spawn_maintenance_task(state: AppState) {
    let interval = Duration::from_secs(state.config.maintenance_interval_secs.max(1));
    tokio::spawn(async move {
        loop {
            let now = queries::now();
            log_outcome(MONTHLY_RESET_JOB, run_monthly_reset(&state.db, now, false));
            log_outcome(
                STORAGE_RECOMPUTE_JOB,
                run_storage_recompute(&state.db, now, false),
            );
            tokio::time::sleep(interval).await;
        }
    });

    tracing::info!(
        "Maintenance task started (runs every {} seconds)",
        interval.as_secs()
    );
}
