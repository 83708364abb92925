//! Usage metering: counters, thresholds, periodic resets and storage
//! recomputation.
//!
//! Counters live on the shop row. Every write here is a single statement or a
//! short transaction, so concurrent writers never lose updates.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use rusqlite::Connection;

use crate::config::Thresholds;
use crate::db::queries;
use crate::error::{AppError, Result, msg};
use crate::models::{
    DomainEvent, GlobalUsageStats, ResourceKind, ResourceUsage, Shop, ThresholdLevel, UsageReport,
    UsageStatus,
};
use crate::notify::EventNotifier;

pub const BYTES_PER_MB: i64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    Incremented,
    /// The limit would have been exceeded; nothing changed.
    NotIncremented,
}

pub fn increment(conn: &Connection, shop_id: &str, resource: ResourceKind) -> Result<IncrementOutcome> {
    increment_by(conn, shop_id, resource, 1)
}

/// Add `amount` to a counter if the result stays within the shop's limit.
pub fn increment_by(
    conn: &Connection,
    shop_id: &str,
    resource: ResourceKind,
    amount: i64,
) -> Result<IncrementOutcome> {
    if amount < 0 {
        return Err(AppError::BadRequest("amount cannot be negative".into()));
    }
    if queries::increment_usage(conn, shop_id, resource, amount)? {
        return Ok(IncrementOutcome::Incremented);
    }
    if !queries::shop_exists(conn, shop_id)? {
        return Err(AppError::NotFound(msg::SHOP_NOT_FOUND.into()));
    }
    tracing::debug!(
        "Usage increment refused for shop {} ({} +{})",
        shop_id,
        resource.as_ref(),
        amount
    );
    Ok(IncrementOutcome::NotIncremented)
}

/// Record `amount` of consumption and evaluate the resource's threshold.
pub fn track(
    conn: &Connection,
    notifier: &EventNotifier,
    thresholds: &Thresholds,
    shop_id: &str,
    resource: ResourceKind,
    amount: i64,
) -> Result<IncrementOutcome> {
    let outcome = increment_by(conn, shop_id, resource, amount)?;
    if outcome == IncrementOutcome::Incremented {
        check_threshold(conn, notifier, thresholds, shop_id, resource)?;
    }
    Ok(outcome)
}

pub fn decrement(conn: &Connection, shop_id: &str, resource: ResourceKind) -> Result<()> {
    if !queries::decrement_usage(conn, shop_id, resource, 1)? {
        return Err(AppError::NotFound(msg::SHOP_NOT_FOUND.into()));
    }
    Ok(())
}

fn load_shop(conn: &Connection, shop_id: &str) -> Result<Shop> {
    queries::get_shop_by_id(conn, shop_id)?
        .ok_or_else(|| AppError::NotFound(msg::SHOP_NOT_FOUND.into()))
}

/// Evaluate a resource against its warning threshold and raise a
/// `UsageThreshold` event the first time each level is reached.
///
/// Levels above the current one are re-armed, so dropping back under a
/// threshold lets it fire again on the next crossing.
pub fn check_threshold(
    conn: &Connection,
    notifier: &EventNotifier,
    thresholds: &Thresholds,
    shop_id: &str,
    resource: ResourceKind,
) -> Result<ThresholdLevel> {
    let shop = load_shop(conn, shop_id)?;

    let level = match shop.limit_for(resource) {
        None => ThresholdLevel::Below,
        Some(_) => {
            ThresholdLevel::evaluate(shop.percent_used(resource), thresholds.for_resource(resource))
        }
    };

    queries::clear_usage_alerts_above(conn, shop_id, resource, level)?;

    if level != ThresholdLevel::Below
        && queries::try_record_usage_alert(conn, shop_id, resource, level)?
    {
        notifier.notify(
            conn,
            shop_id,
            &DomainEvent::UsageThreshold {
                resource,
                percent: shop.percent_used(resource),
                level,
            },
        )?;
    }

    Ok(level)
}

/// Start a new monthly order period for every shop. Re-running is harmless:
/// already-zero counters are left alone.
pub fn reset_period(conn: &Connection, at: i64) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let reset = queries::reset_monthly_orders(&tx, at)?;
    queries::clear_usage_alerts_for_resource(&tx, ResourceKind::Orders)?;
    tx.commit()?;
    tracing::info!("Reset monthly order counters for {} shops", reset);
    Ok(reset)
}

/// Whole megabytes needed to hold `bytes`, rounding up.
pub fn bytes_to_mb(bytes: i64) -> i64 {
    if bytes <= 0 {
        return 0;
    }
    (bytes + BYTES_PER_MB - 1) / BYTES_PER_MB
}

/// Rebuild a shop's storage counter from its media rows.
pub fn recompute_storage(conn: &Connection, shop_id: &str) -> Result<i64> {
    if !queries::shop_exists(conn, shop_id)? {
        return Err(AppError::NotFound(msg::SHOP_NOT_FOUND.into()));
    }
    let mb = bytes_to_mb(queries::sum_media_bytes(conn, shop_id)?);
    queries::set_storage_used(conn, shop_id, mb)?;
    Ok(mb)
}

/// Recompute storage for every shop. Returns the number of shops processed.
pub fn recompute_all_storage(conn: &Connection) -> Result<usize> {
    let ids = queries::list_shop_ids(conn)?;
    for id in &ids {
        recompute_storage(conn, id)?;
    }
    tracing::info!("Recomputed storage for {} shops", ids.len());
    Ok(ids.len())
}

fn from_timestamp(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

/// Unix time of the first instant of the month containing `ts` (UTC).
pub fn month_start(ts: i64) -> i64 {
    let dt = from_timestamp(ts);
    Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
        .single()
        .map(|d| d.timestamp())
        .unwrap_or(ts)
}

/// Unix time of the first instant of the month after the one containing `ts`.
pub fn next_month_start(ts: i64) -> i64 {
    let dt = from_timestamp(ts);
    let (year, month) = if dt.month() == 12 {
        (dt.year() + 1, 1)
    } else {
        (dt.year(), dt.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|d| d.timestamp())
        .unwrap_or(ts)
}

fn resource_usage(shop: &Shop, resource: ResourceKind, resets_at: Option<i64>) -> ResourceUsage {
    let limit = shop.limit_for(resource);
    let percentage = shop.percent_used(resource);
    ResourceUsage {
        current: shop.usage_for(resource),
        limit,
        percentage,
        remaining: shop.remaining(resource),
        status: match limit {
            None => UsageStatus::Unlimited,
            Some(_) => UsageStatus::from_percent(percentage),
        },
        resets_at,
    }
}

pub fn usage_report(conn: &Connection, shop_id: &str, now: i64) -> Result<UsageReport> {
    let shop = load_shop(conn, shop_id)?;
    let plan = match shop.current_plan_id.as_deref() {
        Some(id) => queries::get_plan_by_id(conn, id)?.map(|p| p.slug),
        None => None,
    };

    Ok(UsageReport {
        shop_id: shop.id.clone(),
        plan,
        products: resource_usage(&shop, ResourceKind::Products, None),
        orders: resource_usage(&shop, ResourceKind::Orders, Some(next_month_start(now))),
        storage: resource_usage(&shop, ResourceKind::Storage, None),
        last_reset_at: shop.last_usage_reset_at,
    })
}

pub fn global_stats(conn: &Connection) -> Result<GlobalUsageStats> {
    queries::global_usage_stats(conn)
}
