//! Row mapping trait and helpers for reducing boilerplate in queries.
//!
//! Models implement `FromRow` to define how they are built from a row that
//! was selected with the matching `*_COLS` constant, then use `query_one`
//! and `query_all` instead of hand-written mapping closures.

use rusqlite::{Connection, OptionalExtension, Row, ToSql};

use crate::models::*;

/// Parse a string column into an enum, turning bad values into a column error
/// instead of a panic.
fn parse_enum<T: std::str::FromStr>(row: &Row, col: usize, col_name: &str) -> rusqlite::Result<T> {
    row.get::<_, String>(col)?.parse::<T>().map_err(|_| {
        rusqlite::Error::InvalidColumnType(col, col_name.to_string(), rusqlite::types::Type::Text)
    })
}

fn parse_opt_enum<T: std::str::FromStr>(
    row: &Row,
    col: usize,
    col_name: &str,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(col)? {
        Some(s) => s.parse::<T>().map(Some).map_err(|_| {
            rusqlite::Error::InvalidColumnType(
                col,
                col_name.to_string(),
                rusqlite::types::Type::Text,
            )
        }),
        None => Ok(None),
    }
}

pub trait FromRow: Sized {
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

/// Query for a single optional result.
pub fn query_one<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Option<T>> {
    conn.query_row(sql, params, T::from_row)
        .optional()
        .map_err(Into::into)
}

/// Query for multiple results.
pub fn query_all<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, T::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============ SQL SELECT Constants ============

pub const PLAN_COLS: &str = "id, slug, name, price_cents, currency, billing_cycle, trial_days, products_limit, orders_per_month, storage_limit_mb, subdomain_enabled, features, external_product_id, external_price_id, is_active, sort_order, created_at, updated_at";

pub const SHOP_COLS: &str = "id, name, current_plan_id, subscription_status, billing_customer_id, has_premium_subdomain, products_limit, orders_per_month_limit, storage_limit_mb, products_count, orders_this_month, storage_used_mb, last_usage_reset_at, created_at, updated_at";

pub const TENANT_COLS: &str =
    "id, shop_id, subdomain, tier, premium_since, premium_expires_at, created_at, updated_at";

pub const SUBSCRIPTION_COLS: &str = "id, shop_id, tenant_id, plan_id, status, trial_ends_at, current_period_start, current_period_end, cancel_at_period_end, canceled_at, ends_at, external_subscription_id, external_customer_id, external_price_id, remote_version, metadata, created_at, updated_at";

pub const MEDIA_COLS: &str = "id, shop_id, kind, path, size_bytes, created_at";

pub const USER_COLS: &str = "id, email, name, shop_id, created_at";

pub const API_KEY_COLS: &str =
    "id, user_id, key_prefix, key_hash, created_at, last_used_at, revoked_at";

pub const EVENT_LOG_COLS: &str = "id, shop_id, event, payload, created_at";

// ============ FromRow Implementations ============

impl FromRow for Plan {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let features_str: String = row.get(11)?;
        Ok(Plan {
            id: row.get(0)?,
            slug: row.get(1)?,
            name: row.get(2)?,
            price_cents: row.get(3)?,
            currency: row.get(4)?,
            billing_cycle: parse_opt_enum(row, 5, "billing_cycle")?,
            trial_days: row.get(6)?,
            products_limit: row.get(7)?,
            orders_per_month: row.get(8)?,
            storage_limit_mb: row.get(9)?,
            subdomain_enabled: row.get::<_, i32>(10)? != 0,
            features: serde_json::from_str(&features_str).unwrap_or_default(),
            external_product_id: row.get(12)?,
            external_price_id: row.get(13)?,
            is_active: row.get::<_, i32>(14)? != 0,
            sort_order: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }
}

impl FromRow for Shop {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Shop {
            id: row.get(0)?,
            name: row.get(1)?,
            current_plan_id: row.get(2)?,
            subscription_status: parse_opt_enum(row, 3, "subscription_status")?,
            billing_customer_id: row.get(4)?,
            has_premium_subdomain: row.get::<_, i32>(5)? != 0,
            products_limit: row.get(6)?,
            orders_per_month_limit: row.get(7)?,
            storage_limit_mb: row.get(8)?,
            products_count: row.get(9)?,
            orders_this_month: row.get(10)?,
            storage_used_mb: row.get(11)?,
            last_usage_reset_at: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }
}

impl FromRow for Tenant {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Tenant {
            id: row.get(0)?,
            shop_id: row.get(1)?,
            subdomain: row.get(2)?,
            tier: parse_enum(row, 3, "tier")?,
            premium_since: row.get(4)?,
            premium_expires_at: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

impl FromRow for Subscription {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let metadata: Option<String> = row.get(15)?;
        Ok(Subscription {
            id: row.get(0)?,
            shop_id: row.get(1)?,
            tenant_id: row.get(2)?,
            plan_id: row.get(3)?,
            status: parse_enum(row, 4, "status")?,
            trial_ends_at: row.get(5)?,
            current_period_start: row.get(6)?,
            current_period_end: row.get(7)?,
            cancel_at_period_end: row.get::<_, i32>(8)? != 0,
            canceled_at: row.get(9)?,
            ends_at: row.get(10)?,
            external_subscription_id: row.get(11)?,
            external_customer_id: row.get(12)?,
            external_price_id: row.get(13)?,
            remote_version: row.get(14)?,
            metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }
}

impl FromRow for Media {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Media {
            id: row.get(0)?,
            shop_id: row.get(1)?,
            kind: parse_enum(row, 2, "kind")?,
            path: row.get(3)?,
            size_bytes: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}

impl FromRow for User {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(User {
            id: row.get(0)?,
            email: row.get(1)?,
            name: row.get(2)?,
            shop_id: row.get(3)?,
            created_at: row.get(4)?,
        })
    }
}

impl FromRow for ApiKey {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(ApiKey {
            id: row.get(0)?,
            user_id: row.get(1)?,
            prefix: row.get(2)?,
            key_hash: row.get(3)?,
            created_at: row.get(4)?,
            last_used_at: row.get(5)?,
            revoked_at: row.get(6)?,
        })
    }
}

impl FromRow for EventLogEntry {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let payload: String = row.get(3)?;
        Ok(EventLogEntry {
            id: row.get(0)?,
            shop_id: row.get(1)?,
            event: row.get(2)?,
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            created_at: row.get(4)?,
        })
    }
}
