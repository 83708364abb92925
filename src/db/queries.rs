use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params, types::Value};

use crate::billing::SubscriptionSnapshot;
use crate::crypto::{API_KEY_PREFIX, generate_api_key, hash_secret};
use crate::error::{AppError, Result, msg};
use crate::id::EntityType;
use crate::models::*;

use super::from_row::{
    API_KEY_COLS, EVENT_LOG_COLS, FromRow, MEDIA_COLS, PLAN_COLS, SHOP_COLS, SUBSCRIPTION_COLS,
    TENANT_COLS, USER_COLS, query_all, query_one,
};

pub fn now() -> i64 {
    Utc::now().timestamp()
}

/// Builder for dynamic UPDATE statements with optional fields.
/// Combines multiple field updates into a single query.
struct UpdateBuilder {
    table: &'static str,
    id: String,
    fields: Vec<(&'static str, Value)>,
    track_updated_at: bool,
}

impl UpdateBuilder {
    fn new(table: &'static str, id: &str) -> Self {
        Self {
            table,
            id: id.to_string(),
            fields: Vec::new(),
            track_updated_at: false,
        }
    }

    fn with_updated_at(mut self) -> Self {
        self.track_updated_at = true;
        self
    }

    fn set(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.fields.push((column, value.into()));
        self
    }

    fn set_opt<V: Into<Value>>(self, column: &'static str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.set(column, v),
            None => self,
        }
    }

    /// Set a column to an explicit value, writing NULL for `None`.
    fn set_nullable<V: Into<Value>>(mut self, column: &'static str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.fields.push((column, v.into())),
            None => self.fields.push((column, Value::Null)),
        }
        self
    }

    fn execute(mut self, conn: &Connection) -> Result<bool> {
        if self.fields.is_empty() {
            return Ok(false);
        }
        if self.track_updated_at {
            self.fields.push(("updated_at", now().into()));
        }
        let sets: Vec<String> = self
            .fields
            .iter()
            .map(|(col, _)| format!("{} = ?", col))
            .collect();
        let mut values: Vec<Value> = self.fields.into_iter().map(|(_, v)| v).collect();
        values.push(self.id.into());
        let sql = format!("UPDATE {} SET {} WHERE id = ?", self.table, sets.join(", "));
        let affected = conn.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(affected > 0)
    }

    /// Execute the update and return the updated row via RETURNING.
    fn execute_returning<T: FromRow>(
        mut self,
        conn: &Connection,
        returning_cols: &str,
    ) -> Result<Option<T>> {
        if self.fields.is_empty() {
            return Ok(None);
        }
        if self.track_updated_at {
            self.fields.push(("updated_at", now().into()));
        }
        let sets: Vec<String> = self
            .fields
            .iter()
            .map(|(col, _)| format!("{} = ?", col))
            .collect();
        let mut values: Vec<Value> = self.fields.into_iter().map(|(_, v)| v).collect();
        values.push(self.id.into());
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ? RETURNING {}",
            self.table,
            sets.join(", "),
            returning_cols
        );
        conn.query_row(&sql, rusqlite::params_from_iter(values), T::from_row)
            .optional()
            .map_err(Into::into)
    }
}

/// Column holding the counter for a resource on `shops`.
fn usage_column(resource: ResourceKind) -> &'static str {
    match resource {
        ResourceKind::Products => "products_count",
        ResourceKind::Orders => "orders_this_month",
        ResourceKind::Storage => "storage_used_mb",
    }
}

/// Column holding the limit for a resource on `shops`.
fn limit_column(resource: ResourceKind) -> &'static str {
    match resource {
        ResourceKind::Products => "products_limit",
        ResourceKind::Orders => "orders_per_month_limit",
        ResourceKind::Storage => "storage_limit_mb",
    }
}

// ============ Plans ============

pub fn create_plan(conn: &Connection, input: &CreatePlan) -> Result<Plan> {
    input.validate()?;
    let id = EntityType::Plan.gen_id();
    let now = now();
    let features = serde_json::to_string(&input.features)?;

    conn.execute(
        "INSERT INTO plans (id, slug, name, price_cents, currency, billing_cycle, trial_days,
            products_limit, orders_per_month, storage_limit_mb, subdomain_enabled, features,
            external_product_id, external_price_id, is_active, sort_order, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 1, ?15, ?16, ?16)",
        params![
            &id,
            &input.slug,
            &input.name,
            input.price_cents,
            &input.currency,
            input.billing_cycle.as_ref().map(AsRef::<str>::as_ref),
            input.trial_days,
            input.products_limit,
            input.orders_per_month,
            input.storage_limit_mb,
            input.subdomain_enabled as i32,
            &features,
            &input.external_product_id,
            &input.external_price_id,
            input.sort_order,
            now,
        ],
    )?;

    get_plan_by_id(conn, &id)?
        .ok_or_else(|| AppError::Internal("Plan vanished after insert".into()))
}

pub fn get_plan_by_id(conn: &Connection, id: &str) -> Result<Option<Plan>> {
    query_one(
        conn,
        &format!("SELECT {} FROM plans WHERE id = ?1", PLAN_COLS),
        &[&id],
    )
}

pub fn get_plan_by_slug(conn: &Connection, slug: &str) -> Result<Option<Plan>> {
    query_one(
        conn,
        &format!("SELECT {} FROM plans WHERE slug = ?1", PLAN_COLS),
        &[&slug],
    )
}

pub fn get_plan_by_external_price_id(conn: &Connection, price_id: &str) -> Result<Option<Plan>> {
    query_one(
        conn,
        &format!("SELECT {} FROM plans WHERE external_price_id = ?1", PLAN_COLS),
        &[&price_id],
    )
}

/// The plan shops fall back to when they have no paid subscription.
pub fn get_free_plan(conn: &Connection) -> Result<Option<Plan>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM plans WHERE price_cents = 0 AND is_active = 1
             ORDER BY slug = 'free' DESC, sort_order LIMIT 1",
            PLAN_COLS
        ),
        &[],
    )
}

pub fn list_active_plans(conn: &Connection) -> Result<Vec<Plan>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM plans WHERE is_active = 1 ORDER BY sort_order, price_cents",
            PLAN_COLS
        ),
        &[],
    )
}

/// Link a plan to its billing-provider product and price.
pub fn set_plan_external_ids(
    conn: &Connection,
    plan_id: &str,
    external_product_id: Option<&str>,
    external_price_id: &str,
) -> Result<Option<Plan>> {
    UpdateBuilder::new("plans", plan_id)
        .with_updated_at()
        .set_opt("external_product_id", external_product_id.map(String::from))
        .set("external_price_id", external_price_id.to_string())
        .execute_returning(conn, PLAN_COLS)
}

/// Insert each stock plan whose slug does not exist yet. Returns the number inserted.
pub fn seed_default_plans(conn: &Connection) -> Result<usize> {
    let mut inserted = 0;
    for plan in default_plans() {
        if get_plan_by_slug(conn, &plan.slug)?.is_none() {
            create_plan(conn, &plan)?;
            inserted += 1;
        }
    }
    Ok(inserted)
}

// ============ Shops ============

pub fn create_shop(conn: &Connection, input: &CreateShop) -> Result<Shop> {
    if input.name.trim().is_empty() {
        return Err(AppError::BadRequest("name cannot be empty".into()));
    }
    let id = EntityType::Shop.gen_id();
    let now = now();
    let free_plan_id = get_free_plan(conn)?.map(|p| p.id);

    conn.execute(
        "INSERT INTO shops (id, name, current_plan_id, products_limit, orders_per_month_limit,
            storage_limit_mb, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            &id,
            input.name.trim(),
            free_plan_id,
            FREE_PRODUCTS_LIMIT,
            FREE_ORDERS_PER_MONTH,
            FREE_STORAGE_LIMIT_MB,
            now
        ],
    )?;

    get_shop_by_id(conn, &id)?.ok_or_else(|| AppError::Internal("Shop vanished after insert".into()))
}

pub fn get_shop_by_id(conn: &Connection, id: &str) -> Result<Option<Shop>> {
    query_one(
        conn,
        &format!("SELECT {} FROM shops WHERE id = ?1", SHOP_COLS),
        &[&id],
    )
}

pub fn shop_exists(conn: &Connection, id: &str) -> Result<bool> {
    conn.query_row("SELECT EXISTS(SELECT 1 FROM shops WHERE id = ?1)", [id], |r| r.get(0))
        .map_err(Into::into)
}

pub fn list_shop_ids(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM shops ORDER BY created_at, id")?;
    let ids = stmt
        .query_map([], |r| r.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Mirror a plan's limits onto the shop cache.
pub fn apply_plan_to_shop(
    conn: &Connection,
    shop_id: &str,
    plan: &Plan,
    status: SubscriptionStatus,
) -> Result<bool> {
    UpdateBuilder::new("shops", shop_id)
        .with_updated_at()
        .set("current_plan_id", plan.id.clone())
        .set("subscription_status", status.as_ref().to_string())
        .set_nullable("products_limit", plan.products_limit)
        .set_nullable("orders_per_month_limit", plan.orders_per_month)
        .set_nullable("storage_limit_mb", plan.storage_limit_mb)
        .set("has_premium_subdomain", plan.subdomain_enabled as i32)
        .execute(conn)
}

/// Put the shop back on free-tier limits, recording why in `status`.
pub fn revert_shop_to_free(
    conn: &Connection,
    shop_id: &str,
    status: SubscriptionStatus,
) -> Result<bool> {
    let free = get_free_plan(conn)?;
    let (plan_id, products, orders, storage) = match &free {
        Some(p) => (
            Some(p.id.clone()),
            p.products_limit,
            p.orders_per_month,
            p.storage_limit_mb,
        ),
        None => (
            None,
            Some(FREE_PRODUCTS_LIMIT),
            Some(FREE_ORDERS_PER_MONTH),
            Some(FREE_STORAGE_LIMIT_MB),
        ),
    };
    UpdateBuilder::new("shops", shop_id)
        .with_updated_at()
        .set_nullable("current_plan_id", plan_id)
        .set("subscription_status", status.as_ref().to_string())
        .set_nullable("products_limit", products)
        .set_nullable("orders_per_month_limit", orders)
        .set_nullable("storage_limit_mb", storage)
        .set("has_premium_subdomain", 0)
        .execute(conn)
}

pub fn set_shop_subscription_status(
    conn: &Connection,
    shop_id: &str,
    status: SubscriptionStatus,
) -> Result<bool> {
    UpdateBuilder::new("shops", shop_id)
        .with_updated_at()
        .set("subscription_status", status.as_ref().to_string())
        .execute(conn)
}

pub fn set_shop_billing_customer(conn: &Connection, shop_id: &str, customer_id: &str) -> Result<bool> {
    UpdateBuilder::new("shops", shop_id)
        .with_updated_at()
        .set("billing_customer_id", customer_id.to_string())
        .execute(conn)
}

// ============ Usage counters ============

/// Raise a counter by `amount` only if the result stays within the limit.
///
/// Single conditional UPDATE: concurrent callers cannot both pass the check.
/// Returns false when the limit would be exceeded or the shop does not exist.
pub fn increment_usage(
    conn: &Connection,
    shop_id: &str,
    resource: ResourceKind,
    amount: i64,
) -> Result<bool> {
    let col = usage_column(resource);
    let limit = limit_column(resource);
    let sql = format!(
        "UPDATE shops SET {col} = {col} + ?1, updated_at = ?2
         WHERE id = ?3 AND ({limit} IS NULL OR {col} + ?1 <= {limit})"
    );
    let affected = conn.execute(&sql, params![amount, now(), shop_id])?;
    Ok(affected > 0)
}

/// Lower a counter, flooring at zero.
pub fn decrement_usage(
    conn: &Connection,
    shop_id: &str,
    resource: ResourceKind,
    amount: i64,
) -> Result<bool> {
    let col = usage_column(resource);
    let sql = format!(
        "UPDATE shops SET {col} = MAX(0, {col} - ?1), updated_at = ?2 WHERE id = ?3"
    );
    let affected = conn.execute(&sql, params![amount, now(), shop_id])?;
    Ok(affected > 0)
}

pub fn set_storage_used(conn: &Connection, shop_id: &str, mb: i64) -> Result<bool> {
    UpdateBuilder::new("shops", shop_id)
        .with_updated_at()
        .set("storage_used_mb", mb)
        .execute(conn)
}

/// Zero monthly order counters that are non-zero. Returns the number of shops reset.
pub fn reset_monthly_orders(conn: &Connection, at: i64) -> Result<usize> {
    let affected = conn.execute(
        "UPDATE shops SET orders_this_month = 0, last_usage_reset_at = ?1, updated_at = ?1
         WHERE orders_this_month > 0",
        [at],
    )?;
    Ok(affected)
}

// ============ Media ============

pub fn create_media(conn: &Connection, shop_id: &str, input: &CreateMedia) -> Result<Media> {
    if input.size_bytes < 0 {
        return Err(AppError::BadRequest("size_bytes cannot be negative".into()));
    }
    let media = Media {
        id: EntityType::Media.gen_id(),
        shop_id: shop_id.to_string(),
        kind: input.kind,
        path: input.path.clone(),
        size_bytes: input.size_bytes,
        created_at: now(),
    };
    conn.execute(
        "INSERT INTO media (id, shop_id, kind, path, size_bytes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            &media.id,
            &media.shop_id,
            media.kind.as_ref(),
            &media.path,
            media.size_bytes,
            media.created_at
        ],
    )?;
    Ok(media)
}

pub fn list_media_for_shop(conn: &Connection, shop_id: &str) -> Result<Vec<Media>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM media WHERE shop_id = ?1 ORDER BY created_at",
            MEDIA_COLS
        ),
        &[&shop_id],
    )
}

pub fn sum_media_bytes(conn: &Connection, shop_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(SUM(size_bytes), 0) FROM media WHERE shop_id = ?1",
        [shop_id],
        |r| r.get(0),
    )
    .map_err(Into::into)
}

// ============ Tenants ============

pub fn get_tenant_by_subdomain(conn: &Connection, subdomain: &str) -> Result<Option<Tenant>> {
    query_one(
        conn,
        &format!("SELECT {} FROM tenants WHERE subdomain = ?1", TENANT_COLS),
        &[&subdomain],
    )
}

pub fn get_tenant_by_shop(conn: &Connection, shop_id: &str) -> Result<Option<Tenant>> {
    query_one(
        conn,
        &format!("SELECT {} FROM tenants WHERE shop_id = ?1", TENANT_COLS),
        &[&shop_id],
    )
}

pub fn subdomain_taken(conn: &Connection, subdomain: &str) -> Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM tenants WHERE subdomain = ?1)",
        [subdomain],
        |r| r.get(0),
    )
    .map_err(Into::into)
}

pub fn create_tenant(
    conn: &Connection,
    shop_id: &str,
    subdomain: Option<&str>,
    tier: Tier,
) -> Result<Tenant> {
    let now = now();
    let tenant = Tenant {
        id: EntityType::Tenant.gen_id(),
        shop_id: shop_id.to_string(),
        subdomain: subdomain.map(String::from),
        tier,
        premium_since: (tier != Tier::Free).then_some(now),
        premium_expires_at: None,
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO tenants (id, shop_id, subdomain, tier, premium_since, premium_expires_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?6)",
        params![
            &tenant.id,
            &tenant.shop_id,
            &tenant.subdomain,
            tenant.tier.as_ref(),
            tenant.premium_since,
            now
        ],
    )?;
    Ok(tenant)
}

/// Record the tenant's premium window after a plan change or cancellation.
pub fn update_tenant_tier(
    conn: &Connection,
    tenant_id: &str,
    tier: Tier,
    premium_expires_at: Option<i64>,
) -> Result<Option<Tenant>> {
    UpdateBuilder::new("tenants", tenant_id)
        .with_updated_at()
        .set("tier", tier.as_ref().to_string())
        .set_nullable("premium_expires_at", premium_expires_at)
        .execute_returning(conn, TENANT_COLS)
}

/// Delete a tenant and clear its shop's subdomain flag in one transaction.
pub fn delete_tenant(conn: &mut Connection, tenant_id: &str) -> Result<bool> {
    let tx = conn.transaction()?;
    let shop_id: Option<String> = tx
        .query_row("SELECT shop_id FROM tenants WHERE id = ?1", [tenant_id], |r| r.get(0))
        .optional()?;
    let Some(shop_id) = shop_id else {
        return Ok(false);
    };
    tx.execute("UPDATE subscriptions SET tenant_id = NULL WHERE tenant_id = ?1", [tenant_id])?;
    tx.execute("DELETE FROM tenants WHERE id = ?1", [tenant_id])?;
    tx.execute(
        "UPDATE shops SET has_premium_subdomain = 0, updated_at = ?1 WHERE id = ?2",
        params![now(), &shop_id],
    )?;
    tx.commit()?;
    Ok(true)
}

// ============ Subscriptions ============

/// Fields for a freshly created local subscription row.
#[derive(Debug)]
pub struct NewSubscription<'a> {
    pub shop_id: &'a str,
    pub tenant_id: Option<&'a str>,
    pub plan_id: &'a str,
    pub snapshot: &'a SubscriptionSnapshot,
    pub metadata: Option<serde_json::Value>,
}

pub fn insert_subscription(conn: &Connection, input: &NewSubscription) -> Result<Subscription> {
    let id = EntityType::Subscription.gen_id();
    let now = now();
    let snap = input.snapshot;
    let metadata = input
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO subscriptions (id, shop_id, tenant_id, plan_id, status, trial_ends_at,
            current_period_start, current_period_end, cancel_at_period_end, canceled_at, ends_at,
            external_subscription_id, external_customer_id, external_price_id, remote_version,
            metadata, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)",
        params![
            &id,
            input.shop_id,
            input.tenant_id,
            input.plan_id,
            snap.status.as_ref(),
            snap.trial_end,
            snap.current_period_start,
            snap.current_period_end,
            snap.cancel_at_period_end as i32,
            snap.canceled_at,
            snap.local_ends_at(),
            &snap.external_id,
            &snap.customer_id,
            &snap.price_id,
            snap.version,
            metadata,
            now,
        ],
    )?;

    get_subscription_by_id(conn, &id)?
        .ok_or_else(|| AppError::Internal("Subscription vanished after insert".into()))
}

pub fn get_subscription_by_id(conn: &Connection, id: &str) -> Result<Option<Subscription>> {
    query_one(
        conn,
        &format!("SELECT {} FROM subscriptions WHERE id = ?1", SUBSCRIPTION_COLS),
        &[&id],
    )
}

pub fn get_subscription_by_external_id(
    conn: &Connection,
    external_id: &str,
) -> Result<Option<Subscription>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM subscriptions WHERE external_subscription_id = ?1",
            SUBSCRIPTION_COLS
        ),
        &[&external_id],
    )
}

/// The shop's subscription whose stored status is active or trialing.
pub fn get_valid_subscription_for_shop(
    conn: &Connection,
    shop_id: &str,
) -> Result<Option<Subscription>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM subscriptions
             WHERE shop_id = ?1 AND status IN ('active', 'trialing')
             ORDER BY created_at DESC LIMIT 1",
            SUBSCRIPTION_COLS
        ),
        &[&shop_id],
    )
}

/// Newest subscription whose payment the provider is still collecting.
pub fn get_pending_subscription_for_shop(
    conn: &Connection,
    shop_id: &str,
) -> Result<Option<Subscription>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM subscriptions
             WHERE shop_id = ?1 AND status IN ('incomplete', 'past_due')
             ORDER BY created_at DESC LIMIT 1",
            SUBSCRIPTION_COLS
        ),
        &[&shop_id],
    )
}

pub fn count_valid_subscriptions_for_shop(conn: &Connection, shop_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM subscriptions WHERE shop_id = ?1 AND status IN ('active', 'trialing')",
        [shop_id],
        |r| r.get(0),
    )
    .map_err(Into::into)
}

pub fn list_subscriptions_for_shop_paginated(
    conn: &Connection,
    shop_id: &str,
    limit: i64,
    offset: i64,
) -> Result<(Vec<Subscription>, i64)> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM subscriptions WHERE shop_id = ?1",
        [shop_id],
        |r| r.get(0),
    )?;
    let items = query_all(
        conn,
        &format!(
            "SELECT {} FROM subscriptions WHERE shop_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
            SUBSCRIPTION_COLS
        ),
        &[&shop_id, &limit, &offset],
    )?;
    Ok((items, total))
}

/// Overwrite provider-owned fields from a snapshot.
pub fn update_subscription_from_snapshot(
    conn: &Connection,
    subscription_id: &str,
    plan_id: &str,
    tenant_id: Option<&str>,
    snap: &SubscriptionSnapshot,
) -> Result<Option<Subscription>> {
    UpdateBuilder::new("subscriptions", subscription_id)
        .with_updated_at()
        .set("plan_id", plan_id.to_string())
        .set_opt("tenant_id", tenant_id.map(String::from))
        .set("status", snap.status.as_ref().to_string())
        .set_nullable("trial_ends_at", snap.trial_end)
        .set_nullable("current_period_start", snap.current_period_start)
        .set_nullable("current_period_end", snap.current_period_end)
        .set("cancel_at_period_end", snap.cancel_at_period_end as i32)
        .set_nullable("canceled_at", snap.canceled_at)
        .set_nullable("ends_at", snap.local_ends_at())
        .set("external_customer_id", snap.customer_id.clone())
        .set_nullable("external_price_id", snap.price_id.clone())
        .set("remote_version", snap.version)
        .execute_returning(conn, SUBSCRIPTION_COLS)
}

pub fn mark_subscription_canceled(
    conn: &Connection,
    subscription_id: &str,
    at: i64,
) -> Result<Option<Subscription>> {
    UpdateBuilder::new("subscriptions", subscription_id)
        .with_updated_at()
        .set("status", SubscriptionStatus::Canceled.as_ref().to_string())
        .set("cancel_at_period_end", 0)
        .set("canceled_at", at)
        .set("ends_at", at)
        .execute_returning(conn, SUBSCRIPTION_COLS)
}

/// Set or clear a deferred cancellation.
pub fn set_subscription_cancel_at_period_end(
    conn: &Connection,
    subscription_id: &str,
    flag: bool,
    canceled_at: Option<i64>,
    ends_at: Option<i64>,
) -> Result<Option<Subscription>> {
    UpdateBuilder::new("subscriptions", subscription_id)
        .with_updated_at()
        .set("cancel_at_period_end", flag as i32)
        .set_nullable("canceled_at", canceled_at)
        .set_nullable("ends_at", ends_at)
        .execute_returning(conn, SUBSCRIPTION_COLS)
}

// ============ Users & API keys ============

pub fn create_user(conn: &Connection, input: &CreateUser) -> Result<User> {
    let email = input.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::BadRequest("Invalid email format".into()));
    }
    let user = User {
        id: EntityType::User.gen_id(),
        email,
        name: input.name.clone(),
        shop_id: input.shop_id.clone(),
        created_at: now(),
    };
    conn.execute(
        "INSERT INTO users (id, email, name, shop_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![&user.id, &user.email, &user.name, &user.shop_id, user.created_at],
    )?;
    Ok(user)
}

pub fn get_user_by_id(conn: &Connection, id: &str) -> Result<Option<User>> {
    query_one(
        conn,
        &format!("SELECT {} FROM users WHERE id = ?1", USER_COLS),
        &[&id],
    )
}

/// Create an API key for a user. Returns the stored key and the raw secret,
/// which is never retrievable again.
pub fn create_api_key(conn: &Connection, user_id: &str) -> Result<(ApiKey, String)> {
    let raw = generate_api_key();
    let key = ApiKey {
        id: EntityType::ApiKey.gen_id(),
        user_id: user_id.to_string(),
        prefix: raw[..API_KEY_PREFIX.len() + 8].to_string(),
        key_hash: hash_secret(&raw),
        created_at: now(),
        last_used_at: None,
        revoked_at: None,
    };
    conn.execute(
        "INSERT INTO api_keys (id, user_id, key_prefix, key_hash, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![&key.id, &key.user_id, &key.prefix, &key.key_hash, key.created_at],
    )?;
    Ok((key, raw))
}

pub fn revoke_api_key(conn: &Connection, key_id: &str) -> Result<bool> {
    UpdateBuilder::new("api_keys", key_id)
        .set("revoked_at", now())
        .execute(conn)
}

/// Resolve a raw bearer key to its user. Revoked keys never match.
pub fn get_user_by_api_key(conn: &Connection, api_key: &str) -> Result<Option<User>> {
    let hash = hash_secret(api_key);
    let key: Option<ApiKey> = query_one(
        conn,
        &format!(
            "SELECT {} FROM api_keys WHERE key_hash = ?1 AND revoked_at IS NULL",
            API_KEY_COLS
        ),
        &[&hash],
    )?;
    let Some(key) = key else {
        return Ok(None);
    };

    // Best effort; a failed timestamp update must not fail authentication.
    if let Err(e) = conn.execute(
        "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
        params![now(), &key.id],
    ) {
        tracing::debug!("Failed to update api key last_used_at: {}", e);
    }

    get_user_by_id(conn, &key.user_id)
}

/// The shop bound to a user, or a NotFound error.
pub fn require_user_shop(conn: &Connection, user: &User) -> Result<Shop> {
    let shop_id = user
        .shop_id
        .as_deref()
        .ok_or_else(|| AppError::NotFound(msg::NO_SHOP_FOR_USER.into()))?;
    get_shop_by_id(conn, shop_id)?.ok_or_else(|| AppError::NotFound(msg::SHOP_NOT_FOUND.into()))
}

// ============ Webhook replay log ============

/// Record a provider event id. Returns false when it was already recorded.
pub fn try_record_webhook_event(
    conn: &Connection,
    provider: &str,
    event_id: &str,
    event_type: &str,
) -> Result<bool> {
    let affected = conn.execute(
        "INSERT OR IGNORE INTO webhook_events (provider, event_id, event_type, received_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![provider, event_id, event_type, now()],
    )?;
    Ok(affected > 0)
}

// ============ Usage alerts ============

/// Record that a threshold level fired. Returns false when it already had.
pub fn try_record_usage_alert(
    conn: &Connection,
    shop_id: &str,
    resource: ResourceKind,
    level: ThresholdLevel,
) -> Result<bool> {
    let affected = conn.execute(
        "INSERT OR IGNORE INTO usage_alerts (shop_id, resource, level, fired_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![shop_id, resource.as_ref(), level.as_ref(), now()],
    )?;
    Ok(affected > 0)
}

/// Re-arm alerts above the current level so they can fire again.
pub fn clear_usage_alerts_above(
    conn: &Connection,
    shop_id: &str,
    resource: ResourceKind,
    current: ThresholdLevel,
) -> Result<usize> {
    let affected = match current {
        ThresholdLevel::Below => conn.execute(
            "DELETE FROM usage_alerts WHERE shop_id = ?1 AND resource = ?2",
            params![shop_id, resource.as_ref()],
        )?,
        ThresholdLevel::Warning => conn.execute(
            "DELETE FROM usage_alerts WHERE shop_id = ?1 AND resource = ?2 AND level = 'exceeded'",
            params![shop_id, resource.as_ref()],
        )?,
        ThresholdLevel::Exceeded => 0,
    };
    Ok(affected)
}

pub fn clear_usage_alerts_for_resource(conn: &Connection, resource: ResourceKind) -> Result<usize> {
    let affected = conn.execute(
        "DELETE FROM usage_alerts WHERE resource = ?1",
        [resource.as_ref()],
    )?;
    Ok(affected)
}

// ============ Event log ============

pub fn insert_event_log(
    conn: &Connection,
    shop_id: &str,
    event: &DomainEvent,
) -> Result<EventLogEntry> {
    let entry = EventLogEntry {
        id: EntityType::Event.gen_id(),
        shop_id: shop_id.to_string(),
        event: event.name().to_string(),
        payload: serde_json::to_value(event)?,
        created_at: now(),
    };
    conn.execute(
        "INSERT INTO event_log (id, shop_id, event, payload, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            &entry.id,
            &entry.shop_id,
            &entry.event,
            entry.payload.to_string(),
            entry.created_at
        ],
    )?;
    Ok(entry)
}

pub fn list_events_for_shop(conn: &Connection, shop_id: &str) -> Result<Vec<EventLogEntry>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM event_log WHERE shop_id = ?1 ORDER BY created_at, rowid",
            EVENT_LOG_COLS
        ),
        &[&shop_id],
    )
}

// ============ Maintenance jobs ============

/// Take the named lease if it is free or expired. Returns true on success.
pub fn try_acquire_job_lease(
    conn: &Connection,
    name: &str,
    holder: &str,
    ttl_secs: i64,
) -> Result<bool> {
    let now = now();
    let affected = conn.execute(
        "INSERT INTO job_leases (name, holder, expires_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
         WHERE job_leases.expires_at <= ?4",
        params![name, holder, now + ttl_secs, now],
    )?;
    Ok(affected > 0)
}

pub fn release_job_lease(conn: &Connection, name: &str, holder: &str) -> Result<bool> {
    let affected = conn.execute(
        "DELETE FROM job_leases WHERE name = ?1 AND holder = ?2",
        params![name, holder],
    )?;
    Ok(affected > 0)
}

pub fn record_job_run(conn: &Connection, name: &str, at: i64, affected: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO job_runs (name, last_completed_at, last_affected) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO UPDATE SET last_completed_at = excluded.last_completed_at,
            last_affected = excluded.last_affected",
        params![name, at, affected],
    )?;
    Ok(())
}

pub fn get_job_last_run(conn: &Connection, name: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT last_completed_at FROM job_runs WHERE name = ?1",
        [name],
        |r| r.get(0),
    )
    .optional()
    .map_err(Into::into)
}

// ============ Stats ============

pub fn global_usage_stats(conn: &Connection) -> Result<GlobalUsageStats> {
    let (total_shops, total_storage_mb, orders_this_month): (i64, i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(storage_used_mb), 0), COALESCE(SUM(orders_this_month), 0)
         FROM shops",
        [],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;
    let valid_subscriptions: i64 = conn.query_row(
        "SELECT COUNT(*) FROM subscriptions WHERE status IN ('active', 'trialing')",
        [],
        |r| r.get(0),
    )?;
    let mut stmt = conn.prepare(
        "SELECT COALESCE(p.slug, 'none'), COUNT(*) FROM shops s
         LEFT JOIN plans p ON p.id = s.current_plan_id
         GROUP BY 1 ORDER BY 2 DESC, 1",
    )?;
    let shops_by_plan = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<std::result::Result<Vec<(String, i64)>, _>>()?;

    Ok(GlobalUsageStats {
        total_shops,
        valid_subscriptions,
        shops_by_plan,
        total_storage_mb,
        orders_this_month,
    })
}
