use rusqlite::Connection;

/// Initialize the database schema. Safe to run on every startup.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- Plans (seed/admin data; referenced, never owned)
        -- NULL limit = unlimited
        CREATE TABLE IF NOT EXISTS plans (
            id TEXT PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            price_cents INTEGER NOT NULL CHECK (price_cents >= 0),
            currency TEXT NOT NULL DEFAULT 'usd',
            billing_cycle TEXT CHECK (billing_cycle IN ('monthly', 'yearly')),
            trial_days INTEGER NOT NULL DEFAULT 0,
            products_limit INTEGER,
            orders_per_month INTEGER,
            storage_limit_mb INTEGER,
            subdomain_enabled INTEGER NOT NULL DEFAULT 0,
            features TEXT NOT NULL DEFAULT '[]',
            external_product_id TEXT,
            external_price_id TEXT UNIQUE,
            is_active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Shops (usage owner). Limits and counters are caches mirrored from
        -- the current plan; defaults are the free tier.
        CREATE TABLE IF NOT EXISTS shops (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            current_plan_id TEXT REFERENCES plans(id),
            subscription_status TEXT,
            billing_customer_id TEXT,
            has_premium_subdomain INTEGER NOT NULL DEFAULT 0,
            products_limit INTEGER DEFAULT 25,
            orders_per_month_limit INTEGER DEFAULT 100,
            storage_limit_mb INTEGER DEFAULT 500,
            products_count INTEGER NOT NULL DEFAULT 0 CHECK (products_count >= 0),
            orders_this_month INTEGER NOT NULL DEFAULT 0 CHECK (orders_this_month >= 0),
            storage_used_mb INTEGER NOT NULL DEFAULT 0 CHECK (storage_used_mb >= 0),
            last_usage_reset_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_shops_orders ON shops(id) WHERE orders_this_month > 0;

        -- Tenants (subdomain routing identity, one per shop)
        CREATE TABLE IF NOT EXISTS tenants (
            id TEXT PRIMARY KEY,
            shop_id TEXT NOT NULL UNIQUE REFERENCES shops(id) ON DELETE CASCADE,
            subdomain TEXT UNIQUE,
            tier TEXT NOT NULL CHECK (tier IN ('free', 'starter', 'growth', 'enterprise')),
            premium_since INTEGER,
            premium_expires_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Subscriptions (history retained; never deleted)
        CREATE TABLE IF NOT EXISTS subscriptions (
            id TEXT PRIMARY KEY,
            shop_id TEXT NOT NULL REFERENCES shops(id),
            tenant_id TEXT REFERENCES tenants(id),
            plan_id TEXT NOT NULL REFERENCES plans(id),
            status TEXT NOT NULL CHECK (status IN (
                'incomplete', 'trialing', 'active', 'past_due',
                'unpaid', 'canceled', 'incomplete_expired'
            )),
            trial_ends_at INTEGER,
            current_period_start INTEGER,
            current_period_end INTEGER,
            cancel_at_period_end INTEGER NOT NULL DEFAULT 0,
            canceled_at INTEGER,
            ends_at INTEGER,
            external_subscription_id TEXT NOT NULL UNIQUE,
            external_customer_id TEXT,
            external_price_id TEXT,
            remote_version INTEGER NOT NULL DEFAULT 0,
            metadata TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_subscriptions_shop ON subscriptions(shop_id, created_at);
        -- At most one valid subscription per shop
        CREATE UNIQUE INDEX IF NOT EXISTS idx_subscriptions_one_valid
            ON subscriptions(shop_id) WHERE status IN ('active', 'trialing');

        -- Media owned by shops (written by the media pipeline; read for storage accounting)
        CREATE TABLE IF NOT EXISTS media (
            id TEXT PRIMARY KEY,
            shop_id TEXT NOT NULL REFERENCES shops(id) ON DELETE CASCADE,
            kind TEXT NOT NULL CHECK (kind IN (
                'logo', 'banner', 'gallery', 'product_image', 'product_thumbnail'
            )),
            path TEXT NOT NULL,
            size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_media_shop ON media(shop_id);

        -- Vendor users and their API keys
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            shop_id TEXT REFERENCES shops(id) ON DELETE SET NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS api_keys (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            key_prefix TEXT NOT NULL,
            key_hash TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL,
            last_used_at INTEGER,
            revoked_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_api_keys_user ON api_keys(user_id);

        -- Webhook replay log (provider event ids already handled)
        CREATE TABLE IF NOT EXISTS webhook_events (
            provider TEXT NOT NULL,
            event_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            received_at INTEGER NOT NULL,
            PRIMARY KEY (provider, event_id)
        );

        -- Threshold notifications already sent, per level
        CREATE TABLE IF NOT EXISTS usage_alerts (
            shop_id TEXT NOT NULL REFERENCES shops(id) ON DELETE CASCADE,
            resource TEXT NOT NULL CHECK (resource IN ('products', 'orders', 'storage')),
            level TEXT NOT NULL CHECK (level IN ('warning', 'exceeded')),
            fired_at INTEGER NOT NULL,
            PRIMARY KEY (shop_id, resource, level)
        );

        -- Domain events emitted to collaborators
        CREATE TABLE IF NOT EXISTS event_log (
            id TEXT PRIMARY KEY,
            shop_id TEXT NOT NULL,
            event TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_event_log_shop ON event_log(shop_id, created_at);

        -- Maintenance job coordination
        CREATE TABLE IF NOT EXISTS job_leases (
            name TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS job_runs (
            name TEXT PRIMARY KEY,
            last_completed_at INTEGER NOT NULL,
            last_affected INTEGER NOT NULL DEFAULT 0
        );
        "#,
    )
}
