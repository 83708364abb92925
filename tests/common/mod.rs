//! Test utilities and fixtures for vendorplan integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

pub use vendorplan::billing::{
    BillingGateway, CreateRemoteSubscription, PriceChange, SubscriptionSnapshot,
};
pub use vendorplan::config::{Config, DowngradeTiming, EnforcementMode};
pub use vendorplan::db::{AppState, DbPool, create_pool, init_db, queries};
pub use vendorplan::error::{AppError, Result as AppResult};
pub use vendorplan::ledger::{SubscriptionLedger, SyncOutcome};
pub use vendorplan::models::*;
pub use vendorplan::notify::EventNotifier;

pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const TEST_PAYMENT_METHOD: &str = "pm_card_visa";
pub const ONE_DAY: i64 = 86_400;
pub const PERIOD_SECS: i64 = 30 * ONE_DAY;

// ============ Billing gateway double ============

#[derive(Default)]
struct MockState {
    subscriptions: HashMap<String, SubscriptionSnapshot>,
    next_id: u64,
    next_version: i64,
    failing: bool,
    create_status: Option<SubscriptionStatus>,
    calls: Vec<String>,
}

impl MockState {
    fn bump(&mut self) -> i64 {
        self.next_version += 1;
        self.next_version
    }
}

/// In-memory billing provider. Every mutation bumps the snapshot version, like
/// a provider's `updated` timestamp would.
#[derive(Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a gateway error.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    /// Status new subscriptions start in, e.g. `Incomplete` for a card
    /// that still needs authentication. Defaults to trialing or active.
    pub fn set_create_status(&self, status: Option<SubscriptionStatus>) {
        self.state.lock().unwrap().create_status = status;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn snapshot(&self, external_id: &str) -> Option<SubscriptionSnapshot> {
        self.state.lock().unwrap().subscriptions.get(external_id).cloned()
    }

    /// Mutate the provider-side subscription, as if changed on the provider
    /// dashboard. Returns the new snapshot.
    pub fn update(
        &self,
        external_id: &str,
        f: impl FnOnce(&mut SubscriptionSnapshot),
    ) -> SubscriptionSnapshot {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        let snap = state
            .subscriptions
            .get_mut(external_id)
            .expect("unknown mock subscription");
        f(snap);
        snap.version = version;
        snap.clone()
    }

    /// Forget a subscription so fetches return None.
    pub fn remove(&self, external_id: &str) {
        self.state.lock().unwrap().subscriptions.remove(external_id);
    }

    fn begin(&self, call: String) -> AppResult<std::sync::MutexGuard<'_, MockState>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if state.failing {
            return Err(AppError::Gateway("mock gateway unavailable".into()));
        }
        Ok(state)
    }

    fn mutate(
        &self,
        call: String,
        external_id: &str,
        f: impl FnOnce(&mut SubscriptionSnapshot),
    ) -> AppResult<()> {
        let mut state = self.begin(call)?;
        let version = state.bump();
        let snap = state
            .subscriptions
            .get_mut(external_id)
            .ok_or_else(|| AppError::Gateway(format!("No such subscription: {}", external_id)))?;
        f(snap);
        snap.version = version;
        Ok(())
    }
}

#[async_trait]
impl BillingGateway for MockGateway {
    fn provider_name(&self) -> &'static str {
        "mock"
    }

    async fn create_subscription(
        &self,
        request: &CreateRemoteSubscription,
    ) -> AppResult<SubscriptionSnapshot> {
        let mut state = self.begin(format!("create:{}", request.price_id))?;
        state.next_id += 1;
        let n = state.next_id;
        let version = state.bump();
        let now = queries::now();
        let trialing = request.trial_days > 0;
        let snap = SubscriptionSnapshot {
            external_id: format!("sub_mock_{}", n),
            customer_id: request
                .customer_id
                .clone()
                .unwrap_or_else(|| format!("cus_mock_{}", n)),
            status: state.create_status.unwrap_or(if trialing {
                SubscriptionStatus::Trialing
            } else {
                SubscriptionStatus::Active
            }),
            price_id: Some(request.price_id.clone()),
            current_period_start: Some(now),
            current_period_end: Some(now + PERIOD_SECS),
            trial_end: trialing.then(|| now + request.trial_days * ONE_DAY),
            cancel_at_period_end: false,
            canceled_at: None,
            ended_at: None,
            version,
        };
        state
            .subscriptions
            .insert(snap.external_id.clone(), snap.clone());
        Ok(snap)
    }

    async fn fetch_subscription(
        &self,
        external_id: &str,
    ) -> AppResult<Option<SubscriptionSnapshot>> {
        let state = self.begin(format!("fetch:{}", external_id))?;
        Ok(state.subscriptions.get(external_id).cloned())
    }

    async fn change_price(
        &self,
        external_id: &str,
        price_id: &str,
        change: PriceChange,
    ) -> AppResult<()> {
        let call = format!(
            "change_price:{}:{}:{}:{}",
            external_id,
            price_id,
            change.proration.as_ref(),
            change.keep_billing_anchor
        );
        self.mutate(call, external_id, |snap| {
            snap.price_id = Some(price_id.to_string());
        })
    }

    async fn cancel_now(&self, external_id: &str) -> AppResult<()> {
        let now = queries::now();
        self.mutate(format!("cancel_now:{}", external_id), external_id, |snap| {
            snap.status = SubscriptionStatus::Canceled;
            snap.canceled_at = Some(now);
            snap.ended_at = Some(now);
            snap.cancel_at_period_end = false;
        })
    }

    async fn set_cancel_at_period_end(&self, external_id: &str, cancel: bool) -> AppResult<()> {
        let now = queries::now();
        self.mutate(
            format!("cancel_at_period_end:{}:{}", external_id, cancel),
            external_id,
            |snap| {
                snap.cancel_at_period_end = cancel;
                snap.canceled_at = cancel.then_some(now);
            },
        )
    }

    async fn billing_portal_url(&self, customer_id: &str, return_url: &str) -> AppResult<String> {
        self.begin(format!("portal:{}", customer_id))?;
        Ok(format!(
            "https://billing.test/portal/{}?return={}",
            customer_id, return_url
        ))
    }
}

// ============ Environment ============

pub fn test_config() -> Config {
    Config {
        base_url: "https://vendorplan.test".to_string(),
        app_domain: "maindomain.com".to_string(),
        central_domains: vec!["maindomain.com".to_string(), "localhost".to_string()],
        stripe_webhook_secret: Some(TEST_WEBHOOK_SECRET.to_string()),
        ..Config::default()
    }
}

/// Create a file-backed pool in `dir` with the schema initialized.
///
/// File-backed so that every pooled connection sees the same database.
pub fn setup_test_pool(dir: &TempDir) -> DbPool {
    let path = dir.path().join("vendorplan-test.db");
    let pool = create_pool(path.to_str().unwrap()).expect("Failed to create test pool");
    let conn = pool.get().unwrap();
    init_db(&conn).expect("Failed to initialize schema");
    pool
}

/// A database, a mock gateway and the state wiring them together.
pub struct TestEnv {
    pub state: AppState,
    pub gateway: Arc<MockGateway>,
    _dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let pool = setup_test_pool(&dir);
        let gateway = Arc::new(MockGateway::new());
        let billing: Arc<dyn BillingGateway> = gateway.clone();
        let state = AppState {
            db: pool,
            config: Arc::new(config),
            billing,
            notifier: EventNotifier::disabled(),
        };
        Self {
            state,
            gateway,
            _dir: dir,
        }
    }

    pub fn conn(&self) -> PooledConnection<SqliteConnectionManager> {
        self.state.db.get().expect("Failed to get connection")
    }

    pub fn ledger(&self) -> SubscriptionLedger<'_> {
        SubscriptionLedger::from_state(&self.state)
    }

    pub fn app(&self) -> Router {
        vendorplan::app(self.state.clone())
    }

    pub fn shop(&self, shop_id: &str) -> Shop {
        queries::get_shop_by_id(&self.conn(), shop_id)
            .unwrap()
            .expect("shop should exist")
    }

    pub fn events(&self, shop_id: &str) -> Vec<String> {
        queries::list_events_for_shop(&self.conn(), shop_id)
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect()
    }
}

// ============ Fixtures ============

pub struct TestPlans {
    pub free: Plan,
    pub starter: Plan,
    pub growth: Plan,
    pub enterprise: Plan,
}

/// Seed the default plans and link the paid ones to mock prices
/// (`price_starter`, `price_growth`, `price_enterprise`).
pub fn seed_plans(conn: &rusqlite::Connection) -> TestPlans {
    queries::seed_default_plans(conn).expect("Failed to seed plans");
    let link = |slug: &str| {
        let plan = queries::get_plan_by_slug(conn, slug).unwrap().unwrap();
        queries::set_plan_external_ids(conn, &plan.id, None, &format!("price_{}", slug))
            .unwrap()
            .unwrap()
    };
    TestPlans {
        free: queries::get_plan_by_slug(conn, "free").unwrap().unwrap(),
        starter: link("starter"),
        growth: link("growth"),
        enterprise: link("enterprise"),
    }
}

pub fn create_test_shop(conn: &rusqlite::Connection, name: &str) -> Shop {
    queries::create_shop(
        conn,
        &CreateShop {
            name: name.to_string(),
        },
    )
    .expect("Failed to create test shop")
}

/// Create a shop, a vendor user bound to it, and an API key.
pub fn create_test_vendor(conn: &rusqlite::Connection, shop_name: &str) -> (Shop, User, String) {
    let shop = create_test_shop(conn, shop_name);
    let user = queries::create_user(
        conn,
        &CreateUser {
            email: format!("owner-{}@example.com", &shop.id[8..16]),
            name: format!("{} Owner", shop_name),
            shop_id: Some(shop.id.clone()),
        },
    )
    .expect("Failed to create test user");
    let (_, api_key) = queries::create_api_key(conn, &user.id).expect("Failed to create API key");
    (shop, user, api_key)
}

pub fn set_usage(conn: &rusqlite::Connection, shop_id: &str, resource: ResourceKind, value: i64) {
    let column = match resource {
        ResourceKind::Products => "products_count",
        ResourceKind::Orders => "orders_this_month",
        ResourceKind::Storage => "storage_used_mb",
    };
    conn.execute(
        &format!("UPDATE shops SET {} = ?1 WHERE id = ?2", column),
        rusqlite::params![value, shop_id],
    )
    .unwrap();
}

pub async fn subscribe(env: &TestEnv, shop_id: &str, plan: &Plan) -> SubscriptionWithPlan {
    env.ledger()
        .create(shop_id, &plan.id, TEST_PAYMENT_METHOD, None)
        .await
        .expect("Failed to subscribe")
}

// ============ HTTP helpers ============

pub fn stripe_signature_header(payload: &[u8], secret: &str, timestamp: i64) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(signed_payload.as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

pub async fn send(app: Router, request: Request<Body>) -> (axum::http::StatusCode, Value) {
    let response: Response<Body> = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|_| Value::String(
            String::from_utf8_lossy(&body).to_string(),
        ))
    };
    (status, json)
}
