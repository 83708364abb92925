//! Quota gate decisions and the quota middleware.

#[path = "../common/mod.rs"]
mod common;
use common::*;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::middleware::from_fn_with_state;
use axum::routing::post;
use serde_json::{Value, json};

use vendorplan::quota::{QuotaGate, require_quota};
use vendorplan::tenancy::{ResolutionSource, TenantContext, resolve_tenant};
use vendorplan::usage::{self, BYTES_PER_MB, IncrementOutcome};

fn setup(config: Config) -> (TestEnv, Shop) {
    let env = TestEnv::with_config(config);
    let shop = {
        let conn = env.conn();
        seed_plans(&conn);
        create_test_shop(&conn, "Quota Shop")
    };
    (env, shop)
}

fn context(shop: &Shop) -> TenantContext {
    TenantContext {
        shop_id: shop.id.clone(),
        tenant: None,
        source: ResolutionSource::Header,
    }
}

fn gate_check(env: &TestEnv, shop: &Shop, resource: ResourceKind, mb: i64) -> AppResult<()> {
    QuotaGate::new(&env.state.config, &env.state.notifier).check(
        &env.conn(),
        Some(&context(shop)),
        resource,
        mb,
    )
}

/// Resource-creating routes guarded the way a host application mounts them.
fn gated_app(env: &TestEnv) -> Router {
    let state = env.state.clone();
    Router::new()
        .route("/vendor/products", post(|| async { StatusCode::CREATED }))
        .route_layer(from_fn_with_state(
            state.clone(),
            require_quota(ResourceKind::Products),
        ))
        .merge(
            Router::new()
                .route("/vendor/media", post(|| async { StatusCode::CREATED }))
                .route_layer(from_fn_with_state(
                    state.clone(),
                    require_quota(ResourceKind::Storage),
                )),
        )
        .layer(from_fn_with_state(state.clone(), resolve_tenant))
        .with_state(state)
}

#[test]
fn test_hard_denial_payload() {
    let (env, shop) = setup(test_config());
    set_usage(&env.conn(), &shop.id, ResourceKind::Products, 25);

    let err = gate_check(&env, &shop, ResourceKind::Products, 0).unwrap_err();
    let AppError::QuotaExceeded(denial) = err else {
        panic!("expected a quota denial, got {:?}", err);
    };

    assert_eq!(denial.error, "Product limit reached");
    assert_eq!(denial.limit_type, "products");
    assert_eq!(denial.details.limit, Some(25));
    assert_eq!(denial.details.current, 25);
    assert_eq!(denial.details.remaining, Some(0));
    assert_eq!(
        denial.details.upgrade_url,
        "https://vendorplan.test/vendor/subscription/plans"
    );
    assert_eq!(denial.current_plan.as_deref(), Some("free"));
    assert_eq!(denial.message, "Upgrade your plan to increase limits");
}

#[test]
fn test_hard_mode_allows_below_limit() {
    let (env, shop) = setup(test_config());
    set_usage(&env.conn(), &shop.id, ResourceKind::Products, 24);
    set_usage(&env.conn(), &shop.id, ResourceKind::Orders, 99);

    gate_check(&env, &shop, ResourceKind::Products, 0).unwrap();
    gate_check(&env, &shop, ResourceKind::Orders, 0).unwrap();
}

#[test]
fn test_hard_mode_raises_threshold_events() {
    let (env, shop) = setup(test_config());
    set_usage(&env.conn(), &shop.id, ResourceKind::Products, 24);

    gate_check(&env, &shop, ResourceKind::Products, 0).unwrap();
    let outcome = usage::track(
        &env.conn(),
        &env.state.notifier,
        &env.state.config.thresholds,
        &shop.id,
        ResourceKind::Products,
        1,
    )
    .unwrap();
    assert_eq!(outcome, IncrementOutcome::Incremented);

    let levels: Vec<Value> = queries::list_events_for_shop(&env.conn(), &shop.id)
        .unwrap()
        .into_iter()
        .filter(|e| e.event == "usage_threshold")
        .map(|e| e.payload["level"].clone())
        .collect();
    assert_eq!(levels, vec![json!("warning"), json!("exceeded")]);

    // The next attempt is denied and does not repeat the alert.
    assert!(gate_check(&env, &shop, ResourceKind::Products, 0).is_err());
    assert_eq!(
        env.events(&shop.id)
            .iter()
            .filter(|e| e.as_str() == "usage_threshold")
            .count(),
        2
    );
}

#[test]
fn test_hard_mode_below_threshold_is_quiet() {
    let (env, shop) = setup(test_config());
    set_usage(&env.conn(), &shop.id, ResourceKind::Products, 10);

    gate_check(&env, &shop, ResourceKind::Products, 0).unwrap();
    usage::track(
        &env.conn(),
        &env.state.notifier,
        &env.state.config.thresholds,
        &shop.id,
        ResourceKind::Products,
        1,
    )
    .unwrap();

    assert!(env.events(&shop.id).is_empty());
}

#[test]
fn test_storage_checks_prospective_size() {
    let (env, shop) = setup(test_config());
    set_usage(&env.conn(), &shop.id, ResourceKind::Storage, 490);

    gate_check(&env, &shop, ResourceKind::Storage, 10).unwrap();
    let err = gate_check(&env, &shop, ResourceKind::Storage, 11).unwrap_err();
    assert!(matches!(err, AppError::QuotaExceeded(ref d) if d.limit_type == "storage"));
}

#[test]
fn test_unlimited_resource_never_denies() {
    let (env, shop) = setup(test_config());
    env.conn()
        .execute(
            "UPDATE shops SET orders_per_month_limit = NULL, orders_this_month = 999999 WHERE id = ?1",
            [&shop.id],
        )
        .unwrap();

    gate_check(&env, &shop, ResourceKind::Orders, 0).unwrap();
}

#[test]
fn test_no_tenant_passes() {
    let (env, _) = setup(test_config());
    QuotaGate::new(&env.state.config, &env.state.notifier)
        .check(&env.conn(), None, ResourceKind::Products, 0)
        .unwrap();
}

#[test]
fn test_soft_mode_records_instead_of_denying() {
    let config = Config {
        enforcement: EnforcementMode::Soft,
        ..test_config()
    };
    let (env, shop) = setup(config);
    set_usage(&env.conn(), &shop.id, ResourceKind::Products, 25);

    gate_check(&env, &shop, ResourceKind::Products, 0).unwrap();

    assert_eq!(env.events(&shop.id), vec!["usage_threshold".to_string()]);
}

#[tokio::test]
async fn test_middleware_returns_403_payload() {
    let (env, shop) = setup(test_config());
    set_usage(&env.conn(), &shop.id, ResourceKind::Products, 25);

    let (status, body) = send(
        gated_app(&env),
        Request::builder()
            .method("POST")
            .uri("/vendor/products")
            .header("x-shop-id", &shop.id)
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Product limit reached");
    assert_eq!(body["limit_type"], "products");
    assert_eq!(body["details"]["limit"], 25);
    assert_eq!(body["details"]["current"], 25);
    assert_eq!(body["details"]["remaining"], 0);
    assert_eq!(
        body["details"]["upgrade_url"],
        "https://vendorplan.test/vendor/subscription/plans"
    );
    assert_eq!(body["current_plan"], "free");
}

#[tokio::test]
async fn test_middleware_passes_without_shop_context() {
    let (env, shop) = setup(test_config());
    set_usage(&env.conn(), &shop.id, ResourceKind::Products, 25);

    let (status, _) = send(
        gated_app(&env),
        Request::builder()
            .method("POST")
            .uri("/vendor/products")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_middleware_reads_upload_size() {
    let (env, shop) = setup(test_config());
    set_usage(&env.conn(), &shop.id, ResourceKind::Storage, 495);

    let upload = |bytes: i64| {
        Request::builder()
            .method("POST")
            .uri(format!("/vendor/media?shop_id={}", shop.id))
            .header(header::CONTENT_LENGTH, bytes.to_string())
            .body(Body::empty())
            .unwrap()
    };

    // 4.5 MB rounds up to 5 and still fits.
    let (status, _) = send(gated_app(&env), upload(9 * BYTES_PER_MB / 2)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(gated_app(&env), upload(6 * BYTES_PER_MB)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Storage limit exceeded");
    assert_eq!(body["details"]["remaining"], 5);
}
