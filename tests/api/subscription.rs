//! Vendor subscription endpoints.

#[path = "../common/mod.rs"]
mod common;
use common::*;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};

struct Vendor {
    env: TestEnv,
    plans: TestPlans,
    shop: Shop,
    key: String,
}

fn vendor() -> Vendor {
    let env = TestEnv::new();
    let (plans, shop, key) = {
        let conn = env.conn();
        let plans = seed_plans(&conn);
        let (shop, _, key) = create_test_vendor(&conn, "Api Shop");
        (plans, shop, key)
    };
    Vendor {
        env,
        plans,
        shop,
        key,
    }
}

impl Vendor {
    async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", self.key));
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        send(self.env.app(), request).await
    }

    async fn subscribe_to(&self, plan: &Plan) -> (StatusCode, Value) {
        self.call(
            Method::POST,
            "/vendor/subscription",
            Some(json!({ "plan_id": plan.id, "payment_method": TEST_PAYMENT_METHOD })),
        )
        .await
    }
}

#[tokio::test]
async fn test_vendor_routes_require_api_key() {
    let v = vendor();

    let (status, _) = send(
        v.env.app(),
        Request::builder()
            .uri("/vendor/subscription")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        v.env.app(),
        Request::builder()
            .uri("/vendor/subscription/usage")
            .header("authorization", "Bearer vp_key_wrong")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthorized");
}

#[tokio::test]
async fn test_revoked_key_is_rejected() {
    let env = TestEnv::new();
    let key = {
        let conn = env.conn();
        seed_plans(&conn);
        let (_, user, _) = create_test_vendor(&conn, "Revoked Shop");
        let (record, key) = queries::create_api_key(&conn, &user.id).unwrap();
        assert!(queries::revoke_api_key(&conn, &record.id).unwrap());
        key
    };

    let (status, _) = send(
        env.app(),
        Request::builder()
            .uri("/vendor/subscription")
            .header("authorization", format!("Bearer {}", key))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_overview_for_free_shop() {
    let v = vendor();

    let (status, body) = v.call(Method::GET, "/vendor/subscription", None).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["subscription"].is_null());
    assert_eq!(body["on_trial"], false);
    assert_eq!(body["usage"]["plan"], "free");
    assert_eq!(body["usage"]["products"]["limit"], 25);
}

#[tokio::test]
async fn test_subscribe_and_view() {
    let v = vendor();

    let (status, body) = v.subscribe_to(&v.plans.starter).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["plan"]["slug"], "starter");
    assert_eq!(body["status"], "trialing");
    assert_eq!(body["shop_id"], v.shop.id.as_str());
    assert_eq!(v.env.gateway.calls(), vec!["create:price_starter".to_string()]);

    let (status, body) = v.call(Method::GET, "/vendor/subscription", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subscription"]["plan"]["slug"], "starter");
    assert_eq!(body["on_trial"], true);
    assert_eq!(body["on_grace_period"], false);
    assert_eq!(body["usage"]["products"]["limit"], 100);

    let (status, body) = v.subscribe_to(&v.plans.growth).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"], "Shop already has an active subscription");
}

#[tokio::test]
async fn test_subscribe_validation() {
    let v = vendor();

    let (status, body) = v.subscribe_to(&v.plans.free).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"], "Cannot subscribe to the free plan");

    let (status, _) = v
        .call(Method::POST, "/vendor/subscription", Some(json!({ "plan_id": v.plans.starter.id })))
        .await;
    assert!(status.is_client_error());

    let (status, _) = v
        .call(
            Method::POST,
            "/vendor/subscription",
            Some(json!({ "plan_id": "vp_plan_missing", "payment_method": TEST_PAYMENT_METHOD })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert!(v.env.gateway.calls().is_empty());
}

#[tokio::test]
async fn test_gateway_failure_is_bad_gateway() {
    let v = vendor();
    v.env.gateway.set_failing(true);

    let (status, body) = v.subscribe_to(&v.plans.starter).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "Billing provider unavailable");
    assert_eq!(
        queries::count_valid_subscriptions_for_shop(&v.env.conn(), &v.shop.id).unwrap(),
        0
    );
}

#[tokio::test]
async fn test_upgrade_and_downgrade() {
    let v = vendor();
    v.subscribe_to(&v.plans.starter).await;

    let (status, body) = v
        .call(
            Method::POST,
            "/vendor/subscription/upgrade",
            Some(json!({ "plan_id": v.plans.growth.id })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plan"]["slug"], "growth");

    let (status, body) = v
        .call(
            Method::POST,
            "/vendor/subscription/downgrade",
            Some(json!({ "plan_id": v.plans.starter.id })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["timing"], "end_of_period");
    assert_eq!(
        body["note"],
        "The new price applies from the end of the current billing period"
    );
    assert_eq!(body["subscription"]["plan"]["slug"], "starter");
    assert_eq!(
        body["effective_date"],
        body["subscription"]["current_period_end"]
    );

    let (status, body) = v
        .call(
            Method::POST,
            "/vendor/subscription/upgrade",
            Some(json!({ "plan_id": v.plans.free.id })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["details"],
        "New plan must be more expensive than the current plan"
    );
}

#[tokio::test]
async fn test_cancel_and_resume() {
    let v = vendor();
    v.subscribe_to(&v.plans.starter).await;

    let (status, body) = v
        .call(
            Method::POST,
            "/vendor/subscription/cancel",
            Some(json!({ "immediately": false })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancel_at_period_end"], true);

    let (_, overview) = v.call(Method::GET, "/vendor/subscription", None).await;
    assert_eq!(overview["on_grace_period"], true);

    let (status, body) = v.call(Method::POST, "/vendor/subscription/resume", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancel_at_period_end"], false);

    let (status, body) = v.call(Method::POST, "/vendor/subscription/resume", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"], "Subscription is not scheduled for cancellation");

    let (status, body) = v
        .call(
            Method::POST,
            "/vendor/subscription/cancel",
            Some(json!({ "immediately": true })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "canceled");
    assert_eq!(
        v.env.shop(&v.shop.id).current_plan_id.as_deref(),
        Some(v.plans.free.id.as_str())
    );
}

#[tokio::test]
async fn test_cancel_without_subscription() {
    let v = vendor();

    let (status, body) = v
        .call(Method::POST, "/vendor/subscription/cancel", Some(json!({})))
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["details"], "No active subscription found");
}

#[tokio::test]
async fn test_usage_endpoint() {
    let v = vendor();
    set_usage(&v.env.conn(), &v.shop.id, ResourceKind::Products, 20);

    let (status, body) = v.call(Method::GET, "/vendor/subscription/usage", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["shop_id"], v.shop.id.as_str());
    assert_eq!(body["products"]["current"], 20);
    assert_eq!(body["products"]["remaining"], 5);
    assert_eq!(body["products"]["status"], "warning");
    assert!(body["orders"]["resets_at"].is_i64());
    assert!(body["products"].get("resets_at").is_none());
}

#[tokio::test]
async fn test_history_is_paginated() {
    let v = vendor();
    v.subscribe_to(&v.plans.starter).await;
    v.call(
        Method::POST,
        "/vendor/subscription/cancel",
        Some(json!({ "immediately": true })),
    )
    .await;
    v.subscribe_to(&v.plans.growth).await;

    let (status, body) = v
        .call(Method::GET, "/vendor/subscription/history?limit=1", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["limit"], 1);
    assert_eq!(body["items"].as_array().unwrap().len(), 1);

    let (status, _) = v
        .call(Method::GET, "/vendor/subscription/history?limit=abc", None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_billing_portal() {
    let v = vendor();

    let (status, body) = v
        .call(Method::GET, "/vendor/subscription/billing-portal", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["details"], "No billing account exists for this shop");

    v.subscribe_to(&v.plans.starter).await;
    let (status, body) = v
        .call(Method::GET, "/vendor/subscription/billing-portal", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["url"],
        "https://billing.test/portal/cus_mock_1?return=https://vendorplan.test/vendor/subscription"
    );
}

#[tokio::test]
async fn test_public_routes() {
    let v = vendor();

    let (status, body) = send(
        v.env.app(),
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(
        v.env.app(),
        Request::builder().uri("/plans").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let slugs: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["slug"].as_str().unwrap())
        .collect();
    assert_eq!(slugs, vec!["free", "starter", "growth", "enterprise"]);
}
