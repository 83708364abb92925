//! Stripe webhook endpoint: authentication, replay protection, reconciliation.

#[path = "../common/mod.rs"]
mod common;
use common::*;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};

use vendorplan::billing::verify_stripe_signature;

const WEBHOOK_URI: &str = "/webhook/stripe";

fn signed_request(payload: &[u8], secret: &str, timestamp: i64) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(WEBHOOK_URI)
        .header("content-type", "application/json")
        .header(
            "stripe-signature",
            stripe_signature_header(payload, secret, timestamp),
        )
        .body(Body::from(payload.to_vec()))
        .unwrap()
}

fn subscription_event(event_id: &str, event_type: &str, external_id: &str) -> Value {
    json!({
        "id": event_id,
        "type": event_type,
        "created": queries::now(),
        "data": {
            "object": {
                "id": external_id,
                "customer": "cus_mock_1",
                "status": "active",
                "items": { "data": [{ "id": "si_1", "price": { "id": "price_starter" } }] }
            }
        }
    })
}

fn invoice_event(event_id: &str, event_type: &str, external_id: &str) -> Value {
    json!({
        "id": event_id,
        "type": event_type,
        "created": queries::now(),
        "data": {
            "object": {
                "id": "in_test_1",
                "subscription": external_id,
                "amount_paid": 0,
                "amount_due": 2900,
                "currency": "usd",
                "attempt_count": 2,
                "next_payment_attempt": queries::now() + ONE_DAY
            }
        }
    })
}

async fn deliver(env: &TestEnv, event: &Value) -> (StatusCode, Value) {
    let payload = serde_json::to_vec(event).unwrap();
    send(
        env.app(),
        signed_request(&payload, TEST_WEBHOOK_SECRET, queries::now()),
    )
    .await
}

async fn subscribed_shop() -> (TestEnv, TestPlans, Shop, Subscription) {
    let env = TestEnv::new();
    let (plans, shop) = {
        let conn = env.conn();
        (seed_plans(&conn), create_test_shop(&conn, "Webhook Shop"))
    };
    let sub = subscribe(&env, &shop.id, &plans.starter).await.subscription;
    (env, plans, shop, sub)
}

fn count(events: &[String], name: &str) -> usize {
    events.iter().filter(|e| e.as_str() == name).count()
}

#[tokio::test]
async fn test_subscription_deleted_reverts_shop() {
    let (env, plans, shop, sub) = subscribed_shop().await;
    let ext = sub.external_subscription_id.clone();
    env.gateway.update(&ext, |s| {
        s.status = SubscriptionStatus::Canceled;
        s.ended_at = Some(queries::now());
    });

    let (status, body) = deliver(
        &env,
        &subscription_event("evt_deleted_1", "customer.subscription.deleted", &ext),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Webhook processed");

    let row = queries::get_subscription_by_id(&env.conn(), &sub.id)
        .unwrap()
        .unwrap();
    assert_eq!(row.status, SubscriptionStatus::Canceled);
    let shop = env.shop(&shop.id);
    assert_eq!(shop.subscription_status, Some(SubscriptionStatus::Canceled));
    assert_eq!(shop.current_plan_id.as_deref(), Some(plans.free.id.as_str()));
    assert_eq!(shop.products_limit, Some(25));
    assert_eq!(count(&env.events(&shop.id), "subscription_canceled"), 1);
}

#[tokio::test]
async fn test_deletion_after_local_cancel_is_not_announced_twice() {
    let (env, _, shop, sub) = subscribed_shop().await;
    env.ledger().cancel(&shop.id, true).await.unwrap();
    assert_eq!(count(&env.events(&shop.id), "subscription_canceled"), 1);

    let (status, body) = deliver(
        &env,
        &subscription_event(
            "evt_deleted_2",
            "customer.subscription.deleted",
            &sub.external_subscription_id,
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Webhook processed");
    assert_eq!(count(&env.events(&shop.id), "subscription_canceled"), 1);
}

#[tokio::test]
async fn test_replayed_event_is_processed_once() {
    let (env, _, shop, sub) = subscribed_shop().await;
    let ext = sub.external_subscription_id.clone();
    env.gateway.update(&ext, |s| s.status = SubscriptionStatus::Active);
    let event = subscription_event("evt_dup_1", "customer.subscription.updated", &ext);

    let (status, body) = deliver(&env, &event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Webhook processed");

    let (status, body) = deliver(&env, &event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Already processed");

    assert_eq!(count(&env.events(&shop.id), "subscription_updated"), 1);
}

#[tokio::test]
async fn test_unchanged_lifecycle_event_raises_nothing() {
    let (env, _, shop, sub) = subscribed_shop().await;

    let (status, body) = deliver(
        &env,
        &subscription_event(
            "evt_noop_1",
            "customer.subscription.updated",
            &sub.external_subscription_id,
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Webhook processed");
    assert_eq!(count(&env.events(&shop.id), "subscription_updated"), 0);
}

#[tokio::test]
async fn test_payment_failed_is_recorded() {
    let (env, _, shop, sub) = subscribed_shop().await;
    let ext = sub.external_subscription_id.clone();
    env.gateway.update(&ext, |s| s.status = SubscriptionStatus::PastDue);

    let (status, body) = deliver(
        &env,
        &invoice_event("evt_fail_1", "invoice.payment_failed", &ext),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Webhook processed");
    assert_eq!(
        env.shop(&shop.id).subscription_status,
        Some(SubscriptionStatus::PastDue)
    );

    let entries = queries::list_events_for_shop(&env.conn(), &shop.id).unwrap();
    let failed = entries
        .iter()
        .find(|e| e.event == "payment_failed")
        .expect("payment_failed event");
    assert_eq!(failed.payload["invoice_id"], "in_test_1");
    assert_eq!(failed.payload["attempt_count"], 2);
    assert_eq!(failed.payload["subscription_id"], sub.id.as_str());
}

#[tokio::test]
async fn test_trial_will_end_is_recorded() {
    let (env, _, shop, sub) = subscribed_shop().await;

    let (status, _) = deliver(
        &env,
        &subscription_event(
            "evt_trial_1",
            "customer.subscription.trial_will_end",
            &sub.external_subscription_id,
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(count(&env.events(&shop.id), "trial_will_end"), 1);
}

#[tokio::test]
async fn test_unknown_subscription_is_acknowledged() {
    let (env, _, _, _) = subscribed_shop().await;

    let (status, body) = deliver(
        &env,
        &subscription_event("evt_unknown_1", "customer.subscription.updated", "sub_nope"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Subscription not found");
}

#[tokio::test]
async fn test_unhandled_event_type_is_ignored() {
    let (env, _, _, _) = subscribed_shop().await;

    let (status, body) = deliver(
        &env,
        &json!({ "id": "evt_x", "type": "charge.refunded", "data": { "object": {} } }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Event ignored");
}

#[tokio::test]
async fn test_gateway_outage_is_acknowledged() {
    let (env, _, _, sub) = subscribed_shop().await;
    env.gateway.set_failing(true);

    let (status, body) = deliver(
        &env,
        &subscription_event(
            "evt_outage_1",
            "customer.subscription.updated",
            &sub.external_subscription_id,
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Processing failed");
}

#[tokio::test]
async fn test_replay_log_failure_is_acknowledged() {
    let (env, _, shop, sub) = subscribed_shop().await;
    env.conn().execute("DROP TABLE webhook_events", []).unwrap();

    let (status, body) = deliver(
        &env,
        &subscription_event(
            "evt_no_log_1",
            "customer.subscription.deleted",
            &sub.external_subscription_id,
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Processing failed");
    // Not processed without a replay record.
    assert!(env.shop(&shop.id).has_valid_subscription());
}

#[tokio::test]
async fn test_invalid_json_after_valid_signature() {
    let env = TestEnv::new();

    let (status, body) = send(
        env.app(),
        signed_request(b"{not json", TEST_WEBHOOK_SECRET, queries::now()),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Invalid JSON");
}

#[tokio::test]
async fn test_signature_failures_are_rejected() {
    let (env, _, shop, sub) = subscribed_shop().await;
    let event = subscription_event(
        "evt_forged_1",
        "customer.subscription.deleted",
        &sub.external_subscription_id,
    );
    let payload = serde_json::to_vec(&event).unwrap();

    let (status, body) = send(
        env.app(),
        signed_request(&payload, "whsec_wrong", queries::now()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Invalid signature");

    // Outside the replay window.
    let (status, _) = send(
        env.app(),
        signed_request(&payload, TEST_WEBHOOK_SECRET, queries::now() - 3600),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        env.app(),
        Request::builder()
            .method("POST")
            .uri(WEBHOOK_URI)
            .body(Body::from(payload.clone()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Missing stripe-signature header");

    let (status, _) = send(
        env.app(),
        Request::builder()
            .method("POST")
            .uri(WEBHOOK_URI)
            .header("stripe-signature", "garbage")
            .body(Body::from(payload))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Nothing was applied.
    assert!(env.shop(&shop.id).has_valid_subscription());
}

#[tokio::test]
async fn test_unconfigured_secret_acknowledges_without_processing() {
    let env = TestEnv::with_config(Config {
        stripe_webhook_secret: None,
        ..test_config()
    });
    let payload = br#"{"id":"evt_1","type":"customer.subscription.deleted","data":{"object":{}}}"#;

    let (status, body) = send(
        env.app(),
        signed_request(payload, TEST_WEBHOOK_SECRET, queries::now()),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Webhook not configured");
}

#[test]
fn test_verify_stripe_signature() {
    let payload = br#"{"id":"evt_1"}"#;
    let now = queries::now();

    let header = stripe_signature_header(payload, TEST_WEBHOOK_SECRET, now);
    assert!(verify_stripe_signature(TEST_WEBHOOK_SECRET, payload, &header).unwrap());
    assert!(!verify_stripe_signature("whsec_other", payload, &header).unwrap());
    assert!(!verify_stripe_signature(TEST_WEBHOOK_SECRET, b"{}", &header).unwrap());

    let stale = stripe_signature_header(payload, TEST_WEBHOOK_SECRET, now - 3600);
    assert!(!verify_stripe_signature(TEST_WEBHOOK_SECRET, payload, &stale).unwrap());

    let future = stripe_signature_header(payload, TEST_WEBHOOK_SECRET, now + 3600);
    assert!(!verify_stripe_signature(TEST_WEBHOOK_SECRET, payload, &future).unwrap());

    assert!(verify_stripe_signature(TEST_WEBHOOK_SECRET, payload, "v1=abc").is_err());
    assert!(verify_stripe_signature(TEST_WEBHOOK_SECRET, payload, "t=soon,v1=abc").is_err());
}
