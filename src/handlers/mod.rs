pub mod plans;
pub mod subscription;
pub mod webhooks;

use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::db::AppState;
use crate::middleware::vendor_auth;

/// Unauthenticated endpoints.
pub fn public_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(plans::health))
        .route("/plans", get(plans::list_plans))
}

/// Vendor API, authenticated with a vendor key.
pub fn vendor_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/vendor/subscription",
            get(subscription::get_subscription).post(subscription::subscribe),
        )
        .route("/vendor/subscription/upgrade", post(subscription::upgrade))
        .route("/vendor/subscription/downgrade", post(subscription::downgrade))
        .route("/vendor/subscription/cancel", post(subscription::cancel))
        .route("/vendor/subscription/resume", post(subscription::resume))
        .route("/vendor/subscription/usage", get(subscription::get_usage))
        .route("/vendor/subscription/history", get(subscription::list_history))
        .route(
            "/vendor/subscription/billing-portal",
            get(subscription::billing_portal),
        )
        .layer(middleware::from_fn_with_state(state, vendor_auth))
}
