//! vendorplan - subscription and quota governance for multi-tenant marketplaces
//!
//! Resolves which shop a request belongs to, keeps each shop's plan in step
//! with the billing provider, meters usage against plan limits, and gates
//! actions that would exceed them.

pub mod billing;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod id;
pub mod jobs;
pub mod ledger;
pub mod middleware;
pub mod models;
pub mod notify;
pub mod pagination;
pub mod quota;
pub mod tenancy;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::billing::{BillingGateway, StripeGateway, UnconfiguredGateway};
use crate::config::Config;
use crate::db::{AppState, DbPool};
use crate::error::Result;
use crate::notify::EventNotifier;

/// Assemble shared state, picking the billing gateway from configuration.
pub fn build_state(config: Config, db: DbPool) -> Result<AppState> {
    let billing: Arc<dyn BillingGateway> = match config.stripe_secret_key.as_deref() {
        Some(key) => Arc::new(StripeGateway::new(
            key,
            Duration::from_secs(config.gateway_timeout_secs),
        )?),
        None => {
            tracing::warn!("STRIPE_SECRET_KEY not set; billing operations will fail");
            Arc::new(UnconfiguredGateway)
        }
    };
    let notifier = EventNotifier::new(config.notify_webhook_url.clone());

    Ok(AppState {
        db,
        config: Arc::new(config),
        billing,
        notifier,
    })
}

/// The full HTTP application. Every request passes through tenant resolution.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(handlers::public_router())
        .merge(handlers::webhooks::router())
        .merge(handlers::vendor_router(state.clone()))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            tenancy::resolve_tenant,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
