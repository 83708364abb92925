use axum::{
    extract::{Extension, State},
    http::StatusCode,
};
use serde::Serialize;

use crate::config::DowngradeTiming;
use crate::db::{AppState, queries};
use crate::error::Result;
use crate::extractors::{Json, Query};
use crate::ledger::{DowngradeResult, SubscriptionLedger};
use crate::middleware::VendorContext;
use crate::models::{
    CancelRequest, ChangePlanRequest, SubscribeRequest, Subscription, SubscriptionWithPlan,
    UsageReport,
};
use crate::pagination::{Paginated, PaginationQuery};
use crate::usage;

#[derive(Debug, Serialize)]
pub struct SubscriptionOverview {
    pub subscription: Option<SubscriptionWithPlan>,
    pub on_trial: bool,
    pub on_grace_period: bool,
    pub usage: UsageReport,
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(ctx): Extension<VendorContext>,
) -> Result<Json<SubscriptionOverview>> {
    let subscription = SubscriptionLedger::from_state(&state).current(ctx.shop_id())?;
    let now = queries::now();
    let conn = state.db.get()?;
    let usage = usage::usage_report(&conn, ctx.shop_id(), now)?;

    let (on_trial, on_grace_period) = subscription
        .as_ref()
        .map(|s| {
            (
                s.subscription.on_trial(now),
                s.subscription.on_grace_period(now),
            )
        })
        .unwrap_or((false, false));

    Ok(Json(SubscriptionOverview {
        subscription,
        on_trial,
        on_grace_period,
        usage,
    }))
}

pub async fn subscribe(
    State(state): State<AppState>,
    Extension(ctx): Extension<VendorContext>,
    Json(input): Json<SubscribeRequest>,
) -> Result<(StatusCode, Json<SubscriptionWithPlan>)> {
    let created = SubscriptionLedger::from_state(&state)
        .create(
            ctx.shop_id(),
            &input.plan_id,
            &input.payment_method,
            Some(&ctx.user.email),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn upgrade(
    State(state): State<AppState>,
    Extension(ctx): Extension<VendorContext>,
    Json(input): Json<ChangePlanRequest>,
) -> Result<Json<SubscriptionWithPlan>> {
    let updated = SubscriptionLedger::from_state(&state)
        .upgrade(ctx.shop_id(), &input.plan_id)
        .await?;
    Ok(Json(updated))
}

#[derive(Debug, Serialize)]
pub struct DowngradeResponse {
    #[serde(flatten)]
    pub result: DowngradeResult,
    pub note: &'static str,
}

pub async fn downgrade(
    State(state): State<AppState>,
    Extension(ctx): Extension<VendorContext>,
    Json(input): Json<ChangePlanRequest>,
) -> Result<Json<DowngradeResponse>> {
    let result = SubscriptionLedger::from_state(&state)
        .downgrade(ctx.shop_id(), &input.plan_id)
        .await?;
    let note = match result.timing {
        DowngradeTiming::EndOfPeriod => {
            "The new price applies from the end of the current billing period"
        }
        DowngradeTiming::Immediate => "The new price applies immediately, prorated",
    };
    Ok(Json(DowngradeResponse { result, note }))
}

pub async fn cancel(
    State(state): State<AppState>,
    Extension(ctx): Extension<VendorContext>,
    Json(input): Json<CancelRequest>,
) -> Result<Json<Subscription>> {
    let canceled = SubscriptionLedger::from_state(&state)
        .cancel(ctx.shop_id(), input.immediately)
        .await?;
    Ok(Json(canceled))
}

pub async fn resume(
    State(state): State<AppState>,
    Extension(ctx): Extension<VendorContext>,
) -> Result<Json<Subscription>> {
    let resumed = SubscriptionLedger::from_state(&state)
        .resume(ctx.shop_id())
        .await?;
    Ok(Json(resumed))
}

pub async fn get_usage(
    State(state): State<AppState>,
    Extension(ctx): Extension<VendorContext>,
) -> Result<Json<UsageReport>> {
    let conn = state.db.get()?;
    Ok(Json(usage::usage_report(&conn, ctx.shop_id(), queries::now())?))
}

pub async fn list_history(
    State(state): State<AppState>,
    Extension(ctx): Extension<VendorContext>,
    Query(pagination): Query<PaginationQuery>,
) -> Result<Json<Paginated<Subscription>>> {
    let page = SubscriptionLedger::from_state(&state).history(ctx.shop_id(), &pagination)?;
    Ok(Json(page))
}

#[derive(Debug, Serialize)]
pub struct BillingPortalResponse {
    pub url: String,
}

pub async fn billing_portal(
    State(state): State<AppState>,
    Extension(ctx): Extension<VendorContext>,
) -> Result<Json<BillingPortalResponse>> {
    let url = SubscriptionLedger::from_state(&state)
        .billing_portal(ctx.shop_id())
        .await?;
    Ok(Json(BillingPortalResponse { url }))
}
