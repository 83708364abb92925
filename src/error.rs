use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Canonical user-facing messages, shared between handlers and tests.
pub mod msg {
    pub const SHOP_NOT_FOUND: &str = "Shop not found";
    pub const NO_SHOP_FOR_USER: &str = "No shop found for this account";
    pub const PLAN_NOT_FOUND: &str = "Plan not found";
    pub const PLAN_INACTIVE: &str = "Plan is not available";
    pub const FREE_PLAN_NOT_SUBSCRIBABLE: &str = "Cannot subscribe to the free plan";
    pub const ALREADY_SUBSCRIBED: &str = "Shop already has an active subscription";
    pub const PAYMENT_PENDING: &str = "Shop has a subscription awaiting payment";
    pub const NO_ACTIVE_SUBSCRIPTION: &str = "No active subscription found";
    pub const UPGRADE_NOT_HIGHER: &str = "New plan must be more expensive than the current plan";
    pub const DOWNGRADE_NOT_LOWER: &str = "New plan must be less expensive than the current plan";
    pub const SAME_PLAN: &str = "Shop is already on this plan";
    pub const NOT_PENDING_CANCELLATION: &str = "Subscription is not scheduled for cancellation";
    pub const NO_BILLING_CUSTOMER: &str = "No billing account exists for this shop";
    pub const GATEWAY_NOT_CONFIGURED: &str = "Billing provider is not configured";
    pub const PLAN_NOT_BILLABLE: &str = "Plan has no billing price configured";

    pub const INVALID_SIGNATURE_FORMAT: &str = "Invalid signature format";
    pub const INVALID_TIMESTAMP_IN_SIGNATURE: &str = "Invalid timestamp in signature";
    pub const INVALID_WEBHOOK_SECRET: &str = "Invalid webhook secret";

    pub const UPGRADE_MESSAGE: &str = "Upgrade your plan to increase limits";
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// The billing provider could not be reached or rejected the call.
    #[error("Billing gateway error: {0}")]
    Gateway(String),

    #[error("Quota exceeded: {}", .0.error)]
    QuotaExceeded(Box<QuotaDenial>),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Machine-readable payload returned when a quota check denies an action.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaDenial {
    pub error: String,
    pub limit_type: String,
    pub details: QuotaDetails,
    pub current_plan: Option<String>,
    pub message: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaDetails {
    pub limit: Option<i64>,
    pub current: i64,
    pub remaining: Option<i64>,
    pub upgrade_url: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            AppError::QuotaExceeded(denial) => {
                return (StatusCode::FORBIDDEN, Json(*denial)).into_response();
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "Not found", Some(msg)),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "Bad request", Some(msg)),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized", None),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "Forbidden", Some(msg)),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "Conflict", Some(msg)),
            AppError::Gateway(msg) => {
                tracing::error!("Billing gateway error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "Billing provider unavailable",
                    Some(msg),
                )
            }
            AppError::InvalidSignature => {
                (StatusCode::BAD_REQUEST, "Invalid signature", None)
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
            AppError::Pool(e) => {
                tracing::error!("Pool error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
            AppError::Json(e) => {
                tracing::error!("JSON error: {}", e);
                (StatusCode::BAD_REQUEST, "Invalid JSON", Some(e.to_string()))
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
