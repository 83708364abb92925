use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use super::Plan;

/// Subscription lifecycle as reported by the billing provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Unpaid,
    Canceled,
    IncompleteExpired,
}

impl SubscriptionStatus {
    /// Active or trialing. At most one valid subscription exists per shop.
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::IncompleteExpired)
    }

    /// Statuses for which the shop falls back to free-tier limits.
    pub fn revokes_plan(&self) -> bool {
        matches!(self, Self::Canceled | Self::IncompleteExpired | Self::Unpaid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub shop_id: String,
    pub tenant_id: Option<String>,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub trial_ends_at: Option<i64>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    /// Set when the customer asked to cancel at the end of the period.
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<i64>,
    pub ends_at: Option<i64>,
    pub external_subscription_id: String,
    pub external_customer_id: Option<String>,
    pub external_price_id: Option<String>,
    /// Version of the last provider snapshot applied to this row.
    pub remote_version: i64,
    pub metadata: Option<serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Subscription {
    /// Whether the subscription grants its plan at `now`.
    ///
    /// A deferred cancellation keeps the stored status valid until the
    /// provider reports otherwise; the period end is observed here rather
    /// than transitioned by a background job.
    pub fn is_valid_at(&self, now: i64) -> bool {
        if !self.status.is_valid() {
            return false;
        }
        match self.ends_at {
            Some(ends_at) if self.cancel_at_period_end => now < ends_at,
            _ => true,
        }
    }

    /// Cancellation requested but the paid period has not run out yet.
    pub fn on_grace_period(&self, now: i64) -> bool {
        self.cancel_at_period_end && self.ends_at.is_some_and(|e| now < e)
    }

    pub fn on_trial(&self, now: i64) -> bool {
        self.status == SubscriptionStatus::Trialing && self.trial_ends_at.is_some_and(|t| now < t)
    }
}

/// Subscription joined with its plan, as returned by management endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionWithPlan {
    #[serde(flatten)]
    pub subscription: Subscription,
    pub plan: Plan,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub plan_id: String,
    /// Provider-side payment method token collected by the frontend.
    pub payment_method: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub plan_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub immediately: bool,
}
