//! Billing provider integration.
//!
//! The provider is the source of truth for payment status. Everything the
//! ledger needs from it goes through [`BillingGateway`], so the provider can
//! be swapped (or mocked in tests) without touching reconciliation logic.

mod stripe;

pub use stripe::{
    StripeGateway, StripeInvoice, StripeSubscriptionObject, StripeWebhookEvent,
    verify_stripe_signature,
};

use async_trait::async_trait;

use crate::config::ProrationBehavior;
use crate::error::Result;
use crate::models::SubscriptionStatus;

/// Provider-side view of a subscription at the moment it was fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSnapshot {
    pub external_id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub trial_end: Option<i64>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<i64>,
    pub ended_at: Option<i64>,
    /// Monotonic freshness marker. A snapshot with a lower version than the
    /// one already applied is stale.
    pub version: i64,
}

impl SubscriptionSnapshot {
    /// When access ends, as stored on the local row.
    pub fn local_ends_at(&self) -> Option<i64> {
        if self.cancel_at_period_end {
            self.current_period_end
        } else if self.status.is_terminal() {
            self.ended_at.or(self.canceled_at)
        } else {
            None
        }
    }
}

/// Parameters for creating a remote subscription.
#[derive(Debug, Clone)]
pub struct CreateRemoteSubscription {
    pub shop_id: String,
    pub shop_name: String,
    /// Reuse this provider customer when the shop already has one.
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub price_id: String,
    pub payment_method: String,
    pub trial_days: i64,
    pub plan_slug: String,
}

/// How a price change is applied on the provider side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceChange {
    pub proration: ProrationBehavior,
    /// Keep the current billing anchor instead of restarting the cycle now.
    pub keep_billing_anchor: bool,
}

#[async_trait]
pub trait BillingGateway: Send + Sync {
    /// Provider name used in logs and the webhook replay log.
    fn provider_name(&self) -> &'static str;

    async fn create_subscription(
        &self,
        request: &CreateRemoteSubscription,
    ) -> Result<SubscriptionSnapshot>;

    /// Current state of a subscription, or None if the provider has no such id.
    async fn fetch_subscription(&self, external_id: &str) -> Result<Option<SubscriptionSnapshot>>;

    async fn change_price(&self, external_id: &str, price_id: &str, change: PriceChange)
    -> Result<()>;

    async fn cancel_now(&self, external_id: &str) -> Result<()>;

    async fn set_cancel_at_period_end(&self, external_id: &str, cancel: bool) -> Result<()>;

    /// A short-lived URL to the provider's self-service billing portal.
    async fn billing_portal_url(&self, customer_id: &str, return_url: &str) -> Result<String>;
}

/// Gateway used when no provider credentials are configured. Every call fails
/// with a gateway error so nothing local is mutated.
pub struct UnconfiguredGateway;

#[async_trait]
impl BillingGateway for UnconfiguredGateway {
    fn provider_name(&self) -> &'static str {
        "unconfigured"
    }

    async fn create_subscription(
        &self,
        _request: &CreateRemoteSubscription,
    ) -> Result<SubscriptionSnapshot> {
        Err(not_configured())
    }

    async fn fetch_subscription(&self, _external_id: &str) -> Result<Option<SubscriptionSnapshot>> {
        Err(not_configured())
    }

    async fn change_price(
        &self,
        _external_id: &str,
        _price_id: &str,
        _change: PriceChange,
    ) -> Result<()> {
        Err(not_configured())
    }

    async fn cancel_now(&self, _external_id: &str) -> Result<()> {
        Err(not_configured())
    }

    async fn set_cancel_at_period_end(&self, _external_id: &str, _cancel: bool) -> Result<()> {
        Err(not_configured())
    }

    async fn billing_portal_url(&self, _customer_id: &str, _return_url: &str) -> Result<String> {
        Err(not_configured())
    }
}

fn not_configured() -> crate::error::AppError {
    crate::error::AppError::Gateway(crate::error::msg::GATEWAY_NOT_CONFIGURED.into())
}
