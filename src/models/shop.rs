use serde::{Deserialize, Serialize};

use super::{ResourceKind, SubscriptionStatus, percent_used, remaining};

/// Free-tier limits applied to shops without a paid subscription.
pub const FREE_PRODUCTS_LIMIT: i64 = 25;
pub const FREE_ORDERS_PER_MONTH: i64 = 100;
pub const FREE_STORAGE_LIMIT_MB: i64 = 500;

/// A vendor shop and its cached usage and plan limits.
///
/// The counters and limits here are caches kept so that quota checks are a
/// single-row read. They are written only by the usage meter and the
/// subscription ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shop {
    pub id: String,
    pub name: String,
    pub current_plan_id: Option<String>,
    pub subscription_status: Option<SubscriptionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_customer_id: Option<String>,
    pub has_premium_subdomain: bool,
    pub products_limit: Option<i64>,
    pub orders_per_month_limit: Option<i64>,
    pub storage_limit_mb: Option<i64>,
    pub products_count: i64,
    pub orders_this_month: i64,
    pub storage_used_mb: i64,
    pub last_usage_reset_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Shop {
    pub fn limit_for(&self, resource: ResourceKind) -> Option<i64> {
        match resource {
            ResourceKind::Products => self.products_limit,
            ResourceKind::Orders => self.orders_per_month_limit,
            ResourceKind::Storage => self.storage_limit_mb,
        }
    }

    pub fn usage_for(&self, resource: ResourceKind) -> i64 {
        match resource {
            ResourceKind::Products => self.products_count,
            ResourceKind::Orders => self.orders_this_month,
            ResourceKind::Storage => self.storage_used_mb,
        }
    }

    pub fn remaining(&self, resource: ResourceKind) -> Option<i64> {
        remaining(self.usage_for(resource), self.limit_for(resource))
    }

    /// Percentage used; 0 when the resource is unlimited.
    pub fn percent_used(&self, resource: ResourceKind) -> f64 {
        self.limit_for(resource)
            .map(|limit| percent_used(self.usage_for(resource), limit))
            .unwrap_or(0.0)
    }

    /// Whether `additional` more units fit under the limit.
    pub fn can_accommodate(&self, resource: ResourceKind, additional: i64) -> bool {
        match self.limit_for(resource) {
            None => true,
            Some(limit) => self.usage_for(resource) + additional <= limit,
        }
    }

    pub fn has_valid_subscription(&self) -> bool {
        self.subscription_status.is_some_and(|s| s.is_valid())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateShop {
    pub name: String,
}
