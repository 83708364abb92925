use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use super::{ResourceKind, Tier};
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub price_cents: i64,
    pub currency: String,
    /// None for plans that are never billed.
    pub billing_cycle: Option<BillingCycle>,
    pub trial_days: i64,
    /// Maximum number of products. None = unlimited.
    pub products_limit: Option<i64>,
    /// Maximum orders per monthly period. None = unlimited.
    pub orders_per_month: Option<i64>,
    /// Maximum media storage in MB. None = unlimited.
    pub storage_limit_mb: Option<i64>,
    /// Whether subscribers get a tenant subdomain.
    pub subdomain_enabled: bool,
    pub features: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_product_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_price_id: Option<String>,
    pub is_active: bool,
    pub sort_order: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Plan {
    pub fn is_free(&self) -> bool {
        self.price_cents == 0
    }

    pub fn limit_for(&self, resource: ResourceKind) -> Option<i64> {
        match resource {
            ResourceKind::Products => self.products_limit,
            ResourceKind::Orders => self.orders_per_month,
            ResourceKind::Storage => self.storage_limit_mb,
        }
    }

    /// Tenant tier granted by this plan. Custom slugs map to `Starter`.
    pub fn tier(&self) -> Tier {
        self.slug.parse().unwrap_or(if self.is_free() {
            Tier::Free
        } else {
            Tier::Starter
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePlan {
    pub slug: String,
    pub name: String,
    pub price_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub billing_cycle: Option<BillingCycle>,
    #[serde(default)]
    pub trial_days: i64,
    #[serde(default)]
    pub products_limit: Option<i64>,
    #[serde(default)]
    pub orders_per_month: Option<i64>,
    #[serde(default)]
    pub storage_limit_mb: Option<i64>,
    #[serde(default)]
    pub subdomain_enabled: bool,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub external_product_id: Option<String>,
    #[serde(default)]
    pub external_price_id: Option<String>,
    #[serde(default)]
    pub sort_order: i64,
}

fn default_currency() -> String {
    "usd".to_string()
}

impl CreatePlan {
    pub fn validate(&self) -> Result<()> {
        if self.slug.trim().is_empty() {
            return Err(AppError::BadRequest("slug cannot be empty".into()));
        }
        if self.price_cents < 0 {
            return Err(AppError::BadRequest("price_cents cannot be negative".into()));
        }
        if self.trial_days < 0 {
            return Err(AppError::BadRequest("trial_days cannot be negative".into()));
        }
        for (name, limit) in [
            ("products_limit", self.products_limit),
            ("orders_per_month", self.orders_per_month),
            ("storage_limit_mb", self.storage_limit_mb),
        ] {
            if limit.is_some_and(|l| l < 0) {
                return Err(AppError::BadRequest(format!("{} cannot be negative", name)));
            }
        }
        if self.price_cents > 0 && self.billing_cycle.is_none() {
            return Err(AppError::BadRequest(
                "paid plans require a billing_cycle".into(),
            ));
        }
        Ok(())
    }
}

/// The stock plan catalogue installed by `seed-plans`.
pub fn default_plans() -> Vec<CreatePlan> {
    let plan = |slug: &str,
                name: &str,
                price_cents: i64,
                trial_days: i64,
                limits: (Option<i64>, Option<i64>, Option<i64>),
                features: &[&str]| CreatePlan {
        slug: slug.to_string(),
        name: name.to_string(),
        price_cents,
        currency: default_currency(),
        billing_cycle: (price_cents > 0).then_some(BillingCycle::Monthly),
        trial_days,
        products_limit: limits.0,
        orders_per_month: limits.1,
        storage_limit_mb: limits.2,
        subdomain_enabled: price_cents > 0,
        features: features.iter().map(|f| f.to_string()).collect(),
        external_product_id: None,
        external_price_id: None,
        sort_order: 0,
    };

    let mut plans = vec![
        plan("free", "Free", 0, 0, (Some(25), Some(100), Some(500)), &[]),
        plan(
            "starter",
            "Starter",
            2900,
            14,
            (Some(100), Some(500), Some(5120)),
            &["premium_subdomain"],
        ),
        plan(
            "growth",
            "Growth",
            9900,
            14,
            (Some(1000), None, Some(51200)),
            &["premium_subdomain", "analytics", "priority_support"],
        ),
        plan(
            "enterprise",
            "Enterprise",
            29900,
            30,
            (None, None, None),
            &["premium_subdomain", "analytics", "priority_support", "custom_domain"],
        ),
    ];
    for (i, p) in plans.iter_mut().enumerate() {
        p.sort_order = i as i64;
    }
    plans
}
