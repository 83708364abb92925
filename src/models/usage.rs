use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

/// A metered resource on a shop.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceKind {
    Products,
    /// Orders in the current monthly period.
    Orders,
    /// Media storage in megabytes.
    Storage,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Products,
        ResourceKind::Orders,
        ResourceKind::Storage,
    ];

    /// Message shown when a quota check denies this resource.
    pub fn denial_message(&self) -> &'static str {
        match self {
            ResourceKind::Products => "Product limit reached",
            ResourceKind::Orders => "Monthly order limit reached",
            ResourceKind::Storage => "Storage limit exceeded",
        }
    }
}

/// Percentage of `limit` consumed by `current`, capped at 100.
///
/// A non-positive limit yields 0 so that "no allowance configured" never
/// reads as "over quota".
pub fn percent_used(current: i64, limit: i64) -> f64 {
    if limit <= 0 {
        return 0.0;
    }
    (current as f64 / limit as f64 * 100.0).min(100.0)
}

/// Units left before `limit`; `None` when unlimited.
pub fn remaining(current: i64, limit: Option<i64>) -> Option<i64> {
    limit.map(|l| (l - current).max(0))
}

/// Coarse band used in usage reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UsageStatus {
    Good,
    Moderate,
    Warning,
    Critical,
    Exceeded,
    Unlimited,
}

impl UsageStatus {
    pub fn from_percent(percent: f64) -> Self {
        match percent {
            p if p >= 100.0 => UsageStatus::Exceeded,
            p if p >= 90.0 => UsageStatus::Critical,
            p if p >= 75.0 => UsageStatus::Warning,
            p if p >= 50.0 => UsageStatus::Moderate,
            _ => UsageStatus::Good,
        }
    }
}

/// Outcome of a threshold evaluation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ThresholdLevel {
    Below,
    Warning,
    Exceeded,
}

impl ThresholdLevel {
    pub fn evaluate(percent: f64, threshold: f64) -> Self {
        if percent >= 100.0 {
            ThresholdLevel::Exceeded
        } else if percent >= threshold {
            ThresholdLevel::Warning
        } else {
            ThresholdLevel::Below
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub current: i64,
    pub limit: Option<i64>,
    pub percentage: f64,
    pub remaining: Option<i64>,
    pub status: UsageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub shop_id: String,
    pub plan: Option<String>,
    pub products: ResourceUsage,
    pub orders: ResourceUsage,
    pub storage: ResourceUsage,
    pub last_reset_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalUsageStats {
    pub total_shops: i64,
    pub valid_subscriptions: i64,
    pub shops_by_plan: Vec<(String, i64)>,
    pub total_storage_mb: i64,
    pub orders_this_month: i64,
}
