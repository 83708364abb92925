use serde::{Deserialize, Serialize};

use super::{ResourceKind, ThresholdLevel};

/// Something that happened to a shop's subscription or usage that outside
/// collaborators (mail, logs, analytics) may want to react to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    SubscriptionCreated {
        subscription_id: String,
    },
    SubscriptionUpdated {
        subscription_id: String,
    },
    SubscriptionCanceled {
        subscription_id: String,
    },
    PaymentSucceeded {
        subscription_id: String,
        invoice_id: String,
        amount_cents: i64,
        currency: String,
    },
    PaymentFailed {
        subscription_id: String,
        invoice_id: String,
        attempt_count: i64,
        next_payment_attempt: Option<i64>,
    },
    TrialWillEnd {
        subscription_id: String,
        trial_ends_at: Option<i64>,
    },
    UsageThreshold {
        resource: ResourceKind,
        percent: f64,
        level: ThresholdLevel,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SubscriptionCreated { .. } => "subscription_created",
            Self::SubscriptionUpdated { .. } => "subscription_updated",
            Self::SubscriptionCanceled { .. } => "subscription_canceled",
            Self::PaymentSucceeded { .. } => "payment_succeeded",
            Self::PaymentFailed { .. } => "payment_failed",
            Self::TrialWillEnd { .. } => "trial_will_end",
            Self::UsageThreshold { .. } => "usage_threshold",
        }
    }
}

/// A persisted domain event.
#[derive(Debug, Clone, Serialize)]
pub struct EventLogEntry {
    pub id: String,
    pub shop_id: String,
    pub event: String,
    pub payload: serde_json::Value,
    pub created_at: i64,
}
