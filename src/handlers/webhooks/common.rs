//! Provider-agnostic webhook processing.
//!
//! Providers only verify and parse. Everything after that is shared:
//! replay protection, reconciliation through the ledger, and domain events.
//!
//! Status policy: 400 only for requests we cannot authenticate. Once a
//! request is authenticated it is acknowledged with 200 even if processing
//! fails, so the provider does not retry into the same failure.

use axum::{
    body::Bytes,
    http::{HeaderMap, StatusCode},
};

use crate::db::AppState;
use crate::db::queries;
use crate::error::Result;
use crate::ledger::{SubscriptionLedger, SyncOutcome};
use crate::models::DomainEvent;

/// Result type for webhook operations.
pub type WebhookResult = (StatusCode, &'static str);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionChange {
    Created,
    Updated,
    Deleted,
}

/// Parsed webhook event with provider-agnostic data.
#[derive(Debug)]
pub enum WebhookEvent {
    SubscriptionChanged {
        subscription_id: String,
        change: SubscriptionChange,
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
    /// Not an event the ledger consumes.
    Ignored,
}

#[derive(Debug)]
pub struct ParsedWebhook {
    /// Provider event id, used for replay protection.
    pub event_id: String,
    pub event_type: String,
    pub event: WebhookEvent,
}

/// Trait for billing provider webhook handling.
pub trait WebhookProvider: Send + Sync {
    /// Provider name for logging and the replay log.
    fn provider_name(&self) -> &'static str;

    fn extract_signature(&self, headers: &HeaderMap) -> std::result::Result<String, WebhookResult>;

    fn verify_signature(
        &self,
        secret: &str,
        body: &Bytes,
        signature: &str,
    ) -> std::result::Result<bool, WebhookResult>;

    fn parse_event(&self, body: &Bytes) -> std::result::Result<ParsedWebhook, WebhookResult>;
}

pub async fn handle_webhook<P: WebhookProvider>(
    provider: &P,
    state: &AppState,
    secret: Option<&str>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResult {
    let signature = match provider.extract_signature(&headers) {
        Ok(s) => s,
        Err(e) => return e,
    };

    let Some(secret) = secret else {
        tracing::error!(
            "{} webhook received but no webhook secret is configured",
            provider.provider_name()
        );
        return (StatusCode::OK, "Webhook not configured");
    };

    match provider.verify_signature(secret, &body, &signature) {
        Ok(true) => {}
        Ok(false) => return (StatusCode::BAD_REQUEST, "Invalid signature"),
        Err(e) => return e,
    }

    let parsed = match provider.parse_event(&body) {
        Ok(p) => p,
        Err(e) => return e,
    };

    if matches!(parsed.event, WebhookEvent::Ignored) {
        tracing::debug!(
            "Ignoring {} event {} ({})",
            provider.provider_name(),
            parsed.event_id,
            parsed.event_type
        );
        return (StatusCode::OK, "Event ignored");
    }

    {
        let conn = match state.db.get() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(
                    "DB connection error for {} event {}: {}",
                    provider.provider_name(),
                    parsed.event_id,
                    e
                );
                return (StatusCode::OK, "Processing failed");
            }
        };
        match queries::try_record_webhook_event(
            &conn,
            provider.provider_name(),
            &parsed.event_id,
            &parsed.event_type,
        ) {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(
                    "Duplicate {} event {} ignored",
                    provider.provider_name(),
                    parsed.event_id
                );
                return (StatusCode::OK, "Already processed");
            }
            Err(e) => {
                tracing::error!("Failed to record webhook event {}: {}", parsed.event_id, e);
                return (StatusCode::OK, "Processing failed");
            }
        }
    }

    match process_event(state, parsed.event).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(
                "Failed to process {} event {} ({}): {}",
                provider.provider_name(),
                parsed.event_id,
                parsed.event_type,
                e
            );
            (StatusCode::OK, "Processing failed")
        }
    }
}

impl WebhookEvent {
    fn subscription_id(&self) -> Option<&str> {
        match self {
            Self::SubscriptionChanged { subscription_id, .. }
            | Self::PaymentSucceeded { subscription_id, .. }
            | Self::PaymentFailed { subscription_id, .. }
            | Self::TrialWillEnd { subscription_id, .. } => Some(subscription_id),
            Self::Ignored => None,
        }
    }

    /// The domain event for this webhook, addressed by local subscription id.
    fn into_domain_event(self, local_id: String) -> Option<DomainEvent> {
        let subscription_id = local_id;
        Some(match self {
            Self::SubscriptionChanged { change, .. } => match change {
                SubscriptionChange::Created => DomainEvent::SubscriptionCreated { subscription_id },
                SubscriptionChange::Updated => DomainEvent::SubscriptionUpdated { subscription_id },
                SubscriptionChange::Deleted => DomainEvent::SubscriptionCanceled { subscription_id },
            },
            Self::PaymentSucceeded {
                invoice_id,
                amount_cents,
                currency,
                ..
            } => DomainEvent::PaymentSucceeded {
                subscription_id,
                invoice_id,
                amount_cents,
                currency,
            },
            Self::PaymentFailed {
                invoice_id,
                attempt_count,
                next_payment_attempt,
                ..
            } => DomainEvent::PaymentFailed {
                subscription_id,
                invoice_id,
                attempt_count,
                next_payment_attempt,
            },
            Self::TrialWillEnd { trial_ends_at, .. } => DomainEvent::TrialWillEnd {
                subscription_id,
                trial_ends_at,
            },
            Self::Ignored => return None,
        })
    }
}

/// Reconcile the subscription, then raise the matching domain event.
async fn process_event(state: &AppState, event: WebhookEvent) -> Result<WebhookResult> {
    let Some(external_id) = event.subscription_id().map(String::from) else {
        return Ok((StatusCode::OK, "Event ignored"));
    };

    // A trial reminder carries no state change.
    if !matches!(event, WebhookEvent::TrialWillEnd { .. }) {
        let outcome = SubscriptionLedger::from_state(state).sync(&external_id).await?;
        match outcome {
            SyncOutcome::NotFound => {
                tracing::warn!("Webhook for unknown subscription {}", external_id);
                return Ok((StatusCode::OK, "Subscription not found"));
            }
            // Only a write is news for lifecycle events; a replayed or stale
            // snapshot is not.
            SyncOutcome::Stale | SyncOutcome::Unchanged(_)
                if matches!(event, WebhookEvent::SubscriptionChanged { .. }) =>
            {
                return Ok((StatusCode::OK, "Webhook processed"));
            }
            _ => {}
        }
    }

    let conn = state.db.get()?;
    let Some(local) = queries::get_subscription_by_external_id(&conn, &external_id)? else {
        tracing::warn!("No local subscription for {}", external_id);
        return Ok((StatusCode::OK, "Subscription not found"));
    };
    if let Some(domain_event) = event.into_domain_event(local.id) {
        state.notifier.notify(&conn, &local.shop_id, &domain_event)?;
    }
    Ok((StatusCode::OK, "Webhook processed"))
}
