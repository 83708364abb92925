use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};

use crate::billing::{StripeInvoice, StripeSubscriptionObject, StripeWebhookEvent, verify_stripe_signature};
use crate::db::AppState;

use super::common::{
    ParsedWebhook, SubscriptionChange, WebhookEvent, WebhookProvider, WebhookResult,
    handle_webhook,
};

pub struct StripeWebhookProvider;

fn parse_object<T: serde::de::DeserializeOwned>(
    event: &StripeWebhookEvent,
) -> Result<T, WebhookResult> {
    serde_json::from_value(event.data.object.clone()).map_err(|e| {
        tracing::error!("Failed to parse Stripe {} object: {}", event.event_type, e);
        (StatusCode::OK, "Invalid event payload")
    })
}

fn subscription_changed(
    event: &StripeWebhookEvent,
    change: SubscriptionChange,
) -> Result<WebhookEvent, WebhookResult> {
    let subscription: StripeSubscriptionObject = parse_object(event)?;
    Ok(WebhookEvent::SubscriptionChanged {
        subscription_id: subscription.id,
        change,
    })
}

fn invoice_event(event: &StripeWebhookEvent, paid: bool) -> Result<WebhookEvent, WebhookResult> {
    let invoice: StripeInvoice = parse_object(event)?;
    let Some(subscription_id) = invoice.subscription_id() else {
        // One-off invoice, not a subscription charge.
        return Ok(WebhookEvent::Ignored);
    };
    Ok(if paid {
        WebhookEvent::PaymentSucceeded {
            subscription_id,
            invoice_id: invoice.id,
            amount_cents: invoice.amount_paid,
            currency: invoice.currency,
        }
    } else {
        WebhookEvent::PaymentFailed {
            subscription_id,
            invoice_id: invoice.id,
            attempt_count: invoice.attempt_count,
            next_payment_attempt: invoice.next_payment_attempt,
        }
    })
}

impl WebhookProvider for StripeWebhookProvider {
    fn provider_name(&self) -> &'static str {
        "stripe"
    }

    fn extract_signature(&self, headers: &HeaderMap) -> Result<String, WebhookResult> {
        headers
            .get("stripe-signature")
            .ok_or((StatusCode::BAD_REQUEST, "Missing stripe-signature header"))?
            .to_str()
            .map(|s| s.to_string())
            .map_err(|e| {
                tracing::debug!("Invalid UTF-8 in Stripe signature header: {}", e);
                (StatusCode::BAD_REQUEST, "Invalid signature header")
            })
    }

    fn verify_signature(
        &self,
        secret: &str,
        body: &Bytes,
        signature: &str,
    ) -> Result<bool, WebhookResult> {
        verify_stripe_signature(secret, body, signature).map_err(|e| {
            tracing::debug!("Malformed Stripe signature: {}", e);
            (StatusCode::BAD_REQUEST, "Invalid signature")
        })
    }

    fn parse_event(&self, body: &Bytes) -> Result<ParsedWebhook, WebhookResult> {
        // The signature already checked out, so a bad body is acknowledged
        // rather than retried.
        let event: StripeWebhookEvent = serde_json::from_slice(body).map_err(|e| {
            tracing::error!("Failed to parse Stripe webhook: {}", e);
            (StatusCode::OK, "Invalid JSON")
        })?;

        let parsed = match event.event_type.as_str() {
            "customer.subscription.created" => {
                subscription_changed(&event, SubscriptionChange::Created)?
            }
            "customer.subscription.updated" => {
                subscription_changed(&event, SubscriptionChange::Updated)?
            }
            "customer.subscription.deleted" => {
                subscription_changed(&event, SubscriptionChange::Deleted)?
            }
            "customer.subscription.trial_will_end" => {
                let subscription: StripeSubscriptionObject = parse_object(&event)?;
                WebhookEvent::TrialWillEnd {
                    subscription_id: subscription.id,
                    trial_ends_at: subscription.trial_end,
                }
            }
            "invoice.payment_succeeded" => invoice_event(&event, true)?,
            "invoice.payment_failed" => invoice_event(&event, false)?,
            _ => WebhookEvent::Ignored,
        };

        Ok(ParsedWebhook {
            event_id: event.id,
            event_type: event.event_type,
            event: parsed,
        })
    }
}

pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let secret = state.config.stripe_webhook_secret.clone();
    handle_webhook(&StripeWebhookProvider, &state, secret.as_deref(), headers, body).await
}
