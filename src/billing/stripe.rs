use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{BillingGateway, CreateRemoteSubscription, PriceChange, SubscriptionSnapshot};
use crate::crypto::{constant_time_eq, hmac_sha256_hex};
use crate::error::{AppError, Result, msg};
use crate::models::SubscriptionStatus;

const STRIPE_API_BASE: &str = "https://api.stripe.com";

/// Maximum age of a webhook timestamp before it's rejected (in seconds).
/// Stripe recommends 300 seconds (5 minutes).
const WEBHOOK_TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Clock skew allowed for webhook timestamps from the future.
const WEBHOOK_FUTURE_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct StripeGateway {
    client: Client,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PortalSessionResponse {
    url: String,
}

impl StripeGateway {
    /// Every request is bounded by `timeout`; a slow provider surfaces as a
    /// gateway error rather than a hung request.
    pub fn new(secret_key: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            secret_key: secret_key.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", STRIPE_API_BASE, path)
    }

    async fn post_form<T: DeserializeOwned>(&self, path: &str, form: &[(&str, &str)]) -> Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(form)
            .send()
            .await
            .map_err(|e| AppError::Gateway(format!("Stripe API error: {}", e)))?;
        Self::parse_response(response).await
    }

    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::Gateway(format!(
                "Stripe API error ({}): {}",
                status, error_text
            )));
        }
        response
            .json()
            .await
            .map_err(|e| AppError::Gateway(format!("Failed to parse Stripe response: {}", e)))
    }

    async fn get_subscription_object(&self, external_id: &str) -> Result<Option<StripeSubscriptionObject>> {
        let response = self
            .client
            .get(self.url(&format!("/v1/subscriptions/{}", external_id)))
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await
            .map_err(|e| AppError::Gateway(format!("Stripe API error: {}", e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::parse_response(response).await.map(Some)
    }

    async fn ensure_customer(&self, request: &CreateRemoteSubscription) -> Result<String> {
        if let Some(ref id) = request.customer_id {
            return Ok(id.clone());
        }
        let mut form = vec![
            ("name", request.shop_name.as_str()),
            ("metadata[shop_id]", request.shop_id.as_str()),
        ];
        if let Some(ref email) = request.customer_email {
            form.push(("email", email.as_str()));
        }
        let customer: IdResponse = self.post_form("/v1/customers", &form).await?;
        tracing::info!(
            "Created Stripe customer {} for shop {}",
            customer.id,
            request.shop_id
        );
        Ok(customer.id)
    }
}

#[async_trait]
impl BillingGateway for StripeGateway {
    fn provider_name(&self) -> &'static str {
        "stripe"
    }

    async fn create_subscription(
        &self,
        request: &CreateRemoteSubscription,
    ) -> Result<SubscriptionSnapshot> {
        let customer_id = self.ensure_customer(request).await?;

        let _: IdResponse = self
            .post_form(
                &format!("/v1/payment_methods/{}/attach", request.payment_method),
                &[("customer", customer_id.as_str())],
            )
            .await?;
        let _: IdResponse = self
            .post_form(
                &format!("/v1/customers/{}", customer_id),
                &[(
                    "invoice_settings[default_payment_method]",
                    request.payment_method.as_str(),
                )],
            )
            .await?;

        let trial_days = request.trial_days.to_string();
        let mut form = vec![
            ("customer", customer_id.as_str()),
            ("items[0][price]", request.price_id.as_str()),
            ("default_payment_method", request.payment_method.as_str()),
            ("metadata[shop_id]", request.shop_id.as_str()),
            ("metadata[plan]", request.plan_slug.as_str()),
        ];
        if request.trial_days > 0 {
            form.push(("trial_period_days", trial_days.as_str()));
        }

        let subscription: StripeSubscriptionObject =
            self.post_form("/v1/subscriptions", &form).await?;
        subscription.into_snapshot()
    }

    async fn fetch_subscription(&self, external_id: &str) -> Result<Option<SubscriptionSnapshot>> {
        self.get_subscription_object(external_id)
            .await?
            .map(StripeSubscriptionObject::into_snapshot)
            .transpose()
    }

    async fn change_price(
        &self,
        external_id: &str,
        price_id: &str,
        change: PriceChange,
    ) -> Result<()> {
        let current = self
            .get_subscription_object(external_id)
            .await?
            .ok_or_else(|| AppError::Gateway(format!("Subscription {} not found at Stripe", external_id)))?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.clone())
            .ok_or_else(|| AppError::Gateway("Stripe subscription has no items".into()))?;

        let mut form = vec![
            ("items[0][id]", item_id.as_str()),
            ("items[0][price]", price_id),
            ("proration_behavior", change.proration.as_ref()),
        ];
        if change.keep_billing_anchor {
            form.push(("billing_cycle_anchor", "unchanged"));
        }

        let _: IdResponse = self
            .post_form(&format!("/v1/subscriptions/{}", external_id), &form)
            .await?;
        Ok(())
    }

    async fn cancel_now(&self, external_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/v1/subscriptions/{}", external_id)))
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await
            .map_err(|e| AppError::Gateway(format!("Stripe API error: {}", e)))?;
        let _: IdResponse = Self::parse_response(response).await?;
        Ok(())
    }

    async fn set_cancel_at_period_end(&self, external_id: &str, cancel: bool) -> Result<()> {
        let _: IdResponse = self
            .post_form(
                &format!("/v1/subscriptions/{}", external_id),
                &[(
                    "cancel_at_period_end",
                    if cancel { "true" } else { "false" },
                )],
            )
            .await?;
        Ok(())
    }

    async fn billing_portal_url(&self, customer_id: &str, return_url: &str) -> Result<String> {
        let session: PortalSessionResponse = self
            .post_form(
                "/v1/billing_portal/sessions",
                &[("customer", customer_id), ("return_url", return_url)],
            )
            .await?;
        Ok(session.url)
    }
}

/// Verify a `stripe-signature` header (`t=timestamp,v1=signature`).
///
/// Returns `Ok(false)` for a well-formed header that does not match, is too
/// old, or is from the future, and an error for a malformed header.
pub fn verify_stripe_signature(secret: &str, payload: &[u8], header: &str) -> Result<bool> {
    let mut timestamp = None;
    let mut sig_v1 = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = Some(t);
        } else if let Some(s) = part.strip_prefix("v1=") {
            sig_v1 = Some(s);
        }
    }

    let timestamp_str =
        timestamp.ok_or_else(|| AppError::BadRequest(msg::INVALID_SIGNATURE_FORMAT.into()))?;
    let sig_v1 = sig_v1.ok_or_else(|| AppError::BadRequest(msg::INVALID_SIGNATURE_FORMAT.into()))?;

    let timestamp: i64 = timestamp_str
        .parse()
        .map_err(|_| AppError::BadRequest(msg::INVALID_TIMESTAMP_IN_SIGNATURE.into()))?;

    let age = Utc::now().timestamp() - timestamp;
    if age > WEBHOOK_TIMESTAMP_TOLERANCE_SECS {
        tracing::warn!(
            "Stripe webhook rejected: timestamp too old (age={}s, max={}s)",
            age,
            WEBHOOK_TIMESTAMP_TOLERANCE_SECS
        );
        return Ok(false);
    }
    if age < -WEBHOOK_FUTURE_SKEW_SECS {
        tracing::warn!("Stripe webhook rejected: timestamp in the future (age={}s)", age);
        return Ok(false);
    }

    let signed_payload = format!("{}.{}", timestamp_str, String::from_utf8_lossy(payload));
    let expected = hmac_sha256_hex(secret, signed_payload.as_bytes())?;

    Ok(constant_time_eq(&expected, sig_v1))
}

// ============ Wire types ============

/// Generic Stripe webhook envelope; `data.object` is parsed per event type.
#[derive(Debug, Deserialize)]
pub struct StripeWebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct StripeSubscriptionObject {
    pub id: String,
    pub customer: String,
    pub status: String,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub items: StripeList<StripeSubscriptionItem>,
}

#[derive(Debug, Deserialize)]
pub struct StripeList<T> {
    pub data: Vec<T>,
}

impl<T> Default for StripeList<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
pub struct StripeSubscriptionItem {
    pub id: String,
    pub price: StripePrice,
    // Newer API versions report period bounds per item.
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct StripePrice {
    pub id: String,
}

impl StripeSubscriptionObject {
    /// Convert to a snapshot stamped with the time it was observed.
    pub fn into_snapshot(self) -> Result<SubscriptionSnapshot> {
        let status: SubscriptionStatus = self.status.parse().map_err(|_| {
            AppError::Gateway(format!("Unknown Stripe subscription status: {}", self.status))
        })?;
        let item = self.items.data.first();
        Ok(SubscriptionSnapshot {
            external_id: self.id,
            customer_id: self.customer,
            status,
            price_id: item.map(|i| i.price.id.clone()),
            current_period_start: self
                .current_period_start
                .or_else(|| item.and_then(|i| i.current_period_start)),
            current_period_end: self
                .current_period_end
                .or_else(|| item.and_then(|i| i.current_period_end)),
            trial_end: self.trial_end,
            cancel_at_period_end: self.cancel_at_period_end,
            canceled_at: self.canceled_at,
            ended_at: self.ended_at,
            version: Utc::now().timestamp_millis(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct StripeInvoice {
    pub id: String,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub attempt_count: i64,
    #[serde(default)]
    pub next_payment_attempt: Option<i64>,
    #[serde(default)]
    pub parent: Option<serde_json::Value>,
}

impl StripeInvoice {
    /// Subscription the invoice belongs to, across API versions.
    pub fn subscription_id(&self) -> Option<String> {
        self.subscription.clone().or_else(|| {
            self.parent
                .as_ref()?
                .pointer("/subscription_details/subscription")?
                .as_str()
                .map(String::from)
        })
    }
}
