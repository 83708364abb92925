//! Domain event fan-out.
//!
//! Every event is logged, persisted to `event_log`, and, when
//! `NOTIFY_WEBHOOK_URL` is set, POSTed to an outside collaborator (mailer,
//! analytics). Delivery is fire-and-forget: a failing collaborator never
//! fails the operation that raised the event.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use reqwest::Client;
use rusqlite::Connection;
use serde::Serialize;

use crate::db::queries;
use crate::error::Result;
use crate::models::DomainEvent;

/// Quick retries so a slow collaborator does not pile up tasks.
const NOTIFY_RETRY_DELAYS: &[u64] = &[100, 200];

const NOTIFY_TIMEOUT_SECS: u64 = 5;

/// Body of the outbound notification.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub id: String,
    pub shop_id: String,
    #[serde(flatten)]
    pub event: DomainEvent,
    pub timestamp: i64,
}

#[derive(Clone)]
pub struct EventNotifier {
    client: Client,
    url: Option<String>,
}

impl EventNotifier {
    pub fn new(url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }

    /// Notifier that only logs and persists.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Record `event` for `shop_id` and dispatch it.
    ///
    /// Only the event_log insert can fail; the webhook is spawned after the
    /// row is written.
    pub fn notify(&self, conn: &Connection, shop_id: &str, event: &DomainEvent) -> Result<()> {
        match event {
            DomainEvent::PaymentFailed {
                subscription_id,
                attempt_count,
                ..
            } => tracing::warn!(
                shop_id,
                subscription_id = subscription_id.as_str(),
                attempt_count,
                "Payment failed"
            ),
            DomainEvent::UsageThreshold {
                resource,
                percent,
                level,
            } => tracing::info!(
                shop_id,
                resource = resource.as_ref(),
                percent,
                level = level.as_ref(),
                "Usage threshold reached"
            ),
            other => tracing::info!(shop_id, event = other.name(), "Domain event"),
        }

        let entry = queries::insert_event_log(conn, shop_id, event)?;

        if let Some(url) = self.url.clone() {
            let payload = NotificationPayload {
                id: entry.id,
                shop_id: shop_id.to_string(),
                event: event.clone(),
                timestamp: entry.created_at,
            };
            spawn_notification(self.client.clone(), url, payload);
        }
        Ok(())
    }

    /// Like [`notify`](Self::notify), but a failure is logged instead of
    /// returned. For callers that have already committed their own work.
    pub fn notify_best_effort(&self, conn: &Connection, shop_id: &str, event: &DomainEvent) {
        if let Err(e) = self.notify(conn, shop_id, event) {
            tracing::error!("Failed to record {} event for shop {}: {}", event.name(), shop_id, e);
        }
    }
}

/// Spawn the webhook POST. Panics in the task are logged rather than lost.
fn spawn_notification(client: Client, url: String, payload: NotificationPayload) {
    let event_name = payload.event.name();
    tokio::spawn(
        AssertUnwindSafe(async move {
            send_notification(&client, &url, &payload).await;
        })
        .catch_unwind()
        .map(move |result| {
            if let Err(panic) = result {
                let panic_msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(
                    "Notification task panicked for event '{}': {}",
                    event_name,
                    panic_msg
                );
            }
        }),
    );
}

async fn send_notification<T: Serialize>(client: &Client, url: &str, payload: &T) {
    for (attempt, delay_ms) in std::iter::once(&0u64)
        .chain(NOTIFY_RETRY_DELAYS.iter())
        .enumerate()
    {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
        }

        match client
            .post(url)
            .json(payload)
            .timeout(Duration::from_secs(NOTIFY_TIMEOUT_SECS))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                if attempt > 0 {
                    tracing::debug!("Notification webhook succeeded after {} retries", attempt);
                }
                return;
            }
            Ok(resp) => tracing::debug!("Notification webhook returned {}", resp.status()),
            Err(e) => tracing::debug!("Notification webhook failed: {}", e),
        }
    }

    tracing::warn!(
        "Notification webhook failed after {} attempts",
        NOTIFY_RETRY_DELAYS.len() + 1
    );
}
