//! Quota enforcement in front of resource-creating actions.
//!
//! The gate never touches counters. Callers record consumption through
//! [`crate::usage::track`] once the guarded action has succeeded.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use rusqlite::Connection;

use crate::config::{Config, EnforcementMode};
use crate::db::{AppState, queries};
use crate::error::{AppError, QuotaDenial, QuotaDetails, Result, msg};
use crate::models::{ResourceKind, Shop, ThresholdLevel};
use crate::notify::EventNotifier;
use crate::tenancy::TenantContext;
use crate::usage::{self, bytes_to_mb};

pub struct QuotaGate<'a> {
    config: &'a Config,
    notifier: &'a EventNotifier,
}

impl<'a> QuotaGate<'a> {
    pub fn new(config: &'a Config, notifier: &'a EventNotifier) -> Self {
        Self { config, notifier }
    }

    /// Decide whether `tenant` may consume one more unit of `resource`.
    ///
    /// `prospective_mb` is the size of the pending upload and only matters
    /// for storage. Requests with no resolved shop always pass.
    pub fn check(
        &self,
        conn: &Connection,
        tenant: Option<&TenantContext>,
        resource: ResourceKind,
        prospective_mb: i64,
    ) -> Result<()> {
        let Some(ctx) = tenant else {
            return Ok(());
        };

        match self.config.enforcement {
            EnforcementMode::Soft => {
                let level = self.check_threshold(conn, &ctx.shop_id, resource)?;
                tracing::debug!(
                    "Soft quota check for shop {} ({}): {}",
                    ctx.shop_id,
                    resource.as_ref(),
                    level.as_ref()
                );
                Ok(())
            }
            EnforcementMode::Hard => {
                let shop = queries::get_shop_by_id(conn, &ctx.shop_id)?
                    .ok_or_else(|| AppError::NotFound(msg::SHOP_NOT_FOUND.into()))?;
                let amount = match resource {
                    ResourceKind::Storage => prospective_mb.max(0),
                    _ => 1,
                };
                if shop.can_accommodate(resource, amount) {
                    self.check_threshold(conn, &shop.id, resource)?;
                    return Ok(());
                }
                tracing::info!(
                    "Quota denied for shop {}: {} at {}/{:?}",
                    shop.id,
                    resource.as_ref(),
                    shop.usage_for(resource),
                    shop.limit_for(resource)
                );
                Err(self.denial(conn, &shop, resource)?)
            }
        }
    }

    fn check_threshold(
        &self,
        conn: &Connection,
        shop_id: &str,
        resource: ResourceKind,
    ) -> Result<ThresholdLevel> {
        usage::check_threshold(conn, self.notifier, &self.config.thresholds, shop_id, resource)
    }

    fn denial(&self, conn: &Connection, shop: &Shop, resource: ResourceKind) -> Result<AppError> {
        let current_plan = match shop.current_plan_id.as_deref() {
            Some(id) => queries::get_plan_by_id(conn, id)?.map(|p| p.slug),
            None => None,
        };
        Ok(AppError::QuotaExceeded(Box::new(QuotaDenial {
            error: resource.denial_message().to_string(),
            limit_type: resource.as_ref().to_string(),
            details: QuotaDetails {
                limit: shop.limit_for(resource),
                current: shop.usage_for(resource),
                remaining: shop.remaining(resource),
                upgrade_url: self.config.upgrade_url(),
            },
            current_plan,
            message: msg::UPGRADE_MESSAGE,
        })))
    }
}

/// Prospective upload size in MB from `Content-Length`, rounded up.
fn content_length_mb(request: &Request) -> i64 {
    request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .map(bytes_to_mb)
        .unwrap_or(0)
}

/// Middleware enforcing the quota for `resource` on the wrapped routes.
///
/// Must run after [`crate::tenancy::resolve_tenant`]. Use with
/// `axum::middleware::from_fn_with_state(state, require_quota(resource))`.
pub fn require_quota(
    resource: ResourceKind,
) -> impl Fn(State<AppState>, Request, Next) -> std::pin::Pin<Box<dyn Future<Output = Result<Response>> + Send>>
+ Clone
+ Send
+ Sync
+ 'static {
    move |State(state): State<AppState>, request: Request, next: Next| {
        Box::pin(async move {
            let tenant = request
                .extensions()
                .get::<Option<TenantContext>>()
                .cloned()
                .flatten();
            let prospective_mb = content_length_mb(&request);

            {
                let conn = state.db.get()?;
                QuotaGate::new(&state.config, &state.notifier).check(
                    &conn,
                    tenant.as_ref(),
                    resource,
                    prospective_mb,
                )?;
            }

            Ok(next.run(request).await)
        })
    }
}
