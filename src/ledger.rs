//! Subscription lifecycle and reconciliation with the billing provider.
//!
//! The provider owns payment state; local rows are a versioned mirror.
//! Every mutation goes to the provider first and is written locally only
//! after it succeeds, so a provider failure leaves nothing behind.
//! Reconciliation (`sync`) is the single path by which provider state
//! lands in the database.

use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;

use crate::billing::{BillingGateway, CreateRemoteSubscription, PriceChange, SubscriptionSnapshot};
use crate::config::{Config, DowngradeTiming, ProrationBehavior};
use crate::db::queries::{self, NewSubscription};
use crate::db::{AppState, DbPool};
use crate::error::{AppError, Result, msg};
use crate::models::{
    DomainEvent, Plan, Shop, Subscription, SubscriptionStatus, SubscriptionWithPlan, Tenant, Tier,
    subdomain_base, subdomain_candidate,
};
use crate::notify::EventNotifier;
use crate::pagination::{Paginated, PaginationQuery};

/// Result of reconciling one subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The snapshot was newer and has been written.
    Applied(Subscription),
    /// The snapshot had already been applied.
    Unchanged(Subscription),
    /// An older snapshot than the one on record; ignored.
    Stale,
    /// No local row, or the provider does not know the id.
    NotFound,
}

#[derive(Debug, Serialize)]
pub struct DowngradeResult {
    pub subscription: SubscriptionWithPlan,
    /// When the customer moves to the cheaper plan's price.
    pub effective_date: Option<i64>,
    pub timing: DowngradeTiming,
}

pub struct SubscriptionLedger<'a> {
    db: &'a DbPool,
    config: &'a Config,
    gateway: &'a dyn BillingGateway,
    notifier: &'a EventNotifier,
}

impl<'a> SubscriptionLedger<'a> {
    pub fn new(
        db: &'a DbPool,
        config: &'a Config,
        gateway: &'a dyn BillingGateway,
        notifier: &'a EventNotifier,
    ) -> Self {
        Self {
            db,
            config,
            gateway,
            notifier,
        }
    }

    pub fn from_state(state: &'a AppState) -> Self {
        Self::new(&state.db, &state.config, state.billing.as_ref(), &state.notifier)
    }

    fn notify(&self, shop_id: &str, event: DomainEvent) {
        match self.db.get() {
            Ok(conn) => self.notifier.notify_best_effort(&conn, shop_id, &event),
            Err(e) => tracing::error!("No connection to record {} event: {}", event.name(), e),
        }
    }

    /// Subscribe `shop_id` to a paid plan.
    pub async fn create(
        &self,
        shop_id: &str,
        plan_id: &str,
        payment_method: &str,
        customer_email: Option<&str>,
    ) -> Result<SubscriptionWithPlan> {
        let now = queries::now();
        let (shop, plan, price_id, previous, pending) = {
            let conn = self.db.get()?;
            let shop = load_shop(&conn, shop_id)?;
            let plan = queries::get_plan_by_id(&conn, plan_id)?
                .ok_or_else(|| AppError::NotFound(msg::PLAN_NOT_FOUND.into()))?;
            if plan.is_free() {
                return Err(AppError::BadRequest(msg::FREE_PLAN_NOT_SUBSCRIBABLE.into()));
            }
            if !plan.is_active {
                return Err(AppError::BadRequest(msg::PLAN_INACTIVE.into()));
            }
            let price_id = plan
                .external_price_id
                .clone()
                .ok_or_else(|| AppError::BadRequest(msg::PLAN_NOT_BILLABLE.into()))?;
            let previous = queries::get_valid_subscription_for_shop(&conn, shop_id)?;
            let pending = queries::get_pending_subscription_for_shop(&conn, shop_id)?;
            (shop, plan, price_id, previous, pending)
        };

        if let Some(previous) = previous {
            if previous.is_valid_at(now) {
                return Err(AppError::BadRequest(msg::ALREADY_SUBSCRIBED.into()));
            }
            // A deferred cancellation whose period has run out; let the
            // provider confirm the end before a new row takes its place.
            self.sync(&previous.external_subscription_id).await?;
            let conn = self.db.get()?;
            if queries::get_valid_subscription_for_shop(&conn, shop_id)?.is_some() {
                return Err(AppError::BadRequest(msg::ALREADY_SUBSCRIBED.into()));
            }
        }

        if let Some(pending) = pending {
            // The payment may have settled or lapsed since the last webhook.
            self.sync(&pending.external_subscription_id).await?;
            let conn = self.db.get()?;
            if queries::get_valid_subscription_for_shop(&conn, shop_id)?.is_some() {
                return Err(AppError::BadRequest(msg::ALREADY_SUBSCRIBED.into()));
            }
            if queries::get_pending_subscription_for_shop(&conn, shop_id)?.is_some() {
                return Err(AppError::BadRequest(msg::PAYMENT_PENDING.into()));
            }
        }

        let snapshot = self
            .gateway
            .create_subscription(&CreateRemoteSubscription {
                shop_id: shop.id.clone(),
                shop_name: shop.name.clone(),
                customer_id: shop.billing_customer_id.clone(),
                customer_email: customer_email.map(String::from),
                price_id,
                payment_method: payment_method.to_string(),
                trial_days: plan.trial_days,
                plan_slug: plan.slug.clone(),
            })
            .await?;

        let recorded = {
            let mut conn = self.db.get()?;
            record_new_subscription(&mut conn, &shop, &plan, &snapshot)
        };
        let subscription = match recorded {
            Ok(sub) => sub,
            Err(e) => {
                tracing::error!(
                    "Created remote subscription {} for shop {} but could not record it: {}",
                    snapshot.external_id,
                    shop.id,
                    e
                );
                if let Err(cancel_err) = self.gateway.cancel_now(&snapshot.external_id).await {
                    tracing::error!(
                        "Failed to cancel unrecorded remote subscription {}: {}",
                        snapshot.external_id,
                        cancel_err
                    );
                }
                return Err(e);
            }
        };

        tracing::info!(
            "Shop {} subscribed to {} ({}, status {})",
            shop.id,
            plan.slug,
            subscription.external_subscription_id,
            subscription.status.as_ref()
        );
        self.notify(
            &shop.id,
            DomainEvent::SubscriptionCreated {
                subscription_id: subscription.id.clone(),
            },
        );

        Ok(SubscriptionWithPlan { subscription, plan })
    }

    /// Pull the provider's current view of a subscription and apply it.
    pub async fn sync(&self, external_id: &str) -> Result<SyncOutcome> {
        let Some(snapshot) = self.gateway.fetch_subscription(external_id).await? else {
            tracing::warn!("Provider has no subscription {}", external_id);
            return Ok(SyncOutcome::NotFound);
        };
        let mut conn = self.db.get()?;
        apply_snapshot(&mut conn, &snapshot)
    }

    /// Move to a more expensive plan, prorated per configuration.
    pub async fn upgrade(&self, shop_id: &str, plan_id: &str) -> Result<SubscriptionWithPlan> {
        let (current, current_plan, new_plan) = self.load_change(shop_id, plan_id)?;
        if new_plan.price_cents <= current_plan.price_cents {
            return Err(AppError::BadRequest(msg::UPGRADE_NOT_HIGHER.into()));
        }
        let price_id = billable_price(&new_plan)?;

        self.gateway
            .change_price(
                &current.external_subscription_id,
                price_id,
                PriceChange {
                    proration: self.config.upgrade_proration,
                    keep_billing_anchor: false,
                },
            )
            .await?;

        let updated = self.sync_and_load(&current).await?;
        tracing::info!(
            "Shop {} upgraded from {} to {}",
            shop_id,
            current_plan.slug,
            updated.plan.slug
        );
        self.notify(
            shop_id,
            DomainEvent::SubscriptionUpdated {
                subscription_id: current.id.clone(),
            },
        );
        Ok(updated)
    }

    /// Move to a cheaper plan. With end-of-period timing the price changes at
    /// renewal without proration.
    pub async fn downgrade(&self, shop_id: &str, plan_id: &str) -> Result<DowngradeResult> {
        let (current, current_plan, new_plan) = self.load_change(shop_id, plan_id)?;
        if new_plan.is_free() {
            return Err(AppError::BadRequest(msg::FREE_PLAN_NOT_SUBSCRIBABLE.into()));
        }
        if new_plan.price_cents >= current_plan.price_cents {
            return Err(AppError::BadRequest(msg::DOWNGRADE_NOT_LOWER.into()));
        }
        let price_id = billable_price(&new_plan)?;

        let timing = self.config.downgrade_timing;
        let change = match timing {
            DowngradeTiming::EndOfPeriod => PriceChange {
                proration: ProrationBehavior::None,
                keep_billing_anchor: true,
            },
            DowngradeTiming::Immediate => PriceChange {
                proration: self.config.downgrade_proration,
                keep_billing_anchor: false,
            },
        };
        self.gateway
            .change_price(&current.external_subscription_id, price_id, change)
            .await?;

        let updated = self.sync_and_load(&current).await?;
        let effective_date = match timing {
            DowngradeTiming::EndOfPeriod => updated
                .subscription
                .current_period_end
                .or(current.current_period_end),
            DowngradeTiming::Immediate => Some(queries::now()),
        };

        tracing::info!(
            "Shop {} downgraded from {} to {} ({})",
            shop_id,
            current_plan.slug,
            new_plan.slug,
            timing.as_ref()
        );
        self.notify(
            shop_id,
            DomainEvent::SubscriptionUpdated {
                subscription_id: current.id.clone(),
            },
        );

        Ok(DowngradeResult {
            subscription: updated,
            effective_date,
            timing,
        })
    }

    /// Cancel now, or at the end of the current period.
    pub async fn cancel(&self, shop_id: &str, immediately: bool) -> Result<Subscription> {
        let (current, _) = {
            let conn = self.db.get()?;
            require_current(&conn, shop_id, queries::now())?
        };

        if immediately {
            self.gateway.cancel_now(&current.external_subscription_id).await?;

            let now = queries::now();
            let updated = {
                let mut conn = self.db.get()?;
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let updated = queries::mark_subscription_canceled(&tx, &current.id, now)?
                    .ok_or_else(|| AppError::NotFound(msg::NO_ACTIVE_SUBSCRIPTION.into()))?;
                queries::revert_shop_to_free(&tx, shop_id, SubscriptionStatus::Canceled)?;
                expire_tenant(&tx, shop_id, Some(now))?;
                tx.commit()?;
                updated
            };

            tracing::info!("Shop {} canceled subscription {} immediately", shop_id, current.id);
            self.notify(
                shop_id,
                DomainEvent::SubscriptionCanceled {
                    subscription_id: current.id.clone(),
                },
            );
            return Ok(updated);
        }

        if current.cancel_at_period_end {
            return Ok(current);
        }

        self.gateway
            .set_cancel_at_period_end(&current.external_subscription_id, true)
            .await?;

        let updated = {
            let conn = self.db.get()?;
            queries::set_subscription_cancel_at_period_end(
                &conn,
                &current.id,
                true,
                Some(queries::now()),
                current.current_period_end,
            )?
            .ok_or_else(|| AppError::NotFound(msg::NO_ACTIVE_SUBSCRIPTION.into()))?
        };

        tracing::info!(
            "Shop {} scheduled cancellation of {} at {:?}",
            shop_id,
            current.id,
            updated.ends_at
        );
        self.notify(
            shop_id,
            DomainEvent::SubscriptionUpdated {
                subscription_id: current.id.clone(),
            },
        );
        Ok(updated)
    }

    /// Undo a scheduled cancellation while the paid period is still running.
    pub async fn resume(&self, shop_id: &str) -> Result<Subscription> {
        let now = queries::now();
        let current = {
            let conn = self.db.get()?;
            queries::get_valid_subscription_for_shop(&conn, shop_id)?
                .ok_or_else(|| AppError::NotFound(msg::NO_ACTIVE_SUBSCRIPTION.into()))?
        };
        if !current.cancel_at_period_end || !current.on_grace_period(now) {
            return Err(AppError::BadRequest(msg::NOT_PENDING_CANCELLATION.into()));
        }

        self.gateway
            .set_cancel_at_period_end(&current.external_subscription_id, false)
            .await?;

        let updated = {
            let conn = self.db.get()?;
            queries::set_subscription_cancel_at_period_end(&conn, &current.id, false, None, None)?
                .ok_or_else(|| AppError::NotFound(msg::NO_ACTIVE_SUBSCRIPTION.into()))?
        };

        tracing::info!("Shop {} resumed subscription {}", shop_id, current.id);
        self.notify(
            shop_id,
            DomainEvent::SubscriptionUpdated {
                subscription_id: current.id.clone(),
            },
        );
        Ok(updated)
    }

    pub fn current(&self, shop_id: &str) -> Result<Option<SubscriptionWithPlan>> {
        let conn = self.db.get()?;
        match require_current(&conn, shop_id, queries::now()) {
            Ok((subscription, plan)) => Ok(Some(SubscriptionWithPlan { subscription, plan })),
            Err(AppError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// All subscriptions the shop ever had, newest first.
    pub fn history(&self, shop_id: &str, page: &PaginationQuery) -> Result<Paginated<Subscription>> {
        let conn = self.db.get()?;
        let (items, total) = queries::list_subscriptions_for_shop_paginated(
            &conn,
            shop_id,
            page.limit(),
            page.offset(),
        )?;
        Ok(Paginated::new(items, total, page))
    }

    /// Self-service portal URL for the shop's billing customer.
    pub async fn billing_portal(&self, shop_id: &str) -> Result<String> {
        let customer_id = {
            let conn = self.db.get()?;
            load_shop(&conn, shop_id)?
                .billing_customer_id
                .ok_or_else(|| AppError::NotFound(msg::NO_BILLING_CUSTOMER.into()))?
        };
        self.gateway
            .billing_portal_url(&customer_id, &self.config.billing_return_url())
            .await
    }

    fn load_change(&self, shop_id: &str, plan_id: &str) -> Result<(Subscription, Plan, Plan)> {
        let conn = self.db.get()?;
        let (current, current_plan) = require_current(&conn, shop_id, queries::now())?;
        let new_plan = queries::get_plan_by_id(&conn, plan_id)?
            .ok_or_else(|| AppError::NotFound(msg::PLAN_NOT_FOUND.into()))?;
        if new_plan.id == current_plan.id {
            return Err(AppError::BadRequest(msg::SAME_PLAN.into()));
        }
        if !new_plan.is_active {
            return Err(AppError::BadRequest(msg::PLAN_INACTIVE.into()));
        }
        Ok((current, current_plan, new_plan))
    }

    async fn sync_and_load(&self, current: &Subscription) -> Result<SubscriptionWithPlan> {
        let outcome = self.sync(&current.external_subscription_id).await?;
        tracing::debug!("Sync after plan change of {}: {:?}", current.id, outcome);

        let conn = self.db.get()?;
        let subscription = queries::get_subscription_by_id(&conn, &current.id)?
            .ok_or_else(|| AppError::NotFound(msg::NO_ACTIVE_SUBSCRIPTION.into()))?;
        let plan = queries::get_plan_by_id(&conn, &subscription.plan_id)?
            .ok_or_else(|| AppError::NotFound(msg::PLAN_NOT_FOUND.into()))?;
        Ok(SubscriptionWithPlan { subscription, plan })
    }
}

fn load_shop(conn: &Connection, shop_id: &str) -> Result<Shop> {
    queries::get_shop_by_id(conn, shop_id)?
        .ok_or_else(|| AppError::NotFound(msg::SHOP_NOT_FOUND.into()))
}

fn billable_price(plan: &Plan) -> Result<&str> {
    plan.external_price_id
        .as_deref()
        .ok_or_else(|| AppError::BadRequest(msg::PLAN_NOT_BILLABLE.into()))
}

/// The subscription that grants the shop its plan right now.
fn require_current(conn: &Connection, shop_id: &str, now: i64) -> Result<(Subscription, Plan)> {
    let subscription = queries::get_valid_subscription_for_shop(conn, shop_id)?
        .filter(|s| s.is_valid_at(now))
        .ok_or_else(|| AppError::NotFound(msg::NO_ACTIVE_SUBSCRIPTION.into()))?;
    let plan = queries::get_plan_by_id(conn, &subscription.plan_id)?
        .ok_or_else(|| AppError::NotFound(msg::PLAN_NOT_FOUND.into()))?;
    Ok((subscription, plan))
}

fn record_new_subscription(
    conn: &mut Connection,
    shop: &Shop,
    plan: &Plan,
    snapshot: &SubscriptionSnapshot,
) -> Result<Subscription> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if snapshot.status.is_valid() && queries::get_valid_subscription_for_shop(&tx, &shop.id)?.is_some()
    {
        return Err(AppError::Conflict(msg::ALREADY_SUBSCRIBED.into()));
    }
    if queries::get_pending_subscription_for_shop(&tx, &shop.id)?.is_some() {
        return Err(AppError::Conflict(msg::PAYMENT_PENDING.into()));
    }

    let tenant_id = if snapshot.status.is_valid() {
        grant_plan(&tx, shop, plan, snapshot.status)?.map(|t| t.id)
    } else {
        queries::set_shop_subscription_status(&tx, &shop.id, snapshot.status)?;
        queries::get_tenant_by_shop(&tx, &shop.id)?.map(|t| t.id)
    };

    let subscription = queries::insert_subscription(
        &tx,
        &NewSubscription {
            shop_id: &shop.id,
            tenant_id: tenant_id.as_deref(),
            plan_id: &plan.id,
            snapshot,
            metadata: Some(serde_json::json!({ "plan": plan.slug })),
        },
    )?;
    queries::set_shop_billing_customer(&tx, &shop.id, &snapshot.customer_id)?;

    tx.commit()?;
    Ok(subscription)
}

/// Apply a provider snapshot to the local mirror.
///
/// Runs under `BEGIN IMMEDIATE`, so concurrent syncs of the same
/// subscription are serialized and the version comparison is race-free.
pub fn apply_snapshot(conn: &mut Connection, snapshot: &SubscriptionSnapshot) -> Result<SyncOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let Some(existing) = queries::get_subscription_by_external_id(&tx, &snapshot.external_id)?
    else {
        tracing::warn!("No local subscription for {}", snapshot.external_id);
        return Ok(SyncOutcome::NotFound);
    };

    if snapshot.version < existing.remote_version {
        tracing::info!(
            "Ignoring stale snapshot of {} (version {} < {})",
            snapshot.external_id,
            snapshot.version,
            existing.remote_version
        );
        return Ok(SyncOutcome::Stale);
    }
    // Provider versions order snapshots but are not content hashes; a fresh
    // fetch of an unchanged subscription carries a new one.
    if snapshot.version == existing.remote_version || mirrors(&existing, snapshot) {
        return Ok(SyncOutcome::Unchanged(existing));
    }

    let plan = match snapshot.price_id.as_deref() {
        Some(price_id) => queries::get_plan_by_external_price_id(&tx, price_id)?,
        None => None,
    };
    let plan = match plan {
        Some(plan) => plan,
        None => queries::get_plan_by_id(&tx, &existing.plan_id)?
            .ok_or_else(|| AppError::Internal(format!("Plan {} missing", existing.plan_id)))?,
    };

    let shop = load_shop(&tx, &existing.shop_id)?;
    // Another subscription may already own the shop (e.g. a late event for
    // an old one). Only the shop's governing subscription drives its caches.
    let governs_shop = snapshot.status.is_valid()
        || queries::get_valid_subscription_for_shop(&tx, &shop.id)?
            .is_none_or(|s| s.id == existing.id);

    let mut tenant_id = existing.tenant_id.clone();
    if governs_shop {
        if snapshot.status.is_valid() {
            if let Some(tenant) = grant_plan(&tx, &shop, &plan, snapshot.status)? {
                tenant_id = Some(tenant.id);
            }
        } else if snapshot.status.revokes_plan() {
            queries::revert_shop_to_free(&tx, &shop.id, snapshot.status)?;
            expire_tenant(&tx, &shop.id, snapshot.local_ends_at().or(Some(queries::now())))?;
        } else {
            queries::set_shop_subscription_status(&tx, &shop.id, snapshot.status)?;
        }
    }

    let updated = queries::update_subscription_from_snapshot(
        &tx,
        &existing.id,
        &plan.id,
        tenant_id.as_deref(),
        snapshot,
    )?
    .ok_or_else(|| AppError::Internal(format!("Subscription {} vanished", existing.id)))?;

    tx.commit()?;

    tracing::info!(
        "Synced {} ({} -> {}, plan {})",
        snapshot.external_id,
        existing.status.as_ref(),
        updated.status.as_ref(),
        plan.slug
    );
    Ok(SyncOutcome::Applied(updated))
}

/// Whether the local row already holds every provider-owned field of
/// `snapshot`.
///
/// A subscription that ended in the same terminal status is final; the
/// provider's confirmation only restates its end timestamps.
fn mirrors(local: &Subscription, snapshot: &SubscriptionSnapshot) -> bool {
    if local.status != snapshot.status {
        return false;
    }
    if local.status.is_terminal() {
        return true;
    }
    local.external_customer_id.as_deref() == Some(snapshot.customer_id.as_str())
        && local.external_price_id == snapshot.price_id
        && local.current_period_start == snapshot.current_period_start
        && local.current_period_end == snapshot.current_period_end
        && local.trial_ends_at == snapshot.trial_end
        && local.cancel_at_period_end == snapshot.cancel_at_period_end
        && local.canceled_at == snapshot.canceled_at
        && local.ends_at == snapshot.local_ends_at()
}

/// Mirror `plan` onto the shop and make sure a premium shop has its tenant.
fn grant_plan(
    conn: &Connection,
    shop: &Shop,
    plan: &Plan,
    status: SubscriptionStatus,
) -> Result<Option<Tenant>> {
    queries::apply_plan_to_shop(conn, &shop.id, plan, status)?;
    if plan.subdomain_enabled {
        return ensure_tenant(conn, shop, plan.tier()).map(Some);
    }
    match queries::get_tenant_by_shop(conn, &shop.id)? {
        Some(tenant) => queries::update_tenant_tier(conn, &tenant.id, plan.tier(), None),
        None => Ok(None),
    }
}

/// The shop's tenant, created with a fresh subdomain if it has none yet.
pub fn ensure_tenant(conn: &Connection, shop: &Shop, tier: Tier) -> Result<Tenant> {
    if let Some(tenant) = queries::get_tenant_by_shop(conn, &shop.id)? {
        if tenant.tier == tier && tenant.premium_expires_at.is_none() {
            return Ok(tenant);
        }
        return queries::update_tenant_tier(conn, &tenant.id, tier, None)?
            .ok_or_else(|| AppError::Internal(format!("Tenant {} vanished", tenant.id)));
    }

    let base = subdomain_base(&shop.name);
    let mut attempt = 0;
    let subdomain = loop {
        let candidate = subdomain_candidate(&base, attempt);
        if !queries::subdomain_taken(conn, &candidate)? {
            break candidate;
        }
        attempt += 1;
    };

    let tenant = queries::create_tenant(conn, &shop.id, Some(&subdomain), tier)?;
    tracing::info!("Provisioned tenant {} ({}) for shop {}", tenant.id, subdomain, shop.id);
    Ok(tenant)
}

/// Keep the tenant (its subdomain stays reserved) but end its premium window.
fn expire_tenant(conn: &Connection, shop_id: &str, at: Option<i64>) -> Result<()> {
    if let Some(tenant) = queries::get_tenant_by_shop(conn, shop_id)? {
        queries::update_tenant_tier(conn, &tenant.id, Tier::Free, at)?;
    }
    Ok(())
}
