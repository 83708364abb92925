//! Request-to-shop resolution.
//!
//! A request belongs to at most one shop. The signals are tried in a fixed
//! order: tenant subdomain, `shop_id` query parameter, `X-Shop-ID` header,
//! then the authenticated vendor on vendor paths. Nothing matched means
//! marketplace mode. The result rides in the request extensions.

use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, HeaderValue, header},
    middleware::Next,
    response::Response,
};
use rusqlite::Connection;
use serde::Deserialize;
use strum::AsRefStr;

use crate::config::Config;
use crate::db::{AppState, queries};
use crate::error::Result;
use crate::id::is_valid_prefixed_id;
use crate::models::Tenant;

pub const SHOP_ID_HEADER: &str = "x-shop-id";
pub const SHOP_CONTEXT_HEADER: &str = "x-shop-context";
pub const TENANT_ID_HEADER: &str = "x-tenant-id";
pub const TENANT_SUBDOMAIN_HEADER: &str = "x-tenant-subdomain";

/// Which signal identified the shop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ResolutionSource {
    Subdomain,
    Parameter,
    Header,
    Vendor,
}

/// The shop a request is scoped to, if any.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub shop_id: String,
    /// Present when the shop has a tenant record (premium subdomain).
    pub tenant: Option<Tenant>,
    pub source: ResolutionSource,
}

/// The parts of a request that can identify a shop.
#[derive(Debug, Clone, Default)]
pub struct RequestSignals {
    pub host: Option<String>,
    pub path: String,
    pub shop_id_param: Option<String>,
    pub shop_id_header: Option<String>,
    pub bearer_token: Option<String>,
}

#[derive(Deserialize)]
struct ShopIdParam {
    shop_id: Option<String>,
}

impl RequestSignals {
    pub fn from_request(request: &Request) -> Self {
        let headers = request.headers();
        let host = header_str(headers, header::HOST.as_str())
            .or_else(|| request.uri().host())
            .map(String::from);

        // A malformed query string is not a shop signal.
        let shop_id_param = Query::<ShopIdParam>::try_from_uri(request.uri())
            .ok()
            .and_then(|q| q.0.shop_id);

        Self {
            host,
            path: request.uri().path().to_string(),
            shop_id_param,
            shop_id_header: header_str(headers, SHOP_ID_HEADER).map(String::from),
            bearer_token: bearer_token(headers).map(String::from),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, header::AUTHORIZATION.as_str())?.strip_prefix("Bearer ")
}

/// Lowercased host without the port.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().to_lowercase();
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name.to_string(),
        _ => host,
    }
}

/// Tenant label for `host`, when it is a direct subdomain of a central domain.
///
/// A central domain itself never yields a label.
pub fn subdomain_label(host: &str, central_domains: &[String]) -> Option<String> {
    let host = normalize_host(host);
    if central_domains.iter().any(|d| *d == host) {
        return None;
    }
    central_domains.iter().find_map(|domain| {
        let label = host.strip_suffix(domain.as_str())?.strip_suffix('.')?;
        (!label.is_empty() && !label.contains('.')).then(|| label.to_string())
    })
}

fn shop_context(
    conn: &Connection,
    shop_id: &str,
    source: ResolutionSource,
) -> Result<Option<TenantContext>> {
    if !shop_id.starts_with("vp_shop_") || !is_valid_prefixed_id(shop_id) {
        return Ok(None);
    }
    if !queries::shop_exists(conn, shop_id)? {
        return Ok(None);
    }
    Ok(Some(TenantContext {
        shop_id: shop_id.to_string(),
        tenant: queries::get_tenant_by_shop(conn, shop_id)?,
        source,
    }))
}

fn is_vendor_path(path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| path.starts_with(p.as_str()))
}

/// Resolve the shop a request belongs to. Read-only.
pub fn resolve(
    conn: &Connection,
    config: &Config,
    signals: &RequestSignals,
) -> Result<Option<TenantContext>> {
    if let Some(label) = signals
        .host
        .as_deref()
        .and_then(|h| subdomain_label(h, &config.central_domains))
        && let Some(tenant) = queries::get_tenant_by_subdomain(conn, &label)?
    {
        return Ok(Some(TenantContext {
            shop_id: tenant.shop_id.clone(),
            tenant: Some(tenant),
            source: ResolutionSource::Subdomain,
        }));
    }

    if let Some(id) = signals.shop_id_param.as_deref()
        && let Some(ctx) = shop_context(conn, id, ResolutionSource::Parameter)?
    {
        return Ok(Some(ctx));
    }

    if let Some(id) = signals.shop_id_header.as_deref()
        && let Some(ctx) = shop_context(conn, id, ResolutionSource::Header)?
    {
        return Ok(Some(ctx));
    }

    if is_vendor_path(&signals.path, &config.vendor_path_prefixes)
        && let Some(token) = signals.bearer_token.as_deref()
        && let Some(user) = queries::get_user_by_api_key(conn, token)?
        && let Some(shop_id) = user.shop_id.as_deref()
    {
        return shop_context(conn, shop_id, ResolutionSource::Vendor);
    }

    Ok(None)
}

/// Middleware that attaches an `Option<TenantContext>` to every request and
/// echoes the resolution in response headers.
pub async fn resolve_tenant(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, crate::error::AppError> {
    let signals = RequestSignals::from_request(&request);
    let context = {
        let conn = state.db.get()?;
        resolve(&conn, &state.config, &signals)?
    };

    if let Some(ref ctx) = context {
        tracing::debug!(
            "Resolved shop {} via {} for {}",
            ctx.shop_id,
            ctx.source.as_ref(),
            signals.path
        );
    }
    request.extensions_mut().insert(context.clone());

    let mut response = next.run(request).await;

    if let Some(ctx) = context {
        let headers = response.headers_mut();
        if let Ok(v) = HeaderValue::from_str(&ctx.shop_id) {
            headers.insert(SHOP_CONTEXT_HEADER, v);
        }
        if let Some(tenant) = ctx.tenant {
            if let Ok(v) = HeaderValue::from_str(&tenant.id) {
                headers.insert(TENANT_ID_HEADER, v);
            }
            if let Some(v) = tenant
                .subdomain
                .as_deref()
                .and_then(|s| HeaderValue::from_str(s).ok())
            {
                headers.insert(TENANT_SUBDOMAIN_HEADER, v);
            }
        }
    }

    Ok(response)
}
