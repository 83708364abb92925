use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use crate::error::{AppError, Result};

pub const SUBDOMAIN_MIN_LEN: usize = 3;
pub const SUBDOMAIN_MAX_LEN: usize = 32;

/// Labels that can never be claimed by a tenant.
pub const RESERVED_SUBDOMAINS: &[&str] = &[
    "www", "api", "admin", "app", "mail", "ftp", "smtp", "support", "help", "blog", "shop",
    "store",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Tier {
    Free,
    Starter,
    Growth,
    Enterprise,
}

/// A premium shop's subdomain routing identity. One per shop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub shop_id: String,
    pub subdomain: Option<String>,
    pub tier: Tier,
    pub premium_since: Option<i64>,
    pub premium_expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Check a subdomain label against the naming rules.
pub fn validate_subdomain(label: &str) -> Result<()> {
    if label.len() < SUBDOMAIN_MIN_LEN || label.len() > SUBDOMAIN_MAX_LEN {
        return Err(AppError::BadRequest(format!(
            "Subdomain must be between {} and {} characters",
            SUBDOMAIN_MIN_LEN, SUBDOMAIN_MAX_LEN
        )));
    }
    if !label
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(AppError::BadRequest(
            "Subdomain may only contain lowercase letters, digits and hyphens".into(),
        ));
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err(AppError::BadRequest(
            "Subdomain cannot start or end with a hyphen".into(),
        ));
    }
    if RESERVED_SUBDOMAINS.contains(&label) {
        return Err(AppError::BadRequest(format!("Subdomain '{}' is reserved", label)));
    }
    Ok(())
}

/// Derive a subdomain base from a shop name.
///
/// Lowercases, turns whitespace into hyphens and drops everything outside
/// `[a-z0-9-]`. The result is trimmed to the maximum label length and padded
/// when too short, so it always passes the length rule.
pub fn subdomain_base(shop_name: &str) -> String {
    let mut slug = String::with_capacity(shop_name.len());
    for c in shop_name.trim().to_lowercase().chars() {
        if c.is_whitespace() {
            if !slug.ends_with('-') {
                slug.push('-');
            }
        } else if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            slug.push(c);
        }
    }
    let mut slug = slug.trim_matches('-').to_string();
    // Leave room for a numeric suffix.
    slug.truncate(SUBDOMAIN_MAX_LEN - 4);
    let slug = slug.trim_end_matches('-').to_string();
    if slug.len() < SUBDOMAIN_MIN_LEN || RESERVED_SUBDOMAINS.contains(&slug.as_str()) {
        format!("{}-shop", if slug.is_empty() { "my" } else { &slug })
    } else {
        slug
    }
}

/// The n-th candidate for a base: `base`, `base-1`, `base-2`, ...
pub fn subdomain_candidate(base: &str, attempt: u32) -> String {
    if attempt == 0 {
        base.to_string()
    } else {
        format!("{}-{}", base, attempt)
    }
}
