//! Prefixed ID generation.
//!
//! All IDs use a `vp_` brand prefix so they never collide with billing
//! provider IDs (`sub_`, `cus_`, `price_`, ...).
//!
//! Format: `vp_{entity}_{uuid_simple}` (32 hex chars, no hyphens)

use uuid::Uuid;

const ALL_PREFIXES: &[&str] = &[
    "vp_shop_", "vp_plan_", "vp_ten_", "vp_sub_", "vp_med_", "vp_usr_", "vp_key_", "vp_evt_",
];

/// Cheap format check to reject garbage before hitting the database.
pub fn is_valid_prefixed_id(s: &str) -> bool {
    let Some(prefix) = ALL_PREFIXES.iter().find(|p| s.starts_with(*p)) else {
        return false;
    };
    let hex_part = &s[prefix.len()..];
    hex_part.len() == 32 && hex_part.chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug, Clone, Copy)]
pub enum EntityType {
    Shop,
    Plan,
    Tenant,
    Subscription,
    Media,
    User,
    ApiKey,
    Event,
}

impl EntityType {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Shop => "vp_shop",
            Self::Plan => "vp_plan",
            Self::Tenant => "vp_ten",
            Self::Subscription => "vp_sub",
            Self::Media => "vp_med",
            Self::User => "vp_usr",
            Self::ApiKey => "vp_key",
            Self::Event => "vp_evt",
        }
    }

    pub fn gen_id(&self) -> String {
        format!("{}_{}", self.prefix(), Uuid::new_v4().as_simple())
    }
}
