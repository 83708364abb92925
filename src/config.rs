use std::env;
use std::str::FromStr;

use strum::{AsRefStr, EnumString};

use crate::models::ResourceKind;

/// Proration mode passed to the billing provider on a price change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ProrationBehavior {
    AlwaysInvoice,
    CreateProrations,
    None,
}

/// When a downgrade takes effect from the customer's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString, serde::Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DowngradeTiming {
    Immediate,
    EndOfPeriod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum EnforcementMode {
    /// Deny the action once the limit is reached.
    Hard,
    /// Never deny; only raise threshold events.
    Soft,
}

/// Per-resource warning thresholds, in percent of the plan limit.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub products: f64,
    pub orders: f64,
    pub storage: f64,
}

impl Thresholds {
    pub fn for_resource(&self, resource: ResourceKind) -> f64 {
        match resource {
            ResourceKind::Products => self.products,
            ResourceKind::Orders => self.orders,
            ResourceKind::Storage => self.storage,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            products: 80.0,
            orders: 90.0,
            storage: 85.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub base_url: String,
    /// Root domain tenant subdomains hang off (e.g. `johns-shop.{app_domain}`).
    pub app_domain: String,
    /// Hosts that always mean marketplace mode, never a tenant.
    pub central_domains: Vec<String>,
    /// Path prefixes on which the authenticated vendor's shop is a tenant signal.
    pub vendor_path_prefixes: Vec<String>,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub gateway_timeout_secs: u64,
    pub upgrade_proration: ProrationBehavior,
    pub downgrade_proration: ProrationBehavior,
    pub downgrade_timing: DowngradeTiming,
    pub enforcement: EnforcementMode,
    pub thresholds: Thresholds,
    pub notify_webhook_url: Option<String>,
    /// Seconds between maintenance scheduler ticks.
    pub maintenance_interval_secs: u64,
    pub dev_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            database_path: "vendorplan.db".to_string(),
            base_url: "http://127.0.0.1:3000".to_string(),
            app_domain: "localhost".to_string(),
            central_domains: vec!["localhost".to_string(), "127.0.0.1".to_string()],
            vendor_path_prefixes: default_vendor_prefixes(),
            stripe_secret_key: None,
            stripe_webhook_secret: None,
            gateway_timeout_secs: 10,
            upgrade_proration: ProrationBehavior::AlwaysInvoice,
            downgrade_proration: ProrationBehavior::CreateProrations,
            downgrade_timing: DowngradeTiming::EndOfPeriod,
            enforcement: EnforcementMode::Hard,
            thresholds: Thresholds::default(),
            notify_webhook_url: None,
            maintenance_interval_secs: 60 * 60,
            dev_mode: false,
        }
    }
}

fn default_vendor_prefixes() -> Vec<String> {
    ["/vendor/", "/seller/", "/shop/dashboard", "/api/vendor/"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn list_var(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid value for {}: {:?}", name, raw);
            default
        }),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let dev_mode = env::var("VENDORPLAN_ENV")
            .map(|v| v == "dev" || v == "development")
            .unwrap_or(false);

        let host = env::var("HOST").unwrap_or(defaults.host);
        let port: u16 = parsed_var("PORT", defaults.port);

        let base_url = env::var("BASE_URL")
            .unwrap_or_else(|_| format!("http://{}:{}", host, port));

        let app_domain = env::var("APP_DOMAIN")
            .map(|d| d.trim().to_lowercase())
            .unwrap_or(defaults.app_domain);

        let mut central_domains = list_var("CENTRAL_DOMAINS").unwrap_or(defaults.central_domains);
        if !central_domains.contains(&app_domain) {
            central_domains.push(app_domain.clone());
        }

        let thresholds = Thresholds {
            products: parsed_var("THRESHOLD_PRODUCTS", defaults.thresholds.products),
            orders: parsed_var("THRESHOLD_ORDERS", defaults.thresholds.orders),
            storage: parsed_var("THRESHOLD_STORAGE", defaults.thresholds.storage),
        };

        Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH").unwrap_or(defaults.database_path),
            base_url,
            app_domain,
            central_domains,
            vendor_path_prefixes: list_var("VENDOR_PATH_PREFIXES")
                .unwrap_or(defaults.vendor_path_prefixes),
            stripe_secret_key: env::var("STRIPE_SECRET_KEY").ok(),
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET").ok(),
            gateway_timeout_secs: parsed_var("GATEWAY_TIMEOUT_SECS", defaults.gateway_timeout_secs),
            upgrade_proration: parsed_var("UPGRADE_PRORATION", defaults.upgrade_proration),
            downgrade_proration: parsed_var("DOWNGRADE_PRORATION", defaults.downgrade_proration),
            downgrade_timing: parsed_var("DOWNGRADE_TIMING", defaults.downgrade_timing),
            enforcement: parsed_var("QUOTA_ENFORCEMENT", defaults.enforcement),
            thresholds,
            notify_webhook_url: env::var("NOTIFY_WEBHOOK_URL").ok(),
            maintenance_interval_secs: parsed_var(
                "MAINTENANCE_INTERVAL_SECS",
                defaults.maintenance_interval_secs,
            ),
            dev_mode,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Where quota denials point the vendor.
    pub fn upgrade_url(&self) -> String {
        format!("{}/vendor/subscription/plans", self.base_url)
    }

    pub fn billing_return_url(&self) -> String {
        format!("{}/vendor/subscription", self.base_url)
    }
}
