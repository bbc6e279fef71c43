//! Portal configuration.
//!
//! Settings come from an optional TOML file (path in `MEMBERSHIP_CONFIG`),
//! then environment overrides. Secrets are only ever read from the
//! environment and are held in [`Zeroizing`] buffers.
//!
//! ```toml
//! bind_addr = "0.0.0.0:3000"
//! currency = "usd"
//!
//! [gateway]
//! mode = "stripe"
//! timeout_secs = 10
//!
//! [gateway.stripe]
//! api_base = "https://api.stripe.com"
//!
//! [webhook]
//! tolerance_secs = 300
//!
//! [rate_limit]
//! requests_per_second = 10
//! burst_size = 5
//!
//! [[plans]]
//! name = "Monthly Membership"
//! type = "monthly"
//! price = "9.99"
//! validity_days = 30
//! ```
//!
//! | Variable | Overrides |
//! |---|---|
//! | `MEMBERSHIP_BIND_ADDR` | `bind_addr` |
//! | `MEMBERSHIP_GATEWAY_MODE` | `gateway.mode` |
//! | `STRIPE_SECRET_KEY` | provider secret key |
//! | `STRIPE_WEBHOOK_SECRET` | webhook signing secret |

use std::{fmt, net::SocketAddr, path::Path, time::Duration};

use serde::Deserialize;
use zeroize::Zeroizing;

use crate::{
    catalog::{PlanCatalog, PlanSeed},
    error::{PortalError, Result},
    gateway::StripeConfig,
    security::RateLimitConfig,
};

/// Environment variable naming the TOML config file.
pub const CONFIG_PATH_ENV: &str = "MEMBERSHIP_CONFIG";

/// Which billing gateway to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayMode {
    /// In-process fake; no network calls.
    #[default]
    Sandbox,
    /// Live Stripe REST API.
    Stripe,
}

impl GatewayMode {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sandbox" => Ok(Self::Sandbox),
            "stripe" => Ok(Self::Stripe),
            other => Err(PortalError::Config(format!("unknown gateway mode '{other}'"))),
        }
    }
}

/// `[gateway]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway implementation.
    pub mode: GatewayMode,
    /// Bound on each gateway call, in seconds.
    pub timeout_secs: u64,
    /// Stripe connection settings.
    pub stripe: StripeConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { mode: GatewayMode::Sandbox, timeout_secs: 10, stripe: StripeConfig::default() }
    }
}

impl GatewayConfig {
    /// Returns the per-call timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// `[webhook]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Maximum accepted age of a signed delivery, in seconds.
    pub tolerance_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self { tolerance_secs: 300 }
    }
}

/// Root configuration.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// Listen address of the HTTP server.
    pub bind_addr: SocketAddr,
    /// ISO 4217 currency code for every charge.
    pub currency: String,
    /// Billing gateway settings.
    pub gateway: GatewayConfig,
    /// Webhook settings.
    pub webhook: WebhookConfig,
    /// Limits on mutating routes.
    pub rate_limit: RateLimitConfig,
    /// Plan catalog override; the built-in plans are used when empty.
    pub plans: Vec<PlanSeed>,
    /// Provider secret key; environment only.
    #[serde(skip)]
    pub stripe_secret_key: Option<Zeroizing<String>>,
    /// Webhook signing secret; environment only.
    #[serde(skip)]
    pub webhook_secret: Option<Zeroizing<String>>,
}

impl fmt::Debug for PortalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let present = |secret: &Option<Zeroizing<String>>| secret.as_ref().map(|_| "<redacted>");
        f.debug_struct("PortalConfig")
            .field("bind_addr", &self.bind_addr)
            .field("currency", &self.currency)
            .field("gateway", &self.gateway)
            .field("webhook", &self.webhook)
            .field("rate_limit", &self.rate_limit)
            .field("plans", &self.plans.len())
            .field("stripe_secret_key", &present(&self.stripe_secret_key))
            .field("webhook_secret", &present(&self.webhook_secret))
            .finish()
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            currency: "usd".to_owned(),
            gateway: GatewayConfig::default(),
            webhook: WebhookConfig::default(),
            rate_limit: RateLimitConfig::default(),
            plans: Vec::new(),
            stripe_secret_key: None,
            webhook_secret: None,
        }
    }
}

impl PortalConfig {
    /// Loads from `MEMBERSHIP_CONFIG` (if set) and the process environment,
    /// then validates.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::Config`] if the file cannot be read or parsed,
    /// an override is malformed, or validation fails.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML file without applying overrides or validating.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::Config`] on I/O or parse failure.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PortalError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parses TOML text without applying overrides or validating.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::Config`] on parse failure.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| PortalError::Config(e.to_string()))
    }

    /// Applies environment overrides read through `lookup`.
    ///
    /// Empty values are treated as unset.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::Config`] if an override cannot be parsed.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(addr) = lookup("MEMBERSHIP_BIND_ADDR") {
            self.bind_addr = addr
                .parse()
                .map_err(|e| PortalError::Config(format!("MEMBERSHIP_BIND_ADDR: {e}")))?;
        }
        if let Some(mode) = lookup("MEMBERSHIP_GATEWAY_MODE") {
            self.gateway.mode = GatewayMode::parse(&mode)?;
        }
        if let Some(key) = lookup("STRIPE_SECRET_KEY") {
            self.stripe_secret_key = Some(Zeroizing::new(key));
        }
        if let Some(secret) = lookup("STRIPE_WEBHOOK_SECRET") {
            self.webhook_secret = Some(Zeroizing::new(secret));
        }
        Ok(())
    }

    /// Checks bounds and cross-field requirements.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(PortalError::Config(format!(
                "currency must be a 3-letter ISO code, got '{}'",
                self.currency
            )));
        }
        if self.gateway.timeout_secs == 0 || self.gateway.timeout_secs > 300 {
            return Err(PortalError::Config(
                "gateway.timeout_secs must be between 1 and 300".to_owned(),
            ));
        }
        if self.webhook.tolerance_secs == 0 || self.webhook.tolerance_secs > 3600 {
            return Err(PortalError::Config(
                "webhook.tolerance_secs must be between 1 and 3600".to_owned(),
            ));
        }
        if self.rate_limit.requests_per_second == 0 || self.rate_limit.burst_size == 0 {
            return Err(PortalError::Config(
                "rate_limit values must be greater than zero".to_owned(),
            ));
        }
        if self.gateway.mode == GatewayMode::Stripe {
            self.gateway.stripe.validate()?;
            if self.stripe_secret_key.is_none() {
                return Err(PortalError::Config(
                    "STRIPE_SECRET_KEY is required in stripe mode".to_owned(),
                ));
            }
        }
        Ok(())
    }

    /// Builds the plan catalog, falling back to the built-in plans.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::Config`] if a configured plan is invalid.
    pub fn catalog(&self) -> Result<PlanCatalog> {
        if self.plans.is_empty() {
            return Ok(PlanCatalog::seeded());
        }
        PlanCatalog::from_seeds(self.plans.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_validate() {
        let config = PortalConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gateway.mode, GatewayMode::Sandbox);
        assert_eq!(config.gateway.timeout(), Duration::from_secs(10));
        assert_eq!(config.catalog().unwrap(), PlanCatalog::seeded());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = PortalConfig::from_toml(
            r#"
            bind_addr = "127.0.0.1:8080"

            [gateway]
            mode = "stripe"
            timeout_secs = 5

            [rate_limit]
            burst_size = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.gateway.mode, GatewayMode::Stripe);
        assert_eq!(config.gateway.stripe, StripeConfig::default());
        assert_eq!(config.rate_limit.burst_size, 20);
        assert_eq!(config.rate_limit.requests_per_second, 10);
        assert_eq!(config.currency, "usd");
    }

    #[test]
    fn test_secrets_are_not_read_from_file() {
        let config = PortalConfig::from_toml(r#"stripe_secret_key = "sk_live_oops""#);
        // Unknown keys are ignored, so the key parses but stays unset.
        assert!(config.unwrap().stripe_secret_key.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = PortalConfig::default();
        config
            .apply_env(env(&[
                ("MEMBERSHIP_BIND_ADDR", "127.0.0.1:9000"),
                ("MEMBERSHIP_GATEWAY_MODE", "Stripe"),
                ("STRIPE_SECRET_KEY", "sk_test_123"),
                ("STRIPE_WEBHOOK_SECRET", ""),
            ]))
            .unwrap();

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.gateway.mode, GatewayMode::Stripe);
        assert_eq!(config.stripe_secret_key.as_deref().map(String::as_str), Some("sk_test_123"));
        assert!(config.webhook_secret.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_rejects_bad_values() {
        let mut config = PortalConfig::default();
        assert!(config.apply_env(env(&[("MEMBERSHIP_BIND_ADDR", "nowhere")])).is_err());
        assert!(config.apply_env(env(&[("MEMBERSHIP_GATEWAY_MODE", "paypal")])).is_err());
    }

    #[test]
    fn test_stripe_mode_requires_secret() {
        let config = PortalConfig {
            gateway: GatewayConfig { mode: GatewayMode::Stripe, ..GatewayConfig::default() },
            ..PortalConfig::default()
        };
        assert!(matches!(config.validate(), Err(PortalError::Config(_))));
    }

    #[test]
    fn test_validate_bounds() {
        let bad_currency = PortalConfig { currency: "dollars".into(), ..PortalConfig::default() };
        let bad_timeout = PortalConfig {
            gateway: GatewayConfig { timeout_secs: 0, ..GatewayConfig::default() },
            ..PortalConfig::default()
        };
        let bad_rate = PortalConfig {
            rate_limit: RateLimitConfig { requests_per_second: 0, burst_size: 1 },
            ..PortalConfig::default()
        };

        for config in [bad_currency, bad_timeout, bad_rate] {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_plans_override_catalog() {
        let config = PortalConfig::from_toml(
            r#"
            [[plans]]
            name = "Weekly"
            type = "monthly"
            price = "2.50"
            validity_days = 7
            "#,
        )
        .unwrap();

        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.list_plans().len(), 1);
        assert_eq!(catalog.list_plans()[0].validity_days, 7);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = PortalConfig {
            stripe_secret_key: Some(Zeroizing::new("sk_test_secret".into())),
            ..PortalConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk_test_secret"));
        assert!(debug.contains("<redacted>"));
    }
}
