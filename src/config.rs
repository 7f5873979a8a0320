//! Runtime configuration assembled from `PAYRECON_*` environment variables.
//!
//! Nested keys use `__`: `PAYRECON_RETRY__MAX_RETRIES`,
//! `PAYRECON_CARD_WALLET__BASE_URL`. A provider is enabled by setting its
//! section; its credentials are then mandatory.

use crate::error::{PaymentError, Result};
use ::config::{Config, Environment, Map};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PAYRECON";

/// Connection and webhook settings for one provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub webhook_secret: String,
    /// Deadline for every outbound call.
    pub timeout: Duration,
    /// Tokens are refreshed once less than this remains before expiry.
    pub token_refresh_margin: Duration,
    /// Maximum age of a signed webhook timestamp.
    pub webhook_tolerance: Duration,
}

impl ProviderConfig {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            webhook_secret: webhook_secret.into(),
            timeout: Duration::from_millis(default_timeout_ms()),
            token_refresh_margin: Duration::from_secs(default_token_margin_secs()),
            webhook_tolerance: Duration::from_secs(default_webhook_tolerance_secs()),
        }
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the token refresh margin.
    pub fn with_token_refresh_margin(mut self, margin: Duration) -> Self {
        self.token_refresh_margin = margin;
        self
    }

    /// Set the webhook timestamp tolerance.
    pub fn with_webhook_tolerance(mut self, tolerance: Duration) -> Self {
        self.webhook_tolerance = tolerance;
        self
    }
}

/// Bounded exponential backoff for transient provider and store errors.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Retries after the first attempt.
    pub max_retries: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetrySection::default().into()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Externally reachable base URL, used to build provider callback URLs.
    pub public_base_url: String,
    pub card_wallet: Option<ProviderConfig>,
    pub mobile_money: Option<ProviderConfig>,
    pub retry: RetryConfig,
    pub sweep_interval: Duration,
    /// Pending payments younger than this are left to their webhooks.
    pub sweep_min_age: Duration,
    pub notify_url: Option<String>,
}

fn default_timeout_ms() -> u64 {
    15_000
}

fn default_token_margin_secs() -> u64 {
    30 * 60
}

fn default_webhook_tolerance_secs() -> u64 {
    5 * 60
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// `PAYRECON_<PROVIDER>__*`
#[derive(Debug, Deserialize)]
struct ProviderSection {
    base_url: String,
    client_id: String,
    client_secret: String,
    webhook_secret: String,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default = "default_token_margin_secs")]
    token_margin_secs: u64,
    #[serde(default = "default_webhook_tolerance_secs")]
    webhook_tolerance_secs: u64,
}

impl From<ProviderSection> for ProviderConfig {
    fn from(section: ProviderSection) -> Self {
        ProviderConfig::new(
            section.base_url,
            section.client_id,
            section.client_secret,
            section.webhook_secret,
        )
        .with_timeout(Duration::from_millis(section.timeout_ms))
        .with_token_refresh_margin(Duration::from_secs(section.token_margin_secs))
        .with_webhook_tolerance(Duration::from_secs(section.webhook_tolerance_secs))
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RetrySection {
    min_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: usize,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 5_000,
            max_retries: 4,
        }
    }
}

impl From<RetrySection> for RetryConfig {
    fn from(section: RetrySection) -> Self {
        Self {
            min_delay: Duration::from_millis(section.min_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
            max_retries: section.max_retries,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SweepSection {
    interval_secs: u64,
    min_age_secs: u64,
}

impl Default for SweepSection {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            min_age_secs: 600,
        }
    }
}

/// Raw shape of the `PAYRECON_*` keys.
#[derive(Debug, Deserialize)]
struct Settings {
    #[serde(default = "default_bind")]
    bind: SocketAddr,
    #[serde(default)]
    public_url: Option<String>,
    #[serde(default)]
    notify_url: Option<String>,
    #[serde(default)]
    card_wallet: Option<ProviderSection>,
    #[serde(default)]
    mobile_money: Option<ProviderSection>,
    #[serde(default)]
    retry: RetrySection,
    #[serde(default)]
    sweep: SweepSection,
}

fn environment() -> Environment {
    Environment::with_prefix(CONFIG_ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl AppConfig {
    /// Create config from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_environment(environment())
    }

    /// Create config from an explicit variable map instead of the process
    /// environment.
    pub fn from_vars(vars: Map<String, String>) -> Result<Self> {
        Self::from_environment(environment().source(Some(vars)))
    }

    fn from_environment(source: Environment) -> Result<Self> {
        let invalid = |e: ::config::ConfigError| PaymentError::Config(e.to_string());
        let settings: Settings = Config::builder()
            .add_source(source)
            .build()
            .map_err(invalid)?
            .try_deserialize()
            .map_err(invalid)?;
        settings.try_into()
    }
}

impl TryFrom<Settings> for AppConfig {
    type Error = PaymentError;

    fn try_from(settings: Settings) -> Result<Self> {
        let retry = RetryConfig::from(settings.retry);
        if retry.min_delay > retry.max_delay {
            return Err(PaymentError::Config(
                "retry min delay exceeds max delay".to_string(),
            ));
        }
        let public_base_url = settings
            .public_url
            .unwrap_or_else(|| format!("http://{}", settings.bind))
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            bind_addr: settings.bind,
            public_base_url,
            card_wallet: settings.card_wallet.map(ProviderConfig::from),
            mobile_money: settings.mobile_money.map(ProviderConfig::from),
            retry,
            sweep_interval: Duration::from_secs(settings.sweep.interval_secs),
            sweep_min_age: Duration::from_secs(settings.sweep.min_age_secs),
            notify_url: settings.notify_url,
        })
    }
}
