//! Engine configuration.
//!
//! Loads configuration from a TOML file with support for environment variable
//! expansion in string values. Variables use `$VAR` or `${VAR}` syntax.
//!
//! # Example Configuration
//!
//! ```toml
//! facilitators = ["https://facilitator.example", "https://backup.example"]
//! preferred_network = "aptos:2"
//! flow_ttl_secs = 600
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 1000
//!
//! [manager.circuit_breaker]
//! failure_threshold = 5
//! reset_timeout_ms = 60000
//!
//! [budget]
//! daily_budget = "100"
//! max_payment_amount = "10"
//!
//! [receipts]
//! secret = "$RECEIPT_SECRET"
//! ```
//!
//! # Environment Variables
//!
//! - `R402_FLOW_CONFIG` - Path to configuration file (default: `r402-flow.toml`)
//! - `R402_FACILITATORS` - Comma-separated facilitator URLs, replacing the file's list
//! - `R402_DAILY_BUDGET` - Override the daily budget
//! - Secrets referenced by `$VAR` in the config file
//!
//! A `.env` file in the working directory is read first.

use std::path::Path;
use std::time::Duration;

use r402_http::HttpError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};

use crate::budget::BudgetConfig;
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::manager::FacilitatorManagerConfig;
use crate::monitor::MonitorConfig;
use crate::receipt::ReceiptConfig;
use crate::retry::RetryConfig;

/// Env var naming the config file.
pub const CONFIG_PATH_ENV: &str = "R402_FLOW_CONFIG";
/// Default config file name.
pub const DEFAULT_CONFIG_PATH: &str = "r402-flow.toml";
/// Env var overriding the facilitator list.
pub const FACILITATORS_ENV: &str = "R402_FACILITATORS";
/// Env var overriding the daily budget.
pub const DAILY_BUDGET_ENV: &str = "R402_DAILY_BUDGET";

/// Errors raised while loading configuration or building the engine from it.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`FlowConfig`].
    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
    /// A value is out of range or missing.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// A facilitator client could not be built.
    #[error(transparent)]
    Facilitator(#[from] HttpError),
}

/// Top-level engine configuration.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Facilitator base URLs, highest priority first.
    pub facilitators: Vec<String>,
    /// Network to prefer when a challenge offers several.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_network: Option<String>,
    /// Per-request timeout for facilitator HTTP calls.
    #[serde(rename = "request_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    /// How long an unfinished flow is kept.
    #[serde(rename = "flow_ttl_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub flow_ttl: Duration,
    /// Events buffered per subscriber.
    pub event_capacity: usize,
    /// Retry bounds for verify and settle.
    pub retry: RetryConfig,
    /// Failover and circuit breaking.
    pub manager: FacilitatorManagerConfig,
    /// Transaction confirmation polling.
    pub monitor: MonitorConfig,
    /// Spending limits.
    pub budget: BudgetConfig,
    /// Receipt store and signing key.
    pub receipts: ReceiptConfig,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            facilitators: Vec::new(),
            preferred_network: None,
            request_timeout: Duration::from_secs(30),
            flow_ttl: Duration::from_secs(600),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            retry: RetryConfig::default(),
            manager: FacilitatorManagerConfig::default(),
            monitor: MonitorConfig::default(),
            budget: BudgetConfig::default(),
            receipts: ReceiptConfig::default(),
        }
    }
}

impl FlowConfig {
    /// Loads configuration from the path in `R402_FLOW_CONFIG`, falling back
    /// to `r402-flow.toml` in the current directory.
    ///
    /// A `.env` file is loaded first. `$VAR` / `${VAR}` references are
    /// expanded and `R402_FACILITATORS` / `R402_DAILY_BUDGET` override the
    /// file values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
        Self::load_from(&path)
    }

    /// Loads configuration from a specific file path. A missing file yields
    /// the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let content = if Path::new(path).exists() {
            std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_owned(),
                source,
            })?
        } else {
            String::new()
        };
        Self::parse_with(&content, |name| std::env::var(name).ok())
    }

    /// Parses TOML, resolving variables and overrides through `lookup`.
    fn parse_with<F>(content: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let expanded = expand_env_vars(content, &lookup);
        let mut config: Self = toml::from_str(&expanded)?;

        if let Some(list) = lookup(FACILITATORS_ENV) {
            config.facilitators = list
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(budget) = lookup(DAILY_BUDGET_ENV) {
            config.budget.daily_budget = budget.trim().parse::<Decimal>().map_err(|e| {
                ConfigError::Invalid(format!("{DAILY_BUDGET_ENV}={budget}: {e}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.budget.daily_budget.is_sign_negative() {
            return Err(ConfigError::Invalid(
                "budget.daily_budget must not be negative".to_owned(),
            ));
        }
        if self.budget.max_payment_amount.is_sign_negative() {
            return Err(ConfigError::Invalid(
                "budget.max_payment_amount must not be negative".to_owned(),
            ));
        }
        if self.manager.max_errors == 0 {
            return Err(ConfigError::Invalid(
                "manager.max_errors must be at least 1".to_owned(),
            ));
        }
        if self.manager.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "manager.circuit_breaker.failure_threshold must be at least 1".to_owned(),
            ));
        }
        if self.monitor.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "monitor.poll_interval_ms must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    /// Replaces the facilitator list.
    #[must_use]
    pub fn with_facilitators<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.facilitators = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the preferred network.
    #[must_use]
    pub fn with_preferred_network(mut self, network: impl Into<String>) -> Self {
        self.preferred_network = Some(network.into());
        self
    }

    /// Sets the retry bounds.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets failover and breaker tuning.
    #[must_use]
    pub const fn with_manager(mut self, manager: FacilitatorManagerConfig) -> Self {
        self.manager = manager;
        self
    }

    /// Sets the monitor bounds.
    #[must_use]
    pub const fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Sets the spending limits.
    #[must_use]
    pub const fn with_budget(mut self, budget: BudgetConfig) -> Self {
        self.budget = budget;
        self
    }

    /// Sets the receipt signing key.
    #[must_use]
    pub fn with_receipt_secret(mut self, secret: impl Into<String>) -> Self {
        self.receipts.secret = Some(secret.into());
        self
    }

    /// Sets how long unfinished flows are kept.
    #[must_use]
    pub const fn with_flow_ttl(mut self, ttl: Duration) -> Self {
        self.flow_ttl = ttl;
        self
    }
}

/// Expands `$VAR` and `${VAR}` patterns using `lookup`.
///
/// Unresolved variables are left as-is.
fn expand_env_vars<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }

        let braced = chars.next_if_eq(&'{').is_some();
        let mut var_name = String::new();
        let mut closed = false;
        while let Some(&c) = chars.peek() {
            if braced {
                if c == '}' {
                    chars.next();
                    closed = true;
                    break;
                }
            } else if !c.is_ascii_alphanumeric() && c != '_' {
                break;
            }
            var_name.push(c);
            chars.next();
        }

        match lookup(&var_name).filter(|_| !var_name.is_empty()) {
            Some(value) => result.push_str(&value),
            None => {
                result.push('$');
                if braced {
                    result.push('{');
                }
                result.push_str(&var_name);
                if closed {
                    result.push('}');
                }
            }
        }
    }

    result
}
