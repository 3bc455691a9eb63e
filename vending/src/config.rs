//! Configuration management for the vending machine.
//!
//! Loads configuration from `VENDING_*` environment variables with defaults
//! matching a four-lane, five-unit machine, then validates it.

use crate::allocation::{OversizePolicy, RowLayout};
use crate::types::RowId;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use vending_core::document::DocumentPath;
use vending_runtime::retry::RetryPolicy;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable was set but could not be parsed
    #[error("Invalid value '{value}' for {var}: {reason}")]
    Invalid {
        /// Environment variable name
        var: &'static str,
        /// Raw value
        value: String,
        /// Parser message
        reason: String,
    },

    /// The parsed configuration is inconsistent
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Price list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    /// Price of one packet in minor units
    pub price_per_packet_minor: u64,
    /// ISO currency code
    pub currency: String,
}

impl Pricing {
    /// Amount due for `quantity` packets, in minor units
    #[must_use]
    pub const fn quote(&self, quantity: u32) -> u64 {
        self.price_per_packet_minor.saturating_mul(quantity as u64)
    }
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            price_per_packet_minor: 1000,
            currency: "INR".to_string(),
        }
    }
}

/// How much of the audit log the status page shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityWindow {
    /// Entries read from the end of the log
    pub fetch: usize,
    /// Entries shown, newest first
    pub display: usize,
}

impl Default for ActivityWindow {
    fn default() -> Self {
        Self {
            fetch: 20,
            display: 6,
        }
    }
}

/// Vending machine configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendingConfig {
    /// Address of the machine document; the audit log lives at `<path>/logs`
    pub machine_path: DocumentPath,
    /// Lane ids and per-lane capacity
    pub layout: RowLayout,
    /// Handling of orders larger than the machine
    pub oversize_policy: OversizePolicy,
    /// Price list
    pub pricing: Pricing,
    /// Conflicting writes tolerated per machine transaction
    pub max_transaction_retries: usize,
    /// Extra attempts for best-effort status syncs and audit appends
    pub side_channel_retries: usize,
    /// Status page activity feed
    pub activity: ActivityWindow,
    /// Prometheus recorder address; metrics are off when unset
    pub metrics_addr: Option<SocketAddr>,
    /// Default `tracing` filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for VendingConfig {
    fn default() -> Self {
        Self {
            machine_path: DocumentPath::new("vending/machine1"),
            layout: RowLayout::default(),
            oversize_policy: OversizePolicy::Clamp,
            pricing: Pricing::default(),
            max_transaction_retries: 32,
            side_channel_retries: 3,
            activity: ActivityWindow::default(),
            metrics_addr: None,
            log_level: "info,vending_machine=debug".to_string(),
        }
    }
}

impl VendingConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unparseable values and
    /// [`ConfigError::Validation`] for inconsistent ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let row_ids = match lookup("VENDING_ROW_IDS") {
            Some(raw) => parse_row_ids(&raw)?,
            None => defaults.layout.ids().to_vec(),
        };
        let row_capacity = parsed(&lookup, "VENDING_ROW_CAPACITY")?
            .unwrap_or_else(|| defaults.layout.capacity());

        let config = Self {
            machine_path: parsed(&lookup, "VENDING_MACHINE_PATH")?.unwrap_or(defaults.machine_path),
            layout: RowLayout::new(row_ids, row_capacity),
            oversize_policy: parsed(&lookup, "VENDING_OVERSIZE_POLICY")?
                .unwrap_or(defaults.oversize_policy),
            pricing: Pricing {
                price_per_packet_minor: parsed(&lookup, "VENDING_PRICE_PER_PACKET_MINOR")?
                    .unwrap_or(defaults.pricing.price_per_packet_minor),
                currency: lookup("VENDING_CURRENCY").unwrap_or(defaults.pricing.currency),
            },
            max_transaction_retries: parsed(&lookup, "VENDING_MAX_TRANSACTION_RETRIES")?
                .unwrap_or(defaults.max_transaction_retries),
            side_channel_retries: parsed(&lookup, "VENDING_SIDE_CHANNEL_RETRIES")?
                .unwrap_or(defaults.side_channel_retries),
            activity: ActivityWindow {
                fetch: parsed(&lookup, "VENDING_ACTIVITY_WINDOW")?
                    .unwrap_or(defaults.activity.fetch),
                display: defaults.activity.display,
            },
            metrics_addr: parsed(&lookup, "VENDING_METRICS_ADDR")?,
            log_level: lookup("VENDING_LOG_LEVEL").unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ids = self.layout.ids();
        if ids.is_empty() {
            return Err(ConfigError::Validation("at least one row is required".to_string()));
        }
        for (index, id) in ids.iter().enumerate() {
            if ids[..index].contains(id) {
                return Err(ConfigError::Validation(format!("row {id} is listed twice")));
            }
        }
        if self.layout.capacity() == 0 {
            return Err(ConfigError::Validation("row capacity must be positive".to_string()));
        }
        if self.pricing.price_per_packet_minor == 0 {
            return Err(ConfigError::Validation("price per packet must be positive".to_string()));
        }
        if self.pricing.currency.trim().is_empty() {
            return Err(ConfigError::Validation("currency must not be empty".to_string()));
        }
        if self.activity.fetch == 0 {
            return Err(ConfigError::Validation("activity window must be positive".to_string()));
        }
        Ok(())
    }

    /// Retry policy for conflicting writes to the machine document
    #[must_use]
    pub fn transaction_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.max_transaction_retries)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(50))
            .jitter(true)
            .build()
    }

    /// Retry policy for best-effort status syncs and audit appends
    #[must_use]
    pub fn side_channel_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.side_channel_retries)
            .initial_delay(Duration::from_millis(20))
            .max_delay(Duration::from_millis(500))
            .build()
    }

    /// Address of the audit log
    #[must_use]
    pub fn log_path(&self) -> DocumentPath {
        self.machine_path.child("logs")
    }
}

fn parsed<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .map(|value| {
            value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_row_ids(raw: &str) -> Result<Vec<RowId>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<RowId>().map_err(|e| ConfigError::Invalid {
                var: "VENDING_ROW_IDS",
                value: raw.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<VendingConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        VendingConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_describe_four_rows_of_five() {
        let config = load(&[]).unwrap();
        assert_eq!(config.layout.total_capacity(), 20);
        assert_eq!(config.machine_path.as_str(), "vending/machine1");
        assert_eq!(config.log_path().as_str(), "vending/machine1/logs");
        assert_eq!(config.oversize_policy, OversizePolicy::Clamp);
        assert_eq!(config.pricing.quote(3), 3000);
        assert_eq!(config.transaction_policy().max_retries, 32);
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("VENDING_ROW_IDS", "10, 11,12"),
            ("VENDING_ROW_CAPACITY", "8"),
            ("VENDING_OVERSIZE_POLICY", "reject"),
            ("VENDING_METRICS_ADDR", "127.0.0.1:9000"),
            ("VENDING_ACTIVITY_WINDOW", "50"),
        ])
        .unwrap();

        assert_eq!(
            config.layout.ids(),
            &[RowId::new(10), RowId::new(11), RowId::new(12)]
        );
        assert_eq!(config.layout.total_capacity(), 24);
        assert_eq!(config.oversize_policy, OversizePolicy::Reject);
        assert!(config.metrics_addr.is_some());
        assert_eq!(config.activity.fetch, 50);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let error = load(&[("VENDING_ROW_CAPACITY", "five")]).unwrap_err();
        assert!(matches!(error, ConfigError::Invalid { var: "VENDING_ROW_CAPACITY", .. }));
    }

    #[test]
    fn duplicate_rows_are_rejected() {
        let error = load(&[("VENDING_ROW_IDS", "1,2,1")]).unwrap_err();
        assert!(matches!(error, ConfigError::Validation(_)));
    }

    #[test]
    fn empty_machine_path_is_rejected() {
        assert!(load(&[("VENDING_MACHINE_PATH", "//")]).is_err());
    }
}
