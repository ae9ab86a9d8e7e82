//! Settlement configuration.
//!
//! Resolved from an optional JSON file, then `SETTLEMENT_*` environment
//! variables, then defaults. The API token may be a packed connection
//! string carrying the backend URL as well.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::api;

const ENV_BASE_URL: &str = "SETTLEMENT_BASE_URL";
const ENV_API_TOKEN: &str = "SETTLEMENT_API_TOKEN";
const ENV_TIMEOUT_SECS: &str = "SETTLEMENT_TIMEOUT_SECS";
const ENV_DELETE_SETTLED: &str = "SETTLEMENT_DELETE_SETTLED";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config file {path}: {message}")]
    Read { path: String, message: String },
    #[error("parse config file {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("settlement backend not configured: missing {0}")]
    Missing(&'static str),
}

/// Path templates for the backend collections. Item paths are the
/// collection path followed by `{id}/`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub orders: String,
    pub tables: String,
    pub zones: String,
    pub ledgers: String,
    pub ledger_entries: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            orders: "/cafe/orders/".into(),
            tables: "/cafe/tables/".into(),
            zones: "/cafe/zones/".into(),
            ledgers: "/construction/cashboxes/".into(),
            ledger_entries: "/construction/cashflows/".into(),
        }
    }
}

impl Endpoints {
    pub fn order(&self, id: &str) -> String {
        format!("{}{id}/", self.orders)
    }

    pub fn table(&self, id: &str) -> String {
        format!("{}{id}/", self.tables)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub base_url: String,
    pub api_token: String,
    pub request_timeout_secs: u64,
    /// Delete transactions from the backend once they are marked settled.
    pub delete_settled: bool,
    /// Consecutive failed calls after which a cached variant is evicted.
    pub cached_variant_failure_limit: u32,
    pub ledger_label_prefix: String,
    pub endpoints: Endpoints,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_token: String::new(),
            request_timeout_secs: api::DEFAULT_TIMEOUT.as_secs(),
            delete_settled: true,
            cached_variant_failure_limit: 3,
            ledger_label_prefix: "Payment table".into(),
            endpoints: Endpoints::default(),
        }
    }
}

impl SettlementConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Overlay `SETTLEMENT_*` environment variables.
    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = std::env::var(ENV_BASE_URL) {
            if !url.trim().is_empty() {
                self.base_url = url;
            }
        }
        if let Ok(token) = std::env::var(ENV_API_TOKEN) {
            if !token.trim().is_empty() {
                self.api_token = token;
            }
        }
        if let Ok(raw) = std::env::var(ENV_TIMEOUT_SECS) {
            self.request_timeout_secs =
                raw.trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: ENV_TIMEOUT_SECS,
                        value: raw.clone(),
                    })?;
        }
        if let Ok(raw) = std::env::var(ENV_DELETE_SETTLED) {
            self.delete_settled = match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: ENV_DELETE_SETTLED,
                        value: raw,
                    })
                }
            };
        }
        Ok(())
    }

    /// Unpack a connection string in the token slot and normalise the URL.
    fn resolve_connection(&mut self) {
        let raw = self.api_token.clone();
        if let Some(token) = api::extract_api_token_from_connection_string(&raw) {
            self.api_token = token;
            if self.base_url.trim().is_empty() {
                if let Some(url) = api::extract_base_url_from_connection_string(&raw) {
                    self.base_url = url;
                }
            }
        }
        self.base_url = api::normalize_admin_url(&self.base_url);
        self.api_token = self.api_token.trim().to_string();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.is_empty() {
            return Err(ConfigError::Missing("base URL"));
        }
        if self.api_token.is_empty() {
            return Err(ConfigError::Missing("API token"));
        }
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<SettlementConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Load configuration: file (if given) → environment → defaults.
pub fn load(file: Option<&Path>) -> Result<SettlementConfig, ConfigError> {
    let mut config = match file {
        Some(path) => read_file(path)?,
        None => SettlementConfig::default(),
    };
    config.apply_env()?;
    config.resolve_connection();
    config.validate()?;
    info!(
        base_url = %config.base_url,
        delete_settled = config.delete_settled,
        "settlement config loaded"
    );
    Ok(config)
}
