//! Bridge configuration.
//!
//! Configuration sources, in priority order:
//! 1. Environment variables (see [`env_vars`])
//! 2. An explicit TOML file, or `hubsync.toml` in the working directory
//! 3. Built-in defaults
//!
//! Every section is `#[serde(default)]`, so a partial file is valid.
//!
//! ```toml
//! [account]
//! app_key = "..."
//! app_token = "..."
//! user_id = "..."
//! user_token = "..."
//! region = "cn2"
//!
//! [dispatch]
//! max_retries = 3
//!
//! [[mapping.overrides]]
//! device_type = "SL_SC_THL"
//! io = "T"
//! role = "temperature"
//! unit = "°C"
//! rule = "tenths"
//! ```

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "hubsync.toml";

/// Environment variable names.
pub mod env_vars {
    pub const APP_KEY: &str = "HUBSYNC_APP_KEY";
    pub const APP_TOKEN: &str = "HUBSYNC_APP_TOKEN";
    pub const USER_ID: &str = "HUBSYNC_USER_ID";
    pub const USER_TOKEN: &str = "HUBSYNC_USER_TOKEN";
    pub const REGION: &str = "HUBSYNC_REGION";
    pub const MAX_IN_FLIGHT: &str = "HUBSYNC_MAX_IN_FLIGHT";
    pub const LOG_JSON: &str = "HUBSYNC_LOG_JSON";
}

/// Cloud region. Selects the REST and push-stream endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    /// Let the global endpoint route the account.
    #[default]
    Auto,
    Cn0,
    Cn1,
    Cn2,
    Us,
    Eu,
    Jp,
    Apz,
}

impl Region {
    fn host(&self) -> &'static str {
        match self {
            Region::Auto => "api.ilifesmart.com",
            Region::Cn0 => "api.cn0.ilifesmart.com",
            Region::Cn1 => "api.cn1.ilifesmart.com",
            Region::Cn2 => "api.cn2.ilifesmart.com",
            Region::Us => "api.us.ilifesmart.com",
            Region::Eu => "api.eur.ilifesmart.com",
            Region::Jp => "api.jp.ilifesmart.com",
            Region::Apz => "api.apz.ilifesmart.com",
        }
    }

    /// REST base URL for this region.
    pub fn api_base_url(&self) -> String {
        format!("https://{}/app", self.host())
    }

    /// Push stream URL for this region.
    pub fn stream_url(&self) -> String {
        format!("wss://{}:8443/wsapp/", self.host())
    }
}

impl FromStr for Region {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Region::Auto),
            "cn0" => Ok(Region::Cn0),
            "cn1" => Ok(Region::Cn1),
            "cn2" => Ok(Region::Cn2),
            "us" => Ok(Region::Us),
            "eu" | "eur" => Ok(Region::Eu),
            "jp" => Ok(Region::Jp),
            "apz" => Ok(Region::Apz),
            other => Err(Error::config(format!("unknown region '{}'", other))),
        }
    }
}

/// Account credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub app_key: String,
    pub app_token: String,
    pub user_id: String,
    pub user_token: String,
    pub region: Region,
}

impl AccountConfig {
    /// Whether all credential fields are present.
    pub fn is_complete(&self) -> bool {
        !self.app_key.is_empty()
            && !self.app_token.is_empty()
            && !self.user_id.is_empty()
            && !self.user_token.is_empty()
    }
}

/// REST API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Overrides the region-derived base URL.
    pub base_url: Option<String>,
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Global bound on concurrently in-flight REST calls.
    pub max_in_flight: usize,
    /// Call-site retries for transport failures.
    pub transport_retries: u32,
    /// Accepted clock skew for signed requests.
    pub signature_tolerance_secs: i64,
    /// Default snapshot degree (0..=3).
    pub snapshot_degree: u8,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: 10,
            max_in_flight: 8,
            transport_retries: 2,
            signature_tolerance_secs: 300,
            snapshot_degree: 2,
        }
    }
}

/// Push stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Overrides the region-derived stream URL.
    pub url: Option<String>,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    /// Fraction of the delay randomised in both directions (0.0..1.0).
    pub backoff_jitter: f64,
    /// Window during which repeated full-sync events collapse into one refetch.
    pub resync_debounce_ms: u64,
    pub ping_interval_secs: u64,
    pub auth_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 60_000,
            backoff_multiplier: 2.0,
            backoff_jitter: 0.2,
            resync_debounce_ms: 2_000,
            ping_interval_secs: 30,
            auth_timeout_secs: 10,
        }
    }
}

/// Command dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Retry ceiling for normal and fast tiers.
    pub max_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_multiplier: f64,
    pub retry_max_delay_ms: u64,
    /// Queue depth above which callers are warned about backpressure.
    pub queue_warn_threshold: usize,
    /// Tier used when a caller does not choose one.
    pub default_tier: String,
    /// Apply acknowledged writes to the device store before the push confirms them.
    pub optimistic_updates: bool,
    /// Delay before the fast tier checks whether acknowledged writes took effect.
    pub probe_settle_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_initial_delay_ms: 500,
            retry_multiplier: 2.0,
            retry_max_delay_ms: 5_000,
            queue_warn_threshold: 200,
            default_tier: "normal".to_string(),
            optimistic_updates: true,
            probe_settle_ms: 300,
        }
    }
}

/// One mapping entry added or replaced at start-up.
///
/// Fields are kept as strings here; the device crate parses them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingOverrideConfig {
    pub device_type: String,
    /// Exact key (`"T"`), indexed wildcard (`"L*"`) or alternatives (`"P1|L1"`).
    pub io: String,
    pub role: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub state_class: Option<String>,
    pub rule: String,
}

/// Mapping registry settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingSection {
    pub overrides: Vec<MappingOverrideConfig>,
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub account: AccountConfig,
    pub api: ApiConfig,
    pub stream: StreamConfig,
    pub dispatch: DispatchConfig,
    pub mapping: MappingSection,
}

impl BridgeConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from `path`, or from [`DEFAULT_CONFIG_FILE`] when it
    /// exists, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::config(format!("cannot read {}: {}", path.display(), e))
                })?;
                info!(category = "config", path = %path.display(), "Loading config file");
                Self::from_toml_str(&content)?
            }
            None => match std::fs::read_to_string(DEFAULT_CONFIG_FILE) {
                Ok(content) => {
                    info!(category = "config", path = DEFAULT_CONFIG_FILE, "Loading config file");
                    Self::from_toml_str(&content)?
                }
                Err(_) => {
                    info!(category = "config", "No config file, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production, a map in tests).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(env_vars::APP_KEY) {
            self.account.app_key = v;
        }
        if let Some(v) = lookup(env_vars::APP_TOKEN) {
            self.account.app_token = v;
        }
        if let Some(v) = lookup(env_vars::USER_ID) {
            self.account.user_id = v;
        }
        if let Some(v) = lookup(env_vars::USER_TOKEN) {
            self.account.user_token = v;
        }
        if let Some(v) = lookup(env_vars::REGION) {
            self.account.region = v.parse()?;
        }
        if let Some(v) = lookup(env_vars::MAX_IN_FLIGHT) {
            self.api.max_in_flight = v
                .parse()
                .map_err(|_| Error::config(format!("{} must be a number", env_vars::MAX_IN_FLIGHT)))?;
        }
        Ok(())
    }

    /// Check internal consistency. Credentials are only required when a live
    /// cloud connection will be opened.
    pub fn validate(&self, require_credentials: bool) -> Result<()> {
        if require_credentials && !self.account.is_complete() {
            return Err(Error::config(
                "account.app_key, app_token, user_id and user_token are required",
            ));
        }
        if self.api.max_in_flight == 0 {
            return Err(Error::config("api.max_in_flight must be at least 1"));
        }
        if self.api.snapshot_degree > 3 {
            return Err(Error::config("api.snapshot_degree must be between 0 and 3"));
        }
        if self.stream.backoff_initial_ms == 0 {
            return Err(Error::config("stream.backoff_initial_ms must be positive"));
        }
        if self.stream.backoff_max_ms < self.stream.backoff_initial_ms {
            return Err(Error::config(
                "stream.backoff_max_ms must not be lower than stream.backoff_initial_ms",
            ));
        }
        if !(0.0..1.0).contains(&self.stream.backoff_jitter) {
            return Err(Error::config("stream.backoff_jitter must be in [0, 1)"));
        }
        if self.dispatch.queue_warn_threshold == 0 {
            return Err(Error::config("dispatch.queue_warn_threshold must be at least 1"));
        }
        Ok(())
    }

    /// Effective REST base URL.
    pub fn api_base_url(&self) -> String {
        self.api
            .base_url
            .clone()
            .unwrap_or_else(|| self.account.region.api_base_url())
    }

    /// Effective push stream URL.
    pub fn stream_url(&self) -> String {
        self.stream
            .url
            .clone()
            .unwrap_or_else(|| self.account.region.stream_url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid_without_credentials() {
        let config = BridgeConfig::default();
        assert!(config.validate(false).is_ok());
        assert!(config.validate(true).is_err());
        assert_eq!(config.api.max_in_flight, 8);
        assert_eq!(config.dispatch.default_tier, "normal");
    }

    #[test]
    fn test_partial_toml() {
        let config = BridgeConfig::from_toml_str(
            r#"
            [account]
            app_key = "k"
            region = "cn2"

            [dispatch]
            max_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.account.app_key, "k");
        assert_eq!(config.account.region, Region::Cn2);
        assert_eq!(config.dispatch.max_retries, 5);
        assert_eq!(config.dispatch.queue_warn_threshold, 200);
        assert_eq!(config.stream.ping_interval_secs, 30);
    }

    #[test]
    fn test_mapping_overrides() {
        let config = BridgeConfig::from_toml_str(
            r#"
            [[mapping.overrides]]
            device_type = "SL_SC_THL"
            io = "T"
            role = "temperature"
            unit = "°C"
            rule = "tenths"
            "#,
        )
        .unwrap();
        assert_eq!(config.mapping.overrides.len(), 1);
        assert_eq!(config.mapping.overrides[0].rule, "tenths");
        assert_eq!(config.mapping.overrides[0].state_class, None);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (env_vars::APP_KEY, "key"),
            (env_vars::REGION, "eu"),
            (env_vars::MAX_IN_FLIGHT, "3"),
        ]
        .into_iter()
        .collect();
        let mut config = BridgeConfig::default();
        config
            .apply_env_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.account.app_key, "key");
        assert_eq!(config.account.region, Region::Eu);
        assert_eq!(config.api.max_in_flight, 3);
    }

    #[test]
    fn test_invalid_env_override() {
        let mut config = BridgeConfig::default();
        let result = config.apply_env_overrides(|k| {
            (k == env_vars::MAX_IN_FLIGHT).then(|| "many".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_backoff() {
        let mut config = BridgeConfig::default();
        config.stream.backoff_max_ms = 10;
        assert!(config.validate(false).is_err());

        let mut config = BridgeConfig::default();
        config.api.max_in_flight = 0;
        assert!(config.validate(false).is_err());
    }

    #[test]
    fn test_region_urls() {
        assert_eq!(Region::Us.api_base_url(), "https://api.us.ilifesmart.com/app");
        assert_eq!(
            Region::Cn2.stream_url(),
            "wss://api.cn2.ilifesmart.com:8443/wsapp/"
        );
        assert_eq!("EUR".parse::<Region>().unwrap(), Region::Eu);
        assert!("mars".parse::<Region>().is_err());

        let mut config = BridgeConfig::default();
        config.api.base_url = Some("http://127.0.0.1:9000/app".into());
        assert_eq!(config.api_base_url(), "http://127.0.0.1:9000/app");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[api]\ntimeout_secs = 3").unwrap();
        let config = BridgeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.api.timeout_secs, 3);
    }

    #[test]
    fn test_load_missing_file() {
        let result = BridgeConfig::load(Some(Path::new("/nonexistent/hubsync.toml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
