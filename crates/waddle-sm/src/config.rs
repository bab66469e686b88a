//! Session manager configuration.
//!
//! Configuration is read from TOML and may be adjusted through environment
//! variables.
//!
//! # Environment Variables
//!
//! - `WADDLE_SM_DOMAIN`: Virtual host served by the session manager
//! - `WADDLE_SM_RESOURCE_PREFIX`: Prefix of generated resource names
//! - `WADDLE_SM_WORKERS`: Number of dispatch workers
//! - `WADDLE_SM_REGISTRATION`: `true`/`false` to toggle in-band registration
//! - `WADDLE_SM_CSI_STRATEGY`: `presence-queue` or `passthrough`
//!
//! # Example
//!
//! ```toml
//! domain = "example.com"
//! workers = 8
//!
//! [registration]
//! rate = 5.0
//! per_secs = 60
//!
//! [csi]
//! strategy = "presence-queue"
//! max_queue_size = 50
//!
//! [processors."jabber:iq:register"]
//! instructions = "Pick a name."
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use toml::Table;
use tracing::info;

use crate::error::SmError;
use crate::matcher::MatcherList;
use crate::processors::csi::CsiStrategy;

/// Legacy authentication settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Failed attempts tolerated before the stream is closed
    pub max_retries: u32,
    /// Extra pre-authentication rules in matcher syntax, checked first
    pub allow: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            allow: Vec::new(),
        }
    }
}

/// In-band registration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Whether accounts may be created over the stream
    pub enabled: bool,
    /// Registrations admitted per window and remote address
    pub rate: f64,
    /// Length of the rate window in seconds
    pub per_secs: u64,
    /// How often idle rate buckets are purged
    pub purge_interval_secs: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate: 5.0,
            per_secs: 60,
            purge_interval_secs: 3 * 60 * 60,
        }
    }
}

impl RegistrationConfig {
    pub fn per(&self) -> Duration {
        Duration::from_secs(self.per_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

/// Client State Indication settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsiConfig {
    /// Queueing strategy for inactive clients
    pub strategy: CsiStrategy,
    /// Queued presences per session before a forced flush
    pub max_queue_size: usize,
}

impl Default for CsiConfig {
    fn default() -> Self {
        Self {
            strategy: CsiStrategy::default(),
            max_queue_size: 50,
        }
    }
}

/// Session manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionManagerConfig {
    /// Virtual host served
    pub domain: String,
    /// Prefix of generated resource names; defaults to the host name
    pub resource_prefix: Option<String>,
    /// Number of dispatch workers
    pub workers: usize,
    /// Queue capacity of each worker
    pub worker_queue_size: usize,
    pub auth: AuthConfig,
    pub registration: RegistrationConfig,
    pub csi: CsiConfig,
    /// Settings passed to every processor
    pub settings: Table,
    /// Per-processor settings keyed by processor id
    pub processors: BTreeMap<String, Table>,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            resource_prefix: None,
            workers: 4,
            worker_queue_size: 1024,
            auth: AuthConfig::default(),
            registration: RegistrationConfig::default(),
            csi: CsiConfig::default(),
            settings: Table::new(),
            processors: BTreeMap::new(),
        }
    }
}

impl SessionManagerConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, SmError> {
        let config: Self =
            toml::from_str(text).map_err(|e| SmError::config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SmError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SmError::config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&text)?.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults adjusted by environment variables.
    pub fn from_env() -> Result<Self, SmError> {
        let config = Self::default().apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `WADDLE_SM_*` environment variables.
    pub fn apply_env_overrides(self) -> Result<Self, SmError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, SmError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(domain) = lookup("WADDLE_SM_DOMAIN") {
            self.domain = domain;
        }
        if let Some(prefix) = lookup("WADDLE_SM_RESOURCE_PREFIX") {
            self.resource_prefix = Some(prefix);
        }
        if let Some(workers) = lookup("WADDLE_SM_WORKERS") {
            self.workers = workers
                .parse()
                .map_err(|_| SmError::config(format!("WADDLE_SM_WORKERS: invalid number '{}'", workers)))?;
        }
        if let Some(enabled) = lookup("WADDLE_SM_REGISTRATION") {
            self.registration.enabled = matches!(
                enabled.to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(strategy) = lookup("WADDLE_SM_CSI_STRATEGY") {
            self.csi.strategy = strategy.parse()?;
        }
        Ok(self)
    }

    /// Check invariants the pipeline relies on.
    pub fn validate(&self) -> Result<(), SmError> {
        jid::BareJid::new(&self.domain)
            .map_err(|e| SmError::config(format!("invalid domain '{}': {}", self.domain, e)))?;
        if self.workers == 0 {
            return Err(SmError::config("workers must be at least 1"));
        }
        if self.worker_queue_size == 0 {
            return Err(SmError::config("worker_queue_size must be at least 1"));
        }
        if self.registration.rate < 1.0 {
            return Err(SmError::config("registration.rate must be at least 1"));
        }
        if self.registration.per_secs == 0 {
            return Err(SmError::config("registration.per_secs must be positive"));
        }
        if self.csi.max_queue_size == 0 {
            return Err(SmError::config("csi.max_queue_size must be at least 1"));
        }
        self.pre_auth_rules()?;
        Ok(())
    }

    /// Effective prefix for generated resources.
    pub fn resource_prefix(&self) -> String {
        if let Some(prefix) = &self.resource_prefix {
            return prefix.clone();
        }
        std::env::var("HOSTNAME")
            .ok()
            .and_then(|h| h.split('.').next().map(str::to_string))
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "waddle".to_string())
    }

    /// Pre-authentication allow list: configured rules first, then defaults.
    pub fn pre_auth_rules(&self) -> Result<MatcherList, SmError> {
        let mut rules = MatcherList::pre_auth_defaults();
        rules.prepend(MatcherList::parse(&self.auth.allow)?);
        Ok(rules)
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!("Session manager domain: {}", self.domain);
        info!("Dispatch workers: {} (queue size {})", self.workers, self.worker_queue_size);
        info!("Resource prefix: {}", self.resource_prefix());
        if self.registration.enabled {
            info!(
                "In-band registration: enabled ({} per {}s)",
                self.registration.rate, self.registration.per_secs
            );
        } else {
            info!("In-band registration: disabled");
        }
        info!(
            "CSI strategy: {} (max queue {})",
            self.csi.strategy, self.csi.max_queue_size
        );
        if !self.processors.is_empty() {
            let ids: Vec<&str> = self.processors.keys().map(String::as_str).collect();
            info!("Processor settings: {}", ids.join(", "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.auth.max_retries, 3);
        assert_eq!(config.csi.max_queue_size, 50);
        assert!(config.registration.enabled);
    }

    #[test]
    fn test_parse_toml() {
        let config = SessionManagerConfig::from_toml_str(
            r#"
            domain = "example.com"
            resource_prefix = "node7"
            workers = 2

            [auth]
            allow = ["/iq/ping[urn:xmpp:ping]"]

            [registration]
            enabled = false
            rate = 2.0
            per_secs = 10

            [csi]
            strategy = "passthrough"

            [settings]
            motd = "hello"

            [processors."jabber:iq:register"]
            instructions = "Pick a name."
            "#,
        )
        .unwrap();

        assert_eq!(config.domain, "example.com");
        assert_eq!(config.resource_prefix(), "node7");
        assert_eq!(config.workers, 2);
        assert!(!config.registration.enabled);
        assert_eq!(config.registration.per(), Duration::from_secs(10));
        assert_eq!(config.csi.strategy, CsiStrategy::Passthrough);
        assert_eq!(config.csi.max_queue_size, 50);
        assert_eq!(config.settings.get("motd").and_then(|v| v.as_str()), Some("hello"));
        assert!(config.processors.contains_key("jabber:iq:register"));
        assert_eq!(config.pre_auth_rules().unwrap().rules().len(), 7);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(SessionManagerConfig::from_toml_str("workers = 0").is_err());
        assert!(SessionManagerConfig::from_toml_str("domain = \"\"").is_err());
        assert!(SessionManagerConfig::from_toml_str("[auth]\nallow = [\"\"]").is_err());
        assert!(SessionManagerConfig::from_toml_str("[csi]\nstrategy = \"bogus\"").is_err());
        assert!(SessionManagerConfig::from_toml_str("workers = ").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("WADDLE_SM_DOMAIN", "chat.example.org"),
            ("WADDLE_SM_WORKERS", "16"),
            ("WADDLE_SM_REGISTRATION", "off"),
            ("WADDLE_SM_CSI_STRATEGY", "passthrough"),
        ]
        .into_iter()
        .collect();

        let config = SessionManagerConfig::default()
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.domain, "chat.example.org");
        assert_eq!(config.workers, 16);
        assert!(!config.registration.enabled);
        assert_eq!(config.csi.strategy, CsiStrategy::Passthrough);
    }

    #[test]
    fn test_env_override_bad_number() {
        let result = SessionManagerConfig::default()
            .apply_overrides(|key| (key == "WADDLE_SM_WORKERS").then(|| "many".to_string()));
        assert!(result.is_err());
    }
}
