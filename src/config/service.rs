// SPDX-License-Identifier: MIT OR Apache-2.0

//! Service profile file parser.
//!
//! ```yaml
//! service: llm
//! services:
//!   llm:
//!     base_url: https://api.perplexity.ai
//!     headers:
//!       authorization: Bearer pplx-...
//!     timeout_secs: 60
//!     backoff: exponential
//!     circuit_breaker:
//!       failure_threshold: 5
//!       reset_timeout_secs: 60
//!   calendar:
//!     base_url: https://calendar.example.com/api
//!     max_attempts: 5
//!     backoff: fixed
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::client::ClientConfig;
use crate::error::{ApiError, Result};
use crate::runtime::{Backoff, CircuitBreakerConfig};

/// Path to the config file.
pub const ENV_CONFIG_PATH: &str = "RESILIENT_API_CONFIG";
/// Active profile override.
pub const ENV_SERVICE: &str = "RESILIENT_API_SERVICE";
/// Base URL override for the active profile.
pub const ENV_BASE_URL: &str = "RESILIENT_API_BASE_URL";

/// The whole configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    /// Name of the active profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    /// Profiles by service name
    #[serde(default)]
    pub services: HashMap<String, ServiceProfile>,
}

/// Connection and resilience settings for one downstream service.
///
/// Unset fields take the [`ClientConfig`] defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceProfile {
    pub base_url: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// `none`, `fixed`, `linear` or `exponential`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub honor_retry_after: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<BreakerProfile>,
}

/// Breaker section of a profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerProfile {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_timeout_secs: Option<u64>,
}

fn enabled_by_default() -> bool {
    true
}

impl ServiceConfig {
    /// Load from `$RESILIENT_API_CONFIG` or the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The config directory cannot be determined
    /// - The config file cannot be read
    /// - The config file is malformed
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load like [`ServiceConfig::load_default`], then apply
    /// `$RESILIENT_API_SERVICE` and `$RESILIENT_API_BASE_URL`.
    ///
    /// # Errors
    ///
    /// Same as [`ServiceConfig::load_default`].
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load_default()?;
        config.apply_overrides(
            std::env::var(ENV_SERVICE).ok(),
            std::env::var(ENV_BASE_URL).ok(),
        );
        Ok(config)
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is malformed YAML.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ApiError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ApiError::Config(format!("Failed to parse config YAML: {e}")))
    }

    /// Default file location: `<config dir>/resilient-api/config.yaml`.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform config directory is unknown.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().ok_or_else(|| {
            ApiError::Config("Could not determine config directory".to_string())
        })?;

        Ok(dir.join("resilient-api").join("config.yaml"))
    }

    /// `$RESILIENT_API_CONFIG` if set, otherwise [`ServiceConfig::default_path`].
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is unset and the config directory
    /// cannot be determined.
    pub fn config_path() -> Result<PathBuf> {
        match std::env::var(ENV_CONFIG_PATH) {
            Ok(path) => Ok(PathBuf::from(path)),
            Err(_) => Self::default_path(),
        }
    }

    /// Apply an active-profile and base-URL override.
    ///
    /// The base URL goes to the active profile, which is created if it does
    /// not exist yet. Without an active profile it is ignored.
    pub fn apply_overrides(&mut self, service: Option<String>, base_url: Option<String>) {
        if let Some(service) = service.filter(|s| !s.is_empty()) {
            self.service = Some(service);
        }
        let Some(base_url) = base_url.filter(|u| !u.is_empty()) else {
            return;
        };
        match &self.service {
            Some(name) => {
                self.services.entry(name.clone()).or_default().base_url = base_url;
            }
            None => warn!("Base URL override ignored: no active service profile"),
        }
    }

    /// The active profile, if one is named and defined.
    pub fn active_profile(&self) -> Option<&ServiceProfile> {
        self.service
            .as_ref()
            .and_then(|name| self.services.get(name))
    }

    pub fn get_profile(&self, name: &str) -> Option<&ServiceProfile> {
        self.services.get(name)
    }

    /// All profile names, sorted.
    pub fn profile_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl ServiceProfile {
    /// Build a client configuration, filling unset fields with defaults.
    #[must_use]
    pub fn to_client_config(&self) -> ClientConfig {
        let mut builder = ClientConfig::builder(self.base_url.clone());
        for (name, value) in &self.headers {
            builder = builder.header(name, value.clone());
        }
        if let Some(secs) = self.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Some(max) = self.max_attempts {
            builder = builder.max_attempts(max);
        }
        if let Some(name) = &self.backoff {
            builder = builder.backoff(Backoff::from_name(name));
        }
        if let Some(secs) = self.total_timeout_secs {
            builder = builder.total_timeout(Duration::from_secs(secs));
        }
        if let Some(honor) = self.honor_retry_after {
            builder = builder.honor_retry_after(honor);
        }
        match &self.circuit_breaker {
            Some(breaker) if !breaker.enabled => builder = builder.without_circuit_breaker(),
            Some(breaker) => builder = builder.circuit_breaker(breaker.to_breaker_config()),
            None => {}
        }
        builder.build()
    }
}

impl BreakerProfile {
    fn to_breaker_config(&self) -> CircuitBreakerConfig {
        let mut config = CircuitBreakerConfig::new();
        if let Some(threshold) = self.failure_threshold {
            config = config.with_failure_threshold(threshold);
        }
        if let Some(secs) = self.reset_timeout_secs {
            config = config.with_reset_timeout(Duration::from_secs(secs));
        }
        config
    }
}
