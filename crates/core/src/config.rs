//! Driver configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Settings shared by every request in a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Base URL that routes are joined onto
    pub endpoint: String,

    /// Pause before each request
    pub delay_ms: u64,

    /// Budget for `until`/`never` when no override is given
    pub poll_timeout_ms: u64,

    /// First delay between poll attempts
    pub poll_delay_ms: u64,

    /// Per-request transport timeout
    pub request_timeout_ms: u64,

    /// Status expected of requests that declare no expectations
    pub default_status: Option<u16>,

    /// Headers sent with every request; per-request headers override them
    pub request_headers: BTreeMap<String, String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        let mut request_headers = BTreeMap::new();
        request_headers.insert("Content-Type".to_string(), "application/json".to_string());
        Self {
            endpoint: "http://localhost".to_string(),
            delay_ms: 0,
            poll_timeout_ms: 10_000,
            poll_delay_ms: 10,
            request_timeout_ms: 30_000,
            default_status: None,
            request_headers,
        }
    }
}

impl DriverConfig {
    /// Load configuration from a TOML file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        reqwest::Url::parse(&self.endpoint)
            .map_err(|e| Error::InvalidConfig(format!("endpoint '{}': {}", self.endpoint, e)))?;
        Ok(())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
