use std::path::Path;
use std::str;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::error::ConfigError;

/**
 * Scan filters. All populated filters must match for a device to pass
 * (AND semantics): advertised service uuids, exact device name (only while
 * the name allowlist is enabled) and exact mac.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanFilter {
    #[serde(default)]
    pub services: Vec<Uuid>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub names_enabled: bool,
    #[serde(default)]
    pub mac: Option<String>,
}

impl Default for ScanFilter {
    fn default() -> Self {
        ScanFilter {
            services: Vec::new(),
            names: Vec::new(),
            names_enabled: false,
            mac: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// How long a scan runs before it ends on its own.
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,

    /// Minimum interval between a scan stop and the next start.
    #[serde(default = "default_scan_cooldown_ms")]
    pub scan_cooldown_ms: u64,

    #[serde(default)]
    pub scan_filter: ScanFilter,

    /// Floor on the gap between two consecutive writes to one device. The
    /// effective gap is the larger of this and the exchange interval the
    /// link reports at connect time.
    #[serde(default = "default_inter_command_delay_ms")]
    pub inter_command_delay_ms: u64,

    /// Window a one-shot command waits for its response.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// How often a connected link is polled for unsolicited loss.
    #[serde(default = "default_link_poll_ms")]
    pub link_poll_ms: u64,
}

fn default_scan_timeout_ms() -> u64 { 10_000 }
fn default_scan_cooldown_ms() -> u64 { 1_000 }
fn default_inter_command_delay_ms() -> u64 { 200 }
fn default_response_timeout_ms() -> u64 { 1_500 }
fn default_link_poll_ms() -> u64 { 500 }

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            scan_timeout_ms: default_scan_timeout_ms(),
            scan_cooldown_ms: default_scan_cooldown_ms(),
            scan_filter: ScanFilter::default(),
            inter_command_delay_ms: default_inter_command_delay_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            link_poll_ms: default_link_poll_ms(),
        }
    }
}

impl ClientConfig {
    /// All timing fields must be positive; a zero window would make every
    /// command fail (or never fail) before the link gets a chance to answer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_timeout_ms == 0 {
            return Err(ConfigError::Invalid("scanTimeoutMs must be > 0".into()));
        }
        if self.inter_command_delay_ms == 0 {
            return Err(ConfigError::Invalid("interCommandDelayMs must be > 0".into()));
        }
        if self.response_timeout_ms == 0 {
            return Err(ConfigError::Invalid("responseTimeoutMs must be > 0".into()));
        }
        if self.link_poll_ms == 0 {
            return Err(ConfigError::Invalid("linkPollMs must be > 0".into()));
        }
        if let Some(mac) = &self.scan_filter.mac {
            if mac.is_empty() {
                return Err(ConfigError::Invalid("scanFilter.mac must not be empty".into()));
            }
        }
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn scan_cooldown(&self) -> Duration {
        Duration::from_millis(self.scan_cooldown_ms)
    }

    pub fn inter_command_delay(&self) -> Duration {
        Duration::from_millis(self.inter_command_delay_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn link_poll(&self) -> Duration {
        Duration::from_millis(self.link_poll_ms)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a config file. An empty file yields the defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut file = File::open(path).await?;

        let mut content = vec![];
        file.read_to_end(&mut content).await?;

        if content.is_empty() {
            return Ok(ClientConfig::default());
        }

        let content = str::from_utf8(&content)?;
        Self::from_json_str(content)
    }
}
