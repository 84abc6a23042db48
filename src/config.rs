//! Configuration for the `pumplink` binary, read from a TOML file.

use anyhow::{Context, Result};
use pumplink_lib::alerts::GlucoseThresholds;
use pumplink_lib::{PollConfig, SafetyLimits};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pump: PumpSection,
    #[serde(default)]
    pub polling: PollConfig,
    #[serde(default)]
    pub safety: SafetyLimits,
    #[serde(default)]
    pub alerts: GlucoseThresholds,
    #[serde(default)]
    pub output: OutputSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpSection {
    #[serde(default = "default_bridge_addr")]
    pub bridge_addr: String,
    /// Six digits for JPAKE pairing.
    #[serde(default)]
    pub pairing_code: String,
    #[serde(default = "default_app_id")]
    pub app_id: u16,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutputSection {
    /// Readings file; stdout when unset.
    pub readings: Option<PathBuf>,
    /// Alert transitions file; stdout when unset.
    pub alerts: Option<PathBuf>,
}

fn default_bridge_addr() -> String {
    "127.0.0.1:7450".into()
}
fn default_app_id() -> u16 {
    1
}
fn default_response_timeout_ms() -> u64 {
    3000
}
fn default_reconnect_delay_secs() -> u64 {
    5
}

impl Default for PumpSection {
    fn default() -> Self {
        Self {
            bridge_addr: default_bridge_addr(),
            pairing_code: String::new(),
            app_id: default_app_id(),
            response_timeout_ms: default_response_timeout_ms(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

impl PumpSection {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl Config {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read config at: {:?}", path))?;
        let config: Config = toml::from_str(&content).with_context(|| format!("Invalid config at: {:?}", path))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.polling.validate().context("[polling]")?;
        self.safety.validate().context("[safety]")?;
        self.alerts.validate().context("[alerts]")?;
        Ok(())
    }
}
