//! Configuration loading from TOML
//!
//! # Configuration File Format
//!
//! ```toml
//! [discovery]
//! udp_port = 2121
//! serial_baud = 9600
//! poll_interval_ms = 1000
//! udp_inactivity_timeout_ms = 10000
//!
//! [session]
//! reconcile_interval_ms = 50
//!
//! [plugins]
//! directory = "/etc/edmohub/plugins"
//! ```
//!
//! Every key has a default, so an empty file (or no `[section]` at all) is a
//! valid configuration; the reference deployment only ever overrides
//! `udp_port` and the plugin directory.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Transport discovery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// UDP port EDMO devices listen on for discovery broadcasts
    ///
    /// **Default**: 2121 (the reference deployment)
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    /// Serial line rate
    ///
    /// **Default**: 9600, the rate EDMO firmware ships with
    #[serde(default = "default_serial_baud")]
    pub serial_baud: u32,

    /// Cadence of both the serial enumeration diff-poll and the UDP
    /// discovery broadcast
    ///
    /// **Units**: Milliseconds
    /// **Valid range**: 250-5000
    /// **Default**: 1000
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long a UDP peer may stay silent before its channel is closed
    ///
    /// **Units**: Milliseconds
    /// **Default**: 10000
    #[serde(default = "default_udp_inactivity_ms")]
    pub udp_inactivity_timeout_ms: u64,
}

fn default_udp_port() -> u16 {
    2121
}
fn default_serial_baud() -> u32 {
    9600
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_udp_inactivity_ms() -> u64 {
    10_000
}

impl DiscoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn udp_inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_inactivity_timeout_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            udp_port: default_udp_port(),
            serial_baud: default_serial_baud(),
            poll_interval_ms: default_poll_interval_ms(),
            udp_inactivity_timeout_ms: default_udp_inactivity_ms(),
        }
    }
}

/// Session behavior configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Cadence of the parameter reconciliation loop
    ///
    /// **Units**: Milliseconds
    /// **Valid range**: 10-100 (teardown must be able to cancel the loop
    /// within one tick)
    /// **Default**: 50
    #[serde(default = "default_reconcile_ms")]
    pub reconcile_interval_ms: u64,
}

fn default_reconcile_ms() -> u64 {
    50
}

impl SessionConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: default_reconcile_ms(),
        }
    }
}

/// Plugin loader configuration (the loader itself is a collaborator; this
/// crate only records where it should look)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PluginConfig {
    /// Directory enumerated (in name order) by the plugin loader; the
    /// enumeration order becomes plugin priority
    #[serde(default)]
    pub directory: Option<String>,
}

/// Root configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub plugins: PluginConfig,
}

const MIN_POLL_INTERVAL_MS: u64 = 250;
const MAX_POLL_INTERVAL_MS: u64 = 5000;
const MIN_RECONCILE_MS: u64 = 10;
const MAX_RECONCILE_MS: u64 = 100;

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
        let config: Config = basic_toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let poll = self.discovery.poll_interval_ms;
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&poll) {
            return Err(Error::Config(format!(
                "poll_interval_ms must be between {}ms and {}ms (got {}ms)",
                MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS, poll
            )));
        }
        let reconcile = self.session.reconcile_interval_ms;
        if !(MIN_RECONCILE_MS..=MAX_RECONCILE_MS).contains(&reconcile) {
            return Err(Error::Config(format!(
                "reconcile_interval_ms must be between {}ms and {}ms (got {}ms); \
                session teardown waits at most one tick for the loop to stop",
                MIN_RECONCILE_MS, MAX_RECONCILE_MS, reconcile
            )));
        }
        if self.discovery.udp_inactivity_timeout_ms < poll * 2 {
            return Err(Error::Config(
                "udp_inactivity_timeout_ms must cover at least two poll intervals".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.discovery.udp_port, 2121);
        assert_eq!(config.discovery.serial_baud, 9600);
        assert_eq!(config.session.reconcile_interval_ms, 50);
    }

    #[test]
    fn test_empty_toml_parses_to_defaults() {
        let config: Config = basic_toml::from_str("").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.discovery.udp_port, 2121);
    }

    #[test]
    fn test_overrides() {
        let config: Config = basic_toml::from_str(
            r#"
            [discovery]
            udp_port = 4242
            poll_interval_ms = 500

            [session]
            reconcile_interval_ms = 20
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.discovery.udp_port, 4242);
        assert_eq!(config.session.reconcile_interval_ms, 20);
    }

    #[test]
    fn test_out_of_range_reconcile_rejected() {
        let config: Config = basic_toml::from_str(
            r#"
            [session]
            reconcile_interval_ms = 500
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
