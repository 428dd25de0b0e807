// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configuration file support for phdrv-server.
//!
//! Config is loaded from the `[phdrv-server]` section of `phdrv.toml`.
//! Default search order:
//! 1. Path specified via `--config` CLI argument
//! 2. `$PHDRV_CONFIG`
//! 3. `./phdrv.toml`
//! 4. `~/.config/phdrv/phdrv.toml`
//! 5. `/etc/phdrv/phdrv.toml`

use serde::{Deserialize, Serialize};

use phdrv_app::ConfigFile;
use phdrv_core::{BinCode, SessionConfig};

/// Top-level server configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub general: GeneralConfig,
    pub device: DeviceConfig,
    pub link: LinkConfig,
    /// Host side of the test cycle.
    pub run: RunConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device family (e.g. "handler", "prober")
    pub family: Option<String>,
}

/// How to reach the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Link type: "serial", "tcp" or "sim"
    #[serde(rename = "type")]
    pub link_type: Option<String>,
    /// Serial port path
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub host: Option<String>,
    pub tcp_port: Option<u16>,
    /// Units in a simulated lot
    pub lot_size: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            link_type: None,
            port: None,
            baud: None,
            host: None,
            tcp_port: None,
            lot_size: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Bin reported for every tested unit.
    pub pass_bin: BinCode,
    /// Stop after this many unit sets.
    pub max_cycles: Option<u64>,
    /// Initialize attempts before giving up.
    pub init_retries: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            pass_bin: BinCode::Number(1),
            max_cycles: None,
            init_retries: 5,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        validate_log_level(self.general.log_level.as_deref())?;
        validate_link(&self.link)?;
        if self.run.init_retries == 0 {
            return Err("[run].init_retries must be > 0".to_string());
        }
        if self.run.max_cycles == Some(0) {
            return Err("[run].max_cycles must be > 0 when set".to_string());
        }
        self.session
            .validate()
            .map_err(|e| format!("[session]: {}", e))
    }

    /// Example configuration with every section filled in.
    pub fn example_combined_toml() -> String {
        #[derive(serde::Serialize)]
        struct Wrapper {
            #[serde(rename = "phdrv-server")]
            inner: ServerConfig,
        }
        let example = ServerConfig {
            general: GeneralConfig {
                log_level: Some("info".to_string()),
            },
            device: DeviceConfig {
                family: Some("handler".to_string()),
            },
            link: LinkConfig {
                link_type: Some("serial".to_string()),
                port: Some("/dev/ttyUSB0".to_string()),
                baud: Some(9600),
                ..LinkConfig::default()
            },
            run: RunConfig::default(),
            session: SessionConfig {
                sites: vec!["1".into(), "2".into(), "3".into(), "4".into()],
                strict_polling: false,
                ..SessionConfig::default()
            },
        };
        toml::to_string_pretty(&Wrapper { inner: example }).unwrap_or_default()
    }
}

fn validate_log_level(level: Option<&str>) -> Result<(), String> {
    if let Some(level) = level {
        match level {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(format!(
                    "[general].log_level '{}' is invalid (expected one of: trace, debug, info, warn, error)",
                    level
                ))
            }
        }
    }
    Ok(())
}

fn validate_link(link: &LinkConfig) -> Result<(), String> {
    match link.link_type.as_deref() {
        None => Ok(()),
        Some("serial") => {
            if link.port.as_deref().unwrap_or("").trim().is_empty() {
                return Err("[link].port must be set for serial links".to_string());
            }
            if link.baud.unwrap_or(0) == 0 {
                return Err("[link].baud must be > 0 for serial links".to_string());
            }
            Ok(())
        }
        Some("tcp") => {
            if link.host.as_deref().unwrap_or("").trim().is_empty() {
                return Err("[link].host must be set for tcp links".to_string());
            }
            if link.tcp_port.unwrap_or(0) == 0 {
                return Err("[link].tcp_port must be > 0 for tcp links".to_string());
            }
            Ok(())
        }
        Some("sim") => {
            if link.lot_size == 0 {
                return Err("[link].lot_size must be > 0 for sim links".to_string());
            }
            Ok(())
        }
        Some(other) => Err(format!(
            "[link].type '{}' is invalid (expected one of: serial, tcp, sim)",
            other
        )),
    }
}

impl ConfigFile for ServerConfig {
    fn section_key() -> &'static str {
        "phdrv-server"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.device.family.is_none());
        assert_eq!(config.link.lot_size, 16);
        assert_eq!(config.run.pass_bin, BinCode::Number(1));
        assert_eq!(config.session.sites, vec!["0".to_string()]);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
[device]
family = "prober"

[link]
type = "tcp"
host = "10.0.0.7"
tcp_port = 5025

[session]
sites = ["A", "B"]

[session.stepping]
sub_die = true
"#;

        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.device.family.as_deref(), Some("prober"));
        assert_eq!(config.link.tcp_port, Some(5025));
        assert_eq!(config.session.sites.len(), 2);
        assert!(config.session.stepping.sub_die);
        assert_eq!(config.session.heartbeat_ms, 5000);
    }

    #[test]
    fn test_invalid_configs() {
        let mut config = ServerConfig::default();
        config.general.log_level = Some("loud".to_string());
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.link.link_type = Some("serial".to_string());
        config.link.port = Some("/dev/ttyS0".to_string());
        assert!(config.validate().unwrap_err().contains("baud"));

        let mut config = ServerConfig::default();
        config.link.link_type = Some("usb".to_string());
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.session.sites.clear();
        assert!(config.validate().unwrap_err().starts_with("[session]"));
    }

    #[test]
    fn test_example_parses_back() {
        let text = ServerConfig::example_combined_toml();
        assert!(text.contains("[phdrv-server.link]"));

        let mut table: toml::Table = toml::from_str(&text).unwrap();
        let section = table.remove("phdrv-server").unwrap();
        let config: ServerConfig = section.try_into().unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.sites.len(), 4);
        assert_eq!(config.link.baud, Some(9600));
    }
}
