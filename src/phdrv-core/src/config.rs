// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Session configuration.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::binning::{BinCode, BinMode};
use crate::error::{DriverError, DriverResult};
use crate::policies::{HeartbeatPolling, NoRetry, PollingPolicy, RetryPolicy, SinglePoll, VerifyRetry};
use crate::stepping::{Coordinate, DevicePattern, ExplicitPattern, Pattern, StepMode};
use crate::wire::{EmptyReply, WireSettings};

/// Most sites a session can track; site masks are 64 bits wide.
pub const MAX_SITES: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Site identifiers in device order.
    pub sites: Vec<String>,
    /// Sites switched off at start-up.
    pub inactive_sites: Vec<String>,
    /// Longest wait for one device exchange.
    pub heartbeat_ms: u64,
    /// Pause between two unit polls.
    pub poll_interval_ms: u64,
    /// Poll for units instead of waiting for events.
    pub strict_polling: bool,
    /// Give up waiting for units after this long and end the pattern.
    pub unit_wait_limit_ms: Option<u64>,
    /// Line terminator appended to every message.
    pub eol: String,
    /// Override the empty-reply policy of the link.
    pub empty_reply: Option<EmptyReply>,
    pub stepping: SteppingConfig,
    pub binning: BinningConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sites: vec!["0".to_string()],
            inactive_sites: Vec::new(),
            heartbeat_ms: 5000,
            poll_interval_ms: 200,
            strict_polling: true,
            unit_wait_limit_ms: None,
            eol: "\r\n".to_string(),
            empty_reply: None,
            stepping: SteppingConfig::default(),
            binning: BinningConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SteppingConfig {
    pub sub_die: bool,
    pub mode: StepMode,
    pub die_pattern: Vec<Coordinate>,
    pub sub_die_pattern: Vec<Coordinate>,
    /// Position of each site relative to the die coordinate.
    pub site_offsets: Vec<Coordinate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BinningConfig {
    pub mode: BinMode,
    pub map: Vec<BinMapEntry>,
    pub retest_bin: Option<i64>,
    pub reprobe_bin: Option<i64>,
    /// Read back and compare the echo of every bin command.
    pub verify: bool,
    pub max_retries: u32,
}

impl Default for BinningConfig {
    fn default() -> Self {
        Self {
            mode: BinMode::Default,
            map: Vec::new(),
            retest_bin: None,
            reprobe_bin: None,
            verify: false,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinMapEntry {
    pub code: BinCode,
    pub bin: i64,
}

impl SessionConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn unit_wait_limit(&self) -> Option<Duration> {
        self.unit_wait_limit_ms.map(Duration::from_millis)
    }

    pub fn wire_settings(&self) -> WireSettings {
        WireSettings {
            heartbeat: self.heartbeat(),
            eol: self.eol.clone(),
            empty_reply: self.empty_reply,
        }
    }

    pub fn retry_policy(&self) -> Box<dyn RetryPolicy> {
        match self.binning.max_retries {
            0 => Box::new(NoRetry),
            n => Box::new(VerifyRetry::new(n)),
        }
    }

    pub fn polling_policy(&self) -> Box<dyn PollingPolicy> {
        if self.strict_polling {
            Box::new(HeartbeatPolling::new(self.poll_interval(), self.heartbeat()))
        } else {
            Box::new(SinglePoll)
        }
    }

    pub fn die_pattern(&self) -> Box<dyn Pattern> {
        self.pattern(&self.stepping.die_pattern)
    }

    pub fn sub_die_pattern(&self) -> Option<Box<dyn Pattern>> {
        self.stepping
            .sub_die
            .then(|| self.pattern(&self.stepping.sub_die_pattern))
    }

    fn pattern(&self, coordinates: &[Coordinate]) -> Box<dyn Pattern> {
        match self.stepping.mode {
            StepMode::Explicit => Box::new(ExplicitPattern::new(coordinates.to_vec())),
            mode => Box::new(DevicePattern::new(mode)),
        }
    }

    /// Reject configurations the session cannot run with.
    pub fn validate(&self) -> DriverResult<()> {
        if self.sites.is_empty() {
            return Err(DriverError::config("at least one site is required"));
        }
        if self.sites.len() > MAX_SITES {
            return Err(DriverError::config(format!(
                "{} sites configured, at most {} are supported",
                self.sites.len(),
                MAX_SITES
            )));
        }
        let mut seen = HashSet::new();
        for id in &self.sites {
            if !seen.insert(id.as_str()) {
                return Err(DriverError::config(format!("site \"{}\" is listed twice", id)));
            }
        }
        if let Some(unknown) = self.inactive_sites.iter().find(|id| !seen.contains(id.as_str())) {
            return Err(DriverError::config(format!(
                "inactive site \"{}\" is not a configured site",
                unknown
            )));
        }
        if self.heartbeat_ms == 0 {
            return Err(DriverError::config("heartbeat_ms must be positive"));
        }
        if self.poll_interval_ms > self.heartbeat_ms {
            return Err(DriverError::config(
                "poll_interval_ms must not exceed heartbeat_ms",
            ));
        }

        let stepping = &self.stepping;
        if stepping.mode == StepMode::Explicit {
            if stepping.die_pattern.is_empty() {
                return Err(DriverError::config(
                    "explicit stepping needs a die_pattern",
                ));
            }
            if stepping.sub_die && stepping.sub_die_pattern.is_empty() {
                return Err(DriverError::config(
                    "explicit sub-die stepping needs a sub_die_pattern",
                ));
            }
        }
        if !stepping.site_offsets.is_empty() && stepping.site_offsets.len() != self.sites.len() {
            return Err(DriverError::config(format!(
                "{} site offsets for {} sites",
                stepping.site_offsets.len(),
                self.sites.len()
            )));
        }

        let binning = &self.binning;
        if binning.mode != BinMode::Default && binning.map.is_empty() && binning.retest_bin.is_none()
        {
            return Err(DriverError::config(
                "bin mapping requires a bin map or a retest bin",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat(), Duration::from_secs(5));
        assert!(config.sub_die_pattern().is_none());
        assert_eq!(config.retry_policy().max_attempts(), 3);
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            sites = ["A", "B"]
            inactive_sites = ["B"]
            heartbeat_ms = 1000
            strict_polling = false
            empty_reply = "waiting"

            [stepping]
            sub_die = true
            mode = "explicit"
            die_pattern = [{ x = 0, y = 0 }, { x = 1, y = 0 }]
            sub_die_pattern = [{ x = 0, y = 0 }]

            [binning]
            mode = "soft_map"
            retest_bin = 99
            verify = true
            max_retries = 1
            map = [{ code = "PASS", bin = 1 }, { code = 7, bin = 2 }]
        "#;

        let config: SessionConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.empty_reply, Some(EmptyReply::Waiting));
        assert_eq!(config.stepping.mode, StepMode::Explicit);
        assert_eq!(config.stepping.die_pattern[1], Coordinate::new(1, 0));
        assert_eq!(config.binning.mode, BinMode::SoftMap);
        assert_eq!(config.binning.map[0].code, BinCode::Code("PASS".into()));
        assert_eq!(config.binning.map[1].code, BinCode::Number(7));
        assert!(config.sub_die_pattern().is_some());
        assert_eq!(config.poll_interval_ms, 200);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = SessionConfig {
            sites: vec!["1".into(), "1".into()],
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());

        config.sites = vec!["1".into()];
        config.inactive_sites = vec!["2".into()];
        assert!(config.validate().is_err());

        config.inactive_sites.clear();
        config.stepping.mode = StepMode::Explicit;
        assert!(config.validate().is_err());

        config.stepping.mode = StepMode::Auto;
        config.binning.mode = BinMode::HardMap;
        assert!(matches!(config.validate(), Err(DriverError::Config(_))));

        config.binning.retest_bin = Some(0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"sites": ["1", "2", "3"]}"#).unwrap();
        assert_eq!(config.sites.len(), 3);
        assert!(config.strict_polling);
        assert_eq!(config.eol, "\r\n");
    }
}
