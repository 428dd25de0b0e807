// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Bin and reprobe handling for disposed units.
//!
//! Test outcomes are resolved to device bins up front, so an unresolvable
//! outcome fails the whole dispose before anything is sent. All sites are
//! then binned with one combined command, optionally verified against the
//! device's echo and resent from a transaction mark on mismatch.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BinningConfig;
use crate::device::DeviceProtocol;
use crate::error::{DriverError, DriverResult};
use crate::policies::RetryPolicy;
use crate::reply::ReplyShape;
use crate::site::{SitePopulation, SiteTable};
use crate::wire::Wire;

/// Bin number used by the host to request a retest.
pub const RETEST_CODE: i64 = -1;

/// A bin as reported by the host: a number or a symbolic code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BinCode {
    Number(i64),
    Code(String),
}

impl fmt::Display for BinCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Code(c) => write!(f, "\"{}\"", c),
        }
    }
}

/// Test result of one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteOutcome {
    pub passed: bool,
    pub bin: BinCode,
    /// Test the unit again in place instead of binning it.
    #[serde(default)]
    pub reprobe: bool,
}

impl SiteOutcome {
    pub fn pass(bin: BinCode) -> Self {
        Self {
            passed: true,
            bin,
            reprobe: false,
        }
    }

    pub fn fail(bin: BinCode) -> Self {
        Self {
            passed: false,
            bin,
            reprobe: false,
        }
    }

    pub fn reprobe() -> Self {
        Self {
            passed: false,
            bin: BinCode::Number(RETEST_CODE),
            reprobe: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinMode {
    /// Host bin numbers are device bin numbers.
    #[default]
    Default,
    /// Host bin numbers are mapped through the bin table.
    HardMap,
    /// Host bin codes are mapped through the bin table.
    SoftMap,
}

/// Maps a host bin to a device bin.
pub trait BinMapper: Send + Sync {
    fn map_outcome(&self, code: &BinCode) -> Option<i64>;
}

#[derive(Debug, Clone, Default)]
pub struct BinTable {
    mode: BinMode,
    map: HashMap<BinCode, i64>,
    retest_bin: Option<i64>,
    reprobe_bin: Option<i64>,
}

impl BinMapper for BinTable {
    fn map_outcome(&self, code: &BinCode) -> Option<i64> {
        self.map.get(code).copied()
    }
}

impl BinTable {
    pub fn from_config(config: &BinningConfig) -> Self {
        let mut map: HashMap<BinCode, i64> = config
            .map
            .iter()
            .map(|entry| (entry.code.clone(), entry.bin))
            .collect();
        if let Some(retest) = config.retest_bin {
            map.entry(BinCode::Number(RETEST_CODE)).or_insert(retest);
        }
        Self {
            mode: config.mode,
            map,
            retest_bin: config.retest_bin,
            reprobe_bin: config.reprobe_bin,
        }
    }

    pub fn mode(&self) -> BinMode {
        self.mode
    }

    pub fn retest_bin(&self) -> Option<i64> {
        self.retest_bin
    }

    pub fn reprobe_bin(&self) -> Option<i64> {
        self.reprobe_bin
    }

    /// Device bin for a host bin, falling back to the retest bin.
    pub fn resolve(&self, code: &BinCode) -> DriverResult<i64> {
        if self.mode == BinMode::Default {
            let number = match code {
                BinCode::Number(n) => Some(*n),
                BinCode::Code(c) => c.trim().parse::<i64>().ok(),
            };
            match number {
                Some(RETEST_CODE) => return Ok(self.retest_bin.unwrap_or(RETEST_CODE)),
                Some(n) => return Ok(n),
                None => {}
            }
        }

        if let Some(bin) = self.map_outcome(code) {
            return Ok(bin);
        }
        match self.retest_bin {
            Some(retest) => {
                warn!("no device bin for {}, using retest bin {}", code, retest);
                Ok(retest)
            }
            None => Err(DriverError::binning(format!(
                "no device bin for {} and no retest bin configured",
                code
            ))),
        }
    }

    /// Decide what happens to the unit on every site.
    ///
    /// With `trusted` unset the host results are not used and every unit
    /// goes to the retest bin.
    pub fn plan(
        &self,
        sites: &SiteTable,
        outcomes: &[SiteOutcome],
        trusted: bool,
    ) -> DriverResult<BinPlan> {
        if outcomes.len() != sites.len() {
            return Err(DriverError::binning(format!(
                "{} results for {} sites",
                outcomes.len(),
                sites.len()
            )));
        }

        let mut actions = Vec::with_capacity(sites.len());
        for (site, outcome) in sites.iter().zip(outcomes) {
            let binnable = matches!(
                site.population,
                SitePopulation::Populated | SitePopulation::PopulatedDeactivated
            );
            let action = if !binnable {
                SiteAction::Skip
            } else if outcome.reprobe {
                let bin = self.reprobe_bin.ok_or_else(|| {
                    DriverError::config("reprobe requested but no reprobe bin is configured")
                })?;
                SiteAction::Reprobe(bin)
            } else if !trusted {
                SiteAction::Bin(self.resolve(&BinCode::Number(RETEST_CODE))?)
            } else {
                SiteAction::Bin(self.resolve(&outcome.bin)?)
            };
            debug!("site {}: {:?} -> {:?}", site.id, outcome.bin, action);
            actions.push(action);
        }
        Ok(BinPlan { actions })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteAction {
    Bin(i64),
    Reprobe(i64),
    Skip,
}

/// One action per site, in site order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct BinPlan {
    actions: Vec<SiteAction>,
}

impl BinPlan {
    pub fn new(actions: Vec<SiteAction>) -> Self {
        Self { actions }
    }

    pub fn actions(&self) -> &[SiteAction] {
        &self.actions
    }

    pub fn reprobe_sites(&self) -> Vec<usize> {
        self.actions
            .iter()
            .enumerate()
            .filter(|(_, a)| matches!(a, SiteAction::Reprobe(_)))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.iter().all(|a| *a == SiteAction::Skip)
    }
}

/// Sends bin plans and verifies them.
pub struct BinEngine {
    table: BinTable,
    verify: bool,
    retry: Box<dyn RetryPolicy>,
    attempts: u32,
}

impl BinEngine {
    pub fn new(table: BinTable, verify: bool, retry: Box<dyn RetryPolicy>) -> Self {
        Self {
            table,
            verify,
            retry,
            attempts: 0,
        }
    }

    pub fn table(&self) -> &BinTable {
        &self.table
    }

    pub fn verify(&self) -> bool {
        self.verify
    }

    /// Mismatches seen for the bin command currently being sent.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Send `plan` as one combined command and, when verification is on,
    /// resend it until the echo matches or the retry policy gives up.
    pub async fn submit(
        &mut self,
        wire: &mut Wire,
        device: &mut dyn DeviceProtocol,
        plan: &BinPlan,
        sites: &SiteTable,
    ) -> DriverResult<()> {
        let Some(command) = device.encode_bin(plan, sites)? else {
            debug!("no bin command needed");
            return Ok(());
        };

        loop {
            wire.mark();
            wire.send(&command).await?;
            if !self.verify {
                break;
            }

            let echo = wire.receive(&ReplyShape::Line).await?;
            let matched = echo.text.eq_ignore_ascii_case(command.trim());
            if let Some(ack) = device.bin_ack(matched) {
                wire.send(&ack.message).await?;
                let reply = wire.receive(&ReplyShape::FreeText).await?;
                if !reply.text.eq_ignore_ascii_case(&ack.expected_reply) {
                    warn!(
                        "bin acknowledge answered \"{}\", expected \"{}\"",
                        reply.text, ack.expected_reply
                    );
                }
            }
            if matched {
                break;
            }

            self.attempts += 1;
            if self.retry.should_retry(self.attempts) {
                warn!(
                    "bin echo \"{}\" does not match \"{}\", sending again ({} of {})",
                    echo.text,
                    command.trim(),
                    self.attempts + 1,
                    self.retry.max_attempts()
                );
                wire.remove_to_mark();
                continue;
            }

            let attempts = self.attempts;
            self.attempts = 0;
            return Err(DriverError::binning(format!(
                "bin command not echoed correctly after {} attempts",
                attempts
            )));
        }

        if self.attempts > 0 {
            info!("bin command accepted after {} resends", self.attempts);
        }
        self.attempts = 0;
        Ok(())
    }
}
