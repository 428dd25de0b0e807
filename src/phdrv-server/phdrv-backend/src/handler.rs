// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Pick-and-place test handler family.
//!
//! The handler reports populated sites as one character `'0'..='?'` whose
//! low nibble is the site mask, signals unit arrival, pause and lot end
//! through event bits, and takes the results of all sites in one bin
//! command. With verification on it echoes that command and waits for
//! `ECHOOK` or `ECHONG`.

use tracing::{debug, warn};

use phdrv_core::device::DeviceFuture;
use phdrv_core::{
    BinAck, BinPlan, DeviceCapabilities, DeviceInfo, DeviceProtocol, DriverError, DriverResult,
    EventMeaning, ReplyShape, SiteAction, SiteTable, StepResult, Wire,
};

/// Sites addressable through the four bit population mask.
pub const HANDLER_SITES: usize = 4;

const EVENT_SITES: u8 = 0x0f;
const EVENT_PAUSED: u8 = 0x10;
const EVENT_LOT_END: u8 = 0x20;

const MIN_BIN: i64 = -1;
const MAX_BIN: i64 = 16383;

#[derive(Debug, Default)]
pub struct HandlerProtocol {
    model: Option<String>,
}

impl HandlerProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_bin(bin: i64) -> DriverResult<i64> {
        if (MIN_BIN..=MAX_BIN).contains(&bin) {
            Ok(bin)
        } else {
            Err(DriverError::binning(format!(
                "bin {} outside {}..={}",
                bin, MIN_BIN, MAX_BIN
            )))
        }
    }
}

/// Site mask carried by a population character, `None` when it is not one.
fn population_mask(reply: &str) -> Option<u64> {
    match reply.as_bytes() {
        [c @ b'0'..=b'?'] => Some(u64::from(c & 0x0f)),
        _ => None,
    }
}

impl DeviceProtocol for HandlerProtocol {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            family: "handler".to_string(),
            model: self.model.clone().unwrap_or_else(|| "generic".to_string()),
            capabilities: DeviceCapabilities {
                coordinates: false,
                sub_die: false,
                reprobe: true,
                bin_verify: true,
                events: true,
                identify: true,
            },
        }
    }

    fn initialize<'a>(&'a mut self, wire: &'a mut Wire) -> DeviceFuture<'a, ()> {
        Box::pin(async move { wire.clear_link().await })
    }

    fn identify<'a>(&'a mut self, wire: &'a mut Wire) -> DeviceFuture<'a, String> {
        Box::pin(async move {
            let reply = wire.query("ID?", &ReplyShape::Line).await?;
            self.model = reply.field(1).map(str::to_string);
            Ok(reply.text)
        })
    }

    fn poll_units<'a>(
        &'a mut self,
        wire: &'a mut Wire,
        sites: &'a mut SiteTable,
    ) -> DeviceFuture<'a, StepResult<()>> {
        Box::pin(async move {
            let reply = wire.query("SQB?", &ReplyShape::Line).await?;
            let Some(mask) = population_mask(&reply.text) else {
                warn!("population query answered \"{}\"", reply.text);
                // ask again on the next call
                wire.remove_step();
                wire.remove_step();
                return Err(DriverError::Waiting);
            };
            let unknown = sites.apply_mask(mask);
            if unknown != 0 {
                warn!("units reported on unconfigured sites {:#x}", unknown);
            }
            debug!("site population {:#06b}", mask);
            Ok(StepResult::Done(()))
        })
    }

    fn interpret_event(&self, code: u8, _sites: &SiteTable) -> EventMeaning {
        if code & EVENT_LOT_END != 0 {
            EventMeaning::Exhausted
        } else if code & EVENT_PAUSED != 0 {
            EventMeaning::Paused
        } else if code & EVENT_SITES != 0 {
            EventMeaning::Units(u64::from(code & EVENT_SITES))
        } else {
            EventMeaning::Other
        }
    }

    fn encode_bin(&self, plan: &BinPlan, sites: &SiteTable) -> DriverResult<Option<String>> {
        if plan.is_empty() {
            return Ok(None);
        }
        let mut command = String::new();
        for (site, action) in sites.iter().zip(plan.actions()) {
            match *action {
                SiteAction::Bin(bin) => {
                    command.push_str(&format!("{} BIN {} ", site.id, Self::check_bin(bin)?));
                }
                SiteAction::Reprobe(bin) => {
                    command.push_str(&format!("{} REPROBE {} ", site.id, Self::check_bin(bin)?));
                }
                SiteAction::Skip => {}
            }
        }
        Ok(Some(command))
    }

    fn bin_ack(&self, matched: bool) -> Option<BinAck> {
        let message = if matched { "ECHOOK" } else { "ECHONG" };
        Some(BinAck {
            message: message.to_string(),
            expected_reply: format!("ACK OK {}", message),
        })
    }
}
