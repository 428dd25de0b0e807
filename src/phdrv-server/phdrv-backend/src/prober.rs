// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Wafer prober family with die and sub-die stepping.
//!
//! | exchange | command | reply |
//! |---|---|---|
//! | move to die | `MOVE x y` / `NEXT` | `x y`, `END` or `PAUSED` |
//! | move to sub-die | `SUB x y` / `SUBNEXT` | `x y`, `END` or `PAUSED` |
//! | contacted sites | `SITES?` | hex site mask, `BUSY` or `PAUSED` |
//! | bin | `BIN b0 b1 ...` (`-` for a skipped site) | none |

use tracing::{debug, warn};

use phdrv_core::device::DeviceFuture;
use phdrv_core::{
    BinPlan, Coordinate, DeviceCapabilities, DeviceInfo, DeviceProtocol, DriverError,
    DriverResult, EventMeaning, Level, ReplyShape, SiteAction, SiteTable, StepResult, Wire,
};

#[derive(Debug, Default)]
pub struct ProberProtocol;

impl ProberProtocol {
    pub fn new() -> Self {
        Self
    }
}

fn move_command(level: Level, target: Option<Coordinate>) -> String {
    match (level, target) {
        (Level::Die, Some(c)) => format!("MOVE {} {}", c.x, c.y),
        (Level::Die, None) => "NEXT".to_string(),
        (Level::SubDie, Some(c)) => format!("SUB {} {}", c.x, c.y),
        (Level::SubDie, None) => "SUBNEXT".to_string(),
    }
}

/// Rewind a query whose answer could not be used, so it is asked again.
fn reject_answer(wire: &mut Wire, command: &str, answer: &str) -> DriverError {
    warn!("\"{}\" answered \"{}\"", command, answer);
    wire.remove_step();
    wire.remove_step();
    DriverError::answer(format!("\"{}\" answered \"{}\"", command, answer))
}

impl DeviceProtocol for ProberProtocol {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            family: "prober".to_string(),
            model: "generic".to_string(),
            capabilities: DeviceCapabilities {
                coordinates: true,
                sub_die: true,
                reprobe: false,
                bin_verify: false,
                events: false,
                identify: true,
            },
        }
    }

    fn initialize<'a>(&'a mut self, wire: &'a mut Wire) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            wire.clear_link().await?;
            wire.query("INIT", &ReplyShape::exact("OK")).await?;
            Ok(())
        })
    }

    fn identify<'a>(&'a mut self, wire: &'a mut Wire) -> DeviceFuture<'a, String> {
        Box::pin(async move { Ok(wire.query("ID?", &ReplyShape::Line).await?.text) })
    }

    fn locate<'a>(
        &'a mut self,
        level: Level,
        target: Option<Coordinate>,
        wire: &'a mut Wire,
    ) -> DeviceFuture<'a, StepResult<Coordinate>> {
        Box::pin(async move {
            let command = move_command(level, target);
            let reply = wire.query(&command, &ReplyShape::Line).await?;
            if reply.text.eq_ignore_ascii_case("END") {
                return Ok(StepResult::Exhausted);
            }
            if reply.text.eq_ignore_ascii_case("PAUSED") {
                return Ok(StepResult::Paused);
            }
            let (Some(x), Some(y), 2) = (
                reply.number::<i64>(0),
                reply.number::<i64>(1),
                reply.fields.len(),
            ) else {
                return Err(reject_answer(wire, &command, &reply.text));
            };
            let at = Coordinate::new(x, y);
            if target.is_some_and(|t| t != at) {
                warn!("{} moved to {} instead of {}", level, at, target.unwrap_or_default());
            }
            debug!("{} at {}", level, at);
            Ok(StepResult::Done(at))
        })
    }

    fn poll_units<'a>(
        &'a mut self,
        wire: &'a mut Wire,
        sites: &'a mut SiteTable,
    ) -> DeviceFuture<'a, StepResult<()>> {
        Box::pin(async move {
            let reply = wire.query("SITES?", &ReplyShape::Line).await?;
            if reply.text.eq_ignore_ascii_case("BUSY") {
                return Ok(StepResult::Done(()));
            }
            if reply.text.eq_ignore_ascii_case("PAUSED") {
                return Ok(StepResult::Paused);
            }
            let Ok(mask) = u64::from_str_radix(&reply.text, 16) else {
                return Err(reject_answer(wire, "SITES?", &reply.text));
            };
            let unknown = sites.apply_mask(mask);
            if unknown != 0 {
                warn!("prober contacted unconfigured sites {:#x}", unknown);
            }
            Ok(StepResult::Done(()))
        })
    }

    fn interpret_event(&self, _code: u8, _sites: &SiteTable) -> EventMeaning {
        EventMeaning::Other
    }

    fn encode_bin(&self, plan: &BinPlan, _sites: &SiteTable) -> DriverResult<Option<String>> {
        if plan.is_empty() {
            return Ok(None);
        }
        let mut command = String::from("BIN");
        for action in plan.actions() {
            match action {
                SiteAction::Bin(bin) => command.push_str(&format!(" {}", bin)),
                SiteAction::Skip => command.push_str(" -"),
                SiteAction::Reprobe(_) => {
                    return Err(DriverError::not_supported("reprobe on a prober"));
                }
            }
        }
        Ok(Some(command))
    }
}
