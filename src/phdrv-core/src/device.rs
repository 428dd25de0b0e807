// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Device protocol seam.
//!
//! A device family supplies its command vocabulary through
//! [`DeviceProtocol`]; the session never branches on the device model.
//! Every exchange must go through the provided [`Wire`] so it is step
//! tracked.

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;

use crate::binning::BinPlan;
use crate::config::SessionConfig;
use crate::error::{DriverError, DriverResult};
use crate::site::SiteTable;
use crate::stepping::{Coordinate, Level, StepMode, StepResult};
use crate::wire::Wire;

pub type DeviceFuture<'a, T> = Pin<Box<dyn Future<Output = DriverResult<T>> + Send + 'a>>;

/// Optional features of a device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DeviceCapabilities {
    /// Can move to a commanded coordinate.
    pub coordinates: bool,
    pub sub_die: bool,
    pub reprobe: bool,
    /// Echoes bin commands for verification.
    pub bin_verify: bool,
    /// Signals unit arrival through events.
    pub events: bool,
    pub identify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub family: String,
    pub model: String,
    pub capabilities: DeviceCapabilities,
}

impl DeviceInfo {
    /// Check that the device can do what `config` asks of it.
    pub fn check_config(&self, config: &SessionConfig) -> DriverResult<()> {
        let caps = &self.capabilities;
        let missing = if config.stepping.sub_die && !caps.sub_die {
            Some("sub-die stepping")
        } else if config.stepping.mode == StepMode::Explicit && !caps.coordinates {
            Some("explicit stepping")
        } else if config.binning.verify && !caps.bin_verify {
            Some("bin verification")
        } else if config.binning.reprobe_bin.is_some() && !caps.reprobe {
            Some("reprobe")
        } else if !config.strict_polling && !caps.events {
            Some("event driven unit detection")
        } else {
            None
        };
        match missing {
            Some(what) => Err(DriverError::not_supported(format!(
                "{} on {} {}",
                what, self.family, self.model
            ))),
            None => Ok(()),
        }
    }
}

/// What an asynchronous event code means to the device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMeaning {
    /// Units are waiting on the sites in this mask.
    Units(u64),
    /// Units are waiting; poll to learn where.
    Ready,
    Paused,
    /// No more units will come.
    Exhausted,
    Other,
}

/// Message sent after a bin echo was compared, and its expected answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinAck {
    pub message: String,
    pub expected_reply: String,
}

pub trait DeviceProtocol: Send {
    fn info(&self) -> DeviceInfo;

    fn initialize<'a>(&'a mut self, wire: &'a mut Wire) -> DeviceFuture<'a, ()>;

    /// Identification string of the connected device.
    fn identify<'a>(&'a mut self, wire: &'a mut Wire) -> DeviceFuture<'a, String> {
        let _ = wire;
        let family = self.info().family;
        Box::pin(async move { Err(DriverError::not_supported(format!("identify on {}", family))) })
    }

    /// Bring the next unit of `level` into position.
    fn locate<'a>(
        &'a mut self,
        level: Level,
        target: Option<Coordinate>,
        wire: &'a mut Wire,
    ) -> DeviceFuture<'a, StepResult<Coordinate>> {
        let _ = (level, wire);
        Box::pin(async move { Ok(StepResult::Done(target.unwrap_or_default())) })
    }

    /// Ask the device which sites hold a unit and mark them pending.
    fn poll_units<'a>(
        &'a mut self,
        wire: &'a mut Wire,
        sites: &'a mut SiteTable,
    ) -> DeviceFuture<'a, StepResult<()>>;

    fn interpret_event(&self, code: u8, sites: &SiteTable) -> EventMeaning;

    /// One command binning or reprobing every site of `plan`. `None` when
    /// nothing has to be sent.
    fn encode_bin(&self, plan: &BinPlan, sites: &SiteTable) -> DriverResult<Option<String>>;

    fn bin_ack(&self, matched: bool) -> Option<BinAck> {
        let _ = matched;
        None
    }

    /// Finish disposing of the unit on `level`. On the deepest level this
    /// runs after the bin command was accepted.
    fn release<'a>(&'a mut self, level: Level, wire: &'a mut Wire) -> DeviceFuture<'a, StepResult<()>> {
        let _ = (level, wire);
        Box::pin(async move { Ok(StepResult::Done(())) })
    }
}
