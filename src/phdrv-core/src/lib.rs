// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod binning;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod link;
pub mod policies;
pub mod reply;
pub mod session;
pub mod site;
pub mod stepping;
pub mod transaction;
mod units;
pub mod wire;

pub type DynResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub use binning::{BinCode, BinMode, BinPlan, SiteAction, SiteOutcome};
pub use config::{BinMapEntry, BinningConfig, SessionConfig, SteppingConfig};
pub use device::{
    BinAck, DeviceCapabilities, DeviceFuture, DeviceInfo, DeviceProtocol, EventMeaning,
};
pub use error::{CallStatus, DriverError, DriverResult};
pub use link::{Link, LinkError, LinkKind};
pub use session::Session;
pub use site::{SitePopulation, SiteRecord, SiteTable};
pub use stepping::{Coordinate, Level, StepMark, StepMode, StepResult};
pub use reply::{Reply, ReplyShape};
pub use transaction::{CallId, StepCounters, Transaction};
pub use wire::{EmptyReply, Wire, WireSettings};
