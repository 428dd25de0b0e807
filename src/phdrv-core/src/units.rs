// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Waiting for units to arrive on the sites.

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::device::{DeviceProtocol, EventMeaning};
use crate::error::{DriverError, DriverResult};
use crate::policies::PollingPolicy;
use crate::site::SiteTable;
use crate::stepping::StepResult;
use crate::wire::Wire;

pub(crate) struct UnitWait<'a> {
    pub wire: &'a mut Wire,
    pub device: &'a mut dyn DeviceProtocol,
    pub sites: &'a mut SiteTable,
    pub polling: &'a dyn PollingPolicy,
    pub strict: bool,
}

impl UnitWait<'_> {
    /// Wait for units within one call. Without units the exchanges of this
    /// call are rolled back and the caller is told to come back.
    pub async fn acquire(&mut self) -> DriverResult<StepResult<()>> {
        self.wire.mark();
        let result = if self.strict {
            self.poll_strictly().await
        } else {
            self.wait_for_event().await
        };
        match result {
            Err(err) => {
                self.wire.remove_to_mark();
                Err(err)
            }
            Ok(StepResult::Done(())) if !self.sites.any_pending() => {
                debug!("no units yet");
                self.wire.remove_to_mark();
                Err(DriverError::Waiting)
            }
            other => other,
        }
    }

    async fn poll_strictly(&mut self) -> DriverResult<StepResult<()>> {
        let started = Instant::now();
        loop {
            match self.device.poll_units(self.wire, self.sites).await? {
                StepResult::Done(()) => {}
                other => return Ok(other),
            }
            if self.sites.any_pending() || !self.polling.should_poll(started.elapsed()) {
                break;
            }
            sleep(self.polling.interval()).await;
        }
        if self.sites.any_pending() {
            let stale = self.wire.drain_events().await;
            if stale > 0 {
                debug!("discarded {} stale events", stale);
            }
        }
        Ok(StepResult::Done(()))
    }

    async fn wait_for_event(&mut self) -> DriverResult<StepResult<()>> {
        let fast = self.sites.any_pending();
        let Some(code) = self.wire.test_event(fast).await? else {
            // no event within the heartbeat, make sure nothing was missed
            return self.device.poll_units(self.wire, self.sites).await;
        };
        match self.device.interpret_event(code, self.sites) {
            EventMeaning::Units(mask) => {
                let unknown = self.sites.apply_mask(mask);
                if unknown != 0 {
                    warn!("event 0x{:02x} reports units on unknown sites {:#x}", code, unknown);
                }
                Ok(StepResult::Done(()))
            }
            EventMeaning::Ready => self.device.poll_units(self.wire, self.sites).await,
            EventMeaning::Paused => Ok(StepResult::Paused),
            EventMeaning::Exhausted => Ok(StepResult::Exhausted),
            EventMeaning::Other => {
                debug!("event 0x{:02x} ignored while waiting for units", code);
                Ok(StepResult::Done(()))
            }
        }
    }
}
