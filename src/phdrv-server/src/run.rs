// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Host side of the test cycle: acquire, report results, dispose.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use phdrv_core::{
    BinCode, CallStatus, DriverError, DriverResult, Session, SiteOutcome, SitePopulation,
};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub pass_bin: BinCode,
    pub max_cycles: Option<u64>,
    /// Delay before repeating a call that asked to be repeated.
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Unit sets acquired and disposed.
    pub cycles: u64,
    /// Units tested across all sites.
    pub units: u64,
    /// Calls the device asked to repeat.
    pub waits: u64,
    pub pauses: u64,
    pub pattern_done: bool,
    pub aborted: bool,
}

/// Drive `session` until the pattern ends, `max_cycles` is reached or
/// `abort` is raised.
pub async fn run_session(
    session: &mut Session,
    options: &RunOptions,
    abort: &AtomicBool,
) -> DriverResult<RunSummary> {
    let mut summary = RunSummary::default();
    // the last acquire asked to be repeated
    let mut repeating = false;

    loop {
        if options.max_cycles.is_some_and(|max| summary.cycles >= max) {
            info!("stopping after {} cycles", summary.cycles);
            return Ok(summary);
        }
        if abort.load(Ordering::Relaxed) {
            if repeating {
                session.schedule_abort();
                expect_aborted(session.acquire_unit().await)?;
            }
            info!("run aborted after {} cycles", summary.cycles);
            summary.aborted = true;
            return Ok(summary);
        }

        repeating = false;
        match session.acquire_unit().await? {
            CallStatus::Done => {}
            CallStatus::PatternDone => {
                summary.pattern_done = true;
                return Ok(summary);
            }
            CallStatus::Waiting => {
                summary.waits += 1;
                repeating = true;
                sleep(options.retry_delay).await;
                continue;
            }
            CallStatus::Paused => {
                summary.pauses += 1;
                sleep(options.retry_delay).await;
                continue;
            }
        }

        let units = session
            .sites()
            .iter()
            .filter(|s| s.population == SitePopulation::Populated)
            .count() as u64;
        debug!("testing {} units", units);
        let outcomes = vec![SiteOutcome::pass(options.pass_bin.clone()); session.sites().len()];

        let status = dispose(session, &outcomes, options, abort, &mut summary).await?;
        summary.cycles += 1;
        summary.units += units;
        match status {
            Some(CallStatus::PatternDone) => {
                summary.pattern_done = true;
                return Ok(summary);
            }
            Some(_) => {}
            None => {
                info!("run aborted after {} cycles", summary.cycles);
                summary.aborted = true;
                return Ok(summary);
            }
        }
    }
}

/// Repeat the dispose until it is accepted. `None` when it was aborted.
async fn dispose(
    session: &mut Session,
    outcomes: &[SiteOutcome],
    options: &RunOptions,
    abort: &AtomicBool,
    summary: &mut RunSummary,
) -> DriverResult<Option<CallStatus>> {
    loop {
        match session.dispose_unit(outcomes).await? {
            CallStatus::Waiting => {
                summary.waits += 1;
                if abort.load(Ordering::Relaxed) {
                    session.schedule_abort();
                    expect_aborted(session.dispose_unit(outcomes).await)?;
                    return Ok(None);
                }
            }
            CallStatus::Paused => {
                warn!("device paused while binning, results will be retested");
                summary.pauses += 1;
                if abort.load(Ordering::Relaxed) {
                    return Ok(None);
                }
            }
            status => return Ok(Some(status)),
        }
        sleep(options.retry_delay).await;
    }
}

/// The repeated call closes its transaction with an abort; anything but a
/// hard failure is fine.
fn expect_aborted(result: DriverResult<CallStatus>) -> DriverResult<()> {
    match result {
        Ok(_) | Err(DriverError::Aborted) => Ok(()),
        Err(err) => Err(err),
    }
}
