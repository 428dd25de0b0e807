// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Host-facing operations of one device session.
//!
//! Every operation follows the same frame: record the call identity, honour
//! a scheduled abort, run the exchanges under step tracking and close the
//! transaction once the operation is complete. Operations that have to wait
//! for the device return [`CallStatus::Waiting`] and continue where they
//! left off when called again.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::binning::{BinEngine, BinPlan, BinTable, SiteAction, SiteOutcome};
use crate::config::SessionConfig;
use crate::device::{DeviceInfo, DeviceProtocol};
use crate::error::{CallStatus, DriverError, DriverResult};
use crate::events::{EventHandler, HandlerId};
use crate::link::Link;
use crate::policies::PollingPolicy;
use crate::reply::ReplyShape;
use crate::site::{SitePopulation, SiteTable};
use crate::stepping::{
    Consistency, Coordinate, Level, StepActions, StepCall, StepFuture, StepMark, StepMode,
    StepResult, Stepper, StepperOutcome,
};
use crate::transaction::{CallId, StepCounters};
use crate::units::UnitWait;
use crate::wire::Wire;

/// Everything the stepper acts on.
struct Core {
    config: SessionConfig,
    info: DeviceInfo,
    wire: Wire,
    device: Box<dyn DeviceProtocol>,
    sites: SiteTable,
    bins: BinEngine,
    polling: Box<dyn PollingPolicy>,
    deepest: Level,
    waiting_since: Option<Instant>,
    outcomes: Vec<SiteOutcome>,
    trusted: bool,
    positions: [Option<Coordinate>; 2],
    probed: HashSet<(Coordinate, Option<Coordinate>)>,
}

impl Core {
    async fn wait_for_units(&mut self) -> DriverResult<StepResult<()>> {
        UnitWait {
            wire: &mut self.wire,
            device: self.device.as_mut(),
            sites: &mut self.sites,
            polling: self.polling.as_ref(),
            strict: self.config.strict_polling,
        }
        .acquire()
        .await
    }

    /// No units this time. Past the configured limit the level is over.
    fn keep_waiting(&mut self) -> DriverResult<StepResult<Coordinate>> {
        let since = *self.waiting_since.get_or_insert_with(Instant::now);
        match self.config.unit_wait_limit() {
            Some(limit) if since.elapsed() >= limit => {
                warn!("no units for {:?}, ending the pattern", since.elapsed());
                self.waiting_since = None;
                Ok(StepResult::Exhausted)
            }
            _ => Err(DriverError::Waiting),
        }
    }

    /// With explicit stepping, units on positions that were probed before
    /// are not tested again.
    fn mark_already_probed(&mut self) {
        if self.config.stepping.mode != StepMode::Explicit {
            return;
        }
        let die = self.positions[Level::Die.index()].unwrap_or_default();
        let sub = match self.deepest {
            Level::SubDie => self.positions[Level::SubDie.index()],
            Level::Die => None,
        };
        for index in 0..self.sites.len() {
            let populated = self
                .sites
                .get(index)
                .is_some_and(|s| s.population == SitePopulation::Populated);
            if !populated {
                continue;
            }
            let offset = self
                .config
                .stepping
                .site_offsets
                .get(index)
                .copied()
                .unwrap_or_default();
            if !self.probed.insert((die + offset, sub)) {
                info!("die {} on site index {} was probed before", die + offset, index);
                self.sites.mark_reprobed(index);
            }
        }
    }
}

impl StepActions for Core {
    fn acquire<'a>(
        &'a mut self,
        level: Level,
        target: Option<Coordinate>,
    ) -> StepFuture<'a, Coordinate> {
        Box::pin(async move {
            let at = match self.device.locate(level, target, &mut self.wire).await? {
                StepResult::Done(at) => at,
                other => return Ok(other),
            };
            self.positions[level.index()] = Some(at);
            if level != self.deepest {
                return Ok(StepResult::Done(at));
            }

            match self.wait_for_units().await {
                Ok(StepResult::Done(())) => {}
                Ok(other) => return Ok(other.map(|()| at)),
                Err(DriverError::Waiting | DriverError::Timeout) => return self.keep_waiting(),
                Err(err) => return Err(err),
            }
            self.waiting_since = None;
            self.sites.accept_pending();
            self.mark_already_probed();
            debug!("{} at {} acquired", level, at);
            Ok(StepResult::Done(at))
        })
    }

    fn dispose<'a>(&'a mut self, level: Level) -> StepFuture<'a, ()> {
        Box::pin(async move {
            if level != self.deepest {
                return self.device.release(level, &mut self.wire).await;
            }

            let plan = self
                .bins
                .table()
                .plan(&self.sites, &self.outcomes, self.trusted)?;
            self.bins
                .submit(&mut self.wire, self.device.as_mut(), &plan, &self.sites)
                .await?;
            match self.device.release(level, &mut self.wire).await? {
                StepResult::Done(()) => {}
                other => return Ok(other),
            }

            for index in plan.reprobe_sites() {
                self.sites.request_reprobe(index);
            }
            self.sites.after_bin();
            self.sites.expect_active();
            Ok(StepResult::Done(()))
        })
    }
}

pub struct Session {
    stepper: Stepper,
    core: Core,
}

impl Session {
    /// Build a session. The configuration is checked against itself and
    /// against the device capabilities before any I/O.
    pub fn new(
        config: SessionConfig,
        link: Box<dyn Link>,
        device: Box<dyn DeviceProtocol>,
    ) -> DriverResult<Self> {
        config.validate()?;
        let info = device.info();
        info.check_config(&config)?;

        let stepper = Stepper::new(config.die_pattern(), config.sub_die_pattern());
        let bins = BinEngine::new(
            BinTable::from_config(&config.binning),
            config.binning.verify,
            config.retry_policy(),
        );
        let core = Core {
            wire: Wire::new(link, config.wire_settings()),
            sites: SiteTable::new(&config.sites, &config.inactive_sites),
            polling: config.polling_policy(),
            deepest: stepper.deepest(),
            device,
            bins,
            waiting_since: None,
            outcomes: Vec::new(),
            trusted: true,
            positions: [None; 2],
            probed: HashSet::new(),
            info,
            config,
        };
        info!(
            "{} {} session with {} sites ({} stepping)",
            core.info.family,
            core.info.model,
            core.sites.len(),
            core.deepest
        );
        Ok(Self { stepper, core })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.core.info
    }

    pub fn sites(&self) -> &SiteTable {
        &self.core.sites
    }

    pub fn coordinate(&self, level: Level) -> Option<Coordinate> {
        self.stepper.coordinate(level)
    }

    pub fn marks(&self) -> Vec<StepMark> {
        self.stepper.marks()
    }

    pub fn counters(&self) -> StepCounters {
        self.core.wire.counters()
    }

    pub fn is_paused(&self) -> bool {
        self.stepper.pending_pause().is_some()
    }

    /// Open a call. Fails with [`DriverError::Aborted`] when the host
    /// scheduled an abort for this operation.
    fn begin(&mut self, call: CallId) -> DriverResult<()> {
        let wire = &mut self.core.wire;
        wire.set_call(call);
        if wire.ask_abort() {
            info!("{} aborted", call);
            wire.stop();
            self.core.bins.reset();
            return Err(DriverError::Aborted);
        }
        wire.start();
        Ok(())
    }

    /// Close a call. Completed calls and hard failures end the
    /// transaction; transient failures keep it for the repeated call.
    fn finish<T>(&mut self, result: DriverResult<T>) -> DriverResult<T> {
        match &result {
            Err(err) if err.is_transient() => debug!("call will be repeated: {}", err),
            Err(err) => {
                warn!("call failed: {}", err);
                self.core.wire.stop();
                self.core.bins.reset();
            }
            Ok(_) => {
                self.core.wire.stop();
                self.core.bins.reset();
            }
        }
        result
    }

    fn settle_pass(&mut self, call: StepCall, outcome: StepperOutcome) -> DriverResult<CallStatus> {
        if let Some(err) = outcome.error {
            return Err(err);
        }
        match self.stepper.check(call, outcome.pattern_done) {
            Consistency::Settled if outcome.pattern_done => {
                info!("stepping pattern complete");
                self.core.probed.clear();
                Ok(CallStatus::PatternDone)
            }
            Consistency::Settled => Ok(CallStatus::Done),
            Consistency::Paused => {
                info!("device paused");
                Ok(CallStatus::Paused)
            }
            Consistency::Broken => Err(DriverError::Internal(format!(
                "stepper marks {:?} after {:?}",
                self.stepper.marks(),
                call
            ))),
        }
    }

    pub async fn initialize(&mut self) -> DriverResult<CallStatus> {
        self.begin(CallId::Initialize)?;
        let core = &mut self.core;
        let result = core.device.initialize(&mut core.wire).await;
        let result = self.finish(result.map(|()| CallStatus::Done));
        CallStatus::settle(result)
    }

    /// Identification of the device; `None` means call again.
    pub async fn identify(&mut self) -> DriverResult<Option<String>> {
        if !self.core.info.capabilities.identify {
            return Err(DriverError::not_supported(format!(
                "identify on {}",
                self.core.info.family
            )));
        }
        self.begin(CallId::Identify)?;
        let core = &mut self.core;
        let result = core.device.identify(&mut core.wire).await;
        match self.finish(result) {
            Ok(id) => Ok(Some(id)),
            Err(err) if err.is_transient() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Get the next unit under test.
    pub async fn acquire_unit(&mut self) -> DriverResult<CallStatus> {
        self.begin(CallId::Acquire(self.core.deepest))?;
        if self.stepper.pending_pause() == Some(StepMark::WaitDisposePaused) {
            info!("device paused during dispose, no new units requested");
            self.core.wire.stop();
            return Ok(CallStatus::Paused);
        }

        let outcome = self.stepper.run(StepCall::Acquire, &mut self.core).await;
        let result = self.settle_pass(StepCall::Acquire, outcome);
        let result = self.finish(result);
        CallStatus::settle(result)
    }

    /// Bin the units under test, one outcome per configured site.
    pub async fn dispose_unit(&mut self, outcomes: &[SiteOutcome]) -> DriverResult<CallStatus> {
        self.begin(CallId::Dispose(self.core.deepest))?;
        if self.core.wire.counters().steps_done == 0 {
            // not a repeat, the resend budget starts over
            self.core.bins.reset();
        }
        match self.stepper.pending_pause() {
            Some(StepMark::WaitStartPaused) => {
                info!("device paused while waiting for units, nothing to bin");
                self.core.wire.stop();
                return Ok(CallStatus::Done);
            }
            Some(StepMark::WaitDisposePaused) => {
                warn!("device paused during the last dispose, results are not trusted");
                self.core.trusted = false;
            }
            _ => self.core.trusted = true,
        }
        self.core.outcomes = outcomes.to_vec();

        let outcome = self.stepper.run(StepCall::Dispose, &mut self.core).await;
        let result = self.settle_pass(StepCall::Dispose, outcome);
        let result = self.finish(result);
        CallStatus::settle(result)
    }

    /// Send every populated unit back for reprobe and wait for it to
    /// return, within one operation.
    pub async fn reprobe_units(&mut self) -> DriverResult<CallStatus> {
        if !self.core.info.capabilities.reprobe {
            return Err(DriverError::not_supported(format!(
                "reprobe on {}",
                self.core.info.family
            )));
        }
        let Some(bin) = self.core.bins.table().reprobe_bin() else {
            return Err(DriverError::config(
                "reprobe requested but no reprobe bin is configured",
            ));
        };
        self.begin(CallId::Reprobe)?;
        let result = self.reprobe_in_place(bin).await;
        let result = self.finish(result);
        CallStatus::settle(result)
    }

    async fn reprobe_in_place(&mut self, bin: i64) -> DriverResult<CallStatus> {
        let core = &mut self.core;
        let plan = BinPlan::new(
            core.sites
                .iter()
                .map(|s| match s.population {
                    SitePopulation::Populated | SitePopulation::PopulatedDeactivated => {
                        SiteAction::Reprobe(bin)
                    }
                    _ => SiteAction::Skip,
                })
                .collect(),
        );
        if plan.is_empty() {
            info!("no units to reprobe");
            return Ok(CallStatus::Done);
        }
        core.bins
            .submit(&mut core.wire, core.device.as_mut(), &plan, &core.sites)
            .await?;
        for index in plan.reprobe_sites() {
            core.sites.request_reprobe(index);
        }
        core.sites.after_bin();

        match core.wait_for_units().await? {
            StepResult::Done(()) => {
                core.sites.accept_pending();
                Ok(CallStatus::Done)
            }
            StepResult::Paused => Ok(CallStatus::Paused),
            StepResult::Exhausted => Ok(CallStatus::PatternDone),
        }
    }

    /// Pass a raw command to the device. A command ending in `?` returns
    /// the device's answer. `None` means call again.
    pub async fn exec(&mut self, command: &str) -> DriverResult<Option<String>> {
        self.begin(CallId::Exec)?;
        let wire = &mut self.core.wire;
        let result = match wire.send(command).await {
            Ok(()) if command.trim_end().ends_with('?') => wire
                .receive(&ReplyShape::FreeText)
                .await
                .map(|reply| reply.text),
            Ok(()) => Ok(String::new()),
            Err(err) => Err(err),
        };
        match self.finish(result) {
            Ok(answer) => Ok(Some(answer)),
            Err(err) if err.is_transient() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Abort the running operation at its next invocation.
    pub fn schedule_abort(&mut self) {
        self.core.wire.schedule_abort();
    }

    /// Forget all progress: transaction, stepping and site population.
    pub fn reset(&mut self) {
        info!("session reset");
        self.core.wire.ta_mut().reset();
        self.stepper.reset();
        self.core.sites.clear_population();
        self.core.bins.reset();
        self.core.waiting_since = None;
        self.core.positions = [None; 2];
        self.core.probed.clear();
    }

    pub fn register_event_handler(
        &mut self,
        code: u8,
        handler: Arc<dyn EventHandler>,
    ) -> Option<HandlerId> {
        self.core.wire.register_handler(code, handler)
    }

    pub fn unregister_event_handler(&mut self, id: HandlerId) {
        self.core.wire.unregister_handler(id);
    }

    pub fn set_site_active(&mut self, id: &str, active: bool) -> DriverResult<()> {
        let index = self
            .core
            .sites
            .index_of(id)
            .ok_or_else(|| DriverError::config(format!("unknown site \"{}\"", id)))?;
        self.core.sites.set_active(index, active);
        info!("site {} {}", id, if active { "activated" } else { "deactivated" });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::BinCode;
    use crate::device::testing::TestHandler;
    use crate::link::{LinkKind, ScriptHandle, ScriptedLink};
    use std::time::Duration;

    fn config(sites: usize) -> SessionConfig {
        SessionConfig {
            sites: (1..=sites).map(|i| i.to_string()).collect(),
            heartbeat_ms: 30,
            poll_interval_ms: 5,
            ..SessionConfig::default()
        }
    }

    fn session(config: SessionConfig, device: TestHandler) -> (Session, ScriptHandle) {
        let link = ScriptedLink::new(LinkKind::Gpib);
        let script = link.handle();
        let session = Session::new(config, Box::new(link), Box::new(device)).unwrap();
        (session, script)
    }

    fn pass(bin: i64) -> SiteOutcome {
        SiteOutcome::pass(BinCode::Number(bin))
    }

    fn count(sent: &[String], message: &str) -> usize {
        sent.iter().filter(|m| m.as_str() == message).count()
    }

    #[tokio::test]
    async fn test_acquire_first_poll_populated() {
        let mut cfg = config(1);
        cfg.stepping.mode = StepMode::Explicit;
        cfg.stepping.die_pattern = vec![Coordinate::new(3, 4)];
        let mut device = TestHandler::new();
        device.caps.coordinates = true;
        let (mut s, script) = session(cfg, device);
        script.push_reply("1");

        assert_eq!(s.acquire_unit().await, Ok(CallStatus::Done));
        assert_eq!(s.sites().get(0).unwrap().population, SitePopulation::Populated);
        assert_eq!(s.coordinate(Level::Die), Some(Coordinate::new(3, 4)));
        assert_eq!(s.marks(), vec![StepMark::Active]);
        assert_eq!(s.counters(), StepCounters::default());
    }

    #[tokio::test]
    async fn test_acquire_without_units_keeps_waiting() {
        let (mut s, script) = session(config(1), TestHandler::new());
        script.set_default_reply(Some("0"));

        for _ in 0..2 {
            assert_eq!(s.acquire_unit().await, Ok(CallStatus::Waiting));
            assert_eq!(s.counters(), StepCounters::default());
            assert_eq!(s.marks(), vec![StepMark::WaitStart]);
        }
    }

    #[tokio::test]
    async fn test_unit_wait_limit_ends_pattern() {
        let mut cfg = config(1);
        cfg.unit_wait_limit_ms = Some(20);
        let (mut s, script) = session(cfg, TestHandler::new());
        script.set_default_reply(Some("0"));

        assert_eq!(s.acquire_unit().await, Ok(CallStatus::Waiting));
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(s.acquire_unit().await, Ok(CallStatus::PatternDone));
        assert_eq!(s.marks(), vec![StepMark::Out]);
    }

    #[tokio::test]
    async fn test_verify_mismatch_resends_once_then_fails() {
        let mut cfg = config(1);
        cfg.binning.verify = true;
        cfg.binning.max_retries = 1;
        let (mut s, script) = session(cfg, TestHandler::new());
        script.push_reply("1");
        assert_eq!(s.acquire_unit().await, Ok(CallStatus::Done));

        for reply in ["BIN 1:2", "ACK ECHONG", "BIN 1:2", "ACK ECHONG"] {
            script.push_reply(reply);
        }
        let result = s.dispose_unit(&[pass(1)]).await;
        assert!(matches!(result, Err(DriverError::Binning(_))));
        let sent = script.sent();
        assert_eq!(count(&sent, "BIN 1:1"), 2);
        assert_eq!(count(&sent, "ECHONG"), 2);
        assert_eq!(s.counters(), StepCounters::default());
    }

    #[tokio::test]
    async fn test_verify_match_after_one_resend() {
        let mut cfg = config(1);
        cfg.binning.verify = true;
        cfg.binning.max_retries = 1;
        let (mut s, script) = session(cfg, TestHandler::new());
        script.push_reply("1");
        s.acquire_unit().await.unwrap();

        for reply in ["BIN 1:7", "ACK ECHONG", "bin 1:1", "ACK ECHOOK"] {
            script.push_reply(reply);
        }
        assert_eq!(s.dispose_unit(&[pass(1)]).await, Ok(CallStatus::Done));
        assert_eq!(
            script.sent(),
            vec!["SQB?", "BIN 1:1", "ECHONG", "BIN 1:1", "ECHOOK"]
        );
        assert_eq!(s.sites().get(0).unwrap().population, SitePopulation::Empty);
    }

    #[tokio::test]
    async fn test_resend_budget_is_per_dispose() {
        let mut cfg = config(1);
        cfg.binning.verify = true;
        cfg.binning.max_retries = 1;
        let (mut s, script) = session(cfg, TestHandler::new());

        for bin in [1, 2] {
            script.push_reply("1");
            assert_eq!(s.acquire_unit().await, Ok(CallStatus::Done));
            for reply in ["BIN 1:0", "ACK ECHONG"] {
                script.push_reply(reply);
            }
            script.push_reply(&format!("BIN 1:{}", bin));
            script.push_reply("ACK ECHOOK");
            assert_eq!(s.dispose_unit(&[pass(bin)]).await, Ok(CallStatus::Done));
        }
        let sent = script.sent();
        assert_eq!(count(&sent, "BIN 1:1"), 2);
        assert_eq!(count(&sent, "BIN 1:2"), 2);
        assert_eq!(count(&sent, "ECHONG"), 2);
    }

    #[tokio::test]
    async fn test_aborted_dispose_does_not_spend_next_budget() {
        let mut cfg = config(1);
        cfg.binning.verify = true;
        cfg.binning.max_retries = 1;
        let (mut s, script) = session(cfg, TestHandler::new());
        script.push_reply("1");
        s.acquire_unit().await.unwrap();

        // one resend used, then its echo does not arrive
        for reply in ["BIN 1:2", "ACK ECHONG"] {
            script.push_reply(reply);
        }
        assert_eq!(s.dispose_unit(&[pass(1)]).await, Ok(CallStatus::Waiting));
        s.schedule_abort();
        assert_eq!(s.dispose_unit(&[pass(1)]).await, Err(DriverError::Aborted));
        assert_eq!(s.counters(), StepCounters::default());

        for reply in ["BIN 1:2", "ACK ECHONG", "BIN 1:1", "ACK ECHOOK"] {
            script.push_reply(reply);
        }
        assert_eq!(s.dispose_unit(&[pass(1)]).await, Ok(CallStatus::Done));
        assert_eq!(
            script.sent(),
            vec![
                "SQB?", "BIN 1:1", "ECHONG", "BIN 1:1", "BIN 1:1", "ECHONG", "BIN 1:1", "ECHOOK"
            ]
        );
    }

    #[tokio::test]
    async fn test_dispose_is_resumed_not_resent() {
        let mut cfg = config(1);
        cfg.binning.verify = true;
        let (mut s, script) = session(cfg, TestHandler::new());
        script.push_reply("1");
        s.acquire_unit().await.unwrap();

        // the echo does not arrive in time
        assert_eq!(s.dispose_unit(&[pass(3)]).await, Ok(CallStatus::Waiting));
        script.push_reply("BIN 1:3");
        script.push_reply("ACK ECHOOK");
        assert_eq!(s.dispose_unit(&[pass(3)]).await, Ok(CallStatus::Done));
        assert_eq!(script.sent(), vec!["SQB?", "BIN 1:3", "ECHOOK"]);
    }

    #[tokio::test]
    async fn test_two_of_four_sites_reprobed_in_one_command() {
        let mut cfg = config(4);
        cfg.binning.reprobe_bin = Some(9);
        let (mut s, script) = session(cfg, TestHandler::new());
        script.push_reply("F");
        s.acquire_unit().await.unwrap();

        let outcomes = [
            SiteOutcome::reprobe(),
            pass(1),
            SiteOutcome::reprobe(),
            SiteOutcome::fail(BinCode::Number(5)),
        ];
        assert_eq!(s.dispose_unit(&outcomes).await, Ok(CallStatus::Done));
        assert_eq!(script.sent(), vec!["SQB?", "BIN 1:R9 2:1 3:R9 4:5"]);

        // only site 1 returns its unit
        script.push_reply("1");
        s.acquire_unit().await.unwrap();
        let populations: Vec<_> = s.sites().iter().map(|r| r.population).collect();
        assert_eq!(
            populations,
            vec![
                SitePopulation::Populated,
                SitePopulation::Empty,
                SitePopulation::Empty,
                SitePopulation::Empty
            ]
        );
    }

    #[tokio::test]
    async fn test_reprobe_without_bin_fails_before_io() {
        let (mut s, script) = session(config(1), TestHandler::new());
        script.push_reply("1");
        s.acquire_unit().await.unwrap();

        let result = s.dispose_unit(&[SiteOutcome::reprobe()]).await;
        assert!(matches!(result, Err(DriverError::Config(_))));
        assert_eq!(script.sent(), vec!["SQB?"]);
        assert!(matches!(s.reprobe_units().await, Err(DriverError::Config(_))));
    }

    #[tokio::test]
    async fn test_reprobe_units_in_place() {
        let mut cfg = config(2);
        cfg.binning.reprobe_bin = Some(9);
        let (mut s, script) = session(cfg, TestHandler::new());
        script.push_reply("3");
        s.acquire_unit().await.unwrap();

        script.push_reply("3");
        assert_eq!(s.reprobe_units().await, Ok(CallStatus::Done));
        assert_eq!(script.sent(), vec!["SQB?", "BIN 1:R9 2:R9", "SQB?"]);
        assert!(s
            .sites()
            .iter()
            .all(|r| r.population == SitePopulation::Populated));
    }

    #[tokio::test]
    async fn test_abort_is_honoured_on_repeat() {
        let (mut s, script) = session(config(1), TestHandler::new());
        script.set_default_reply(Some("0"));
        assert_eq!(s.acquire_unit().await, Ok(CallStatus::Waiting));
        s.schedule_abort();
        assert_eq!(s.acquire_unit().await, Err(DriverError::Aborted));
    }

    #[tokio::test]
    async fn test_paused_acquire_skips_binning() {
        let (mut s, script) = session(config(1), TestHandler::new());
        script.push_reply("PAUSED");
        assert_eq!(s.acquire_unit().await, Ok(CallStatus::Paused));
        assert!(s.is_paused());

        assert_eq!(s.dispose_unit(&[pass(1)]).await, Ok(CallStatus::Done));
        assert_eq!(script.sent(), vec!["SQB?"]);

        script.push_reply("1");
        assert_eq!(s.acquire_unit().await, Ok(CallStatus::Done));
        assert!(!s.is_paused());
    }

    #[tokio::test]
    async fn test_paused_dispose_rebins_to_retest() {
        let mut cfg = config(1);
        cfg.binning.retest_bin = Some(0);
        let mut device = TestHandler::new();
        device.pause_next_release = true;
        let (mut s, script) = session(cfg, device);
        script.push_reply("1");
        s.acquire_unit().await.unwrap();

        assert_eq!(s.dispose_unit(&[pass(1)]).await, Ok(CallStatus::Paused));
        assert_eq!(s.acquire_unit().await, Ok(CallStatus::Paused));
        assert_eq!(s.dispose_unit(&[pass(1)]).await, Ok(CallStatus::Done));
        assert_eq!(script.sent(), vec!["SQB?", "BIN 1:1", "BIN 1:0"]);
    }

    #[tokio::test]
    async fn test_sub_die_cycle() {
        let mut cfg = config(1);
        cfg.stepping.mode = StepMode::Explicit;
        cfg.stepping.sub_die = true;
        cfg.stepping.die_pattern = vec![Coordinate::new(0, 0)];
        cfg.stepping.sub_die_pattern = vec![Coordinate::new(0, 0), Coordinate::new(1, 0)];
        let mut device = TestHandler::new();
        device.caps.coordinates = true;
        device.caps.sub_die = true;
        let (mut s, script) = session(cfg, device);

        script.push_reply("1");
        assert_eq!(s.acquire_unit().await, Ok(CallStatus::Done));
        assert_eq!(s.dispose_unit(&[pass(1)]).await, Ok(CallStatus::Done));
        assert_eq!(s.marks(), vec![StepMark::Active, StepMark::Step]);

        script.push_reply("1");
        assert_eq!(s.acquire_unit().await, Ok(CallStatus::Done));
        assert_eq!(s.coordinate(Level::SubDie), Some(Coordinate::new(1, 0)));
        assert_eq!(s.dispose_unit(&[pass(2)]).await, Ok(CallStatus::PatternDone));
        assert_eq!(s.marks(), vec![StepMark::Out, StepMark::Out]);
        assert_eq!(script.sent(), vec!["SQB?", "BIN 1:1", "SQB?", "BIN 1:2"]);
    }

    #[tokio::test]
    async fn test_device_chosen_sub_dies_across_dies() {
        let mut cfg = config(1);
        cfg.stepping.mode = StepMode::Learn;
        cfg.stepping.sub_die = true;
        let mut device = TestHandler::new();
        device.caps.sub_die = true;
        device.locations = [
            StepResult::Done(Coordinate::new(0, 0)),
            StepResult::Done(Coordinate::new(0, 0)),
            StepResult::Exhausted,
            StepResult::Done(Coordinate::new(1, 0)),
            StepResult::Done(Coordinate::new(0, 0)),
            StepResult::Exhausted,
            StepResult::Exhausted,
        ]
        .into();
        let (mut s, script) = session(cfg, device);

        script.push_reply("1");
        assert_eq!(s.acquire_unit().await, Ok(CallStatus::Done));
        assert_eq!(s.dispose_unit(&[pass(1)]).await, Ok(CallStatus::Done));
        assert_eq!(s.marks(), vec![StepMark::Active, StepMark::Step]);

        // no sub-die left on die (0, 0): the same acquire moves on
        script.push_reply("1");
        assert_eq!(s.acquire_unit().await, Ok(CallStatus::Done));
        assert_eq!(s.marks(), vec![StepMark::Active, StepMark::Active]);
        assert_eq!(s.coordinate(Level::Die), Some(Coordinate::new(1, 0)));
        assert_eq!(s.coordinate(Level::SubDie), Some(Coordinate::new(0, 0)));
        assert_eq!(s.dispose_unit(&[pass(2)]).await, Ok(CallStatus::Done));

        assert_eq!(s.acquire_unit().await, Ok(CallStatus::PatternDone));
        assert_eq!(s.marks(), vec![StepMark::Out, StepMark::Out]);
        assert_eq!(s.counters(), StepCounters::default());
        assert_eq!(script.sent(), vec!["SQB?", "BIN 1:1", "SQB?", "BIN 1:2"]);
    }

    #[tokio::test]
    async fn test_revisited_die_is_not_binned_again() {
        let mut cfg = config(1);
        cfg.stepping.mode = StepMode::Explicit;
        cfg.stepping.die_pattern = vec![Coordinate::new(5, 5), Coordinate::new(5, 5)];
        let mut device = TestHandler::new();
        device.caps.coordinates = true;
        let (mut s, script) = session(cfg, device);

        script.push_reply("1");
        s.acquire_unit().await.unwrap();
        s.dispose_unit(&[pass(1)]).await.unwrap();
        script.push_reply("1");
        s.acquire_unit().await.unwrap();
        assert_eq!(
            s.sites().get(0).unwrap().population,
            SitePopulation::PopulatedReprobed
        );
        assert_eq!(s.dispose_unit(&[pass(1)]).await, Ok(CallStatus::PatternDone));
        assert_eq!(script.sent(), vec!["SQB?", "BIN 1:1", "SQB?"]);
    }

    #[tokio::test]
    async fn test_exec_and_identify() {
        let (mut s, script) = session(config(1), TestHandler::new());
        script.push_reply("TEST HANDLER 1.0");
        assert_eq!(s.identify().await, Ok(Some("TEST HANDLER 1.0".to_string())));

        script.push_reply("READY");
        assert_eq!(s.exec("STATE?").await, Ok(Some("READY".to_string())));
        assert_eq!(s.exec("LOTSTART").await, Ok(Some(String::new())));
        assert_eq!(s.exec("STATE?").await, Ok(None));
        assert_eq!(script.sent(), vec!["ID?", "STATE?", "LOTSTART", "STATE?"]);
    }

    #[tokio::test]
    async fn test_initialize_and_reset() {
        let (mut s, script) = session(config(2), TestHandler::new());
        assert_eq!(s.initialize().await, Ok(CallStatus::Done));
        assert_eq!(script.clear_count(), 1);

        script.push_reply("3");
        s.acquire_unit().await.unwrap();
        s.set_site_active("2", false).unwrap();
        assert!(s.set_site_active("9", false).is_err());
        s.reset();
        assert_eq!(s.marks(), vec![StepMark::Out]);
        assert_eq!(
            s.sites().get(1).unwrap().population,
            SitePopulation::Deactivated
        );
    }

    #[test]
    fn test_capability_mismatch_is_rejected() {
        let mut cfg = config(1);
        cfg.stepping.sub_die = true;
        let link = ScriptedLink::new(LinkKind::Gpib);
        let result = Session::new(cfg, Box::new(link), Box::new(TestHandler::new()));
        assert!(matches!(result, Err(DriverError::NotSupported(_))));
    }
}
