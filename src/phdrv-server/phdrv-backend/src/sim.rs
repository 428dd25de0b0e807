// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Simulated handler for running without hardware.
//!
//! Speaks the [`crate::handler`] protocol on an out-of-band event bus.
//! Every free site receives a unit until the lot is used up; arrivals and
//! the end of the lot are signalled with events. Replies are available
//! immediately and an empty reply queue behaves like a timeout.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use tracing::{debug, info, warn};

use phdrv_core::link::LinkFuture;
use phdrv_core::{Link, LinkError, LinkKind};

use crate::handler::HANDLER_SITES;

const EVENT_LOT_END: u8 = 0x20;
const IDENTITY: &str = "PHDRV-SIM H4 1.0";

#[derive(Debug)]
pub struct SimHandler {
    site_ids: Vec<String>,
    units_left: u32,
    occupied: u8,
    echo: bool,
    lot_ended: bool,
    bins: BTreeMap<i64, u32>,
    reprobes: u32,
    replies: VecDeque<String>,
    events: VecDeque<u8>,
}

impl SimHandler {
    /// Handler with `site_ids` (at most four are served) and `lot_size`
    /// units. With `echo` every bin command is echoed for verification.
    pub fn new(site_ids: Vec<String>, lot_size: u32, echo: bool) -> Self {
        let mut site_ids = site_ids;
        if site_ids.len() > HANDLER_SITES {
            warn!(
                "simulated handler serves {} sites, ignoring {}",
                HANDLER_SITES,
                site_ids.len() - HANDLER_SITES
            );
            site_ids.truncate(HANDLER_SITES);
        }
        let mut sim = Self {
            site_ids,
            units_left: lot_size,
            occupied: 0,
            echo,
            lot_ended: false,
            bins: BTreeMap::new(),
            reprobes: 0,
            replies: VecDeque::new(),
            events: VecDeque::new(),
        };
        sim.load();
        sim
    }

    pub fn units_left(&self) -> u32 {
        self.units_left
    }

    /// Units sorted into each bin so far.
    pub fn bins(&self) -> &BTreeMap<i64, u32> {
        &self.bins
    }

    pub fn reprobes(&self) -> u32 {
        self.reprobes
    }

    /// Put units on all free sites and announce them.
    fn load(&mut self) {
        for bit in (0..self.site_ids.len()).map(|i| 1u8 << i) {
            if self.occupied & bit == 0 && self.units_left > 0 {
                self.occupied |= bit;
                self.units_left -= 1;
            }
        }
        if self.occupied != 0 {
            self.events.push_back(self.occupied);
        } else if !self.lot_ended {
            info!("simulated lot complete");
            self.lot_ended = true;
            self.events.push_back(EVENT_LOT_END);
        }
    }

    fn handle(&mut self, message: &str) {
        let text = message.trim();
        match text {
            "ID?" => self.replies.push_back(IDENTITY.to_string()),
            "SQB?" => self
                .replies
                .push_back(char::from(b'0' + self.occupied).to_string()),
            "ECHOOK" | "ECHONG" => self.replies.push_back(format!("ACK OK {}", text)),
            _ if is_bin_command(text) => self.bin(text),
            _ if text.ends_with('?') => self.replies.push_back("ERR".to_string()),
            _ => debug!("simulated handler ignores \"{}\"", text),
        }
    }

    fn bin(&mut self, command: &str) {
        let tokens: Vec<&str> = command.split_whitespace().collect();
        for triple in tokens.chunks(3) {
            let [site, verb, bin] = triple else {
                warn!("incomplete bin entry {:?}", triple);
                continue;
            };
            let Some(index) = self.site_ids.iter().position(|id| id == site) else {
                warn!("bin for unknown site {}", site);
                continue;
            };
            let Ok(bin) = bin.parse::<i64>() else {
                warn!("bad bin \"{}\" for site {}", bin, site);
                continue;
            };
            let bit = 1u8 << index;
            if self.occupied & bit == 0 {
                warn!("bin for empty site {}", site);
                continue;
            }
            match *verb {
                "BIN" => {
                    self.occupied &= !bit;
                    *self.bins.entry(bin).or_default() += 1;
                }
                "REPROBE" => self.reprobes += 1,
                other => warn!("unknown bin verb {}", other),
            }
        }
        if self.echo {
            self.replies.push_back(command.to_string());
        }
        self.load();
    }
}

fn is_bin_command(text: &str) -> bool {
    text.split_whitespace()
        .nth(1)
        .is_some_and(|verb| verb == "BIN" || verb == "REPROBE")
}

pub struct SimLink {
    sim: SimHandler,
}

impl SimLink {
    pub fn new(sim: SimHandler) -> Self {
        Self { sim }
    }

    pub fn sim(&self) -> &SimHandler {
        &self.sim
    }
}

impl Link for SimLink {
    fn kind(&self) -> LinkKind {
        LinkKind::Gpib
    }

    fn send<'a>(&'a mut self, message: &'a [u8], _timeout: Duration) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            self.sim.handle(&String::from_utf8_lossy(message));
            Ok(())
        })
    }

    fn receive<'a>(&'a mut self, _timeout: Duration) -> LinkFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.sim
                .replies
                .pop_front()
                .map(String::into_bytes)
                .ok_or(LinkError::Timeout)
        })
    }

    fn poll_event<'a>(&'a mut self, _timeout: Duration) -> LinkFuture<'a, Option<u8>> {
        Box::pin(async move { Ok(self.sim.events.pop_front()) })
    }

    /// Device clear drops unread replies; service requests stay pending.
    fn clear<'a>(&'a mut self) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            self.sim.replies.clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerProtocol;
    use phdrv_core::{BinCode, CallStatus, Session, SessionConfig, SiteOutcome};

    const T: Duration = Duration::from_millis(10);

    fn ids(n: usize) -> Vec<String> {
        (1..=n).map(|i| i.to_string()).collect()
    }

    async fn ask(link: &mut SimLink, message: &str) -> Result<String, LinkError> {
        link.send(message.as_bytes(), T).await?;
        link.receive(T)
            .await
            .map(|r| String::from_utf8_lossy(&r).to_string())
    }

    #[tokio::test]
    async fn test_lot_is_delivered_and_binned() {
        let mut link = SimLink::new(SimHandler::new(ids(2), 3, false));
        assert_eq!(link.poll_event(T).await, Ok(Some(0x03)));
        assert_eq!(ask(&mut link, "SQB?\r\n").await, Ok("3".to_string()));

        link.send(b"1 BIN 1 2 BIN 5 \r\n", T).await.unwrap();
        assert_eq!(link.receive(T).await, Err(LinkError::Timeout));
        assert_eq!(link.poll_event(T).await, Ok(Some(0x01)));
        assert_eq!(ask(&mut link, "SQB?").await, Ok("1".to_string()));

        link.send(b"1 BIN 1 ", T).await.unwrap();
        assert_eq!(link.poll_event(T).await, Ok(Some(0x20)));
        assert_eq!(ask(&mut link, "SQB?").await, Ok("0".to_string()));
        assert_eq!(link.sim().units_left(), 0);
        assert_eq!(link.sim().bins().get(&1), Some(&2));
        assert_eq!(link.sim().bins().get(&5), Some(&1));
    }

    #[tokio::test]
    async fn test_echo_and_reprobe() {
        let mut link = SimLink::new(SimHandler::new(ids(2), 2, true));
        link.poll_event(T).await.unwrap();

        assert_eq!(
            ask(&mut link, "1 REPROBE 9 2 BIN 3 ").await,
            Ok("1 REPROBE 9 2 BIN 3".to_string())
        );
        assert_eq!(
            ask(&mut link, "ECHOOK").await,
            Ok("ACK OK ECHOOK".to_string())
        );
        assert_eq!(link.poll_event(T).await, Ok(Some(0x01)));
        assert_eq!(link.sim().reprobes(), 1);
        assert_eq!(ask(&mut link, "ID?").await, Ok(IDENTITY.to_string()));
        assert_eq!(ask(&mut link, "LOT?").await, Ok("ERR".to_string()));
    }

    fn session(config: SessionConfig, lot: u32) -> Session {
        let link = SimLink::new(SimHandler::new(
            config.sites.clone(),
            lot,
            config.binning.verify,
        ));
        Session::new(config, Box::new(link), Box::new(HandlerProtocol::new())).unwrap()
    }

    /// Acquire and dispose until the lot ends; returns the number of
    /// disposed unit sets.
    async fn run_lot(session: &mut Session) -> usize {
        let outcomes = vec![SiteOutcome::pass(BinCode::Number(1)); session.sites().len()];
        let mut cycles = 0;
        for _ in 0..50 {
            match session.acquire_unit().await.unwrap() {
                CallStatus::Done => {}
                CallStatus::PatternDone => return cycles,
                CallStatus::Waiting | CallStatus::Paused => continue,
            }
            assert_eq!(
                session.dispose_unit(&outcomes).await,
                Ok(CallStatus::Done)
            );
            cycles += 1;
        }
        panic!("lot did not end");
    }

    #[tokio::test]
    async fn test_event_driven_lot_with_verification() {
        let mut config = SessionConfig {
            sites: ids(2),
            heartbeat_ms: 30,
            poll_interval_ms: 5,
            strict_polling: false,
            ..SessionConfig::default()
        };
        config.binning.verify = true;
        let mut session = session(config, 5);

        assert_eq!(session.initialize().await, Ok(CallStatus::Done));
        assert_eq!(run_lot(&mut session).await, 3);
    }

    #[tokio::test]
    async fn test_polled_lot_ends_by_wait_limit() {
        let config = SessionConfig {
            sites: ids(4),
            heartbeat_ms: 30,
            poll_interval_ms: 5,
            unit_wait_limit_ms: Some(10),
            ..SessionConfig::default()
        };
        let mut session = session(config, 6);
        assert_eq!(run_lot(&mut session).await, 2);
    }
}
