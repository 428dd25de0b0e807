// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Step-tracked send, receive and event exchanges.
//!
//! Every exchange goes through [`Transaction::attempt_step`]. A step that an
//! earlier invocation of the same call already completed is not sent to the
//! link again; its journalled result is returned instead.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::{DriverError, DriverResult};
use crate::events::{EventHandler, HandlerId};
use crate::link::{Link, LinkError, LinkFuture, LinkKind};
use crate::reply::{Reply, ReplyShape};
use crate::transaction::{Attempt, CallId, Journal, StepCounters, Transaction};

/// Extra time granted to a link on top of the timeout it was handed.
const LINK_GRACE: Duration = Duration::from_millis(250);

/// Upper bound on events discarded by one [`Wire::drain_events`].
const MAX_DRAINED_EVENTS: usize = 64;

/// How an empty reply is reported when the caller expected content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyReply {
    /// The device is not ready yet.
    Waiting,
    /// The device answered garbage.
    Answer,
}

impl EmptyReply {
    pub fn for_kind(kind: LinkKind) -> Self {
        match kind {
            LinkKind::Lan => Self::Waiting,
            LinkKind::Gpib | LinkKind::Serial => Self::Answer,
        }
    }

    fn error(self) -> DriverError {
        match self {
            Self::Waiting => DriverError::Waiting,
            Self::Answer => DriverError::answer("empty reply"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WireSettings {
    pub heartbeat: Duration,
    pub eol: String,
    /// `None` derives the policy from the link kind.
    pub empty_reply: Option<EmptyReply>,
}

impl Default for WireSettings {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(5),
            eol: "\r\n".to_string(),
            empty_reply: None,
        }
    }
}

async fn bounded<T>(limit: Duration, fut: LinkFuture<'_, T>) -> Result<T, LinkError> {
    match timeout(limit + LINK_GRACE, fut).await {
        Ok(result) => result,
        Err(_) => Err(LinkError::Timeout),
    }
}

pub struct Wire {
    ta: Transaction,
    link: Box<dyn Link>,
    heartbeat: Duration,
    eol: String,
    empty_reply: EmptyReply,
}

impl Wire {
    pub fn new(link: Box<dyn Link>, settings: WireSettings) -> Self {
        let kind = link.kind();
        Self {
            ta: Transaction::new(),
            link,
            heartbeat: settings.heartbeat,
            eol: settings.eol,
            empty_reply: settings
                .empty_reply
                .unwrap_or_else(|| EmptyReply::for_kind(kind)),
        }
    }

    pub fn kind(&self) -> LinkKind {
        self.link.kind()
    }

    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    pub fn ta(&self) -> &Transaction {
        &self.ta
    }

    pub fn ta_mut(&mut self) -> &mut Transaction {
        &mut self.ta
    }

    pub fn counters(&self) -> StepCounters {
        self.ta.counters()
    }

    pub fn set_call(&mut self, call: CallId) {
        self.ta.set_call(call);
    }

    pub fn start(&mut self) {
        self.ta.start();
    }

    pub fn stop(&mut self) {
        self.ta.stop();
    }

    pub fn mark(&mut self) {
        self.ta.mark();
    }

    pub fn remove_step(&mut self) {
        self.ta.remove_step();
    }

    pub fn remove_to_mark(&mut self) {
        self.ta.remove_to_mark();
    }

    pub fn ask_abort(&mut self) -> bool {
        self.ta.ask_abort()
    }

    pub fn schedule_abort(&mut self) {
        self.ta.schedule_abort();
    }

    fn link_failure(&mut self, what: &str, err: LinkError) -> DriverError {
        match err {
            LinkError::Timeout => {
                debug!("{} timed out", what);
                DriverError::Timeout
            }
            LinkError::Transport(msg) => {
                warn!("{} failed: {}", what, msg);
                if self.link.kind().is_lossy_stream() {
                    // the stream position is unknown now
                    self.ta.stop();
                }
                DriverError::Transport(msg)
            }
        }
    }

    /// Send one message, terminated by the configured line terminator.
    pub async fn send(&mut self, message: &str) -> DriverResult<()> {
        if let Attempt::Replay(_) = self.ta.attempt_step() {
            trace!("skipping send of \"{}\"", message);
            return Ok(());
        }

        let mut bytes = Vec::with_capacity(message.len() + self.eol.len());
        bytes.extend_from_slice(message.as_bytes());
        bytes.extend_from_slice(self.eol.as_bytes());

        let heartbeat = self.heartbeat;
        let result = bounded(heartbeat, self.link.send(&bytes, heartbeat)).await;
        match result {
            Ok(()) => {
                debug!("-> \"{}\"", message);
                self.ta.commit_step(Journal::Sent);
                Ok(())
            }
            Err(err) => Err(self.link_failure("send", err)),
        }
    }

    /// Receive one reply and check it against `shape`.
    pub async fn receive(&mut self, shape: &ReplyShape) -> DriverResult<Reply> {
        match self.ta.attempt_step() {
            Attempt::Replay(Journal::Received(text)) => {
                trace!("replaying received \"{}\"", text);
                return shape.parse(&text).ok_or_else(|| {
                    DriverError::answer(format!("expected {}, got \"{}\"", shape, text))
                });
            }
            Attempt::Replay(other) => {
                return Err(DriverError::Internal(format!(
                    "receive step replays {:?}",
                    other
                )));
            }
            Attempt::Fresh => {}
        }

        let heartbeat = self.heartbeat;
        let result = bounded(heartbeat, self.link.receive(heartbeat)).await;
        let raw = match result {
            Ok(raw) => raw,
            Err(err) => return Err(self.link_failure("receive", err)),
        };
        let text = match String::from_utf8(raw) {
            Ok(text) => text.trim().to_string(),
            Err(err) => {
                warn!("reply is not valid UTF-8: {:02x?}", err.as_bytes());
                return Err(DriverError::answer("reply is not valid UTF-8"));
            }
        };
        debug!("<- \"{}\"", text);
        self.ta.commit_step(Journal::Received(text.clone()));

        if text.is_empty() && *shape != ReplyShape::FreeText {
            self.ta.remove_step();
            return Err(self.empty_reply.error());
        }

        match shape.parse(&text) {
            Some(reply) => Ok(reply),
            None => {
                warn!("expected {}, got \"{}\"", shape, text);
                self.ta.remove_step();
                Err(DriverError::answer(format!(
                    "expected {}, got \"{}\"",
                    shape, text
                )))
            }
        }
    }

    /// Send `message` and receive its answer. When the answer does not
    /// arrive or does not fit, the message itself is sent again next time.
    pub async fn query(&mut self, message: &str, shape: &ReplyShape) -> DriverResult<Reply> {
        self.send(message).await?;
        match self.receive(shape).await {
            Err(err) if err.is_transient() => {
                self.ta.remove_step();
                Err(err)
            }
            other => other,
        }
    }

    pub async fn clear_link(&mut self) -> DriverResult<()> {
        if let Attempt::Replay(_) = self.ta.attempt_step() {
            trace!("skipping link clear");
            return Ok(());
        }
        let heartbeat = self.heartbeat;
        let result = bounded(heartbeat, self.link.clear()).await;
        match result {
            Ok(()) => {
                debug!("link cleared");
                self.ta.commit_step(Journal::Cleared);
                Ok(())
            }
            Err(err) => Err(self.link_failure("clear", err)),
        }
    }

    /// One step-tracked event poll. The flag tells whether the event was
    /// received just now rather than replayed.
    async fn event_step(&mut self, fast: bool) -> DriverResult<(Option<u8>, bool)> {
        match self.ta.attempt_step() {
            Attempt::Replay(Journal::Event(code)) => {
                trace!("replaying event {:?}", code);
                return Ok((code, false));
            }
            Attempt::Replay(other) => {
                return Err(DriverError::Internal(format!(
                    "event step replays {:?}",
                    other
                )));
            }
            Attempt::Fresh => {}
        }

        let wait = if fast { Duration::ZERO } else { self.heartbeat };
        let result = bounded(wait, self.link.poll_event(wait)).await;
        let code = match result {
            Ok(code) => code,
            Err(LinkError::Timeout) => None,
            Err(err) => return Err(self.link_failure("event poll", err)),
        };
        match code {
            Some(code) => debug!("event 0x{:02x}", code),
            None => trace!("no event"),
        }
        self.ta.commit_step(Journal::Event(code));
        Ok((code, true))
    }

    /// Look for one pending event, waiting up to the heartbeat unless
    /// `fast`. A received event is offered to the registered handlers and
    /// the handler's result becomes the result of this call.
    pub async fn test_event(&mut self, fast: bool) -> DriverResult<Option<u8>> {
        let (code, fresh) = self.event_step(fast).await?;
        if let (Some(code), true) = (code, fresh) {
            if let Some(result) = self.ta.handlers().dispatch(code) {
                debug!("event 0x{:02x} handled by registered handler", code);
                result?;
            }
        }
        Ok(code)
    }

    /// Wait for one event from `accepted`. Events claimed by a registered
    /// handler are consumed; any other event is an answer error unless
    /// `accepted` is empty.
    pub async fn get_event(&mut self, accepted: &[u8]) -> DriverResult<u8> {
        let (code, fresh) = self.event_step(false).await?;
        let Some(code) = code else {
            self.ta.remove_step();
            return Err(DriverError::Waiting);
        };
        if !fresh || accepted.is_empty() || accepted.contains(&code) {
            return Ok(code);
        }

        self.ta.remove_step();
        if let Some(result) = self.ta.handlers().dispatch(code) {
            debug!("event 0x{:02x} handled by registered handler", code);
            result?;
            return Err(DriverError::Waiting);
        }
        warn!("unexpected event 0x{:02x}, expected one of {:02x?}", code, accepted);
        Err(DriverError::answer(format!("unexpected event 0x{:02x}", code)))
    }

    /// Discard pending events without step tracking.
    pub async fn drain_events(&mut self) -> usize {
        let mut drained = 0;
        while drained < MAX_DRAINED_EVENTS {
            match bounded(Duration::ZERO, self.link.poll_event(Duration::ZERO)).await {
                Ok(Some(code)) => {
                    debug!("discarding event 0x{:02x}", code);
                    drained += 1;
                }
                Ok(None) | Err(_) => break,
            }
        }
        drained
    }

    /// Register a handler for `code` in the current transaction scope.
    /// Links that deliver events in-band with replies have no event
    /// channel, so nothing is registered there.
    pub fn register_handler(
        &mut self,
        code: u8,
        handler: Arc<dyn EventHandler>,
    ) -> Option<HandlerId> {
        if self.link.kind().events_in_band() {
            debug!("event handler for 0x{:02x} ignored on in-band link", code);
            return None;
        }
        Some(self.ta.handlers_mut().register(code, handler))
    }

    pub fn unregister_handler(&mut self, id: HandlerId) {
        self.ta.handlers_mut().unregister(id);
    }
}
