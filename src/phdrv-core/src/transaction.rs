// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Step bookkeeping that makes multi-exchange operations resumable.
//!
//! Every logical I/O operation of a host call is a numbered step. A call
//! that returns early (timeout, device not ready) leaves its committed
//! steps recorded, and the repeated call skips them instead of talking to
//! the device again. Committed steps keep their payload in a journal so the
//! skipped step can hand the same answer back to its caller.

use std::fmt;

use tracing::{debug, trace};

use crate::events::HandlerRegistry;
use crate::stepping::Level;

/// Identity of a host-visible operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallId {
    Initialize,
    Identify,
    Acquire(Level),
    Dispose(Level),
    Reprobe,
    Exec,
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialize => write!(f, "initialize"),
            Self::Identify => write!(f, "identify"),
            Self::Acquire(level) => write!(f, "acquire {}", level),
            Self::Dispose(level) => write!(f, "dispose {}", level),
            Self::Reprobe => write!(f, "reprobe"),
            Self::Exec => write!(f, "exec"),
        }
    }
}

/// Payload of a committed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Journal {
    Marker,
    Sent,
    Received(String),
    Event(Option<u8>),
    Cleared,
}

/// Outcome of [`Transaction::attempt_step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// Perform the real exchange.
    Fresh,
    /// Already done by an earlier invocation; here is what it produced.
    Replay(Journal),
}

/// Snapshot of the step counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepCounters {
    pub step: u32,
    pub steps_done: u32,
    pub step_mark: u32,
    pub steps_done_mark: u32,
}

#[derive(Debug, Clone, Default)]
struct Frame {
    counters: StepCounters,
    abort_requested: bool,
    last_call: Option<CallId>,
    current_call: Option<CallId>,
    journal: Vec<Journal>,
    handlers: HandlerRegistry,
}

/// Transaction context of one device session.
#[derive(Debug, Default)]
pub struct Transaction {
    frame: Frame,
    enclosing: Vec<Frame>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> StepCounters {
        self.frame.counters
    }

    pub fn last_call(&self) -> Option<CallId> {
        self.frame.last_call
    }

    pub fn current_call(&self) -> Option<CallId> {
        self.frame.current_call
    }

    pub fn abort_requested(&self) -> bool {
        self.frame.abort_requested
    }

    pub fn depth(&self) -> usize {
        self.enclosing.len()
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.frame.handlers
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.frame.handlers
    }

    /// Record which operation is running. A different operation than the
    /// previous one starts from scratch; the same one resumes.
    pub fn set_call(&mut self, call: CallId) {
        let f = &mut self.frame;
        f.last_call = f.current_call;
        f.current_call = Some(call);
        f.counters.step = 0;
        if f.last_call != f.current_call {
            debug!("transaction reset for new call {}", call);
            f.counters.steps_done = 0;
            f.journal.clear();
        } else {
            debug!("transaction resumed for repeated call {}", call);
        }
    }

    pub fn start(&mut self) {
        trace!("transaction started");
        self.frame.counters.step = 0;
    }

    /// The operation is complete; the next call is a fresh one. A pending
    /// abort stays scheduled for the next matching call.
    pub fn stop(&mut self) {
        trace!("transaction stopped");
        let f = &mut self.frame;
        f.counters.step = 0;
        f.counters.steps_done = 0;
        f.journal.clear();
    }

    pub fn reset(&mut self) {
        debug!("transaction reset");
        self.stop();
        self.frame.abort_requested = false;
    }

    pub fn schedule_abort(&mut self) {
        debug!("transaction abort scheduled");
        self.frame.abort_requested = true;
    }

    /// Consume a scheduled abort. Only a continuation of the operation that
    /// was running when the abort was scheduled is aborted; any other
    /// operation leaves the request pending.
    pub fn ask_abort(&mut self) -> bool {
        let f = &mut self.frame;
        if !f.abort_requested || f.last_call != f.current_call {
            return false;
        }
        f.abort_requested = false;
        debug!("transaction abort performed");
        true
    }

    pub fn attempt_step(&mut self) -> Attempt {
        let c = &mut self.frame.counters;
        c.step += 1;
        if c.steps_done >= c.step {
            let entry = self
                .frame
                .journal
                .get(c.step as usize - 1)
                .cloned()
                .unwrap_or(Journal::Marker);
            trace!(step = c.step, "step already done");
            Attempt::Replay(entry)
        } else {
            Attempt::Fresh
        }
    }

    pub fn commit_step(&mut self, entry: Journal) {
        let c = &mut self.frame.counters;
        c.steps_done = (c.steps_done + 1).min(c.step);
        let keep = c.steps_done.saturating_sub(1) as usize;
        self.frame.journal.truncate(keep);
        self.frame.journal.push(entry);
    }

    /// Forget the last step so that it is performed again.
    pub fn remove_step(&mut self) {
        trace!("transaction removed last step");
        let c = &mut self.frame.counters;
        c.step = c.step.saturating_sub(1);
        c.steps_done = c.steps_done.saturating_sub(1);
        let keep = c.steps_done as usize;
        self.frame.journal.truncate(keep);
    }

    /// Checkpoint for [`Transaction::remove_to_mark`]. The mark counts as
    /// a step of its own and is recorded only the first time it is reached.
    pub fn mark(&mut self) {
        match self.attempt_step() {
            Attempt::Replay(_) => {}
            Attempt::Fresh => {
                self.commit_step(Journal::Marker);
                let c = &mut self.frame.counters;
                c.step_mark = c.step - 1;
                c.steps_done_mark = c.steps_done - 1;
                trace!(step = c.step_mark, "transaction mark set");
            }
        }
    }

    /// Rewind to the last mark so that every step after it is redone.
    pub fn remove_to_mark(&mut self) {
        let c = &mut self.frame.counters;
        c.step = c.step_mark;
        c.steps_done = c.steps_done_mark;
        trace!(step = c.step, "transaction rewound to mark");
        let keep = c.steps_done as usize;
        self.frame.journal.truncate(keep);
    }

    /// Open an independent nested scope initialised from the current one.
    pub fn push(&mut self) {
        let nested = self.frame.clone();
        self.enclosing.push(std::mem::replace(&mut self.frame, nested));
    }

    /// Return to the enclosing scope. The root scope stays in place.
    pub fn pop(&mut self) -> bool {
        match self.enclosing.pop() {
            Some(frame) => {
                self.frame = frame;
                true
            }
            None => false,
        }
    }
}
