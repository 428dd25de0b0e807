// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Scripted link for development and testing.
//!
//! Replies and events are queued up front through a [`ScriptHandle`];
//! everything written to the link is recorded. No hardware is required and
//! nothing ever blocks: an empty reply queue behaves like a timeout.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{Link, LinkError, LinkFuture, LinkKind};

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<Result<Vec<u8>, LinkError>>,
    default_reply: Option<Vec<u8>>,
    events: VecDeque<u8>,
    send_faults: VecDeque<LinkError>,
    sent: Vec<Vec<u8>>,
    receives: usize,
    clears: usize,
}

/// Shared view on the script of a [`ScriptedLink`].
#[derive(Debug, Clone, Default)]
pub struct ScriptHandle {
    script: Arc<Mutex<Script>>,
}

impl ScriptHandle {
    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue one reply line.
    pub fn push_reply(&self, reply: &str) {
        self.lock().replies.push_back(Ok(reply.as_bytes().to_vec()));
    }

    /// Queue a reply given as raw bytes.
    pub fn push_reply_bytes(&self, reply: &[u8]) {
        self.lock().replies.push_back(Ok(reply.to_vec()));
    }

    /// Queue a failing receive.
    pub fn push_reply_error(&self, err: LinkError) {
        self.lock().replies.push_back(Err(err));
    }

    /// Reply used whenever the queue is empty.
    pub fn set_default_reply(&self, reply: Option<&str>) {
        self.lock().default_reply = reply.map(|r| r.as_bytes().to_vec());
    }

    pub fn push_event(&self, code: u8) {
        self.lock().events.push_back(code);
    }

    /// Make the next send fail with `err`.
    pub fn fail_next_send(&self, err: LinkError) {
        self.lock().send_faults.push_back(err);
    }

    /// Messages written so far, with trailing line terminators removed.
    pub fn sent(&self) -> Vec<String> {
        self.lock()
            .sent
            .iter()
            .map(|m| {
                String::from_utf8_lossy(m)
                    .trim_end_matches(['\r', '\n'])
                    .to_string()
            })
            .collect()
    }

    pub fn sent_raw(&self) -> Vec<Vec<u8>> {
        self.lock().sent.clone()
    }

    pub fn receive_count(&self) -> usize {
        self.lock().receives
    }

    pub fn clear_count(&self) -> usize {
        self.lock().clears
    }

    pub fn pending_replies(&self) -> usize {
        self.lock().replies.len()
    }

    pub fn pending_events(&self) -> usize {
        self.lock().events.len()
    }
}

pub struct ScriptedLink {
    kind: LinkKind,
    handle: ScriptHandle,
}

impl ScriptedLink {
    pub fn new(kind: LinkKind) -> Self {
        Self {
            kind,
            handle: ScriptHandle::default(),
        }
    }

    pub fn handle(&self) -> ScriptHandle {
        self.handle.clone()
    }
}

impl Link for ScriptedLink {
    fn kind(&self) -> LinkKind {
        self.kind
    }

    fn send<'a>(&'a mut self, message: &'a [u8], _timeout: Duration) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            let mut script = self.handle.lock();
            if let Some(err) = script.send_faults.pop_front() {
                return Err(err);
            }
            script.sent.push(message.to_vec());
            Ok(())
        })
    }

    fn receive<'a>(&'a mut self, _timeout: Duration) -> LinkFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let mut script = self.handle.lock();
            script.receives += 1;
            match script.replies.pop_front() {
                Some(reply) => reply,
                None => script.default_reply.clone().ok_or(LinkError::Timeout),
            }
        })
    }

    fn poll_event<'a>(&'a mut self, _timeout: Duration) -> LinkFuture<'a, Option<u8>> {
        Box::pin(async move { Ok(self.handle.lock().events.pop_front()) })
    }

    fn clear<'a>(&'a mut self) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            self.handle.lock().clears += 1;
            Ok(())
        })
    }
}
