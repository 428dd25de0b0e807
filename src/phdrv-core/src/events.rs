// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Service-request (event) handler registry.
//!
//! Handlers are registered per event code and consulted in registration
//! order whenever an event arrives that the waiting operation did not ask
//! for itself. The first handler registered for a code claims it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::DriverResult;

/// Unique identifier for a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Reacts to one asynchronous event code.
///
/// The result of the handler becomes the result of the exchange that
/// received the event.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, code: u8) -> DriverResult<()>;
}

impl<F> EventHandler for F
where
    F: Fn(u8) -> DriverResult<()> + Send + Sync,
{
    fn on_event(&self, code: u8) -> DriverResult<()> {
        self(code)
    }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Vec<(HandlerId, u8, Arc<dyn EventHandler>)>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|(id, code, _)| (id, code)))
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `code`.
    /// Returns an ID that can be used to unregister the handler.
    pub fn register(&mut self, code: u8, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = HandlerId::new();
        self.handlers.push((id, code, handler));
        id
    }

    pub fn unregister(&mut self, id: HandlerId) {
        self.handlers.retain(|(hid, _, _)| *hid != id);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_claimed(&self, code: u8) -> bool {
        self.handlers.iter().any(|(_, c, _)| *c == code)
    }

    /// Offer `code` to the first matching handler.
    /// Returns `None` when no handler is registered for it.
    pub fn dispatch(&self, code: u8) -> Option<DriverResult<()>> {
        self.handlers
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(_, _, handler)| handler.on_event(code))
    }
}
