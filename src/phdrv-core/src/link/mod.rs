// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Transport contract consumed by the driver core.
//!
//! A link moves opaque byte messages and single-byte asynchronous events.
//! Framing (line terminators, block delimiters) belongs to the transport;
//! the core only sees whole messages.

pub mod scripted;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use scripted::{ScriptHandle, ScriptedLink};

pub type LinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LinkError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link operation timed out")]
    Timeout,
    #[error("{0}")]
    Transport(String),
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::Timeout,
            _ => Self::Transport(err.to_string()),
        }
    }
}

/// Physical flavour of a link, which decides a few error-handling rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// IEEE-488 style bus with out-of-band service requests.
    Gpib,
    /// Byte stream that may drop or duplicate data on faults.
    Serial,
    /// Line-oriented network socket.
    Lan,
}

impl LinkKind {
    /// A transport fault may leave the stream desynchronised.
    pub fn is_lossy_stream(self) -> bool {
        matches!(self, Self::Serial)
    }

    /// Events arrive as ordinary replies rather than on a side channel.
    pub fn events_in_band(self) -> bool {
        !matches!(self, Self::Gpib)
    }
}

/// Bounded-time transport used by [`crate::wire::Wire`].
pub trait Link: Send {
    fn kind(&self) -> LinkKind;

    fn send<'a>(&'a mut self, message: &'a [u8], timeout: Duration) -> LinkFuture<'a, ()>;

    fn receive<'a>(&'a mut self, timeout: Duration) -> LinkFuture<'a, Vec<u8>>;

    /// Wait up to `timeout` for one event byte; `Ok(None)` when none arrived.
    fn poll_event<'a>(&'a mut self, timeout: Duration) -> LinkFuture<'a, Option<u8>>;

    /// Flush buffers and reset the interface.
    fn clear<'a>(&'a mut self) -> LinkFuture<'a, ()>;
}
