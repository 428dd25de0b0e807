// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use serde::Serialize;
use thiserror::Error;

use crate::link::LinkError;

/// Failure kinds reported by driver operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The device did not answer within the heartbeat timeout.
    #[error("device did not respond in time")]
    Timeout,
    /// The device is not ready yet; the same call must be repeated.
    #[error("device not ready, call again")]
    Waiting,
    /// The device answered, but not in the expected shape.
    #[error("unexpected answer from device: {0}")]
    Answer(String),
    /// Bin data could not be resolved or was not acknowledged correctly.
    #[error("binning failed: {0}")]
    Binning(String),
    /// The host scheduled an abort for this operation.
    #[error("operation aborted")]
    Aborted,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("link failure: {0}")]
    Transport(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    /// The stepping machine ended a pass in an illegal combination of marks.
    #[error("internal stepping error: {0}")]
    Internal(String),
}

impl DriverError {
    pub fn answer(message: impl Into<String>) -> Self {
        Self::Answer(message.into())
    }

    pub fn binning(message: impl Into<String>) -> Self {
        Self::Binning(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn not_supported(what: impl Into<String>) -> Self {
        Self::NotSupported(what.into())
    }

    /// Errors resolved by repeating the identical call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Waiting | Self::Answer(_))
    }
}

impl From<LinkError> for DriverError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Timeout => Self::Timeout,
            LinkError::Transport(msg) => Self::Transport(msg),
        }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Outcome of one host-visible call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// The operation completed.
    Done,
    /// Call the identical operation again later.
    Waiting,
    /// The device reported a pause; the host should pause as well.
    Paused,
    /// The stepping pattern of the outermost level is exhausted.
    PatternDone,
}

impl CallStatus {
    /// Fold transient failures into [`CallStatus::Waiting`].
    pub fn settle(result: DriverResult<CallStatus>) -> DriverResult<CallStatus> {
        match result {
            Err(err) if err.is_transient() => Ok(CallStatus::Waiting),
            other => other,
        }
    }
}
