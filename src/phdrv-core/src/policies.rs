// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Retry and polling policies.
//!
//! Retry policies bound how often a rejected bin command is sent again;
//! polling policies bound how long a single call keeps asking the device
//! for new units.

use std::time::Duration;

/// Policy for resending a bin command whose echo did not match.
pub trait RetryPolicy: Send + Sync {
    /// `attempt` counts the mismatches seen so far, starting at 1.
    fn should_retry(&self, attempt: u32) -> bool;

    /// Total number of times the command may be sent.
    fn max_attempts(&self) -> u32;
}

/// Resend up to `max_retries` times.
#[derive(Debug, Clone, Copy)]
pub struct VerifyRetry {
    max_retries: u32,
}

impl VerifyRetry {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }
}

impl Default for VerifyRetry {
    fn default() -> Self {
        Self::new(2)
    }
}

impl RetryPolicy for VerifyRetry {
    fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// No retry policy - the first mismatch is final.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _attempt: u32) -> bool {
        false
    }

    fn max_attempts(&self) -> u32 {
        1
    }
}

/// Policy for polling the device while waiting for units.
pub trait PollingPolicy: Send + Sync {
    /// Pause between two polls.
    fn interval(&self) -> Duration;

    /// Whether another poll fits into the current call.
    fn should_poll(&self, elapsed: Duration) -> bool;
}

/// Keep polling at a fixed interval until the heartbeat would be exceeded.
#[derive(Debug, Clone)]
pub struct HeartbeatPolling {
    interval: Duration,
    heartbeat: Duration,
}

impl HeartbeatPolling {
    pub fn new(interval: Duration, heartbeat: Duration) -> Self {
        Self {
            interval,
            heartbeat,
        }
    }
}

impl PollingPolicy for HeartbeatPolling {
    fn interval(&self) -> Duration {
        self.interval
    }

    fn should_poll(&self, elapsed: Duration) -> bool {
        elapsed.saturating_add(self.interval) < self.heartbeat
    }
}

/// Poll exactly once per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SinglePoll;

impl PollingPolicy for SinglePoll {
    fn interval(&self) -> Duration {
        Duration::ZERO
    }

    fn should_poll(&self, _elapsed: Duration) -> bool {
        false
    }
}
