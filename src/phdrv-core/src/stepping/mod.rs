// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Die / sub-die stepping.
//!
//! Each stepping level runs a small petri net whose marks record how far
//! the current unit has progressed. The die level nests the optional
//! sub-die level inside its `Active` mark.

pub mod machine;
pub mod pattern;

use std::fmt;
use std::ops::Add;

use serde::{Deserialize, Serialize};

pub use machine::{Consistency, StepActions, StepFuture, Stepper, StepperOutcome};
pub use pattern::{DevicePattern, ExplicitPattern, NextUnit, Pattern, StepMode};

/// A stepping level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Die,
    SubDie,
}

impl Level {
    pub fn index(self) -> usize {
        match self {
            Self::Die => 0,
            Self::SubDie => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Die),
            1 => Some(Self::SubDie),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Die => write!(f, "die"),
            Self::SubDie => write!(f, "sub-die"),
        }
    }
}

/// Petri-net mark of one stepping level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMark {
    /// Outside this level.
    #[default]
    Out,
    WaitStart,
    WaitStartPaused,
    /// A unit is under test (or the nested level is running).
    Active,
    WaitDispose,
    WaitDisposePaused,
    /// Looking ahead in the pattern.
    Snoop,
    /// Ready to advance the pattern.
    Step,
    /// Pattern of this level is complete.
    End,
}

impl StepMark {
    pub fn is_paused(self) -> bool {
        matches!(self, Self::WaitStartPaused | Self::WaitDisposePaused)
    }
}

impl fmt::Display for StepMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Out => "OUT",
            Self::WaitStart => "WS",
            Self::WaitStartPaused => "WSP",
            Self::Active => "ACT",
            Self::WaitDispose => "WD",
            Self::WaitDisposePaused => "WDP",
            Self::Snoop => "SNOOP",
            Self::Step => "STEP",
            Self::End => "END",
        };
        write!(f, "{}", s)
    }
}

/// Result of a device action that may hit a pause or the end of the
/// pattern instead of completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult<T> {
    Done(T),
    Exhausted,
    Paused,
}

impl<T> StepResult<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StepResult<U> {
        match self {
            Self::Done(v) => StepResult::Done(f(v)),
            Self::Exhausted => StepResult::Exhausted,
            Self::Paused => StepResult::Paused,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }
}

/// Which host operation drives the stepper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCall {
    Acquire,
    Dispose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: i64,
    pub y: i64,
}

impl Coordinate {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

impl Add for Coordinate {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.x, self.y)
    }
}
