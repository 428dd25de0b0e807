// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use serde::{Deserialize, Serialize};

use super::Coordinate;

/// Who decides where the next unit is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    /// The device steps on its own.
    #[default]
    Auto,
    /// The device steps on its own and reports where it went.
    Learn,
    /// The driver walks a configured coordinate list.
    Explicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextUnit {
    At(Coordinate),
    DeviceChoice,
    Exhausted,
}

/// Sequence of coordinates visited on one stepping level.
pub trait Pattern: Send {
    fn mode(&self) -> StepMode;

    fn next_coordinate(&self) -> NextUnit;

    /// Whether a unit follows the current one.
    fn peek(&self) -> bool;

    /// Move to the following unit. Returns false when there is none.
    fn advance(&mut self) -> bool;

    fn reset(&mut self);
}

#[derive(Debug, Clone, Default)]
pub struct ExplicitPattern {
    coordinates: Vec<Coordinate>,
    position: usize,
}

impl ExplicitPattern {
    pub fn new(coordinates: Vec<Coordinate>) -> Self {
        Self {
            coordinates,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

impl Pattern for ExplicitPattern {
    fn mode(&self) -> StepMode {
        StepMode::Explicit
    }

    fn next_coordinate(&self) -> NextUnit {
        match self.coordinates.get(self.position) {
            Some(c) => NextUnit::At(*c),
            None => NextUnit::Exhausted,
        }
    }

    fn peek(&self) -> bool {
        self.position + 1 < self.coordinates.len()
    }

    fn advance(&mut self) -> bool {
        if self.peek() {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.position = 0;
    }
}

/// Pattern owned by the device; only the device can report its end.
#[derive(Debug, Clone, Copy)]
pub struct DevicePattern {
    mode: StepMode,
}

impl DevicePattern {
    pub fn new(mode: StepMode) -> Self {
        Self { mode }
    }
}

impl Pattern for DevicePattern {
    fn mode(&self) -> StepMode {
        self.mode
    }

    fn next_coordinate(&self) -> NextUnit {
        NextUnit::DeviceChoice
    }

    fn peek(&self) -> bool {
        true
    }

    fn advance(&mut self) -> bool {
        true
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_pattern_walks_list() {
        let mut p = ExplicitPattern::new(vec![Coordinate::new(0, 0), Coordinate::new(1, 0)]);
        assert_eq!(p.next_coordinate(), NextUnit::At(Coordinate::new(0, 0)));
        assert!(p.peek());
        assert!(p.advance());
        assert_eq!(p.next_coordinate(), NextUnit::At(Coordinate::new(1, 0)));
        assert!(!p.peek());
        assert!(!p.advance());
        p.reset();
        assert_eq!(p.position(), 0);
    }

    #[test]
    fn test_empty_explicit_pattern_is_exhausted() {
        let p = ExplicitPattern::new(Vec::new());
        assert_eq!(p.next_coordinate(), NextUnit::Exhausted);
        assert!(!p.peek());
    }

    #[test]
    fn test_device_pattern_never_ends_on_its_own() {
        let mut p = DevicePattern::new(StepMode::Learn);
        assert_eq!(p.mode(), StepMode::Learn);
        assert_eq!(p.next_coordinate(), NextUnit::DeviceChoice);
        assert!(p.peek());
        assert!(p.advance());
    }
}
