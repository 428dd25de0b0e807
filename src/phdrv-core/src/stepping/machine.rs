// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Petri-net stepper.
//!
//! One pass of [`Stepper::run`] fires transitions on the outermost level
//! until a mark is reached that hands control back to the host. The
//! `Active` mark of a level runs the next deeper level the same way.
//!
//! ```text
//! OUT  -> WS
//! WS   -> ACT (unit acquired) | END (exhausted) | WSP (paused, stop)
//! WSP  -> WS
//! ACT  -> WD once the nested level is done, else stop
//! WD   -> SNOOP (disposed) | END (exhausted) | WDP (paused, stop)
//! WDP  -> WD
//! SNOOP-> STEP (stop on dispose) | END
//! STEP -> WS | END
//! END  -> OUT (stop, level done)
//! ```

use std::future::Future;
use std::pin::Pin;

use tracing::{debug, error};

use super::pattern::{NextUnit, Pattern, StepMode};
use super::{Coordinate, Level, StepCall, StepMark, StepResult};
use crate::error::{DriverError, DriverResult};

pub type StepFuture<'a, T> =
    Pin<Box<dyn Future<Output = DriverResult<StepResult<T>>> + Send + 'a>>;

/// Device work performed on behalf of the stepper.
pub trait StepActions: Send {
    /// Bring the next unit of `level` under test. `target` is set when the
    /// pattern dictates the position. Returns where the unit actually is.
    fn acquire<'a>(&'a mut self, level: Level, target: Option<Coordinate>)
        -> StepFuture<'a, Coordinate>;

    /// Dispose of the unit currently under test on `level`.
    fn dispose<'a>(&'a mut self, level: Level) -> StepFuture<'a, ()>;
}

/// Result of one stepper pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepperOutcome {
    /// The pattern of the outermost level has been completed.
    pub pattern_done: bool,
    /// Error reported by a device action; the level keeps its mark.
    pub error: Option<DriverError>,
}

/// Whether the marks after a pass make sense for the call that ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    Settled,
    Paused,
    Broken,
}

struct LevelState {
    level: Level,
    mark: StepMark,
    coordinate: Option<Coordinate>,
    pattern: Box<dyn Pattern>,
    transitions: u64,
}

impl LevelState {
    fn new(level: Level, pattern: Box<dyn Pattern>) -> Self {
        Self {
            level,
            mark: StepMark::Out,
            coordinate: None,
            pattern,
            transitions: 0,
        }
    }

    fn enter(&mut self, next: StepMark) {
        if next != self.mark {
            debug!("{} stepper {} -> {}", self.level, self.mark, next);
            self.mark = next;
            self.transitions += 1;
        }
    }
}

pub struct Stepper {
    levels: Vec<LevelState>,
}

impl Stepper {
    pub fn new(die: Box<dyn Pattern>, sub_die: Option<Box<dyn Pattern>>) -> Self {
        let mut levels = vec![LevelState::new(Level::Die, die)];
        if let Some(pattern) = sub_die {
            levels.push(LevelState::new(Level::SubDie, pattern));
        }
        Self { levels }
    }

    pub fn has_sub_die(&self) -> bool {
        self.levels.len() > 1
    }

    pub fn deepest(&self) -> Level {
        if self.has_sub_die() {
            Level::SubDie
        } else {
            Level::Die
        }
    }

    /// `Out` for a level that is not configured.
    pub fn mark(&self, level: Level) -> StepMark {
        self.levels
            .get(level.index())
            .map_or(StepMark::Out, |s| s.mark)
    }

    pub fn marks(&self) -> Vec<StepMark> {
        self.levels.iter().map(|s| s.mark).collect()
    }

    pub fn coordinate(&self, level: Level) -> Option<Coordinate> {
        self.levels.get(level.index()).and_then(|s| s.coordinate)
    }

    pub fn mode(&self, level: Level) -> Option<StepMode> {
        self.levels.get(level.index()).map(|s| s.pattern.mode())
    }

    pub fn transitions(&self, level: Level) -> u64 {
        self.levels.get(level.index()).map_or(0, |s| s.transitions)
    }

    /// The paused mark the innermost running level is waiting in, if any.
    pub fn pending_pause(&self) -> Option<StepMark> {
        let die = self.mark(Level::Die);
        if self.has_sub_die() && die == StepMark::Active {
            let sub = self.mark(Level::SubDie);
            return sub.is_paused().then_some(sub);
        }
        die.is_paused().then_some(die)
    }

    /// Leave every level and rewind all patterns.
    pub fn reset(&mut self) {
        for state in &mut self.levels {
            state.enter(StepMark::Out);
            state.coordinate = None;
            state.pattern.reset();
        }
    }

    pub async fn run<A>(&mut self, call: StepCall, actions: &mut A) -> StepperOutcome
    where
        A: StepActions + ?Sized,
    {
        let mut error = None;
        let pattern_done = self.run_level(0, call, actions, &mut error).await;
        StepperOutcome {
            pattern_done,
            error,
        }
    }

    fn run_level<'a, A>(
        &'a mut self,
        index: usize,
        call: StepCall,
        actions: &'a mut A,
        error: &'a mut Option<DriverError>,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>
    where
        A: StepActions + ?Sized,
    {
        Box::pin(async move {
            if index >= self.levels.len() {
                // below the deepest level: a unit is under test until disposed
                return call == StepCall::Dispose;
            }

            let level = self.levels[index].level;
            let mut done = false;
            loop {
                let mark = self.levels[index].mark;
                let (next, stop) = match mark {
                    StepMark::Out => (StepMark::WaitStart, false),
                    StepMark::WaitStart => {
                        if self.levels[index + 1..]
                            .iter()
                            .any(|s| s.mark != StepMark::Out)
                        {
                            *error = Some(DriverError::Internal(format!(
                                "{} cannot start while a nested level is running",
                                level
                            )));
                            (mark, true)
                        } else {
                            let target = match self.levels[index].pattern.next_coordinate() {
                                NextUnit::At(c) => Some(c),
                                NextUnit::DeviceChoice => None,
                                NextUnit::Exhausted => {
                                    self.levels[index].enter(StepMark::End);
                                    continue;
                                }
                            };
                            match actions.acquire(level, target).await {
                                Ok(StepResult::Done(at)) => {
                                    self.levels[index].coordinate = Some(at);
                                    (StepMark::Active, false)
                                }
                                Ok(StepResult::Exhausted) => (StepMark::End, false),
                                Ok(StepResult::Paused) => (StepMark::WaitStartPaused, true),
                                Err(err) => {
                                    *error = Some(err);
                                    (mark, true)
                                }
                            }
                        }
                    }
                    StepMark::WaitStartPaused => (StepMark::WaitStart, false),
                    StepMark::Active => {
                        if self.run_level(index + 1, call, actions, error).await {
                            (StepMark::WaitDispose, false)
                        } else {
                            (mark, true)
                        }
                    }
                    StepMark::WaitDispose => match actions.dispose(level).await {
                        Ok(StepResult::Done(())) => (StepMark::Snoop, false),
                        Ok(StepResult::Exhausted) => (StepMark::End, false),
                        Ok(StepResult::Paused) => (StepMark::WaitDisposePaused, true),
                        Err(err) => {
                            *error = Some(err);
                            (mark, true)
                        }
                    },
                    StepMark::WaitDisposePaused => (StepMark::WaitDispose, false),
                    StepMark::Snoop => {
                        if self.levels[index].pattern.peek() {
                            // an acquire that ended a nested level moves on here
                            (StepMark::Step, call == StepCall::Dispose)
                        } else {
                            (StepMark::End, false)
                        }
                    }
                    StepMark::Step => {
                        if self.levels[index].pattern.advance() {
                            (StepMark::WaitStart, false)
                        } else {
                            (StepMark::End, false)
                        }
                    }
                    StepMark::End => {
                        let state = &mut self.levels[index];
                        state.pattern.reset();
                        state.coordinate = None;
                        done = true;
                        (StepMark::Out, true)
                    }
                };
                self.levels[index].enter(next);
                if stop {
                    break;
                }
            }
            done
        })
    }

    /// Compare the marks left by a pass of `call` with the combinations
    /// that pass may legally produce.
    pub fn check(&self, call: StepCall, done: bool) -> Consistency {
        use StepMark::{Active, Out, Step};

        let die = self.mark(Level::Die);
        let sub = self.levels.get(1).map(|s| s.mark);
        let settled = match (call, sub) {
            (StepCall::Acquire, Some(sub)) => {
                matches!((die, sub, done), (Out, Out, true) | (Active, Active, false))
            }
            (StepCall::Acquire, None) => matches!((die, done), (Out, true) | (Active, false)),
            (StepCall::Dispose, Some(sub)) => matches!(
                (die, sub, done),
                (Out, Out, true) | (Step, Out, false) | (Active, Step, false)
            ),
            (StepCall::Dispose, None) => matches!((die, done), (Out, true) | (Step, false)),
        };
        if settled {
            return Consistency::Settled;
        }

        let paused = match sub {
            Some(sub) => (die == Active && sub.is_paused()) || (die.is_paused() && sub == Out),
            None => die.is_paused(),
        };
        if paused && !done {
            return Consistency::Paused;
        }

        error!(
            "stepper marks {:?} (pattern done: {}) are not valid after {:?}",
            self.marks(),
            done,
            call
        );
        Consistency::Broken
    }
}
