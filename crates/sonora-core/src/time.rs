//! Time Management
//!
//! The simulation advances in fixed ticks. Playback positions are always
//! derived from an absolute start tick, never from an accumulated counter, so
//! any observer can compute where a channel is right now:
//! `elapsed = (now_tick - start_tick) / ticks_per_second`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Start tick stored by a channel that is not playing
pub const NOT_PLAYING: i64 = -1;

/// Fixed simulation rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickRate {
    ticks_per_second: u32,
}

impl TickRate {
    /// The usual rate of a block-world server
    pub const DEFAULT: Self = Self { ticks_per_second: 20 };

    /// Create a tick rate; zero is bumped to one
    pub fn new(ticks_per_second: u32) -> Self {
        Self {
            ticks_per_second: ticks_per_second.max(1),
        }
    }

    /// Ticks per second
    pub fn ticks_per_second(&self) -> u32 {
        self.ticks_per_second
    }

    /// Duration of one tick
    pub fn step(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.ticks_per_second as f64)
    }

    /// Seconds elapsed between `start_tick` and `now`.
    ///
    /// Clamped to zero: an observer can be seen in the same tick the start is
    /// committed, or before it when ticks race, and a negative seek is
    /// meaningless for the decoder.
    pub fn elapsed_seconds(&self, start_tick: i64, now: i64) -> f64 {
        if start_tick < 0 {
            return 0.0;
        }
        let ticks = now.saturating_sub(start_tick).max(0);
        ticks as f64 / self.ticks_per_second as f64
    }

    /// Number of whole ticks covering `seconds`
    pub fn ticks_for(&self, seconds: f64) -> i64 {
        (seconds.max(0.0) * self.ticks_per_second as f64).round() as i64
    }
}

impl Default for TickRate {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Fixed-step clock that turns wall-clock deltas into simulation ticks
#[derive(Debug, Clone)]
pub struct TickClock {
    rate: TickRate,
    /// Current tick
    now: i64,
    /// Accumulated wall time not yet converted to ticks
    accumulator: f64,
    /// Cap on ticks emitted by one advance
    max_ticks_per_advance: u32,
}

impl TickClock {
    /// Create a clock starting at tick zero
    pub fn new(rate: TickRate) -> Self {
        Self {
            rate,
            now: 0,
            accumulator: 0.0,
            max_ticks_per_advance: 8,
        }
    }

    /// Set the maximum number of ticks a single advance may produce
    pub fn with_max_ticks(mut self, max: u32) -> Self {
        self.max_ticks_per_advance = max.max(1);
        self
    }

    /// The tick rate driving this clock
    pub fn rate(&self) -> TickRate {
        self.rate
    }

    /// Current tick
    pub fn now(&self) -> i64 {
        self.now
    }

    /// Feed wall time and get the number of ticks that should run now.
    ///
    /// The returned ticks are already counted; callers run their per-tick work
    /// that many times.
    pub fn advance(&mut self, delta: Duration) -> u32 {
        let step = 1.0 / self.rate.ticks_per_second() as f64;
        self.accumulator += delta.as_secs_f64().min(0.25);

        let mut ticks = 0;
        while self.accumulator >= step && ticks < self.max_ticks_per_advance {
            self.accumulator -= step;
            ticks += 1;
        }
        // Drop the backlog instead of catching up forever
        if ticks == self.max_ticks_per_advance {
            self.accumulator = self.accumulator.min(step);
        }

        self.now += ticks as i64;
        ticks
    }

    /// Advance exactly one tick and return the new tick value
    pub fn tick(&mut self) -> i64 {
        self.now += 1;
        self.now
    }
}
