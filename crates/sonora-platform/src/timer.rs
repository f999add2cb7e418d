//! Timers
//!
//! Interval gating for periodic passes and scoped timing for hot paths such
//! as the scheduler tick and the gain pass.

use std::time::{Duration, Instant};

/// Fires at most once per interval when polled
#[derive(Debug)]
pub struct IntervalTimer {
    interval: Duration,
    last_fired: Option<Instant>,
}

impl IntervalTimer {
    /// Create a timer that fires on its first poll
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fired: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns `true` if the interval elapsed since the last time it fired
    pub fn poll(&mut self) -> bool {
        self.poll_at(Instant::now())
    }

    /// Same as [`poll`](Self::poll) with an explicit clock reading
    pub fn poll_at(&mut self, now: Instant) -> bool {
        match self.last_fired {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_fired = Some(now);
                true
            }
        }
    }
}

/// Times a scope and reports it through `tracing` on drop.
///
/// With a budget set, overruns are also logged as warnings.
pub struct ScopedTimer<'a> {
    name: &'a str,
    start: Instant,
    budget: Option<Duration>,
}

impl<'a> ScopedTimer<'a> {
    pub fn traced(name: &'a str) -> Self {
        Self {
            name,
            start: Instant::now(),
            budget: None,
        }
    }

    /// Warn when the scope takes longer than `budget`
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn over_budget(&self, duration: Duration) -> bool {
        self.budget.is_some_and(|budget| duration > budget)
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        tracing::trace!(
            target: "sonora::timing",
            name = self.name,
            duration_us = duration.as_micros() as u64,
            "scope finished"
        );
        if self.over_budget(duration) {
            log::warn!(
                "{} took {:?}, over its {:?} budget",
                self.name,
                duration,
                self.budget.unwrap_or_default()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_timer() {
        let start = Instant::now();
        let mut timer = IntervalTimer::new(Duration::from_millis(50));

        assert!(timer.poll_at(start));
        assert!(!timer.poll_at(start + Duration::from_millis(10)));
        assert!(!timer.poll_at(start + Duration::from_millis(49)));
        assert!(timer.poll_at(start + Duration::from_millis(50)));
        assert!(!timer.poll_at(start + Duration::from_millis(60)));
    }

    #[test]
    fn test_clock_going_backwards_does_not_fire() {
        let start = Instant::now() + Duration::from_secs(1);
        let mut timer = IntervalTimer::new(Duration::from_millis(50));

        assert!(timer.poll_at(start));
        assert!(!timer.poll_at(start - Duration::from_millis(500)));
    }

    #[test]
    fn test_budget() {
        let timer = ScopedTimer::traced("tick").with_budget(Duration::from_millis(5));
        assert!(!timer.over_budget(Duration::from_millis(5)));
        assert!(timer.over_budget(Duration::from_millis(6)));
        assert!(!ScopedTimer::traced("free").over_budget(Duration::from_secs(60)));
    }

    #[test]
    fn test_elapsed_grows() {
        let timer = ScopedTimer::traced("sleep");
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed() >= Duration::from_millis(5));
    }
}
