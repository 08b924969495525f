//! Poll schedule of an agent loop.
//!
//! Agents sleep one period between rounds. The delay is jittered so
//! replicas started together drift apart instead of claiming in lockstep.

use rand::Rng;
use std::time::Duration;

/// Default jitter as a fraction of the period.
pub const DEFAULT_JITTER: f64 = 0.1;

/// How long an agent waits between rounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSchedule {
    period: Duration,
    jitter: f64,
}

impl PollSchedule {
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            jitter: DEFAULT_JITTER,
        }
    }

    /// Sets the jitter fraction, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Delay before the next round, within `period * (1 ± jitter)`.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        if self.jitter == 0.0 || self.period.is_zero() {
            return self.period;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        self.period.mul_f64(factor)
    }

    /// Delay after a round that did work: the next round starts at once
    /// when the batch came back full.
    #[must_use]
    pub fn after_round(&self, claimed: usize, batch_size: usize) -> Duration {
        if batch_size > 0 && claimed >= batch_size {
            Duration::ZERO
        } else {
            self.next_delay()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_jitter_bounds() {
        let schedule = PollSchedule::new(Duration::from_secs(10)).with_jitter(0.2);
        for _ in 0..200 {
            let delay = schedule.next_delay();
            assert!(delay >= Duration::from_secs(8), "{delay:?}");
            assert!(delay <= Duration::from_secs(12), "{delay:?}");
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let schedule = PollSchedule::new(Duration::from_secs(3)).with_jitter(0.0);
        assert_eq!(schedule.next_delay(), Duration::from_secs(3));
    }

    #[test]
    fn jitter_is_clamped() {
        let schedule = PollSchedule::new(Duration::from_secs(1)).with_jitter(4.0);
        assert!(schedule.next_delay() <= Duration::from_secs(2));
    }

    #[test]
    fn full_batch_polls_again_at_once() {
        let schedule = PollSchedule::new(Duration::from_secs(5)).with_jitter(0.0);
        assert_eq!(schedule.after_round(50, 50), Duration::ZERO);
        assert_eq!(schedule.after_round(3, 50), Duration::from_secs(5));
        assert_eq!(schedule.after_round(0, 0), Duration::from_secs(5));
    }
}
