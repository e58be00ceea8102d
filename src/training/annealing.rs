//! Weight schedules for the auxiliary loss term

use crate::{AnnealCounter, AnnealingConfig, AnnealingPolicy};

/// Deterministic regularizer weight as a function of a step count
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnealingSchedule {
    policy: AnnealingPolicy,
    target_max: f64,
    ramp_steps: usize,
    period: usize,
    counter: AnnealCounter,
}

impl AnnealingSchedule {
    pub fn monotonic(target_max: f64, ramp_steps: usize) -> Self {
        AnnealingSchedule {
            policy: AnnealingPolicy::Monotonic,
            target_max,
            ramp_steps: ramp_steps.max(1),
            period: usize::MAX,
            counter: AnnealCounter::Epoch,
        }
    }

    pub fn cyclical(target_max: f64, ramp_steps: usize, period: usize) -> Self {
        AnnealingSchedule {
            policy: AnnealingPolicy::Cyclical,
            target_max,
            ramp_steps: ramp_steps.max(1),
            period: period.max(1),
            counter: AnnealCounter::Epoch,
        }
    }

    pub fn with_counter(mut self, counter: AnnealCounter) -> Self {
        self.counter = counter;
        self
    }

    pub fn counter(&self) -> AnnealCounter {
        self.counter
    }

    pub fn target_max(&self) -> f64 {
        self.target_max
    }

    /// Weight at `step`, always within `[0, target_max]`
    ///
    /// Cyclical schedules restart at every multiple of `period`; with
    /// `ramp_steps >= period` they rise and reset without a plateau.
    pub fn weight(&self, step: usize) -> f64 {
        let position = match self.policy {
            AnnealingPolicy::Monotonic => step,
            AnnealingPolicy::Cyclical => step % self.period,
        };
        let fraction = (position as f64 / self.ramp_steps as f64).min(1.0);
        self.target_max * fraction
    }

    /// Pick the step this schedule counts from the loop's counters
    pub fn step_for(&self, epoch: usize, global_step: usize, epoch_step: usize) -> usize {
        match self.counter {
            AnnealCounter::Epoch => epoch,
            AnnealCounter::GlobalStep => global_step,
            AnnealCounter::EpochStep => epoch_step,
        }
    }
}

impl From<&AnnealingConfig> for AnnealingSchedule {
    fn from(config: &AnnealingConfig) -> Self {
        let schedule = match config.policy {
            AnnealingPolicy::Monotonic => Self::monotonic(config.target_max, config.ramp_steps),
            AnnealingPolicy::Cyclical => {
                Self::cyclical(config.target_max, config.ramp_steps, config.period)
            }
        };
        schedule.with_counter(config.counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_zero() {
        assert_eq!(AnnealingSchedule::monotonic(1.0, 10).weight(0), 0.0);
        assert_eq!(AnnealingSchedule::cyclical(2.5, 10, 40).weight(0), 0.0);
        assert_eq!(AnnealingSchedule::monotonic(3.0, 1).weight(0), 0.0);
    }

    #[test]
    fn test_monotonic_rises_then_holds() {
        let schedule = AnnealingSchedule::monotonic(2.0, 50);
        let weights: Vec<f64> = (0..200).map(|s| schedule.weight(s)).collect();

        assert!(weights.windows(2).all(|w| w[0] <= w[1]));
        assert!(weights.iter().all(|&w| (0.0..=2.0).contains(&w)));
        assert_eq!(schedule.weight(25), 1.0);
        assert_eq!(schedule.weight(50), 2.0);
        assert_eq!(schedule.weight(10_000), 2.0);
    }

    #[test]
    fn test_cyclical_restarts_every_period() {
        let schedule = AnnealingSchedule::cyclical(1.0, 5, 20);
        assert_eq!(schedule.weight(5), 1.0);
        assert_eq!(schedule.weight(19), 1.0);
        assert_eq!(schedule.weight(20), 0.0);
        assert_eq!(schedule.weight(22), schedule.weight(2));

        // Non-decreasing inside each cycle
        for cycle in 0..3 {
            let start = cycle * 20;
            let weights: Vec<f64> = (start..start + 20).map(|s| schedule.weight(s)).collect();
            assert!(weights.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn test_cyclical_without_plateau() {
        let schedule = AnnealingSchedule::cyclical(1.0, 10, 10);
        assert!((0..10).all(|s| schedule.weight(s) < 1.0));
        assert_eq!(schedule.weight(10), 0.0);
    }

    #[test]
    fn test_identical_configs_agree() {
        let config = AnnealingConfig {
            policy: AnnealingPolicy::Cyclical,
            target_max: 0.7,
            ramp_steps: 13,
            period: 31,
            counter: AnnealCounter::GlobalStep,
        };
        let a = AnnealingSchedule::from(&config);
        let b = AnnealingSchedule::from(&config);
        assert!((0..500).all(|s| a.weight(s) == b.weight(s)));
        assert_eq!(a.step_for(3, 120, 7), 120);
    }
}
