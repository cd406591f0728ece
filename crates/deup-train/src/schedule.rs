//! Per-epoch learning-rate schedules.
//!
//! A [`LrSchedule`] is a pure function of the base learning rate and the
//! number of epochs stepped so far. The training loop advances it exactly
//! once per epoch, after the error predictor has been fitted, and pushes the
//! new rate into the optimizer.
//!
//! ```rust
//! use deup_train::schedule::{LrSchedule, SchedulerConfig};
//!
//! let mut s = LrSchedule::new(0.05, SchedulerConfig::MultiStep { milestones: vec![2, 4], gamma: 0.2 });
//! s.step();
//! assert!((s.lr() - 0.05).abs() < 1e-12);
//! s.step();
//! assert!((s.lr() - 0.01).abs() < 1e-12);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Serializable description of a learning-rate schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerConfig {
    /// Multiply the rate by `gamma` each time a milestone epoch is reached.
    MultiStep {
        /// Epoch counts at which the rate decays. Strictly increasing.
        milestones: Vec<usize>,
        /// Decay factor applied at each milestone.
        gamma: f64,
    },
    /// Multiply the rate by `factor` after every epoch.
    Multiplicative {
        /// Per-epoch multiplier.
        factor: f64,
    },
    /// Keep the base rate.
    Constant,
}

impl SchedulerConfig {
    /// Check that the schedule parameters are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            SchedulerConfig::MultiStep { milestones, gamma } => {
                if *gamma <= 0.0 || *gamma > 1.0 {
                    return Err(ConfigError::invalid_value("gamma", "must be in (0.0, 1.0]"));
                }
                let mut prev = 0usize;
                for &m in milestones {
                    if m == 0 {
                        return Err(ConfigError::invalid_value("milestones", "milestones must be >= 1"));
                    }
                    if m <= prev {
                        return Err(ConfigError::invalid_value(
                            "milestones",
                            "milestones must be strictly increasing",
                        ));
                    }
                    prev = m;
                }
                Ok(())
            }
            SchedulerConfig::Multiplicative { factor } => {
                if *factor <= 0.0 || !factor.is_finite() {
                    return Err(ConfigError::invalid_value("factor", "must be a finite value > 0.0"));
                }
                Ok(())
            }
            SchedulerConfig::Constant => Ok(()),
        }
    }
}

/// Running learning-rate schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LrSchedule {
    base_lr: f64,
    config: SchedulerConfig,
    steps: usize,
}

impl LrSchedule {
    /// Create a schedule starting at `base_lr` with zero steps taken.
    pub fn new(base_lr: f64, config: SchedulerConfig) -> Self {
        LrSchedule { base_lr, config, steps: 0 }
    }

    /// Advance by one epoch and return the new rate.
    pub fn step(&mut self) -> f64 {
        self.steps += 1;
        self.lr()
    }

    /// Number of steps taken so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Learning rate at the current step.
    pub fn lr(&self) -> f64 {
        match &self.config {
            SchedulerConfig::MultiStep { milestones, gamma } => {
                let passed = milestones.iter().filter(|&&m| m <= self.steps).count();
                self.base_lr * gamma.powi(passed as i32)
            }
            SchedulerConfig::Multiplicative { factor } => self.base_lr * factor.powi(self.steps as i32),
            SchedulerConfig::Constant => self.base_lr,
        }
    }

    /// The schedule description.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn multistep_decays_at_milestones() {
        let mut s = LrSchedule::new(0.05, SchedulerConfig::MultiStep { milestones: vec![25, 50], gamma: 0.2 });
        for _ in 0..24 {
            s.step();
        }
        assert_relative_eq!(s.lr(), 0.05);
        s.step();
        assert_relative_eq!(s.lr(), 0.01);
        for _ in 0..25 {
            s.step();
        }
        assert_relative_eq!(s.lr(), 0.002, epsilon = 1e-12);
        assert_eq!(s.steps(), 50);
    }

    #[test]
    fn multiplicative_compounds_each_step() {
        let mut s = LrSchedule::new(1.0, SchedulerConfig::Multiplicative { factor: 0.5 });
        s.step();
        s.step();
        assert_relative_eq!(s.lr(), 0.25);
    }

    #[test]
    fn constant_never_changes() {
        let mut s = LrSchedule::new(0.3, SchedulerConfig::Constant);
        for _ in 0..10 {
            s.step();
        }
        assert_relative_eq!(s.lr(), 0.3);
    }

    #[test]
    fn unordered_milestones_are_rejected() {
        let cfg = SchedulerConfig::MultiStep { milestones: vec![50, 25], gamma: 0.2 };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_factor_is_rejected() {
        assert!(SchedulerConfig::Multiplicative { factor: 0.0 }.validate().is_err());
    }

    #[test]
    fn config_json_uses_kind_tag() {
        let cfg = SchedulerConfig::MultiStep { milestones: vec![1, 2], gamma: 0.1 };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"kind\":\"multi_step\""));
    }

    proptest! {
        #[test]
        fn multistep_rate_never_increases(steps in 0usize..120, gamma in 0.01f64..1.0) {
            let mut s = LrSchedule::new(0.1, SchedulerConfig::MultiStep { milestones: vec![10, 40, 80], gamma });
            let mut prev = s.lr();
            for _ in 0..steps {
                let next = s.step();
                prop_assert!(next <= prev + 1e-15);
                prev = next;
            }
        }
    }
}
