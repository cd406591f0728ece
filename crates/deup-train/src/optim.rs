//! Optimizers built from [`OptimizerConfig`] with an attached per-epoch
//! learning-rate schedule.

use tch::nn::{self, OptimizerConfig as _};
use tch::Tensor;

use crate::config::OptimizerConfig;
use crate::error::DeupResult;
use crate::schedule::{LrSchedule, SchedulerConfig};

/// A `tch` optimizer together with its optional schedule.
pub struct ScheduledOptimizer {
    inner: nn::Optimizer,
    schedule: Option<LrSchedule>,
    lr: f64,
}

impl ScheduledOptimizer {
    /// Build the optimizer described by `config` over every trainable
    /// variable of `vs`.
    pub fn new(vs: &nn::VarStore, config: &OptimizerConfig, schedule: Option<&SchedulerConfig>) -> DeupResult<Self> {
        let lr = config.lr();
        let inner = match *config {
            OptimizerConfig::Sgd { momentum, weight_decay, nesterov, .. } => nn::Sgd {
                momentum,
                dampening: 0.0,
                wd: weight_decay,
                nesterov,
            }
            .build(vs, lr)?,
            OptimizerConfig::Adam { beta1, beta2, weight_decay, .. } => {
                nn::Adam { beta1, beta2, wd: weight_decay, ..Default::default() }.build(vs, lr)?
            }
        };
        Ok(ScheduledOptimizer { inner, schedule: schedule.map(|s| LrSchedule::new(lr, s.clone())), lr })
    }

    /// Clear accumulated gradients.
    pub fn zero_grad(&mut self) {
        self.inner.zero_grad();
    }

    /// Zero gradients, backpropagate `loss` and apply one update.
    pub fn backward_step(&mut self, loss: &Tensor) {
        self.inner.backward_step(loss);
    }

    /// Apply one update from the gradients already accumulated.
    pub fn step(&mut self) {
        self.inner.step();
    }

    /// Current learning rate.
    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Advance the schedule by one epoch and push the new rate into the
    /// optimizer. Without a schedule the rate is unchanged.
    pub fn schedule_step(&mut self) -> f64 {
        if let Some(schedule) = self.schedule.as_mut() {
            self.lr = schedule.step();
            self.inner.set_lr(self.lr);
        }
        self.lr
    }
}
