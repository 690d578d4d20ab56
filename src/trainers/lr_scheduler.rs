//! Learning rate schedules

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// Learning rate scheduler trait
pub trait LRScheduler {
    fn get_lr(&self, step: usize) -> f32;

    /// Adam beta1 for `step`, schedules that do not cycle momentum return `None`
    fn get_beta1(&self, _step: usize) -> Option<f64> {
        None
    }
}

/// Constant learning rate
pub struct ConstantScheduler {
    lr: f32,
}

impl ConstantScheduler {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl LRScheduler for ConstantScheduler {
    fn get_lr(&self, _step: usize) -> f32 {
        self.lr
    }
}

/// Parameters of the one-cycle policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OneCycleParams {
    pub max_lr: f32,
    /// Fraction of the cycle spent increasing the learning rate
    pub pct_start: f32,
    /// initial_lr = max_lr / div_factor
    pub div_factor: f32,
    /// min_lr = initial_lr / final_div_factor
    pub final_div_factor: f32,
    pub base_momentum: f64,
    pub max_momentum: f64,
}

impl Default for OneCycleParams {
    fn default() -> Self {
        Self {
            max_lr: 4e-3,
            pct_start: 0.3,
            div_factor: 25.0,
            final_div_factor: 1e4,
            base_momentum: 0.85,
            max_momentum: 0.95,
        }
    }
}

/// One-cycle policy with cosine annealing.
///
/// The learning rate goes from `max_lr / div_factor` up to `max_lr` over the
/// first `pct_start` of the steps, then anneals down to
/// `max_lr / (div_factor * final_div_factor)`. Adam's beta1 moves the opposite
/// way between `max_momentum` and `base_momentum`.
pub struct OneCycleLR {
    params: OneCycleParams,
    initial_lr: f32,
    min_lr: f32,
    warmup_end: f32,
    total_end: f32,
}

impl OneCycleLR {
    pub fn new(params: OneCycleParams, total_steps: usize) -> Result<Self> {
        ensure!(total_steps > 0, "one-cycle schedule needs a positive step count");
        ensure!(
            params.pct_start > 0.0 && params.pct_start < 1.0,
            "pct_start must be in (0, 1), got {}",
            params.pct_start
        );
        ensure!(
            params.div_factor > 0.0 && params.final_div_factor > 0.0,
            "div factors must be positive"
        );
        let initial_lr = params.max_lr / params.div_factor;
        let min_lr = initial_lr / params.final_div_factor;
        Ok(Self {
            params,
            initial_lr,
            min_lr,
            warmup_end: params.pct_start * total_steps as f32 - 1.0,
            total_end: total_steps as f32 - 1.0,
        })
    }

    pub fn initial_lr(&self) -> f32 {
        self.initial_lr
    }

    pub fn min_lr(&self) -> f32 {
        self.min_lr
    }

    /// Phase index and progress within it
    fn phase(&self, step: usize) -> (bool, f32) {
        let step = step as f32;
        if step <= self.warmup_end {
            let pct = if self.warmup_end > 0.0 { step / self.warmup_end } else { 1.0 };
            (true, pct)
        } else {
            let span = self.total_end - self.warmup_end;
            let pct = if span > 0.0 { (step - self.warmup_end) / span } else { 1.0 };
            (false, pct.min(1.0))
        }
    }
}

fn cosine_anneal(start: f64, end: f64, pct: f64) -> f64 {
    end + (start - end) / 2.0 * ((std::f64::consts::PI * pct).cos() + 1.0)
}

impl LRScheduler for OneCycleLR {
    fn get_lr(&self, step: usize) -> f32 {
        let (warmup, pct) = self.phase(step);
        let (start, end) = if warmup {
            (self.initial_lr, self.params.max_lr)
        } else {
            (self.params.max_lr, self.min_lr)
        };
        cosine_anneal(start as f64, end as f64, pct as f64) as f32
    }

    fn get_beta1(&self, step: usize) -> Option<f64> {
        let (warmup, pct) = self.phase(step);
        let (start, end) = if warmup {
            (self.params.max_momentum, self.params.base_momentum)
        } else {
            (self.params.base_momentum, self.params.max_momentum)
        };
        Some(cosine_anneal(start, end, pct as f64))
    }
}
