//! Rollout records produced by the predictive stack.
//!
//! Tensors that feed the objective (policy, value, hidden states, per-layer
//! errors) stay attached to the graph. Everything sourced from the
//! environment is plain host data, and the diagnostic taps are read-only once
//! the rollout returns.

use candle_core::{Device, Tensor};

use crate::error::{PredictiveError, PredictiveResult};

/// One unrolled time step.
#[derive(Debug, Clone)]
pub struct StepRecord {
    /// Stimulus seen at this step `[batch, n_stimulus]`, a constant
    pub observation: Tensor,
    /// Differentiable policy `softmax(logits)` `[batch, n_actions]`
    pub policy: Tensor,
    /// Policy logits `[batch, n_actions]`
    pub logits: Tensor,
    /// Sampled action of every trial
    pub actions: Vec<usize>,
    /// One-hot encoding of `actions` `[batch, n_actions]`, a constant
    pub action_one_hot: Tensor,
    /// Value estimate `[batch]`
    pub value: Tensor,
    /// Reward delivered for this step's action, already masked
    pub reward: Vec<f32>,
    /// Continuation mask entering this step's environment call
    pub mask: Vec<f32>,
    /// Whether this step lies inside the active time window
    pub time_window: f32,
    /// Hidden state of every layer after this step
    pub hidden: Vec<Tensor>,
    /// Agent positions reported with the observation
    pub positions: Vec<(usize, usize)>,
}

/// Mean rectified error of one layer at one step, split by input sub-range.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ErrorBreakdown {
    /// Stimulus sub-range, positive polarity
    pub stimulus_pos: f32,
    /// Stimulus sub-range, negative polarity
    pub stimulus_neg: f32,
    /// Reward column, positive polarity
    pub reward_pos: f32,
    /// Reward column, negative polarity
    pub reward_neg: f32,
    /// Action sub-range, positive polarity
    pub action_pos: f32,
    /// Action sub-range, negative polarity
    pub action_neg: f32,
}

impl ErrorBreakdown {
    /// Sum over sub-ranges and polarities
    pub fn total(&self) -> f32 {
        self.stimulus() + self.reward() + self.action()
    }

    /// Stimulus error over both polarities
    pub fn stimulus(&self) -> f32 {
        self.stimulus_pos + self.stimulus_neg
    }

    /// Reward error over both polarities
    pub fn reward(&self) -> f32 {
        self.reward_pos + self.reward_neg
    }

    /// Action error over both polarities
    pub fn action(&self) -> f32 {
        self.action_pos + self.action_neg
    }

    fn accumulate(&mut self, other: &Self) {
        self.stimulus_pos += other.stimulus_pos;
        self.stimulus_neg += other.stimulus_neg;
        self.reward_pos += other.reward_pos;
        self.reward_neg += other.reward_neg;
        self.action_pos += other.action_pos;
        self.action_neg += other.action_neg;
    }

    fn scaled(mut self, factor: f32) -> Self {
        self.stimulus_pos *= factor;
        self.stimulus_neg *= factor;
        self.reward_pos *= factor;
        self.reward_neg *= factor;
        self.action_pos *= factor;
        self.action_neg *= factor;
        self
    }
}

/// A complete rollout of `horizon` steps.
#[derive(Debug, Clone)]
pub struct Trajectory {
    /// Step records in time order
    pub steps: Vec<StepRecord>,
    /// Differentiable total prediction error per layer, one scalar per
    /// polarity per step
    pub layer_errors: Vec<Vec<Tensor>>,
    /// Read-only error breakdown per layer per step
    pub error_breakdown: Vec<Vec<ErrorBreakdown>>,
    /// Reward column predicted by the expected-reward layer, per step per trial
    pub expected_reward: Vec<Vec<f32>>,
    /// Reward entering each step (the previous step's reward), per trial
    pub actual_reward: Vec<Vec<f32>>,
    batch_size: usize,
    device: Device,
}

impl Trajectory {
    /// Create an empty trajectory for `layers` predictive cells.
    pub fn new(layers: usize, batch_size: usize, device: &Device) -> Self {
        Self {
            steps: Vec::new(),
            layer_errors: vec![Vec::new(); layers],
            error_breakdown: vec![Vec::new(); layers],
            expected_reward: Vec::new(),
            actual_reward: Vec::new(),
            batch_size,
            device: device.clone(),
        }
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the trajectory holds no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of parallel trials
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Device the tensors live on
    pub fn device(&self) -> &Device {
        &self.device
    }

    fn host_matrix(&self, select: impl Fn(&StepRecord) -> &[f32]) -> PredictiveResult<Tensor> {
        let data: Vec<f32> = self
            .steps
            .iter()
            .flat_map(|s| select(s).iter().copied())
            .collect();
        Ok(Tensor::from_vec(data, (self.len(), self.batch_size), &self.device)?)
    }

    fn require_steps(&self) -> PredictiveResult<()> {
        if self.is_empty() {
            return Err(PredictiveError::training("trajectory holds no steps"));
        }
        Ok(())
    }

    /// Rewards `[T, batch]`
    pub fn rewards(&self) -> PredictiveResult<Tensor> {
        self.host_matrix(|s| s.reward.as_slice())
    }

    /// Continuation masks `[T, batch]`
    pub fn masks(&self) -> PredictiveResult<Tensor> {
        self.host_matrix(|s| s.mask.as_slice())
    }

    /// Time-window indicator `[T, 1]`
    pub fn time_windows(&self) -> PredictiveResult<Tensor> {
        let data: Vec<f32> = self.steps.iter().map(|s| s.time_window).collect();
        Ok(Tensor::from_vec(data, (self.len(), 1), &self.device)?)
    }

    /// `mask ⊙ time_window` `[T, batch]`
    pub fn loss_weights(&self) -> PredictiveResult<Tensor> {
        Ok(self.masks()?.broadcast_mul(&self.time_windows()?)?)
    }

    /// Value estimates `[T, batch]`
    pub fn values(&self) -> PredictiveResult<Tensor> {
        self.require_steps()?;
        let values: Vec<&Tensor> = self.steps.iter().map(|s| &s.value).collect();
        Ok(Tensor::stack(&values, 0)?)
    }

    /// Policies `[T, batch, n_actions]`
    pub fn policies(&self) -> PredictiveResult<Tensor> {
        self.require_steps()?;
        let policies: Vec<&Tensor> = self.steps.iter().map(|s| &s.policy).collect();
        Ok(Tensor::stack(&policies, 0)?)
    }

    /// Sampled actions one-hot `[T, batch, n_actions]`
    pub fn action_one_hots(&self) -> PredictiveResult<Tensor> {
        self.require_steps()?;
        let actions: Vec<&Tensor> = self.steps.iter().map(|s| &s.action_one_hot).collect();
        Ok(Tensor::stack(&actions, 0)?)
    }

    /// `Σ mask·tw·onehot·log(ε + π)`, the log-likelihood of the sampled
    /// actions over every step still in play. Differentiable.
    pub fn log_likelihood(&self, epsilon: f32) -> PredictiveResult<Tensor> {
        let log_pi = (self.policies()? + epsilon as f64)?.log()?;
        let chosen = (self.action_one_hots()? * log_pi)?.sum(2)?;
        Ok((chosen * self.loss_weights()?)?.sum_all()?)
    }

    /// Accumulated reward of every trial
    pub fn accumulated_reward(&self) -> Vec<f32> {
        let mut totals = vec![0.0f32; self.batch_size];
        for step in &self.steps {
            for (total, r) in totals.iter_mut().zip(&step.reward) {
                *total += r;
            }
        }
        totals
    }

    /// Mean over trials of the accumulated reward
    pub fn mean_reward(&self) -> f32 {
        let totals = self.accumulated_reward();
        totals.iter().sum::<f32>() / self.batch_size.max(1) as f32
    }

    /// Mean over trials of the number of positively rewarded steps
    pub fn accuracy(&self) -> f32 {
        let hits: usize = self
            .steps
            .iter()
            .map(|s| s.reward.iter().filter(|r| **r > 0.0).count())
            .sum();
        hits as f32 / self.batch_size.max(1) as f32
    }

    /// Mean hidden activity over all layers, steps and trials
    pub fn mean_hidden_activity(&self) -> PredictiveResult<f32> {
        let mut total = 0.0f32;
        let mut count = 0usize;
        for step in &self.steps {
            for h in &step.hidden {
                total += h.sum_all()?.to_scalar::<f32>()?;
                count += h.elem_count();
            }
        }
        Ok(total / count.max(1) as f32)
    }

    /// Error breakdown of `layer` averaged over time
    pub fn mean_error_breakdown(&self, layer: usize) -> ErrorBreakdown {
        let Some(records) = self.error_breakdown.get(layer) else {
            return ErrorBreakdown::default();
        };
        let mut acc = ErrorBreakdown::default();
        for record in records {
            acc.accumulate(record);
        }
        acc.scaled(1.0 / records.len().max(1) as f32)
    }

    /// Sampled actions per step per trial
    pub fn actions(&self) -> Vec<Vec<usize>> {
        self.steps.iter().map(|s| s.actions.clone()).collect()
    }
}
