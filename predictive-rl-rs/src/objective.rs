//! Actor-critic objective over a predictive rollout.
//!
//! ```text
//! target_t = r_t + γ·v_{t+1}·(1 − [r_t ≠ 0])        (v_T = 0)
//! adv_t    = target_t − v_t
//! total    = policy + value − entropy + prediction + spike + aux
//! ```
//!
//! Targets and advantages are constants, only the policy, value, hidden
//! states and prediction errors carry gradient.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::{AgentConfig, TrainingMethod};
use crate::error::{PredictiveError, PredictiveResult};
use crate::trajectory::Trajectory;

/// Detached one-step bootstrap of a trajectory.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    /// `r + γ·v_next·(1 − terminal)` `[T, batch]`
    pub target: Tensor,
    /// `target − v` `[T, batch]`
    pub advantage: Tensor,
}

/// Loss components as graph tensors.
#[derive(Debug, Clone)]
pub struct LossBreakdown {
    /// Advantage-weighted negative log-likelihood of the sampled actions
    pub policy: Tensor,
    /// Squared error of the value head against the bootstrap target
    pub value: Tensor,
    /// Entropy bonus (subtracted from the total)
    pub entropy: Tensor,
    /// Mean prediction error over all layers and steps
    pub prediction: Tensor,
    /// Mean hidden activity penalty
    pub spike: Tensor,
    /// Consolidation penalty supplied by the caller
    pub auxiliary: Tensor,
    /// `policy + value − entropy + prediction + spike + auxiliary`
    pub total: Tensor,
}

/// Host copies of the loss components, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossScalars {
    /// Policy loss
    pub policy: f32,
    /// Value loss
    pub value: f32,
    /// Entropy bonus
    pub entropy: f32,
    /// Prediction error loss
    pub prediction: f32,
    /// Activity penalty
    pub spike: f32,
    /// Consolidation penalty
    pub auxiliary: f32,
    /// Total loss
    pub total: f32,
}

impl LossBreakdown {
    /// Read every component back to the host.
    pub fn scalars(&self) -> PredictiveResult<LossScalars> {
        Ok(LossScalars {
            policy: self.policy.to_scalar()?,
            value: self.value.to_scalar()?,
            entropy: self.entropy.to_scalar()?,
            prediction: self.prediction.to_scalar()?,
            spike: self.spike.to_scalar()?,
            auxiliary: self.auxiliary.to_scalar()?,
            total: self.total.to_scalar()?,
        })
    }
}

/// Reinforcement-learning objective.
#[derive(Debug, Clone)]
pub struct RlObjective {
    discount: f32,
    epsilon: f32,
    value_cost: f32,
    entropy_cost: f32,
    error_cost: f32,
    spike_cost: f32,
}

impl RlObjective {
    /// Create the objective. Any training method other than reinforcement
    /// learning is rejected.
    pub fn new(config: &AgentConfig) -> PredictiveResult<Self> {
        if config.training_method != TrainingMethod::Reinforcement {
            return Err(PredictiveError::invalid_config(
                "supervised learning is not supported by the RL objective",
            ));
        }
        Ok(Self {
            discount: config.discount_rate,
            epsilon: config.epsilon,
            value_cost: config.value_cost,
            entropy_cost: config.entropy_cost,
            error_cost: config.error_cost,
            spike_cost: config.spike_cost,
        })
    }

    /// One-step bootstrapped targets and advantages.
    pub fn bootstrap(&self, traj: &Trajectory) -> PredictiveResult<Bootstrap> {
        let values = traj.values()?.detach();
        let steps = traj.len();
        let batch = traj.batch_size();

        let v_next = Tensor::cat(
            &[
                &values.narrow(0, 1, steps - 1)?,
                &Tensor::zeros((1, batch), DType::F32, traj.device())?,
            ],
            0,
        )?;
        let continuing: Vec<f32> = traj
            .steps
            .iter()
            .flat_map(|s| s.reward.iter().map(|r| if *r != 0.0 { 0.0 } else { 1.0 }))
            .collect();
        let continuing = Tensor::from_vec(continuing, (steps, batch), traj.device())?;

        let target = (traj.rewards()? + (v_next * continuing)?.affine(self.discount as f64, 0.0)?)?;
        let advantage = (&target - &values)?;
        Ok(Bootstrap { target, advantage })
    }

    /// Build every loss term for `traj`, adding `auxiliary` to the total.
    pub fn compute(&self, traj: &Trajectory, auxiliary: &Tensor) -> PredictiveResult<LossBreakdown> {
        let Bootstrap { target, advantage } = self.bootstrap(traj)?;
        let weights = traj.loss_weights()?;
        let policies = traj.policies()?;
        let log_pi = (&policies + self.epsilon as f64)?.log()?;

        // -mean over (t, b, a) of adv·mask·tw·onehot·log(ε+π)
        let chosen = (traj.action_one_hots()? * &log_pi)?;
        let policy = (advantage * &weights)?
            .unsqueeze(2)?
            .broadcast_mul(&chosen)?
            .mean_all()?
            .neg()?;

        let value = (weights.clone() * (traj.values()? - target)?.sqr()?)?
            .mean_all()?
            .affine(0.5 * self.value_cost as f64, 0.0)?;

        let plogp = (policies * log_pi)?.sum(2)?;
        let entropy = (plogp * &weights)?
            .mean_all()?
            .affine(-(self.entropy_cost as f64), 0.0)?;

        let prediction = self.prediction_loss(traj)?;
        let spike = self.spike_loss(traj, &weights)?;

        let total = ((((&policy + &value)? - &entropy)? + &prediction)? + &spike)?;
        let total = (total + auxiliary)?;

        Ok(LossBreakdown {
            policy,
            value,
            entropy,
            prediction,
            spike,
            auxiliary: auxiliary.clone(),
            total,
        })
    }

    fn prediction_loss(&self, traj: &Trajectory) -> PredictiveResult<Tensor> {
        let records: Vec<&Tensor> = traj.layer_errors.iter().flatten().collect();
        if records.is_empty() {
            return Err(PredictiveError::training("rollout recorded no prediction errors"));
        }
        Ok(Tensor::stack(&records, 0)?
            .mean_all()?
            .affine(self.error_cost as f64, 0.0)?)
    }

    fn spike_loss(&self, traj: &Trajectory, weights: &Tensor) -> PredictiveResult<Tensor> {
        // Mean activity of each trial over all layers' hidden units
        let activity = traj
            .steps
            .iter()
            .map(|s| {
                let hidden: Vec<&Tensor> = s.hidden.iter().collect();
                Ok(Tensor::cat(&hidden, 1)?.mean(1)?)
            })
            .collect::<PredictiveResult<Vec<_>>>()?;
        let activity = Tensor::stack(&activity, 0)?;
        Ok((activity * weights)?
            .mean_all()?
            .affine(self.spike_cost as f64, 0.0)?)
    }
}
