//! The stack of predictive cells and its rollout loop.
//!
//! Layer 0 predicts the observation, every layer above predicts the stimulus
//! error forwarded from the layer below, and all of them additionally predict
//! the previous reward and action. The top layer drives the policy and value
//! heads.

use candle_core::{DType, Device, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::trace;

use crate::cell::{CellOutput, CellState, PredictiveCell};
use crate::config::AgentConfig;
use crate::environment::Environment;
use crate::error::{PredictiveError, PredictiveResult};
use crate::params::{HeadParam, ParamId, ParameterSet};
use crate::trajectory::{ErrorBreakdown, StepRecord, Trajectory};

/// Offset between the initializer seed and the action sampling seed.
const SAMPLER_SEED_OFFSET: u64 = 0x5eed;

/// Single-slot register carrying each layer's hidden state to the layer
/// below on the following step.
///
/// Written once at the end of a step and read at the start of the next, so
/// top-down input always lags by exactly one step.
#[derive(Debug, Clone)]
pub struct TopDownRegister {
    slots: Vec<Tensor>,
}

impl TopDownRegister {
    /// Register holding the zero states of a fresh rollout.
    pub fn new(states: &[CellState]) -> Self {
        Self {
            slots: states.iter().map(|s| s.h.clone()).collect(),
        }
    }

    /// Top-down input for `layer`: last step's hidden state of `layer + 1`.
    pub fn above(&self, layer: usize) -> Option<&Tensor> {
        self.slots.get(layer + 1)
    }

    /// Latch the hidden states produced by the step that just finished.
    pub fn write(&mut self, states: &[CellState]) {
        for (slot, state) in self.slots.iter_mut().zip(states) {
            *slot = state.h.clone();
        }
    }
}

/// Policy and value readouts on the top hidden state.
#[derive(Debug, Clone)]
struct Heads {
    w_pol: Tensor,
    b_pol: Tensor,
    w_val: Tensor,
    b_val: Tensor,
}

/// Policy outputs of one step.
#[derive(Debug, Clone)]
pub struct PolicyOutput {
    /// Raw logits `[batch, n_actions]`
    pub logits: Tensor,
    /// `softmax(logits)`, differentiable
    pub policy: Tensor,
    /// Value estimate `[batch]`
    pub value: Tensor,
}

/// Stacked predictive cells with policy and value heads.
pub struct PredictiveStack {
    config: AgentConfig,
    cells: Vec<PredictiveCell>,
    heads: Heads,
    rng: StdRng,
    device: Device,
}

impl PredictiveStack {
    /// Bind the stack to `params`, checking every shape.
    pub fn new(config: &AgentConfig, params: &ParameterSet) -> PredictiveResult<Self> {
        let input_width = config.input_width();
        let layers = config.num_layers();
        let cells = (0..layers)
            .map(|layer| {
                let top_down = config.layer_widths.get(layer + 1).copied();
                PredictiveCell::new(
                    layer,
                    params,
                    input_width,
                    config.layer_widths[layer],
                    top_down,
                )
            })
            .collect::<PredictiveResult<Vec<_>>>()?;

        let top = config.layer_widths[layers - 1];
        let head = |id: ParamId, shape: &[usize]| -> PredictiveResult<Tensor> {
            Ok(params.get_shaped(id, shape)?.as_tensor().clone())
        };
        let heads = Heads {
            w_pol: head(ParamId::Policy(HeadParam::Weight), &[top, config.n_actions])?,
            b_pol: head(ParamId::Policy(HeadParam::Bias), &[config.n_actions])?,
            w_val: head(ParamId::Value(HeadParam::Weight), &[top, 1])?,
            b_val: head(ParamId::Value(HeadParam::Bias), &[1])?,
        };

        Ok(Self {
            config: config.clone(),
            cells,
            heads,
            rng: StdRng::seed_from_u64(config.seed.wrapping_add(SAMPLER_SEED_OFFSET)),
            device: params.device().clone(),
        })
    }

    /// Number of layers
    pub fn num_layers(&self) -> usize {
        self.cells.len()
    }

    /// Reseed the action sampler.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    fn check_environment(&self, env: &dyn Environment) -> PredictiveResult<()> {
        let checks = [
            ("environment batch size", self.config.batch_size, env.batch_size()),
            ("environment stimulus width", self.config.n_stimulus, env.stimulus_width()),
            ("environment action count", self.config.n_actions, env.num_actions()),
        ];
        for (context, expected, got) in checks {
            if expected != got {
                return Err(PredictiveError::shape_mismatch(
                    context,
                    expected.to_string(),
                    got.to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Policy, value and logits from the top layer's hidden state.
    pub fn heads(&self, h_top: &Tensor) -> PredictiveResult<PolicyOutput> {
        let logits = h_top
            .matmul(&self.heads.w_pol)?
            .broadcast_add(&self.heads.b_pol)?;
        let policy = candle_nn::ops::softmax(&logits, 1)?;
        let value = h_top
            .matmul(&self.heads.w_val)?
            .broadcast_add(&self.heads.b_val)?
            .squeeze(1)?;
        Ok(PolicyOutput {
            logits,
            policy,
            value,
        })
    }

    /// Draw one action per trial from `policy`.
    fn sample_actions(&mut self, policy: &Tensor) -> PredictiveResult<Vec<usize>> {
        let probs: Vec<Vec<f32>> = policy.detach().to_vec2()?;
        probs
            .iter()
            .map(|row| {
                let dist = WeightedIndex::new(row).map_err(|e| {
                    PredictiveError::training(format!("cannot sample from policy {row:?}: {e}"))
                })?;
                Ok(dist.sample(&mut self.rng))
            })
            .collect()
    }

    fn one_hot(&self, actions: &[usize]) -> PredictiveResult<Tensor> {
        let n = self.config.n_actions;
        let mut data = vec![0.0f32; actions.len() * n];
        for (b, &a) in actions.iter().enumerate() {
            data[b * n + a] = 1.0;
        }
        Ok(Tensor::from_vec(data, (actions.len(), n), &self.device)?)
    }

    /// Per sub-range error means of one cell output, and the differentiable
    /// total per polarity.
    fn measure_error(&self, out: &CellOutput) -> PredictiveResult<(ErrorBreakdown, [Tensor; 2])> {
        let n_stim = self.config.n_stimulus;
        let n_act = self.config.n_actions;
        let split = |t: &Tensor| -> PredictiveResult<(Tensor, Tensor, Tensor)> {
            Ok((
                t.narrow(1, 0, n_stim)?.mean_all()?,
                t.narrow(1, n_stim, 1)?.mean_all()?,
                t.narrow(1, n_stim + 1, n_act)?.mean_all()?,
            ))
        };
        let (sp, rp, ap) = split(&out.error.positive)?;
        let (sn, rn, an) = split(&out.error.negative)?;

        let breakdown = ErrorBreakdown {
            stimulus_pos: sp.to_scalar()?,
            stimulus_neg: sn.to_scalar()?,
            reward_pos: rp.to_scalar()?,
            reward_neg: rn.to_scalar()?,
            action_pos: ap.to_scalar()?,
            action_neg: an.to_scalar()?,
        };
        let totals = [((sp + rp)? + ap)?, ((sn + rn)? + an)?];
        Ok((breakdown, totals))
    }

    /// Unroll the stack for `horizon` steps against `env`.
    ///
    /// Rewards from the environment are used for every step except the last
    /// two, which always carry the failure penalty. A trial stops being
    /// stepped once it has received a non-zero reward.
    pub fn rollout(&mut self, env: &mut dyn Environment) -> PredictiveResult<Trajectory> {
        self.check_environment(env)?;

        let cfg = &self.config;
        let batch = cfg.batch_size;
        let horizon = cfg.horizon;
        let n_stim = cfg.n_stimulus;
        let expected_layer = cfg
            .expected_reward_layer
            .filter(|layer| *layer < self.cells.len());

        let mut states = self
            .cells
            .iter()
            .map(|cell| CellState::zeros(batch, cell.hidden(), &self.device))
            .collect::<PredictiveResult<Vec<_>>>()?;
        let mut register = TopDownRegister::new(&states);
        let mut trajectory = Trajectory::new(self.cells.len(), batch, &self.device);

        let mut reward_prev = vec![0.0f32; batch];
        let mut action_prev = Tensor::zeros((batch, cfg.n_actions), DType::F32, &self.device)?;
        let mut mask = vec![1.0f32; batch];

        for t in 0..horizon {
            let obs = env.observe()?;
            if obs.stimulus.len() != batch * n_stim {
                return Err(PredictiveError::shape_mismatch(
                    "observation",
                    (batch * n_stim).to_string(),
                    obs.stimulus.len().to_string(),
                ));
            }
            let observation = Tensor::from_vec(obs.stimulus, (batch, n_stim), &self.device)?;
            let reward_col = Tensor::from_vec(reward_prev.clone(), (batch, 1), &self.device)?;
            trajectory.actual_reward.push(reward_prev.clone());

            let mut bottom_up = observation.clone();
            for (i, cell) in self.cells.iter().enumerate() {
                let x = Tensor::cat(&[&bottom_up, &reward_col, &action_prev], 1)?;
                let out = cell.forward(&x, register.above(i), &states[i])?;

                let (breakdown, totals) = self.measure_error(&out)?;
                trajectory.error_breakdown[i].push(breakdown);
                trajectory.layer_errors[i].extend(totals);

                if expected_layer == Some(i) {
                    let expected: Vec<f32> = out
                        .prediction
                        .narrow(1, n_stim, 1)?
                        .detach()
                        .flatten_all()?
                        .to_vec1()?;
                    trajectory.expected_reward.push(expected);
                }

                bottom_up = out
                    .error
                    .positive
                    .narrow(1, 0, n_stim)?
                    .maximum(&out.error.negative.narrow(1, 0, n_stim)?)?;
                states[i] = out.state;
            }
            register.write(&states);

            let top = &states[states.len() - 1].h;
            let PolicyOutput {
                logits,
                policy,
                value,
            } = self.heads(top)?;
            let actions = self.sample_actions(&policy)?;
            let action_one_hot = self.one_hot(&actions)?;

            // A trial ends on the step after it was rewarded
            for (m, r) in mask.iter_mut().zip(&reward_prev) {
                if *r != 0.0 {
                    *m = 0.0;
                }
            }

            let cfg = &self.config;
            let time_window = if cfg.is_active_step(t) { 1.0 } else { 0.0 };
            let raw = if t + 2 < horizon {
                let raw = env.step(&actions, &mask)?;
                if raw.len() != batch {
                    return Err(PredictiveError::environment(format!(
                        "step returned {} rewards for {batch} trials",
                        raw.len()
                    )));
                }
                raw
            } else {
                vec![cfg.failure_penalty; batch]
            };
            let reward: Vec<f32> = raw
                .iter()
                .zip(&mask)
                .map(|(r, m)| r * m * time_window)
                .collect();

            trace!(step = t, ?actions, ?reward, "rollout step");

            trajectory.steps.push(StepRecord {
                observation,
                policy,
                logits,
                actions,
                action_one_hot: action_one_hot.clone(),
                value,
                reward: reward.clone(),
                mask: mask.clone(),
                time_window,
                hidden: states.iter().map(|s| s.h.clone()).collect(),
                positions: obs.positions,
            });

            reward_prev = reward;
            action_prev = action_one_hot;
        }

        Ok(trajectory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{EnvironmentSnapshot, Observation};

    /// Environment that never rewards and counts calls.
    struct SilentEnv {
        batch: usize,
        width: usize,
        steps: usize,
    }

    impl Environment for SilentEnv {
        fn batch_size(&self) -> usize {
            self.batch
        }
        fn stimulus_width(&self) -> usize {
            self.width
        }
        fn num_actions(&self) -> usize {
            4
        }
        fn set_task(&mut self, _task: usize) -> PredictiveResult<()> {
            Ok(())
        }
        fn begin_iteration(&mut self) -> PredictiveResult<()> {
            Ok(())
        }
        fn observe(&mut self) -> PredictiveResult<Observation> {
            Ok(Observation {
                stimulus: vec![0.5; self.batch * self.width],
                positions: vec![(0, 0); self.batch],
            })
        }
        fn step(&mut self, actions: &[usize], _mask: &[f32]) -> PredictiveResult<Vec<f32>> {
            self.steps += 1;
            Ok(vec![0.0; actions.len()])
        }
        fn snapshot_fields(&self) -> EnvironmentSnapshot {
            EnvironmentSnapshot::default()
        }
    }

    fn setup(config: &AgentConfig) -> (ParameterSet, PredictiveStack) {
        let params = ParameterSet::new(config, &Device::Cpu).unwrap();
        let stack = PredictiveStack::new(config, &params).unwrap();
        (params, stack)
    }

    #[test]
    fn test_top_down_register_lags() {
        let device = Device::Cpu;
        let zeros: Vec<CellState> = (0..2)
            .map(|_| CellState::zeros(1, 2, &device).unwrap())
            .collect();
        let mut register = TopDownRegister::new(&zeros);
        assert!(register.above(1).is_none());

        let ones = CellState {
            h: Tensor::ones((1, 2), DType::F32, &device).unwrap(),
            c: Tensor::ones((1, 2), DType::F32, &device).unwrap(),
        };
        let above: Vec<f32> = register.above(0).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(above, vec![0.0, 0.0]);

        register.write(&[zeros[0].clone(), ones]);
        let above: Vec<f32> = register.above(0).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(above, vec![1.0, 1.0]);
    }

    #[test]
    fn test_rollout_length_and_final_penalty() {
        let config = AgentConfig::test();
        let (_params, mut stack) = setup(&config);
        let mut env = SilentEnv {
            batch: config.batch_size,
            width: config.n_stimulus,
            steps: 0,
        };

        let traj = stack.rollout(&mut env).unwrap();
        assert_eq!(traj.len(), config.horizon);
        assert_eq!(env.steps, config.horizon - 2);

        // Last two steps: the penalty lands on the first and ends the trial
        let last = &traj.steps[config.horizon - 2];
        assert!(last.reward.iter().all(|r| *r == config.failure_penalty));
        let after = &traj.steps[config.horizon - 1];
        assert!(after.mask.iter().all(|m| *m == 0.0));
        assert!(after.reward.iter().all(|r| *r == 0.0));

        assert_eq!(traj.layer_errors.len(), 2);
        assert_eq!(traj.layer_errors[0].len(), 2 * config.horizon);
        assert_eq!(traj.expected_reward.len(), config.horizon);
        assert_eq!(traj.steps[0].hidden.len(), 2);
    }

    #[test]
    fn test_policy_is_a_distribution() {
        let config = AgentConfig::test();
        let (_params, mut stack) = setup(&config);
        let mut env = SilentEnv {
            batch: config.batch_size,
            width: config.n_stimulus,
            steps: 0,
        };
        let traj = stack.rollout(&mut env).unwrap();
        for step in &traj.steps {
            let rows: Vec<Vec<f32>> = step.policy.to_vec2().unwrap();
            for row in rows {
                assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
            }
            assert!(step.actions.iter().all(|a| *a < config.n_actions));
            assert_eq!(step.value.dims(), &[config.batch_size]);
        }
    }

    #[test]
    fn test_mismatched_environment_is_rejected() {
        let config = AgentConfig::test();
        let (_params, mut stack) = setup(&config);
        let mut env = SilentEnv {
            batch: config.batch_size,
            width: config.n_stimulus + 1,
            steps: 0,
        };
        let err = stack.rollout(&mut env).unwrap_err();
        assert!(matches!(err, PredictiveError::ShapeMismatch { .. }));
        assert_eq!(env.steps, 0);
    }

    #[test]
    fn test_active_window_zeroes_rewards_outside() {
        let config = AgentConfig {
            active_window: Some((0, 3)),
            ..AgentConfig::test()
        };
        let (_params, mut stack) = setup(&config);
        let mut env = SilentEnv {
            batch: config.batch_size,
            width: config.n_stimulus,
            steps: 0,
        };
        let traj = stack.rollout(&mut env).unwrap();

        // Penalty steps fall outside the window, so no trial is ever rewarded
        assert!(traj.steps.iter().all(|s| s.reward.iter().all(|r| *r == 0.0)));
        assert_eq!(traj.steps[4].time_window, 0.0);
        assert!(traj.steps[5].mask.iter().all(|m| *m == 1.0));
    }
}
