//! The predictive RL agent: parameters plus the stack bound to them.

use candle_core::Device;
use tracing::info;

use crate::config::AgentConfig;
use crate::environment::Environment;
use crate::error::PredictiveResult;
use crate::params::ParameterSet;
use crate::stack::PredictiveStack;
use crate::trajectory::Trajectory;

/// Predictive-coding agent.
///
/// Construction validates the configuration before any parameter exists, so
/// an unsupported training method fails without allocating anything.
pub struct PredictiveModel {
    config: AgentConfig,
    params: ParameterSet,
    stack: PredictiveStack,
}

impl PredictiveModel {
    /// Build the agent for `config` on `device`.
    pub fn new(config: &AgentConfig, device: &Device) -> PredictiveResult<Self> {
        config.validate()?;

        let params = ParameterSet::new(config, device)?;
        let stack = PredictiveStack::new(config, &params)?;

        info!(
            layers = config.num_layers(),
            widths = ?config.layer_widths,
            parameters = params.parameter_count(),
            consolidation = %config.consolidation,
            "built predictive model"
        );

        Ok(Self {
            config: config.clone(),
            params,
            stack,
        })
    }

    /// Agent configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Trainable parameters
    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    /// Mutable access for the reset utilities.
    pub fn params_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    /// Device the agent runs on
    pub fn device(&self) -> &Device {
        self.params.device()
    }

    /// Unroll one batch of trials against `env`.
    pub fn rollout(&mut self, env: &mut dyn Environment) -> PredictiveResult<Trajectory> {
        self.stack.rollout(env)
    }

    /// Reseed action sampling.
    pub fn reseed(&mut self, seed: u64) {
        self.stack.reseed(seed);
    }
}
