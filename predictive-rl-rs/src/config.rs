//! Configuration for the predictive RL agent, its trainer and the reference room.
//!
//! All configuration types are serializable and can be loaded from TOML:
//!
//! ```rust
//! use predictive_rl_rs::config::{AgentConfig, ConsolidationMethod};
//!
//! let mut config = AgentConfig::default();
//! config.consolidation = ConsolidationMethod::Fisher;
//! config.validate().unwrap();
//!
//! let text = toml::to_string_pretty(&config).unwrap();
//! let parsed: AgentConfig = toml::from_str(&text).unwrap();
//! assert_eq!(parsed.consolidation, ConsolidationMethod::Fisher);
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PredictiveError, PredictiveResult};

/// Objective the agent is trained with.
///
/// Only reinforcement learning is implemented. Selecting `Supervised` makes
/// agent construction fail before any parameter is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingMethod {
    /// Actor-critic with one-step bootstrapped advantage.
    Reinforcement,
    /// Cross-entropy against targets (unsupported).
    Supervised,
}

/// Synaptic consolidation strategy, chosen once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsolidationMethod {
    /// Path-integral importance tracked online from optimizer deltas.
    Online,
    /// Diagonal Fisher information sampled once per task.
    Fisher,
    /// No stabilization.
    None,
}

impl std::fmt::Display for ConsolidationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Online => "online",
            Self::Fisher => "fisher",
            Self::None => "none",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ConsolidationMethod {
    type Err = PredictiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "online" | "pathint" => Ok(Self::Online),
            "fisher" | "ewc" => Ok(Self::Fisher),
            "none" => Ok(Self::None),
            other => Err(PredictiveError::invalid_config(format!(
                "unknown consolidation method '{other}', use online, fisher or none"
            ))),
        }
    }
}

/// Configuration of the predictive-coding agent and its objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Number of unrolled time steps per rollout
    #[serde(default = "default_horizon")]
    pub horizon: usize,
    /// Independent trials simulated in parallel
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Width of the stimulus part of the observation
    #[serde(default = "default_n_stimulus")]
    pub n_stimulus: usize,
    /// Number of discrete actions
    #[serde(default = "default_n_actions")]
    pub n_actions: usize,
    /// Hidden width of each predictive cell, bottom to top
    #[serde(default = "default_layer_widths")]
    pub layer_widths: Vec<usize>,
    /// Discount applied to the bootstrapped value
    #[serde(default = "default_discount_rate")]
    pub discount_rate: f32,
    /// Penalty on mean hidden activity
    #[serde(default = "default_spike_cost")]
    pub spike_cost: f32,
    /// Weight of the entropy bonus
    #[serde(default = "default_entropy_cost")]
    pub entropy_cost: f32,
    /// Weight of the value regression loss
    #[serde(default = "default_value_cost")]
    pub value_cost: f32,
    /// Weight of the prediction error loss
    #[serde(default = "default_error_cost")]
    pub error_cost: f32,
    /// Consolidation strength
    #[serde(default = "default_omega_c")]
    pub omega_c: f32,
    /// Damping constant of the online importance normalizer
    #[serde(default = "default_omega_xi")]
    pub omega_xi: f32,
    /// Objective selector (only `reinforcement` is supported)
    #[serde(default = "default_training_method")]
    pub training_method: TrainingMethod,
    /// Consolidation strategy
    #[serde(default = "default_consolidation")]
    pub consolidation: ConsolidationMethod,
    /// Reward forced onto the final two steps of every rollout
    #[serde(default = "default_failure_penalty")]
    pub failure_penalty: f32,
    /// Rollouts sampled per Fisher estimate
    #[serde(default = "default_fisher_batches")]
    pub fisher_batches: usize,
    /// Probability that a weight entry is non-zero at initialization
    #[serde(default = "default_connection_prob")]
    pub connection_prob: f64,
    /// Shape of the gamma distribution weights are drawn from
    #[serde(default = "default_init_gamma_shape")]
    pub init_gamma_shape: f64,
    /// Scale of the gamma distribution weights are drawn from
    #[serde(default = "default_init_gamma_scale")]
    pub init_gamma_scale: f64,
    /// Adam learning rate
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    /// Adam first moment decay
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    /// Adam second moment decay
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    /// Adam denominator epsilon
    #[serde(default = "default_adam_eps")]
    pub adam_eps: f32,
    /// Floor added inside every log term
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
    /// Layer whose reward prediction is traced as "expected reward".
    /// Ignored when it does not name an existing layer.
    #[serde(default = "default_expected_reward_layer")]
    pub expected_reward_layer: Option<usize>,
    /// Active time window `[start, end)`; steps outside it carry no reward
    /// and no loss. `None` keeps every step active.
    #[serde(default)]
    pub active_window: Option<(usize, usize)>,
    /// Seed for initialization and action sampling
    #[serde(default = "default_seed")]
    pub seed: u64,
}

// Default value functions for serde
fn default_horizon() -> usize {
    30
}
fn default_batch_size() -> usize {
    64
}
fn default_n_stimulus() -> usize {
    8
}
fn default_n_actions() -> usize {
    4
}
fn default_layer_widths() -> Vec<usize> {
    vec![64, 64, 64]
}
fn default_discount_rate() -> f32 {
    0.9
}
fn default_spike_cost() -> f32 {
    1e-3
}
fn default_entropy_cost() -> f32 {
    0.01
}
fn default_value_cost() -> f32 {
    0.01
}
fn default_error_cost() -> f32 {
    1.0
}
fn default_omega_c() -> f32 {
    0.1
}
fn default_omega_xi() -> f32 {
    0.01
}
fn default_training_method() -> TrainingMethod {
    TrainingMethod::Reinforcement
}
fn default_consolidation() -> ConsolidationMethod {
    ConsolidationMethod::Online
}
fn default_failure_penalty() -> f32 {
    -1.0
}
fn default_fisher_batches() -> usize {
    16
}
fn default_connection_prob() -> f64 {
    0.5
}
fn default_init_gamma_shape() -> f64 {
    0.25
}
fn default_init_gamma_scale() -> f64 {
    0.1
}
fn default_learning_rate() -> f32 {
    1e-3
}
fn default_beta1() -> f32 {
    0.9
}
fn default_beta2() -> f32 {
    0.999
}
fn default_adam_eps() -> f32 {
    1e-8
}
fn default_epsilon() -> f32 {
    1e-7
}
fn default_expected_reward_layer() -> Option<usize> {
    Some(1)
}
fn default_seed() -> u64 {
    42
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            horizon: default_horizon(),
            batch_size: default_batch_size(),
            n_stimulus: default_n_stimulus(),
            n_actions: default_n_actions(),
            layer_widths: default_layer_widths(),
            discount_rate: default_discount_rate(),
            spike_cost: default_spike_cost(),
            entropy_cost: default_entropy_cost(),
            value_cost: default_value_cost(),
            error_cost: default_error_cost(),
            omega_c: default_omega_c(),
            omega_xi: default_omega_xi(),
            training_method: default_training_method(),
            consolidation: default_consolidation(),
            failure_penalty: default_failure_penalty(),
            fisher_batches: default_fisher_batches(),
            connection_prob: default_connection_prob(),
            init_gamma_shape: default_init_gamma_shape(),
            init_gamma_scale: default_init_gamma_scale(),
            learning_rate: default_learning_rate(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            adam_eps: default_adam_eps(),
            epsilon: default_epsilon(),
            expected_reward_layer: default_expected_reward_layer(),
            active_window: None,
            seed: default_seed(),
        }
    }
}

impl AgentConfig {
    /// Test configuration (minimal for unit tests)
    pub fn test() -> Self {
        Self {
            horizon: 6,
            batch_size: 3,
            n_stimulus: 4,
            n_actions: 4,
            layer_widths: vec![8, 6],
            fisher_batches: 2,
            connection_prob: 1.0,
            ..Self::default()
        }
    }

    /// Number of predictive cells in the stack
    pub fn num_layers(&self) -> usize {
        self.layer_widths.len()
    }

    /// Width of every cell's bottom-up input: stimulus, reward, action.
    pub fn input_width(&self) -> usize {
        self.n_stimulus + 1 + self.n_actions
    }

    /// Whether step `t` lies inside the active time window.
    pub fn is_active_step(&self, t: usize) -> bool {
        match self.active_window {
            Some((start, end)) => t >= start && t < end,
            None => true,
        }
    }

    /// Loads configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> PredictiveResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> PredictiveResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            PredictiveError::invalid_config(format!("Failed to serialize config: {e}"))
        })?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Validates ranges and consistency of the configuration.
    ///
    /// The training method is checked first so that an unsupported objective
    /// is reported before anything else.
    pub fn validate(&self) -> PredictiveResult<()> {
        if self.training_method != TrainingMethod::Reinforcement {
            return Err(PredictiveError::invalid_config(
                "supervised learning is not supported, select training_method = \"reinforcement\"",
            ));
        }
        if self.horizon < 2 {
            return Err(PredictiveError::invalid_config(
                "horizon must be >= 2 (the final two steps carry the failure penalty)",
            ));
        }
        if self.batch_size == 0 {
            return Err(PredictiveError::invalid_config("batch_size must be > 0"));
        }
        if self.n_stimulus == 0 || self.n_actions == 0 {
            return Err(PredictiveError::invalid_config(
                "n_stimulus and n_actions must be > 0",
            ));
        }
        if self.layer_widths.is_empty() || self.layer_widths.contains(&0) {
            return Err(PredictiveError::invalid_config(
                "layer_widths must name at least one layer, each wider than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.discount_rate) {
            return Err(PredictiveError::invalid_config(
                "discount_rate must be in [0, 1]",
            ));
        }
        if self.connection_prob <= 0.0 || self.connection_prob > 1.0 {
            return Err(PredictiveError::invalid_config(
                "connection_prob must be in (0, 1]",
            ));
        }
        if self.init_gamma_shape <= 0.0 || self.init_gamma_scale <= 0.0 {
            return Err(PredictiveError::invalid_config(
                "init_gamma_shape and init_gamma_scale must be > 0",
            ));
        }
        if self.learning_rate <= 0.0 {
            return Err(PredictiveError::invalid_config("learning_rate must be > 0"));
        }
        if self.epsilon <= 0.0 || self.omega_xi <= 0.0 {
            return Err(PredictiveError::invalid_config(
                "epsilon and omega_xi must be > 0",
            ));
        }
        if self.consolidation == ConsolidationMethod::Fisher && self.fisher_batches == 0 {
            return Err(PredictiveError::invalid_config(
                "fisher_batches must be > 0 when consolidation = \"fisher\"",
            ));
        }
        if let Some((start, end)) = self.active_window {
            if start >= end || end > self.horizon {
                return Err(PredictiveError::invalid_config(format!(
                    "active_window [{start}, {end}) must be non-empty and within the horizon {}",
                    self.horizon
                )));
            }
        }
        Ok(())
    }
}

/// Configuration of the outer training loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Number of sequential tasks
    #[serde(default = "default_num_tasks")]
    pub num_tasks: usize,
    /// Maximum training iterations per task
    #[serde(default = "default_iterations_per_task")]
    pub iterations_per_task: usize,
    /// Log progress every N iterations
    #[serde(default = "default_log_every")]
    pub log_every: usize,
    /// Persist trajectory snapshots every N iterations (0 disables)
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: usize,
    /// Directory snapshots are written to
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    /// File name prefix of this run
    #[serde(default = "default_run_name")]
    pub run_name: String,
    /// Number of recent iterations averaged for early stopping
    #[serde(default = "default_early_stop_window")]
    pub early_stop_window: usize,
    /// Mean accuracy over the window that ends a task early
    #[serde(default = "default_early_stop_accuracy")]
    pub early_stop_accuracy: f32,
}

fn default_num_tasks() -> usize {
    2
}
fn default_iterations_per_task() -> usize {
    2000
}
fn default_log_every() -> usize {
    200
}
fn default_snapshot_every() -> usize {
    200
}
fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("./runs")
}
fn default_run_name() -> String {
    "pcrl".to_string()
}
fn default_early_stop_window() -> usize {
    500
}
fn default_early_stop_accuracy() -> f32 {
    0.98
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            num_tasks: default_num_tasks(),
            iterations_per_task: default_iterations_per_task(),
            log_every: default_log_every(),
            snapshot_every: default_snapshot_every(),
            snapshot_dir: default_snapshot_dir(),
            run_name: default_run_name(),
            early_stop_window: default_early_stop_window(),
            early_stop_accuracy: default_early_stop_accuracy(),
        }
    }
}

impl TrainerConfig {
    /// Validates the loop settings.
    pub fn validate(&self) -> PredictiveResult<()> {
        if self.num_tasks == 0 || self.iterations_per_task == 0 {
            return Err(PredictiveError::invalid_config(
                "num_tasks and iterations_per_task must be > 0",
            ));
        }
        if self.log_every == 0 {
            return Err(PredictiveError::invalid_config("log_every must be > 0"));
        }
        if self.early_stop_window == 0 {
            return Err(PredictiveError::invalid_config(
                "early_stop_window must be > 0",
            ));
        }
        Ok(())
    }
}

/// Configuration of the reference grid room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Room width in cells
    #[serde(default = "default_room_width")]
    pub width: usize,
    /// Room height in cells
    #[serde(default = "default_room_height")]
    pub height: usize,
    /// Reward delivered on reaching the task's reward cell
    #[serde(default = "default_reward_value")]
    pub reward_value: f32,
    /// Reward cell of each task as `(x, y)`; tasks cycle through this list
    #[serde(default = "default_task_rewards")]
    pub task_rewards: Vec<(usize, usize)>,
    /// Seed for agent placement
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_room_width() -> usize {
    4
}
fn default_room_height() -> usize {
    4
}
fn default_reward_value() -> f32 {
    1.0
}
fn default_task_rewards() -> Vec<(usize, usize)> {
    vec![(0, 0), (3, 3), (3, 0), (0, 3)]
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            width: default_room_width(),
            height: default_room_height(),
            reward_value: default_reward_value(),
            task_rewards: default_task_rewards(),
            seed: default_seed(),
        }
    }
}

impl RoomConfig {
    /// Stimulus width produced by the room: one-hot x followed by one-hot y.
    pub fn stimulus_width(&self) -> usize {
        self.width + self.height
    }

    /// Validates the room geometry.
    pub fn validate(&self) -> PredictiveResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(PredictiveError::invalid_config(
                "room width and height must be > 0",
            ));
        }
        if self.task_rewards.is_empty() {
            return Err(PredictiveError::invalid_config(
                "task_rewards must name at least one reward cell",
            ));
        }
        if let Some(&(x, y)) = self
            .task_rewards
            .iter()
            .find(|(x, y)| *x >= self.width || *y >= self.height)
        {
            return Err(PredictiveError::invalid_config(format!(
                "reward cell ({x}, {y}) lies outside the {}x{} room",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// Everything a training run needs, as read from one TOML file.
///
/// ```toml
/// [agent]
/// horizon = 30
/// consolidation = "fisher"
///
/// [trainer]
/// num_tasks = 4
///
/// [room]
/// width = 4
/// height = 4
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Agent and objective
    #[serde(default)]
    pub agent: AgentConfig,
    /// Training loop
    #[serde(default)]
    pub trainer: TrainerConfig,
    /// Reference room
    #[serde(default)]
    pub room: RoomConfig,
}

impl RunConfig {
    /// Loads a run configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> PredictiveResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&content)?)
    }

    /// Saves the run configuration to a TOML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> PredictiveResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            PredictiveError::invalid_config(format!("Failed to serialize config: {e}"))
        })?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Validates all three sections and that the agent fits the room.
    pub fn validate(&self) -> PredictiveResult<()> {
        self.agent.validate()?;
        self.trainer.validate()?;
        self.room.validate()?;
        if self.agent.n_stimulus != self.room.stimulus_width() {
            return Err(PredictiveError::invalid_config(format!(
                "agent n_stimulus {} does not match the {}x{} room (needs {})",
                self.agent.n_stimulus,
                self.room.width,
                self.room.height,
                self.room.stimulus_width()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        AgentConfig::default().validate().unwrap();
        AgentConfig::test().validate().unwrap();
        TrainerConfig::default().validate().unwrap();
        RoomConfig::default().validate().unwrap();
    }

    #[test]
    fn test_supervised_is_rejected() {
        let config = AgentConfig {
            training_method: TrainingMethod::Supervised,
            ..AgentConfig::test()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, PredictiveError::InvalidConfig(_)));
        assert!(err.to_string().contains("supervised"));
    }

    #[test]
    fn test_input_width() {
        let config = AgentConfig::test();
        assert_eq!(config.input_width(), 4 + 1 + 4);
        assert_eq!(config.num_layers(), 2);
    }

    #[test]
    fn test_active_window() {
        let mut config = AgentConfig::test();
        assert!(config.is_active_step(0));
        config.active_window = Some((2, 4));
        assert!(!config.is_active_step(1));
        assert!(config.is_active_step(2));
        assert!(config.is_active_step(3));
        assert!(!config.is_active_step(4));

        config.active_window = Some((4, 4));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_consolidation_from_str() {
        assert_eq!(
            "pathint".parse::<ConsolidationMethod>().unwrap(),
            ConsolidationMethod::Online
        );
        assert_eq!(
            "EWC".parse::<ConsolidationMethod>().unwrap(),
            ConsolidationMethod::Fisher
        );
        assert!("synaptic".parse::<ConsolidationMethod>().is_err());
    }

    #[test]
    fn test_toml_roundtrip_with_defaults() {
        let parsed: AgentConfig = toml::from_str(
            r#"
            horizon = 12
            consolidation = "fisher"
            layer_widths = [16, 16]
            "#,
        )
        .unwrap();
        assert_eq!(parsed.horizon, 12);
        assert_eq!(parsed.consolidation, ConsolidationMethod::Fisher);
        assert_eq!(parsed.batch_size, default_batch_size());
        assert_eq!(parsed.training_method, TrainingMethod::Reinforcement);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        let config = AgentConfig::test();
        config.to_file(&path).unwrap();
        let loaded = AgentConfig::from_file(&path).unwrap();
        assert_eq!(loaded.layer_widths, config.layer_widths);
        assert_eq!(loaded.horizon, config.horizon);
    }

    #[test]
    fn test_room_validation() {
        let room = RoomConfig {
            task_rewards: vec![(9, 0)],
            ..RoomConfig::default()
        };
        assert!(room.validate().is_err());
        assert_eq!(RoomConfig::default().stimulus_width(), 8);
    }

    #[test]
    fn test_run_config_sections() {
        let run: RunConfig = toml::from_str(
            r#"
            [agent]
            consolidation = "none"

            [trainer]
            num_tasks = 3

            [room]
            width = 5
            "#,
        )
        .unwrap();
        assert_eq!(run.agent.consolidation, ConsolidationMethod::None);
        assert_eq!(run.trainer.num_tasks, 3);
        assert_eq!(run.room.stimulus_width(), 9);
        // Default agent expects an 8-wide stimulus
        assert!(run.validate().is_err());

        RunConfig::default().validate().unwrap();
    }
}
