//! Predictive-coding reinforcement learning agent with synaptic consolidation.
//!
//! This crate implements a recurrent agent that learns a policy while
//! predicting its own sensory, reward and action stream, providing:
//! - A stack of predictive LSTM cells driven by rectified prediction errors
//! - An actor-critic objective with prediction error and activity penalties
//! - Online (path integral) and Fisher consolidation across sequential tasks
//! - A reference grid room environment and a task-sequence trainer
//!
//! # Example
//!
//! ```no_run
//! use predictive_rl_rs::prelude::*;
//! use candle_core::Device;
//!
//! let room = RoomConfig::default();
//! let agent = AgentConfig {
//!     n_stimulus: room.stimulus_width(),
//!     ..AgentConfig::default()
//! };
//! let mut env = RoomEnvironment::new(room, agent.batch_size).unwrap();
//! let mut trainer = Trainer::new(&agent, TrainerConfig::default(), &Device::Cpu).unwrap();
//!
//! let summary = trainer.run(&mut env).unwrap();
//! println!("{:?}", summary.stop_reason);
//! ```
//!
//! # Consolidation
//!
//! The strategy is chosen once through [`config::ConsolidationMethod`]:
//!
//! ```no_run
//! use predictive_rl_rs::config::{AgentConfig, ConsolidationMethod};
//!
//! let mut config = AgentConfig::default();
//! config.consolidation = ConsolidationMethod::Fisher;
//! config.fisher_batches = 32;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_range_loop)]

pub mod cell;
pub mod config;
pub mod consolidation;
pub mod environment;
pub mod error;
pub mod model;
pub mod objective;
pub mod optimizer;
pub mod params;
pub mod snapshot;
pub mod stack;
pub mod trainer;
pub mod trajectory;

pub use config::{AgentConfig, ConsolidationMethod, RoomConfig, TrainerConfig, TrainingMethod};
pub use consolidation::{
    ConsolidationStrategy, Consolidator, FisherImportance, OnlineImportance, PerformanceTracker,
};
pub use environment::{Environment, Observation, RoomEnvironment};
pub use error::{PredictiveError, PredictiveResult};
pub use model::PredictiveModel;
pub use objective::{LossBreakdown, RlObjective};
pub use optimizer::AdamAdapter;
pub use params::{ParamId, ParameterSet};
pub use trainer::{StopHandle, StopReason, Trainer, TrainingSummary};
pub use trajectory::Trajectory;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{
        AgentConfig, ConsolidationMethod, RoomConfig, TrainerConfig, TrainingMethod,
    };
    pub use crate::consolidation::{ConsolidationStrategy, Consolidator};
    pub use crate::environment::{Environment, Observation, RoomEnvironment};
    pub use crate::error::{PredictiveError, PredictiveResult};
    pub use crate::model::PredictiveModel;
    pub use crate::trainer::{StopHandle, StopReason, Trainer, TrainingSummary};
}
