//! Environment contract and the reference grid room.
//!
//! Environments exchange plain host data with the agent: observations,
//! actions and rewards are never part of the gradient graph.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RoomConfig;
use crate::error::{PredictiveError, PredictiveResult};

/// What the agents sense at one step.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Row-major stimulus `[batch, stimulus_width]`
    pub stimulus: Vec<f32>,
    /// Position of every agent as `(x, y)`
    pub positions: Vec<(usize, usize)>,
}

/// Environment state recorded alongside a trajectory snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    /// Reward cell of each trial
    pub reward_locations: Vec<(usize, usize)>,
    /// Agent positions per step, each holding one entry per trial
    pub agent_locations: Vec<Vec<(usize, usize)>>,
}

/// A batched task the agent acts in.
///
/// The trainer calls `set_task` at each task boundary, `begin_iteration`
/// before each rollout, and then alternates `observe` and `step` in program
/// order.
pub trait Environment {
    /// Number of parallel trials
    fn batch_size(&self) -> usize;

    /// Width of one trial's stimulus
    fn stimulus_width(&self) -> usize;

    /// Number of discrete actions accepted by `step`
    fn num_actions(&self) -> usize;

    /// Switch to task `task`.
    fn set_task(&mut self, task: usize) -> PredictiveResult<()>;

    /// Reset agents and rewards for a fresh rollout.
    fn begin_iteration(&mut self) -> PredictiveResult<()>;

    /// Current stimulus of every trial.
    fn observe(&mut self) -> PredictiveResult<Observation>;

    /// Advance every trial whose `mask` entry is non-zero by its action and
    /// return one reward per trial. Masked trials receive zero.
    fn step(&mut self, actions: &[usize], mask: &[f32]) -> PredictiveResult<Vec<f32>>;

    /// Reward locations and movement history of the current rollout.
    fn snapshot_fields(&self) -> EnvironmentSnapshot;
}

/// Moves available in the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Move {
    /// y - 1
    Up,
    /// y + 1
    Down,
    /// x - 1
    Left,
    /// x + 1
    Right,
}

impl Move {
    /// Number of moves
    pub const COUNT: usize = 4;

    /// Decode an action index.
    pub fn from_index(action: usize) -> Option<Self> {
        match action {
            0 => Some(Self::Up),
            1 => Some(Self::Down),
            2 => Some(Self::Left),
            3 => Some(Self::Right),
            _ => None,
        }
    }
}

/// Grid room where each trial's agent searches for the task's reward cell.
///
/// Stimulus per trial is a one-hot x coordinate followed by a one-hot y
/// coordinate. Walls clamp movement.
pub struct RoomEnvironment {
    config: RoomConfig,
    batch_size: usize,
    reward_cell: (usize, usize),
    positions: Vec<(usize, usize)>,
    history: Vec<Vec<(usize, usize)>>,
    rng: StdRng,
}

impl RoomEnvironment {
    /// Create a room for `batch_size` parallel trials, starting on task 0.
    pub fn new(config: RoomConfig, batch_size: usize) -> PredictiveResult<Self> {
        config.validate()?;
        if batch_size == 0 {
            return Err(PredictiveError::invalid_config("room batch_size must be > 0"));
        }
        let rng = StdRng::seed_from_u64(config.seed);
        let reward_cell = config.task_rewards[0];
        let mut room = Self {
            config,
            batch_size,
            reward_cell,
            positions: Vec::new(),
            history: Vec::new(),
            rng,
        };
        room.begin_iteration()?;
        Ok(room)
    }

    /// Reward cell of the current task
    pub fn reward_cell(&self) -> (usize, usize) {
        self.reward_cell
    }

    /// Current agent positions
    pub fn positions(&self) -> &[(usize, usize)] {
        &self.positions
    }

    /// Place agents explicitly, mainly for tests.
    pub fn place_agents(&mut self, positions: Vec<(usize, usize)>) -> PredictiveResult<()> {
        if positions.len() != self.batch_size {
            return Err(PredictiveError::environment(format!(
                "expected {} positions, got {}",
                self.batch_size,
                positions.len()
            )));
        }
        if let Some(&(x, y)) = positions
            .iter()
            .find(|(x, y)| *x >= self.config.width || *y >= self.config.height)
        {
            return Err(PredictiveError::environment(format!(
                "position ({x}, {y}) lies outside the room"
            )));
        }
        self.history = vec![positions.clone()];
        self.positions = positions;
        Ok(())
    }

    fn random_start(&mut self) -> (usize, usize) {
        let cells = self.config.width * self.config.height;
        loop {
            let cell = self.rng.gen_range(0..cells);
            let pos = (cell % self.config.width, cell / self.config.width);
            if pos != self.reward_cell || cells == 1 {
                return pos;
            }
        }
    }

    fn moved(&self, (x, y): (usize, usize), mv: Move) -> (usize, usize) {
        match mv {
            Move::Up => (x, y.saturating_sub(1)),
            Move::Down => (x, (y + 1).min(self.config.height - 1)),
            Move::Left => (x.saturating_sub(1), y),
            Move::Right => ((x + 1).min(self.config.width - 1), y),
        }
    }
}

impl Environment for RoomEnvironment {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn stimulus_width(&self) -> usize {
        self.config.stimulus_width()
    }

    fn num_actions(&self) -> usize {
        Move::COUNT
    }

    fn set_task(&mut self, task: usize) -> PredictiveResult<()> {
        let rewards = &self.config.task_rewards;
        self.reward_cell = rewards[task % rewards.len()];
        debug!(task, reward_cell = ?self.reward_cell, "room switched task");
        Ok(())
    }

    fn begin_iteration(&mut self) -> PredictiveResult<()> {
        let positions = (0..self.batch_size).map(|_| self.random_start()).collect();
        self.place_agents(positions)
    }

    fn observe(&mut self) -> PredictiveResult<Observation> {
        let width = self.stimulus_width();
        let mut stimulus = vec![0.0f32; self.batch_size * width];
        for (b, &(x, y)) in self.positions.iter().enumerate() {
            stimulus[b * width + x] = 1.0;
            stimulus[b * width + self.config.width + y] = 1.0;
        }
        Ok(Observation {
            stimulus,
            positions: self.positions.clone(),
        })
    }

    fn step(&mut self, actions: &[usize], mask: &[f32]) -> PredictiveResult<Vec<f32>> {
        if actions.len() != self.batch_size || mask.len() != self.batch_size {
            return Err(PredictiveError::environment(format!(
                "step expects {} actions and mask entries, got {} and {}",
                self.batch_size,
                actions.len(),
                mask.len()
            )));
        }

        let mut rewards = vec![0.0f32; self.batch_size];
        for b in 0..self.batch_size {
            if mask[b] == 0.0 {
                continue;
            }
            let mv = Move::from_index(actions[b]).ok_or_else(|| {
                PredictiveError::environment(format!("invalid action {}", actions[b]))
            })?;
            self.positions[b] = self.moved(self.positions[b], mv);
            if self.positions[b] == self.reward_cell {
                rewards[b] = self.config.reward_value;
            }
        }
        self.history.push(self.positions.clone());
        Ok(rewards)
    }

    fn snapshot_fields(&self) -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            reward_locations: vec![self.reward_cell; self.batch_size],
            agent_locations: self.history.clone(),
        }
    }
}
