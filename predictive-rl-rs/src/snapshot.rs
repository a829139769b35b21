//! Trajectory snapshots written during training.
//!
//! The log keeps every snapshot of the run and rewrites a single JSON file
//! `<dir>/<name>_trajectories.json` on each flush. The file is written next
//! to its destination and renamed into place, so readers never see a partial
//! file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::environment::EnvironmentSnapshot;
use crate::error::PredictiveResult;
use crate::trajectory::Trajectory;

/// Where the agents went during one rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySnapshot {
    /// Training iteration within the task
    pub iteration: usize,
    /// Task index
    pub task: usize,
    /// Reward cell of each trial
    pub reward_locations: Vec<(usize, usize)>,
    /// Agent positions per step per trial
    pub agent_locations: Vec<Vec<(usize, usize)>>,
    /// Sampled actions per step per trial
    pub actions: Vec<Vec<usize>>,
}

impl TrajectorySnapshot {
    /// Combine a rollout with the environment state it ran in.
    pub fn capture(
        iteration: usize,
        task: usize,
        env: EnvironmentSnapshot,
        trajectory: &Trajectory,
    ) -> Self {
        Self {
            iteration,
            task,
            reward_locations: env.reward_locations,
            agent_locations: env.agent_locations,
            actions: trajectory.actions(),
        }
    }
}

/// Append-only list of snapshots, persisted as JSON.
#[derive(Debug)]
pub struct SnapshotLog {
    dir: PathBuf,
    name: String,
    records: Vec<TrajectorySnapshot>,
}

impl SnapshotLog {
    /// Create an empty log writing into `dir`.
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
            records: Vec::new(),
        }
    }

    /// Destination file
    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}_trajectories.json", self.name))
    }

    /// Snapshots recorded so far
    pub fn records(&self) -> &[TrajectorySnapshot] {
        &self.records
    }

    /// Record a snapshot without writing it.
    pub fn push(&mut self, snapshot: TrajectorySnapshot) {
        self.records.push(snapshot);
    }

    /// Rewrite the snapshot file with every record so far.
    pub fn flush(&self) -> PredictiveResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path();
        let tmp = path.with_extension("json.tmp");

        let json = serde_json::to_string(&self.records)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;

        debug!(path = %path.display(), snapshots = self.records.len(), "wrote trajectory snapshots");
        Ok(path)
    }

    /// Load snapshots written by [`SnapshotLog::flush`].
    pub fn load(path: &Path) -> PredictiveResult<Vec<TrajectorySnapshot>> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
