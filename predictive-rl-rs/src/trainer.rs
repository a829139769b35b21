//! Training loop over a sequence of tasks.
//!
//! One iteration is one rollout plus one optimizer step:
//!
//! 1. `begin_iteration` on the environment and roll the stack out
//! 2. build the objective with the consolidation penalty and apply Adam
//! 3. clamp recurrent weights, update performance and path integrals
//! 4. log and snapshot on their intervals
//!
//! At each task boundary the consolidation strategy folds the finished task
//! into its importance estimate, the optimizer moments are reset and the
//! references move to the current parameters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, TrainerConfig};
use crate::consolidation::{ConsolidationStrategy, Consolidator, PerformanceTracker};
use crate::environment::Environment;
use crate::error::PredictiveResult;
use crate::model::PredictiveModel;
use crate::objective::{LossScalars, RlObjective};
use crate::optimizer::{AdamAdapter, StepInfo};
use crate::snapshot::{SnapshotLog, TrajectorySnapshot};
use crate::trajectory::ErrorBreakdown;

/// Shared flag an embedder sets to stop training at the next iteration.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Create an unset handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the trainer to stop.
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested
    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why [`Trainer::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Every task ran to its iteration limit or early-stop threshold
    Completed,
    /// A stop was requested through the [`StopHandle`]
    Interrupted,
}

/// Metrics of one training iteration.
#[derive(Debug, Clone)]
pub struct IterationReport {
    /// Iteration within the task
    pub iteration: usize,
    /// Task index
    pub task: usize,
    /// Mean number of rewarded steps per trial
    pub accuracy: f32,
    /// Mean accumulated reward per trial
    pub mean_reward: f32,
    /// Change in running performance fed to consolidation
    pub delta_perf: f32,
    /// Loss components
    pub losses: LossScalars,
    /// Optimizer step summary
    pub step: StepInfo,
    /// Mean hidden activity over all layers
    pub mean_hidden: f32,
    /// Time-averaged prediction error of each layer
    pub layer_errors: Vec<ErrorBreakdown>,
}

/// Outcome of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    /// Task index
    pub task: usize,
    /// Iterations trained
    pub iterations: usize,
    /// Accuracy of the last iteration
    pub final_accuracy: f32,
    /// Mean accuracy over the early-stop window at the end of the task
    pub recent_accuracy: f32,
    /// Whether the accuracy threshold ended the task
    pub early_stopped: bool,
}

/// Outcome of a full run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// Per-task results in order
    pub tasks: Vec<TaskSummary>,
    /// Why the run ended
    pub stop_reason: StopReason,
}

fn format_layers(errors: &[ErrorBreakdown], select: impl Fn(&ErrorBreakdown) -> f32) -> String {
    let values: Vec<String> = errors.iter().map(|e| format!("{:.5}", select(e))).collect();
    format!("[{}]", values.join(", "))
}

/// Drives the agent through a sequence of tasks.
pub struct Trainer {
    config: TrainerConfig,
    model: PredictiveModel,
    objective: RlObjective,
    optimizer: AdamAdapter,
    consolidation: ConsolidationStrategy,
    tracker: PerformanceTracker,
    snapshots: Option<SnapshotLog>,
    recent_accuracy: VecDeque<f32>,
    stop: StopHandle,
}

impl Trainer {
    /// Build the agent and everything that trains it.
    ///
    /// Configuration errors, including an unsupported training method, are
    /// reported before any parameter is created.
    pub fn new(
        agent: &AgentConfig,
        config: TrainerConfig,
        device: &Device,
    ) -> PredictiveResult<Self> {
        agent.validate()?;
        config.validate()?;
        let objective = RlObjective::new(agent)?;

        let model = PredictiveModel::new(agent, device)?;
        let optimizer = AdamAdapter::new(agent);
        let consolidation = ConsolidationStrategy::from_config(agent, model.params())?;
        let snapshots = (config.snapshot_every > 0)
            .then(|| SnapshotLog::new(config.snapshot_dir.clone(), config.run_name.clone()));

        Ok(Self {
            config,
            model,
            objective,
            optimizer,
            consolidation,
            tracker: PerformanceTracker::new(),
            snapshots,
            recent_accuracy: VecDeque::new(),
            stop: StopHandle::new(),
        })
    }

    /// Handle that stops the run at the next iteration boundary.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// The agent
    pub fn model(&self) -> &PredictiveModel {
        &self.model
    }

    /// Mutable access to the agent
    pub fn model_mut(&mut self) -> &mut PredictiveModel {
        &mut self.model
    }

    /// The optimizer
    pub fn optimizer(&self) -> &AdamAdapter {
        &self.optimizer
    }

    /// The consolidation strategy
    pub fn consolidation(&self) -> &ConsolidationStrategy {
        &self.consolidation
    }

    /// Snapshot log, absent when snapshots are disabled.
    pub fn snapshots(&self) -> Option<&SnapshotLog> {
        self.snapshots.as_ref()
    }

    /// Switch `env` to `task` and reset the per-task state.
    pub fn begin_task(&mut self, env: &mut dyn Environment, task: usize) -> PredictiveResult<()> {
        env.set_task(task)?;
        self.tracker.reset();
        self.recent_accuracy.clear();
        self.consolidation.discard_pending()?;
        self.consolidation.refresh_reference(self.model.params())?;
        info!(task, consolidation = %self.consolidation.method(), "starting task");
        Ok(())
    }

    /// Run one rollout and one optimizer step.
    pub fn train_iteration(
        &mut self,
        env: &mut dyn Environment,
        task: usize,
        iteration: usize,
    ) -> PredictiveResult<IterationReport> {
        env.begin_iteration()?;
        let trajectory = self.model.rollout(env)?;

        let auxiliary = self.consolidation.auxiliary_loss(self.model.params())?;
        let losses = self.objective.compute(&trajectory, &auxiliary)?;
        let step = self.optimizer.apply(&losses.total, self.model.params())?;
        let shifts = self.model.params().desaturate_recurrent()?;
        self.optimizer.absorb_shifts(&shifts)?;

        let mean_reward = trajectory.mean_reward();
        let accuracy = trajectory.accuracy();
        let delta_perf = self.tracker.record(mean_reward);
        self.consolidation.accumulate(&self.optimizer, delta_perf)?;

        if let Some(log) = self.snapshots.as_mut() {
            if iteration % self.config.snapshot_every == 0 {
                log.push(TrajectorySnapshot::capture(
                    iteration,
                    task,
                    env.snapshot_fields(),
                    &trajectory,
                ));
                log.flush()?;
            }
        }

        let layer_errors = (0..self.model.config().num_layers())
            .map(|layer| trajectory.mean_error_breakdown(layer))
            .collect();

        Ok(IterationReport {
            iteration,
            task,
            accuracy,
            mean_reward,
            delta_perf,
            losses: losses.scalars()?,
            step,
            mean_hidden: trajectory.mean_hidden_activity()?,
            layer_errors,
        })
    }

    fn log_report(&self, report: &IterationReport) {
        info!(
            iteration = report.iteration,
            task = report.task,
            accuracy = format!("{:.3}", report.accuracy),
            reward = format!("{:.3}", report.mean_reward),
            aux_loss = format!("{:.5}", report.losses.auxiliary),
            mean_h = format!("{:.5}", report.mean_hidden),
            "training progress"
        );
        info!(
            total_pe = format_layers(&report.layer_errors, ErrorBreakdown::total),
            stim_pe = format_layers(&report.layer_errors, ErrorBreakdown::stimulus),
            rew_pe = format_layers(&report.layer_errors, ErrorBreakdown::reward),
            act_pe = format_layers(&report.layer_errors, ErrorBreakdown::action),
            "prediction errors"
        );
        debug!(
            policy = report.losses.policy,
            value = report.losses.value,
            entropy = report.losses.entropy,
            prediction = report.losses.prediction,
            spike = report.losses.spike,
            grad_norm = report.step.gradient_norm,
            "loss breakdown"
        );
    }

    fn recent_mean_accuracy(&self) -> f32 {
        if self.recent_accuracy.is_empty() {
            return 0.0;
        }
        self.recent_accuracy.iter().sum::<f32>() / self.recent_accuracy.len() as f32
    }

    /// Fold the finished task into the importance estimate and reset the
    /// optimizer for the next one.
    pub fn finish_task(&mut self, env: &mut dyn Environment) -> PredictiveResult<()> {
        self.consolidation.consolidate(&mut self.model, env)?;
        self.optimizer.reset_moments();
        self.consolidation.refresh_reference(self.model.params())?;
        Ok(())
    }

    /// Train on `task` until the iteration limit, the accuracy threshold or
    /// a stop request. Returns the summary and whether training was stopped.
    pub fn run_task(
        &mut self,
        env: &mut dyn Environment,
        task: usize,
    ) -> PredictiveResult<(TaskSummary, bool)> {
        self.begin_task(env, task)?;

        let window = self.config.early_stop_window;
        let mut summary = TaskSummary {
            task,
            iterations: 0,
            final_accuracy: 0.0,
            recent_accuracy: 0.0,
            early_stopped: false,
        };
        let mut interrupted = false;

        for iteration in 0..self.config.iterations_per_task {
            if self.stop.is_stop_requested() {
                interrupted = true;
                break;
            }

            let report = self.train_iteration(env, task, iteration)?;
            summary.iterations += 1;
            summary.final_accuracy = report.accuracy;

            self.recent_accuracy.push_back(report.accuracy);
            if self.recent_accuracy.len() > window {
                self.recent_accuracy.pop_front();
            }
            summary.recent_accuracy = self.recent_mean_accuracy();

            if iteration % self.config.log_every == 0 {
                self.log_report(&report);
            }

            if self.recent_accuracy.len() == window
                && summary.recent_accuracy > self.config.early_stop_accuracy
            {
                info!(
                    task,
                    iteration,
                    accuracy = summary.recent_accuracy,
                    "accuracy reached threshold"
                );
                summary.early_stopped = true;
                break;
            }
        }

        if interrupted {
            warn!(task, iterations = summary.iterations, "training interrupted");
            // Leave the agent ready for a later task without consolidating
            // the partial one
            self.optimizer.reset_moments();
            self.consolidation.discard_pending()?;
            self.consolidation.refresh_reference(self.model.params())?;
        } else {
            self.finish_task(env)?;
            info!(
                task,
                iterations = summary.iterations,
                accuracy = summary.recent_accuracy,
                "finished task"
            );
        }

        Ok((summary, interrupted))
    }

    /// Train on every configured task in order.
    pub fn run(&mut self, env: &mut dyn Environment) -> PredictiveResult<TrainingSummary> {
        let mut tasks = Vec::with_capacity(self.config.num_tasks);
        let mut stop_reason = StopReason::Completed;

        for task in 0..self.config.num_tasks {
            let (summary, interrupted) = self.run_task(env, task)?;
            tasks.push(summary);
            if interrupted {
                stop_reason = StopReason::Interrupted;
                break;
            }
        }

        if let Some(log) = self.snapshots.as_ref() {
            if !log.records().is_empty() {
                log.flush()?;
            }
        }

        info!(tasks = tasks.len(), ?stop_reason, "training finished");
        Ok(TrainingSummary { tasks, stop_reason })
    }
}
