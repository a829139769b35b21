//! Synaptic consolidation across tasks.
//!
//! Both strategies estimate a per-parameter importance and penalize moving
//! important parameters away from a reference value:
//!
//! ```text
//! aux = c · Σ_p importance_p · (reference_p − p)²
//! ```
//!
//! - [`OnlineImportance`] integrates optimizer deltas weighted by the change
//!   in performance during training (path integral).
//! - [`FisherImportance`] samples the squared gradient of the action
//!   log-likelihood after each task (diagonal Fisher information).
//!
//! Value-head parameters never take part.

mod fisher;
mod online;

pub use fisher::FisherImportance;
pub use online::{OnlineImportance, PerformanceTracker};

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};

use crate::config::{AgentConfig, ConsolidationMethod};
use crate::environment::Environment;
use crate::error::{PredictiveError, PredictiveResult};
use crate::model::PredictiveModel;
use crate::optimizer::AdamAdapter;
use crate::params::{ParamId, ParameterSet};

/// Reference value and accumulated importance of one parameter.
#[derive(Debug, Clone)]
pub struct StabilizationRecord {
    /// Value the parameter is pulled back towards
    pub reference: Tensor,
    /// Accumulated importance, elementwise >= 0
    pub importance: Tensor,
}

/// Stabilization records of every consolidated parameter.
///
/// Keyed by [`ParamId`], built once from the parameter set and never resized.
#[derive(Debug, Clone)]
pub struct StabilizationRecords {
    records: BTreeMap<ParamId, StabilizationRecord>,
    omega_c: f32,
    device: Device,
}

impl StabilizationRecords {
    /// Records with the current values as reference and zero importance.
    pub fn new(params: &ParameterSet, omega_c: f32) -> PredictiveResult<Self> {
        let mut records = BTreeMap::new();
        for (id, var) in params.consolidated() {
            records.insert(
                id,
                StabilizationRecord {
                    reference: params.snapshot(id)?,
                    importance: var.as_tensor().zeros_like()?,
                },
            );
        }
        Ok(Self {
            records,
            omega_c,
            device: params.device().clone(),
        })
    }

    /// Record of `id`, if it is consolidated.
    pub fn get(&self, id: ParamId) -> Option<&StabilizationRecord> {
        self.records.get(&id)
    }

    /// Iterate over all records in id order.
    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &StabilizationRecord)> {
        self.records.iter().map(|(id, r)| (*id, r))
    }

    /// Consolidated parameter ids
    pub fn ids(&self) -> impl Iterator<Item = ParamId> + '_ {
        self.records.keys().copied()
    }

    /// Number of consolidated parameters
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no parameter is consolidated
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Set every reference to the parameter's current value.
    pub fn refresh_reference(&mut self, params: &ParameterSet) -> PredictiveResult<()> {
        for (id, record) in self.records.iter_mut() {
            record.reference = params.snapshot(*id)?;
        }
        Ok(())
    }

    /// Add `amount` to the importance of `id`.
    pub fn add_importance(&mut self, id: ParamId, amount: &Tensor) -> PredictiveResult<()> {
        let record = self.records.get_mut(&id).ok_or_else(|| {
            PredictiveError::training(format!("{id} has no stabilization record"))
        })?;
        record.importance = (&record.importance + amount.detach())?.detach();
        Ok(())
    }

    /// Sum of all importances, for logging.
    pub fn total_importance(&self) -> PredictiveResult<f32> {
        let mut total = 0.0f32;
        for record in self.records.values() {
            total += record.importance.sum_all()?.to_scalar::<f32>()?;
        }
        Ok(total)
    }

    /// `c · Σ importance · (reference − p)²`, differentiable in the parameters.
    pub fn auxiliary_loss(&self, params: &ParameterSet) -> PredictiveResult<Tensor> {
        let mut loss = Tensor::zeros((), DType::F32, &self.device)?;
        for (id, record) in &self.records {
            let current = params.get(*id)?.as_tensor();
            let drift = (&record.reference - current)?.sqr()?;
            loss = (loss + (&record.importance * drift)?.sum_all()?)?;
        }
        Ok(loss.affine(self.omega_c as f64, 0.0)?)
    }
}

/// Common interface of the consolidation strategies.
pub trait Consolidator {
    /// Strategy implemented
    fn method(&self) -> ConsolidationMethod;

    /// Set references to the current parameter values.
    fn refresh_reference(&mut self, params: &ParameterSet) -> PredictiveResult<()>;

    /// Per-iteration bookkeeping after an optimizer step.
    fn accumulate(&mut self, optimizer: &AdamAdapter, delta_perf: f32) -> PredictiveResult<()>;

    /// Drop per-task bookkeeping that has not been consolidated yet.
    fn discard_pending(&mut self) -> PredictiveResult<()>;

    /// Fold the finished task into the importance estimate.
    fn consolidate(
        &mut self,
        model: &mut PredictiveModel,
        env: &mut dyn Environment,
    ) -> PredictiveResult<()>;

    /// Penalty added to the objective.
    fn auxiliary_loss(&self, params: &ParameterSet) -> PredictiveResult<Tensor>;
}

/// Consolidation strategy chosen once from the configuration.
pub enum ConsolidationStrategy {
    /// Path-integral importance
    Online(OnlineImportance),
    /// Diagonal Fisher importance
    Fisher(FisherImportance),
    /// No stabilization, the auxiliary loss is always zero
    Disabled {
        /// Device of the zero loss
        device: Device,
    },
}

impl ConsolidationStrategy {
    /// Build the strategy named by `config.consolidation`.
    pub fn from_config(config: &AgentConfig, params: &ParameterSet) -> PredictiveResult<Self> {
        Ok(match config.consolidation {
            ConsolidationMethod::Online => Self::Online(OnlineImportance::new(config, params)?),
            ConsolidationMethod::Fisher => Self::Fisher(FisherImportance::new(config, params)?),
            ConsolidationMethod::None => Self::Disabled {
                device: params.device().clone(),
            },
        })
    }

    /// Stabilization records, absent when consolidation is disabled.
    pub fn records(&self) -> Option<&StabilizationRecords> {
        match self {
            Self::Online(online) => Some(online.records()),
            Self::Fisher(fisher) => Some(fisher.records()),
            Self::Disabled { .. } => None,
        }
    }
}

impl Consolidator for ConsolidationStrategy {
    fn method(&self) -> ConsolidationMethod {
        match self {
            Self::Online(online) => online.method(),
            Self::Fisher(fisher) => fisher.method(),
            Self::Disabled { .. } => ConsolidationMethod::None,
        }
    }

    fn refresh_reference(&mut self, params: &ParameterSet) -> PredictiveResult<()> {
        match self {
            Self::Online(online) => online.refresh_reference(params),
            Self::Fisher(fisher) => fisher.refresh_reference(params),
            Self::Disabled { .. } => Ok(()),
        }
    }

    fn accumulate(&mut self, optimizer: &AdamAdapter, delta_perf: f32) -> PredictiveResult<()> {
        match self {
            Self::Online(online) => online.accumulate(optimizer, delta_perf),
            Self::Fisher(fisher) => fisher.accumulate(optimizer, delta_perf),
            Self::Disabled { .. } => Ok(()),
        }
    }

    fn discard_pending(&mut self) -> PredictiveResult<()> {
        match self {
            Self::Online(online) => online.discard_pending(),
            Self::Fisher(fisher) => fisher.discard_pending(),
            Self::Disabled { .. } => Ok(()),
        }
    }

    fn consolidate(
        &mut self,
        model: &mut PredictiveModel,
        env: &mut dyn Environment,
    ) -> PredictiveResult<()> {
        match self {
            Self::Online(online) => online.consolidate(model, env),
            Self::Fisher(fisher) => fisher.consolidate(model, env),
            Self::Disabled { .. } => Ok(()),
        }
    }

    fn auxiliary_loss(&self, params: &ParameterSet) -> PredictiveResult<Tensor> {
        match self {
            Self::Online(online) => online.auxiliary_loss(params),
            Self::Fisher(fisher) => fisher.auxiliary_loss(params),
            Self::Disabled { device } => Ok(Tensor::zeros((), DType::F32, device)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::HeadParam;

    fn params() -> ParameterSet {
        ParameterSet::new(&AgentConfig::test(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_records_skip_value_head() {
        let params = params();
        let records = StabilizationRecords::new(&params, 1.0).unwrap();
        assert_eq!(records.len(), params.len() - 2);
        assert!(records.get(ParamId::Value(HeadParam::Weight)).is_none());
        assert!(records.get(ParamId::Policy(HeadParam::Weight)).is_some());
    }

    #[test]
    fn test_auxiliary_loss() {
        let params = params();
        let mut records = StabilizationRecords::new(&params, 0.5).unwrap();

        // No importance: no penalty, whatever the drift
        let id = ParamId::Policy(HeadParam::Bias);
        let var = params.get(id).unwrap();
        var.set(&var.as_tensor().affine(1.0, 2.0).unwrap()).unwrap();
        let loss: f32 = records.auxiliary_loss(&params).unwrap().to_scalar().unwrap();
        assert_eq!(loss, 0.0);

        // Importance 3 on four entries drifted by 2: 0.5 * 4 * 3 * 4
        let importance = var.as_tensor().ones_like().unwrap().affine(3.0, 0.0).unwrap();
        records.add_importance(id, &importance).unwrap();
        let loss: f32 = records.auxiliary_loss(&params).unwrap().to_scalar().unwrap();
        assert!((loss - 24.0).abs() < 1e-4);

        records.refresh_reference(&params).unwrap();
        let loss: f32 = records.auxiliary_loss(&params).unwrap().to_scalar().unwrap();
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn test_auxiliary_loss_has_gradient() {
        let params = params();
        let mut records = StabilizationRecords::new(&params, 1.0).unwrap();
        let id = ParamId::Policy(HeadParam::Bias);
        let var = params.get(id).unwrap();
        records
            .add_importance(id, &var.as_tensor().ones_like().unwrap())
            .unwrap();
        var.set(&var.as_tensor().affine(1.0, 1.0).unwrap()).unwrap();

        let loss = records.auxiliary_loss(&params).unwrap();
        let grads = loss.backward().unwrap();
        let grad: Vec<f32> = grads.get(var.as_tensor()).unwrap().to_vec1().unwrap();
        // d/dp (ref - p)² = 2 (p - ref) = 2
        assert!(grad.iter().all(|g| (g - 2.0).abs() < 1e-5));
    }

    #[test]
    fn test_disabled_strategy() {
        let params = params();
        let config = AgentConfig {
            consolidation: ConsolidationMethod::None,
            ..AgentConfig::test()
        };
        let strategy = ConsolidationStrategy::from_config(&config, &params).unwrap();
        assert_eq!(strategy.method(), ConsolidationMethod::None);
        assert!(strategy.records().is_none());
        let loss: f32 = strategy.auxiliary_loss(&params).unwrap().to_scalar().unwrap();
        assert_eq!(loss, 0.0);
    }
}
