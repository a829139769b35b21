//! Diagonal Fisher information estimate.

use std::collections::BTreeMap;

use candle_core::Tensor;
use tracing::{debug, info};

use super::{Consolidator, StabilizationRecords};
use crate::config::{AgentConfig, ConsolidationMethod};
use crate::environment::Environment;
use crate::error::PredictiveResult;
use crate::model::PredictiveModel;
use crate::optimizer::{collect_gradients, AdamAdapter};
use crate::params::{ParamId, ParameterSet};

/// Importance from squared log-likelihood gradients.
///
/// After a task, `fisher_batches` fresh rollouts are sampled and each adds
/// `g² / fisher_batches` to the importance, where `g` is the gradient of
/// `Σ mask·tw·onehot·log(ε + π)` with respect to the parameter. Nothing is
/// tracked during training.
#[derive(Debug, Clone)]
pub struct FisherImportance {
    records: StabilizationRecords,
    batches: usize,
    epsilon: f32,
}

impl FisherImportance {
    /// Create zero-importance records for every consolidated parameter.
    pub fn new(config: &AgentConfig, params: &ParameterSet) -> PredictiveResult<Self> {
        Ok(Self {
            records: StabilizationRecords::new(params, config.omega_c)?,
            batches: config.fisher_batches.max(1),
            epsilon: config.epsilon,
        })
    }

    /// Stabilization records
    pub fn records(&self) -> &StabilizationRecords {
        &self.records
    }

    /// Rollouts sampled per estimate
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Add one sampled batch's gradients to the estimate.
    ///
    /// Gradients of parameters without a record (the value head) are ignored.
    pub fn add_sample(&mut self, grads: &BTreeMap<ParamId, Tensor>) -> PredictiveResult<()> {
        let scale = 1.0 / self.batches as f64;
        for (id, grad) in grads {
            if self.records.get(*id).is_none() {
                continue;
            }
            let contribution = grad.detach().sqr()?.affine(scale, 0.0)?;
            self.records.add_importance(*id, &contribution)?;
        }
        Ok(())
    }
}

impl Consolidator for FisherImportance {
    fn method(&self) -> ConsolidationMethod {
        ConsolidationMethod::Fisher
    }

    fn refresh_reference(&mut self, params: &ParameterSet) -> PredictiveResult<()> {
        self.records.refresh_reference(params)
    }

    fn accumulate(&mut self, _optimizer: &AdamAdapter, _delta_perf: f32) -> PredictiveResult<()> {
        Ok(())
    }

    fn discard_pending(&mut self) -> PredictiveResult<()> {
        Ok(())
    }

    fn consolidate(
        &mut self,
        model: &mut PredictiveModel,
        env: &mut dyn Environment,
    ) -> PredictiveResult<()> {
        for batch in 0..self.batches {
            env.begin_iteration()?;
            let trajectory = model.rollout(env)?;
            let log_p = trajectory.log_likelihood(self.epsilon)?;
            let grads = collect_gradients(&log_p, model.params())?;
            self.add_sample(&grads)?;
            debug!(batch, log_p = log_p.to_scalar::<f32>()?, "fisher sample");
        }
        info!(
            batches = self.batches,
            total_importance = self.records.total_importance()?,
            "fisher importance consolidated"
        );
        Ok(())
    }

    fn auxiliary_loss(&self, params: &ParameterSet) -> PredictiveResult<Tensor> {
        self.records.auxiliary_loss(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::HeadParam;
    use candle_core::Device;

    #[test]
    fn test_importance_is_mean_squared_gradient() {
        let config = AgentConfig {
            consolidation: ConsolidationMethod::Fisher,
            fisher_batches: 2,
            ..AgentConfig::test()
        };
        let params = ParameterSet::new(&config, &Device::Cpu).unwrap();
        let mut fisher = FisherImportance::new(&config, &params).unwrap();

        let id = ParamId::Policy(HeadParam::Bias);
        let value_id = ParamId::Value(HeadParam::Bias);
        let device = Device::Cpu;

        let mut first = BTreeMap::new();
        first.insert(id, Tensor::new(&[1f32, 2.0, 0.0, -1.0], &device).unwrap());
        first.insert(value_id, Tensor::new(&[5f32], &device).unwrap());
        let mut second = BTreeMap::new();
        second.insert(id, Tensor::new(&[3f32, 0.0, 0.0, 1.0], &device).unwrap());

        fisher.add_sample(&first).unwrap();
        fisher.add_sample(&second).unwrap();

        let importance: Vec<f32> = fisher
            .records()
            .get(id)
            .unwrap()
            .importance
            .to_vec1()
            .unwrap();
        assert_eq!(importance, vec![5.0, 2.0, 0.0, 1.0]);
        assert!(fisher.records().get(value_id).is_none());
    }
}
