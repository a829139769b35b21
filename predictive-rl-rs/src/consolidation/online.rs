//! Path-integral importance tracked online.

use std::collections::BTreeMap;

use candle_core::Tensor;
use tracing::{debug, info};

use super::{Consolidator, StabilizationRecords};
use crate::config::{AgentConfig, ConsolidationMethod};
use crate::environment::Environment;
use crate::error::PredictiveResult;
use crate::model::PredictiveModel;
use crate::optimizer::AdamAdapter;
use crate::params::{ParamId, ParameterSet};

/// Running performance over the current task.
///
/// Performance is the running mean of per-iteration mean accumulated reward.
/// The change it reports is the difference to the running mean one
/// iteration earlier, and zero on the first iteration of a task.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerformanceTracker {
    mean: f32,
    count: usize,
}

impl PerformanceTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one iteration's reward and return the change in performance.
    pub fn record(&mut self, reward: f32) -> f32 {
        let previous = self.mean;
        self.count += 1;
        self.mean += (reward - self.mean) / self.count as f32;
        if self.count == 1 {
            0.0
        } else {
            self.mean - previous
        }
    }

    /// Current running mean
    pub fn mean(&self) -> f32 {
        self.mean
    }

    /// Iterations recorded in this task
    pub fn count(&self) -> usize {
        self.count
    }

    /// Forget everything, at a task boundary.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Online importance estimate.
///
/// Every step adds `δ·Δperf` to `small_omega` and `|δ·Δperf|` to
/// `small_omega_div`, where `δ` is the parameter delta just applied by the
/// optimizer. At the end of a task
/// `importance += |small_omega| / (ξ + small_omega_div)`.
#[derive(Debug, Clone)]
pub struct OnlineImportance {
    records: StabilizationRecords,
    small_omega: BTreeMap<ParamId, Tensor>,
    small_omega_div: BTreeMap<ParamId, Tensor>,
    omega_xi: f32,
}

impl OnlineImportance {
    /// Create records and zeroed accumulators for every consolidated parameter.
    pub fn new(config: &AgentConfig, params: &ParameterSet) -> PredictiveResult<Self> {
        let records = StabilizationRecords::new(params, config.omega_c)?;
        let mut small_omega = BTreeMap::new();
        let mut small_omega_div = BTreeMap::new();
        for (id, var) in params.consolidated() {
            small_omega.insert(id, var.as_tensor().zeros_like()?);
            small_omega_div.insert(id, var.as_tensor().zeros_like()?);
        }
        Ok(Self {
            records,
            small_omega,
            small_omega_div,
            omega_xi: config.omega_xi,
        })
    }

    /// Stabilization records
    pub fn records(&self) -> &StabilizationRecords {
        &self.records
    }

    /// Signed path integral of `id` in the current task
    pub fn small_omega(&self, id: ParamId) -> Option<&Tensor> {
        self.small_omega.get(&id)
    }

    /// Absolute path integral of `id` in the current task
    pub fn small_omega_div(&self, id: ParamId) -> Option<&Tensor> {
        self.small_omega_div.get(&id)
    }

    fn reset_accumulators(&mut self) -> PredictiveResult<()> {
        for acc in self
            .small_omega
            .values_mut()
            .chain(self.small_omega_div.values_mut())
        {
            *acc = acc.zeros_like()?;
        }
        Ok(())
    }
}

impl Consolidator for OnlineImportance {
    fn method(&self) -> ConsolidationMethod {
        ConsolidationMethod::Online
    }

    fn refresh_reference(&mut self, params: &ParameterSet) -> PredictiveResult<()> {
        self.records.refresh_reference(params)
    }

    fn accumulate(&mut self, optimizer: &AdamAdapter, delta_perf: f32) -> PredictiveResult<()> {
        if delta_perf == 0.0 {
            return Ok(());
        }
        for (id, small) in self.small_omega.iter_mut() {
            let Some(delta) = optimizer.last_delta(*id) else {
                continue;
            };
            let contribution = delta.detach().affine(delta_perf as f64, 0.0)?;
            *small = (&*small + &contribution)?.detach();
            if let Some(div) = self.small_omega_div.get_mut(id) {
                *div = (&*div + contribution.abs()?)?.detach();
            }
        }
        Ok(())
    }

    fn discard_pending(&mut self) -> PredictiveResult<()> {
        self.reset_accumulators()
    }

    fn consolidate(
        &mut self,
        model: &mut PredictiveModel,
        _env: &mut dyn Environment,
    ) -> PredictiveResult<()> {
        let ids: Vec<ParamId> = self.records.ids().collect();
        for id in ids {
            let (Some(small), Some(div)) = (self.small_omega.get(&id), self.small_omega_div.get(&id))
            else {
                continue;
            };
            let importance = (small.abs()? / (div + self.omega_xi as f64)?)?.detach();
            self.records.add_importance(id, &importance)?;
        }
        self.reset_accumulators()?;
        self.records.refresh_reference(model.params())?;

        info!(
            total_importance = self.records.total_importance()?,
            "online importance consolidated"
        );
        debug!(parameters = self.records.len(), "reset path integrals");
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
    fn test_performance_tracker() {
        let mut tracker = PerformanceTracker::new();
        assert_eq!(tracker.record(2.0), 0.0);
        // mean 2 -> 3
        assert!((tracker.record(4.0) - 1.0).abs() < 1e-6);
        // mean 3 -> 2
        assert!((tracker.record(0.0) + 1.0).abs() < 1e-6);
        assert_eq!(tracker.count(), 3);

        tracker.reset();
        assert_eq!(tracker.count(), 0);
        assert_eq!(tracker.record(5.0), 0.0);
    }

    #[test]
    fn test_accumulate_integrates_deltas() {
        let config = AgentConfig::test();
        let params = ParameterSet::new(&config, &Device::Cpu).unwrap();
        let mut online = OnlineImportance::new(&config, &params).unwrap();
        let mut optimizer = AdamAdapter::with_params(0.1, 0.9, 0.999, 1e-8);

        let id = ParamId::Policy(HeadParam::Bias);
        let loss = params.get(id).unwrap().as_tensor().sum_all().unwrap();
        optimizer.apply(&loss, &params).unwrap();

        // delta = -0.1 per entry
        online.accumulate(&optimizer, 2.0).unwrap();
        online.accumulate(&optimizer, -1.0).unwrap();

        let small: Vec<f32> = online.small_omega(id).unwrap().to_vec1().unwrap();
        let div: Vec<f32> = online.small_omega_div(id).unwrap().to_vec1().unwrap();
        assert!(small.iter().all(|v| (v + 0.1).abs() < 1e-5));
        assert!(div.iter().all(|v| (v - 0.3).abs() < 1e-5));

        // Value head has no accumulator
        assert!(online.small_omega(ParamId::Value(HeadParam::Bias)).is_none());
    }

    #[test]
    fn test_zero_performance_change_is_ignored() {
        let config = AgentConfig::test();
        let params = ParameterSet::new(&config, &Device::Cpu).unwrap();
        let mut online = OnlineImportance::new(&config, &params).unwrap();
        let mut optimizer = AdamAdapter::with_params(0.1, 0.9, 0.999, 1e-8);

        let id = ParamId::Policy(HeadParam::Bias);
        let loss = params.get(id).unwrap().as_tensor().sum_all().unwrap();
        optimizer.apply(&loss, &params).unwrap();
        online.accumulate(&optimizer, 0.0).unwrap();

        let div: Vec<f32> = online.small_omega_div(id).unwrap().to_vec1().unwrap();
        assert!(div.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_discard_pending_leaves_importance_untouched() {
        let config = AgentConfig::test();
        let params = ParameterSet::new(&config, &Device::Cpu).unwrap();
        let mut online = OnlineImportance::new(&config, &params).unwrap();
        let mut optimizer = AdamAdapter::with_params(0.1, 0.9, 0.999, 1e-8);

        let id = ParamId::Policy(HeadParam::Bias);
        let loss = params.get(id).unwrap().as_tensor().sum_all().unwrap();
        optimizer.apply(&loss, &params).unwrap();
        online.accumulate(&optimizer, 1.0).unwrap();
        online.discard_pending().unwrap();

        for (id, record) in online.records().iter() {
            let small: Vec<f32> = online
                .small_omega(id)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            let div: Vec<f32> = online
                .small_omega_div(id)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            assert!(small.iter().chain(&div).all(|v| *v == 0.0), "{id}");
            let importance = record.importance.abs().unwrap().sum_all().unwrap();
            assert_eq!(importance.to_scalar::<f32>().unwrap(), 0.0, "{id}");
        }
    }
}
