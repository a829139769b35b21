//! Adam optimizer adapter.
//!
//! Consolidation needs to see exactly what each step did to every parameter,
//! so the adapter keeps its own moment estimates keyed by [`ParamId`] and
//! records the applied delta of the most recent step.

use std::collections::{BTreeMap, HashMap};

use candle_core::Tensor;

use crate::config::AgentConfig;
use crate::error::{PredictiveError, PredictiveResult};
use crate::params::{ParamId, ParameterSet};

/// Summary of one optimizer step.
#[derive(Debug, Clone, Copy)]
pub struct StepInfo {
    /// Loss value the step descended
    pub loss: f32,
    /// L2 norm over all parameter gradients
    pub gradient_norm: f32,
}

/// Backpropagate `loss` and collect the gradient of every parameter.
///
/// Parameters the loss does not depend on are absent from the result.
pub fn collect_gradients(
    loss: &Tensor,
    params: &ParameterSet,
) -> PredictiveResult<BTreeMap<ParamId, Tensor>> {
    let grads = loss.backward()?;
    let mut out = BTreeMap::new();
    for (id, var) in params.iter() {
        if let Some(grad) = grads.get(var.as_tensor()) {
            out.insert(id, grad.clone());
        }
    }
    Ok(out)
}

/// Adam over a [`ParameterSet`], exposing per-parameter deltas.
pub struct AdamAdapter {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    /// First moment estimates
    m: HashMap<ParamId, Tensor>,
    /// Second moment estimates
    v: HashMap<ParamId, Tensor>,
    /// Delta applied to each parameter by the last step
    last_delta: HashMap<ParamId, Tensor>,
    /// Step counter for bias correction
    t: usize,
}

impl AdamAdapter {
    /// Create an optimizer with the agent's Adam settings.
    pub fn new(config: &AgentConfig) -> Self {
        Self::with_params(
            config.learning_rate,
            config.beta1,
            config.beta2,
            config.adam_eps,
        )
    }

    /// Create an optimizer with custom hyperparameters
    pub fn with_params(lr: f32, beta1: f32, beta2: f32, eps: f32) -> Self {
        Self {
            learning_rate: lr,
            beta1,
            beta2,
            eps,
            m: HashMap::new(),
            v: HashMap::new(),
            last_delta: HashMap::new(),
            t: 0,
        }
    }

    /// Backpropagate `loss` and take one Adam step over all parameters.
    ///
    /// Parameters that received no gradient are left untouched and record a
    /// zero delta.
    pub fn apply(&mut self, loss: &Tensor, params: &ParameterSet) -> PredictiveResult<StepInfo> {
        let loss_value = loss.to_scalar::<f32>().map_err(|e| {
            PredictiveError::training(format!("loss must be a scalar tensor: {e}"))
        })?;
        if !loss_value.is_finite() {
            return Err(PredictiveError::training(format!(
                "non-finite loss {loss_value} at step {}",
                self.t + 1
            )));
        }

        let grads = collect_gradients(loss, params)?;

        // Gradients are checked before any parameter moves
        let mut gradient_norm_sq = 0.0f32;
        for (id, grad) in &grads {
            let sq = grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
            if !sq.is_finite() {
                return Err(PredictiveError::training(format!(
                    "non-finite gradient for {id} at step {}",
                    self.t + 1
                )));
            }
            gradient_norm_sq += sq;
        }
        self.t += 1;

        // Bias correction factors
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        for (id, var) in params.iter() {
            let Some(grad) = grads.get(&id) else {
                self.last_delta.insert(id, var.as_tensor().zeros_like()?);
                continue;
            };
            let grad = grad.detach();

            let m_new = match self.m.get(&id) {
                Some(m) => (m.affine(self.beta1 as f64, 0.0)?
                    + grad.affine((1.0 - self.beta1) as f64, 0.0)?)?,
                None => grad.affine((1.0 - self.beta1) as f64, 0.0)?,
            };
            let grad_sq = grad.sqr()?;
            let v_new = match self.v.get(&id) {
                Some(v) => (v.affine(self.beta2 as f64, 0.0)?
                    + grad_sq.affine((1.0 - self.beta2) as f64, 0.0)?)?,
                None => grad_sq.affine((1.0 - self.beta2) as f64, 0.0)?,
            };

            // delta = -lr * m_hat / (sqrt(v_hat) + eps)
            let m_hat = m_new.affine(1.0 / bc1 as f64, 0.0)?;
            let denom = (v_new.affine(1.0 / bc2 as f64, 0.0)?.sqrt()? + self.eps as f64)?;
            let delta = (m_hat / denom)?
                .affine(-(self.learning_rate as f64), 0.0)?
                .detach();
            var.set(&(var.as_tensor() + &delta)?)?;

            self.m.insert(id, m_new.detach());
            self.v.insert(id, v_new.detach());
            self.last_delta.insert(id, delta);
        }

        Ok(StepInfo {
            loss: loss_value,
            gradient_norm: gradient_norm_sq.sqrt(),
        })
    }

    /// Delta applied to `id` by the most recent step.
    pub fn last_delta(&self, id: ParamId) -> Option<&Tensor> {
        self.last_delta.get(&id)
    }

    /// Fold shifts applied to parameters after the last step into their
    /// recorded deltas, so [`AdamAdapter::last_delta`] matches the move the
    /// parameters actually made.
    pub fn absorb_shifts(&mut self, shifts: &BTreeMap<ParamId, Tensor>) -> PredictiveResult<()> {
        for (id, shift) in shifts {
            let delta = match self.last_delta.remove(id) {
                Some(delta) => (delta + shift)?.detach(),
                None => shift.detach(),
            };
            self.last_delta.insert(*id, delta);
        }
        Ok(())
    }

    /// Zero both moment estimates and the step counter.
    pub fn reset_moments(&mut self) {
        self.m.clear();
        self.v.clear();
        self.t = 0;
    }

    /// Number of steps since construction or the last moment reset.
    pub fn step_count(&self) -> usize {
        self.t
    }

    /// Current learning rate
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Change the learning rate
    pub fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{CellParam, HeadParam, RECURRENT_FLOOR};
    use candle_core::Device;

    fn setup() -> (ParameterSet, AdamAdapter) {
        let config = AgentConfig::test();
        let params = ParameterSet::new(&config, &Device::Cpu).unwrap();
        let optimizer = AdamAdapter::with_params(0.01, 0.9, 0.999, 1e-8);
        (params, optimizer)
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let (params, mut optimizer) = setup();
        let id = ParamId::Policy(HeadParam::Bias);
        let before = values(&params.snapshot(id).unwrap());

        // d(sum b)/db = 1 everywhere, so the first Adam step is -lr
        let loss = params.get(id).unwrap().as_tensor().sum_all().unwrap();
        let info = optimizer.apply(&loss, &params).unwrap();
        assert!((info.gradient_norm - 2.0).abs() < 1e-5);

        let after = values(&params.snapshot(id).unwrap());
        for (a, b) in after.iter().zip(&before) {
            assert!((a - b + 0.01).abs() < 1e-5);
        }
        let delta = values(optimizer.last_delta(id).unwrap());
        assert!(delta.iter().all(|d| (d + 0.01).abs() < 1e-5));
    }

    #[test]
    fn test_untouched_parameters_record_zero_delta() {
        let (params, mut optimizer) = setup();
        let loss = params
            .get(ParamId::Policy(HeadParam::Bias))
            .unwrap()
            .as_tensor()
            .sum_all()
            .unwrap();
        optimizer.apply(&loss, &params).unwrap();

        let other = ParamId::cell(0, CellParam::Wf);
        let delta = values(optimizer.last_delta(other).unwrap());
        assert!(delta.iter().all(|d| *d == 0.0));
    }

    #[test]
    fn test_reset_moments() {
        let (params, mut optimizer) = setup();
        let id = ParamId::Value(HeadParam::Bias);
        for _ in 0..3 {
            let loss = params.get(id).unwrap().as_tensor().sum_all().unwrap();
            optimizer.apply(&loss, &params).unwrap();
        }
        assert_eq!(optimizer.step_count(), 3);

        optimizer.reset_moments();
        assert_eq!(optimizer.step_count(), 0);

        // After the reset the step is bias corrected from scratch again
        let loss = params
            .get(id)
            .unwrap()
            .as_tensor()
            .affine(-1.0, 0.0)
            .unwrap()
            .sum_all()
            .unwrap();
        optimizer.apply(&loss, &params).unwrap();
        let delta = values(optimizer.last_delta(id).unwrap());
        assert!((delta[0] - 0.01).abs() < 1e-5);
    }

    #[test]
    fn test_non_finite_gradient_is_rejected() {
        let (params, mut optimizer) = setup();
        let id = ParamId::Policy(HeadParam::Bias);
        let before = values(&params.snapshot(id).unwrap());

        // sqrt(b - b) is zero but its gradient is not finite
        let b = params.get(id).unwrap().as_tensor();
        let loss = (b - b).unwrap().sqrt().unwrap().sum_all().unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);

        assert!(optimizer.apply(&loss, &params).is_err());
        assert_eq!(optimizer.step_count(), 0);
        assert_eq!(values(&params.snapshot(id).unwrap()), before);
        assert!(optimizer.last_delta(id).is_none());
    }

    #[test]
    fn test_stored_state_is_detached() {
        let (params, mut optimizer) = setup();
        let id = ParamId::Value(HeadParam::Weight);
        let loss = params
            .get(id)
            .unwrap()
            .as_tensor()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap();
        optimizer.apply(&loss, &params).unwrap();

        // A loss built from the stored delta reaches no parameter
        let delta = optimizer.last_delta(id).unwrap();
        let from_delta = (delta.sqr().unwrap().sum_all().unwrap()
            + params.get(id).unwrap().as_tensor().affine(0.0, 0.0).unwrap().sum_all().unwrap())
        .unwrap();
        let grads = collect_gradients(&from_delta, &params).unwrap();
        let grad = values(&grads[&id]);
        assert!(grad.iter().all(|g| *g == 0.0));
    }

    #[test]
    fn test_absorb_shifts() {
        let (params, mut optimizer) = setup();
        let id = ParamId::cell(0, CellParam::Ui);
        let var = params.get(id).unwrap();
        var.set(&var.as_tensor().affine(0.0, -0.5).unwrap()).unwrap();
        let before = values(&params.snapshot(id).unwrap());

        let loss = var.as_tensor().sum_all().unwrap();
        optimizer.apply(&loss, &params).unwrap();
        let shifts = params.desaturate_recurrent().unwrap();
        optimizer.absorb_shifts(&shifts).unwrap();

        let after = values(&params.snapshot(id).unwrap());
        let delta = values(optimizer.last_delta(id).unwrap());
        for ((a, b), d) in after.iter().zip(&before).zip(&delta) {
            assert!((a - b - d).abs() < 1e-6);
        }
        assert!(after.iter().all(|v| *v >= RECURRENT_FLOOR as f32));
    }

    #[test]
    fn test_non_scalar_loss_is_rejected() {
        let (params, mut optimizer) = setup();
        let loss = params
            .get(ParamId::Policy(HeadParam::Bias))
            .unwrap()
            .as_tensor()
            .clone();
        assert!(optimizer.apply(&loss, &params).is_err());
        assert_eq!(optimizer.step_count(), 0);
    }

    #[test]
    fn test_collect_gradients() {
        let (params, _) = setup();
        let id = ParamId::Value(HeadParam::Weight);
        let loss = params
            .get(id)
            .unwrap()
            .as_tensor()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap();
        let grads = collect_gradients(&loss, &params).unwrap();
        assert_eq!(grads.len(), 1);

        let expected = values(&params.snapshot(id).unwrap().affine(2.0, 0.0).unwrap());
        let got = values(&grads[&id]);
        for (g, e) in got.iter().zip(&expected) {
            assert!((g - e).abs() < 1e-5);
        }
    }
}
