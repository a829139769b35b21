//! Trainable parameters of the predictive stack.
//!
//! Every parameter is a [`Var`] keyed by a stable [`ParamId`]. The map is built
//! once when the model is constructed and never resized, so per-parameter
//! state elsewhere (optimizer moments, stabilization records) can be sized
//! from it up front.
//!
//! Weights are drawn from a sparse gamma initializer: each entry is non-zero
//! with probability `connection_prob` and then gamma distributed. Biases start
//! at zero.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma};
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::{PredictiveError, PredictiveResult};

/// Floor recurrent weights are clamped to after every update.
pub const RECURRENT_FLOOR: f64 = 1e-9;

/// Parameter kinds owned by one predictive cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CellParam {
    /// Input to forget gate
    Wf,
    /// Input to input gate
    Wi,
    /// Input to output gate
    Wo,
    /// Input to candidate state
    Wc,
    /// Hidden to forget gate
    Uf,
    /// Hidden to input gate
    Ui,
    /// Hidden to output gate
    Uo,
    /// Hidden to candidate state
    Uc,
    /// Forget gate bias
    Bf,
    /// Input gate bias
    Bi,
    /// Output gate bias
    Bo,
    /// Candidate bias
    Bc,
    /// Readout predicting the cell's input from its hidden state
    WPred,
    /// Readout bias
    BPred,
}

impl CellParam {
    /// All cell parameter kinds, in construction order.
    pub const ALL: [CellParam; 14] = [
        Self::Wf,
        Self::Wi,
        Self::Wo,
        Self::Wc,
        Self::Uf,
        Self::Ui,
        Self::Uo,
        Self::Uc,
        Self::Bf,
        Self::Bi,
        Self::Bo,
        Self::Bc,
        Self::WPred,
        Self::BPred,
    ];

    fn prefix(self) -> &'static str {
        match self {
            Self::Wf => "Wf",
            Self::Wi => "Wi",
            Self::Wo => "Wo",
            Self::Wc => "Wc",
            Self::Uf => "Uf",
            Self::Ui => "Ui",
            Self::Uo => "Uo",
            Self::Uc => "Uc",
            Self::Bf => "bf",
            Self::Bi => "bi",
            Self::Bo => "bo",
            Self::Bc => "bc",
            Self::WPred => "W_pred",
            Self::BPred => "b_pred",
        }
    }
}

/// Weight or bias of an output head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HeadParam {
    /// Hidden to output matrix
    Weight,
    /// Output bias
    Bias,
}

/// Stable identifier of a trainable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamId {
    /// Parameter of the predictive cell at `layer`
    Cell {
        /// Layer index, 0 is the bottom of the stack
        layer: usize,
        /// Which cell parameter
        kind: CellParam,
    },
    /// Policy head on the top layer
    Policy(HeadParam),
    /// Value head on the top layer
    Value(HeadParam),
}

impl ParamId {
    /// Shorthand for a cell parameter id.
    pub const fn cell(layer: usize, kind: CellParam) -> Self {
        Self::Cell { layer, kind }
    }

    /// Value-head parameters are never consolidated.
    pub const fn is_value_head(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    /// Hidden-to-hidden matrices, kept excitatory by
    /// [`ParameterSet::desaturate_recurrent`].
    pub const fn is_recurrent(&self) -> bool {
        matches!(
            self,
            Self::Cell {
                kind: CellParam::Uf | CellParam::Ui | CellParam::Uo | CellParam::Uc,
                ..
            }
        )
    }

    /// Bias vectors.
    pub const fn is_bias(&self) -> bool {
        matches!(
            self,
            Self::Policy(HeadParam::Bias)
                | Self::Value(HeadParam::Bias)
                | Self::Cell {
                    kind: CellParam::Bf
                        | CellParam::Bi
                        | CellParam::Bo
                        | CellParam::Bc
                        | CellParam::BPred,
                    ..
                }
        )
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cell { layer, kind } => write!(f, "{}{}", kind.prefix(), layer),
            Self::Policy(HeadParam::Weight) => f.write_str("W_pol_out"),
            Self::Policy(HeadParam::Bias) => f.write_str("b_pol_out"),
            Self::Value(HeadParam::Weight) => f.write_str("W_val_out"),
            Self::Value(HeadParam::Bias) => f.write_str("b_val_out"),
        }
    }
}

/// Expected shape of every parameter for a configuration.
pub fn parameter_shapes(config: &AgentConfig) -> BTreeMap<ParamId, Vec<usize>> {
    let mut shapes = BTreeMap::new();
    let input = config.input_width();
    let layers = config.num_layers();

    for (layer, &hidden) in config.layer_widths.iter().enumerate() {
        // Rectified error (both polarities) plus top-down feedback from above
        let top_down = if layer + 1 < layers {
            config.layer_widths[layer + 1]
        } else {
            0
        };
        let rnn_input = 2 * input + top_down;

        for kind in CellParam::ALL {
            let shape = match kind {
                CellParam::Wf | CellParam::Wi | CellParam::Wo | CellParam::Wc => {
                    vec![rnn_input, hidden]
                }
                CellParam::Uf | CellParam::Ui | CellParam::Uo | CellParam::Uc => {
                    vec![hidden, hidden]
                }
                CellParam::Bf | CellParam::Bi | CellParam::Bo | CellParam::Bc => vec![hidden],
                CellParam::WPred => vec![hidden, input],
                CellParam::BPred => vec![input],
            };
            shapes.insert(ParamId::cell(layer, kind), shape);
        }
    }

    let top = config.layer_widths[layers - 1];
    shapes.insert(ParamId::Policy(HeadParam::Weight), vec![top, config.n_actions]);
    shapes.insert(ParamId::Policy(HeadParam::Bias), vec![config.n_actions]);
    shapes.insert(ParamId::Value(HeadParam::Weight), vec![top, 1]);
    shapes.insert(ParamId::Value(HeadParam::Bias), vec![1]);
    shapes
}

/// Sparse gamma initializer for weight matrices.
#[derive(Debug)]
pub struct SparseInitializer {
    connection_prob: f64,
    gamma: Gamma<f64>,
    rng: StdRng,
}

impl SparseInitializer {
    /// Create an initializer from the agent configuration.
    pub fn new(config: &AgentConfig) -> PredictiveResult<Self> {
        let gamma = Gamma::new(config.init_gamma_shape, config.init_gamma_scale)
            .map_err(|e| PredictiveError::invalid_config(format!("gamma initializer: {e}")))?;
        Ok(Self {
            connection_prob: config.connection_prob,
            gamma,
            rng: StdRng::seed_from_u64(config.seed),
        })
    }

    /// Draw a weight matrix of the given shape.
    pub fn weight(&mut self, shape: &[usize], device: &Device) -> PredictiveResult<Tensor> {
        let numel: usize = shape.iter().product();
        let values: Vec<f32> = (0..numel)
            .map(|_| {
                let w = self.gamma.sample(&mut self.rng);
                if self.rng.gen::<f64>() < self.connection_prob {
                    w as f32
                } else {
                    0.0
                }
            })
            .collect();
        Ok(Tensor::from_vec(values, shape, device)?)
    }
}

/// The model's trainable parameters.
pub struct ParameterSet {
    vars: BTreeMap<ParamId, Var>,
    initializer: SparseInitializer,
    device: Device,
}

impl ParameterSet {
    /// Create all parameters for `config`.
    pub fn new(config: &AgentConfig, device: &Device) -> PredictiveResult<Self> {
        let mut initializer = SparseInitializer::new(config)?;
        let mut vars = BTreeMap::new();

        for (id, shape) in parameter_shapes(config) {
            let init = if id.is_bias() {
                Tensor::zeros(shape.as_slice(), DType::F32, device)?
            } else {
                initializer.weight(&shape, device)?
            };
            vars.insert(id, Var::from_tensor(&init)?);
        }

        debug!(
            parameters = vars.len(),
            elements = vars.values().map(|v| v.elem_count()).sum::<usize>(),
            "created parameter set"
        );

        Ok(Self {
            vars,
            initializer,
            device: device.clone(),
        })
    }

    /// Look up a parameter.
    pub fn get(&self, id: ParamId) -> PredictiveResult<&Var> {
        self.vars
            .get(&id)
            .ok_or_else(|| PredictiveError::shape_mismatch(id.to_string(), "a parameter", "none"))
    }

    /// Look up a parameter and check its shape.
    pub fn get_shaped(&self, id: ParamId, shape: &[usize]) -> PredictiveResult<&Var> {
        let var = self.get(id)?;
        if var.dims() != shape {
            return Err(PredictiveError::shape_mismatch(
                id.to_string(),
                format!("{shape:?}"),
                format!("{:?}", var.dims()),
            ));
        }
        Ok(var)
    }

    /// Iterate over all parameters in id order.
    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Var)> {
        self.vars.iter().map(|(id, var)| (*id, var))
    }

    /// Iterate over the parameters subject to consolidation.
    pub fn consolidated(&self) -> impl Iterator<Item = (ParamId, &Var)> {
        self.iter().filter(|(id, _)| !id.is_value_head())
    }

    /// Number of parameter tensors.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the set holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Total number of scalar parameters.
    pub fn parameter_count(&self) -> usize {
        self.vars.values().map(|v| v.elem_count()).sum()
    }

    /// Device the parameters live on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Detached copy of a parameter's current value.
    pub fn snapshot(&self, id: ParamId) -> PredictiveResult<Tensor> {
        Ok(self.get(id)?.as_tensor().copy()?.detach())
    }

    /// Redraw every weight from the sparse initializer and zero every bias.
    ///
    /// Used between ablation runs, not during normal training.
    pub fn reinitialize_weights(&mut self) -> PredictiveResult<()> {
        for (id, var) in &self.vars {
            let fresh = if id.is_bias() {
                var.as_tensor().zeros_like()?
            } else {
                self.initializer.weight(var.dims(), &self.device)?
            };
            var.set(&fresh)?;
        }
        debug!("reinitialized all parameters");
        Ok(())
    }

    /// Clamp recurrent weights that drifted to zero or below up to
    /// [`RECURRENT_FLOOR`], keeping recurrence excitatory.
    ///
    /// Returns the shift the clamp applied to each recurrent parameter.
    pub fn desaturate_recurrent(&self) -> PredictiveResult<BTreeMap<ParamId, Tensor>> {
        let mut shifts = BTreeMap::new();
        for (id, var) in self.iter().filter(|(id, _)| id.is_recurrent()) {
            let before = var.as_tensor().detach();
            let clamped = before.maximum(RECURRENT_FLOOR)?;
            shifts.insert(id, (&clamped - &before)?);
            var.set(&clamped)?;
        }
        Ok(shifts)
    }

    /// Save parameters in safetensors format, named as in [`ParamId`]'s `Display`.
    pub fn save(&self, path: &Path) -> PredictiveResult<()> {
        let tensors: HashMap<String, Tensor> = self
            .iter()
            .map(|(id, var)| (id.to_string(), var.as_tensor().clone()))
            .collect();
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Load parameter values saved by [`ParameterSet::save`].
    ///
    /// Every parameter must be present with a matching shape.
    pub fn load(&self, path: &Path) -> PredictiveResult<()> {
        let tensors = candle_core::safetensors::load(path, &self.device)?;
        for (id, var) in self.iter() {
            let name = id.to_string();
            let value = tensors.get(&name).ok_or_else(|| {
                PredictiveError::shape_mismatch(&name, format!("{:?}", var.dims()), "missing")
            })?;
            if value.dims() != var.dims() {
                return Err(PredictiveError::shape_mismatch(
                    name,
                    format!("{:?}", var.dims()),
                    format!("{:?}", value.dims()),
                ));
            }
            var.set(value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params() -> ParameterSet {
        ParameterSet::new(&AgentConfig::test(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_parameter_shapes() {
        let config = AgentConfig::test();
        let shapes = parameter_shapes(&config);
        let input = config.input_width();

        // Bottom layer receives top-down feedback from the 6-wide layer above
        assert_eq!(shapes[&ParamId::cell(0, CellParam::Wf)], vec![2 * input + 6, 8]);
        assert_eq!(shapes[&ParamId::cell(1, CellParam::Wf)], vec![2 * input, 6]);
        assert_eq!(shapes[&ParamId::cell(0, CellParam::Uc)], vec![8, 8]);
        assert_eq!(shapes[&ParamId::cell(1, CellParam::WPred)], vec![6, input]);
        assert_eq!(shapes[&ParamId::Policy(HeadParam::Weight)], vec![6, 4]);
        assert_eq!(shapes[&ParamId::Value(HeadParam::Weight)], vec![6, 1]);
        assert_eq!(shapes.len(), 2 * CellParam::ALL.len() + 4);
    }

    #[test]
    fn test_predicates() {
        assert!(ParamId::Value(HeadParam::Weight).is_value_head());
        assert!(!ParamId::Policy(HeadParam::Weight).is_value_head());
        assert!(ParamId::cell(0, CellParam::Uo).is_recurrent());
        assert!(!ParamId::cell(0, CellParam::Wo).is_recurrent());
        assert!(ParamId::cell(1, CellParam::BPred).is_bias());
        assert!(!ParamId::cell(1, CellParam::WPred).is_bias());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(ParamId::cell(2, CellParam::WPred).to_string(), "W_pred2");
        assert_eq!(ParamId::cell(0, CellParam::Bf).to_string(), "bf0");
        assert_eq!(ParamId::Value(HeadParam::Bias).to_string(), "b_val_out");
    }

    #[test]
    fn test_biases_start_at_zero() {
        let params = test_params();
        for (id, var) in params.iter().filter(|(id, _)| id.is_bias()) {
            let sum: f32 = var
                .as_tensor()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar()
                .unwrap();
            assert_eq!(sum, 0.0, "{id} should start at zero");
        }
    }

    #[test]
    fn test_consolidated_excludes_value_head() {
        let params = test_params();
        assert!(params.consolidated().all(|(id, _)| !id.is_value_head()));
        assert_eq!(params.consolidated().count(), params.len() - 2);
    }

    #[test]
    fn test_sparse_initializer_respects_connection_prob() {
        let config = AgentConfig {
            connection_prob: 0.25,
            ..AgentConfig::test()
        };
        let mut init = SparseInitializer::new(&config).unwrap();
        let w = init.weight(&[100, 100], &Device::Cpu).unwrap();
        let values: Vec<f32> = w.flatten_all().unwrap().to_vec1().unwrap();

        let nonzero = values.iter().filter(|v| **v != 0.0).count() as f64 / values.len() as f64;
        assert!((nonzero - 0.25).abs() < 0.05, "density was {nonzero}");
        assert!(values.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_desaturate_recurrent() {
        let params = test_params();
        let id = ParamId::cell(0, CellParam::Ui);
        let var = params.get(id).unwrap();
        var.set(&var.as_tensor().affine(-1.0, -0.5).unwrap()).unwrap();

        // Non-recurrent weights are left alone
        let other = params.get(ParamId::cell(0, CellParam::Wi)).unwrap();
        other.set(&other.as_tensor().affine(0.0, -0.5).unwrap()).unwrap();

        let shifts = params.desaturate_recurrent().unwrap();
        assert!(shifts.keys().all(|id| id.is_recurrent()));
        let shift: Vec<f32> = shifts[&id].flatten_all().unwrap().to_vec1().unwrap();
        assert!(shift.iter().all(|s| *s >= 0.5));

        let min: f32 = var
            .as_tensor()
            .flatten_all()
            .unwrap()
            .min(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(min >= RECURRENT_FLOOR as f32);

        let other_vals: Vec<f32> = other.as_tensor().flatten_all().unwrap().to_vec1().unwrap();
        assert!(other_vals.iter().all(|v| (*v + 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_reinitialize_weights() {
        let mut params = test_params();
        let bias = ParamId::cell(0, CellParam::Bf);
        let weight = ParamId::cell(0, CellParam::Wf);

        let b = params.get(bias).unwrap();
        b.set(&b.as_tensor().affine(0.0, 3.0).unwrap()).unwrap();
        let before = params.snapshot(weight).unwrap();

        params.reinitialize_weights().unwrap();

        let b_vals: Vec<f32> = params.get(bias).unwrap().as_tensor().to_vec1().unwrap();
        assert!(b_vals.iter().all(|v| *v == 0.0));

        let after = params.snapshot(weight).unwrap();
        let diff: f32 = (after - before)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff > 0.0, "weights should be redrawn");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.safetensors");

        let params = test_params();
        params.save(&path).unwrap();

        let id = ParamId::Policy(HeadParam::Weight);
        let original = params.snapshot(id).unwrap();
        let var = params.get(id).unwrap();
        var.set(&var.as_tensor().zeros_like().unwrap()).unwrap();

        params.load(&path).unwrap();
        let restored = params.snapshot(id).unwrap();
        let diff: f32 = (restored - original)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_get_shaped_rejects_mismatch() {
        let params = test_params();
        let err = params
            .get_shaped(ParamId::Value(HeadParam::Weight), &[7, 1])
            .unwrap_err();
        assert!(matches!(err, PredictiveError::ShapeMismatch { .. }));
    }
}
