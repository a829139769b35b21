//! Predictive-coding LSTM cell.
//!
//! Each cell predicts its own bottom-up input from its previous hidden state
//! and is driven only by the rectified mismatch between prediction and input.
//! Everything it does not predict propagates, everything it does predict is
//! suppressed.

use candle_core::{DType, Device, Tensor};

use crate::error::{PredictiveError, PredictiveResult};
use crate::params::{CellParam, ParamId, ParameterSet};

/// Logistic sigmoid built from differentiable primitives.
pub(crate) fn sigmoid(x: &Tensor) -> candle_core::Result<Tensor> {
    (x.neg()?.exp()? + 1.0)?.recip()
}

/// Recurrent state of one cell.
#[derive(Debug, Clone)]
pub struct CellState {
    /// Hidden state `[batch, hidden]`
    pub h: Tensor,
    /// Memory cell `[batch, hidden]`
    pub c: Tensor,
}

impl CellState {
    /// All-zero state, used at the start of every rollout.
    pub fn zeros(batch: usize, hidden: usize, device: &Device) -> PredictiveResult<Self> {
        Ok(Self {
            h: Tensor::zeros((batch, hidden), DType::F32, device)?,
            c: Tensor::zeros((batch, hidden), DType::F32, device)?,
        })
    }
}

/// Rectified prediction error split by sign. Both halves are elementwise >= 0.
#[derive(Debug, Clone)]
pub struct ErrorSignal {
    /// Input exceeding the prediction, `relu(x - prediction)`
    pub positive: Tensor,
    /// Prediction exceeding the input, `relu(prediction - x)`
    pub negative: Tensor,
}

/// Result of one cell step.
#[derive(Debug, Clone)]
pub struct CellOutput {
    /// New recurrent state
    pub state: CellState,
    /// Prediction error on this step's input
    pub error: ErrorSignal,
    /// The prediction the error was measured against
    pub prediction: Tensor,
}

/// Gate parameters (input matrix, recurrent matrix, bias).
#[derive(Debug, Clone)]
struct Gate {
    w: Tensor,
    u: Tensor,
    b: Tensor,
}

impl Gate {
    fn pre_activation(&self, input: &Tensor, h: &Tensor) -> PredictiveResult<Tensor> {
        Ok((input.matmul(&self.w)? + h.matmul(&self.u)?)?.broadcast_add(&self.b)?)
    }
}

/// One layer of the predictive stack.
///
/// Gate equations, with `e = [relu(x - p), relu(p - x), y]` and
/// `p = h_prev·W_pred + b_pred`:
/// - f = σ(e·Wf + h·Uf + bf)  [forget gate]
/// - i = σ(e·Wi + h·Ui + bi)  [input gate]
/// - o = σ(e·Wo + h·Uo + bo)  [output gate]
/// - c̃ = tanh(e·Wc + h·Uc + bc)  [candidate]
/// - c = f⊙c_prev + i⊙c̃, h = o⊙tanh(c)
///
/// The cell holds handles to the shared parameter storage, so optimizer
/// updates are visible without rebuilding it.
#[derive(Debug, Clone)]
pub struct PredictiveCell {
    layer: usize,
    input_width: usize,
    hidden: usize,
    top_down: Option<usize>,
    forget: Gate,
    input_gate: Gate,
    output: Gate,
    candidate: Gate,
    w_pred: Tensor,
    b_pred: Tensor,
}

impl PredictiveCell {
    /// Bind the cell for `layer` to its parameters.
    ///
    /// `top_down` is the width of the layer above, `None` for the top layer.
    /// Every parameter shape is checked against the widths here so that
    /// `forward` never sees a mismatch.
    pub fn new(
        layer: usize,
        params: &ParameterSet,
        input_width: usize,
        hidden: usize,
        top_down: Option<usize>,
    ) -> PredictiveResult<Self> {
        let rnn_input = 2 * input_width + top_down.unwrap_or(0);
        let fetch = |kind: CellParam, shape: &[usize]| -> PredictiveResult<Tensor> {
            Ok(params
                .get_shaped(ParamId::cell(layer, kind), shape)?
                .as_tensor()
                .clone())
        };
        let gate = |w: CellParam, u: CellParam, b: CellParam| -> PredictiveResult<Gate> {
            Ok(Gate {
                w: fetch(w, &[rnn_input, hidden])?,
                u: fetch(u, &[hidden, hidden])?,
                b: fetch(b, &[hidden])?,
            })
        };

        Ok(Self {
            layer,
            input_width,
            hidden,
            top_down,
            forget: gate(CellParam::Wf, CellParam::Uf, CellParam::Bf)?,
            input_gate: gate(CellParam::Wi, CellParam::Ui, CellParam::Bi)?,
            output: gate(CellParam::Wo, CellParam::Uo, CellParam::Bo)?,
            candidate: gate(CellParam::Wc, CellParam::Uc, CellParam::Bc)?,
            w_pred: fetch(CellParam::WPred, &[hidden, input_width])?,
            b_pred: fetch(CellParam::BPred, &[input_width])?,
        })
    }

    /// Layer index
    pub fn layer(&self) -> usize {
        self.layer
    }

    /// Hidden width
    pub fn hidden(&self) -> usize {
        self.hidden
    }

    /// Bottom-up input width
    pub fn input_width(&self) -> usize {
        self.input_width
    }

    /// One step: predict `x` from `prev.h`, measure the error, update the state.
    ///
    /// `y` must be given exactly when the cell was built with a top-down width.
    pub fn forward(
        &self,
        x: &Tensor,
        y: Option<&Tensor>,
        prev: &CellState,
    ) -> PredictiveResult<CellOutput> {
        if x.dim(1)? != self.input_width {
            return Err(PredictiveError::shape_mismatch(
                format!("layer {} input", self.layer),
                self.input_width.to_string(),
                x.dim(1)?.to_string(),
            ));
        }

        let prediction = prev.h.matmul(&self.w_pred)?.broadcast_add(&self.b_pred)?;
        let positive = (x - &prediction)?.relu()?;
        let negative = (&prediction - x)?.relu()?;

        let rnn_input = match (y, self.top_down) {
            (Some(y), Some(_)) => Tensor::cat(&[&positive, &negative, y], 1)?,
            (None, None) => Tensor::cat(&[&positive, &negative], 1)?,
            (Some(_), None) => {
                return Err(PredictiveError::shape_mismatch(
                    format!("layer {} top-down input", self.layer),
                    "none",
                    "a tensor",
                ))
            }
            (None, Some(width)) => {
                return Err(PredictiveError::shape_mismatch(
                    format!("layer {} top-down input", self.layer),
                    width.to_string(),
                    "none",
                ))
            }
        };

        let f = sigmoid(&self.forget.pre_activation(&rnn_input, &prev.h)?)?;
        let i = sigmoid(&self.input_gate.pre_activation(&rnn_input, &prev.h)?)?;
        let o = sigmoid(&self.output.pre_activation(&rnn_input, &prev.h)?)?;
        let c_tilde = self.candidate.pre_activation(&rnn_input, &prev.h)?.tanh()?;

        let c = ((f * &prev.c)? + (i * c_tilde)?)?;
        let h = (o * c.tanh()?)?;

        Ok(CellOutput {
            state: CellState { h, c },
            error: ErrorSignal { positive, negative },
            prediction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    fn setup() -> (AgentConfig, ParameterSet) {
        let config = AgentConfig::test();
        let params = ParameterSet::new(&config, &Device::Cpu).unwrap();
        (config, params)
    }

    fn min_value(t: &Tensor) -> f32 {
        t.flatten_all().unwrap().min(0).unwrap().to_scalar().unwrap()
    }

    #[test]
    fn test_sigmoid() {
        let x = Tensor::new(&[-100f32, 0.0, 100.0], &Device::Cpu).unwrap();
        let y: Vec<f32> = sigmoid(&x).unwrap().to_vec1().unwrap();
        assert!(y[0] < 1e-6);
        assert!((y[1] - 0.5).abs() < 1e-6);
        assert!((y[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_forward_shapes_and_error_signs() {
        let (config, params) = setup();
        let width = config.input_width();
        let cell = PredictiveCell::new(0, &params, width, 8, Some(6)).unwrap();

        let x = Tensor::randn(0f32, 1.0, (3, width), &Device::Cpu).unwrap();
        let y = Tensor::randn(0f32, 1.0, (3, 6), &Device::Cpu).unwrap();
        let state = CellState::zeros(3, 8, &Device::Cpu).unwrap();

        let out = cell.forward(&x, Some(&y), &state).unwrap();
        assert_eq!(out.state.h.dims(), &[3, 8]);
        assert_eq!(out.state.c.dims(), &[3, 8]);
        assert_eq!(out.error.positive.dims(), &[3, width]);
        assert!(min_value(&out.error.positive) >= 0.0);
        assert!(min_value(&out.error.negative) >= 0.0);

        // Second step predicts from a non-zero hidden state
        let out2 = cell.forward(&x, Some(&y), &out.state).unwrap();
        assert!(min_value(&out2.error.positive) >= 0.0);
        assert!(min_value(&out2.error.negative) >= 0.0);
    }

    #[test]
    fn test_zero_state_predicts_bias() {
        let (config, params) = setup();
        let width = config.input_width();
        let cell = PredictiveCell::new(1, &params, width, 6, None).unwrap();

        // Zero hidden state and zero b_pred: positive error is the input itself
        let x = Tensor::ones((2, width), DType::F32, &Device::Cpu).unwrap();
        let state = CellState::zeros(2, 6, &Device::Cpu).unwrap();
        let out = cell.forward(&x, None, &state).unwrap();

        let pos: Vec<f32> = out.error.positive.flatten_all().unwrap().to_vec1().unwrap();
        let neg: Vec<f32> = out.error.negative.flatten_all().unwrap().to_vec1().unwrap();
        assert!(pos.iter().all(|v| (*v - 1.0).abs() < 1e-6));
        assert!(neg.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_construction_rejects_wrong_widths() {
        let (config, params) = setup();
        let width = config.input_width();

        let err = PredictiveCell::new(0, &params, width + 1, 8, Some(6)).unwrap_err();
        assert!(matches!(err, PredictiveError::ShapeMismatch { .. }));

        let err = PredictiveCell::new(1, &params, width, 6, Some(6)).unwrap_err();
        assert!(matches!(err, PredictiveError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_forward_rejects_missing_top_down() {
        let (config, params) = setup();
        let width = config.input_width();
        let cell = PredictiveCell::new(0, &params, width, 8, Some(6)).unwrap();
        let x = Tensor::zeros((1, width), DType::F32, &Device::Cpu).unwrap();
        let state = CellState::zeros(1, 8, &Device::Cpu).unwrap();
        assert!(cell.forward(&x, None, &state).is_err());
    }
}
