//! Reference stacked autoencoder built from dense layers.
//!
//! Stage `k` owns a tanh encoder `(W_k, b_k)` and a linear decoder `(V_k, c_k)`
//! and learns to reconstruct the code produced by stages `1..k`, which stay
//! frozen while it trains. The auxiliary distance is the mean per-example L2
//! distance between the input and its reconstruction through every stage up to
//! `k`.

use crate::data::Batch;
use crate::model::{Evaluation, LayerVisual, ModelError, ModelResult, StageModel, Tensor};
use crate::stage::StageIndex;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Ix1, Ix2, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const ENCODER_WEIGHTS: usize = 0;
const ENCODER_BIAS: usize = 1;
const DECODER_WEIGHTS: usize = 2;
const DECODER_BIAS: usize = 3;

#[derive(Debug, Clone)]
pub struct DenseStackedAutoencoder {
    input_dim: usize,
    hidden_sizes: Vec<usize>,
    /// `[W, b, V, c]` per stage.
    stages: Vec<Vec<Tensor>>,
}

impl DenseStackedAutoencoder {
    /// Builds the model with zeroed parameters; call `initialize` before training.
    #[must_use]
    pub fn new(input_dim: usize, hidden_sizes: &[usize]) -> Self {
        let mut fan_in = input_dim;
        let stages = hidden_sizes
            .iter()
            .map(|&hidden| {
                let stage = vec![
                    Tensor::zeros(IxDyn(&[fan_in, hidden])),
                    Tensor::zeros(IxDyn(&[hidden])),
                    Tensor::zeros(IxDyn(&[hidden, fan_in])),
                    Tensor::zeros(IxDyn(&[fan_in])),
                ];
                fan_in = hidden;
                stage
            })
            .collect();

        Self { input_dim, hidden_sizes: hidden_sizes.to_vec(), stages }
    }

    #[must_use]
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn param(&self, stage: usize, slot: usize) -> &Tensor {
        &self.stages[stage][slot]
    }

    fn encode(&self, stage: usize, input: &ArrayView2<'_, f32>) -> ModelResult<Array2<f32>> {
        let w = matrix(self.param(stage, ENCODER_WEIGHTS))?;
        let b = vector(self.param(stage, ENCODER_BIAS))?;
        Ok((input.dot(&w) + &b).mapv(f32::tanh))
    }

    fn decode(&self, stage: usize, code: &ArrayView2<'_, f32>) -> ModelResult<Array2<f32>> {
        let v = matrix(self.param(stage, DECODER_WEIGHTS))?;
        let c = vector(self.param(stage, DECODER_BIAS))?;
        Ok(code.dot(&v) + &c)
    }

    /// Output of the frozen stages below `stage` (0-based), i.e. the input the
    /// stage learns to reconstruct.
    fn stage_input(&self, stage: usize, batch: &Batch) -> ModelResult<Array2<f32>> {
        if batch.inputs.ncols() != self.input_dim {
            return Err(ModelError(format!(
                "batch has {} features, model expects {}",
                batch.inputs.ncols(),
                self.input_dim
            )));
        }

        let mut x = batch.inputs.clone();
        for below in 0..stage {
            x = self.encode(below, &x.view())?;
        }
        Ok(x)
    }

    /// Decode `code` from `stage` (0-based) all the way back to input space.
    fn reconstruct(&self, stage: usize, code: &ArrayView2<'_, f32>) -> ModelResult<Array2<f32>> {
        let mut y = self.decode(stage, code)?;
        for below in (0..stage).rev() {
            y = self.decode(below, &y.view())?;
        }
        Ok(y)
    }

    fn checked_stage(&self, stage: StageIndex) -> ModelResult<usize> {
        let idx = stage.zero_based();
        if idx >= self.stages.len() {
            return Err(ModelError(format!("stage {stage} out of range (model has {})", self.stages.len())));
        }
        Ok(idx)
    }
}

impl StageModel for DenseStackedAutoencoder {
    fn stage_count(&self) -> usize {
        self.stages.len()
    }

    fn initialize(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut fan_in = self.input_dim;

        for (stage, &hidden) in self.stages.iter_mut().zip(&self.hidden_sizes) {
            let limit = (6.0 / (fan_in + hidden) as f32).sqrt();
            stage[ENCODER_WEIGHTS] = Tensor::from_shape_fn(IxDyn(&[fan_in, hidden]), |_| rng.gen_range(-limit..=limit));
            stage[ENCODER_BIAS] = Tensor::zeros(IxDyn(&[hidden]));
            stage[DECODER_WEIGHTS] = Tensor::from_shape_fn(IxDyn(&[hidden, fan_in]), |_| rng.gen_range(-limit..=limit));
            stage[DECODER_BIAS] = Tensor::zeros(IxDyn(&[fan_in]));
            fan_in = hidden;
        }
    }

    fn evaluate(&self, stage: StageIndex, batch: &Batch) -> ModelResult<Evaluation> {
        let idx = self.checked_stage(stage)?;
        if batch.is_empty() {
            return Err(ModelError("empty batch".to_string()));
        }

        let x = self.stage_input(idx, batch)?;
        let h = self.encode(idx, &x.view())?;
        let r = self.decode(idx, &h.view())?;

        let diff = &r - &x;
        let count = diff.len() as f32;
        let objective = diff.mapv(|d| d * d).sum() / count;

        // Backward pass through the active stage only.
        let d_r = diff.mapv(|d| 2.0 * d / count);
        let v = matrix(self.param(idx, DECODER_WEIGHTS))?;
        let d_v = h.t().dot(&d_r);
        let d_c = d_r.sum_axis(Axis(0));
        let d_h = d_r.dot(&v.t());
        let d_z = d_h * h.mapv(|a| 1.0 - a * a);
        let d_w = x.t().dot(&d_z);
        let d_b = d_z.sum_axis(Axis(0));

        let full = self.reconstruct(idx, &h.view())?;
        let distance = mean_l2_distance(&full.view(), &batch.inputs.view());

        Ok(Evaluation {
            objective,
            distance,
            gradients: vec![d_w.into_dyn(), d_b.into_dyn(), d_v.into_dyn(), d_c.into_dyn()],
        })
    }

    fn parameters(&self, stage: StageIndex) -> &[Tensor] {
        &self.stages[stage.zero_based()]
    }

    fn parameters_mut(&mut self, stage: StageIndex) -> &mut [Tensor] {
        &mut self.stages[stage.zero_based()]
    }

    fn visualize(&self, stage: StageIndex, batch: &Batch) -> ModelResult<Vec<LayerVisual>> {
        let idx = self.checked_stage(stage)?;
        let x = self.stage_input(idx, batch)?;
        let h = self.encode(idx, &x.view())?;
        let full = self.reconstruct(idx, &h.view())?;

        Ok(vec![
            LayerVisual { name: format!("encode_{stage}"), values: h.into_dyn() },
            LayerVisual { name: "reconstruction".to_string(), values: full.into_dyn() },
        ])
    }
}

fn matrix(t: &Tensor) -> ModelResult<ArrayView2<'_, f32>> {
    t.view().into_dimensionality::<Ix2>().map_err(|e| ModelError(format!("expected a matrix: {e}")))
}

fn vector(t: &Tensor) -> ModelResult<ArrayView1<'_, f32>> {
    t.view().into_dimensionality::<Ix1>().map_err(|e| ModelError(format!("expected a vector: {e}")))
}

/// Mean per-row L2 distance.
fn mean_l2_distance(a: &ArrayView2<'_, f32>, b: &ArrayView2<'_, f32>) -> f32 {
    let diff = a - b;
    let norms: Array1<f32> = diff.map_axis(Axis(1), |row| row.dot(&row).sqrt());
    norms.mean().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn batch(rows: usize, dim: usize) -> Batch {
        let inputs = Array2::from_shape_fn((rows, dim), |(i, j)| ((i * dim + j) as f32 * 0.37).sin());
        Batch { inputs, rotation_angles: vec![0.0; rows] }
    }

    fn model() -> DenseStackedAutoencoder {
        let mut model = DenseStackedAutoencoder::new(6, &[4, 3]);
        model.initialize(11);
        model
    }

    #[test]
    fn test_parameter_shapes_chain_through_stages() {
        let model = model();
        let second = model.parameters(StageIndex::new(2).unwrap());
        assert_eq!(second[ENCODER_WEIGHTS].shape(), &[4, 3]);
        assert_eq!(second[DECODER_WEIGHTS].shape(), &[3, 4]);
        assert_eq!(second[DECODER_BIAS].shape(), &[4]);
    }

    #[test]
    fn test_gradients_match_parameter_shapes() {
        let model = model();
        let stage = StageIndex::new(2).unwrap();
        let eval = model.evaluate(stage, &batch(5, 6)).unwrap();

        for (grad, param) in eval.gradients.iter().zip(model.parameters(stage)) {
            assert_eq!(grad.shape(), param.shape());
        }
        assert!(eval.non_finite().is_none());
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let mut model = model();
        let stage = StageIndex::FIRST;
        let input = batch(4, 6);
        let eval = model.evaluate(stage, &input).unwrap();

        let eps = 1e-3;
        let at = IxDyn(&[2, 1]);
        let analytic = eval.gradients[ENCODER_WEIGHTS][at.clone()];

        model.parameters_mut(stage)[ENCODER_WEIGHTS][at.clone()] += eps;
        let plus = model.evaluate(stage, &input).unwrap().objective;
        model.parameters_mut(stage)[ENCODER_WEIGHTS][at.clone()] -= 2.0 * eps;
        let minus = model.evaluate(stage, &input).unwrap().objective;

        assert_relative_eq!(analytic, (plus - minus) / (2.0 * eps), epsilon = 1e-3);
    }

    #[test]
    fn test_rejects_wrong_input_width() {
        let model = model();
        assert!(model.evaluate(StageIndex::FIRST, &batch(2, 5)).is_err());
    }

    #[test]
    fn test_visualize_returns_encoded_and_reconstruction() {
        let model = model();
        let visuals = model.visualize(StageIndex::new(2).unwrap(), &batch(3, 6)).unwrap();

        assert_eq!(visuals[0].name, "encode_2");
        assert_eq!(visuals[0].values.shape(), &[3, 3]);
        assert_eq!(visuals[1].values.shape(), &[3, 6]);
    }
}
