use ndarray::{Array, Array1, Array2, Axis, Dimension, Zip};
use rand::{rngs::SmallRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::model::ModelError;

/// Hyperparameters of the rating regressor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlpConfig {
    /// Width of each hidden layer.
    pub hidden_dims: Vec<usize>,
    /// Passes over the training set.
    pub epochs: usize,
    /// Adam step size.
    pub learning_rate: f32,
    /// Samples per gradient step.
    pub batch_size: usize,
    /// Seed for initialisation and shuffling.
    pub seed: u64,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            hidden_dims: vec![50, 50, 20],
            epochs: 300,
            learning_rate: 1e-3,
            batch_size: 200,
            seed: 42,
        }
    }
}

/// Fully connected layer, `output = input · weights + bias`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    /// `(inputs, outputs)` weight matrix.
    pub weights: Array2<f32>,
    /// Per-output bias.
    pub bias: Array1<f32>,
}

impl DenseLayer {
    fn he_uniform(inputs: usize, outputs: usize, rng: &mut SmallRng) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let limit = (6.0 / inputs.max(1) as f32).sqrt();
        Self {
            weights: Array2::from_shape_fn((inputs, outputs), |_| rng.gen_range(-limit..limit)),
            bias: Array1::zeros(outputs),
        }
    }

    fn forward(&self, input: &Array2<f32>) -> Array2<f32> {
        let mut output = input.dot(&self.weights);
        output += &self.bias;
        output
    }
}

struct Moments<D: Dimension> {
    first: Array<f32, D>,
    second: Array<f32, D>,
}

impl<D: Dimension> Moments<D> {
    fn like(param: &Array<f32, D>) -> Self {
        Self {
            first: Array::zeros(param.raw_dim()),
            second: Array::zeros(param.raw_dim()),
        }
    }
}

struct LayerMoments {
    weights: Moments<ndarray::Ix2>,
    bias: Moments<ndarray::Ix1>,
}

#[derive(Clone, Copy)]
struct AdamStep {
    learning_rate: f32,
    first_correction: f32,
    second_correction: f32,
}

const BETA1: f32 = 0.9;
const BETA2: f32 = 0.999;
const EPSILON: f32 = 1e-8;

impl AdamStep {
    fn new(learning_rate: f32, step: i32) -> Self {
        Self {
            learning_rate,
            first_correction: 1.0 - BETA1.powi(step),
            second_correction: 1.0 - BETA2.powi(step),
        }
    }

    fn apply<D: Dimension>(
        self,
        param: &mut Array<f32, D>,
        grad: &Array<f32, D>,
        moments: &mut Moments<D>,
    ) {
        Zip::from(param)
            .and(grad)
            .and(&mut moments.first)
            .and(&mut moments.second)
            .for_each(|p, &g, m, v| {
                *m = BETA1.mul_add(*m, (1.0 - BETA1) * g);
                *v = BETA2.mul_add(*v, (1.0 - BETA2) * g * g);
                let m_hat = *m / self.first_correction;
                let v_hat = *v / self.second_correction;
                *p -= self.learning_rate * m_hat / (v_hat.sqrt() + EPSILON);
            });
    }
}

/// Multi-layer perceptron regressor: ReLU hidden layers, linear output,
/// mean-squared-error loss, Adam optimiser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpRegressor {
    config: MlpConfig,
    input_dim: usize,
    layers: Vec<DenseLayer>,
}

impl MlpRegressor {
    /// Creates a seeded, untrained network for `input_dim` features.
    #[must_use]
    pub fn new(config: MlpConfig, input_dim: usize) -> Self {
        let mut rng = SmallRng::seed_from_u64(config.seed);
        let mut dims = Vec::with_capacity(config.hidden_dims.len() + 2);
        dims.push(input_dim);
        dims.extend(config.hidden_dims.iter().copied().filter(|dim| *dim > 0));
        dims.push(1);
        let layers = dims
            .windows(2)
            .map(|pair| DenseLayer::he_uniform(pair[0], pair[1], &mut rng))
            .collect();
        Self {
            config,
            input_dim,
            layers,
        }
    }

    /// Hyperparameters.
    #[must_use]
    pub const fn config(&self) -> &MlpConfig {
        &self.config
    }

    /// Expected feature count.
    #[must_use]
    pub const fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Network layers, input side first.
    #[must_use]
    pub fn layers(&self) -> &[DenseLayer] {
        &self.layers
    }

    /// Trains on `features` / `targets` and returns the mean loss of each epoch.
    ///
    /// The output bias starts at the target mean so early epochs fit the
    /// residual rather than the offset.
    pub fn fit(
        &mut self,
        features: &Array2<f32>,
        targets: &Array1<f32>,
    ) -> Result<Vec<f32>, ModelError> {
        let samples = features.nrows();
        if samples == 0 {
            return Err(ModelError::EmptyTrainingSet);
        }
        self.check_width(features)?;
        if targets.len() != samples {
            return Err(ModelError::LengthMismatch {
                features: samples,
                targets: targets.len(),
            });
        }

        if let (Some(output), Some(mean)) = (self.layers.last_mut(), targets.mean()) {
            output.bias.fill(mean);
        }

        let mut rng = SmallRng::seed_from_u64(self.config.seed.wrapping_add(1));
        let mut moments: Vec<LayerMoments> = self
            .layers
            .iter()
            .map(|layer| LayerMoments {
                weights: Moments::like(&layer.weights),
                bias: Moments::like(&layer.bias),
            })
            .collect();
        let batch_size = self.config.batch_size.clamp(1, samples);
        let mut order: Vec<usize> = (0..samples).collect();
        let mut history = Vec::with_capacity(self.config.epochs);
        let mut step = 0i32;

        for epoch in 0..self.config.epochs {
            order.shuffle(&mut rng);
            let mut weighted_loss = 0.0f32;
            for batch in order.chunks(batch_size) {
                let x = features.select(Axis(0), batch);
                let y = targets.select(Axis(0), batch).insert_axis(Axis(1));
                step = step.saturating_add(1);
                let loss = self.train_batch(&x, &y, &mut moments, step);
                #[allow(clippy::cast_precision_loss)]
                let weight = batch.len() as f32;
                weighted_loss += loss * weight;
            }
            #[allow(clippy::cast_precision_loss)]
            let epoch_loss = weighted_loss / samples as f32;
            if !epoch_loss.is_finite() {
                return Err(ModelError::Diverged { epoch });
            }
            tracing::debug!("epoch {epoch}: loss {epoch_loss:.5}");
            history.push(epoch_loss);
        }
        Ok(history)
    }

    /// Predicts one value per feature row.
    pub fn predict(&self, features: &Array2<f32>) -> Result<Array1<f32>, ModelError> {
        self.check_width(features)?;
        let output = self.forward(features).pop().unwrap_or_else(|| features.clone());
        Ok(output.column(0).to_owned())
    }

    fn check_width(&self, features: &Array2<f32>) -> Result<(), ModelError> {
        if features.ncols() == self.input_dim {
            Ok(())
        } else {
            Err(ModelError::DimensionMismatch {
                expected: self.input_dim,
                found: features.ncols(),
            })
        }
    }

    /// Activations of every layer; the last entry is the network output.
    fn forward(&self, input: &Array2<f32>) -> Vec<Array2<f32>> {
        let mut activations = Vec::with_capacity(self.layers.len());
        let last = self.layers.len().saturating_sub(1);
        for (idx, layer) in self.layers.iter().enumerate() {
            let previous = activations.last().unwrap_or(input);
            let mut output = layer.forward(previous);
            if idx < last {
                output.mapv_inplace(|v| v.max(0.0));
            }
            activations.push(output);
        }
        activations
    }

    fn train_batch(
        &mut self,
        x: &Array2<f32>,
        y: &Array2<f32>,
        moments: &mut [LayerMoments],
        step: i32,
    ) -> f32 {
        let activations = self.forward(x);
        let Some(output) = activations.last() else {
            return 0.0;
        };
        #[allow(clippy::cast_precision_loss)]
        let batch = x.nrows() as f32;
        let error = output - y;
        let loss = error.mapv(|e| e * e).sum() / batch;

        let adam = AdamStep::new(self.config.learning_rate, step);
        let mut delta = error * (2.0 / batch);
        for idx in (0..self.layers.len()).rev() {
            let input = if idx == 0 { x } else { &activations[idx - 1] };
            let grad_weights = input.t().dot(&delta);
            let grad_bias = delta.sum_axis(Axis(0));
            if idx > 0 {
                let mut upstream = delta.dot(&self.layers[idx].weights.t());
                Zip::from(&mut upstream)
                    .and(input)
                    .for_each(|d, &a| {
                        if a <= 0.0 {
                            *d = 0.0;
                        }
                    });
                delta = upstream;
            }
            let layer = &mut self.layers[idx];
            adam.apply(&mut layer.weights, &grad_weights, &mut moments[idx].weights);
            adam.apply(&mut layer.bias, &grad_bias, &mut moments[idx].bias);
        }
        loss
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn small_config(epochs: usize) -> MlpConfig {
        MlpConfig {
            hidden_dims: vec![8, 4],
            epochs,
            learning_rate: 0.01,
            batch_size: 4,
            seed: 7,
        }
    }

    #[test]
    fn layer_shapes_follow_config() {
        let model = MlpRegressor::new(MlpConfig::default(), 6);
        let shapes: Vec<_> = model.layers().iter().map(|l| l.weights.dim()).collect();
        assert_eq!(shapes, vec![(6, 50), (50, 50), (50, 20), (20, 1)]);
    }

    #[test]
    fn learns_a_linear_target() {
        let features = Array2::from_shape_fn((32, 2), |(i, j)| {
            #[allow(clippy::cast_precision_loss)]
            let base = (i as f32) / 32.0;
            if j == 0 {
                base
            } else {
                1.0 - base
            }
        });
        let targets = features.map_axis(Axis(1), |row| 3.0f32.mul_add(row[0], 1.0));
        let mut model = MlpRegressor::new(small_config(200), 2);
        let history = model.fit(&features, &targets).unwrap();
        assert_eq!(history.len(), 200);
        assert!(history[199] < history[0]);
        assert!(history[199] < 0.1, "final loss {}", history[199]);
    }

    #[test]
    fn same_seed_same_model() {
        let features: Array2<f32> = array![[0.0, 1.0], [1.0, 0.0], [0.5, 0.5]];
        let targets: Array1<f32> = array![1.0, 5.0, 3.0];
        let mut a = MlpRegressor::new(small_config(5), 2);
        let mut b = MlpRegressor::new(small_config(5), 2);
        a.fit(&features, &targets).unwrap();
        b.fit(&features, &targets).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_bad_shapes() {
        let mut model = MlpRegressor::new(small_config(1), 3);
        let err = model
            .fit(&Array2::zeros((0, 3)), &Array1::zeros(0))
            .unwrap_err();
        assert!(matches!(err, ModelError::EmptyTrainingSet));
        let err = model.predict(&Array2::zeros((1, 2))).unwrap_err();
        assert!(matches!(
            err,
            ModelError::DimensionMismatch {
                expected: 3,
                found: 2
            }
        ));
        let err = model
            .fit(&Array2::zeros((2, 3)), &Array1::zeros(3))
            .unwrap_err();
        assert!(matches!(err, ModelError::LengthMismatch { .. }));
    }
}
