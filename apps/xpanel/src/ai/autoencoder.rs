//! Small dense autoencoder used to score traffic samples by reconstruction error.

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// 6 → 12 → 6 → 3 → 6 → 12 → 6.
pub const LAYER_SIZES: [usize; 7] = [6, 12, 6, 3, 6, 12, 6];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Linear,
}

impl Activation {
    fn apply(self, z: f64) -> f64 {
        match self {
            Activation::Relu => z.max(0.0),
            Activation::Linear => z,
        }
    }

    fn derivative(self, z: f64) -> f64 {
        match self {
            Activation::Relu => {
                if z > 0.0 { 1.0 } else { 0.0 }
            }
            Activation::Linear => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub inputs: usize,
    pub outputs: usize,
    /// Row-major, `outputs × inputs`.
    pub weights: Vec<f64>,
    pub biases: Vec<f64>,
    pub activation: Activation,
}

impl Dense {
    /// Glorot-uniform weights, zero biases.
    fn new(inputs: usize, outputs: usize, activation: Activation, rng: &mut impl Rng) -> Self {
        let limit = (6.0 / (inputs + outputs) as f64).sqrt();
        let weights = (0..inputs * outputs)
            .map(|_| rng.random_range(-limit..limit))
            .collect();
        Self {
            inputs,
            outputs,
            weights,
            biases: vec![0.0; outputs],
            activation,
        }
    }

    fn pre_activation(&self, input: &[f64]) -> Vec<f64> {
        (0..self.outputs)
            .map(|j| {
                let row = &self.weights[j * self.inputs..(j + 1) * self.inputs];
                row.iter().zip(input).map(|(w, x)| w * x).sum::<f64>() + self.biases[j]
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrainOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub validation_split: f64,
    pub learning_rate: f64,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 32,
            validation_split: 0.2,
            learning_rate: 0.001,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub loss: f64,
    pub val_loss: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub epochs: Vec<EpochReport>,
    pub train_samples: usize,
    pub validation_samples: usize,
}

impl TrainingReport {
    pub fn final_loss(&self) -> f64 {
        self.epochs.last().map(|e| e.loss).unwrap_or(f64::NAN)
    }

    pub fn final_val_loss(&self) -> Option<f64> {
        self.epochs.last().and_then(|e| e.val_loss)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Autoencoder {
    pub layers: Vec<Dense>,
}

impl Autoencoder {
    /// ReLU on every hidden layer, linear output.
    pub fn new(sizes: &[usize], rng: &mut impl Rng) -> Self {
        let last = sizes.len().saturating_sub(2);
        let layers = sizes
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                let activation = if i == last { Activation::Linear } else { Activation::Relu };
                Dense::new(pair[0], pair[1], activation, rng)
            })
            .collect();
        Self { layers }
    }

    pub fn input_size(&self) -> usize {
        self.layers.first().map(|l| l.inputs).unwrap_or(0)
    }

    pub fn forward(&self, input: &[f64]) -> Vec<f64> {
        self.layers.iter().fold(input.to_vec(), |a, layer| {
            layer
                .pre_activation(&a)
                .into_iter()
                .map(|z| layer.activation.apply(z))
                .collect()
        })
    }

    /// Mean squared error between `input` and its reconstruction.
    pub fn reconstruction_error(&self, input: &[f64]) -> f64 {
        mse(&self.forward(input), input)
    }

    pub fn mean_error(&self, samples: &[Vec<f64>]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().map(|s| self.reconstruction_error(s)).sum::<f64>() / samples.len() as f64
    }

    /// Mini-batch Adam on MSE. The tail of a shuffled copy is held out for validation.
    pub fn train(
        &mut self,
        samples: &[Vec<f64>],
        options: &TrainOptions,
        rng: &mut impl Rng,
        mut on_epoch: impl FnMut(&EpochReport),
    ) -> TrainingReport {
        let mut order: Vec<usize> = (0..samples.len()).collect();
        order.shuffle(rng);
        let held_out = ((samples.len() as f64) * options.validation_split.clamp(0.0, 0.9)).floor() as usize;
        let (train_idx, val_idx) = order.split_at(samples.len() - held_out);
        let mut train_idx = train_idx.to_vec();
        let validation: Vec<Vec<f64>> = val_idx.iter().map(|&i| samples[i].clone()).collect();

        let mut adam = Adam::new(self, options.learning_rate);
        let batch_size = options.batch_size.max(1);
        let mut epochs = Vec::with_capacity(options.epochs);

        for epoch in 1..=options.epochs {
            train_idx.shuffle(rng);
            let mut total_loss = 0.0;

            for batch in train_idx.chunks(batch_size) {
                let mut grads = Gradients::zeros(self);
                for &i in batch {
                    total_loss += self.backprop(&samples[i], &mut grads);
                }
                grads.scale(1.0 / batch.len() as f64);
                adam.step(self, &grads);
            }

            let report = EpochReport {
                epoch,
                loss: if train_idx.is_empty() { 0.0 } else { total_loss / train_idx.len() as f64 },
                val_loss: (!validation.is_empty()).then(|| self.mean_error(&validation)),
            };
            on_epoch(&report);
            epochs.push(report);
        }

        TrainingReport {
            epochs,
            train_samples: train_idx.len(),
            validation_samples: validation.len(),
        }
    }

    /// Adds this sample's gradient to `grads`, returns its loss.
    fn backprop(&self, sample: &[f64], grads: &mut Gradients) -> f64 {
        let mut activations = vec![sample.to_vec()];
        let mut pre = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let z = layer.pre_activation(activations.last().map(Vec::as_slice).unwrap_or(&[]));
            activations.push(z.iter().map(|&v| layer.activation.apply(v)).collect());
            pre.push(z);
        }

        let output = activations.last().map(Vec::as_slice).unwrap_or(&[]);
        let n = output.len().max(1) as f64;
        let loss = mse(output, sample);
        let mut upstream: Vec<f64> = output.iter().zip(sample).map(|(o, t)| 2.0 * (o - t) / n).collect();

        for (l, layer) in self.layers.iter().enumerate().rev() {
            let delta: Vec<f64> = upstream
                .iter()
                .zip(&pre[l])
                .map(|(g, &z)| g * layer.activation.derivative(z))
                .collect();
            let input = &activations[l];

            let mut next = vec![0.0; layer.inputs];
            for (j, d) in delta.iter().enumerate() {
                grads.biases[l][j] += d;
                let row = j * layer.inputs;
                for (i, x) in input.iter().enumerate() {
                    grads.weights[l][row + i] += d * x;
                    next[i] += layer.weights[row + i] * d;
                }
            }
            upstream = next;
        }

        loss
    }

}

struct Gradients {
    weights: Vec<Vec<f64>>,
    biases: Vec<Vec<f64>>,
}

impl Gradients {
    fn zeros(net: &Autoencoder) -> Self {
        Self {
            weights: net.layers.iter().map(|l| vec![0.0; l.weights.len()]).collect(),
            biases: net.layers.iter().map(|l| vec![0.0; l.biases.len()]).collect(),
        }
    }

    fn scale(&mut self, factor: f64) {
        for g in self.weights.iter_mut().chain(self.biases.iter_mut()) {
            g.iter_mut().for_each(|v| *v *= factor);
        }
    }
}

struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    t: i32,
    m: Gradients,
    v: Gradients,
}

impl Adam {
    fn new(net: &Autoencoder, lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            t: 0,
            m: Gradients::zeros(net),
            v: Gradients::zeros(net),
        }
    }

    fn step(&mut self, net: &mut Autoencoder, grads: &Gradients) {
        self.t += 1;
        let c1 = 1.0 - self.beta1.powi(self.t);
        let c2 = 1.0 - self.beta2.powi(self.t);

        for (l, layer) in net.layers.iter_mut().enumerate() {
            Self::update(
                &mut layer.weights,
                &grads.weights[l],
                &mut self.m.weights[l],
                &mut self.v.weights[l],
                (self.lr, self.beta1, self.beta2, self.epsilon, c1, c2),
            );
            Self::update(
                &mut layer.biases,
                &grads.biases[l],
                &mut self.m.biases[l],
                &mut self.v.biases[l],
                (self.lr, self.beta1, self.beta2, self.epsilon, c1, c2),
            );
        }
    }

    fn update(
        params: &mut [f64],
        grads: &[f64],
        m: &mut [f64],
        v: &mut [f64],
        (lr, b1, b2, eps, c1, c2): (f64, f64, f64, f64, f64, f64),
    ) {
        for i in 0..params.len() {
            m[i] = b1 * m[i] + (1.0 - b1) * grads[i];
            v[i] = b2 * v[i] + (1.0 - b2) * grads[i] * grads[i];
            let m_hat = m[i] / c1;
            let v_hat = v[i] / c2;
            params[i] -= lr * m_hat / (v_hat.sqrt() + eps);
        }
    }
}

/// Per-feature min-max scaling fitted on the training set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl MinMaxScaler {
    pub fn fit(samples: &[Vec<f64>]) -> Self {
        let width = samples.first().map(Vec::len).unwrap_or(0);
        let mut min = vec![f64::INFINITY; width];
        let mut max = vec![f64::NEG_INFINITY; width];
        for sample in samples {
            for (i, &v) in sample.iter().enumerate().take(width) {
                min[i] = min[i].min(v);
                max[i] = max[i].max(v);
            }
        }
        Self { min, max }
    }

    /// Constant features map to 0.
    pub fn transform(&self, sample: &[f64]) -> Vec<f64> {
        sample
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let (lo, hi) = (self.min.get(i).copied().unwrap_or(0.0), self.max.get(i).copied().unwrap_or(0.0));
                if hi == lo { 0.0 } else { (v - lo) / (hi - lo) }
            })
            .collect()
    }
}

fn mse(output: &[f64], target: &[f64]) -> f64 {
    if output.is_empty() {
        return 0.0;
    }
    output.iter().zip(target).map(|(o, t)| (o - t).powi(2)).sum::<f64>() / output.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn dataset(rng: &mut StdRng, n: usize) -> Vec<Vec<f64>> {
        (0..n)
            .map(|_| {
                let a: f64 = rng.random_range(0.0..1.0);
                let b: f64 = rng.random_range(0.0..1.0);
                vec![a, b, (a + b) / 2.0, a * 0.5, 0.3, b]
            })
            .collect()
    }

    #[test]
    fn shape_follows_layer_sizes() {
        let mut rng = StdRng::seed_from_u64(7);
        let net = Autoencoder::new(&LAYER_SIZES, &mut rng);

        assert_eq!(net.layers.len(), 6);
        assert_eq!(net.input_size(), 6);
        assert_eq!(net.forward(&[0.1; 6]).len(), 6);
        assert!(net.layers[..5].iter().all(|l| l.activation == Activation::Relu));
        assert_eq!(net.layers[5].activation, Activation::Linear);
        assert_eq!(net.layers[2].outputs, 3);
    }

    #[test]
    fn training_reduces_loss_and_holds_out_validation() {
        let mut rng = StdRng::seed_from_u64(42);
        let data = dataset(&mut rng, 250);
        let mut net = Autoencoder::new(&LAYER_SIZES, &mut rng);
        let mut seen = 0;

        let report = net.train(&data, &TrainOptions::default(), &mut rng, |_| seen += 1);

        assert_eq!(seen, 50);
        assert_eq!(report.validation_samples, 50);
        assert_eq!(report.train_samples, 200);
        assert!(report.final_loss() < report.epochs[0].loss);
        assert!(report.final_val_loss().is_some());
    }

    #[test]
    fn scaler_maps_constant_features_to_zero() {
        let scaler = MinMaxScaler::fit(&[vec![0.0, 5.0, 10.0], vec![10.0, 5.0, 30.0]]);
        assert_eq!(scaler.transform(&[5.0, 5.0, 20.0]), vec![0.5, 0.0, 0.5]);
        assert_eq!(scaler.transform(&[10.0, 99.0, 10.0]), vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn serialized_model_scores_identically_after_reload() {
        let mut rng = StdRng::seed_from_u64(3);
        let net = Autoencoder::new(&LAYER_SIZES, &mut rng);

        let json = serde_json::to_string(&net).unwrap();
        let loaded: Autoencoder = serde_json::from_str(&json).unwrap();

        let sample = [0.2, 0.4, 0.3, 0.1, 0.5, 0.9];
        assert_eq!(loaded.layers.len(), net.layers.len());
        assert!((net.reconstruction_error(&sample) - loaded.reconstruction_error(&sample)).abs() < 1e-12);
    }
}
