use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

fn relu(x: f32) -> f32 {
    x.max(0.0)
}

// ReLU derivative taken on the pre-activation
fn relu_derivative(x: f32) -> f32 {
    if x > 0.0 { 1.0 } else { 0.0 }
}

/// Shape of the approximator; two networks are interchangeable iff these match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Architecture {
    pub inputs: usize,
    pub hidden_layers: usize,
    pub hidden_width: usize,
    pub outputs: usize,
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {}x{} -> {}",
            self.inputs, self.hidden_layers, self.hidden_width, self.outputs
        )
    }
}

/// Fully connected layer; `weights` is row-major `outputs x inputs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub inputs: usize,
    pub outputs: usize,
    pub weights: Vec<f32>,
    pub biases: Vec<f32>,
}

impl Dense {
    // He-uniform init, biases start at zero
    fn new<R: Rng + ?Sized>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let limit = (6.0 / inputs.max(1) as f32).sqrt();
        let weights = (0..inputs * outputs).map(|_| rng.gen_range(-limit..limit)).collect();
        Self { inputs, outputs, weights, biases: vec![0.0; outputs] }
    }

    fn forward(&self, x: &[f32]) -> Vec<f32> {
        self.weights
            .chunks_exact(self.inputs)
            .zip(&self.biases)
            .map(|(row, b)| row.iter().zip(x).map(|(w, v)| w * v).sum::<f32>() + b)
            .collect()
    }
}

/// Per-layer parameter gradients, same layout as the network.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub weights: Vec<Vec<f32>>,
    pub biases: Vec<Vec<f32>>,
}

impl Gradients {
    fn zeros_like(net: &QNetwork) -> Self {
        Self {
            weights: net.layers.iter().map(|l| vec![0.0; l.weights.len()]).collect(),
            biases: net.layers.iter().map(|l| vec![0.0; l.biases.len()]).collect(),
        }
    }

    fn add(mut self, other: Gradients) -> Self {
        for (a, b) in self.weights.iter_mut().zip(other.weights) {
            a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
        }
        for (a, b) in self.biases.iter_mut().zip(other.biases) {
            a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
        }
        self
    }
}

/// One regression sample: move Q(state)[action] toward `target`.
#[derive(Debug, Clone)]
pub struct Sample<'a> {
    pub state: &'a [f32],
    pub action: usize,
    pub target: f32,
}

/// MLP value approximator: ReLU hidden layers, linear output (one value per action).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QNetwork {
    arch: Architecture,
    layers: Vec<Dense>,
}

impl QNetwork {
    pub fn new<R: Rng + ?Sized>(arch: Architecture, rng: &mut R) -> Self {
        let mut layers = Vec::with_capacity(arch.hidden_layers + 1);
        let mut width = arch.inputs;
        for _ in 0..arch.hidden_layers {
            layers.push(Dense::new(width, arch.hidden_width, rng));
            width = arch.hidden_width;
        }
        layers.push(Dense::new(width, arch.outputs, rng));
        Self { arch, layers }
    }

    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    /// Structural check used after deserializing untrusted data.
    pub fn is_consistent(&self) -> bool {
        let mut width = self.arch.inputs;
        if self.layers.len() != self.arch.hidden_layers + 1 {
            return false;
        }
        for (i, l) in self.layers.iter().enumerate() {
            let expected_out = if i == self.arch.hidden_layers { self.arch.outputs } else { self.arch.hidden_width };
            if l.inputs != width
                || l.outputs != expected_out
                || l.weights.len() != l.inputs * l.outputs
                || l.biases.len() != l.outputs
            {
                return false;
            }
            width = l.outputs;
        }
        true
    }

    /// Per-action value estimates for `x` (length `inputs`).
    pub fn forward(&self, x: &[f32]) -> Vec<f32> {
        debug_assert_eq!(x.len(), self.arch.inputs, "input size mismatch");
        let last = self.layers.len() - 1;
        let mut a = x.to_vec();
        for (i, layer) in self.layers.iter().enumerate() {
            a = layer.forward(&a);
            if i != last {
                a.iter_mut().for_each(|v| *v = relu(*v));
            }
        }
        a
    }

    // Gradient of (Q(s)[a] - y)^2 * scale for one sample, plus its squared error.
    fn backprop(&self, sample: &Sample<'_>, scale: f32) -> (Gradients, f32) {
        // forward pass keeping pre-activations and activations
        let last = self.layers.len() - 1;
        let mut acts: Vec<Vec<f32>> = Vec::with_capacity(self.layers.len() + 1);
        let mut pre: Vec<Vec<f32>> = Vec::with_capacity(self.layers.len());
        acts.push(sample.state.to_vec());
        for (i, layer) in self.layers.iter().enumerate() {
            let z = layer.forward(&acts[i]);
            let a = if i != last { z.iter().map(|&v| relu(v)).collect() } else { z.clone() };
            pre.push(z);
            acts.push(a);
        }

        let q = &acts[last + 1];
        let err = q[sample.action] - sample.target;
        let mut grads = Gradients::zeros_like(self);

        // dL/dQ is zero except at the taken action
        let mut delta = vec![0.0f32; self.arch.outputs];
        delta[sample.action] = 2.0 * err * scale;

        for l in (0..self.layers.len()).rev() {
            let layer = &self.layers[l];
            let input = &acts[l];
            for (o, &d) in delta.iter().enumerate() {
                if d == 0.0 {
                    continue;
                }
                let row = &mut grads.weights[l][o * layer.inputs..(o + 1) * layer.inputs];
                row.iter_mut().zip(input).for_each(|(g, x)| *g += d * x);
                grads.biases[l][o] += d;
            }
            if l > 0 {
                let mut prev = vec![0.0f32; layer.inputs];
                for (o, &d) in delta.iter().enumerate() {
                    if d == 0.0 {
                        continue;
                    }
                    let row = &layer.weights[o * layer.inputs..(o + 1) * layer.inputs];
                    prev.iter_mut().zip(row).for_each(|(p, w)| *p += w * d);
                }
                for (p, &z) in prev.iter_mut().zip(&pre[l - 1]) {
                    *p *= relu_derivative(z);
                }
                delta = prev;
            }
        }
        (grads, err * err)
    }

    /// Mean squared error on `samples` and its gradient, L2 penalty included.
    /// Per-sample gradients are computed in parallel.
    pub fn loss_and_gradients(&self, samples: &[Sample<'_>], l2: f32) -> (f32, Gradients) {
        let scale = 1.0 / samples.len().max(1) as f32;
        let (mut grads, sq_sum) = samples
            .par_iter()
            .map(|s| self.backprop(s, scale))
            .reduce(
                || (Gradients::zeros_like(self), 0.0),
                |(ga, la), (gb, lb)| (ga.add(gb), la + lb),
            );
        let mut loss = sq_sum * scale;

        if l2 > 0.0 {
            for (g, layer) in grads.weights.iter_mut().zip(&self.layers) {
                for (gi, &w) in g.iter_mut().zip(&layer.weights) {
                    *gi += 2.0 * l2 * w;
                    loss += l2 * w * w;
                }
            }
        }
        (loss, grads)
    }

    /// The loss `loss_and_gradients` would report, without the backward pass.
    pub fn loss(&self, samples: &[Sample<'_>], l2: f32) -> f32 {
        let scale = 1.0 / samples.len().max(1) as f32;
        let sq_sum: f32 = samples
            .par_iter()
            .map(|s| {
                let err = self.forward(s.state)[s.action] - s.target;
                err * err
            })
            .sum();
        let mut loss = sq_sum * scale;
        if l2 > 0.0 {
            loss += l2 * self.layers.iter().flat_map(|l| &l.weights).map(|w| w * w).sum::<f32>();
        }
        loss
    }

    pub fn parameters_finite(&self) -> bool {
        self.layers
            .iter()
            .all(|l| l.weights.iter().chain(&l.biases).all(|v| v.is_finite()))
    }
}

/// Adam optimizer state for one `QNetwork`.
#[derive(Debug, Clone)]
pub struct Adam {
    pub lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: i32,
    m: Gradients,
    v: Gradients,
}

impl Adam {
    pub fn new(net: &QNetwork, lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: Gradients::zeros_like(net),
            v: Gradients::zeros_like(net),
        }
    }

    /// Forget the moment estimates (after the parameters were replaced).
    pub fn reset(&mut self, net: &QNetwork) {
        *self = Adam::new(net, self.lr);
    }

    pub fn step(&mut self, net: &mut QNetwork, grads: &Gradients) {
        self.t = self.t.saturating_add(1);
        let bc1 = 1.0 - self.beta1.powi(self.t);
        let bc2 = 1.0 - self.beta2.powi(self.t);
        let (b1, b2, eps, lr) = (self.beta1, self.beta2, self.eps, self.lr);

        let update = |p: &mut [f32], g: &[f32], m: &mut [f32], v: &mut [f32]| {
            for i in 0..p.len() {
                m[i] = b1 * m[i] + (1.0 - b1) * g[i];
                v[i] = b2 * v[i] + (1.0 - b2) * g[i] * g[i];
                let m_hat = m[i] / bc1;
                let v_hat = v[i] / bc2;
                p[i] -= lr * m_hat / (v_hat.sqrt() + eps);
            }
        };

        for (l, layer) in net.layers.iter_mut().enumerate() {
            update(&mut layer.weights, &grads.weights[l], &mut self.m.weights[l], &mut self.v.weights[l]);
            update(&mut layer.biases, &grads.biases[l], &mut self.m.biases[l], &mut self.v.biases[l]);
        }
    }
}
