//! Feed-forward networks used as learned right-hand sides.
//!
//! A [`NeuralDerivative`] describes the topology of a multilayer perceptron
//! mapping state to `dx/dt`. Its weights are not stored in the system: they
//! live in the [`ParameterSet`] under `weights_key`, so swapping weights is
//! the same operation as swapping a rate constant.

use crate::error::{Result, SimulationError};
use crate::integrator::{integrate, validate_times, IntegratorSettings, Trajectory};
use crate::parameters::{ParameterSet, ParameterValue};
use crate::system::{OdeSystem, Species};
use nalgebra::{DMatrix, DVector};
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Parameter key under which network weights are stored by default.
pub const DEFAULT_WEIGHTS_KEY: &str = "mlp";

/// Hidden-layer nonlinearity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    #[default]
    Softplus,
    Tanh,
    Sigmoid,
    Identity,
}

impl Activation {
    pub fn apply(&self, x: f64) -> f64 {
        match self {
            // log(1 + e^x) without overflow for large x
            Activation::Softplus => x.max(0.0) + (-x.abs()).exp().ln_1p(),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Activation::Identity => x,
        }
    }
}

/// A dense (fully connected) layer: `y = W x + b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    pub weights: DMatrix<f64>,
    pub bias: DVector<f64>,
}

impl DenseLayer {
    fn init(fan_in: usize, fan_out: usize, rng: &mut StdRng) -> Self {
        let limit = 1.0 / (fan_in as f64).sqrt();
        let dist = Uniform::new_inclusive(-limit, limit);
        let weights = DMatrix::from_fn(fan_out, fan_in, |_, _| rng.sample(&dist));
        let bias = DVector::from_fn(fan_out, |_, _| rng.sample(&dist));
        Self { weights, bias }
    }

    fn shape(&self) -> (usize, usize) {
        (self.weights.nrows(), self.weights.ncols())
    }
}

/// Trainable weights of a multilayer perceptron, input layer first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpWeights {
    pub layers: Vec<DenseLayer>,
}

impl MlpWeights {
    /// (rows, cols) of every layer's weight matrix.
    pub fn layer_shapes(&self) -> Vec<(usize, usize)> {
        self.layers.iter().map(DenseLayer::shape).collect()
    }

    /// Total number of scalar weights and biases.
    pub fn num_parameters(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.weights.len() + l.bias.len())
            .sum()
    }

    /// Element-wise average. Returns `None` for an empty slice or mismatched shapes.
    pub fn average(items: &[&MlpWeights]) -> Option<MlpWeights> {
        let (first, rest) = items.split_first()?;
        let shapes = first.layer_shapes();
        if rest.iter().any(|w| w.layer_shapes() != shapes) {
            return None;
        }

        let scale = 1.0 / items.len() as f64;
        let layers = (0..first.layers.len())
            .map(|i| {
                let mut weights = first.layers[i].weights.clone();
                let mut bias = first.layers[i].bias.clone();
                for other in rest {
                    weights += &other.layers[i].weights;
                    bias += &other.layers[i].bias;
                }
                DenseLayer {
                    weights: weights * scale,
                    bias: bias * scale,
                }
            })
            .collect();
        Some(MlpWeights { layers })
    }

    fn forward(&self, activation: Activation, x: &[f64], out: &mut [f64]) -> Result<()> {
        let mut h = DVector::from_column_slice(x);
        let last = self.layers.len().saturating_sub(1);

        for (i, layer) in self.layers.iter().enumerate() {
            if layer.weights.ncols() != h.len() {
                return Err(SimulationError::shape(
                    format!("Network layer {i} input width"),
                    layer.weights.ncols(),
                    h.len(),
                ));
            }
            h = &layer.weights * h + &layer.bias;
            if i != last {
                h.apply(|v| *v = activation.apply(*v));
            }
        }

        if h.len() != out.len() {
            return Err(SimulationError::shape("Derivative output length", out.len(), h.len()));
        }
        out.copy_from_slice(h.as_slice());
        Ok(())
    }
}

/// Topology of a network standing in for a closed-form right-hand side.
///
/// `depth` counts hidden layers; depth 0 is a single linear map.
/// The network ignores time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuralDerivative {
    pub data_size: usize,
    pub width: usize,
    pub depth: usize,
    pub activation: Activation,
    pub weights_key: String,
}

impl NeuralDerivative {
    pub fn new(data_size: usize, width: usize, depth: usize) -> Result<Self> {
        if data_size == 0 {
            return Err(SimulationError::InvalidSettings(
                "network data size must be positive".to_string(),
            ));
        }
        if depth > 0 && width == 0 {
            return Err(SimulationError::InvalidSettings(
                "hidden width must be positive when depth > 0".to_string(),
            ));
        }
        Ok(Self {
            data_size,
            width,
            depth,
            activation: Activation::default(),
            weights_key: DEFAULT_WEIGHTS_KEY.to_string(),
        })
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Expected (rows, cols) of each layer's weight matrix.
    pub fn layer_shapes(&self) -> Vec<(usize, usize)> {
        if self.depth == 0 {
            return vec![(self.data_size, self.data_size)];
        }
        let mut shapes = Vec::with_capacity(self.depth + 1);
        shapes.push((self.width, self.data_size));
        for _ in 1..self.depth {
            shapes.push((self.width, self.width));
        }
        shapes.push((self.data_size, self.width));
        shapes
    }

    /// Draws initial weights, uniform in `±1/sqrt(fan_in)` per layer.
    pub fn init_weights(&self, seed: u64) -> MlpWeights {
        let mut rng = StdRng::seed_from_u64(seed);
        let layers = self
            .layer_shapes()
            .into_iter()
            .map(|(fan_out, fan_in)| DenseLayer::init(fan_in, fan_out, &mut rng))
            .collect();
        MlpWeights { layers }
    }

    /// Looks up this network's weights and checks them against the topology.
    pub fn resolve<'a>(&self, params: &'a ParameterSet) -> Result<&'a MlpWeights> {
        let weights = params.network(&self.weights_key)?;
        let expected = self.layer_shapes();
        let found = weights.layer_shapes();
        if expected.len() != found.len() {
            return Err(SimulationError::shape(
                "Network layer count",
                expected.len(),
                found.len(),
            ));
        }
        for (i, (e, f)) in expected.iter().zip(&found).enumerate() {
            if e != f {
                return Err(SimulationError::shape(
                    format!("Network layer {i} size"),
                    e.0 * e.1,
                    f.0 * f.1,
                ));
            }
            if weights.layers[i].bias.len() != e.0 {
                return Err(SimulationError::shape(
                    format!("Network layer {i} bias"),
                    e.0,
                    weights.layers[i].bias.len(),
                ));
            }
        }
        Ok(weights)
    }

    pub fn apply(&self, weights: &MlpWeights, x: &[f64], out: &mut [f64]) -> Result<()> {
        weights.forward(self.activation, x, out)
    }
}

/// A neural ODE derived from an existing system, together with freshly
/// initialised weights and the solver configuration used by [`NeuralOde::simulate`].
#[derive(Debug, Clone)]
pub struct NeuralOde {
    pub system: OdeSystem,
    pub parameters: ParameterSet,
    pub settings: IntegratorSettings,
}

impl NeuralOde {
    /// Sizes a network to `source`'s species count and copies its
    /// species names and observable flags.
    pub fn from_system(source: &OdeSystem, width: usize, depth: usize, seed: u64) -> Result<Self> {
        let species: Vec<Species> = source.species().to_vec();
        let network = NeuralDerivative::new(species.len(), width, depth)?;
        let weights = network.init_weights(seed);
        let parameters = ParameterSet::new()
            .with_value(&network.weights_key, ParameterValue::Network(weights));
        let system = OdeSystem::neural(species, network)?;
        Ok(Self {
            system,
            parameters,
            settings: IntegratorSettings::default(),
        })
    }

    pub fn with_settings(mut self, settings: IntegratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn observable_indices(&self) -> Vec<usize> {
        self.system.observable_indices()
    }

    /// Integrates the network with its current weights from `y0`.
    ///
    /// The initial step is the first positive gap in `t0, times[0], times[1], ...`.
    pub fn simulate(&self, times: &[f64], y0: &[f64]) -> Result<Trajectory> {
        validate_times(times, self.settings.t0)?;
        let dt0 = std::iter::once(&self.settings.t0)
            .chain(times)
            .zip(times)
            .map(|(a, b)| b - a)
            .find(|gap| *gap > 0.0)
            .unwrap_or(1.0);
        let bound = self.system.bind(&self.parameters)?;
        integrate(&bound, y0, times, dt0, &self.settings)
    }
}
