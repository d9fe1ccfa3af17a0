use std::str::FromStr;

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DemError;

/// Kernels start uniform in `[-INIT_LIMIT, INIT_LIMIT]`, biases at zero.
pub const INIT_LIMIT: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Linear,
    Relu,
    Tanh,
    Elu,
    Sigmoid,
    Softplus,
}

impl Activation {
    pub fn apply(self, z: f64) -> f64 {
        match self {
            Self::Linear => z,
            Self::Relu => z.max(0.0),
            Self::Tanh => z.tanh(),
            Self::Elu => {
                if z > 0.0 {
                    z
                } else {
                    z.exp_m1()
                }
            }
            Self::Sigmoid => sigmoid(z),
            Self::Softplus => softplus(z),
        }
    }

    /// Derivative at pre-activation `z`, given the activation output `a`.
    pub fn derivative(self, z: f64, a: f64) -> f64 {
        match self {
            Self::Linear => 1.0,
            Self::Relu => {
                if z > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Tanh => 1.0 - a * a,
            Self::Elu => {
                if z > 0.0 {
                    1.0
                } else {
                    a + 1.0
                }
            }
            Self::Sigmoid => a * (1.0 - a),
            Self::Softplus => sigmoid(z),
        }
    }
}

impl FromStr for Activation {
    type Err = DemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "relu" => Ok(Self::Relu),
            "tanh" => Ok(Self::Tanh),
            "elu" => Ok(Self::Elu),
            "sigmoid" => Ok(Self::Sigmoid),
            "softplus" => Ok(Self::Softplus),
            other => Err(DemError::config(format!(
                "unknown activation '{}': expected one of linear|relu|tanh|elu|sigmoid|softplus",
                other
            ))),
        }
    }
}

pub fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

pub fn softplus(z: f64) -> f64 {
    z.max(0.0) + (-z.abs()).exp().ln_1p()
}

/// L1/L2 penalty on a kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Regularizer {
    pub l1: f64,
    pub l2: f64,
}

impl Regularizer {
    pub fn new(l1: f64, l2: f64) -> Self {
        Self { l1, l2 }
    }

    pub fn is_active(&self) -> bool {
        self.l1 != 0.0 || self.l2 != 0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    pub weights: Array2<f64>,
    pub bias: Array1<f64>,
    pub activation: Activation,
    #[serde(default)]
    pub regularizer: Regularizer,
}

#[derive(Debug, Clone)]
pub struct DenseGrad {
    pub weights: Array2<f64>,
    pub bias: Array1<f64>,
}

impl Dense {
    pub fn new<R: Rng + ?Sized>(
        n_in: usize,
        n_out: usize,
        activation: Activation,
        regularizer: Regularizer,
        rng: &mut R,
    ) -> Self {
        let weights =
            Array2::from_shape_fn((n_in, n_out), |_| rng.random_range(-INIT_LIMIT..=INIT_LIMIT));
        Self {
            weights,
            bias: Array1::zeros(n_out),
            activation,
            regularizer,
        }
    }

    pub fn n_in(&self) -> usize {
        self.weights.nrows()
    }

    pub fn n_out(&self) -> usize {
        self.weights.ncols()
    }

    /// Returns `(pre_activation, activation)`.
    pub fn forward(&self, x: ArrayView2<f64>) -> (Array2<f64>, Array2<f64>) {
        let z = x.dot(&self.weights) + &self.bias;
        let act = self.activation;
        let a = z.mapv(|v| act.apply(v));
        (z, a)
    }

    /// Backpropagate `d_a` (gradient w.r.t. this layer's activation).
    ///
    /// Returns the parameter gradient (penalty included) and the gradient
    /// w.r.t. the layer input.
    pub fn backward(
        &self,
        input: ArrayView2<f64>,
        z: &Array2<f64>,
        a: &Array2<f64>,
        d_a: &Array2<f64>,
    ) -> (DenseGrad, Array2<f64>) {
        let act = self.activation;
        let mut d_z = d_a.clone();
        ndarray::Zip::from(&mut d_z)
            .and(z)
            .and(a)
            .for_each(|d, &zv, &av| *d *= act.derivative(zv, av));

        let mut d_w = input.t().dot(&d_z);
        if self.regularizer.is_active() {
            d_w += &self.penalty_grad();
        }
        let d_b = d_z.sum_axis(Axis(0));
        let d_input = d_z.dot(&self.weights.t());
        (
            DenseGrad {
                weights: d_w,
                bias: d_b,
            },
            d_input,
        )
    }

    pub fn penalty(&self) -> f64 {
        let Regularizer { l1, l2 } = self.regularizer;
        if l1 == 0.0 && l2 == 0.0 {
            return 0.0;
        }
        self.weights
            .iter()
            .map(|w| l1 * w.abs() + l2 * w * w)
            .sum()
    }

    fn penalty_grad(&self) -> Array2<f64> {
        let Regularizer { l1, l2 } = self.regularizer;
        self.weights.mapv(|w| {
            let sign = if w == 0.0 { 0.0 } else { w.signum() };
            l1 * sign + 2.0 * l2 * w
        })
    }
}
