use ndarray::{Array1, Array2, Zip};

use crate::network::layer::{Dense, DenseGrad};

/// Adam with bias-corrected moments and a fixed learning rate.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    t: i32,
    moments: Vec<LayerMoments>,
}

#[derive(Debug, Clone)]
struct LayerMoments {
    m_w: Array2<f64>,
    v_w: Array2<f64>,
    m_b: Array1<f64>,
    v_b: Array1<f64>,
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            t: 0,
            moments: Vec::new(),
        }
    }

    pub fn steps(&self) -> i32 {
        self.t
    }

    /// Apply one update; `layers` and `grads` must be in the same order on
    /// every call.
    pub fn step(&mut self, layers: &mut [&mut Dense], grads: &[DenseGrad]) {
        if self.moments.len() != layers.len() {
            self.moments = layers
                .iter()
                .map(|l| LayerMoments {
                    m_w: Array2::zeros(l.weights.dim()),
                    v_w: Array2::zeros(l.weights.dim()),
                    m_b: Array1::zeros(l.bias.len()),
                    v_b: Array1::zeros(l.bias.len()),
                })
                .collect();
        }
        self.t = self.t.saturating_add(1);
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);
        let lr_t = self.lr * (1.0 - b2.powi(self.t)).sqrt() / (1.0 - b1.powi(self.t));

        for ((layer, grad), mom) in layers.iter_mut().zip(grads).zip(self.moments.iter_mut()) {
            Zip::from(&mut layer.weights)
                .and(&grad.weights)
                .and(&mut mom.m_w)
                .and(&mut mom.v_w)
                .for_each(|w, &g, m, v| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    *w -= lr_t * *m / (v.sqrt() + eps);
                });
            Zip::from(&mut layer.bias)
                .and(&grad.bias)
                .and(&mut mom.m_b)
                .and(&mut mom.v_b)
                .for_each(|b, &g, m, v| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    *b -= lr_t * *m / (v.sqrt() + eps);
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::layer::{Activation, Regularizer};
    use ndarray::array;

    #[test]
    fn first_step_moves_against_gradient_by_lr() {
        let mut layer = Dense {
            weights: array![[1.0, -1.0]],
            bias: array![0.5, 0.5],
            activation: Activation::Linear,
            regularizer: Regularizer::default(),
        };
        let grad = DenseGrad {
            weights: array![[2.0, -3.0]],
            bias: array![0.0, 1.0],
        };
        let mut adam = Adam::new(0.1);
        adam.step(&mut [&mut layer], &[grad]);
        assert_eq!(adam.steps(), 1);
        // The bias-corrected first step has magnitude ~lr for any non-zero gradient.
        assert!((layer.weights[[0, 0]] - 0.9).abs() < 1e-6);
        assert!((layer.weights[[0, 1]] + 0.9).abs() < 1e-6);
        assert!((layer.bias[0] - 0.5).abs() < 1e-12);
        assert!((layer.bias[1] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn minimizes_a_quadratic() {
        let mut layer = Dense {
            weights: array![[3.0]],
            bias: array![-2.0],
            activation: Activation::Linear,
            regularizer: Regularizer::default(),
        };
        let mut adam = Adam::new(0.05);
        for _ in 0..3000 {
            let grad = DenseGrad {
                weights: layer.weights.mapv(|w| 2.0 * (w - 1.0)),
                bias: layer.bias.mapv(|b| 2.0 * b),
            };
            adam.step(&mut [&mut layer], &[grad]);
        }
        assert!((layer.weights[[0, 0]] - 1.0).abs() < 5e-2);
        assert!(layer.bias[0].abs() < 5e-2);
    }
}
