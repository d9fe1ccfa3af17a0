use std::f64::consts::{LN_2, PI};
use std::fmt;

use ndarray::{Array1, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{DemError, DemResult};

/// Added to predicted scales before any log or division.
pub const SCALE_EPS: f64 = 1e-6;

/// Predictive distribution of an ensemble member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionMode {
    /// Point prediction trained on squared error.
    None,
    /// Gaussian `(mean, std)`.
    Normal,
    /// Skew-normal `(location, scale, shape)`.
    Skewed,
}

impl DistributionMode {
    pub fn from_pdf(pdf: &str) -> DemResult<Self> {
        match pdf.trim().to_ascii_lowercase().as_str() {
            "none" | "simple" | "" => Ok(Self::None),
            "normal" | "gaussian" => Ok(Self::Normal),
            "skewed" => Ok(Self::Skewed),
            other => Err(DemError::config(format!(
                "unknown pdf '{}': expected one of none|normal|skewed",
                other
            ))),
        }
    }

    pub fn from_output_width(n_outputs: usize) -> DemResult<Self> {
        match n_outputs {
            1 => Ok(Self::None),
            2 => Ok(Self::Normal),
            3 => Ok(Self::Skewed),
            n => Err(DemError::Corrupt(format!(
                "member has {} outputs, expected 1, 2 or 3",
                n
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Normal => "normal",
            Self::Skewed => "skewed",
        }
    }

    pub fn n_outputs(self) -> usize {
        match self {
            Self::None => 1,
            Self::Normal => 2,
            Self::Skewed => 3,
        }
    }

    pub fn output_names(self) -> &'static [&'static str] {
        match self {
            Self::None => &["mean"],
            Self::Normal => &["mean", "std"],
            Self::Skewed => &["location", "scale", "shape"],
        }
    }

    pub fn loss_name(self) -> &'static str {
        match self {
            Self::None => "mean_squared_error",
            Self::Normal => "nll_gaussian",
            Self::Skewed => "nll_skewed_gaussian",
        }
    }

    pub fn has_scale(self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn has_shape(self) -> bool {
        matches!(self, Self::Skewed)
    }

    /// Per-sample loss of one output row against its label.
    pub fn loss(self, out: &[f64], y: f64) -> f64 {
        match self {
            Self::None => squared_error(out[0], y),
            Self::Normal => nll_gaussian(y, out[0], out[1]),
            Self::Skewed => nll_skewed_gaussian(y, out[0], out[1], out[2]),
        }
    }

    /// Per-sample loss plus its gradient with respect to each output.
    pub fn loss_and_grad(self, out: &[f64], y: f64, grad: &mut [f64]) -> f64 {
        match self {
            Self::None => {
                let d = out[0] - y;
                grad[0] = 2.0 * d;
                d * d
            }
            Self::Normal => {
                let sigma = out[1] + SCALE_EPS;
                let d = out[0] - y;
                let s2 = sigma * sigma;
                grad[0] = d / s2;
                grad[1] = 1.0 / sigma - d * d / (s2 * sigma);
                sigma.ln() + d * d / (2.0 * s2)
            }
            Self::Skewed => {
                let omega = out[1] + SCALE_EPS;
                let alpha = out[2];
                let z = (y - out[0]) / omega;
                let s = alpha * z;
                let ln_cdf = ln_normal_cdf(s);
                let mills = (-0.5 * s * s - 0.5 * (2.0 * PI).ln() - ln_cdf).exp();
                let dl_dz = z - alpha * mills;
                grad[0] = -dl_dz / omega;
                grad[1] = 1.0 / omega - z * dl_dz / omega;
                grad[2] = -mills * z;
                skew_nll_terms(omega, z, ln_cdf)
            }
        }
    }

    /// Combine stacked member outputs `[sample, output, member]` into the
    /// uniform mixture.
    pub fn mixture(self, pred: ArrayView3<f64>) -> DemResult<MixtureForecast> {
        let (_, n_outputs, n_members) = pred.dim();
        if n_members == 0 {
            return Err(DemError::NotFitted("ensemble has no members".to_string()));
        }
        if n_outputs != self.n_outputs() {
            return Err(DemError::Shape(format!(
                "prediction has {} outputs, {} mode expects {}",
                n_outputs,
                self.as_str(),
                self.n_outputs()
            )));
        }

        let mu = pred.index_axis(Axis(1), 0);
        let mean = mu.sum_axis(Axis(1)) / n_members as f64;
        if self == Self::None {
            return Ok(MixtureForecast::Point { mean });
        }

        let sd = pred.index_axis(Axis(1), 1);
        let second_moment = (&mu * &mu + &sd * &sd).sum_axis(Axis(1)) / n_members as f64;
        let std = (second_moment - &mean * &mean).mapv(|v| v.max(0.0).sqrt());

        match self {
            Self::Normal => Ok(MixtureForecast::Normal { mean, std }),
            _ => {
                tracing::warn!("mixture of skewed members keeps mean and std only; shape is not combined");
                Ok(MixtureForecast::Skewed {
                    mean,
                    std,
                    shape: SkewShape::NotImplemented,
                })
            }
        }
    }
}

impl fmt::Display for DistributionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of a skewed mixture. No closed form is used for it yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkewShape {
    NotImplemented,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MixtureForecast {
    Point {
        mean: Array1<f64>,
    },
    Normal {
        mean: Array1<f64>,
        std: Array1<f64>,
    },
    Skewed {
        mean: Array1<f64>,
        std: Array1<f64>,
        shape: SkewShape,
    },
}

impl MixtureForecast {
    pub fn mean(&self) -> &Array1<f64> {
        match self {
            Self::Point { mean } | Self::Normal { mean, .. } | Self::Skewed { mean, .. } => mean,
        }
    }

    pub fn std(&self) -> Option<&Array1<f64>> {
        match self {
            Self::Point { .. } => None,
            Self::Normal { std, .. } | Self::Skewed { std, .. } => Some(std),
        }
    }

    pub fn len(&self) -> usize {
        self.mean().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean().is_empty()
    }
}

pub fn squared_error(pred: f64, y: f64) -> f64 {
    let d = pred - y;
    d * d
}

/// Gaussian negative log-likelihood without the constant `0.5 ln(2π)`.
pub fn nll_gaussian(y: f64, mean: f64, std: f64) -> f64 {
    let sigma = std + SCALE_EPS;
    let d = mean - y;
    sigma.ln() + d * d / (2.0 * sigma * sigma)
}

/// Skew-normal negative log-likelihood.
pub fn nll_skewed_gaussian(y: f64, location: f64, scale: f64, shape: f64) -> f64 {
    let omega = scale + SCALE_EPS;
    let z = (y - location) / omega;
    skew_nll_terms(omega, z, ln_normal_cdf(shape * z))
}

fn skew_nll_terms(omega: f64, z: f64, ln_cdf: f64) -> f64 {
    omega.ln() + 0.5 * z * z - ln_cdf + 0.5 * (2.0 * PI).ln() - LN_2
}

/// `ln Φ(x)` for the standard normal, stable in the far left tail.
pub fn ln_normal_cdf(x: f64) -> f64 {
    -LN_2 + ln_erfc(-x / std::f64::consts::SQRT_2)
}

pub fn normal_cdf(x: f64) -> f64 {
    ln_normal_cdf(x).exp()
}

// Chebyshev fit of erfc (Numerical Recipes), fractional error below 1.2e-7.
fn ln_erfc_nonneg(z: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    t.ln() + poly
}

fn ln_erfc(z: f64) -> f64 {
    if z >= 0.0 {
        ln_erfc_nonneg(z)
    } else {
        (2.0 - ln_erfc_nonneg(-z).exp()).ln()
    }
}
