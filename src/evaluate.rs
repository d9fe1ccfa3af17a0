//! Skill measures for hindcasts.

use ndarray::ArrayView1;

use crate::dist::nll_gaussian;
use crate::error::{DemError, DemResult};

fn check_len(what: &str, a: usize, b: usize) -> DemResult<()> {
    if a != b {
        return Err(DemError::Shape(format!(
            "{}: {} observations vs {} predictions",
            what, a, b
        )));
    }
    if a == 0 {
        return Err(DemError::Shape(format!("{}: empty series", what)));
    }
    Ok(())
}

pub fn rmse(y: ArrayView1<f64>, pred: ArrayView1<f64>) -> DemResult<f64> {
    check_len("rmse", y.len(), pred.len())?;
    let mse = y
        .iter()
        .zip(pred.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f64>()
        / y.len() as f64;
    Ok(mse.sqrt())
}

/// Mean Gaussian negative log-likelihood of `y` under `N(mean, std)`.
pub fn gaussian_nll(
    y: ArrayView1<f64>,
    mean: ArrayView1<f64>,
    std: ArrayView1<f64>,
) -> DemResult<f64> {
    check_len("nll", y.len(), mean.len())?;
    check_len("nll", y.len(), std.len())?;
    let total: f64 = y
        .iter()
        .zip(mean.iter())
        .zip(std.iter())
        .map(|((&obs, &mu), &sd)| nll_gaussian(obs, mu, sd))
        .sum();
    Ok(total / y.len() as f64)
}

/// Pearson correlation; NaN when either series is constant.
pub fn pearson_correlation(a: ArrayView1<f64>, b: ArrayView1<f64>) -> DemResult<f64> {
    check_len("correlation", a.len(), b.len())?;
    let n = a.len() as f64;
    let mean_a = a.sum() / n;
    let mean_b = b.sum() / n;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b.iter()) {
        let (da, db) = (x - mean_a, y - mean_b);
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return Ok(f64::NAN);
    }
    Ok(cov / (var_a.sqrt() * var_b.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn rmse_of_constant_offset() {
        let y = array![1.0, 2.0, 3.0];
        let p = array![1.5, 2.5, 3.5];
        assert!((rmse(y.view(), p.view()).unwrap() - 0.5).abs() < 1e-12);
        assert!(rmse(y.view(), array![1.0].view()).is_err());
    }

    #[test]
    fn correlation_bounds() {
        let a = array![1.0, 2.0, 3.0, 4.0];
        let up = array![2.0, 4.0, 6.0, 8.0];
        let down = array![4.0, 3.0, 2.0, 1.0];
        assert!((pearson_correlation(a.view(), up.view()).unwrap() - 1.0).abs() < 1e-12);
        assert!((pearson_correlation(a.view(), down.view()).unwrap() + 1.0).abs() < 1e-12);
        assert!(pearson_correlation(a.view(), array![1.0, 1.0, 1.0, 1.0].view())
            .unwrap()
            .is_nan());
    }

    #[test]
    fn nll_rewards_calibrated_spread() {
        let y = array![0.0, 1.0, -1.0];
        let mu = array![0.0, 0.0, 0.0];
        let tight = gaussian_nll(y.view(), mu.view(), array![0.01, 0.01, 0.01].view()).unwrap();
        let wide = gaussian_nll(y.view(), mu.view(), array![0.8, 0.8, 0.8].view()).unwrap();
        assert!(wide < tight);
    }
}
