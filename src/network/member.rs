use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::dist::DistributionMode;
use crate::error::{DemError, DemResult};
use crate::hyperparams::{FixedParams, HyperValue};
use crate::network::early_stopping::{EarlyStopping, StopDecision};
use crate::network::layer::{Activation, Dense, DenseGrad, Regularizer};
use crate::network::optim::Adam;

/// Architecture and training settings for one member, resolved from the
/// model's fixed hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberConfig {
    pub mode: DistributionMode,
    pub hidden: Vec<usize>,
    pub activation: Activation,
    pub dropout: f64,
    pub noise_in: f64,
    pub noise_mu: f64,
    pub noise_sigma: f64,
    pub noise_alpha: f64,
    pub reg_hidden: Regularizer,
    pub reg_mu: Regularizer,
    pub reg_sigma: Regularizer,
    pub reg_alpha: Regularizer,
    pub lr: f64,
    pub batch_size: usize,
    pub epochs: usize,
    pub patience: usize,
    pub min_delta: f64,
}

impl MemberConfig {
    pub fn from_params(params: &FixedParams, mode: DistributionMode) -> DemResult<Self> {
        let layers = params.usize("layers")?;
        let hidden = match params.get("neurons") {
            Some(HyperValue::Tuple(widths)) => {
                if widths.len() != layers {
                    return Err(DemError::config(format!(
                        "neurons gives {} widths but layers = {}",
                        widths.len(),
                        layers
                    )));
                }
                widths
                    .iter()
                    .map(|w| usize::try_from(*w).unwrap_or(0))
                    .collect::<Vec<_>>()
            }
            _ => vec![params.usize("neurons")?; layers],
        };
        if hidden.iter().any(|w| *w == 0) {
            return Err(DemError::config("every hidden layer needs at least one neuron"));
        }

        let cfg = Self {
            mode,
            hidden,
            activation: params.text("activation")?.parse()?,
            dropout: params.f64("dropout")?,
            noise_in: params.f64("noise_in")?,
            noise_mu: params.f64("noise_mu")?,
            noise_sigma: params.f64("noise_sigma")?,
            noise_alpha: params.f64("noise_alpha")?,
            reg_hidden: Regularizer::new(params.f64("l1_hidden")?, params.f64("l2_hidden")?),
            reg_mu: Regularizer::new(params.f64("l1_mu")?, params.f64("l2_mu")?),
            reg_sigma: Regularizer::new(params.f64("l1_sigma")?, params.f64("l2_sigma")?),
            reg_alpha: Regularizer::new(params.f64("l1_alpha")?, params.f64("l2_alpha")?),
            lr: params.f64("lr")?,
            batch_size: params.usize("batch_size")?,
            epochs: params.usize("epochs")?,
            patience: params.usize("patience")?,
            min_delta: params.f64("min_delta")?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> DemResult<()> {
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(DemError::config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        for (name, v) in [
            ("noise_in", self.noise_in),
            ("noise_mu", self.noise_mu),
            ("noise_sigma", self.noise_sigma),
            ("noise_alpha", self.noise_alpha),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(DemError::config(format!(
                    "{} must be a non-negative stddev, got {}",
                    name, v
                )));
            }
        }
        for reg in [self.reg_hidden, self.reg_mu, self.reg_sigma, self.reg_alpha] {
            if reg.l1 < 0.0 || reg.l2 < 0.0 {
                return Err(DemError::config("regularization coefficients must be >= 0"));
            }
        }
        if !self.lr.is_finite() || self.lr <= 0.0 {
            return Err(DemError::config(format!("lr must be > 0, got {}", self.lr)));
        }
        if self.batch_size == 0 {
            return Err(DemError::config("batch_size must be >= 1"));
        }
        if self.epochs == 0 {
            return Err(DemError::config("epochs must be >= 1"));
        }
        Ok(())
    }

    fn head_noise(&self) -> [f64; 3] {
        [self.noise_mu, self.noise_sigma, self.noise_alpha]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub epochs_run: usize,
    pub best_epoch: usize,
    pub val_loss: f64,
    pub stopped_early: bool,
}

/// One feed-forward network of the ensemble.
///
/// Output columns are `[mean, (std), (shape)]`; the number of heads fixes the
/// distribution mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleMember {
    n_features: usize,
    hidden: Vec<Dense>,
    heads: Vec<Dense>,
}

struct ForwardCache {
    inputs: Vec<Array2<f64>>,
    pre: Vec<Array2<f64>>,
    post: Vec<Array2<f64>>,
    masks: Vec<Option<Array2<f64>>>,
    head_pre: Vec<Array2<f64>>,
    head_post: Vec<Array2<f64>>,
    output: Array2<f64>,
}

impl EnsembleMember {
    pub fn build<R: Rng + ?Sized>(n_features: usize, cfg: &MemberConfig, rng: &mut R) -> Self {
        let mut hidden = Vec::with_capacity(cfg.hidden.len());
        let mut width = n_features;
        for &n in &cfg.hidden {
            hidden.push(Dense::new(width, n, cfg.activation, cfg.reg_hidden, rng));
            width = n;
        }

        let mut heads = vec![Dense::new(width, 1, Activation::Linear, cfg.reg_mu, rng)];
        if cfg.mode.has_scale() {
            heads.push(Dense::new(width, 1, Activation::Softplus, cfg.reg_sigma, rng));
        }
        if cfg.mode.has_shape() {
            heads.push(Dense::new(width, 1, Activation::Linear, cfg.reg_alpha, rng));
        }

        Self {
            n_features,
            hidden,
            heads,
        }
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_outputs(&self) -> usize {
        self.heads.len()
    }

    pub fn mode(&self) -> DemResult<DistributionMode> {
        DistributionMode::from_output_width(self.n_outputs())
    }

    /// Consistency check for members read from disk.
    pub fn check(&self) -> DemResult<()> {
        let mut width = self.n_features;
        for layer in &self.hidden {
            if layer.n_in() != width || layer.bias.len() != layer.n_out() {
                return Err(DemError::Corrupt("hidden layer shapes do not chain".to_string()));
            }
            width = layer.n_out();
        }
        for head in &self.heads {
            if head.n_in() != width || head.n_out() != 1 || head.bias.len() != 1 {
                return Err(DemError::Corrupt(format!(
                    "output head must map {} inputs to 1 output",
                    width
                )));
            }
        }
        self.mode().map(|_| ())
    }

    /// Deterministic forward pass: no noise, no dropout.
    pub fn predict(&self, x: ArrayView2<f64>) -> DemResult<Array2<f64>> {
        if x.ncols() != self.n_features {
            return Err(DemError::Shape(format!(
                "member expects {} features, got {}",
                self.n_features,
                x.ncols()
            )));
        }
        let mut h = x.to_owned();
        for layer in &self.hidden {
            h = layer.forward(h.view()).1;
        }
        let mut out = Array2::zeros((x.nrows(), self.heads.len()));
        for (k, head) in self.heads.iter().enumerate() {
            let (_, a) = head.forward(h.view());
            out.column_mut(k).assign(&a.column(0));
        }
        Ok(out)
    }

    /// Mean loss over `(x, y)` without regularization.
    pub fn evaluate(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> DemResult<f64> {
        let mode = self.mode()?;
        let out = self.predict(x)?;
        Ok(mean_loss(mode, &out, y))
    }

    fn penalty(&self) -> f64 {
        self.hidden
            .iter()
            .chain(self.heads.iter())
            .map(Dense::penalty)
            .sum()
    }

    fn forward_train<R: Rng + ?Sized>(
        &self,
        x: ArrayView2<f64>,
        cfg: &MemberConfig,
        rng: &mut R,
    ) -> DemResult<ForwardCache> {
        let mut h = x.to_owned();
        add_gaussian_noise(&mut h, cfg.noise_in, rng)?;

        let n_hidden = self.hidden.len();
        let mut cache = ForwardCache {
            inputs: Vec::with_capacity(n_hidden),
            pre: Vec::with_capacity(n_hidden),
            post: Vec::with_capacity(n_hidden),
            masks: Vec::with_capacity(n_hidden),
            head_pre: Vec::with_capacity(self.heads.len()),
            head_post: Vec::with_capacity(self.heads.len()),
            output: Array2::zeros((x.nrows(), self.heads.len())),
        };

        for layer in &self.hidden {
            let (z, a) = layer.forward(h.view());
            let mask = dropout_mask(a.dim(), cfg.dropout, rng);
            let next = match &mask {
                Some(m) => &a * m,
                None => a.clone(),
            };
            cache.inputs.push(h);
            cache.pre.push(z);
            cache.post.push(a);
            cache.masks.push(mask);
            h = next;
        }

        let noise = cfg.head_noise();
        for (k, head) in self.heads.iter().enumerate() {
            let (z, a) = head.forward(h.view());
            let mut col = a.column(0).to_owned();
            if noise[k] > 0.0 {
                let normal = Normal::new(0.0, noise[k])
                    .map_err(|e| DemError::config(format!("output noise: {}", e)))?;
                col.mapv_inplace(|v| v + normal.sample(rng));
            }
            cache.output.column_mut(k).assign(&col);
            cache.head_pre.push(z);
            cache.head_post.push(a);
        }
        cache.inputs.push(h);
        Ok(cache)
    }

    /// Gradients in `hidden ++ heads` order for a batch with loss gradient
    /// `d_out` (already averaged over the batch).
    fn backward(&self, cache: &ForwardCache, d_out: &Array2<f64>) -> Vec<DenseGrad> {
        let h_last = &cache.inputs[self.hidden.len()];
        let mut head_grads = Vec::with_capacity(self.heads.len());
        let mut d_h = Array2::zeros(h_last.dim());
        for (k, head) in self.heads.iter().enumerate() {
            let d_a = d_out.column(k).to_owned().insert_axis(Axis(1));
            let (grad, d_in) =
                head.backward(h_last.view(), &cache.head_pre[k], &cache.head_post[k], &d_a);
            d_h += &d_in;
            head_grads.push(grad);
        }

        let mut hidden_grads = Vec::with_capacity(self.hidden.len());
        for (i, layer) in self.hidden.iter().enumerate().rev() {
            let d_a = match &cache.masks[i] {
                Some(m) => &d_h * m,
                None => d_h,
            };
            let (grad, d_in) =
                layer.backward(cache.inputs[i].view(), &cache.pre[i], &cache.post[i], &d_a);
            hidden_grads.push(grad);
            d_h = d_in;
        }
        hidden_grads.reverse();
        hidden_grads.extend(head_grads);
        hidden_grads
    }

    fn train_batch<R: Rng + ?Sized>(
        &mut self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        cfg: &MemberConfig,
        adam: &mut Adam,
        rng: &mut R,
    ) -> DemResult<f64> {
        let cache = self.forward_train(x, cfg, rng)?;
        let n = x.nrows() as f64;
        let n_out = self.heads.len();
        let mut d_out = Array2::zeros(cache.output.dim());
        let mut row = [0.0; 3];
        let mut grad = [0.0; 3];
        let mut loss = 0.0;
        for (i, &target) in y.iter().enumerate() {
            for k in 0..n_out {
                row[k] = cache.output[[i, k]];
            }
            loss += cfg.mode.loss_and_grad(&row[..n_out], target, &mut grad[..n_out]);
            for k in 0..n_out {
                d_out[[i, k]] = grad[k] / n;
            }
        }

        let grads = self.backward(&cache, &d_out);
        let mut layers: Vec<&mut Dense> =
            self.hidden.iter_mut().chain(self.heads.iter_mut()).collect();
        adam.step(&mut layers, &grads);
        Ok(loss / n)
    }

    /// Train on `train`, early-stopping on the loss over `validation`.
    ///
    /// The weights of the best validation epoch are restored on return.
    pub fn train<R: Rng + ?Sized>(
        &mut self,
        cfg: &MemberConfig,
        train: &Dataset,
        validation: &Dataset,
        rng: &mut R,
    ) -> DemResult<TrainReport> {
        if train.is_empty() || validation.is_empty() {
            return Err(DemError::Shape(format!(
                "member needs non-empty train and validation sets (got {} / {})",
                train.len(),
                validation.len()
            )));
        }
        for ds in [train, validation] {
            if ds.n_features() != self.n_features {
                return Err(DemError::Shape(format!(
                    "member expects {} features, got {}",
                    self.n_features,
                    ds.n_features()
                )));
            }
        }

        let mut adam = Adam::new(cfg.lr);
        let mut stopper = EarlyStopping::new(cfg.patience, cfg.min_delta);
        let mut best: Option<(Vec<Dense>, Vec<Dense>)> = None;
        let mut order: Vec<usize> = (0..train.len()).collect();
        let mut epochs_run = 0;
        let mut stopped_early = false;

        for epoch in 0..cfg.epochs {
            order.shuffle(rng);
            let mut train_loss = 0.0;
            for chunk in order.chunks(cfg.batch_size) {
                let xb = train.x.select(Axis(0), chunk);
                let yb = train.y.select(Axis(0), chunk);
                let batch_loss = self.train_batch(xb.view(), yb.view(), cfg, &mut adam, rng)?;
                train_loss += batch_loss * chunk.len() as f64;
            }
            train_loss = train_loss / train.len() as f64 + self.penalty();
            if !train_loss.is_finite() {
                return Err(DemError::NonFiniteLoss {
                    stage: "training",
                    epoch,
                    value: train_loss,
                });
            }

            let val_loss = self.evaluate(validation.x.view(), validation.y.view())?;
            if !val_loss.is_finite() {
                return Err(DemError::NonFiniteLoss {
                    stage: "validation",
                    epoch,
                    value: val_loss,
                });
            }
            epochs_run = epoch + 1;

            match stopper.observe(epoch, val_loss) {
                StopDecision::Improved => {
                    best = Some((self.hidden.clone(), self.heads.clone()));
                }
                StopDecision::Continue => {}
                StopDecision::Stop => {
                    stopped_early = true;
                    break;
                }
            }
        }

        if let Some((hidden, heads)) = best {
            self.hidden = hidden;
            self.heads = heads;
        }
        let report = TrainReport {
            epochs_run,
            best_epoch: stopper.best_epoch().unwrap_or(0),
            val_loss: stopper.best_loss(),
            stopped_early,
        };
        tracing::debug!(
            epochs_run = report.epochs_run,
            best_epoch = report.best_epoch,
            val_loss = report.val_loss,
            stopped_early = report.stopped_early,
            "member trained"
        );
        Ok(report)
    }
}

pub(crate) fn mean_loss(mode: DistributionMode, out: &Array2<f64>, y: ArrayView1<f64>) -> f64 {
    if y.is_empty() {
        return 0.0;
    }
    let n_out = out.ncols();
    let mut row = [0.0; 3];
    let total: f64 = y
        .iter()
        .enumerate()
        .map(|(i, &target)| {
            for k in 0..n_out {
                row[k] = out[[i, k]];
            }
            mode.loss(&row[..n_out], target)
        })
        .sum();
    total / y.len() as f64
}

fn add_gaussian_noise<R: Rng + ?Sized>(
    x: &mut Array2<f64>,
    std_dev: f64,
    rng: &mut R,
) -> DemResult<()> {
    if std_dev <= 0.0 {
        return Ok(());
    }
    let normal =
        Normal::new(0.0, std_dev).map_err(|e| DemError::config(format!("input noise: {}", e)))?;
    x.mapv_inplace(|v| v + normal.sample(rng));
    Ok(())
}

/// Inverted dropout: kept units are scaled by `1 / (1 - rate)`.
fn dropout_mask<R: Rng + ?Sized>(
    dim: (usize, usize),
    rate: f64,
    rng: &mut R,
) -> Option<Array2<f64>> {
    if rate <= 0.0 {
        return None;
    }
    let keep = 1.0 - rate;
    Some(Array2::from_shape_fn(dim, |_| {
        if rng.random::<f64>() < keep {
            1.0 / keep
        } else {
            0.0
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ndarray::{Array1, Array2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(mode: DistributionMode) -> MemberConfig {
        MemberConfig {
            mode,
            hidden: vec![8],
            activation: Activation::Tanh,
            dropout: 0.0,
            noise_in: 0.0,
            noise_mu: 0.0,
            noise_sigma: 0.0,
            noise_alpha: 0.0,
            reg_hidden: Regularizer::default(),
            reg_mu: Regularizer::default(),
            reg_sigma: Regularizer::default(),
            reg_alpha: Regularizer::default(),
            lr: 0.01,
            batch_size: 16,
            epochs: 60,
            patience: 60,
            min_delta: 0.0,
        }
    }

    fn linear_dataset(n: usize, offset: usize) -> Dataset {
        let start = NaiveDate::from_ymd_opt(1980, 1, 1).unwrap();
        let x = Array2::from_shape_fn((n, 2), |(i, j)| {
            let t = (i + offset) as f64 / n as f64;
            if j == 0 {
                t
            } else {
                1.0 - t
            }
        });
        let y: Array1<f64> = x.column(0).mapv(|v| 2.0 * v - 0.5);
        let time = (0..n)
            .map(|i| start + chrono::Days::new((i + offset) as u64))
            .collect();
        Dataset::new(x, y, time).unwrap()
    }

    #[test]
    fn build_creates_one_head_per_output() {
        let mut rng = StdRng::seed_from_u64(1);
        for mode in [
            DistributionMode::None,
            DistributionMode::Normal,
            DistributionMode::Skewed,
        ] {
            let member = EnsembleMember::build(4, &config(mode), &mut rng);
            assert_eq!(member.n_outputs(), mode.n_outputs());
            assert_eq!(member.mode().unwrap(), mode);
            member.check().unwrap();
        }
    }

    #[test]
    fn predict_rejects_wrong_feature_count() {
        let mut rng = StdRng::seed_from_u64(2);
        let member = EnsembleMember::build(3, &config(DistributionMode::Normal), &mut rng);
        let x = Array2::zeros((5, 4));
        assert!(matches!(member.predict(x.view()), Err(DemError::Shape(_))));
    }

    #[test]
    fn std_head_is_positive() {
        let mut rng = StdRng::seed_from_u64(3);
        let member = EnsembleMember::build(2, &config(DistributionMode::Normal), &mut rng);
        let x = Array2::from_shape_fn((10, 2), |(i, j)| (i as f64 - 5.0) * (j as f64 + 1.0));
        let out = member.predict(x.view()).unwrap();
        assert!(out.column(1).iter().all(|s| *s > 0.0));
    }

    #[test]
    fn training_reduces_validation_loss() {
        let mut rng = StdRng::seed_from_u64(4);
        let cfg = config(DistributionMode::None);
        let train = linear_dataset(64, 0);
        let val = linear_dataset(16, 3);
        let mut member = EnsembleMember::build(2, &cfg, &mut rng);
        let before = member.evaluate(val.x.view(), val.y.view()).unwrap();
        let report = member.train(&cfg, &train, &val, &mut rng).unwrap();
        let after = member.evaluate(val.x.view(), val.y.view()).unwrap();
        assert!(after < before, "{} !< {}", after, before);
        assert!((after - report.val_loss).abs() < 1e-12);
    }

    #[test]
    fn noise_and_dropout_train_without_errors() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut cfg = config(DistributionMode::Normal);
        cfg.dropout = 0.2;
        cfg.noise_in = 0.05;
        cfg.noise_mu = 0.01;
        cfg.epochs = 5;
        cfg.reg_hidden = Regularizer::new(1e-4, 1e-4);
        let train = linear_dataset(32, 0);
        let val = linear_dataset(8, 1);
        let mut member = EnsembleMember::build(2, &cfg, &mut rng);
        let report = member.train(&cfg, &train, &val, &mut rng).unwrap();
        assert!(report.epochs_run >= 1 && report.epochs_run <= 5);
        assert!(report.val_loss.is_finite());
    }

    #[test]
    fn config_rejects_tuple_width_mismatch() {
        let params = FixedParams::new()
            .with("layers", 2i64)
            .with("neurons", HyperValue::Tuple(vec![4, 4, 4]));
        assert!(MemberConfig::from_params(&params, DistributionMode::Normal)
            .unwrap_err()
            .is_config());
    }
}
