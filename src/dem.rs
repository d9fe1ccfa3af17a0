use std::borrow::Cow;
use std::fs;
use std::path::Path;
use std::time::Instant;

use ndarray::{s, Array3, ArrayView1, ArrayView2};
use rand::RngCore;

use crate::dataset::{segment_blocks, Dataset};
use crate::dist::{DistributionMode, MixtureForecast};
use crate::error::{DemError, DemResult};
use crate::evaluate::{gaussian_nll, rmse};
use crate::hyperparams::{FixedParams, HyperValue, HyperparameterSet, ParamInput};
use crate::model::ForecastModel;
use crate::network::{EnsembleMember, MemberConfig};
use crate::search::{SearchHistory, SearchRecord};

pub const HISTORY_FILE: &str = "hyperparameters_history.csv";
const MEMBER_PREFIX: &str = "member";
const MEMBER_EXT: &str = "json";

/// Defaults for every hyperparameter the model reads.
pub fn default_hyperparameters() -> FixedParams {
    FixedParams::new()
        .with("layers", 1i64)
        .with("neurons", 16i64)
        .with("dropout", 0.2)
        .with("noise_in", 0.0)
        .with("noise_mu", 0.0)
        .with("noise_sigma", 0.0)
        .with("noise_alpha", 0.0)
        .with("l1_hidden", 0.0)
        .with("l2_hidden", 0.0)
        .with("l1_mu", 0.0)
        .with("l2_mu", 0.0)
        .with("l1_sigma", 0.0)
        .with("l2_sigma", 0.0)
        .with("l1_alpha", 0.0)
        .with("l2_alpha", 0.0)
        .with("batch_size", 10i64)
        .with("n_segments", 5i64)
        .with("n_members_segment", 1i64)
        .with("lr", 0.001)
        .with("patience", 10i64)
        .with("epochs", 100i64)
        .with("min_delta", 0.0)
        .with("pdf", "normal")
        .with("activation", "relu")
        .with("name", "dem")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Unbuilt,
    Fitted,
    Saved,
    Loaded,
}

/// Ensemble of independently trained members whose predictive
/// distributions are mixed with equal weight.
#[derive(Debug, Clone)]
pub struct DeepEnsembleModel {
    params: HyperparameterSet,
    mode: DistributionMode,
    ensemble: Vec<EnsembleMember>,
    val_losses: Vec<f64>,
    mean_val_loss: Option<f64>,
    history: Option<SearchHistory>,
    state: ModelState,
}

impl Default for DeepEnsembleModel {
    fn default() -> Self {
        Self {
            params: HyperparameterSet::new(default_hyperparameters()),
            mode: DistributionMode::Normal,
            ensemble: Vec::new(),
            val_losses: Vec::new(),
            mean_val_loss: None,
            history: None,
            state: ModelState::Unbuilt,
        }
    }
}

impl DeepEnsembleModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `values`.
    pub fn with_hyperparameters<I, K>(values: I) -> DemResult<Self>
    where
        I: IntoIterator<Item = (K, ParamInput)>,
        K: AsRef<str>,
    {
        let mut model = Self::new();
        ForecastModel::set_hyperparameters(&mut model, values)?;
        Ok(model)
    }

    pub fn from_toml(table: &toml::Table) -> DemResult<Self> {
        let mut model = Self::new();
        model.params.set_from_toml(table)?;
        model.refresh_mode()?;
        Ok(model)
    }

    pub fn mode(&self) -> DistributionMode {
        self.mode
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn members(&self) -> &[EnsembleMember] {
        &self.ensemble
    }

    pub fn n_members(&self) -> usize {
        self.ensemble.len()
    }

    pub fn val_losses(&self) -> &[f64] {
        &self.val_losses
    }

    pub fn search_history(&self) -> Option<&SearchHistory> {
        self.history.as_ref()
    }

    fn refresh_mode(&mut self) -> DemResult<()> {
        if let Some(HyperValue::Text(pdf)) = self.params.fixed.get("pdf") {
            self.mode = DistributionMode::from_pdf(pdf)?;
        }
        Ok(())
    }

    /// Score a forecast: RMSE for point forecasts, Gaussian NLL when a
    /// standard deviation is supplied.
    pub fn evaluate(
        y: ArrayView1<f64>,
        mean: ArrayView1<f64>,
        std: Option<ArrayView1<f64>>,
    ) -> DemResult<f64> {
        match std {
            None => rmse(y, mean),
            Some(std) => gaussian_nll(y, mean, std),
        }
    }

    /// One model holding the members of every listed cell.
    pub fn load_combined<S: AsRef<str>>(location: &Path, dir_names: &[S]) -> DemResult<Self> {
        let mut combined: Option<Self> = None;
        for dir_name in dir_names {
            let mut part = Self::new();
            part.load(location, dir_name.as_ref())?;
            match combined.as_mut() {
                None => combined = Some(part),
                Some(model) => {
                    if model.mode != part.mode {
                        return Err(DemError::Corrupt(format!(
                            "{} holds {} members, earlier cells hold {}",
                            dir_name.as_ref(),
                            part.mode,
                            model.mode
                        )));
                    }
                    if model.ensemble[0].n_features() != part.ensemble[0].n_features() {
                        return Err(DemError::Shape(format!(
                            "{} expects {} features, earlier cells {}",
                            dir_name.as_ref(),
                            part.ensemble[0].n_features(),
                            model.ensemble[0].n_features()
                        )));
                    }
                    model.ensemble.extend(part.ensemble);
                }
            }
        }
        let model =
            combined.ok_or_else(|| DemError::config("load_combined needs at least one cell"))?;
        tracing::info!(
            cells = dir_names.len(),
            n_members = model.ensemble.len(),
            mode = %model.mode,
            "combined ensemble loaded"
        );
        Ok(model)
    }

    fn member_file(index: usize) -> String {
        format!("{}{}.{}", MEMBER_PREFIX, index, MEMBER_EXT)
    }

    fn member_index(file_name: &str) -> Option<usize> {
        file_name
            .strip_prefix(MEMBER_PREFIX)?
            .strip_suffix(MEMBER_EXT)?
            .strip_suffix('.')?
            .parse()
            .ok()
    }
}

impl ForecastModel for DeepEnsembleModel {
    type Prediction = MixtureForecast;

    fn name(&self) -> &str {
        self.params.fixed.text("name").unwrap_or("dem")
    }

    fn hyperparameters(&self) -> &HyperparameterSet {
        &self.params
    }

    fn hyperparameters_mut(&mut self) -> &mut HyperparameterSet {
        &mut self.params
    }

    fn set_hyperparameters<I, K>(&mut self, values: I) -> DemResult<()>
    where
        I: IntoIterator<Item = (K, ParamInput)>,
        K: AsRef<str>,
    {
        self.params.set_hyperparameters(values)?;
        self.refresh_mode()
    }

    fn fit(
        &mut self,
        train: &Dataset,
        validation: Option<&Dataset>,
        rng: &mut dyn RngCore,
    ) -> DemResult<()> {
        let fixed = &self.params.fixed;
        let mode = DistributionMode::from_pdf(fixed.text("pdf")?)?;
        let cfg = MemberConfig::from_params(fixed, mode)?;
        let n_segments = fixed.usize("n_segments")?;
        let n_members_segment = fixed.usize("n_members_segment")?;
        if n_members_segment == 0 {
            return Err(DemError::config("n_members_segment must be >= 1"));
        }
        if train.is_empty() {
            return Err(DemError::Shape("training set is empty".to_string()));
        }
        if let Some(val) = validation {
            if val.n_features() != train.n_features() {
                return Err(DemError::Shape(format!(
                    "validation has {} features, training {}",
                    val.n_features(),
                    train.n_features()
                )));
            }
        }

        let blocks = match n_segments {
            0 => return Err(DemError::config("n_segments must be >= 1")),
            1 => {
                if validation.is_none() {
                    return Err(DemError::MissingValidationData(
                        "n_segments = 1 requires an explicit validation set".to_string(),
                    ));
                }
                Vec::new()
            }
            _ => {
                if validation.is_some() {
                    tracing::warn!(
                        n_segments,
                        "validation set ignored; members validate on held-out segments"
                    );
                }
                segment_blocks(train.len(), n_segments)?
            }
        };

        let n_members = n_segments * n_members_segment;
        let started = Instant::now();
        let mut ensemble = Vec::with_capacity(n_members);
        let mut val_losses = Vec::with_capacity(n_members);

        for repeat in 0..n_members_segment {
            for segment in 0..n_segments {
                let (member_train, member_val): (Cow<Dataset>, Cow<Dataset>) =
                    match (blocks.get(segment), validation) {
                        (Some(block), _) => (
                            Cow::Owned(train.without_rows(block.clone())),
                            Cow::Owned(train.rows(block.clone())),
                        ),
                        (None, Some(val)) => (Cow::Borrowed(train), Cow::Borrowed(val)),
                        (None, None) => {
                            return Err(DemError::MissingValidationData(
                                "no validation rows for member".to_string(),
                            ))
                        }
                    };

                let mut member = EnsembleMember::build(train.n_features(), &cfg, rng);
                let report = member.train(&cfg, &member_train, &member_val, rng)?;
                tracing::info!(
                    member = ensemble.len(),
                    repeat,
                    segment,
                    epochs = report.epochs_run,
                    val_loss = report.val_loss,
                    "ensemble member trained"
                );
                val_losses.push(report.val_loss);
                ensemble.push(member);
            }
        }
        debug_assert_eq!(ensemble.len(), n_members);

        let mean_val_loss = val_losses.iter().sum::<f64>() / val_losses.len() as f64;
        tracing::info!(
            n_members,
            mean_val_loss,
            compute_secs = started.elapsed().as_secs_f64(),
            loss = mode.loss_name(),
            "ensemble fit finished"
        );

        self.mode = mode;
        self.ensemble = ensemble;
        self.val_losses = val_losses;
        self.mean_val_loss = Some(mean_val_loss);
        self.state = ModelState::Fitted;
        Ok(())
    }

    fn mean_val_loss(&self) -> Option<f64> {
        self.mean_val_loss
    }

    fn predict(&self, x: ArrayView2<f64>) -> DemResult<MixtureForecast> {
        if self.ensemble.is_empty() {
            return Err(DemError::NotFitted("predict called before fit or load".to_string()));
        }
        let n_outputs = self.mode.n_outputs();
        let mut stacked = Array3::zeros((x.nrows(), n_outputs, self.ensemble.len()));
        for (m, member) in self.ensemble.iter().enumerate() {
            let out = member.predict(x)?;
            if out.ncols() != n_outputs {
                return Err(DemError::Shape(format!(
                    "member {} returns {} outputs, ensemble mode {} expects {}",
                    m,
                    out.ncols(),
                    self.mode,
                    n_outputs
                )));
            }
            stacked.slice_mut(s![.., .., m]).assign(&out);
        }
        self.mode.mixture(stacked.view())
    }

    fn save(&mut self, location: &Path, dir_name: &str) -> DemResult<()> {
        if self.ensemble.is_empty() {
            return Err(DemError::NotFitted("nothing to save".to_string()));
        }
        let dir = location.join(dir_name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        for (i, member) in self.ensemble.iter().enumerate() {
            let json = serde_json::to_string(member)?;
            fs::write(dir.join(Self::member_file(i)), json)?;
        }

        let history = self.history.clone().unwrap_or_else(|| {
            let mut h = SearchHistory::new();
            h.push(SearchRecord {
                iteration: 0,
                params: self.params.fixed.clone(),
                mean_val_loss: self.mean_val_loss.unwrap_or(f64::NAN),
            });
            h
        });
        history.write_csv(&dir.join(HISTORY_FILE))?;

        tracing::info!(
            dir = %dir.display(),
            n_members = self.ensemble.len(),
            "ensemble saved"
        );
        self.state = ModelState::Saved;
        Ok(())
    }

    fn load(&mut self, location: &Path, dir_name: &str) -> DemResult<()> {
        let dir = location.join(dir_name);
        let mut files: Vec<(usize, std::path::PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let index = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(Self::member_index);
            if let Some(index) = index {
                files.push((index, path));
            }
        }
        if files.is_empty() {
            return Err(DemError::Corrupt(format!(
                "{} contains no member files",
                dir.display()
            )));
        }
        files.sort_by_key(|(index, _)| *index);

        let mut ensemble = Vec::with_capacity(files.len());
        for (_, path) in &files {
            let member: EnsembleMember = serde_json::from_str(&fs::read_to_string(path)?)?;
            member.check()?;
            ensemble.push(member);
        }
        let mode = ensemble[0].mode()?;
        let n_features = ensemble[0].n_features();
        if ensemble
            .iter()
            .any(|m| m.n_outputs() != mode.n_outputs() || m.n_features() != n_features)
        {
            return Err(DemError::Corrupt(format!(
                "members in {} disagree on input or output width",
                dir.display()
            )));
        }

        let history_path = dir.join(HISTORY_FILE);
        self.history = if history_path.exists() {
            Some(SearchHistory::read_csv(&history_path)?)
        } else {
            None
        };
        // Hyperparameters of this instance did not produce the loaded members.
        let name = self.name().to_string();
        self.params = HyperparameterSet::new(
            default_hyperparameters()
                .with("pdf", mode.as_str())
                .with("name", name.as_str()),
        );
        self.mode = mode;
        self.ensemble = ensemble;
        self.val_losses.clear();
        self.mean_val_loss = None;
        self.state = ModelState::Loaded;
        tracing::debug!(dir = %dir.display(), n_members = self.ensemble.len(), %mode, "ensemble loaded");
        Ok(())
    }

    fn set_search_history(&mut self, history: SearchHistory) {
        self.history = Some(history);
    }
}
