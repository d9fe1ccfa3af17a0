use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cross_training::DecadeTable;
use crate::dem::DeepEnsembleModel;
use crate::hyperparams::{HyperValue, ParamInput};
use crate::model::ForecastModel;
use crate::pipeline::{CsvColumns, LagSettings};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const MODEL_DIR_ENV: &str = "ENSO_DEM_MODEL_DIR";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub data: DataConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// Fixed values and search specs, e.g. `neurons = [16, 64, "linear"]`.
    #[serde(default)]
    pub hyperparameters: toml::Table,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrainingConfig {
    pub n_iter: usize,
    pub lead_times: Vec<u32>,
    pub prediction_start_year: i32,
    pub model_dir: PathBuf,
    #[serde(default = "default_hindcast_csv")]
    pub hindcast_csv: PathBuf,
    /// Unset means a fresh entropy-seeded generator per run.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_hindcast_csv() -> PathBuf {
    PathBuf::from("data/hindcast.csv")
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    pub features_csv: PathBuf,
    #[serde(default = "default_date_column")]
    pub date_column: String,
    pub target_column: String,
    pub feature_columns: Vec<String>,
    #[serde(default = "default_lag")]
    pub n_lags: usize,
    #[serde(default = "default_lag")]
    pub step: usize,
    #[serde(default = "default_lag")]
    pub shift: usize,
}

fn default_date_column() -> String {
    "date".to_string()
}

fn default_lag() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl DataConfig {
    pub fn columns(&self) -> CsvColumns {
        CsvColumns {
            date: self.date_column.clone(),
            target: self.target_column.clone(),
            features: self.feature_columns.clone(),
        }
    }

    pub fn lags(&self) -> LagSettings {
        LagSettings {
            n_lags: self.n_lags,
            step: self.step,
            shift: self.shift,
        }
    }
}

impl TrainingConfig {
    pub fn decades(&self) -> Result<DecadeTable> {
        DecadeTable::from_start_year(self.prediction_start_year)
            .context("training.prediction_start_year is invalid")
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from_path(Path::new(DEFAULT_CONFIG_PATH))
    }

    pub fn load_from_path(config_path: &Path) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let mut config = Self::from_toml_str(&config_str)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;

        if let Ok(dir) = std::env::var(MODEL_DIR_ENV) {
            if !dir.trim().is_empty() {
                config.training.model_dir = PathBuf::from(dir);
            }
        }
        Ok(config)
    }

    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(config_str).context("invalid config toml")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.model.name.trim();
        if name.is_empty() || name.contains(['/', '\\']) {
            bail!("model.name must be a non-empty directory-safe name, got '{}'", self.model.name);
        }
        if self.training.n_iter == 0 {
            bail!("training.n_iter must be >= 1");
        }
        if self.training.lead_times.is_empty() {
            bail!("training.lead_times must list at least one lead time");
        }
        if self.data.feature_columns.is_empty() {
            bail!("data.feature_columns must not be empty");
        }
        if self.data.n_lags > 1 && self.data.step == 0 {
            bail!("data.step must be >= 1 when data.n_lags > 1");
        }
        self.training.decades()?;
        self.build_model().context("model.hyperparameters are invalid")?;
        Ok(())
    }

    /// Fresh, untrained model carrying the configured hyperparameters.
    pub fn build_model(&self) -> Result<DeepEnsembleModel> {
        let mut model = DeepEnsembleModel::from_toml(&self.model.hyperparameters)?;
        model.set_hyperparameters([(
            "name",
            ParamInput::Value(HyperValue::Text(self.model.name.trim().to_string())),
        )])?;
        Ok(model)
    }
}
