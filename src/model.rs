use std::path::Path;

use ndarray::ArrayView2;
use rand::RngCore;

use crate::dataset::Dataset;
use crate::error::DemResult;
use crate::hyperparams::{FixedParams, HyperparameterSet, ParamInput, SearchSpace};
use crate::search::SearchHistory;

/// Contract between a trainable forecaster and the search / cross-training
/// drivers.
pub trait ForecastModel {
    type Prediction;

    fn name(&self) -> &str;

    fn hyperparameters(&self) -> &HyperparameterSet;

    fn hyperparameters_mut(&mut self) -> &mut HyperparameterSet;

    fn params(&self) -> &FixedParams {
        &self.hyperparameters().fixed
    }

    fn search_space(&self) -> &SearchSpace {
        &self.hyperparameters().search
    }

    fn set_hyperparameters<I, K>(&mut self, values: I) -> DemResult<()>
    where
        I: IntoIterator<Item = (K, ParamInput)>,
        K: AsRef<str>,
    {
        self.hyperparameters_mut().set_hyperparameters(values)
    }

    /// Train from scratch with the current fixed hyperparameters.
    fn fit(
        &mut self,
        train: &Dataset,
        validation: Option<&Dataset>,
        rng: &mut dyn RngCore,
    ) -> DemResult<()>;

    /// Mean validation loss of the last `fit`, if any.
    fn mean_val_loss(&self) -> Option<f64>;

    fn predict(&self, x: ArrayView2<f64>) -> DemResult<Self::Prediction>;

    fn save(&mut self, location: &Path, dir_name: &str) -> DemResult<()>;

    fn load(&mut self, location: &Path, dir_name: &str) -> DemResult<()>;

    fn set_search_history(&mut self, history: SearchHistory);
}
