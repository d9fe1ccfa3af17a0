use std::time::Instant;

use rand::RngCore;

use crate::dataset::Dataset;
use crate::error::{DemError, DemResult};
use crate::hyperparams::FixedParams;
use crate::model::ForecastModel;
use crate::search::history::{SearchHistory, SearchRecord};

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub best_loss: f64,
    pub best_params: FixedParams,
    pub history: SearchHistory,
    /// Best loss seen after each trial.
    pub best_loss_trace: Vec<f64>,
}

/// Randomized hyperparameter search.
///
/// Every trial samples each searchable key, fits from scratch and records the
/// mean validation loss. Unless `n_iter == 1` the best assignment is restored
/// and the model refitted, so it leaves the call trained on the best
/// parameters found. Without searchable keys the fixed configuration is
/// fitted exactly once.
pub fn fit_randomized_search<M: ForecastModel>(
    model: &mut M,
    train: &Dataset,
    validation: Option<&Dataset>,
    n_iter: usize,
    rng: &mut dyn RngCore,
) -> DemResult<SearchOutcome> {
    if n_iter == 0 {
        return Err(DemError::config("n_iter must be >= 1"));
    }
    let keys: Vec<String> = model.search_space().keys().cloned().collect();
    let trials = if keys.is_empty() {
        tracing::warn!(
            model = model.name(),
            n_iter,
            "no searchable hyperparameters; fitting the fixed configuration once"
        );
        1
    } else {
        n_iter
    };

    let started = Instant::now();
    let mut history = SearchHistory::new();
    let mut trace = Vec::with_capacity(trials);
    let mut best_loss = f64::INFINITY;
    let mut best_params = model.params().clone();

    for iteration in 0..trials {
        for key in &keys {
            let value = model.search_space().sample_one(key, rng)?;
            model.hyperparameters_mut().fixed.insert(key, value);
        }
        tracing::debug!(iteration, params = %model.params(), "search trial");

        model.fit(train, validation, rng)?;
        let loss = model
            .mean_val_loss()
            .ok_or_else(|| DemError::NotFitted("fit left no validation loss".to_string()))?;
        history.push(SearchRecord {
            iteration,
            params: model.params().clone(),
            mean_val_loss: loss,
        });

        if loss < best_loss {
            best_loss = loss;
            best_params = model.params().clone();
            tracing::info!(iteration, best_loss, "new best hyperparameters");
        }
        trace.push(best_loss);
    }

    if trials != 1 {
        model.hyperparameters_mut().fixed = best_params.clone();
        tracing::info!(best_loss, params = %best_params, "refitting with best hyperparameters");
        model.fit(train, validation, rng)?;
    }
    model.set_search_history(history.clone());

    tracing::info!(
        model = model.name(),
        n_iter = trials,
        best_loss,
        compute_secs = started.elapsed().as_secs_f64(),
        "randomized search finished"
    );
    Ok(SearchOutcome {
        best_loss,
        best_params,
        history,
        best_loss_trace: trace,
    })
}
