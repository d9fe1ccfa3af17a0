use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use ndarray::{concatenate, Array1, ArrayView2, Axis};
use serde::Serialize;

use crate::cross_training::{cell_dir_name, DecadeTable};
use crate::dem::DeepEnsembleModel;
use crate::evaluate::{gaussian_nll, pearson_correlation, rmse};
use crate::model::ForecastModel;
use crate::pipeline::Pipeline;

/// Out-of-sample predictions for one lead time, assembled from the cells
/// that held each decade out.
#[derive(Debug, Clone)]
pub struct LeadHindcast {
    pub lead_time: u32,
    pub observed: Array1<f64>,
    pub mean: Array1<f64>,
    pub std: Option<Array1<f64>>,
    pub persistence: Option<Array1<f64>>,
}

#[derive(Debug, Clone)]
pub struct Hindcast {
    pub time: Vec<NaiveDate>,
    pub leads: Vec<LeadHindcast>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadSkill {
    pub lead_time: u32,
    pub rmse: f64,
    pub correlation: f64,
    pub nll: Option<f64>,
    pub persistence_rmse: Option<f64>,
}

#[derive(Debug, Serialize)]
struct HindcastRow {
    target_time: NaiveDate,
    lead_time: u32,
    observed: f64,
    mean: f64,
    std: Option<f64>,
    persistence: Option<f64>,
}

/// Predict every decade with the ensemble that never saw it.
pub fn cross_hindcast<P: Pipeline + ?Sized>(
    pipeline: &P,
    model_name: &str,
    lead_times: &[u32],
    decades: &DecadeTable,
    model_dir: &Path,
) -> Result<Hindcast> {
    let mut time_axis: Option<Vec<NaiveDate>> = None;
    let mut leads = Vec::with_capacity(lead_times.len());

    for &lead_time in lead_times {
        let output = pipeline
            .load(lead_time, true)
            .with_context(|| format!("pipeline failed for lead time {}", lead_time))?;
        let data = output.dataset;

        let mut time = Vec::new();
        let mut observed = Vec::new();
        let mut persistence = Vec::new();
        let mut means = Vec::new();
        let mut stds = Vec::new();

        for cell in decades.cells() {
            let mask = cell.test_mask(&data.time);
            let test = data.select(&mask)?;
            if test.is_empty() {
                continue;
            }
            let dir_name = cell_dir_name(model_name, cell.start, lead_time);
            let mut model = DeepEnsembleModel::new();
            model
                .load(model_dir, &dir_name)
                .with_context(|| format!("failed to load {}", dir_name))?;
            let forecast = model.predict(test.x.view())?;
            tracing::debug!(dir = %dir_name, rows = test.len(), "hindcast cell predicted");

            time.extend_from_slice(&test.time);
            observed.push(test.y);
            means.push(forecast.mean().clone());
            if let Some(std) = forecast.std() {
                stds.push(std.clone());
            }
            if let Some(p) = &output.persistence {
                let picked: Vec<f64> = p
                    .iter()
                    .zip(&mask)
                    .filter_map(|(v, keep)| keep.then_some(*v))
                    .collect();
                persistence.push(Array1::from(picked));
            }
        }
        if time.is_empty() {
            bail!("lead time {} has no rows inside the decade table", lead_time);
        }
        if !stds.is_empty() && stds.len() != means.len() {
            bail!("lead time {} mixes point and probabilistic cells", lead_time);
        }

        if time_axis.is_none() {
            time_axis = Some(time);
        } else if time_axis.as_ref() != Some(&time) {
            bail!(
                "lead time {} covers {} target dates, earlier leads cover {}",
                lead_time,
                time.len(),
                time_axis.as_ref().map_or(0, Vec::len)
            );
        }

        leads.push(LeadHindcast {
            lead_time,
            observed: stack(&observed)?,
            mean: stack(&means)?,
            std: if stds.is_empty() {
                None
            } else {
                Some(stack(&stds)?)
            },
            persistence: if persistence.is_empty() {
                None
            } else {
                Some(stack(&persistence)?)
            },
        });
        tracing::info!(lead_time, "hindcast assembled");
    }

    Ok(Hindcast {
        time: time_axis.unwrap_or_default(),
        leads,
    })
}

fn stack(parts: &[Array1<f64>]) -> Result<Array1<f64>> {
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    concatenate(Axis(0), &views).context("failed to concatenate hindcast pieces")
}

impl Hindcast {
    pub fn skill(&self) -> Result<Vec<LeadSkill>> {
        self.leads
            .iter()
            .map(|lead| -> Result<LeadSkill> {
                let nll = match &lead.std {
                    Some(std) => Some(gaussian_nll(
                        lead.observed.view(),
                        lead.mean.view(),
                        std.view(),
                    )?),
                    None => None,
                };
                let persistence_rmse = match &lead.persistence {
                    Some(p) => Some(rmse(lead.observed.view(), p.view())?),
                    None => None,
                };
                Ok(LeadSkill {
                    lead_time: lead.lead_time,
                    rmse: rmse(lead.observed.view(), lead.mean.view())?,
                    correlation: pearson_correlation(lead.observed.view(), lead.mean.view())?,
                    nll,
                    persistence_rmse,
                })
            })
            .collect()
    }

    /// Long-format table: one row per target date and lead time.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        for lead in &self.leads {
            for (i, target_time) in self.time.iter().enumerate() {
                writer.serialize(HindcastRow {
                    target_time: *target_time,
                    lead_time: lead.lead_time,
                    observed: lead.observed[i],
                    mean: lead.mean[i],
                    std: lead.std.as_ref().map(|s| s[i]),
                    persistence: lead.persistence.as_ref().map(|p| p[i]),
                })?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadForecast {
    pub lead_time: u32,
    pub mean: f64,
    pub std: Option<f64>,
}

/// Operational forecast: every decade ensemble of a lead time is combined
/// and applied to the latest feature row.
pub fn forecast(
    model_name: &str,
    lead_times: &[u32],
    decades: &DecadeTable,
    model_dir: &Path,
    features: ArrayView2<f64>,
) -> Result<Vec<LeadForecast>> {
    if features.nrows() == 0 {
        bail!("forecast needs one feature row");
    }
    let latest = features.slice(ndarray::s![features.nrows() - 1.., ..]);
    lead_times
        .iter()
        .map(|&lead_time| -> Result<LeadForecast> {
            let dirs: Vec<String> = decades
                .cells()
                .iter()
                .map(|cell| cell_dir_name(model_name, cell.start, lead_time))
                .collect();
            let model = DeepEnsembleModel::load_combined(model_dir, &dirs)
                .with_context(|| format!("failed to load ensembles for lead time {}", lead_time))?;
            let pred = model.predict(latest)?;
            let out = LeadForecast {
                lead_time,
                mean: pred.mean()[0],
                std: pred.std().map(|s| s[0]),
            };
            tracing::info!(
                lead_time,
                n_members = model.n_members(),
                mean = out.mean,
                std = ?out.std,
                "forecast"
            );
            Ok(out)
        })
        .collect()
}
