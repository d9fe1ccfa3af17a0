use std::fmt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, NaiveDate};
use rand::RngCore;

use crate::model::ForecastModel;
use crate::pipeline::Pipeline;
use crate::search::fit_randomized_search;

/// First held-out year and the first year of the decade grid that follows it.
pub const FIRST_DECADE_START: i32 = 1963;
pub const DECADE_GRID_START: i32 = 1972;

/// Boundaries of the held-out periods, strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecadeTable {
    boundaries: Vec<i32>,
}

impl DecadeTable {
    pub fn new(boundaries: Vec<i32>) -> Result<Self> {
        if boundaries.len() < 2 {
            bail!("a decade table needs at least two boundaries");
        }
        if boundaries.windows(2).any(|w| w[0] >= w[1]) {
            bail!("decade boundaries must be strictly increasing: {:?}", boundaries);
        }
        Ok(Self { boundaries })
    }

    /// `1963, 1972, 1982, ..` up to (excluding) `start_year`, then `start_year`.
    pub fn from_start_year(start_year: i32) -> Result<Self> {
        let mut boundaries = vec![FIRST_DECADE_START];
        boundaries.extend((DECADE_GRID_START..start_year).step_by(10));
        boundaries.push(start_year);
        Self::new(boundaries)
    }

    pub fn boundaries(&self) -> &[i32] {
        &self.boundaries
    }

    pub fn cells(&self) -> Vec<DecadeCell> {
        self.boundaries
            .windows(2)
            .map(|w| DecadeCell {
                start: w[0],
                end: w[1],
            })
            .collect()
    }
}

/// Held-out window `[start-01-01, end-01-01)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecadeCell {
    pub start: i32,
    pub end: i32,
}

impl DecadeCell {
    pub fn contains(&self, date: NaiveDate) -> bool {
        (self.start..self.end).contains(&date.year())
    }

    pub fn test_mask(&self, time: &[NaiveDate]) -> Vec<bool> {
        time.iter().map(|t| self.contains(*t)).collect()
    }
}

impl fmt::Display for DecadeCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-01-01..{}-01-01", self.start, self.end)
    }
}

pub fn cell_dir_name(model_name: &str, decade_start: i32, lead_time: u32) -> String {
    format!("{}_decade{}_lead{}", model_name, decade_start, lead_time)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellId {
    pub lead_time: u32,
    pub decade_start: i32,
    pub dir_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrossTrainingReport {
    pub trained: Vec<CellId>,
    pub skipped: Vec<CellId>,
}

fn is_populated(path: &Path) -> Result<bool> {
    if !path.is_dir() {
        return Ok(false);
    }
    let mut entries =
        std::fs::read_dir(path).with_context(|| format!("failed to list {}", path.display()))?;
    Ok(entries.next().is_some())
}

/// Leave-one-decade-out training over every lead time.
///
/// Cells whose directory already holds files are skipped, so an interrupted
/// run resumes where it stopped. Two runs sharing `model_dir` are not
/// coordinated and may both train the same cell.
pub fn cross_training<M, F, P>(
    mut factory: F,
    pipeline: &P,
    n_iter: usize,
    lead_times: &[u32],
    decades: &DecadeTable,
    model_dir: &Path,
    rng: &mut dyn RngCore,
) -> Result<CrossTrainingReport>
where
    M: ForecastModel,
    F: FnMut() -> M,
    P: Pipeline + ?Sized,
{
    let mut report = CrossTrainingReport::default();
    for &lead_time in lead_times {
        let data = pipeline
            .load(lead_time, false)
            .with_context(|| format!("pipeline failed for lead time {}", lead_time))?
            .dataset;
        tracing::info!(lead_time, rows = data.len(), "cross training lead time");

        for cell in decades.cells() {
            let mut model = factory();
            let dir_name = cell_dir_name(model.name(), cell.start, lead_time);
            let id = CellId {
                lead_time,
                decade_start: cell.start,
                dir_name: dir_name.clone(),
            };
            if is_populated(&model_dir.join(&dir_name))? {
                tracing::info!(dir = %dir_name, "cell already trained, skipping");
                report.skipped.push(id);
                continue;
            }

            let test_mask = cell.test_mask(&data.time);
            let train_mask: Vec<bool> = test_mask.iter().map(|t| !t).collect();
            let train = data.select(&train_mask)?;
            tracing::info!(
                lead_time,
                test_period = %cell,
                train_rows = train.len(),
                test_rows = data.len() - train.len(),
                "training cell"
            );

            let outcome = fit_randomized_search(&mut model, &train, None, n_iter, rng)
                .with_context(|| format!("training {} failed", dir_name))?;
            model
                .save(model_dir, &dir_name)
                .with_context(|| format!("failed to save {}", dir_name))?;
            tracing::info!(dir = %dir_name, best_loss = outcome.best_loss, "cell saved");
            report.trained.push(id);
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_year_table_matches_decade_grid() {
        let table = DecadeTable::from_start_year(2019).unwrap();
        assert_eq!(
            table.boundaries(),
            &[1963, 1972, 1982, 1992, 2002, 2012, 2019]
        );
        let early = DecadeTable::from_start_year(1972).unwrap();
        assert_eq!(early.boundaries(), &[1963, 1972]);
        assert!(DecadeTable::from_start_year(1960).is_err());
    }

    #[test]
    fn cells_are_half_open() {
        let cell = DecadeCell {
            start: 1972,
            end: 1982,
        };
        assert!(cell.contains(NaiveDate::from_ymd_opt(1972, 1, 1).unwrap()));
        assert!(cell.contains(NaiveDate::from_ymd_opt(1981, 12, 1).unwrap()));
        assert!(!cell.contains(NaiveDate::from_ymd_opt(1982, 1, 1).unwrap()));
    }

    #[test]
    fn rejects_unsorted_boundaries() {
        assert!(DecadeTable::new(vec![1972, 1963]).is_err());
        assert!(DecadeTable::new(vec![1963]).is_err());
    }

    #[test]
    fn dir_names_follow_cell_layout() {
        assert_eq!(cell_dir_name("gdnn", 1982, 3), "gdnn_decade1982_lead3");
    }
}
