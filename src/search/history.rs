use std::collections::BTreeSet;
use std::path::Path;

use crate::error::{DemError, DemResult};
use crate::hyperparams::{FixedParams, HyperValue};

/// One search trial: the sampled assignment and its mean validation loss.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRecord {
    pub iteration: usize,
    pub params: FixedParams,
    pub mean_val_loss: f64,
}

/// Table of search trials, persisted next to the ensemble as CSV with the
/// columns `iteration, mean_val_loss, <hyperparameter>...`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHistory {
    records: Vec<SearchRecord>,
}

impl SearchHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: SearchRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[SearchRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Lowest loss; the earliest trial wins ties.
    pub fn best(&self) -> Option<&SearchRecord> {
        self.records.iter().fold(None, |best, r| match best {
            Some(b) if b.mean_val_loss <= r.mean_val_loss => Some(b),
            _ if r.mean_val_loss.is_nan() => best,
            _ => Some(r),
        })
    }

    fn columns(&self) -> Vec<String> {
        let keys: BTreeSet<&String> = self
            .records
            .iter()
            .flat_map(|r| r.params.iter().map(|(k, _)| k))
            .collect();
        keys.into_iter().cloned().collect()
    }

    pub fn write_csv(&self, path: &Path) -> DemResult<()> {
        let columns = self.columns();
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec!["iteration".to_string(), "mean_val_loss".to_string()];
        header.extend(columns.iter().cloned());
        writer.write_record(&header)?;
        for r in &self.records {
            let mut row = vec![r.iteration.to_string(), r.mean_val_loss.to_string()];
            row.extend(
                columns
                    .iter()
                    .map(|k| r.params.get(k).map(|v| v.to_string()).unwrap_or_default()),
            );
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> DemResult<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let header = reader.headers()?.clone();
        if header.get(0) != Some("iteration") || header.get(1) != Some("mean_val_loss") {
            return Err(DemError::Corrupt(format!(
                "{} does not start with iteration,mean_val_loss",
                path.display()
            )));
        }

        let mut history = Self::new();
        for row in reader.records() {
            let row = row?;
            let iteration = row
                .get(0)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or_else(|| DemError::Corrupt(format!("bad iteration in {}", path.display())))?;
            let mean_val_loss = row
                .get(1)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .ok_or_else(|| DemError::Corrupt(format!("bad loss in {}", path.display())))?;
            let mut params = FixedParams::new();
            for (key, cell) in header.iter().zip(row.iter()).skip(2) {
                if cell.is_empty() {
                    continue;
                }
                let value: HyperValue = cell.parse()?;
                params.insert(key, value);
            }
            history.push(SearchRecord {
                iteration,
                params,
                mean_val_loss,
            });
        }
        Ok(history)
    }
}
