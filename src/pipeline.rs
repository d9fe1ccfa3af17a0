use std::io;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use ndarray::{concatenate, s, Array1, Array2, ArrayView2, Axis};

use crate::dataset::Dataset;

/// Features and labels for one lead time.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub dataset: Dataset,
    /// Label at observation time, aligned with `dataset` rows.
    pub persistence: Option<Array1<f64>>,
}

/// Source of training data for a lead time in months.
pub trait Pipeline {
    fn load(&self, lead_time: u32, return_persistence: bool) -> Result<PipelineOutput>;
}

impl<F> Pipeline for F
where
    F: Fn(u32, bool) -> Result<PipelineOutput>,
{
    fn load(&self, lead_time: u32, return_persistence: bool) -> Result<PipelineOutput> {
        self(lead_time, return_persistence)
    }
}

/// Stack `n_lags` copies of `x`, each shifted back by a further `step` rows.
///
/// Row `r` of the result is `[x[t], x[t - step], .., x[t - (n_lags-1)·step]]`
/// with `t = r + n_lags·step`.
pub fn include_time_lag(x: ArrayView2<f64>, n_lags: usize, step: usize) -> Result<Array2<f64>> {
    let n = x.nrows();
    let start = n_lags * step;
    if start > n {
        bail!(
            "cannot lag {} rows by {} lags of step {}",
            n,
            n_lags,
            step
        );
    }
    if n_lags > 1 && step == 0 {
        bail!("step must be >= 1 when n_lags > 1");
    }
    let mut blocks = vec![x.slice(s![start.., ..])];
    for i in 1..n_lags {
        blocks.push(x.slice(s![(n_lags - i) * step..n - i * step, ..]));
    }
    concatenate(Axis(1), &blocks).context("failed to stack lagged features")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LagSettings {
    pub n_lags: usize,
    pub step: usize,
    /// Offset between observation and the start of the lead-time count.
    pub shift: usize,
}

impl Default for LagSettings {
    fn default() -> Self {
        Self {
            n_lags: 3,
            step: 3,
            shift: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvColumns {
    pub date: String,
    pub target: String,
    pub features: Vec<String>,
}

/// Monthly feature table read from CSV, standard-scaled per column.
#[derive(Debug, Clone)]
pub struct CsvPipeline {
    dates: Vec<NaiveDate>,
    features: Array2<f64>,
    target: Array1<f64>,
    lags: LagSettings,
}

impl CsvPipeline {
    pub fn from_path(path: &Path, columns: &CsvColumns, lags: LagSettings) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Self::from_reader(file, columns, lags)
            .with_context(|| format!("failed to load features from {}", path.display()))
    }

    pub fn from_reader<R: io::Read>(
        reader: R,
        columns: &CsvColumns,
        lags: LagSettings,
    ) -> Result<Self> {
        if columns.features.is_empty() {
            bail!("at least one feature column is required");
        }
        let mut rdr = csv::Reader::from_reader(reader);
        let header = rdr.headers().context("failed to read csv header")?.clone();
        let position = |name: &str| {
            header
                .iter()
                .position(|h| h.trim() == name)
                .ok_or_else(|| anyhow!("column '{}' not found", name))
        };
        let date_idx = position(columns.date.as_str())?;
        let target_idx = position(columns.target.as_str())?;
        let feature_idx = columns
            .features
            .iter()
            .map(|name| position(name.as_str()))
            .collect::<Result<Vec<_>>>()?;

        let mut dates = Vec::new();
        let mut target = Vec::new();
        let mut raw = Vec::new();
        for (line, record) in rdr.records().enumerate() {
            let record = record.with_context(|| format!("bad csv record {}", line + 1))?;
            let cell = |idx: usize| record.get(idx).unwrap_or("").trim();
            dates.push(parse_month(cell(date_idx))?);
            let y = parse_number(cell(target_idx));
            if !y.is_finite() {
                bail!("target '{}' missing in row {}", columns.target, line + 1);
            }
            target.push(y);
            raw.extend(feature_idx.iter().map(|&idx| parse_number(cell(idx))));
        }
        if dates.windows(2).any(|w| w[0] >= w[1]) {
            bail!("dates must be strictly increasing");
        }

        let mut features = Array2::from_shape_vec((dates.len(), feature_idx.len()), raw)
            .context("feature table is ragged")?;
        standard_scale(&mut features);
        tracing::debug!(
            rows = dates.len(),
            features = feature_idx.len(),
            "feature table loaded"
        );

        Ok(Self {
            dates,
            features,
            target: Array1::from(target),
            lags,
        })
    }

    pub fn lags(&self) -> LagSettings {
        self.lags
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    /// Most recent lagged feature row, for an operational forecast issued at
    /// `last_date()`.
    pub fn latest_features(&self) -> Result<Array2<f64>> {
        let LagSettings { n_lags, step, .. } = self.lags;
        let lagged = include_time_lag(self.features.view(), n_lags, step)?;
        let n = lagged.nrows();
        if n == 0 {
            bail!("not enough rows for {} lags of step {}", n_lags, step);
        }
        Ok(lagged.slice(s![n - 1.., ..]).to_owned())
    }
}

impl Pipeline for CsvPipeline {
    fn load(&self, lead_time: u32, return_persistence: bool) -> Result<PipelineOutput> {
        let LagSettings {
            n_lags,
            step,
            shift,
        } = self.lags;
        let lead = lead_time as usize;
        let n = self.len();
        let offset = lead + n_lags * step + shift;
        if offset >= n {
            bail!(
                "{} rows are too few for lead time {} (need more than {})",
                n,
                lead_time,
                offset
            );
        }

        let x = include_time_lag(self.features.slice(s![..n - lead - shift, ..]), n_lags, step)?;
        let y = self.target.slice(s![offset..]).to_owned();
        let time = self.dates[offset..].to_vec();
        let persistence = return_persistence.then(|| {
            self.target
                .slice(s![n_lags * step..n - lead - shift])
                .to_owned()
        });
        let dataset = Dataset::new(x, y, time)?;
        Ok(PipelineOutput {
            dataset,
            persistence,
        })
    }
}

fn parse_month(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{}-01", value), "%Y-%m-%d"))
        .with_context(|| format!("invalid date '{}': expected YYYY-MM or YYYY-MM-DD", value))
}

fn parse_number(value: &str) -> f64 {
    if value.is_empty() {
        return f64::NAN;
    }
    value.parse().unwrap_or(f64::NAN)
}

/// Zero mean, unit variance per column over the finite entries; constant
/// columns keep unit scale. Missing values end up at zero.
fn standard_scale(x: &mut Array2<f64>) {
    for mut col in x.axis_iter_mut(Axis(1)) {
        let finite: Vec<f64> = col.iter().copied().filter(|v| v.is_finite()).collect();
        let (mean, std) = if finite.is_empty() {
            (0.0, 1.0)
        } else {
            let n = finite.len() as f64;
            let mean = finite.iter().sum::<f64>() / n;
            let var = finite.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
            let std = if var > 0.0 { var.sqrt() } else { 1.0 };
            (mean, std)
        };
        col.mapv_inplace(|v| if v.is_finite() { (v - mean) / std } else { 0.0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn time_lag_stacks_shifted_blocks() {
        let x = Array2::from_shape_fn((10, 1), |(i, _)| i as f64);
        let lagged = include_time_lag(x.view(), 3, 2).unwrap();
        assert_eq!(lagged.dim(), (4, 3));
        assert_eq!(lagged.row(0).to_vec(), vec![6.0, 4.0, 2.0]);
        assert_eq!(lagged.row(3).to_vec(), vec![9.0, 7.0, 5.0]);
    }

    #[test]
    fn zero_lags_is_identity() {
        let x = array![[1.0, 2.0], [3.0, 4.0]];
        assert_eq!(include_time_lag(x.view(), 0, 3).unwrap(), x);
    }

    #[test]
    fn scaling_handles_nan_and_constant_columns() {
        let mut x = array![[1.0, 5.0], [f64::NAN, 5.0], [3.0, 5.0]];
        standard_scale(&mut x);
        assert_eq!(x.column(0).to_vec(), vec![-1.0, 0.0, 1.0]);
        assert_eq!(x.column(1).to_vec(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn month_dates_parse_both_forms() {
        let d = NaiveDate::from_ymd_opt(1982, 7, 1).unwrap();
        assert_eq!(parse_month("1982-07").unwrap(), d);
        assert_eq!(parse_month("1982-07-01").unwrap(), d);
        assert!(parse_month("July 1982").is_err());
    }
}
