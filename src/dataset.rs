use std::ops::Range;

use chrono::NaiveDate;
use ndarray::{concatenate, Array1, Array2, Axis};

use crate::error::{DemError, DemResult};

/// Row-aligned features, labels and label times.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    pub time: Vec<NaiveDate>,
}

impl Dataset {
    pub fn new(x: Array2<f64>, y: Array1<f64>, time: Vec<NaiveDate>) -> DemResult<Self> {
        if x.nrows() != y.len() || y.len() != time.len() {
            return Err(DemError::Shape(format!(
                "X has {} rows, y {} and time {}",
                x.nrows(),
                y.len(),
                time.len()
            )));
        }
        Ok(Self { x, y, time })
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.x.ncols()
    }

    /// Rows where `mask` is true.
    pub fn select(&self, mask: &[bool]) -> DemResult<Self> {
        if mask.len() != self.len() {
            return Err(DemError::Shape(format!(
                "mask has {} entries for {} rows",
                mask.len(),
                self.len()
            )));
        }
        let idx: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, keep)| keep.then_some(i))
            .collect();
        Ok(self.take(&idx))
    }

    pub fn rows(&self, range: Range<usize>) -> Self {
        let idx: Vec<usize> = range.filter(|i| *i < self.len()).collect();
        self.take(&idx)
    }

    pub fn without_rows(&self, range: Range<usize>) -> Self {
        let idx: Vec<usize> = (0..self.len()).filter(|i| !range.contains(i)).collect();
        self.take(&idx)
    }

    /// Append `other` below `self`.
    pub fn concat(&self, other: &Dataset) -> DemResult<Self> {
        if self.n_features() != other.n_features() {
            return Err(DemError::Shape(format!(
                "cannot stack {} features onto {}",
                other.n_features(),
                self.n_features()
            )));
        }
        let x = concatenate(Axis(0), &[self.x.view(), other.x.view()])
            .map_err(|e| DemError::Shape(e.to_string()))?;
        let y = concatenate(Axis(0), &[self.y.view(), other.y.view()])
            .map_err(|e| DemError::Shape(e.to_string()))?;
        let mut time = self.time.clone();
        time.extend_from_slice(&other.time);
        Ok(Self { x, y, time })
    }

    fn take(&self, idx: &[usize]) -> Self {
        Self {
            x: self.x.select(Axis(0), idx),
            y: self.y.select(Axis(0), idx),
            time: idx.iter().map(|&i| self.time[i]).collect(),
        }
    }
}

/// Contiguous validation blocks for `n_segments`-fold member generation.
///
/// Blocks have length `n_rows / n_segments`; trailing rows beyond
/// `n_segments * len` are never used for validation.
pub fn segment_blocks(n_rows: usize, n_segments: usize) -> DemResult<Vec<Range<usize>>> {
    if n_segments == 0 {
        return Err(DemError::config("n_segments must be >= 1"));
    }
    let segment_len = n_rows / n_segments;
    if segment_len == 0 {
        return Err(DemError::config(format!(
            "{} rows cannot be split into {} segments",
            n_rows, n_segments
        )));
    }
    Ok((0..n_segments)
        .map(|i| i * segment_len..(i + 1) * segment_len)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn dates(n: usize) -> Vec<NaiveDate> {
        (0..n)
            .map(|i| NaiveDate::from_ymd_opt(2000 + i as i32, 1, 1).unwrap())
            .collect()
    }

    #[test]
    fn rejects_misaligned_rows() {
        let err = Dataset::new(Array2::zeros((3, 2)), Array1::zeros(2), dates(3)).unwrap_err();
        assert!(matches!(err, DemError::Shape(_)));
    }

    #[test]
    fn select_rows_and_complement() {
        let ds = Dataset::new(
            array![[1.0], [2.0], [3.0], [4.0]],
            array![10.0, 20.0, 30.0, 40.0],
            dates(4),
        )
        .unwrap();
        let picked = ds.select(&[true, false, true, false]).unwrap();
        assert_eq!(picked.y.to_vec(), vec![10.0, 30.0]);
        assert_eq!(picked.time[1], dates(4)[2]);

        assert_eq!(ds.rows(1..3).y.to_vec(), vec![20.0, 30.0]);
        assert_eq!(ds.without_rows(1..3).y.to_vec(), vec![10.0, 40.0]);
        assert!(ds.select(&[true]).is_err());
    }

    #[test]
    fn segment_blocks_drop_the_remainder() {
        let blocks = segment_blocks(11, 3).unwrap();
        assert_eq!(blocks, vec![0..3, 3..6, 6..9]);
        assert!(segment_blocks(2, 3).is_err());
        assert!(segment_blocks(10, 0).is_err());
    }
}
