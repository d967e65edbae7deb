//! Numeric arrays shared by staging, training and search.

use serde::{Deserialize, Serialize};

use crate::errors::{DataError, MpResult};

/// Row-major matrix of features, one row per sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl FeatureMatrix {
    /// Build a matrix from a flat row-major buffer.
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> MpResult<Self> {
        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(DataError::InvalidFormat {
                message: format!(
                    "expected {} values for a {}x{} matrix, got {}",
                    rows.saturating_mul(cols),
                    rows,
                    cols,
                    data.len()
                ),
            }
            .into());
        }
        Ok(Self { rows, cols, data })
    }

    /// Build a matrix from nested rows; every row must have the same width.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> MpResult<Self> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(DataError::InvalidFormat {
                    message: format!("row {} has {} columns, expected {}", i, row.len(), cols),
                }
                .into());
            }
            data.extend_from_slice(row);
        }
        Self::new(rows.len(), cols, data)
    }

    pub fn n_rows(&self) -> usize {
        self.rows
    }

    pub fn n_cols(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn row(&self, index: usize) -> &[f64] {
        let start = index * self.cols;
        &self.data[start..start + self.cols]
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f64]> {
        (0..self.rows).map(move |i| self.row(i))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Copy the given rows, in the given order, into a new matrix.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &i in indices {
            data.extend_from_slice(self.row(i));
        }
        Self {
            rows: indices.len(),
            cols: self.cols,
            data,
        }
    }

    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        self.iter_rows().map(<[f64]>::to_vec).collect()
    }

    /// Position `(row, col)` and value of the first NaN or infinite entry.
    pub fn first_non_finite(&self) -> Option<(usize, usize, f64)> {
        self.data
            .iter()
            .position(|v| !v.is_finite())
            .map(|i| (i / self.cols, i % self.cols, self.data[i]))
    }
}

/// Regression targets aligned with the rows of a [`FeatureMatrix`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetVector(Vec<f64>);

impl TargetVector {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn select(&self, indices: &[usize]) -> Self {
        Self(indices.iter().map(|&i| self.0[i]).collect())
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

impl From<Vec<f64>> for TargetVector {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

impl TryFrom<FeatureMatrix> for TargetVector {
    type Error = crate::errors::MpError;

    /// A single-column matrix is a target vector.
    fn try_from(matrix: FeatureMatrix) -> MpResult<Self> {
        if matrix.cols != 1 && !matrix.is_empty() {
            return Err(DataError::InvalidFormat {
                message: format!("target array must have one column, found {}", matrix.cols),
            }
            .into());
        }
        Ok(Self(matrix.data))
    }
}

/// Features and targets loaded for one search. Row count always equals
/// target count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    features: FeatureMatrix,
    target: TargetVector,
}

impl Dataset {
    pub fn new(features: FeatureMatrix, target: TargetVector) -> MpResult<Self> {
        if features.n_rows() != target.len() {
            return Err(DataError::ShapeMismatch {
                rows: features.n_rows(),
                targets: target.len(),
            }
            .into());
        }
        Ok(Self { features, target })
    }

    pub fn features(&self) -> &FeatureMatrix {
        &self.features
    }

    pub fn target(&self) -> &TargetVector {
        &self.target
    }

    pub fn n_samples(&self) -> usize {
        self.target.len()
    }

    pub fn n_features(&self) -> usize {
        self.features.n_cols()
    }

    /// Subset both arrays with the same index list so rows stay aligned.
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            features: self.features.select_rows(indices),
            target: self.target.select(indices),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MpError;

    fn sample_matrix() -> FeatureMatrix {
        FeatureMatrix::from_rows(vec![
            vec![1.0, 2.0],
            vec![3.0, 4.0],
            vec![5.0, 6.0],
        ])
        .unwrap()
    }

    #[test]
    fn test_matrix_shape() {
        let m = sample_matrix();
        assert_eq!(m.n_rows(), 3);
        assert_eq!(m.n_cols(), 2);
        assert_eq!(m.row(1), &[3.0, 4.0]);
        assert_eq!(m.get(2, 0), 5.0);
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let result = FeatureMatrix::from_rows(vec![vec![1.0, 2.0], vec![3.0]]);
        assert!(matches!(result, Err(MpError::Data(DataError::InvalidFormat { .. }))));
    }

    #[test]
    fn test_select_rows_keeps_order() {
        let m = sample_matrix();
        let picked = m.select_rows(&[2, 0]);
        assert_eq!(picked.to_rows(), vec![vec![5.0, 6.0], vec![1.0, 2.0]]);
    }

    #[test]
    fn test_dataset_shape_mismatch() {
        let result = Dataset::new(sample_matrix(), TargetVector::new(vec![1.0, 2.0]));
        match result {
            Err(MpError::Data(DataError::ShapeMismatch { rows, targets })) => {
                assert_eq!(rows, 3);
                assert_eq!(targets, 2);
            }
            other => panic!("expected shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_dataset_subset_aligned() {
        let ds = Dataset::new(sample_matrix(), TargetVector::new(vec![10.0, 20.0, 30.0])).unwrap();
        let sub = ds.subset(&[1, 2]);
        assert_eq!(sub.n_samples(), 2);
        assert_eq!(sub.features().row(0), &[3.0, 4.0]);
        assert_eq!(sub.target().as_slice(), &[20.0, 30.0]);
    }

    #[test]
    fn test_first_non_finite() {
        assert_eq!(sample_matrix().first_non_finite(), None);

        let m = FeatureMatrix::from_rows(vec![vec![1.0, 2.0], vec![f64::INFINITY, 4.0]]).unwrap();
        assert_eq!(m.first_non_finite(), Some((1, 0, f64::INFINITY)));

        let m = FeatureMatrix::from_rows(vec![vec![1.0, f64::NAN]]).unwrap();
        let (row, col, value) = m.first_non_finite().unwrap();
        assert_eq!((row, col), (0, 1));
        assert!(value.is_nan());
    }

    #[test]
    fn test_target_from_single_column() {
        let m = FeatureMatrix::from_rows(vec![vec![1.5], vec![2.5]]).unwrap();
        let t = TargetVector::try_from(m).unwrap();
        assert_eq!(t.as_slice(), &[1.5, 2.5]);

        assert!(TargetVector::try_from(sample_matrix()).is_err());
    }
}
