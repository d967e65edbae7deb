//! Immutable inputs shared by every trial of a search.

use std::sync::Arc;

use mp_types::{DataError, Dataset, MpResult};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::metrics::Metric;
use crate::split::{train_test_split, Fold, KFold, TrainTestSplit};

/// Cross-validation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CvOptions {
    pub n_splits: usize,
    pub test_size: f64,
    pub seed: u64,
}

impl Default for CvOptions {
    fn default() -> Self {
        Self {
            n_splits: 5,
            test_size: 0.2,
            seed: 42,
        }
    }
}

impl CvOptions {
    pub fn with_n_splits(mut self, n_splits: usize) -> Self {
        self.n_splits = n_splits;
        self
    }

    pub fn with_test_size(mut self, test_size: f64) -> Self {
        self.test_size = test_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Dataset, metric and partitions for a search. The train/test split and
/// the folds are computed once here, so every trial sees the same ones.
#[derive(Debug, Clone)]
pub struct TrainingContext {
    dataset: Arc<Dataset>,
    metric: Metric,
    options: CvOptions,
    split: TrainTestSplit,
    folds: Vec<Fold>,
    train: Dataset,
    test: Dataset,
}

impl TrainingContext {
    pub fn new(dataset: Arc<Dataset>, metric: Metric, options: CvOptions) -> MpResult<Self> {
        let kfold = KFold::new(options.n_splits)?.with_seed(options.seed);
        let split = train_test_split(dataset.n_samples(), options.test_size, options.seed)?;

        let train = dataset.subset(&split.train);
        let test = dataset.subset(&split.test);
        let folds = kfold.split(train.n_samples())?;
        if let Some(fold) = folds.iter().find(|f| f.train.is_empty() || f.validation.is_empty()) {
            return Err(DataError::InsufficientData {
                message: format!(
                    "fold with {} training and {} validation rows",
                    fold.train.len(),
                    fold.validation.len()
                ),
            }
            .into());
        }

        info!(
            "Training context: {} samples, {} train / {} test, {} folds, metric {}",
            dataset.n_samples(),
            train.n_samples(),
            test.n_samples(),
            folds.len(),
            metric.name()
        );

        Ok(Self {
            dataset,
            metric,
            options,
            split,
            folds,
            train,
            test,
        })
    }

    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    pub fn options(&self) -> &CvOptions {
        &self.options
    }

    pub fn n_splits(&self) -> usize {
        self.options.n_splits
    }

    pub fn seed(&self) -> u64 {
        self.options.seed
    }

    /// Row indices into the full dataset.
    pub fn split(&self) -> &TrainTestSplit {
        &self.split
    }

    /// Folds over the rows of [`Self::train`].
    pub fn folds(&self) -> &[Fold] {
        &self.folds
    }

    /// Training partition.
    pub fn train(&self) -> &Dataset {
        &self.train
    }

    /// Held-out partition.
    pub fn test(&self) -> &Dataset {
        &self.test
    }
}
