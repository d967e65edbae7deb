//! Seeded train/test splitting and K-fold partitioning.
//!
//! Both return index lists into the data they partition; the caller selects
//! rows with them. The same seed always produces the same partition.

use mp_types::{validation_error, DataError, MpResult};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Row indices of a train/test split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainTestSplit {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Shuffle `0..n_samples` and hold out `ceil(test_size * n_samples)` of them.
pub fn train_test_split(n_samples: usize, test_size: f64, seed: u64) -> MpResult<TrainTestSplit> {
    if !(test_size > 0.0 && test_size < 1.0) {
        return Err(validation_error!(
            "test_size must lie strictly between 0 and 1, got {}",
            test_size
        ));
    }
    let n_test = (test_size * n_samples as f64).ceil() as usize;
    if n_test == 0 || n_test >= n_samples {
        return Err(DataError::InsufficientData {
            message: format!(
                "test_size {} of {} samples leaves an empty partition",
                test_size, n_samples
            ),
        }
        .into());
    }

    let mut permutation: Vec<usize> = (0..n_samples).collect();
    permutation.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
    let train = permutation.split_off(n_test);

    Ok(TrainTestSplit {
        train,
        test: permutation,
    })
}

/// One fold: positions used for fitting and positions held out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fold {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

/// Shuffled K-fold splitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KFold {
    n_splits: usize,
    seed: u64,
}

impl KFold {
    pub fn new(n_splits: usize) -> MpResult<Self> {
        if n_splits < 2 {
            return Err(validation_error!("n_splits must be at least 2, got {}", n_splits));
        }
        Ok(Self { n_splits, seed: 42 })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn n_splits(&self) -> usize {
        self.n_splits
    }

    /// Partition `0..n_samples` into `n_splits` validation folds. Fold sizes
    /// are `n / k`, with the first `n % k` folds one larger.
    pub fn split(&self, n_samples: usize) -> MpResult<Vec<Fold>> {
        if n_samples < self.n_splits {
            return Err(DataError::InsufficientData {
                message: format!(
                    "cannot split {} samples into {} folds",
                    n_samples, self.n_splits
                ),
            }
            .into());
        }

        let mut indices: Vec<usize> = (0..n_samples).collect();
        indices.shuffle(&mut ChaCha8Rng::seed_from_u64(self.seed));

        let fold_size = n_samples / self.n_splits;
        let remainder = n_samples % self.n_splits;

        let mut folds = Vec::with_capacity(self.n_splits);
        let mut start = 0;
        for i in 0..self.n_splits {
            let end = start + fold_size + usize::from(i < remainder);

            let mut held_out = vec![false; n_samples];
            for &idx in &indices[start..end] {
                held_out[idx] = true;
            }
            let train = (0..n_samples).filter(|&idx| !held_out[idx]).collect();

            folds.push(Fold {
                train,
                validation: indices[start..end].to_vec(),
            });
            start = end;
        }

        Ok(folds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_split_sizes() {
        let split = train_test_split(100, 0.2, 42).unwrap();
        assert_eq!(split.test.len(), 20);
        assert_eq!(split.train.len(), 80);

        // ceil, like the usual convention
        let split = train_test_split(11, 0.2, 42).unwrap();
        assert_eq!(split.test.len(), 3);
        assert_eq!(split.train.len(), 8);
    }

    #[test]
    fn test_split_is_a_partition() {
        let split = train_test_split(57, 0.3, 7).unwrap();
        let mut all: Vec<usize> = split.train.iter().chain(&split.test).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..57).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_is_seeded() {
        assert_eq!(
            train_test_split(40, 0.25, 42).unwrap(),
            train_test_split(40, 0.25, 42).unwrap()
        );
        assert_ne!(
            train_test_split(40, 0.25, 42).unwrap(),
            train_test_split(40, 0.25, 43).unwrap()
        );
    }

    #[test]
    fn test_split_rejects_degenerate_fractions() {
        assert!(train_test_split(10, 0.0, 1).is_err());
        assert!(train_test_split(10, 1.0, 1).is_err());
        assert!(train_test_split(1, 0.5, 1).is_err());
    }

    #[test]
    fn test_kfold_sizes() {
        let folds = KFold::new(5).unwrap().split(80).unwrap();
        assert_eq!(folds.len(), 5);
        for fold in &folds {
            assert_eq!(fold.validation.len(), 16);
            assert_eq!(fold.train.len(), 64);
        }

        let sizes: Vec<usize> = KFold::new(3)
            .unwrap()
            .split(11)
            .unwrap()
            .iter()
            .map(|f| f.validation.len())
            .collect();
        assert_eq!(sizes, [4, 4, 3]);
    }

    #[test]
    fn test_kfold_partitions_every_sample_once() {
        for k in 2..=7 {
            for n in [k, k + 1, 23, 64] {
                let folds = KFold::new(k).unwrap().with_seed(n as u64).split(n).unwrap();

                let mut seen = vec![0usize; n];
                for fold in &folds {
                    let train: HashSet<usize> = fold.train.iter().copied().collect();
                    assert!(fold.validation.iter().all(|i| !train.contains(i)));
                    assert_eq!(fold.train.len() + fold.validation.len(), n);
                    for &i in &fold.validation {
                        seen[i] += 1;
                    }
                }
                assert!(seen.iter().all(|&count| count == 1), "k={k} n={n}");
            }
        }
    }

    #[test]
    fn test_kfold_rejects_bad_inputs() {
        assert!(KFold::new(1).is_err());
        assert!(KFold::new(5).unwrap().split(4).is_err());
    }
}
