//! Pull features and targets out of an [`ArrayStore`] into a [`Dataset`].

use mp_types::{DataError, Dataset, MpResult, TargetVector};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::storage::ArrayStore;

/// Where the staged arrays live and how the target is prepared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRequest {
    pub features_path: String,
    pub target_path: String,
    /// Replace every target with its base-10 logarithm before training.
    #[serde(default)]
    pub log10_target: bool,
}

impl StagingRequest {
    pub fn new(features_path: impl Into<String>, target_path: impl Into<String>) -> Self {
        Self {
            features_path: features_path.into(),
            target_path: target_path.into(),
            log10_target: false,
        }
    }

    pub fn with_log10_target(mut self, enabled: bool) -> Self {
        self.log10_target = enabled;
        self
    }
}

/// Load both arrays and check they line up.
pub async fn stage_dataset(store: &dyn ArrayStore, request: &StagingRequest) -> MpResult<Dataset> {
    info!(
        "Loading features {} from {} store",
        request.features_path,
        store.name()
    );
    let features = store.load_matrix(&request.features_path).await?;
    if let Some((row, col, value)) = features.first_non_finite() {
        return Err(DataError::InvalidFormat {
            message: format!(
                "{} has non-finite value {} at row {}, column {}",
                request.features_path, value, row, col
            ),
        }
        .into());
    }

    info!("Loading target {} from {} store", request.target_path, store.name());
    let mut target = store.load_vector(&request.target_path).await?;

    if request.log10_target {
        info!("Converting target values to log10");
        target = log10_target(&target)?;
    }

    let dataset = Dataset::new(features, target)?;
    if dataset.n_samples() == 0 {
        return Err(DataError::InsufficientData {
            message: format!("{} contains no samples", request.features_path),
        }
        .into());
    }

    info!(
        "Staged dataset with {} samples and {} features",
        dataset.n_samples(),
        dataset.n_features()
    );
    Ok(dataset)
}

/// Base-10 logarithm of every target. Targets must be strictly positive.
pub fn log10_target(target: &TargetVector) -> MpResult<TargetVector> {
    target
        .as_slice()
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            if v > 0.0 && v.is_finite() {
                Ok(v.log10())
            } else {
                Err(DataError::InvalidFormat {
                    message: format!("target {} is {}, log10 needs a positive value", i, v),
                }
                .into())
            }
        })
        .collect::<MpResult<Vec<f64>>>()
        .map(TargetVector::new)
}
