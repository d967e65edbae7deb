//! Regressors trained per fold, and how to combine them.

mod forest;
mod tree;

pub use forest::{ForestParams, MaxFeatures, RandomForestFactory, RandomForestRegressor};
pub use tree::{DecisionTreeRegressor, TreeParams};

use mp_optimizer::HyperparameterConfig;
use mp_types::{validation_error, FeatureMatrix, MpResult, TargetVector};

/// A model that can be fitted to features/targets and then predict.
pub trait Regressor: Send + Sync {
    fn fit(&mut self, features: &FeatureMatrix, target: &TargetVector) -> MpResult<()>;

    /// One prediction per feature row.
    fn predict(&self, features: &FeatureMatrix) -> MpResult<Vec<f64>>;

    fn name(&self) -> &str;
}

/// Builds an unfitted [`Regressor`] for a hyperparameter configuration.
pub trait RegressorFactory: Send + Sync {
    fn build(&self, config: &HyperparameterConfig, seed: u64) -> MpResult<Box<dyn Regressor>>;
}

impl<F> RegressorFactory for F
where
    F: Fn(&HyperparameterConfig, u64) -> MpResult<Box<dyn Regressor>> + Send + Sync,
{
    fn build(&self, config: &HyperparameterConfig, seed: u64) -> MpResult<Box<dyn Regressor>> {
        self(config, seed)
    }
}

/// Element-wise mean of every model's prediction on `features`.
///
/// A single model's prediction is returned unchanged.
pub fn ensemble_predict(models: &[Box<dyn Regressor>], features: &FeatureMatrix) -> MpResult<Vec<f64>> {
    let (first, rest) = models
        .split_first()
        .ok_or_else(|| validation_error!("cannot ensemble zero models"))?;

    let mut total = first.predict(features)?;
    if rest.is_empty() {
        return Ok(total);
    }
    for model in rest {
        for (acc, p) in total.iter_mut().zip(model.predict(features)?) {
            *acc += p;
        }
    }
    let n = models.len() as f64;
    Ok(total.into_iter().map(|sum| sum / n).collect())
}
