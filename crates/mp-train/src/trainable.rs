//! Cross-validated ensemble training for one hyperparameter configuration.

use std::collections::HashMap;
use std::sync::Arc;

use mp_optimizer::{HyperparameterConfig, Trainable};
use mp_types::{MpError, MpResult, TrainingError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::TrainingContext;
use crate::model::{ensemble_predict, Regressor, RegressorFactory};

/// Scores from one cross-validated training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvReport {
    /// Validation score per fold, in fold order.
    pub fold_scores: Vec<f64>,
    pub cv_mean: f64,
    pub cv_std: f64,
    /// Score of the fold-model ensemble on the held-out partition.
    pub test_score: f64,
}

impl CvReport {
    /// Metric map keyed `<metric>_cv_mean`, `<metric>_cv_std`, `<metric>_test`.
    pub fn to_metrics(&self, metric: &str) -> HashMap<String, f64> {
        HashMap::from([
            (format!("{metric}_cv_mean"), self.cv_mean),
            (format!("{metric}_cv_std"), self.cv_std),
            (format!("{metric}_test"), self.test_score),
        ])
    }
}

/// Mean and population standard deviation of fold scores. The scores are
/// summed in sorted order so the result does not depend on fold order.
pub fn aggregate_scores(scores: &[f64]) -> (f64, f64) {
    if scores.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len() as f64;
    let mean = sorted.iter().sum::<f64>() / n;

    let mut deviations: Vec<f64> = sorted.iter().map(|s| (s - mean).powi(2)).collect();
    deviations.sort_by(f64::total_cmp);
    let std = (deviations.iter().sum::<f64>() / n).sqrt();
    (mean, std)
}

/// Trains one model per fold and scores both the folds and the held-out
/// ensemble.
#[derive(Clone)]
pub struct CrossValidatedTrainable {
    context: Arc<TrainingContext>,
    factory: Arc<dyn RegressorFactory>,
}

impl CrossValidatedTrainable {
    pub fn new(context: Arc<TrainingContext>, factory: Arc<dyn RegressorFactory>) -> Self {
        Self { context, factory }
    }

    pub fn context(&self) -> &TrainingContext {
        &self.context
    }

    /// Name of the metric the search should optimize.
    pub fn objective_metric(&self) -> String {
        format!("{}_cv_mean", self.context.metric().name())
    }

    pub fn evaluate(&self, config: &HyperparameterConfig) -> MpResult<CvReport> {
        let ctx = &*self.context;
        let metric = ctx.metric();
        let train = ctx.train();

        let fitted: Vec<(f64, Box<dyn Regressor>)> = ctx
            .folds()
            .par_iter()
            .enumerate()
            .map(|(i, fold)| -> MpResult<(f64, Box<dyn Regressor>)> {
                debug!("Starting training on fold {}", i);
                let fold_seed = ctx.seed().wrapping_add(i as u64);
                let mut model = self.factory.build(config, fold_seed)?;

                let fit_part = train.subset(&fold.train);
                let holdout = train.subset(&fold.validation);
                model
                    .fit(fit_part.features(), fit_part.target())
                    .map_err(|e| in_fold(i, e))?;
                let predictions = model.predict(holdout.features()).map_err(|e| in_fold(i, e))?;
                let score = metric
                    .score(holdout.target().as_slice(), &predictions)
                    .map_err(|e| in_fold(i, e))?;
                debug!("{} for fold {}: {}", metric.name(), i, score);
                Ok((score, model))
            })
            .collect::<MpResult<_>>()?;

        let (fold_scores, models): (Vec<f64>, Vec<Box<dyn Regressor>>) = fitted.into_iter().unzip();
        let (cv_mean, cv_std) = aggregate_scores(&fold_scores);

        let test = ctx.test();
        let test_predictions = ensemble_predict(&models, test.features())?;
        let test_score = metric.score(test.target().as_slice(), &test_predictions)?;

        info!(
            "{}: cv mean {:.6} (std {:.6}) over {} folds, test {:.6}",
            metric.name(),
            cv_mean,
            cv_std,
            fold_scores.len(),
            test_score
        );

        Ok(CvReport {
            fold_scores,
            cv_mean,
            cv_std,
            test_score,
        })
    }
}

impl Trainable for CrossValidatedTrainable {
    fn train(&self, config: &HyperparameterConfig) -> MpResult<HashMap<String, f64>> {
        let report = self.evaluate(config)?;
        Ok(report.to_metrics(self.context.metric().name()))
    }
}

impl std::fmt::Debug for CrossValidatedTrainable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossValidatedTrainable")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Keep training errors as they are; anything else becomes a fit failure
/// naming the fold.
fn in_fold(fold: usize, error: MpError) -> MpError {
    match error {
        MpError::Training(_) => error,
        other => TrainingError::FitFailed {
            message: format!("fold {fold}: {other}"),
        }
        .into(),
    }
}
