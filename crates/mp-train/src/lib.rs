//! # mp-train
//!
//! Cross-validated training of regression ensembles and the end-to-end
//! hyperparameter search for MolProp: stage arrays, build the training
//! context, search, report.

pub mod config;
pub mod context;
pub mod metrics;
pub mod model;
pub mod split;
pub mod trainable;

use std::path::Path;
use std::sync::Arc;

use mp_data::{stage_dataset, ArrayStore};
use mp_optimizer::{SearchDriver, SearchOutcome, SearchSpace};
use mp_types::{Dataset, MpError, MpResult};
use tracing::{info, warn};

pub use config::TrainSettings;
pub use context::{CvOptions, TrainingContext};
pub use metrics::{Metric, MetricRegistry};
pub use model::{ensemble_predict, RandomForestFactory, Regressor, RegressorFactory};
pub use trainable::{CrossValidatedTrainable, CvReport};

/// Search space used when no search space file is configured.
pub const DEFAULT_SEARCH_SPACE: &str = include_str!("../search_spaces/random_forest.json");

/// Resolve the configured search space.
pub fn load_search_space(settings: &TrainSettings) -> MpResult<SearchSpace> {
    match &settings.search_space_path {
        Some(path) => SearchSpace::from_file(path),
        None => {
            info!("Using the bundled random forest search space");
            SearchSpace::from_json_str(DEFAULT_SEARCH_SPACE)
        }
    }
}

/// Stage the dataset from `store` and run the full search.
///
/// Metric and search space are resolved before any data is read, so a
/// misconfiguration fails without running a single trial.
pub async fn run_search(settings: &TrainSettings, store: &dyn ArrayStore) -> MpResult<SearchOutcome> {
    settings.validate()?;
    let metric = MetricRegistry::with_defaults().get(&settings.metric)?;
    let space = load_search_space(settings)?;

    let dataset = stage_dataset(store, &settings.staging_request()).await?;
    let dataset = Arc::new(dataset);

    let settings_owned = settings.clone();
    let outcome = tokio::task::spawn_blocking(move || search_dataset(dataset, metric, space, &settings_owned))
        .await
        .map_err(|e| MpError::Internal(format!("search task failed: {e}")))??;

    if let Some(path) = &settings.report_path {
        write_report(&outcome, path).await?;
    }
    Ok(outcome)
}

/// Run the search over an already staged dataset. Blocks until done.
pub fn search_dataset(
    dataset: Arc<Dataset>,
    metric: Metric,
    space: SearchSpace,
    settings: &TrainSettings,
) -> MpResult<SearchOutcome> {
    let optimization = settings.optimization_config();
    if metric.greater_is_better() != (optimization.direction == mp_optimizer::ObjectiveDirection::Maximize) {
        warn!(
            "Optimizing {} in {:?} direction although greater_is_better={}",
            metric.name(),
            optimization.direction,
            metric.greater_is_better()
        );
    }

    let context = TrainingContext::new(dataset, metric, settings.cv_options())?;
    let trainable = CrossValidatedTrainable::new(Arc::new(context), Arc::new(RandomForestFactory));
    let driver = SearchDriver::new(optimization, space)?;

    let outcome = driver.run(&trainable)?;
    info!(
        "Best configuration (trial {}): {:?}",
        outcome.best.trial_number, outcome.best.parameters
    );
    for (name, value) in sorted_metrics(&outcome) {
        info!("  {} = {:.6}", name, value);
    }
    Ok(outcome)
}

/// Serialize the outcome as pretty JSON at `path`.
pub async fn write_report(outcome: &SearchOutcome, path: &Path) -> MpResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(outcome)?;
    tokio::fs::write(path, body).await?;
    info!("Wrote search report to {}", path.display());
    Ok(())
}

fn sorted_metrics(outcome: &SearchOutcome) -> Vec<(&str, f64)> {
    let mut metrics: Vec<(&str, f64)> = outcome
        .best
        .metrics
        .iter()
        .map(|(k, v)| (k.as_str(), *v))
        .collect();
    metrics.sort_by(|a, b| a.0.cmp(b.0));
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp_data::{InMemoryArrayStore, LocalArrayStore};
    use mp_optimizer::{OptimizationState, StrategyKind};
    use mp_types::{FeatureMatrix, SearchError, TargetVector};
    use tempfile::tempdir;

    const SMALL_SPACE: &str = r#"{
        "n_estimators": {"low": 3, "high": 6},
        "max_depth": [2, 4, null],
        "min_samples_leaf": {"low": 1, "high": 4},
        "bootstrap": true
    }"#;

    async fn seeded_store(n: usize) -> InMemoryArrayStore {
        let rows: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                let x = i as f64 / n as f64;
                vec![x, (i % 4) as f64, (x * 7.0).sin()]
            })
            .collect();
        let target: Vec<f64> = rows.iter().map(|r| 10f64.powf(1.0 + 2.0 * r[0] + 0.1 * r[1])).collect();

        let store = InMemoryArrayStore::new();
        store
            .store_matrix(&FeatureMatrix::from_rows(rows).unwrap(), "features.csv")
            .await
            .unwrap();
        store
            .store_vector(&TargetVector::new(target), "target.csv")
            .await
            .unwrap();
        store
    }

    fn settings(dir: &Path) -> TrainSettings {
        let space_path = dir.join("space.json");
        std::fs::write(&space_path, SMALL_SPACE).unwrap();
        TrainSettings {
            search_space_path: Some(space_path),
            num_samples: 6,
            concurrency: 2,
            search_strategy: StrategyKind::Random,
            log10_target: true,
            report_path: Some(dir.join("out/report.json")),
            ..TrainSettings::default()
        }
    }

    #[tokio::test]
    async fn test_end_to_end_search_writes_report() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let store = seeded_store(100).await;

        let outcome = run_search(&settings, &store).await.unwrap();
        assert_eq!(outcome.state, OptimizationState::Completed);
        assert_eq!(outcome.trials.len(), 6);
        assert_eq!(outcome.objective_metric, "r2_score_cv_mean");
        assert!(outcome.best.metrics.contains_key("r2_score_test"));

        let written: SearchOutcome =
            serde_json::from_slice(&std::fs::read(dir.path().join("out/report.json")).unwrap()).unwrap();
        assert_eq!(written.best.trial_number, outcome.best.trial_number);
        assert_eq!(written.trials.len(), 6);
    }

    #[tokio::test]
    async fn test_unknown_metric_fails_before_staging() {
        let dir = tempdir().unwrap();
        let settings = TrainSettings {
            metric: "accuracy".to_string(),
            ..settings(dir.path())
        };
        // empty store: staging would fail if it were reached
        let store = InMemoryArrayStore::new();

        match run_search(&settings, &store).await {
            Err(MpError::Search(SearchError::UnknownMetric { name })) => assert_eq!(name, "accuracy"),
            other => panic!("expected UnknownMetric, got {other:?}"),
        }
        assert!(!dir.path().join("out/report.json").exists());
    }

    #[tokio::test]
    async fn test_missing_arrays_surface_storage_errors() {
        let dir = tempdir().unwrap();
        let store = LocalArrayStore::new(dir.path());
        let result = run_search(&settings(dir.path()), &store).await;
        assert!(matches!(
            result,
            Err(MpError::Data(mp_types::DataError::StorageUnavailable { .. }))
        ));
    }

    #[test]
    fn test_bundled_space_is_valid() {
        let space = load_search_space(&TrainSettings::default()).unwrap();
        assert!(space.get("n_estimators").is_some());

        // every sampled configuration is a valid forest configuration
        let mut rng = <rand_chacha::ChaCha8Rng as rand::SeedableRng>::seed_from_u64(1);
        for _ in 0..50 {
            let config = space.sample(&mut rng);
            model::ForestParams::from_config(&config).unwrap();
        }
    }
}
