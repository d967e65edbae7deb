//! Runtime settings for a training run.
//!
//! Settings start from defaults (or a JSON file named by `MP_SETTINGS_FILE`)
//! and are then overridden field by field from environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use mp_data::StagingRequest;
use mp_optimizer::{ObjectiveDirection, OptimizationConfig, StrategyKind};
use mp_types::{config_error, MpResult};
use serde::{Deserialize, Serialize};

use crate::context::CvOptions;

pub const SETTINGS_FILE_VAR: &str = "MP_SETTINGS_FILE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainSettings {
    /// Feature array path, relative to `data_root`.
    pub features_path: String,
    /// Target array path, relative to `data_root`.
    pub target_path: String,
    pub data_root: PathBuf,
    /// Search space document; the bundled random forest space when unset.
    pub search_space_path: Option<PathBuf>,
    pub metric: String,
    pub metric_mode: ObjectiveDirection,
    pub n_splits: usize,
    pub test_size: f64,
    pub random_state: u64,
    /// Trial budget.
    pub num_samples: usize,
    pub concurrency: usize,
    pub search_strategy: StrategyKind,
    pub log10_target: bool,
    pub time_budget_secs: Option<u64>,
    /// Where the final JSON report goes, if anywhere.
    pub report_path: Option<PathBuf>,
}

impl Default for TrainSettings {
    fn default() -> Self {
        Self {
            features_path: "features.csv".to_string(),
            target_path: "target.csv".to_string(),
            data_root: PathBuf::from("."),
            search_space_path: None,
            metric: "r2_score".to_string(),
            metric_mode: ObjectiveDirection::Maximize,
            n_splits: 5,
            test_size: 0.2,
            random_state: 42,
            num_samples: 100,
            concurrency: 1,
            search_strategy: StrategyKind::Tpe,
            log10_target: false,
            time_budget_secs: None,
            report_path: None,
        }
    }
}

impl TrainSettings {
    /// Load from the process environment.
    pub fn from_env() -> MpResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the environment.
    pub fn from_lookup<F>(lookup: F) -> MpResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = match lookup(SETTINGS_FILE_VAR) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        if let Some(v) = lookup("FEATURES_PATH") {
            settings.features_path = v;
        }
        if let Some(v) = lookup("TARGET_PATH") {
            settings.target_path = v;
        }
        if let Some(v) = lookup("DATA_ROOT") {
            settings.data_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("SEARCH_SPACE_PATH") {
            settings.search_space_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("METRIC") {
            settings.metric = v;
        }
        if let Some(v) = lookup("REPORT_PATH") {
            settings.report_path = Some(PathBuf::from(v));
        }
        override_parsed(&lookup, "METRIC_MODE", &mut settings.metric_mode)?;
        override_parsed(&lookup, "N_SPLITS", &mut settings.n_splits)?;
        override_parsed(&lookup, "TEST_SIZE", &mut settings.test_size)?;
        override_parsed(&lookup, "RANDOM_STATE", &mut settings.random_state)?;
        override_parsed(&lookup, "NUM_SAMPLES", &mut settings.num_samples)?;
        override_parsed(&lookup, "CONCURRENCY", &mut settings.concurrency)?;
        override_parsed(&lookup, "SEARCH_STRATEGY", &mut settings.search_strategy)?;
        if let Some(v) = lookup("TIME_BUDGET_SECS") {
            settings.time_budget_secs = Some(parse_value("TIME_BUDGET_SECS", &v)?);
        }
        if let Some(v) = lookup("LOG10_TARGET") {
            settings.log10_target = parse_flag("LOG10_TARGET", &v)?;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> MpResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| config_error!("cannot read settings file {}: {}", path.display(), e))?;
        serde_json::from_str(&text)
            .map_err(|e| config_error!("invalid settings file {}: {}", path.display(), e))
    }

    pub fn validate(&self) -> MpResult<()> {
        if self.features_path.is_empty() || self.target_path.is_empty() {
            return Err(config_error!("features and target paths must be set"));
        }
        if self.n_splits < 2 {
            return Err(config_error!("N_SPLITS must be at least 2, got {}", self.n_splits));
        }
        if !(self.test_size > 0.0 && self.test_size < 1.0) {
            return Err(config_error!("TEST_SIZE must lie in (0, 1), got {}", self.test_size));
        }
        if self.num_samples == 0 {
            return Err(config_error!("NUM_SAMPLES must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(config_error!("CONCURRENCY must be at least 1"));
        }
        Ok(())
    }

    /// Name of the metric the search optimizes.
    pub fn objective_metric(&self) -> String {
        format!("{}_cv_mean", self.metric)
    }

    pub fn cv_options(&self) -> CvOptions {
        CvOptions::default()
            .with_n_splits(self.n_splits)
            .with_test_size(self.test_size)
            .with_seed(self.random_state)
    }

    pub fn staging_request(&self) -> StagingRequest {
        StagingRequest::new(&self.features_path, &self.target_path).with_log10_target(self.log10_target)
    }

    pub fn optimization_config(&self) -> OptimizationConfig {
        let mut config = OptimizationConfig::new(
            format!("{}-{}", self.metric, self.features_path),
            self.search_strategy,
        )
        .with_max_trials(self.num_samples)
        .with_concurrency(self.concurrency)
        .with_objective(&self.objective_metric(), self.metric_mode)
        .with_seed(self.random_state);
        if let Some(budget) = self.time_budget_secs {
            config = config.with_time_budget(budget);
        }
        config
    }
}

fn override_parsed<T, F>(lookup: &F, key: &str, slot: &mut T) -> MpResult<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *slot = parse_value(key, &raw)?;
    }
    Ok(())
}

fn parse_value<T>(key: &str, raw: &str) -> MpResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| config_error!("{}={:?} is invalid: {}", key, raw, e))
}

fn parse_flag(key: &str, raw: &str) -> MpResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(config_error!("{}={:?} is not a boolean", key, raw)),
    }
}
