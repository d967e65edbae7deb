//! Regression metrics addressable by name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use mp_types::{validation_error, MpResult, SearchError};

/// Scoring function over `(y_true, y_pred)` of equal, non-zero length.
pub type MetricFn = Arc<dyn Fn(&[f64], &[f64]) -> f64 + Send + Sync>;

/// A named metric and its preferred direction.
#[derive(Clone)]
pub struct Metric {
    name: String,
    func: MetricFn,
    greater_is_better: bool,
}

impl Metric {
    pub fn new(name: impl Into<String>, func: MetricFn, greater_is_better: bool) -> Self {
        Self {
            name: name.into(),
            func,
            greater_is_better,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn greater_is_better(&self) -> bool {
        self.greater_is_better
    }

    pub fn score(&self, y_true: &[f64], y_pred: &[f64]) -> MpResult<f64> {
        if y_true.len() != y_pred.len() {
            return Err(validation_error!(
                "{}: {} targets but {} predictions",
                self.name,
                y_true.len(),
                y_pred.len()
            ));
        }
        if y_true.is_empty() {
            return Err(validation_error!("{}: cannot score an empty sample", self.name));
        }
        Ok((self.func)(y_true, y_pred))
    }
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metric")
            .field("name", &self.name)
            .field("greater_is_better", &self.greater_is_better)
            .finish()
    }
}

/// Lookup table from metric name to [`Metric`].
#[derive(Debug, Clone, Default)]
pub struct MetricRegistry {
    metrics: HashMap<String, Metric>,
}

impl MetricRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the standard regression metrics.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("r2_score", r2_score, true);
        registry.register("mean_squared_error", mean_squared_error, false);
        registry.register("root_mean_squared_error", |t, p| mean_squared_error(t, p).sqrt(), false);
        registry.register("mean_absolute_error", mean_absolute_error, false);
        registry.register("max_error", max_error, false);
        registry
    }

    pub fn register<F>(&mut self, name: &str, func: F, greater_is_better: bool)
    where
        F: Fn(&[f64], &[f64]) -> f64 + Send + Sync + 'static,
    {
        self.metrics.insert(
            name.to_string(),
            Metric::new(name, Arc::new(func), greater_is_better),
        );
    }

    pub fn get(&self, name: &str) -> MpResult<Metric> {
        self.metrics.get(name).cloned().ok_or_else(|| {
            SearchError::UnknownMetric {
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.metrics.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.metrics.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Coefficient of determination. A constant `y_true` scores 1.0 when
/// predicted exactly and 0.0 otherwise.
pub fn r2_score(y_true: &[f64], y_pred: &[f64]) -> f64 {
    let mean = y_true.iter().sum::<f64>() / y_true.len() as f64;
    let ss_res: f64 = y_true.iter().zip(y_pred).map(|(t, p)| (t - p).powi(2)).sum();
    let ss_tot: f64 = y_true.iter().map(|t| (t - mean).powi(2)).sum();
    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

pub fn mean_squared_error(y_true: &[f64], y_pred: &[f64]) -> f64 {
    y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum::<f64>()
        / y_true.len() as f64
}

pub fn mean_absolute_error(y_true: &[f64], y_pred: &[f64]) -> f64 {
    y_true.iter().zip(y_pred).map(|(t, p)| (t - p).abs()).sum::<f64>() / y_true.len() as f64
}

pub fn max_error(y_true: &[f64], y_pred: &[f64]) -> f64 {
    y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).abs())
        .fold(0.0, f64::max)
}
