//! Bagged ensemble of regression trees.

use mp_optimizer::{HyperparameterConfig, ParameterValue};
use mp_types::{FeatureMatrix, MpResult, TargetVector, TrainingError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::tree::{check_shapes, fit_failed, DecisionTreeRegressor, TreeParams};
use super::{Regressor, RegressorFactory};

/// How many features each split may look at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MaxFeatures {
    All,
    Sqrt,
    Log2,
    Count(usize),
    Fraction(f64),
}

impl MaxFeatures {
    /// Concrete feature count for `n_features`, at least 1.
    pub fn resolve(self, n_features: usize) -> usize {
        let n = n_features as f64;
        let k = match self {
            Self::All => n_features,
            Self::Sqrt => n.sqrt().floor() as usize,
            Self::Log2 => n.log2().floor() as usize,
            Self::Count(k) => k,
            Self::Fraction(f) => (f * n).floor() as usize,
        };
        k.clamp(1, n_features.max(1))
    }
}

/// Random forest hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub max_features: MaxFeatures,
    /// Fit each tree on a bootstrap resample instead of the full data
    pub bootstrap: bool,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: MaxFeatures::All,
            bootstrap: true,
        }
    }
}

impl ForestParams {
    /// Read forest hyperparameters out of a search configuration. Missing
    /// keys keep their defaults; unknown keys and out-of-range values fail.
    pub fn from_config(config: &HyperparameterConfig) -> MpResult<Self> {
        let mut params = Self::default();

        // Deterministic error reporting regardless of map order.
        let mut names: Vec<&String> = config.keys().collect();
        names.sort();

        for name in names {
            let value = &config[name];
            match name.as_str() {
                "n_estimators" => params.n_estimators = int_at_least(name, value, 1)?,
                "max_depth" => {
                    params.max_depth = if value.is_null() {
                        None
                    } else {
                        Some(int_at_least(name, value, 1)?)
                    }
                }
                "min_samples_split" => params.min_samples_split = int_at_least(name, value, 2)?,
                "min_samples_leaf" => params.min_samples_leaf = int_at_least(name, value, 1)?,
                "max_features" => params.max_features = max_features(value)?,
                "bootstrap" => {
                    params.bootstrap = value
                        .as_bool()
                        .ok_or_else(|| invalid(name, format!("expected a boolean, got {value}")))?
                }
                _ => return Err(invalid(name, "not a random forest hyperparameter".to_string())),
            }
        }
        Ok(params)
    }
}

fn invalid(parameter: &str, message: String) -> mp_types::MpError {
    TrainingError::InvalidHyperparameter {
        parameter: parameter.to_string(),
        message,
    }
    .into()
}

fn int_at_least(name: &str, value: &ParameterValue, min: i64) -> MpResult<usize> {
    let int = match value {
        ParameterValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
        other => other.as_i64(),
    };
    match int {
        Some(v) if v >= min => Ok(v as usize),
        Some(v) => Err(invalid(name, format!("must be at least {min}, got {v}"))),
        None => Err(invalid(name, format!("expected an integer, got {value}"))),
    }
}

fn max_features(value: &ParameterValue) -> MpResult<MaxFeatures> {
    let name = "max_features";
    if value.is_null() {
        return Ok(MaxFeatures::All);
    }
    if let Some(s) = value.as_str() {
        return match s {
            "sqrt" => Ok(MaxFeatures::Sqrt),
            "log2" => Ok(MaxFeatures::Log2),
            other => Err(invalid(name, format!("unknown setting {other:?}"))),
        };
    }
    match value {
        ParameterValue::Int(k) if *k >= 1 => Ok(MaxFeatures::Count(*k as usize)),
        ParameterValue::Float(f) if *f > 0.0 && *f <= 1.0 => Ok(MaxFeatures::Fraction(*f)),
        other => Err(invalid(
            name,
            format!("expected a count >= 1, a fraction in (0, 1], \"sqrt\" or \"log2\", got {other}"),
        )),
    }
}

/// Random forest regressor: trees fitted in parallel, each with seed
/// `seed + i`; prediction is the mean over trees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForestRegressor {
    params: ForestParams,
    seed: u64,
    trees: Vec<DecisionTreeRegressor>,
}

impl RandomForestRegressor {
    pub fn new(params: ForestParams, seed: u64) -> Self {
        Self {
            params,
            seed,
            trees: Vec::new(),
        }
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}

impl Regressor for RandomForestRegressor {
    fn fit(&mut self, features: &FeatureMatrix, target: &TargetVector) -> MpResult<()> {
        check_shapes(features, target)?;
        let n_samples = features.n_rows();
        let max_features = self.params.max_features.resolve(features.n_cols());

        let trees: MpResult<Vec<DecisionTreeRegressor>> = (0..self.params.n_estimators)
            .into_par_iter()
            .map(|i| -> MpResult<DecisionTreeRegressor> {
                let seed = self.seed.wrapping_add(i as u64);
                let mut tree = DecisionTreeRegressor::new(TreeParams {
                    max_depth: self.params.max_depth,
                    min_samples_split: self.params.min_samples_split,
                    min_samples_leaf: self.params.min_samples_leaf,
                    max_features: Some(max_features),
                    seed,
                });

                let rows: Vec<usize> = if self.params.bootstrap {
                    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ 0x9E37_79B9_7F4A_7C15);
                    (0..n_samples).map(|_| rng.gen_range(0..n_samples)).collect()
                } else {
                    (0..n_samples).collect()
                };
                tree.fit_rows(features, target, &rows)?;
                Ok(tree)
            })
            .collect();

        self.trees = trees?;
        Ok(())
    }

    fn predict(&self, features: &FeatureMatrix) -> MpResult<Vec<f64>> {
        if self.trees.is_empty() {
            return Err(fit_failed("forest has not been fitted"));
        }
        let per_tree: Vec<Vec<f64>> = self
            .trees
            .par_iter()
            .map(|tree| tree.predict(features))
            .collect::<MpResult<_>>()?;

        let n = per_tree.len() as f64;
        Ok((0..features.n_rows())
            .map(|row| per_tree.iter().map(|p| p[row]).sum::<f64>() / n)
            .collect())
    }

    fn name(&self) -> &str {
        "random_forest"
    }
}

/// Builds a [`RandomForestRegressor`] from a search configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomForestFactory;

impl RegressorFactory for RandomForestFactory {
    fn build(&self, config: &HyperparameterConfig, seed: u64) -> MpResult<Box<dyn Regressor>> {
        let params = ForestParams::from_config(config)?;
        Ok(Box::new(RandomForestRegressor::new(params, seed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp_types::MpError;
    use serde_json::json;

    fn config(pairs: &[(&str, ParameterValue)]) -> HyperparameterConfig {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn friedman_like(n: usize) -> (FeatureMatrix, TargetVector) {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let rows: Vec<Vec<f64>> = (0..n)
            .map(|_| (0..4).map(|_| rng.gen_range(0.0..1.0)).collect())
            .collect();
        let y = rows
            .iter()
            .map(|r| 10.0 * r[0] + 5.0 * (r[1] - 0.5).powi(2) + r[2])
            .collect();
        (FeatureMatrix::from_rows(rows).unwrap(), TargetVector::new(y))
    }

    #[test]
    fn test_parses_search_configuration() {
        let params = ForestParams::from_config(&config(&[
            ("n_estimators", ParameterValue::Int(25)),
            ("max_depth", ParameterValue::Json(json!(null))),
            ("min_samples_leaf", ParameterValue::Int(3)),
            ("max_features", ParameterValue::Json(json!("sqrt"))),
            ("bootstrap", ParameterValue::Json(json!(false))),
        ]))
        .unwrap();

        assert_eq!(params.n_estimators, 25);
        assert_eq!(params.max_depth, None);
        assert_eq!(params.min_samples_leaf, 3);
        assert_eq!(params.max_features, MaxFeatures::Sqrt);
        assert!(!params.bootstrap);
        assert_eq!(params.min_samples_split, 2);
    }

    #[test]
    fn test_rejects_unknown_and_degenerate_parameters() {
        let cases = [
            ("learning_rate", ParameterValue::Float(0.1)),
            ("n_estimators", ParameterValue::Int(0)),
            ("max_depth", ParameterValue::Float(2.5)),
            ("min_samples_split", ParameterValue::Int(1)),
            ("max_features", ParameterValue::Float(1.5)),
            ("max_features", ParameterValue::Json(json!("cbrt"))),
            ("bootstrap", ParameterValue::Int(1)),
        ];
        for (name, value) in cases {
            match ForestParams::from_config(&config(&[(name, value)])) {
                Err(MpError::Training(TrainingError::InvalidHyperparameter { parameter, .. })) => {
                    assert_eq!(parameter, name)
                }
                other => panic!("{name}: expected InvalidHyperparameter, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_max_features_resolution() {
        assert_eq!(MaxFeatures::All.resolve(10), 10);
        assert_eq!(MaxFeatures::Sqrt.resolve(10), 3);
        assert_eq!(MaxFeatures::Log2.resolve(10), 3);
        assert_eq!(MaxFeatures::Count(50).resolve(10), 10);
        assert_eq!(MaxFeatures::Fraction(0.01).resolve(10), 1);
    }

    #[test]
    fn test_forest_fits_signal() {
        let (x, y) = friedman_like(200);
        let mut forest = RandomForestRegressor::new(
            ForestParams {
                n_estimators: 20,
                ..Default::default()
            },
            42,
        );
        forest.fit(&x, &y).unwrap();
        assert_eq!(forest.n_trees(), 20);

        let predictions = forest.predict(&x).unwrap();
        let r2 = crate::metrics::r2_score(y.as_slice(), &predictions);
        assert!(r2 > 0.8, "in-sample r2 {r2}");
    }

    #[test]
    fn test_forest_is_deterministic() {
        let (x, y) = friedman_like(60);
        let params = ForestParams {
            n_estimators: 8,
            max_features: MaxFeatures::Sqrt,
            ..Default::default()
        };
        let mut a = RandomForestRegressor::new(params.clone(), 7);
        let mut b = RandomForestRegressor::new(params, 7);
        a.fit(&x, &y).unwrap();
        b.fit(&x, &y).unwrap();
        assert_eq!(a.predict(&x).unwrap(), b.predict(&x).unwrap());
    }

    #[test]
    fn test_factory_rejects_bad_config() {
        let bad = config(&[("n_estimators", ParameterValue::Int(-3))]);
        assert!(RandomForestFactory.build(&bad, 1).is_err());
        let good = config(&[("n_estimators", ParameterValue::Int(3))]);
        assert_eq!(RandomForestFactory.build(&good, 1).unwrap().name(), "random_forest");
    }
}
