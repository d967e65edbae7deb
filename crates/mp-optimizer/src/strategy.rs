//! Parameter sweep strategies.

use mp_types::{MpResult, SearchError};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::search::{HyperparameterConfig, ParameterKind, ParameterValue, SearchSpace};
use crate::tpe::{TpeSearch, TpeSettings};

/// Common trait for all search strategies.
///
/// Strategies are plain mutable objects; the driver serializes every
/// `report` + `suggest` pair behind one lock.
pub trait SearchStrategy: Send {
    /// Propose the next configuration to evaluate.
    fn suggest(&mut self) -> MpResult<HyperparameterConfig>;

    /// Feed back a finished trial. `loss` is `None` for failed trials;
    /// otherwise lower is better regardless of the optimization direction.
    fn report(&mut self, _params: &HyperparameterConfig, _loss: Option<f64>) {}

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

/// Which strategy a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Grid,
    Random,
    #[default]
    Tpe,
}

impl std::str::FromStr for StrategyKind {
    type Err = mp_types::MpError;

    fn from_str(s: &str) -> MpResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grid" => Ok(Self::Grid),
            "random" => Ok(Self::Random),
            "tpe" | "bayesian" => Ok(Self::Tpe),
            other => Err(mp_types::config_error!("unknown search strategy: {}", other)),
        }
    }
}

/// Build the strategy selected by `kind` over `space`.
pub fn build_strategy(
    kind: StrategyKind,
    space: &SearchSpace,
    seed: u64,
    grid_steps: usize,
    tpe: &TpeSettings,
) -> Box<dyn SearchStrategy> {
    match kind {
        StrategyKind::Grid => Box::new(GridSearch::new(space.clone(), grid_steps)),
        StrategyKind::Random => Box::new(RandomSearch::new(space.clone(), seed)),
        StrategyKind::Tpe => Box::new(TpeSearch::new(space.clone(), seed, tpe.clone())),
    }
}

// ---- Grid search ----

/// Exhaustive grid search over discrete parameter combinations.
///
/// Continuous ranges and log-scaled integer ranges are cut into
/// `float_steps` points; plain integer ranges are enumerated lazily, one
/// value per step. Once every combination has been handed out, `suggest`
/// fails with [`SearchError::SearchSpaceExhausted`].
#[derive(Debug, Clone)]
pub struct GridSearch {
    axes: Vec<(String, Axis)>,
    total: usize,
    cursor: usize,
}

/// Values one parameter takes on the grid.
#[derive(Debug, Clone)]
enum Axis {
    Values(Vec<ParameterValue>),
    /// `low, low + 1, ...`, `len` values in all.
    Ints { low: i64, len: usize },
}

impl Axis {
    fn len(&self) -> usize {
        match self {
            Axis::Values(values) => values.len(),
            Axis::Ints { len, .. } => *len,
        }
    }

    fn value(&self, pick: usize) -> ParameterValue {
        match self {
            Axis::Values(values) => values[pick].clone(),
            Axis::Ints { low, .. } => ParameterValue::Int((i128::from(*low) + pick as i128) as i64),
        }
    }
}

impl GridSearch {
    pub fn new(space: SearchSpace, float_steps: usize) -> Self {
        let axes: Vec<(String, Axis)> = space
            .parameters
            .iter()
            .map(|param| (param.name.clone(), Self::axis(&param.kind, float_steps)))
            .collect();
        let total = axes
            .iter()
            .try_fold(1usize, |acc, (_, axis)| acc.checked_mul(axis.len()))
            .unwrap_or(usize::MAX);
        Self {
            axes,
            total,
            cursor: 0,
        }
    }

    fn axis(kind: &ParameterKind, float_steps: usize) -> Axis {
        let steps = float_steps.max(2);
        let lerp = |low: f64, high: f64, i: usize| low + (high - low) * i as f64 / (steps - 1) as f64;
        match kind {
            ParameterKind::Fixed { value } => Axis::Values(vec![ParameterValue::from_json(value)]),
            ParameterKind::Choice { values } => Axis::Values(values.iter().map(ParameterValue::from_json).collect()),
            ParameterKind::IntRange {
                low,
                high,
                log_scale: false,
            } => Axis::Ints {
                low: *low,
                len: usize::try_from(i128::from(*high) - i128::from(*low) + 1).unwrap_or(usize::MAX),
            },
            ParameterKind::IntRange {
                low,
                high,
                log_scale: true,
            } => {
                let (lo, hi) = ((*low as f64).ln(), (*high as f64).ln());
                let mut values: Vec<i64> = (0..steps)
                    .map(|i| (lerp(lo, hi, i).exp().round() as i64).clamp(*low, *high))
                    .collect();
                values.dedup();
                Axis::Values(values.into_iter().map(ParameterValue::Int).collect())
            }
            ParameterKind::FloatRange {
                low,
                high,
                log_scale: false,
            } => Axis::Values(
                (0..steps)
                    .map(|i| ParameterValue::Float(lerp(*low, *high, i)))
                    .collect(),
            ),
            ParameterKind::FloatRange {
                low,
                high,
                log_scale: true,
            } => Axis::Values(
                (0..steps)
                    .map(|i| ParameterValue::Float(lerp(low.ln(), high.ln(), i).exp().clamp(*low, *high)))
                    .collect(),
            ),
        }
    }

    /// Total number of combinations, saturating at `usize::MAX`.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn remaining(&self) -> usize {
        self.total - self.cursor
    }

    /// Decode combination `index` as a mixed-radix number over the axes;
    /// the last parameter varies fastest.
    fn combination(&self, mut index: usize) -> HyperparameterConfig {
        let mut config = HyperparameterConfig::with_capacity(self.axes.len());
        for (name, axis) in self.axes.iter().rev() {
            let pick = index % axis.len();
            index /= axis.len();
            config.insert(name.clone(), axis.value(pick));
        }
        config
    }
}

impl SearchStrategy for GridSearch {
    fn suggest(&mut self) -> MpResult<HyperparameterConfig> {
        if self.cursor >= self.total {
            return Err(SearchError::SearchSpaceExhausted {
                message: format!("all {} grid combinations evaluated", self.total),
            }
            .into());
        }
        let config = self.combination(self.cursor);
        self.cursor += 1;
        Ok(config)
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
    rng: ChaCha8Rng,
}

impl RandomSearch {
    pub fn new(space: SearchSpace, seed: u64) -> Self {
        Self {
            space,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl SearchStrategy for RandomSearch {
    fn suggest(&mut self) -> MpResult<HyperparameterConfig> {
        Ok(self.space.sample(&mut self.rng))
    }

    fn name(&self) -> &str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp_types::MpError;
    use serde_json::json;

    fn sample_space() -> SearchSpace {
        SearchSpace::new()
            .add_int("max_depth", 2, 12)
            .add_int("n_estimators", 10, 200)
            .add_float("max_features", 0.2, 1.0)
    }

    #[test]
    fn test_grid_search_produces_correct_count() {
        let space = SearchSpace::new()
            .add_int("a", 1, 3) // 3 values
            .add_int("b", 10, 11); // 2 values
        let mut gs = GridSearch::new(space.clone(), 5);
        assert_eq!(gs.len(), 6);

        let mut seen = Vec::new();
        for _ in 0..6 {
            let config = gs.suggest().unwrap();
            space.validate_config(&config).unwrap();
            seen.push((config["a"].as_i64().unwrap(), config["b"].as_i64().unwrap()));
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn test_grid_search_exhausts() {
        let space = SearchSpace::new().add_choice("x", vec![json!("a"), json!("b")]);
        let mut gs = GridSearch::new(space, 5);
        assert!(gs.suggest().is_ok());
        assert_eq!(gs.remaining(), 1);
        assert!(gs.suggest().is_ok());
        match gs.suggest() {
            Err(MpError::Search(SearchError::SearchSpaceExhausted { .. })) => {}
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn test_grid_search_float_steps_hit_bounds() {
        let space = SearchSpace::new().add_log_uniform("lr", 1e-4, 1e-1);
        let mut gs = GridSearch::new(space, 4);
        let values: Vec<f64> = (0..4)
            .map(|_| gs.suggest().unwrap()["lr"].as_f64().unwrap())
            .collect();
        assert!((values[0] - 1e-4).abs() < 1e-12);
        assert!((values[3] - 1e-1).abs() < 1e-12);
        assert!(values.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_grid_search_huge_int_range_is_lazy() {
        let space = SearchSpace::from_json_str(
            r#"{"n_estimators": {"low": 1, "high": 10000000000}, "warm_start": [true, false]}"#,
        )
        .unwrap();
        let mut gs = build_strategy(StrategyKind::Grid, &space, 0, 5, &TpeSettings::default());

        let first = gs.suggest().unwrap();
        let second = gs.suggest().unwrap();
        let third = gs.suggest().unwrap();
        assert_eq!(first["n_estimators"].as_i64(), Some(1));
        assert_eq!(second["n_estimators"].as_i64(), Some(1));
        assert_eq!(third["n_estimators"].as_i64(), Some(2));
        assert_ne!(first["warm_start"], second["warm_start"]);
        space.validate_config(&third).unwrap();
    }

    #[test]
    fn test_grid_search_full_i64_range() {
        let space = SearchSpace::new().add_int("seed", i64::MIN, i64::MAX);
        let mut gs = GridSearch::new(space, 5);
        assert_eq!(gs.len(), usize::MAX);
        assert_eq!(gs.suggest().unwrap()["seed"].as_i64(), Some(i64::MIN));
        assert_eq!(gs.suggest().unwrap()["seed"].as_i64(), Some(i64::MIN + 1));
    }

    #[test]
    fn test_grid_search_log_scaled_int_range() {
        let space = SearchSpace::from_json_str(r#"{"n": {"low": 1, "high": 1000, "log_scale": true}}"#).unwrap();
        let mut gs = GridSearch::new(space.clone(), 4);
        assert_eq!(gs.len(), 4);
        let values: Vec<i64> = (0..4)
            .map(|_| gs.suggest().unwrap()["n"].as_i64().unwrap())
            .collect();
        assert_eq!(values, vec![1, 10, 100, 1000]);
    }

    #[test]
    fn test_random_search_respects_bounds() {
        let space = sample_space();
        let mut rs = RandomSearch::new(space.clone(), 42);
        for _ in 0..50 {
            let params = rs.suggest().unwrap();
            space.validate_config(&params).unwrap();
            match params.get("max_depth") {
                Some(ParameterValue::Int(v)) => assert!(*v >= 2 && *v <= 12),
                other => panic!("unexpected max_depth value: {other:?}"),
            }
        }
    }

    #[test]
    fn test_random_search_is_seeded() {
        let mut a = RandomSearch::new(sample_space(), 9);
        let mut b = RandomSearch::new(sample_space(), 9);
        for _ in 0..10 {
            assert_eq!(a.suggest().unwrap(), b.suggest().unwrap());
        }
    }

    #[test]
    fn test_strategy_kind_parsing() {
        assert_eq!("grid".parse::<StrategyKind>().unwrap(), StrategyKind::Grid);
        assert_eq!(" TPE ".parse::<StrategyKind>().unwrap(), StrategyKind::Tpe);
        assert_eq!("bayesian".parse::<StrategyKind>().unwrap(), StrategyKind::Tpe);
        assert!("annealing".parse::<StrategyKind>().is_err());
    }
}
