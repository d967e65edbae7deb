//! Tree-structured Parzen estimator.
//!
//! After a random startup phase, finished trials are split into a "good"
//! quantile (lowest losses) and the rest. Each parameter is then drawn from
//! candidates around good values, keeping the candidate with the highest
//! good/bad density ratio.

use mp_types::MpResult;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::search::{HyperparameterConfig, ParameterKind, ParameterValue, SearchSpace};
use crate::strategy::SearchStrategy;

/// Knobs for [`TpeSearch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpeSettings {
    /// Fraction of observations treated as good.
    pub gamma: f64,
    /// Random proposals before the model kicks in.
    pub n_startup: usize,
    /// Candidates scored per continuous parameter.
    pub n_candidates: usize,
    /// Kernel bandwidth, relative to a tenth of the parameter range.
    pub bandwidth: f64,
}

impl Default for TpeSettings {
    fn default() -> Self {
        Self {
            gamma: 0.25,
            n_startup: 10,
            n_candidates: 24,
            bandwidth: 1.0,
        }
    }
}

impl TpeSettings {
    pub fn with_gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma.clamp(0.01, 0.99);
        self
    }

    pub fn with_startup(mut self, n: usize) -> Self {
        self.n_startup = n;
        self
    }
}

/// Adaptive search informed by every reported outcome.
///
/// Failed trials are kept as observations with an infinite loss, so they
/// always land in the bad set.
#[derive(Debug, Clone)]
pub struct TpeSearch {
    space: SearchSpace,
    settings: TpeSettings,
    rng: ChaCha8Rng,
    observations: Vec<(HyperparameterConfig, f64)>,
}

impl TpeSearch {
    pub fn new(space: SearchSpace, seed: u64, settings: TpeSettings) -> Self {
        Self {
            space,
            settings,
            rng: ChaCha8Rng::seed_from_u64(seed),
            observations: Vec::new(),
        }
    }

    pub fn n_observations(&self) -> usize {
        self.observations.len()
    }

    fn in_startup(&self) -> bool {
        self.observations.len() < self.settings.n_startup.max(2)
    }

    /// Observations sorted by loss, split at the gamma quantile.
    fn split(&self) -> (Vec<&HyperparameterConfig>, Vec<&HyperparameterConfig>) {
        let mut sorted: Vec<&(HyperparameterConfig, f64)> = self.observations.iter().collect();
        sorted.sort_by(|a, b| a.1.total_cmp(&b.1));

        let n_good = ((self.settings.gamma * sorted.len() as f64).ceil() as usize)
            .clamp(1, sorted.len() - 1);
        let (good, bad) = sorted.split_at(n_good);
        (
            good.iter().map(|(c, _)| c).collect(),
            bad.iter().map(|(c, _)| c).collect(),
        )
    }

    fn sample_parameter(
        &mut self,
        name: &str,
        kind: &ParameterKind,
        good: &[&HyperparameterConfig],
        bad: &[&HyperparameterConfig],
    ) -> ParameterValue {
        match kind {
            ParameterKind::Fixed { value } => ParameterValue::from_json(value),
            ParameterKind::Choice { values } => {
                let choices: Vec<ParameterValue> = values.iter().map(ParameterValue::from_json).collect();
                let count = |configs: &[&HyperparameterConfig], choice: &ParameterValue| {
                    configs.iter().filter(|c| c.get(name) == Some(choice)).count() as f64
                };
                // Laplace-smoothed density ratio per choice
                let weights: Vec<f64> = choices
                    .iter()
                    .map(|choice| (count(good, choice) + 1.0) / (count(bad, choice) + 1.0))
                    .collect();
                let pick = weighted_index(&weights, &mut self.rng);
                choices[pick].clone()
            }
            ParameterKind::IntRange {
                low,
                high,
                log_scale,
            } => {
                let scale = Scale::new(*log_scale);
                let x = self.sample_continuous(
                    &scale.project(name, good),
                    &scale.project(name, bad),
                    scale.forward(*low as f64),
                    scale.forward(*high as f64),
                );
                ParameterValue::Int((scale.inverse(x).round() as i64).clamp(*low, *high))
            }
            ParameterKind::FloatRange {
                low,
                high,
                log_scale,
            } => {
                let scale = Scale::new(*log_scale);
                let x = self.sample_continuous(
                    &scale.project(name, good),
                    &scale.project(name, bad),
                    scale.forward(*low),
                    scale.forward(*high),
                );
                ParameterValue::Float(scale.inverse(x).clamp(*low, *high))
            }
        }
    }

    fn sample_continuous(&mut self, good: &[f64], bad: &[f64], low: f64, high: f64) -> f64 {
        if good.is_empty() || high <= low {
            return if high <= low { low } else { self.rng.gen_range(low..=high) };
        }

        let bandwidth = (self.settings.bandwidth * (high - low) / 10.0).max(f64::EPSILON);
        let mut best_value = low;
        let mut best_ratio = f64::NEG_INFINITY;

        for _ in 0..self.settings.n_candidates.max(1) {
            let base = good[self.rng.gen_range(0..good.len())];
            // Box-Muller
            let u1: f64 = self.rng.gen::<f64>().max(1e-10);
            let u2: f64 = self.rng.gen();
            let noise = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos() * bandwidth;
            let candidate = (base + noise).clamp(low, high);

            let ratio = kde_density(candidate, good, bandwidth) / (kde_density(candidate, bad, bandwidth) + 1e-10);
            if ratio > best_ratio {
                best_ratio = ratio;
                best_value = candidate;
            }
        }

        best_value
    }
}

impl SearchStrategy for TpeSearch {
    fn suggest(&mut self) -> MpResult<HyperparameterConfig> {
        if self.in_startup() {
            return Ok(self.space.sample(&mut self.rng));
        }

        let parameters = self.space.parameters.clone();
        let (good, bad) = self.split();
        let good: Vec<HyperparameterConfig> = good.into_iter().cloned().collect();
        let bad: Vec<HyperparameterConfig> = bad.into_iter().cloned().collect();
        let good_refs: Vec<&HyperparameterConfig> = good.iter().collect();
        let bad_refs: Vec<&HyperparameterConfig> = bad.iter().collect();

        let mut config = HyperparameterConfig::with_capacity(parameters.len());
        for param in &parameters {
            let value = self.sample_parameter(&param.name, &param.kind, &good_refs, &bad_refs);
            config.insert(param.name.clone(), value);
        }
        Ok(config)
    }

    fn report(&mut self, params: &HyperparameterConfig, loss: Option<f64>) {
        let loss = match loss {
            Some(l) if l.is_finite() => l,
            _ => f64::INFINITY,
        };
        self.observations.push((params.clone(), loss));
    }

    fn name(&self) -> &str {
        "tpe"
    }
}

/// Mapping between a parameter's native units and the space the kernel
/// density works in.
#[derive(Debug, Clone, Copy)]
struct Scale {
    log: bool,
}

impl Scale {
    fn new(log: bool) -> Self {
        Self { log }
    }

    fn forward(self, x: f64) -> f64 {
        if self.log {
            x.ln()
        } else {
            x
        }
    }

    fn inverse(self, x: f64) -> f64 {
        if self.log {
            x.exp()
        } else {
            x
        }
    }

    fn project(self, name: &str, configs: &[&HyperparameterConfig]) -> Vec<f64> {
        configs
            .iter()
            .filter_map(|c| c.get(name).and_then(ParameterValue::as_f64))
            .filter(|v| !self.log || *v > 0.0)
            .map(|v| self.forward(v))
            .collect()
    }
}

/// Gaussian kernel density estimate (unnormalized).
fn kde_density(x: f64, values: &[f64], bandwidth: f64) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    values
        .iter()
        .map(|&v| (-(x - v).powi(2) / (2.0 * bandwidth.powi(2))).exp())
        .sum::<f64>()
        / values.len() as f64
}

fn weighted_index<R: Rng>(weights: &[f64], rng: &mut R) -> usize {
    let total: f64 = weights.iter().sum();
    let r = rng.gen::<f64>() * total;
    let mut cumsum = 0.0;
    for (i, w) in weights.iter().enumerate() {
        cumsum += w;
        if r < cumsum {
            return i;
        }
    }
    weights.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(search: &mut TpeSearch, rounds: usize, loss: impl Fn(&HyperparameterConfig) -> f64) -> Vec<HyperparameterConfig> {
        (0..rounds)
            .map(|_| {
                let config = search.suggest().unwrap();
                search.report(&config, Some(loss(&config)));
                config
            })
            .collect()
    }

    #[test]
    fn test_proposals_stay_in_domain() {
        let space = SearchSpace::new()
            .add_int("depth", 2, 12)
            .add_log_uniform("lr", 1e-4, 1e-1)
            .add_choice("criterion", vec![json!("mse"), json!("mae"), json!(null)])
            .add_fixed("bootstrap", json!(true));
        let mut tpe = TpeSearch::new(space.clone(), 3, TpeSettings::default());

        let history = run(&mut tpe, 60, |c| c["lr"].as_f64().unwrap());
        for config in &history {
            space.validate_config(config).unwrap();
        }
        assert_eq!(tpe.n_observations(), 60);
    }

    #[test]
    fn test_concentrates_near_the_optimum() {
        let space = SearchSpace::new().add_float("x", 0.0, 10.0);
        let mut tpe = TpeSearch::new(space, 42, TpeSettings::default());

        let history = run(&mut tpe, 80, |c| (c["x"].as_f64().unwrap() - 2.0).powi(2));
        let late: Vec<f64> = history[60..].iter().map(|c| c["x"].as_f64().unwrap()).collect();
        let mean_distance = late.iter().map(|x| (x - 2.0).abs()).sum::<f64>() / late.len() as f64;
        // uniform sampling would average ~3.4
        assert!(mean_distance < 2.0, "mean distance {mean_distance}");
    }

    #[test]
    fn test_prefers_the_better_choice() {
        let space = SearchSpace::new().add_choice("kind", vec![json!("good"), json!("bad")]);
        let mut tpe = TpeSearch::new(space, 11, TpeSettings::default());

        let history = run(&mut tpe, 60, |c| if c["kind"].as_str() == Some("good") { 0.0 } else { 1.0 });
        let good_late = history[20..]
            .iter()
            .filter(|c| c["kind"].as_str() == Some("good"))
            .count();
        assert!(good_late > 28, "only {good_late} of 40 late proposals were good");
    }

    #[test]
    fn test_failures_are_bad_observations() {
        let space = SearchSpace::new().add_int("n", 1, 100);
        let mut tpe = TpeSearch::new(space, 5, TpeSettings::default().with_startup(2));
        let a = tpe.suggest().unwrap();
        tpe.report(&a, None);
        let b = tpe.suggest().unwrap();
        tpe.report(&b, Some(0.5));

        let (good, bad) = tpe.split();
        assert_eq!(good.len(), 1);
        assert_eq!(good[0], &b);
        assert_eq!(bad[0], &a);
    }

    #[test]
    fn test_same_seed_same_proposals() {
        let space = SearchSpace::new().add_float("x", -1.0, 1.0).add_int("k", 1, 9);
        let loss = |c: &HyperparameterConfig| c["x"].as_f64().unwrap().abs();
        let a = run(&mut TpeSearch::new(space.clone(), 8, TpeSettings::default()), 30, loss);
        let b = run(&mut TpeSearch::new(space, 8, TpeSettings::default()), 30, loss);
        assert_eq!(a, b);
    }
}
