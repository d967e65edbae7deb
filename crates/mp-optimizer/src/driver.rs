//! The hyperparameter search driver.
//!
//! Worker threads pull configurations from the strategy, evaluate them with
//! a [`Trainable`] and record the outcome. The strategy, the trial history
//! and the run status share one lock, so each record-then-propose step is
//! atomic with respect to the other workers.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use mp_types::{validation_error, MpError, MpResult, SearchError, TrainingError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::search::{HyperparameterConfig, SearchSpace};
use crate::strategy::{build_strategy, SearchStrategy};
use crate::trial::{OptimizationConfig, OptimizationStatus, SearchOutcome, Trial, TrialResult};

/// Consecutive proposals outside the declared domain tolerated before the
/// strategy is considered exhausted.
const MAX_PROPOSAL_ATTEMPTS: usize = 16;

/// Something that can be trained and scored for one hyperparameter
/// configuration.
pub trait Trainable: Send + Sync {
    /// Train with `config` and return every metric the run produced.
    fn train(&self, config: &HyperparameterConfig) -> MpResult<HashMap<String, f64>>;
}

/// Adapts a closure into a [`Trainable`].
pub struct TrainableFn<F>(pub F);

impl<F> Trainable for TrainableFn<F>
where
    F: Fn(&HyperparameterConfig) -> MpResult<HashMap<String, f64>> + Send + Sync,
{
    fn train(&self, config: &HyperparameterConfig) -> MpResult<HashMap<String, f64>> {
        (self.0)(config)
    }
}

/// Shared flag for stopping a search from outside.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// No new trials start once cancelled; running trials still finish.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress notifications emitted while a search runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SearchEvent {
    TrialStarted {
        trial_number: usize,
        parameters: HyperparameterConfig,
    },
    TrialCompleted {
        result: TrialResult,
    },
    TrialFailed {
        trial_number: usize,
        error: String,
    },
    NewBest {
        result: TrialResult,
    },
}

struct RunState {
    strategy: Box<dyn SearchStrategy>,
    status: OptimizationStatus,
    trials: Vec<Trial>,
    abort: Option<MpError>,
}

/// Runs a budgeted search over a [`SearchSpace`].
pub struct SearchDriver {
    config: OptimizationConfig,
    space: SearchSpace,
    state: Mutex<RunState>,
    cancel: CancellationToken,
    events: Option<Sender<SearchEvent>>,
}

impl SearchDriver {
    /// Validate the space and settings and build the configured strategy.
    pub fn new(config: OptimizationConfig, space: SearchSpace) -> MpResult<Self> {
        space.validate()?;
        if config.max_trials == 0 {
            return Err(validation_error!("max_trials must be at least 1"));
        }
        if config.concurrency == 0 {
            return Err(validation_error!("concurrency must be at least 1"));
        }
        if config.objective_metric.is_empty() {
            return Err(validation_error!("objective metric name is empty"));
        }

        let strategy = build_strategy(
            config.strategy,
            &space,
            config.seed,
            config.grid_steps,
            &config.tpe,
        );
        Ok(Self {
            state: Mutex::new(RunState {
                strategy,
                status: OptimizationStatus::new(config.clone()),
                trials: Vec::new(),
                abort: None,
            }),
            config,
            space,
            cancel: CancellationToken::new(),
            events: None,
        })
    }

    /// Replace the configured strategy.
    pub fn with_strategy(self, strategy: Box<dyn SearchStrategy>) -> Self {
        self.state.lock().strategy = strategy;
        self
    }

    pub fn with_events(mut self, sender: Sender<SearchEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &OptimizationConfig {
        &self.config
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    /// Snapshot of the run status, including the best trial so far.
    pub fn status(&self) -> OptimizationStatus {
        self.state.lock().status.clone()
    }

    /// Snapshot of every trial proposed so far.
    pub fn trials(&self) -> Vec<Trial> {
        self.state.lock().trials.clone()
    }

    /// Run until the trial budget is spent, the run is cancelled, the time
    /// budget elapses or the strategy gives up.
    pub fn run<T: Trainable + ?Sized>(&self, trainable: &T) -> MpResult<SearchOutcome> {
        let started = Instant::now();
        let strategy_name = {
            let mut state = self.state.lock();
            state.status.mark_running();
            state.strategy.name().to_string()
        };
        let workers = self.config.concurrency.min(self.config.max_trials).max(1);
        info!(
            "Starting search {} ({} strategy, {} trials, {} workers, optimizing {} {:?})",
            self.config.name,
            strategy_name,
            self.config.max_trials,
            workers,
            self.config.objective_metric,
            self.config.direction
        );

        std::thread::scope(|scope| {
            for worker in 0..workers {
                scope.spawn(move || self.worker_loop(worker, trainable, started));
            }
        });

        self.finish()
    }

    fn worker_loop<T: Trainable + ?Sized>(&self, worker: usize, trainable: &T, started: Instant) {
        let worker_id = format!("worker-{worker}");
        while let Some((trial_number, params)) = self.next_trial(&worker_id, started) {
            self.emit(SearchEvent::TrialStarted {
                trial_number,
                parameters: params.clone(),
            });
            debug!("{} running trial {}", worker_id, trial_number);

            let trial_start = Instant::now();
            let evaluated = match catch_unwind(AssertUnwindSafe(|| trainable.train(&params))) {
                Ok(Ok(metrics)) => self.objective(metrics),
                Ok(Err(e)) => Err(e),
                Err(payload) => Err(TrainingError::Panicked {
                    message: panic_message(payload.as_ref()),
                }
                .into()),
            };
            let duration_ms = trial_start.elapsed().as_millis() as u64;

            self.record(trial_number, params, evaluated, duration_ms);
        }
    }

    /// Claim the next trial number and its configuration, or `None` when
    /// the run should stop.
    fn next_trial(&self, worker_id: &str, started: Instant) -> Option<(usize, HyperparameterConfig)> {
        let mut state = self.state.lock();
        if state.abort.is_some() || self.cancel.is_cancelled() {
            return None;
        }
        if state.trials.len() >= self.config.max_trials {
            return None;
        }
        if let Some(budget) = self.config.time_budget_secs {
            if started.elapsed() >= Duration::from_secs(budget) {
                info!("Time budget of {}s spent, no further trials", budget);
                return None;
            }
        }

        let mut attempts = 0;
        let params = loop {
            let proposal = match state.strategy.suggest() {
                Ok(proposal) => proposal,
                Err(e) => {
                    warn!("Strategy could not propose a configuration: {}", e);
                    state.abort = Some(e);
                    return None;
                }
            };
            match self.space.validate_config(&proposal) {
                Ok(()) => break proposal,
                Err(e) => {
                    attempts += 1;
                    warn!("Discarding proposal outside the search space: {}", e);
                    state.strategy.report(&proposal, None);
                    if attempts >= MAX_PROPOSAL_ATTEMPTS {
                        state.abort = Some(
                            SearchError::SearchSpaceExhausted {
                                message: format!(
                                    "{} consecutive proposals fell outside the search space",
                                    attempts
                                ),
                            }
                            .into(),
                        );
                        return None;
                    }
                }
            }
        };

        let trial_number = state.trials.len();
        let mut trial = Trial::new(self.config.id, trial_number, params.clone());
        trial.mark_running(Some(worker_id.to_string()));
        state.trials.push(trial);
        state.status.trials_running += 1;
        Some((trial_number, params))
    }

    fn objective(&self, metrics: HashMap<String, f64>) -> MpResult<(f64, HashMap<String, f64>)> {
        let metric = &self.config.objective_metric;
        match metrics.get(metric) {
            None => Err(SearchError::MissingObjective {
                metric: metric.clone(),
            }
            .into()),
            Some(value) if !value.is_finite() => Err(TrainingError::FitFailed {
                message: format!("objective {} is {}", metric, value),
            }
            .into()),
            Some(value) => Ok((*value, metrics)),
        }
    }

    fn record(
        &self,
        trial_number: usize,
        params: HyperparameterConfig,
        evaluated: MpResult<(f64, HashMap<String, f64>)>,
        duration_ms: u64,
    ) {
        let mut state = self.state.lock();
        state.status.trials_running = state.status.trials_running.saturating_sub(1);

        match evaluated {
            Ok((objective, metrics)) => {
                let result = TrialResult {
                    trial_number,
                    objective,
                    metrics,
                    parameters: params,
                    duration_ms,
                };
                let loss = self.config.direction.to_loss(objective);
                state.strategy.report(&result.parameters, Some(loss));
                state.trials[trial_number].mark_completed(result.clone());
                state.status.trials_completed += 1;
                info!(
                    "Trial {} finished: {} = {:.6} ({} ms)",
                    trial_number, self.config.objective_metric, objective, duration_ms
                );

                if state.status.update_best(&result) {
                    info!(
                        "New best trial {}: {} = {:.6}",
                        trial_number, self.config.objective_metric, objective
                    );
                    self.emit(SearchEvent::NewBest {
                        result: result.clone(),
                    });
                }
                self.emit(SearchEvent::TrialCompleted { result });
            }
            Err(e) => {
                if e.is_trial_recoverable() {
                    warn!("Trial {} failed: {}", trial_number, e);
                } else {
                    error!("Trial {} failed: {}", trial_number, e);
                }
                state.strategy.report(&params, None);
                state.trials[trial_number].mark_failed(e.to_string());
                state.status.trials_failed += 1;
                self.emit(SearchEvent::TrialFailed {
                    trial_number,
                    error: e.to_string(),
                });
            }
        }
    }

    fn finish(&self) -> MpResult<SearchOutcome> {
        let mut state = self.state.lock();

        if let Some(err) = state.abort.take() {
            error!("Search {} aborted: {}", self.config.name, err);
            state.status.mark_failed(err.to_string());
            return Err(err);
        }

        let best = match state.status.best_trial.clone() {
            Some(best) => best,
            None => {
                let attempted = state.trials.len();
                let err = SearchError::NoSuccessfulTrials { attempted };
                error!("Search {} finished without a successful trial", self.config.name);
                state.status.mark_failed(err.to_string());
                return Err(err.into());
            }
        };

        if self.cancel.is_cancelled() {
            info!("Search {} cancelled", self.config.name);
            state.status.mark_cancelled();
        } else {
            state.status.mark_completed();
        }

        info!(
            "Search {} done: {} completed, {} failed, best trial {} with {} = {:.6}",
            self.config.name,
            state.status.trials_completed,
            state.status.trials_failed,
            best.trial_number,
            self.config.objective_metric,
            best.objective
        );

        Ok(SearchOutcome {
            optimization_id: self.config.id,
            objective_metric: self.config.objective_metric.clone(),
            direction: self.config.direction,
            state: state.status.state,
            best,
            trials: state.trials.clone(),
            trials_completed: state.status.trials_completed,
            trials_failed: state.status.trials_failed,
            started_at: state.status.started_at,
            finished_at: state.status.finished_at,
        })
    }

    fn emit(&self, event: SearchEvent) {
        if let Some(tx) = &self.events {
            // Best-effort send; if receiver is dropped we just log.
            if let Err(e) = tx.try_send(event) {
                debug!("Dropped search event: {}", e);
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::ParameterValue;
    use crate::strategy::StrategyKind;
    use crate::trial::{ObjectiveDirection, OptimizationState, TrialStatus};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn scored(metric: &str, value: f64) -> MpResult<HashMap<String, f64>> {
        Ok(HashMap::from([(metric.to_string(), value)]))
    }

    fn config(trials: usize) -> OptimizationConfig {
        OptimizationConfig::new("driver-test", StrategyKind::Random)
            .with_max_trials(trials)
            .with_objective("score", ObjectiveDirection::Maximize)
    }

    #[test]
    fn test_fixed_space_keeps_first_trial_on_ties() {
        let space = SearchSpace::new().add_fixed("n_estimators", json!(100));
        let driver = SearchDriver::new(config(3), space).unwrap();

        let outcome = driver
            .run(&TrainableFn(|_: &HyperparameterConfig| scored("score", 0.42)))
            .unwrap();

        assert_eq!(outcome.trials.len(), 3);
        assert_eq!(outcome.trials_completed, 3);
        assert_eq!(outcome.best.trial_number, 0);
        assert_eq!(outcome.best_objective(), 0.42);
        assert_eq!(outcome.best_config()["n_estimators"], ParameterValue::Int(100));
        assert_eq!(outcome.state, OptimizationState::Completed);
    }

    #[test]
    fn test_failing_trial_is_isolated() {
        let space = SearchSpace::new().add_int("depth", 1, 10);
        let driver = SearchDriver::new(config(5), space).unwrap();
        let calls = AtomicUsize::new(0);

        let outcome = driver
            .run(&TrainableFn(|c: &HyperparameterConfig| {
                if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                    return Err(TrainingError::FitFailed {
                        message: "degenerate split".into(),
                    }
                    .into());
                }
                scored("score", c["depth"].as_f64().unwrap())
            }))
            .unwrap();

        assert_eq!(outcome.trials_completed, 4);
        assert_eq!(outcome.trials_failed, 1);
        assert_eq!(outcome.trials[1].status, TrialStatus::Failed);
        assert!(outcome.trials[1].error.as_deref().unwrap().contains("degenerate split"));
        assert_ne!(outcome.best.trial_number, 1);
    }

    #[test]
    fn test_all_failures_yield_no_successful_trials() {
        let space = SearchSpace::new().add_float("x", 0.0, 1.0);
        let driver = SearchDriver::new(config(4), space).unwrap();

        let result = driver.run(&TrainableFn(|_: &HyperparameterConfig| -> MpResult<HashMap<String, f64>> {
            Err(TrainingError::FitFailed {
                message: "always".into(),
            }
            .into())
        }));

        assert!(matches!(
            result,
            Err(MpError::Search(SearchError::NoSuccessfulTrials { attempted: 4 }))
        ));
        assert_eq!(driver.status().state, OptimizationState::Failed);
        assert!(driver.status().best_trial.is_none());
    }

    #[test]
    fn test_panics_and_bad_objectives_count_as_failures() {
        let space = SearchSpace::new().add_int("k", 0, 3);
        let driver = SearchDriver::new(config(4), space).unwrap();
        let calls = AtomicUsize::new(0);

        let outcome = driver
            .run(&TrainableFn(|_: &HyperparameterConfig| {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => panic!("fold exploded"),
                    1 => scored("other_metric", 1.0),
                    2 => scored("score", f64::NAN),
                    _ => scored("score", 0.1),
                }
            }))
            .unwrap();

        assert_eq!(outcome.trials_failed, 3);
        assert_eq!(outcome.best.trial_number, 3);
        assert!(outcome.trials[0].error.as_deref().unwrap().contains("fold exploded"));
        assert!(outcome.trials[1].error.as_deref().unwrap().contains("score"));
    }

    #[test]
    fn test_cancellation_stops_new_trials() {
        let space = SearchSpace::new().add_int("k", 0, 3);
        let driver = SearchDriver::new(config(10), space).unwrap();
        let token = driver.cancellation_token();
        let calls = AtomicUsize::new(0);

        let outcome = driver
            .run(&TrainableFn(|_: &HyperparameterConfig| {
                if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                    token.cancel();
                }
                scored("score", 1.0)
            }))
            .unwrap();

        assert_eq!(outcome.state, OptimizationState::Cancelled);
        assert_eq!(outcome.trials.len(), 2);
        assert_eq!(outcome.trials_completed, 2);
    }

    #[test]
    fn test_grid_exhaustion_aborts_but_keeps_best() {
        let space = SearchSpace::new().add_choice("x", vec![json!(1), json!(2)]);
        let cfg = OptimizationConfig::new("grid", StrategyKind::Grid)
            .with_max_trials(5)
            .with_objective("score", ObjectiveDirection::Minimize);
        let driver = SearchDriver::new(cfg, space).unwrap();

        let result = driver.run(&TrainableFn(|c: &HyperparameterConfig| {
            scored("score", c["x"].as_f64().unwrap())
        }));

        assert!(matches!(
            result,
            Err(MpError::Search(SearchError::SearchSpaceExhausted { .. }))
        ));
        let status = driver.status();
        assert_eq!(status.trials_completed, 2);
        assert_eq!(status.best_trial.unwrap().objective, 1.0);
    }

    struct OutOfDomain;

    impl SearchStrategy for OutOfDomain {
        fn suggest(&mut self) -> MpResult<HyperparameterConfig> {
            Ok(HyperparameterConfig::from([("k".to_string(), ParameterValue::Int(99))]))
        }

        fn name(&self) -> &str {
            "out-of-domain"
        }
    }

    #[test]
    fn test_invalid_proposals_never_reach_the_trainable() {
        let space = SearchSpace::new().add_int("k", 0, 3);
        let driver = SearchDriver::new(config(5), space)
            .unwrap()
            .with_strategy(Box::new(OutOfDomain));
        let calls = AtomicUsize::new(0);

        let result = driver.run(&TrainableFn(|_: &HyperparameterConfig| {
            calls.fetch_add(1, Ordering::SeqCst);
            scored("score", 1.0)
        }));

        assert!(matches!(
            result,
            Err(MpError::Search(SearchError::SearchSpaceExhausted { .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_workers_record_every_trial() {
        let space = SearchSpace::new().add_float("x", -1.0, 1.0);
        let driver = SearchDriver::new(config(20).with_concurrency(4), space).unwrap();

        let outcome = driver
            .run(&TrainableFn(|c: &HyperparameterConfig| {
                std::thread::sleep(Duration::from_millis(2));
                scored("score", -c["x"].as_f64().unwrap().abs())
            }))
            .unwrap();

        assert_eq!(outcome.trials.len(), 20);
        assert_eq!(outcome.trials_completed, 20);
        for (i, trial) in outcome.trials.iter().enumerate() {
            assert_eq!(trial.trial_number, i);
            assert_eq!(trial.status, TrialStatus::Completed);
        }
        let best = outcome
            .trials
            .iter()
            .filter_map(|t| t.result.as_ref())
            .map(|r| r.objective)
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(outcome.best_objective(), best);
        assert_eq!(driver.status().trials_running, 0);
    }

    #[test]
    fn test_events_are_emitted() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let space = SearchSpace::new().add_int("k", 0, 3);
        let driver = SearchDriver::new(config(3), space).unwrap().with_events(tx);

        driver
            .run(&TrainableFn(|c: &HyperparameterConfig| {
                scored("score", c["k"].as_f64().unwrap())
            }))
            .unwrap();

        let events: Vec<SearchEvent> = rx.try_iter().collect();
        let started = events
            .iter()
            .filter(|e| matches!(e, SearchEvent::TrialStarted { .. }))
            .count();
        let completed = events
            .iter()
            .filter(|e| matches!(e, SearchEvent::TrialCompleted { .. }))
            .count();
        assert_eq!(started, 3);
        assert_eq!(completed, 3);
        assert!(events.iter().any(|e| matches!(e, SearchEvent::NewBest { .. })));
    }

    #[test]
    fn test_spent_time_budget_runs_nothing() {
        let space = SearchSpace::new().add_int("k", 0, 3);
        let driver = SearchDriver::new(config(5).with_time_budget(0), space).unwrap();

        let result = driver.run(&TrainableFn(|_: &HyperparameterConfig| scored("score", 1.0)));
        assert!(matches!(
            result,
            Err(MpError::Search(SearchError::NoSuccessfulTrials { attempted: 0 }))
        ));
    }

    #[test]
    fn test_rejects_bad_settings() {
        let space = SearchSpace::new().add_int("k", 0, 3);
        assert!(SearchDriver::new(config(0), space.clone()).is_err());
        assert!(SearchDriver::new(config(3).with_concurrency(0), space).is_err());
        assert!(SearchDriver::new(config(3), SearchSpace::new()).is_err());
    }

    #[test]
    fn test_tpe_driver_improves_on_smooth_objective() {
        let space = SearchSpace::new().add_float("x", 0.0, 10.0);
        let cfg = OptimizationConfig::new("tpe", StrategyKind::Tpe)
            .with_max_trials(60)
            .with_objective("loss", ObjectiveDirection::Minimize);
        let driver = SearchDriver::new(cfg, space).unwrap();

        let outcome = driver
            .run(&TrainableFn(|c: &HyperparameterConfig| {
                scored("loss", (c["x"].as_f64().unwrap() - 7.0).powi(2))
            }))
            .unwrap();

        assert!(outcome.best_objective() < 0.25, "best {}", outcome.best_objective());
    }
}
