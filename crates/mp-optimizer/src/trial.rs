//! Trial tracking and search run management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::search::HyperparameterConfig;
use crate::strategy::StrategyKind;
use crate::tpe::TpeSettings;

/// Unique search run identifier.
pub type OptimizationId = Uuid;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    #[default]
    #[serde(rename = "max")]
    Maximize,
    #[serde(rename = "min")]
    Minimize,
}

impl ObjectiveDirection {
    /// Whether `candidate` is strictly better than `incumbent`.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }

    /// Objective as a lower-is-better loss, for strategies.
    pub fn to_loss(self, objective: f64) -> f64 {
        match self {
            Self::Maximize => -objective,
            Self::Minimize => objective,
        }
    }
}

impl std::str::FromStr for ObjectiveDirection {
    type Err = mp_types::MpError;

    fn from_str(s: &str) -> mp_types::MpResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "max" | "maximize" => Ok(Self::Maximize),
            "min" | "minimize" => Ok(Self::Minimize),
            other => Err(mp_types::config_error!("unknown metric mode: {}", other)),
        }
    }
}

/// Top-level configuration for a search run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationConfig {
    pub id: OptimizationId,
    pub name: String,

    /// Which search strategy proposes configurations.
    pub strategy: StrategyKind,

    /// Maximum number of trials to run.
    pub max_trials: usize,

    /// How many trials to run in parallel.
    pub concurrency: usize,

    /// Metric name to optimize (e.g. "r2_score_cv_mean").
    pub objective_metric: String,

    /// Direction of optimization.
    pub direction: ObjectiveDirection,

    /// Seed for the strategy's random stream.
    pub seed: u64,

    /// Number of steps per continuous dimension for grid search.
    pub grid_steps: usize,

    pub tpe: TpeSettings,

    /// Stop proposing new trials after this many seconds.
    pub time_budget_secs: Option<u64>,

    pub created_at: DateTime<Utc>,
}

impl OptimizationConfig {
    pub fn new(name: impl Into<String>, strategy: StrategyKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            strategy,
            max_trials: 100,
            concurrency: 1,
            objective_metric: "r2_score_cv_mean".to_string(),
            direction: ObjectiveDirection::Maximize,
            seed: 42,
            grid_steps: 5,
            tpe: TpeSettings::default(),
            time_budget_secs: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_max_trials(mut self, n: usize) -> Self {
        self.max_trials = n;
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn with_objective(mut self, metric: &str, direction: ObjectiveDirection) -> Self {
        self.objective_metric = metric.to_string();
        self.direction = direction;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_grid_steps(mut self, steps: usize) -> Self {
        self.grid_steps = steps;
        self
    }

    pub fn with_tpe(mut self, tpe: TpeSettings) -> Self {
        self.tpe = tpe;
        self
    }

    pub fn with_time_budget(mut self, seconds: u64) -> Self {
        self.time_budget_secs = Some(seconds);
        self
    }
}

/// Lifecycle state for a search run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizationState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Aggregate status of a search run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationStatus {
    pub id: OptimizationId,
    pub config: OptimizationConfig,
    pub state: OptimizationState,
    pub trials_completed: usize,
    pub trials_failed: usize,
    pub trials_running: usize,
    pub best_trial: Option<TrialResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl OptimizationStatus {
    pub fn new(config: OptimizationConfig) -> Self {
        Self {
            id: config.id,
            config,
            state: OptimizationState::Pending,
            trials_completed: 0,
            trials_failed: 0,
            trials_running: 0,
            best_trial: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = OptimizationState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.state = OptimizationState::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.state = OptimizationState::Cancelled;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = OptimizationState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Update the best trial if `result` improves on the current best.
    /// Equal objectives keep the lower trial number. Returns whether the
    /// best changed.
    pub fn update_best(&mut self, result: &TrialResult) -> bool {
        let replaces = match &self.best_trial {
            None => true,
            Some(current_best) => {
                self.config
                    .direction
                    .is_better(result.objective, current_best.objective)
                    || (result.objective == current_best.objective
                        && result.trial_number < current_best.trial_number)
            }
        };
        if replaces {
            self.best_trial = Some(result.clone());
        }
        replaces
    }

    pub fn trials_finished(&self) -> usize {
        self.trials_completed + self.trials_failed
    }
}

// ---------------------------------------------------------------------------
// Individual trial
// ---------------------------------------------------------------------------

/// A single trial (one hyperparameter configuration evaluated by the trainable).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: Uuid,
    pub optimization_id: OptimizationId,
    pub trial_number: usize,
    pub parameters: HyperparameterConfig,
    pub status: TrialStatus,
    pub result: Option<TrialResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub error: Option<String>,
}

impl Trial {
    pub fn new(
        optimization_id: OptimizationId,
        trial_number: usize,
        parameters: HyperparameterConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            optimization_id,
            trial_number,
            parameters,
            status: TrialStatus::Pending,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            worker_id: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self, worker_id: Option<String>) {
        self.status = TrialStatus::Running;
        self.started_at = Some(Utc::now());
        self.worker_id = worker_id;
    }

    pub fn mark_completed(&mut self, result: TrialResult) {
        self.status = TrialStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.result = Some(result);
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = TrialStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Result of a single successful trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial_number: usize,
    pub objective: f64,
    pub metrics: HashMap<String, f64>,
    pub parameters: HyperparameterConfig,
    pub duration_ms: u64,
}

/// Final report of a search run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub optimization_id: OptimizationId,
    pub objective_metric: String,
    pub direction: ObjectiveDirection,
    pub state: OptimizationState,
    pub best: TrialResult,
    /// Every trial, ordered by trial number.
    pub trials: Vec<Trial>,
    pub trials_completed: usize,
    pub trials_failed: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SearchOutcome {
    pub fn best_config(&self) -> &HyperparameterConfig {
        &self.best.parameters
    }

    pub fn best_objective(&self) -> f64 {
        self.best.objective
    }
}
