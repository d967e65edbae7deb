//! # mp-optimizer
//!
//! Hyperparameter search for MolProp.
//!
//! Provides search space definitions, search strategies (grid, random,
//! tree-structured Parzen estimator), trial tracking, and the driver that
//! runs a budgeted search against a [`Trainable`].

mod driver;
mod search;
mod strategy;
mod tpe;
mod trial;

pub use driver::{CancellationToken, SearchDriver, SearchEvent, Trainable, TrainableFn};
pub use search::{HyperparameterConfig, ParameterDef, ParameterKind, ParameterValue, SearchSpace};
pub use strategy::{build_strategy, GridSearch, RandomSearch, SearchStrategy, StrategyKind};
pub use tpe::{TpeSearch, TpeSettings};
pub use trial::{
    ObjectiveDirection, OptimizationConfig, OptimizationId, OptimizationState, OptimizationStatus,
    SearchOutcome, Trial, TrialResult, TrialStatus,
};
