use thiserror::Error;

/// Main error type for the MolProp system
#[derive(Error, Debug)]
pub enum MpError {
    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MpError {
    /// Training failures only invalidate the trial that raised them.
    pub fn is_trial_recoverable(&self) -> bool {
        matches!(self, MpError::Training(_))
    }
}

/// Search-space and search-driver errors
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Unknown metric: {name}")]
    UnknownMetric { name: String },

    #[error("Invalid search space: {message}")]
    InvalidSearchSpace { message: String },

    #[error("Search space exhausted: {message}")]
    SearchSpaceExhausted { message: String },

    #[error("No successful trials: all {attempted} trials failed")]
    NoSuccessfulTrials { attempted: usize },

    #[error("Objective metric {metric} missing from trial result")]
    MissingObjective { metric: String },
}

/// Per-trial training errors
#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("Model fit failed: {message}")]
    FitFailed { message: String },

    #[error("Invalid hyperparameter {parameter}: {message}")]
    InvalidHyperparameter { parameter: String, message: String },

    #[error("Trial panicked: {message}")]
    Panicked { message: String },
}

/// Array storage and dataset errors
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Storage unavailable for {path}: {message}")]
    StorageUnavailable { path: String, message: String },

    #[error("Shape mismatch: {rows} feature rows, {targets} targets")]
    ShapeMismatch { rows: usize, targets: usize },

    #[error("Invalid data format: {message}")]
    InvalidFormat { message: String },

    #[error("Insufficient data: {message}")]
    InsufficientData { message: String },
}

/// Result type alias for MolProp operations
pub type MpResult<T> = Result<T, MpError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::MpError::Validation(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::MpError::Config(format!($($arg)*))
    };
}
