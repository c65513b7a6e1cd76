//! Error types shared across the engine.

use thiserror::Error;

/// Invalid or self-contradictory configuration. Raised before a session starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("level table must not be empty")]
    EmptyLevelTable,
    #[error("level table has {levels} entries but {budgets} per-level trial budgets were given")]
    BudgetLengthMismatch { levels: usize, budgets: usize },
    #[error("per-level trial budget at index {index} must be positive")]
    ZeroLevelBudget { index: usize },
    #[error("`{field}` must be positive")]
    NonPositive { field: &'static str },
    #[error("`{field}` must be finite and non-negative (got {value})")]
    InvalidValue { field: &'static str, value: f32 },
    #[error("min_level ({min}) exceeds max_level ({max})")]
    InvertedRange { min: f32, max: f32 },
    #[error("`{field}` ({value}) lies outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },
    #[error("init_index {index} is outside a level table of {len} entries")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("pretrial_duration_range [{min}, {max}] is invalid")]
    InvalidPretrialRange { min: f32, max: f32 },
    #[error("session `{0}` appears more than once")]
    DuplicateSession(String),
    #[error("experiment file could not be parsed: {0}")]
    Parse(String),
    #[error("experiment file could not be read: {0}")]
    Io(String),
}

/// A response that could not be routed to a measurement. State is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResponseError {
    #[error("no conditions were added to the scheduler")]
    NoConditions,
    #[error("every condition is already complete")]
    SessionComplete,
    #[error("measurement is already complete")]
    MeasurementComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("conditions cannot be added once scheduling has started")]
    AlreadyStarted,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("session `{0}` is still running")]
    InProgress(String),
    #[error("no session named `{0}`")]
    UnknownSession(String),
}
