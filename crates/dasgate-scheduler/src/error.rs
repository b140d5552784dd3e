//! Task engine errors.

use thiserror::Error;

pub type TaskResult<T> = Result<T, TaskError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Malformed task or taskset definition.
    #[error("Config error: {0}")]
    Config(String),

    /// The data store could not evaluate an expression.
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// A sink refused or could not take the payload.
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// The scheduler rejected the timing parameters.
    #[error("Scheduling error: {0}")]
    Scheduling(String),

    #[error("Not found: {0}")]
    NotFound(String),
}
