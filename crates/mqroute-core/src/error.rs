//! Router error types.

use thiserror::Error;

/// Errors surfaced by the router core and its collaborators.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Function '{name}' is a {actual} function, expected {expected}")]
    WrongFunctionRole {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Job queue is closed")]
    QueueClosed,
}

pub type Result<T> = std::result::Result<T, RouterError>;
