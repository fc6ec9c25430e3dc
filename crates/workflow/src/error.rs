//! Error types for the workflow engine

use std::time::Duration;
use thiserror::Error;

/// Main error type for the workflow engine
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Invalid workflow definition: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Workflow instance stopped: {0}")]
    Stopped(String),
}

/// Structural problems detected while building a machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("Machine '{0}' has no states")]
    Empty(String),

    #[error("Invalid state name '{name}'")]
    InvalidName { name: String },

    #[error("State '{state}' has children but no initial state")]
    MissingInitial { state: String },

    #[error("Initial state '{initial}' is not a child of '{state}'")]
    UnknownInitial { state: String, initial: String },

    #[error("Duplicate state: {path}")]
    DuplicateState { path: String },

    #[error("Final state '{state}' must be a top-level leaf without transitions")]
    InvalidFinal { state: String },

    #[error("Transition from '{state}' targets unknown state '{target}'")]
    UnknownTarget { state: String, target: String },

    #[error("State '{state}' has an unguarded handler for '{event}' shadowing later handlers")]
    DuplicateHandler { state: String, event: String },

    #[error("State '{state}' invokes unregistered effect '{effect}'")]
    MissingEffect { state: String, effect: String },

    #[error("State '{state}' invokes an effect without an error transition")]
    MissingErrorHandler { state: String },

    #[error("State '{state}' declares completion transitions without an invoked effect")]
    OrphanCompletion { state: String },

    #[error("State '{state}' is unreachable")]
    Unreachable { state: String },
}

/// Failure of a side effect. Always routed to the invoking state's error transition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EffectError {
    #[error("{0}")]
    Failed(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Timed out after {}ms", .elapsed.as_millis())]
    Timeout { elapsed: Duration },

    #[error("Effect cancelled")]
    Cancelled,
}

impl EffectError {
    pub fn failed(err: impl std::fmt::Display) -> Self {
        EffectError::Failed(err.to_string())
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        EffectError::Rejected(reason.into())
    }

    /// Short tag carried in error events
    pub fn kind(&self) -> &'static str {
        match self {
            EffectError::Failed(_) => "failed",
            EffectError::Rejected(_) => "rejected",
            EffectError::Timeout { .. } => "timeout",
            EffectError::Cancelled => "cancelled",
        }
    }
}

impl From<serde_json::Error> for EffectError {
    fn from(err: serde_json::Error) -> Self {
        EffectError::Failed(format!("Serialization error: {}", err))
    }
}

/// Convenience result types
pub type WorkflowResult<T> = std::result::Result<T, WorkflowError>;
pub type DefinitionResult<T> = std::result::Result<T, DefinitionError>;
pub type EffectResult = std::result::Result<serde_json::Value, EffectError>;
