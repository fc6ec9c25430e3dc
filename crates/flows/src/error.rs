//! Error types for flow effects

use crate::draft::DraftError;
use idn_adapters::{AdapterError, RpcError};
use idn_workflow::EffectError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Draft(#[from] DraftError),

    #[error("Insufficient balance: {available} available, {required} required")]
    InsufficientBalance { available: f64, required: f64 },

    #[error("Flip is incomplete: {0}")]
    IncompleteFlip(String),

    #[error("Ad not found: {0}")]
    AdNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<RpcError> for FlowError {
    fn from(err: RpcError) -> Self {
        FlowError::Adapter(AdapterError::Rpc(err))
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Adapter(AdapterError::Serialization(err))
    }
}

impl From<FlowError> for EffectError {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::InsufficientBalance { .. }
            | FlowError::IncompleteFlip(_)
            | FlowError::InvalidInput(_)
            | FlowError::Draft(DraftError::IllegalTransition { .. }) => {
                EffectError::Rejected(err.to_string())
            }
            other => EffectError::Failed(other.to_string()),
        }
    }
}

pub type FlowResult<T> = std::result::Result<T, FlowError>;
