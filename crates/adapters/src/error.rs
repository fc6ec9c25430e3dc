//! Error types for adapter calls

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned by the node for a named remote call
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const SERVER_ERROR: i64 = -32000;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(Self::SERVER_ERROR, message)
    }
}

/// Any rejection from an adapter
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Invalid transaction parameters: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;
