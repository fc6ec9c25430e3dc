//! Events dispatched into a running machine

use super::StatePath;
use crate::error::EffectError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix of events synthesized when an invoked effect resolves
pub const DONE_PREFIX: &str = "done.invoke.";
/// Prefix of events synthesized when an invoked effect fails
pub const ERROR_PREFIX: &str = "error.invoke.";
/// Event recorded for the initial entry
pub const INIT_EVENT: &str = "workflow.init";

/// An immutable request to transition: a type tag and an optional payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Value::Null,
        }
    }

    pub fn with_payload(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    pub(crate) fn done(state: &StatePath, data: Value) -> Self {
        Self::with_payload(format!("{}{}", DONE_PREFIX, state), data)
    }

    pub(crate) fn failure(state: &StatePath, err: &EffectError) -> Self {
        Self::with_payload(
            format!("{}{}", ERROR_PREFIX, state),
            serde_json::json!({ "message": err.to_string(), "kind": err.kind() }),
        )
    }

    /// Deserialize the payload into a typed value
    pub fn data<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// Get a payload field
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }

    pub fn is_done(&self) -> bool {
        self.name.starts_with(DONE_PREFIX)
    }

    pub fn is_error(&self) -> bool {
        self.name.starts_with(ERROR_PREFIX)
    }

    /// Message carried by a synthesized error event
    pub fn error_message(&self) -> Option<&str> {
        if self.is_error() {
            self.str_field("message")
        } else {
            None
        }
    }
}

impl From<&str> for Event {
    fn from(name: &str) -> Self {
        Event::new(name)
    }
}

impl From<String> for Event {
    fn from(name: String) -> Self {
        Event::new(name)
    }
}
