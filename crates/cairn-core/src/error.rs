//! Error types for cairn-core

use crate::Value;
use std::fmt;
use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("no active session: call `set_active_session` or `Session::enter` before using a store")]
    NoActiveSession,

    #[error("session {0} is closed")]
    SessionClosed(crate::SessionId),

    #[error("type error at `{path}`: expected {expected}, got {got}")]
    TypeError {
        path: String,
        expected: String,
        got: String,
    },

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("store `{store}` has no getter `{name}`")]
    GetterNotFound { store: String, name: String },

    #[error("store `{store}` has no action `{name}`")]
    ActionNotFound { store: String, name: String },

    #[error("getter `{0}` depends on itself")]
    CyclicGetter(String),

    #[error("store `{0}` is no longer alive")]
    StoreDropped(String),

    #[error("plugin `{plugin}` failed: {message}")]
    Plugin { plugin: String, message: String },

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    /// Build a plugin failure
    pub fn plugin(plugin: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Plugin {
            plugin: plugin.into(),
            message: message.to_string(),
        }
    }

    /// The action error, if this is one
    pub fn as_action_error(&self) -> Option<&ActionError> {
        match self {
            Error::Action(err) => Some(err),
            _ => None,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error raised by an action body
///
/// Cloneable so that `on_error` hooks and the caller observe the same error.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ActionError {
    /// Human readable message
    pub message: String,
    /// Optional structured payload
    pub payload: Value,
}

impl ActionError {
    /// Create an action error with a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            payload: Value::Null,
        }
    }

    /// Attach a structured payload
    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = payload.into();
        self
    }
}

impl From<Error> for ActionError {
    fn from(err: Error) -> Self {
        match err {
            Error::Action(inner) => inner,
            other => ActionError::new(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_lowercase() {
        let errors = [
            Error::NoActiveSession,
            Error::PathNotFound("a.b".into()),
            Error::CyclicGetter("s.g".into()),
            Error::Config("bad".into()),
            Error::InvalidOperation("nope".into()),
            Error::plugin("p", "boom"),
        ];
        for err in errors {
            let text = err.to_string();
            assert!(text.starts_with(|c: char| c.is_lowercase()), "{}", text);
        }
        assert_eq!(
            Error::InvalidOperation("nope".into()).to_string(),
            "invalid operation: nope"
        );
    }

    #[test]
    fn test_action_error_survives_round_trip() {
        let original = ActionError::new("declined").with_payload(3);
        let back = ActionError::from(Error::from(original.clone()));
        assert_eq!(back, original);
        let wrapped = ActionError::from(Error::NoActiveSession);
        assert!(wrapped.message.starts_with("no active session"));
    }
}
