//! Runtime error taxonomy
//!
//! Every failure the engine can surface is a `(kind, message)` pair.
//! Compose-time failures propagate synchronously as `Err` values through the
//! composing call; activation failures are recorded on the context as flow
//! state and finalize the wire as Failed. Nothing unwinds across a
//! coroutine boundary.

use thiserror::Error;

/// Discriminant-only view of [`RuntimeError`], for hosts that route on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Compose,
    Activation,
    InvalidVarType,
    Warmup,
    WireNotFound,
    InvalidParameterIndex,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// Structural failure during compose: type mismatch, missing required
    /// variable, invalid parameter. Aborts the whole compose.
    #[error("compose error: {0}")]
    Compose(String),

    /// Failure inside `activate`. Caught by the nearest recovery shard,
    /// otherwise flips the wire's flow state to Error.
    #[error("activation error: {0}")]
    Activation(String),

    /// A runtime type assertion failed.
    #[error("invalid variable type: {0}")]
    InvalidVarType(String),

    /// Variable binding failed during warmup; the wire is marked Failed.
    #[error("warmup error: {0}")]
    Warmup(String),

    /// A referenced wire could not be resolved.
    #[error("wire not found: {0}")]
    WireNotFound(String),

    /// Out-of-range parameter index in `set_param`/`get_param`.
    #[error("invalid parameter index {index} for shard {shard}")]
    InvalidParameterIndex { shard: &'static str, index: usize },
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Compose(_) => ErrorKind::Compose,
            RuntimeError::Activation(_) => ErrorKind::Activation,
            RuntimeError::InvalidVarType(_) => ErrorKind::InvalidVarType,
            RuntimeError::Warmup(_) => ErrorKind::Warmup,
            RuntimeError::WireNotFound(_) => ErrorKind::WireNotFound,
            RuntimeError::InvalidParameterIndex { .. } => ErrorKind::InvalidParameterIndex,
        }
    }

    /// The human-readable payload without the kind prefix.
    pub fn message(&self) -> String {
        match self {
            RuntimeError::Compose(m)
            | RuntimeError::Activation(m)
            | RuntimeError::InvalidVarType(m)
            | RuntimeError::Warmup(m)
            | RuntimeError::WireNotFound(m) => m.clone(),
            RuntimeError::InvalidParameterIndex { shard, index } => {
                format!("index {index} on {shard}")
            }
        }
    }

    pub fn compose(msg: impl Into<String>) -> Self {
        RuntimeError::Compose(msg.into())
    }

    pub fn activation(msg: impl Into<String>) -> Self {
        RuntimeError::Activation(msg.into())
    }

    pub fn warmup(msg: impl Into<String>) -> Self {
        RuntimeError::Warmup(msg.into())
    }

    pub fn invalid_var_type(msg: impl Into<String>) -> Self {
        RuntimeError::InvalidVarType(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        assert_eq!(RuntimeError::compose("x").kind(), ErrorKind::Compose);
        assert_eq!(RuntimeError::activation("x").kind(), ErrorKind::Activation);
        assert_eq!(
            RuntimeError::InvalidParameterIndex { shard: "Const", index: 3 }.kind(),
            ErrorKind::InvalidParameterIndex
        );
    }

    #[test]
    fn test_display_carries_kind_and_message() {
        let e = RuntimeError::WireNotFound("logic".into());
        assert_eq!(e.to_string(), "wire not found: logic");
        assert_eq!(e.message(), "logic");
    }
}
