//! Error types for the counterfactual search core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering typed values, the prediction oracle, goal criteria and
//! configuration. Only [`ConfigError`] ever aborts a search; every other
//! error is absorbed per candidate and folded into its fitness.

/// Top-level error type for the counterfact core library.
#[derive(Debug, thiserror::Error)]
pub enum CounterfactError {
    #[error("Value error: {0}")]
    Value(#[from] ValueError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Goal criterion error: {0}")]
    Goal(#[from] GoalError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from typed value construction and comparison.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueError {
    #[error("Invalid {kind} value: {reason}")]
    InvalidValue { kind: String, reason: String },

    #[error("Type mismatch: cannot compare {left} with {right}")]
    TypeMismatch { left: String, right: String },

    #[error("Duplicate feature name: {name}")]
    DuplicateFeature { name: String },

    #[error("Unknown feature: {name}")]
    UnknownFeature { name: String },

    #[error(
        "Feature '{name}' is unconstrained but has no other values to take; declare its labels, supply observed values or fix its domain"
    )]
    NoAlternatives { name: String },
}

impl ValueError {
    pub fn invalid(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    pub fn mismatch(left: impl std::fmt::Display, right: impl std::fmt::Display) -> Self {
        Self::TypeMismatch {
            left: left.to_string(),
            right: right.to_string(),
        }
    }
}

/// Errors from the prediction oracle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OracleError {
    #[error("Prediction timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Prediction call failed: {message}")]
    CallFailed { message: String },

    #[error("Predictor returned {actual} outputs for {expected} inputs")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Predictor panicked: {message}")]
    Panicked { message: String },
}

impl OracleError {
    pub fn call_failed(message: impl Into<String>) -> Self {
        Self::CallFailed {
            message: message.into(),
        }
    }
}

/// Errors raised while evaluating a goal criterion.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GoalError {
    #[error("Goal evaluation failed: {message}")]
    Evaluation { message: String },

    #[error("Output '{name}' required by the goal is missing")]
    MissingOutput { name: String },

    #[error("Goal criterion panicked: {message}")]
    Panicked { message: String },
}

impl GoalError {
    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
        }
    }
}

/// Errors from the configuration system and request validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Either a goal or criteria must be provided.")]
    MissingGoal,

    #[error("Original instance has no features")]
    EmptyInstance,

    #[error("Invalid original instance: {0}")]
    InvalidInstance(#[from] ValueError),

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// Convenience result type for the counterfact core.
pub type Result<T> = std::result::Result<T, CounterfactError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_goal_message_matches_explainer_contract() {
        assert_eq!(
            ConfigError::MissingGoal.to_string(),
            "Either a goal or criteria must be provided."
        );
    }

    #[test]
    fn test_error_conversion_chain() {
        let err: CounterfactError = ValueError::mismatch("numeric", "text").into();
        assert!(matches!(err, CounterfactError::Value(_)));
        assert!(err.to_string().contains("numeric"));

        let err: CounterfactError = ConfigError::invalid("survivor_count").into();
        assert!(err.to_string().starts_with("Configuration error"));
    }

    #[test]
    fn test_oracle_error_display() {
        let err = OracleError::Timeout { timeout_ms: 250 };
        assert_eq!(err.to_string(), "Prediction timed out after 250ms");
        let err = OracleError::LengthMismatch {
            expected: 4,
            actual: 3,
        };
        assert!(err.to_string().contains("3 outputs for 4 inputs"));
    }
}
