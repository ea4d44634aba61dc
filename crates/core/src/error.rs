use thiserror::Error;

pub type AudienceResult<T> = Result<T, AudienceError>;

#[derive(Error, Debug)]
pub enum AudienceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Formula parse error at position {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cannot delete '{field}': referenced by {}", dependents.join(", "))]
    DependencyViolation {
        field: String,
        dependents: Vec<String>,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AudienceError {
    pub fn validation(message: impl Into<String>) -> Self {
        AudienceError::Validation(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        AudienceError::Config(message.into())
    }

    /// True for errors raised while saving a definition (validation, parse,
    /// configuration). These never occur during evaluation.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            AudienceError::Validation(_) | AudienceError::Parse { .. } | AudienceError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_violation_message() {
        let err = AudienceError::DependencyViolation {
            field: "ltv".into(),
            dependents: vec!["ltv_band".into(), "vip_score".into()],
        };
        assert_eq!(
            err.to_string(),
            "Cannot delete 'ltv': referenced by ltv_band, vip_score"
        );
    }

    #[test]
    fn test_definition_error_classification() {
        assert!(AudienceError::validation("bad arity").is_definition_error());
        assert!(AudienceError::config("unknown op").is_definition_error());
        assert!(AudienceError::Parse {
            position: 3,
            message: "unexpected ')'".into()
        }
        .is_definition_error());
        assert!(!AudienceError::Conflict("dup".into()).is_definition_error());
    }
}
