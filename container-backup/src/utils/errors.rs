//! Error types for backup, restore and validation.
//!
//! Mirrors the failure taxonomy of the engine: validation errors for bad
//! requests, operation errors that name the step that failed, not-found errors
//! for absent resources, plus the concrete causes those wrap.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation error: {}", validation_message(.field, .message))]
    Validation {
        field: Option<&'static str>,
        message: String,
    },

    #[error("{step}: {source}")]
    Operation {
        step: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("{resource} '{name}' not found")]
    NotFound { resource: &'static str, name: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Project file error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Runtime API error: {0}")]
    Api(String),

    #[error("unsafe path {entry:?} in archive: path traversal detected")]
    PathTraversal { entry: PathBuf },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,
}

fn validation_message(field: &Option<&'static str>, message: &str) -> String {
    match field {
        Some(field) => format!("field {} {}", field, message),
        None => message.to_string(),
    }
}

impl EngineError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field: Some(field),
            message: message.into(),
        }
    }

    pub fn operation(step: impl Into<String>, source: impl Into<EngineError>) -> Self {
        EngineError::Operation {
            step: step.into(),
            source: Box::new(source.into()),
        }
    }

    /// True when this error, or any operation it is wrapped in, is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            EngineError::Cancelled => true,
            EngineError::Operation { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// True when the root cause is a path-traversal rejection.
    pub fn is_path_traversal(&self) -> bool {
        match self {
            EngineError::PathTraversal { .. } => true,
            EngineError::Operation { source, .. } => source.is_path_traversal(),
            _ => false,
        }
    }

    /// Step label of the outermost operation, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            EngineError::Operation { step, .. } => Some(step),
            _ => None,
        }
    }
}

/// Attach a step label to a fallible call.
pub trait OperationContext<T> {
    fn op(self, step: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<EngineError>> OperationContext<T> for std::result::Result<T, E> {
    fn op(self, step: impl Into<String>) -> Result<T> {
        self.map_err(|e| EngineError::operation(step, e))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = EngineError::validation("container_id", "required");
        assert_eq!(err.to_string(), "validation error: field container_id required");

        let err = EngineError::Validation {
            field: None,
            message: "unsupported target".to_string(),
        };
        assert_eq!(err.to_string(), "validation error: unsupported target");
    }

    #[test]
    fn test_operation_wraps_step() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        let err = res.op("extract backup").unwrap_err();

        assert_eq!(err.step(), Some("extract backup"));
        assert!(err.to_string().starts_with("extract backup: "));
        assert!(matches!(
            err,
            EngineError::Operation { ref source, .. } if matches!(**source, EngineError::Io(_))
        ));
    }

    #[test]
    fn test_cancelled_seen_through_operation() {
        let err = EngineError::operation("archive volume data", EngineError::Cancelled);
        assert!(err.is_cancelled());
        assert!(!err.is_path_traversal());
    }
}
