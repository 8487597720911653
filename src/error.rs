//! Error types for relayq
//!
//! Centralized error handling using thiserror. Per-message delivery
//! failures never travel through this type; they are reported through the
//! message's completion callback.

use thiserror::Error;

/// All error types that can occur in relayq
#[derive(Debug, Error)]
pub enum RelayqError {
    /// Dispatcher was started outside of a tokio runtime
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    /// Configuration failed validation
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for relayq operations
pub type Result<T> = std::result::Result<T, RelayqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_runtime_error() {
        let err = RelayqError::NoRuntime("must be called from the context of a Tokio runtime".to_string());
        assert_eq!(
            err.to_string(),
            "No tokio runtime available: must be called from the context of a Tokio runtime"
        );
    }

    #[test]
    fn test_invalid_config_error() {
        let err = RelayqError::InvalidConfig("dispatch.max_batch_size must be greater than 0".to_string());
        assert_eq!(err.to_string(), "Invalid config: dispatch.max_batch_size must be greater than 0");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RelayqError = io_err.into();
        assert!(matches!(err, RelayqError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_err = serde_yaml::from_str::<Vec<u32>>("not: [a, list").unwrap_err();
        let err: RelayqError = yaml_err.into();
        assert!(matches!(err, RelayqError::Yaml(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: RelayqError = json_err.into();
        assert!(matches!(err, RelayqError::Json(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<u32> {
            Ok(50)
        }

        fn returns_err() -> Result<u32> {
            Err(RelayqError::InvalidConfig("test".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }
}
