use thiserror::Error;

/// Core error types shared by every rollcall component
#[derive(Debug, Error)]
pub enum RollcallError {
    #[error("Shared store unreachable: {0}")]
    Connectivity(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("External identity lookup failed: {0}")]
    ExternalLookup(String),

    #[error("Script execution failed: {0}")]
    ScriptExecution(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("UUID error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("Invalid proxy id: {0}")]
    InvalidProxyId(String),

    #[error("Invalid stored data for {key}: {message}")]
    InvalidData { key: String, message: String },
}

impl RollcallError {
    /// Create a new Connectivity error
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity(message.into())
    }

    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a new ExternalLookup error
    pub fn external_lookup(message: impl Into<String>) -> Self {
        Self::ExternalLookup(message.into())
    }

    /// Create a new ScriptExecution error
    pub fn script_execution(message: impl Into<String>) -> Self {
        Self::ScriptExecution(message.into())
    }

    /// Create a new InvalidData error
    pub fn invalid_data(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidData {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connectivity(_) => ErrorCategory::Connectivity,
            Self::Configuration(_) | Self::InvalidProxyId(_) => ErrorCategory::Configuration,
            Self::ExternalLookup(_) => ErrorCategory::ExternalLookup,
            Self::ScriptExecution(_) => ErrorCategory::Script,
            Self::JsonError(_) | Self::UuidError(_) | Self::InvalidData { .. } => {
                ErrorCategory::Serialization
            }
        }
    }
}

/// Error categories for monitoring and classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Connectivity,
    Configuration,
    ExternalLookup,
    Script,
    Serialization,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connectivity => write!(f, "connectivity"),
            Self::Configuration => write!(f, "configuration"),
            Self::ExternalLookup => write!(f, "external_lookup"),
            Self::Script => write!(f, "script"),
            Self::Serialization => write!(f, "serialization"),
        }
    }
}

/// Convenience result type for core operations
pub type Result<T> = std::result::Result<T, RollcallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_error() {
        let err = RollcallError::connectivity("connection refused");
        assert_eq!(
            err.to_string(),
            "Shared store unreachable: connection refused"
        );
        assert_eq!(err.category(), ErrorCategory::Connectivity);
    }

    #[test]
    fn test_configuration_error() {
        let err = RollcallError::configuration("cluster mode mismatch");
        assert_eq!(err.to_string(), "Configuration error: cluster mode mismatch");
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_external_lookup_category() {
        let err = RollcallError::external_lookup("timeout");
        assert_eq!(err.category(), ErrorCategory::ExternalLookup);
        assert_eq!(err.category().to_string(), "external_lookup");
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err: serde_json::Error =
            serde_json::from_str::<serde_json::Value>("{ invalid json }").unwrap_err();
        let err: RollcallError = json_err.into();

        assert!(matches!(err, RollcallError::JsonError(_)));
        assert_eq!(err.category(), ErrorCategory::Serialization);
    }

    #[test]
    fn test_invalid_data_message() {
        let err = RollcallError::invalid_data("player:abc", "online is not a number");
        assert!(err.to_string().contains("player:abc"));
        assert!(err.to_string().contains("online is not a number"));
    }

    #[test]
    fn test_error_categories_display() {
        assert_eq!(ErrorCategory::Connectivity.to_string(), "connectivity");
        assert_eq!(ErrorCategory::Configuration.to_string(), "configuration");
        assert_eq!(ErrorCategory::ExternalLookup.to_string(), "external_lookup");
        assert_eq!(ErrorCategory::Script.to_string(), "script");
        assert_eq!(ErrorCategory::Serialization.to_string(), "serialization");
    }
}
