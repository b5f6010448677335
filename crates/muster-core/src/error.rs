use thiserror::Error;

/// Core error type for MUSTER operations.
#[derive(Error, Debug)]
pub enum MusterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    /// The registry call itself failed (network, timeout, backend down).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The registry understood the request and refused it.
    #[error("Registry rejected request ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MusterError {
    /// Build a rejection error from a non-success registry status.
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether the error came from the registry refusing the request.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

impl From<serde_json::Error> for MusterError {
    fn from(e: serde_json::Error) -> Self {
        MusterError::Serialization(e.to_string())
    }
}

impl From<sqlx::Error> for MusterError {
    fn from(e: sqlx::Error) -> Self {
        MusterError::Database(e.to_string())
    }
}

/// Result type alias using MusterError.
pub type Result<T> = std::result::Result<T, MusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_display() {
        let err = MusterError::rejected("SERVICE_ALREADY_EXISTS", "duplicate");
        assert!(err.is_rejected());
        assert_eq!(
            err.to_string(),
            "Registry rejected request (SERVICE_ALREADY_EXISTS): duplicate"
        );
    }

    #[test]
    fn test_from_serde_json() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: MusterError = parse_err.into();
        assert!(matches!(err, MusterError::Serialization(_)));
    }

    #[test]
    fn test_from_sqlx_is_database_error() {
        let err: MusterError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, MusterError::Database(_)));
        assert!(err.to_string().starts_with("Database error: "));
    }
}
