use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    /// The gateway could not be reached at all (connection refused, DNS, timeout).
    #[error("{gateway} gateway unavailable: {message}")]
    GatewayUnavailable {
        gateway: &'static str,
        message: String,
    },

    /// The gateway answered, but with a non-success status or an unusable payload.
    #[error("{gateway} gateway declined the request (status {status}): {message}")]
    GatewayDeclined {
        gateway: &'static str,
        status: u16,
        message: String,
    },

    #[error("Embedding dimension mismatch: collection expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Timed out after {seconds}s during {operation}")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl RagError {
    /// Whether the caller may reasonably retry the failed operation.
    ///
    /// Nothing inside the crate retries index operations; this is for callers
    /// that own a retry policy.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::GatewayUnavailable { .. } | Self::Timeout { .. } => true,
            Self::GatewayDeclined { status, .. } => *status >= 500,
            Self::DimensionMismatch { .. }
            | Self::IndexUnavailable(_)
            | Self::Validation(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Other(_) => false,
        }
    }
}

pub mod commands;
pub mod config;
pub mod gateway;
pub mod index;
pub mod retrieval;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let unavailable = RagError::GatewayUnavailable {
            gateway: "embedding",
            message: "connection refused".to_string(),
        };
        assert!(unavailable.is_retryable());

        let timeout = RagError::Timeout {
            operation: "query",
            seconds: 30,
        };
        assert!(timeout.is_retryable());

        let server_error = RagError::GatewayDeclined {
            gateway: "summarization",
            status: 503,
            message: "overloaded".to_string(),
        };
        assert!(server_error.is_retryable());

        let client_error = RagError::GatewayDeclined {
            gateway: "embedding",
            status: 422,
            message: "bad payload".to_string(),
        };
        assert!(!client_error.is_retryable());

        assert!(
            !RagError::DimensionMismatch {
                expected: 384,
                actual: 768
            }
            .is_retryable()
        );
        assert!(!RagError::Validation("empty query".to_string()).is_retryable());
    }

    #[test]
    fn error_messages_name_the_gateway() {
        let err = RagError::GatewayDeclined {
            gateway: "embedding",
            status: 500,
            message: "boom".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "embedding gateway declined the request (status 500): boom"
        );
    }
}
