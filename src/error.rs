//! Errors - Raw store errors and the caller-facing taxonomy
//!
//! TigerStyle: Drivers and the router return raw [`StoreError`]s. Only the
//! RPC facade converts them into a [`ServiceError`].

/// Result alias for drivers, the registry and the router.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result alias for the RPC facade.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

// =============================================================================
// StoreError
// =============================================================================

/// Raw errors raised below the facade.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Record, collection or series does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// No usable backend node could be resolved or reached
    #[error("not available: {0}")]
    NotAvailable(String),

    /// Database, table or collection name rejected before reaching a backend
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Operation attempted on a closed connection
    #[error("connection closed")]
    Closed,

    /// Network-level failure talking to a backend
    #[error("connection error: {0}")]
    Connection(String),

    /// Backend answered with an error
    #[error("backend error: {0}")]
    Backend(String),

    /// Record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Registry lookup failed
    #[error("registry error: {0}")]
    Registry(String),

    /// Record field outside the accepted range
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

impl StoreError {
    /// Create a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a not-available error.
    pub fn not_available(what: impl Into<String>) -> Self {
        Self::NotAvailable(what.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Create a registry error.
    pub fn registry(message: impl Into<String>) -> Self {
        Self::Registry(message.into())
    }

    /// Whether this is a not-found outcome.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

// =============================================================================
// ServiceError
// =============================================================================

/// Caller-facing error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// Malformed request; never retried
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Expected miss
    #[error("not found: {0}")]
    NotFound(String),

    /// No backend node could serve the request
    #[error("not available: {0}")]
    NotAvailable(String),

    /// Any other backend failure
    #[error("internal server error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Create a bad-request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::NotAvailable(_) => "not_available",
            Self::Internal(_) => "internal_server_error",
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::NotAvailable(_) | StoreError::Connection(_) | StoreError::Registry(_) => {
                Self::NotAvailable(err.to_string())
            }
            StoreError::InvalidName(_) | StoreError::InvalidRecord(_) => {
                Self::BadRequest(err.to_string())
            }
            StoreError::Closed | StoreError::Backend(_) | StoreError::Serialization(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(matches!(
            ServiceError::from(StoreError::not_found("x")),
            ServiceError::NotFound(_)
        ));
        assert!(matches!(
            ServiceError::from(StoreError::not_available("db")),
            ServiceError::NotAvailable(_)
        ));
        assert!(matches!(
            ServiceError::from(StoreError::connection("refused")),
            ServiceError::NotAvailable(_)
        ));
        assert!(matches!(
            ServiceError::from(StoreError::InvalidName("a b".into())),
            ServiceError::BadRequest(_)
        ));
        assert!(matches!(
            ServiceError::from(StoreError::InvalidRecord("updated".into())),
            ServiceError::BadRequest(_)
        ));
        assert!(matches!(
            ServiceError::from(StoreError::backend("syntax error")),
            ServiceError::Internal(_)
        ));
        assert!(matches!(
            ServiceError::from(StoreError::Closed),
            ServiceError::Internal(_)
        ));
    }

    #[test]
    fn test_codes() {
        assert_eq!(ServiceError::bad_request("x").code(), "bad_request");
        assert_eq!(ServiceError::Internal("x".into()).code(), "internal_server_error");
    }
}
