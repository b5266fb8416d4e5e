use std::fmt;

use repository::RepositoryError;
use thiserror::Error;

/// The main error type for every settlement operation.
///
/// Failures raised inside the order transaction have already triggered a
/// rollback by the time the caller sees them.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request itself is malformed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A referenced product, wallet or order does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Off-sale product or contention under a no-wait lock.
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Currency or points shortfall.
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: i64,
        available: i32,
        requested: i32,
    },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The caller cancelled the operation or its deadline passed.
    #[error("Settlement cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    /// A repository operation failed.
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Caller-facing classification of a [`ServiceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    ResourceUnavailable,
    InsufficientFunds,
    InsufficientStock,
    AlreadyExists,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Stable snake_case label, used for logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ResourceUnavailable => "resource_unavailable",
            ErrorKind::InsufficientFunds => "insufficient_funds",
            ErrorKind::InsufficientStock => "insufficient_stock",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ServiceError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        ServiceError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::InvalidInput(_) => ErrorKind::InvalidInput,
            ServiceError::NotFound { .. } => ErrorKind::NotFound,
            ServiceError::ResourceUnavailable(_) => ErrorKind::ResourceUnavailable,
            ServiceError::InsufficientFunds(_) => ErrorKind::InsufficientFunds,
            ServiceError::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            ServiceError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            ServiceError::Cancelled => ErrorKind::Cancelled,
            ServiceError::Internal(_) => ErrorKind::Internal,
            ServiceError::Repository(err) => match err {
                RepositoryError::NotFound { .. } => ErrorKind::NotFound,
                RepositoryError::AlreadyExists(_) => ErrorKind::AlreadyExists,
                RepositoryError::LockNotAvailable(_) | RepositoryError::Deadlock => {
                    ErrorKind::ResourceUnavailable
                }
                RepositoryError::ConstraintViolation(_)
                | RepositoryError::MissingFilter(_)
                | RepositoryError::Db(_)
                | RepositoryError::Pool(_)
                | RepositoryError::Decode(_)
                | RepositoryError::Internal(_) => ErrorKind::Internal,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_errors_are_classified() {
        let lock = ServiceError::from(RepositoryError::LockNotAvailable("wallet 1".into()));
        assert_eq!(lock.kind(), ErrorKind::ResourceUnavailable);

        let missing = ServiceError::from(RepositoryError::not_found("order", "x"));
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let panic = ServiceError::from(RepositoryError::Internal("transaction aborted by panic".into()));
        assert_eq!(panic.kind(), ErrorKind::Internal);
    }

    #[test]
    fn stock_and_funds_are_distinct() {
        let stock = ServiceError::InsufficientStock {
            product_id: 3,
            available: 1,
            requested: 2,
        };
        assert_eq!(stock.kind(), ErrorKind::InsufficientStock);
        assert!(stock.to_string().contains("product 3"));
        assert_ne!(stock.kind(), ServiceError::InsufficientFunds("token".into()).kind());
    }
}
