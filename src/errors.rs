use sea_orm::error::DbErr;
use serde::Serialize;

/// Error type shared by every ledger operation.
///
/// The HTTP layer consuming this library owns the mapping to status codes
/// (via [`ServiceError::kind`]); the ledger itself never speaks HTTP.
#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    /// Stable machine-readable label for this error.
    /// This is the single source of truth collaborators map onward.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "storage_failure",
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) => "validation_error",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::InsufficientStock(_) => "insufficient_stock",
            Self::EventError(_) => "event_error",
            Self::InternalError(_) | Self::Other(_) => "internal_error",
        }
    }

    /// Whether retrying the whole unit of work may succeed.
    ///
    /// Lock contention and busy timeouts from a concurrently-accessed store
    /// abort the transaction cleanly; nothing partial is left behind, so the
    /// caller may simply retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DatabaseError(err) => {
                let msg = err.to_string().to_lowercase();
                msg.contains("locked") || msg.contains("busy") || msg.contains("timed out")
            }
            _ => false,
        }
    }
}

/// Backwards-compatible alias used by the db/config plumbing.
pub type AppError = ServiceError;
