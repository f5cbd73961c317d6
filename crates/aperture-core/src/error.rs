//! Error types module
//!
//! All errors surfaced by the ingestion API are unified under [`AppError`]. Each variant
//! describes itself through [`ErrorMetadata`] so a transport layer can map it to a
//! response without matching on variants.
//!
//! The `Database` variant carries a `sqlx::Error` when the `sqlx` feature is enabled and
//! a plain message otherwise.

use std::io;

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Expected errors such as validation failures
    Debug,
    /// Recoverable issues
    Warn,
    /// Unexpected failures
    Error,
}

/// Metadata describing how an error should be presented to a client.
pub trait ErrorMetadata {
    /// HTTP status code to return
    fn http_status_code(&self) -> u16;

    /// Machine-readable error code (e.g., "NOT_FOUND")
    fn error_code(&self) -> &'static str;

    /// Whether this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Suggested action for the client
    fn suggested_action(&self) -> Option<&'static str>;

    /// Client-facing message (may differ from internal error message)
    fn client_message(&self) -> String;

    /// Whether details should be hidden from clients
    fn is_sensitive(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[cfg(not(feature = "sqlx"))]
    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("File too large: {0}")]
    PayloadTooLarge(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error with source")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for AppError {
    fn from(err: SqlxError) -> Self {
        AppError::Database(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::Internal(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        AppError::InvalidInput(format!("UUID parsing error: {}", err))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::InvalidInput(format!("Validation error: {}", err))
    }
}

/// Static presentation attributes of one error class.
struct ErrorClass {
    status: u16,
    code: &'static str,
    recoverable: bool,
    action: Option<&'static str>,
    sensitive: bool,
    level: LogLevel,
}

const MAX_SOURCE_DEPTH: usize = 5;

const RETRY_LATER: Option<&str> = Some("Retry after a short delay");

const DATABASE: ErrorClass = ErrorClass {
    status: 500,
    code: "DATABASE_ERROR",
    recoverable: true,
    action: RETRY_LATER,
    sensitive: true,
    level: LogLevel::Error,
};
const STORAGE: ErrorClass = ErrorClass {
    status: 502,
    code: "STORAGE_ERROR",
    recoverable: true,
    action: RETRY_LATER,
    sensitive: true,
    level: LogLevel::Error,
};
const INVALID_INPUT: ErrorClass = ErrorClass {
    status: 400,
    code: "INVALID_INPUT",
    recoverable: false,
    action: Some("Fix the request and send it again"),
    sensitive: false,
    level: LogLevel::Debug,
};
const NOT_FOUND: ErrorClass = ErrorClass {
    status: 404,
    code: "NOT_FOUND",
    recoverable: false,
    action: Some("Check the asset id and owner"),
    sensitive: false,
    level: LogLevel::Debug,
};
const CONFLICT: ErrorClass = ErrorClass {
    status: 409,
    code: "CONFLICT",
    recoverable: false,
    action: Some("Reload the asset state before retrying"),
    sensitive: false,
    level: LogLevel::Debug,
};
const UNSUPPORTED: ErrorClass = ErrorClass {
    status: 501,
    code: "NOT_SUPPORTED",
    recoverable: false,
    action: Some("Use the proxied upload or download path"),
    sensitive: false,
    level: LogLevel::Debug,
};
const PAYLOAD_TOO_LARGE: ErrorClass = ErrorClass {
    status: 413,
    code: "PAYLOAD_TOO_LARGE",
    recoverable: false,
    action: Some("Upload a smaller file"),
    sensitive: false,
    level: LogLevel::Debug,
};
const INTERNAL: ErrorClass = ErrorClass {
    status: 500,
    code: "INTERNAL_ERROR",
    recoverable: true,
    action: RETRY_LATER,
    sensitive: true,
    level: LogLevel::Error,
};

impl AppError {
    fn class(&self) -> &'static ErrorClass {
        match self {
            AppError::Database(_) => &DATABASE,
            AppError::Storage(_) => &STORAGE,
            AppError::InvalidInput(_) => &INVALID_INPUT,
            AppError::NotFound(_) => &NOT_FOUND,
            AppError::Conflict(_) => &CONFLICT,
            AppError::Unsupported(_) => &UNSUPPORTED,
            AppError::PayloadTooLarge(_) => &PAYLOAD_TOO_LARGE,
            AppError::Internal(_) | AppError::InternalWithSource { .. } => &INTERNAL,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }

    /// Error message including the source chain
    pub fn detailed_message(&self) -> String {
        use std::error::Error;

        let mut details = self.to_string();

        let mut source = self.source();
        for _ in 0..MAX_SOURCE_DEPTH {
            let Some(err) = source else {
                return details;
            };
            details.push_str(&format!("\n  caused by: {}", err));
            source = err.source();
        }
        if source.is_some() {
            details.push_str("\n  ...");
        }
        details
    }
}

impl ErrorMetadata for AppError {
    fn http_status_code(&self) -> u16 {
        self.class().status
    }

    fn error_code(&self) -> &'static str {
        self.class().code
    }

    fn is_recoverable(&self) -> bool {
        self.class().recoverable
    }

    fn suggested_action(&self) -> Option<&'static str> {
        self.class().action
    }

    fn is_sensitive(&self) -> bool {
        self.class().sensitive
    }

    fn log_level(&self) -> LogLevel {
        self.class().level
    }

    fn client_message(&self) -> String {
        match self {
            AppError::Database(_) => "Asset records are temporarily unavailable".to_string(),
            AppError::Storage(_) => "Asset storage is temporarily unavailable".to_string(),
            AppError::Internal(_) | AppError::InternalWithSource { .. } => {
                "Internal server error".to_string()
            }
            AppError::InvalidInput(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::Unsupported(msg)
            | AppError::PayloadTooLarge(msg) => msg.clone(),
        }
    }
}
