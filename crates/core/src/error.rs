//! Error types for the TaskMind domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; every variant classifies into
//! one [`ErrorKind`] so callers can decide between recovering, retrying and
//! discarding without matching on context-specific details.

use thiserror::Error;

/// The top-level error type for all TaskMind operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Session errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Persistence errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification shared by every bounded context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Session or record absent. Recovered locally.
    NotFound,
    /// Contention on a serialized resource. Retried.
    Conflict,
    /// Model, index or store unreachable.
    ServiceUnavailable,
    /// Malformed model output.
    ParseError,
    /// Schema violation on task fields.
    ValidationError,
    /// Token budget cannot fit even the newest turn.
    CapacityExceeded,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Session(e) => e.kind(),
            Self::Memory(e) => e.kind(),
            Self::Provider(e) => e.kind(),
            Self::Store(e) => e.kind(),
        }
    }
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Session not found or expired: {0}")]
    NotFound(String),

    #[error("Session {session} belongs to another user than {user}")]
    OwnerMismatch { session: String, user: String },
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::OwnerMismatch { .. } => ErrorKind::ValidationError,
        }
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Memory index unavailable: {0}")]
    Unavailable(String),
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DimensionMismatch { .. } => ErrorKind::ValidationError,
            Self::Storage(_) | Self::EmbeddingFailed(_) | Self::Unavailable(_) => {
                ErrorKind::ServiceUnavailable
            }
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Network(_) => true,
            Self::ApiError { status_code, .. } => *status_code >= 500,
            Self::AuthenticationFailed(_) | Self::NotConfigured(_) | Self::InvalidResponse(_) => false,
        }
    }

    /// Minimum wait the provider asked for before the next request.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Self::RateLimited { retry_after_secs } => {
                Some(std::time::Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidResponse(_) => ErrorKind::ParseError,
            _ => ErrorKind::ServiceUnavailable,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unavailable(_) | Self::Storage(_) | Self::MigrationFailed(_) => {
                ErrorKind::ServiceUnavailable
            }
        }
    }
}
