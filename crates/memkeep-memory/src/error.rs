//! Error taxonomy for the memory engine.

use std::fmt;

use thiserror::Error;

/// Low-level failure raised by the store, an embedding provider, or file I/O.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl MemoryError {
    /// True for failures that stem from setup rather than a single call.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::DimensionMismatch { .. })
    }
}

pub type MemoryResult<T> = std::result::Result<T, MemoryError>;

/// Engine operation that produced an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    Search,
    List,
    Export,
    Import,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Add => "add memory",
            Self::Search => "search memories",
            Self::List => "get memories",
            Self::Export => "export memories",
            Self::Import => "import memories",
        };
        f.write_str(s)
    }
}

/// Failure of a single engine operation, tagged with the operation name.
#[derive(Debug, Error)]
#[error("Failed to {operation}: {source}")]
pub struct EngineError {
    pub operation: Operation,
    #[source]
    pub source: MemoryError,
}

impl EngineError {
    pub fn new(operation: Operation, source: MemoryError) -> Self {
        Self { operation, source }
    }
}

/// Attach an [`Operation`] to a [`MemoryResult`].
pub(crate) trait OperationContext<T> {
    fn during(self, operation: Operation) -> Result<T, EngineError>;
}

impl<T> OperationContext<T> for MemoryResult<T> {
    fn during(self, operation: Operation) -> Result<T, EngineError> {
        self.map_err(|source| EngineError::new(operation, source))
    }
}
