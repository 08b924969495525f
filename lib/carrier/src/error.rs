//! Error types for the carrier crate.
//!
//! - `StorageError`: persistent storage collaborator
//! - `RemoteError`: remote execution service client
//! - `CacheError`: dependency map cache
//! - `BusError`: event bus
//! - `CarrierError`: processing lifecycle operations (wraps the others)

use std::fmt;
use workweave_core::ProcessingId;
use workweave_workflow::WorkError;

/// Errors from the storage layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Optimistic locking lost a race; the caller may retry.
    Conflict { entity: String },
    /// A row the caller expected does not exist.
    NotFound { entity: String, id: String },
    /// The backend failed.
    Backend { message: String },
}

impl StorageError {
    /// Returns true for the serialization conflict class retried with backoff.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict { entity } => write!(f, "serialization conflict on {entity}"),
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Backend { message } => write!(f, "storage backend error: {message}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Errors from the remote execution service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The service could not be reached or timed out.
    Unavailable { message: String },
    /// The service does not know the task.
    TaskNotFound { external_id: String },
    /// The service answered with something that could not be interpreted.
    InvalidResponse { message: String },
}

impl RemoteError {
    /// Transient failures are treated as "still running".
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { message } => write!(f, "remote service unavailable: {message}"),
            Self::TaskNotFound { external_id } => write!(f, "remote task not found: {external_id}"),
            Self::InvalidResponse { message } => write!(f, "invalid remote response: {message}"),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Errors from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    Backend { message: String },
    /// A cached value did not decode into the expected shape.
    Codec { key: String, message: String },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend { message } => write!(f, "cache backend error: {message}"),
            Self::Codec { key, message } => write!(f, "cache value for {key} unreadable: {message}"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Errors from the event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    ConnectionFailed { message: String },
    PublishFailed { message: String },
    FetchFailed { message: String },
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { message } => write!(f, "event bus connection failed: {message}"),
            Self::PublishFailed { message } => write!(f, "event publish failed: {message}"),
            Self::FetchFailed { message } => write!(f, "event fetch failed: {message}"),
        }
    }
}

impl std::error::Error for BusError {}

/// Errors from processing lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarrierError {
    Storage(StorageError),
    Remote(RemoteError),
    Cache(CacheError),
    Bus(BusError),
    Work(WorkError),
    /// The processing row disappeared while it was being handled.
    ProcessingNotFound { processing_id: ProcessingId },
    /// No execution backend is registered for the work's kind.
    UnknownBackend { work_kind: String },
    /// The processing snapshot carries a work that never started.
    WorkNotStarted { processing_id: ProcessingId },
}

impl fmt::Display for CarrierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Remote(e) => write!(f, "remote error: {e}"),
            Self::Cache(e) => write!(f, "cache error: {e}"),
            Self::Bus(e) => write!(f, "bus error: {e}"),
            Self::Work(e) => write!(f, "work error: {e}"),
            Self::ProcessingNotFound { processing_id } => {
                write!(f, "processing not found: {processing_id}")
            }
            Self::UnknownBackend { work_kind } => {
                write!(f, "no execution backend for work kind '{work_kind}'")
            }
            Self::WorkNotStarted { processing_id } => {
                write!(f, "processing {processing_id} holds a work without a transform")
            }
        }
    }
}

impl std::error::Error for CarrierError {}

impl From<StorageError> for CarrierError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<RemoteError> for CarrierError {
    fn from(e: RemoteError) -> Self {
        Self::Remote(e)
    }
}

impl From<CacheError> for CarrierError {
    fn from(e: CacheError) -> Self {
        Self::Cache(e)
    }
}

impl From<BusError> for CarrierError {
    fn from(e: BusError) -> Self {
        Self::Bus(e)
    }
}

impl From<WorkError> for CarrierError {
    fn from(e: WorkError) -> Self {
        Self::Work(e)
    }
}
