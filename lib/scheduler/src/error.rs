//! Error types for the scheduler crate.
//!
//! Agent passes return these as `workweave_core::Result<T, AgentError>`:
//! - `AgentError`: Errors from one agent pass over its items
//! - `ConfigError`: Errors from loading agent configuration

use std::fmt;
use workweave_carrier::{BusError, StorageError};
use workweave_workflow::WorkflowError;

/// Errors from agent passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// Claiming, reading or releasing items failed.
    Storage(StorageError),
    /// Fetching or republishing events failed.
    Bus(BusError),
    /// Advancing a workflow failed.
    Workflow(WorkflowError),
    /// A carrier lifecycle operation failed.
    Carrier {
        operation: &'static str,
        message: String,
    },
}

impl AgentError {
    /// Wraps a failed carrier operation.
    #[must_use]
    pub fn carrier(operation: &'static str, error: impl fmt::Display) -> Self {
        Self::Carrier {
            operation,
            message: error.to_string(),
        }
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Bus(e) => write!(f, "bus error: {e}"),
            Self::Workflow(e) => write!(f, "workflow error: {e}"),
            Self::Carrier { operation, message } => {
                write!(f, "{operation} failed: {message}")
            }
        }
    }
}

impl std::error::Error for AgentError {}

impl From<StorageError> for AgentError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<BusError> for AgentError {
    fn from(e: BusError) -> Self {
        Self::Bus(e)
    }
}

impl From<WorkflowError> for AgentError {
    fn from(e: WorkflowError) -> Self {
        Self::Workflow(e)
    }
}

/// Errors from loading configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A source could not be read or deserialized.
    Load { reason: String },
    /// A value is out of range.
    Invalid { field: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load { reason } => write!(f, "failed to load configuration: {reason}"),
            Self::Invalid { field, reason } => {
                write!(f, "invalid configuration for '{field}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        Self::Load {
            reason: e.to_string(),
        }
    }
}
