//! Core identifiers and error handling for workweave.
//!
//! This crate provides the strongly-typed ids and the `Result` alias shared by
//! the workflow engine, the carrier (content and reconciliation engine) and
//! the agents that schedule them.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{
    CollectionId, ConditionId, ContentId, ParameterLinkId, ParseIdError, ProcessingId, RequestId,
    TransformId, WorkId, WorkflowId,
};
