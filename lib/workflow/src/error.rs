//! Error types for the workflow crate.
//!
//! - `GraphError`: dependency ordering between works
//! - `ConditionError`: condition evaluation and template validation
//! - `WorkError`: validation of work definitions (dependency maps, parameters)
//! - `WorkflowError`: high-level workflow operations (wraps the others)

use workweave_core::{ConditionId, ParameterLinkId, WorkId};
use std::fmt;

/// Errors from ordering works by their declared dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Work with the given ID was not found in the template.
    UnknownWork { work_id: WorkId },
    /// A work was added twice.
    DuplicateWork { work_id: WorkId },
    /// Declared dependencies form a cycle.
    CycleDetected { works: Vec<WorkId> },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownWork { work_id } => write!(f, "work not found: {work_id}"),
            Self::DuplicateWork { work_id } => write!(f, "work already exists: {work_id}"),
            Self::CycleDetected { works } => {
                let names: Vec<String> = works.iter().map(ToString::to_string).collect();
                write!(f, "dependency cycle between works: {}", names.join(", "))
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors from conditions.
///
/// An evaluation error is a scheduling bug: callers log it and defer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    /// A predicate refers to a work the workflow does not know.
    UnknownWork { work_id: WorkId },
    /// A condition used as a template does not have the allowed shape.
    InvalidTemplate {
        condition_id: ConditionId,
        reason: String,
    },
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownWork { work_id } => {
                write!(f, "condition refers to unknown work {work_id}")
            }
            Self::InvalidTemplate {
                condition_id,
                reason,
            } => write!(f, "invalid template condition {condition_id}: {reason}"),
        }
    }
}

impl std::error::Error for ConditionError {}

/// Validation errors raised when a work definition is mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkError {
    /// A dependency map item has an empty name.
    EmptyItemName,
    /// A dependency map item name exceeds the length limit.
    ItemNameTooLong { name: String, limit: usize },
    /// Two dependency map items share a name.
    DuplicateItem { name: String },
    /// An item lists the same (task, input) dependency twice.
    DuplicateDependency {
        item: String,
        task: String,
        input_name: String,
    },
    /// Global parameters must be prefixed with `user_`.
    InvalidGlobalParameter { name: String },
}

impl fmt::Display for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyItemName => write!(f, "dependency map item has an empty name"),
            Self::ItemNameTooLong { name, limit } => {
                write!(f, "dependency map item name longer than {limit}: {name}")
            }
            Self::DuplicateItem { name } => {
                write!(f, "duplicate dependency map item: {name}")
            }
            Self::DuplicateDependency {
                item,
                task,
                input_name,
            } => write!(
                f,
                "item {item} depends on ({task}, {input_name}) more than once"
            ),
            Self::InvalidGlobalParameter { name } => {
                write!(f, "global parameter '{name}' must start with 'user_'")
            }
        }
    }
}

impl std::error::Error for WorkError {}

/// High-level workflow errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// Work not found in the template or the current run.
    WorkNotFound { work_id: WorkId },
    /// Parameter link refers to a work that is not part of the template.
    InvalidParameterLink { link_id: ParameterLinkId },
    /// Ordering error.
    Graph(GraphError),
    /// Condition error.
    Condition(ConditionError),
    /// Work validation error.
    Work(WorkError),
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkNotFound { work_id } => write!(f, "work not found: {work_id}"),
            Self::InvalidParameterLink { link_id } => {
                write!(f, "parameter link {link_id} refers to an unknown work")
            }
            Self::Graph(e) => write!(f, "graph error: {e}"),
            Self::Condition(e) => write!(f, "condition error: {e}"),
            Self::Work(e) => write!(f, "work error: {e}"),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<GraphError> for WorkflowError {
    fn from(e: GraphError) -> Self {
        Self::Graph(e)
    }
}

impl From<ConditionError> for WorkflowError {
    fn from(e: ConditionError) -> Self {
        Self::Condition(e)
    }
}

impl From<WorkError> for WorkflowError {
    fn from(e: WorkError) -> Self {
        Self::Work(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_lists_works() {
        let a = WorkId::new();
        let b = WorkId::new();
        let err = GraphError::CycleDetected { works: vec![a, b] };
        let text = err.to_string();
        assert!(text.contains(&a.to_string()));
        assert!(text.contains(&b.to_string()));
    }

    #[test]
    fn duplicate_dependency_display() {
        let err = WorkError::DuplicateDependency {
            item: "out_1".to_string(),
            task: "stage_a".to_string(),
            input_name: "in_1".to_string(),
        };
        assert!(err.to_string().contains("(stage_a, in_1)"));
    }

    #[test]
    fn workflow_error_wraps_condition_error() {
        let work_id = WorkId::new();
        let err: WorkflowError = ConditionError::UnknownWork { work_id }.into();
        assert!(err.to_string().contains("unknown work"));
    }
}
