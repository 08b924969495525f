//! Workflow engine for workweave.
//!
//! This crate provides the workflow model the agents drive, including:
//!
//! - **Works**: Units of processing with dependency maps and operator intents
//! - **Conditions**: Composite predicates over work states that route to next works
//! - **Workflows**: Templates instantiated into runs, with loops, nesting and parameters
//! - **State machines**: Status vocabularies for works, processings and collections
//! - **Ordering**: Dependency graphs over independent works using petgraph

pub mod collection;
pub mod condition;
pub mod definition;
pub mod error;
pub mod execution;
pub mod graph;
pub mod node;
pub mod parameter;
pub mod processing;
pub mod run;
pub mod status;
pub mod work;

pub use collection::{Collection, CollectionCounters, ExtCounters};
pub use condition::{
    CompositeCondition, Condition, ConditionContext, ConditionOperator, ConditionTerm,
    Destination, Predicate, TriggerFilter,
};
pub use definition::{Workflow, WorkflowMetadata, WorkflowTemplate};
pub use error::{ConditionError, GraphError, WorkError, WorkflowError};
pub use execution::SyncReport;
pub use graph::DependencyGraph;
pub use node::{SubWorkflow, WorkNode};
pub use parameter::{
    AttributeSource, GlobalParameters, LinkedParameter, ParameterLink, SlicedParameter,
};
pub use processing::Processing;
pub use run::WorkflowRun;
pub use status::{
    CollectionRelationType, CollectionStatus, Locking, ProcessingStatus, TerminalCounts,
    WorkStatus,
};
pub use work::{
    CustomConditions, CustomMode, DependencyItem, ErrorAnnotations, TaskDependency, Work,
    WorkCheck,
};
