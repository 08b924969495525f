//! Nodes of a workflow template.
//!
//! A node is either a plain work or a nested workflow. Nested workflows are
//! driven by their parent and report an aggregate status computed from their
//! own runs.

use crate::definition::Workflow;
use crate::parameter::{AttributeSource, apply_link_values};
use crate::status::WorkStatus;
use crate::work::{Work, WorkCheck};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use workweave_core::WorkId;

/// A nested workflow placed inside a parent template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubWorkflow {
    /// Identity of this node in the parent template.
    pub id: WorkId,
    pub workflow: Box<Workflow>,
    /// Iteration of the parent run that instantiated this copy.
    pub num_run: u32,
}

/// A template node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkNode {
    Work(Box<Work>),
    Workflow(SubWorkflow),
}

impl WorkNode {
    #[must_use]
    pub fn id(&self) -> WorkId {
        match self {
            Self::Work(work) => work.id,
            Self::Workflow(sub) => sub.id,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Work(work) => &work.name,
            Self::Workflow(sub) => &sub.workflow.metadata.name,
        }
    }

    #[must_use]
    pub fn status(&self) -> WorkStatus {
        match self {
            Self::Work(work) => work.status,
            Self::Workflow(sub) => sub.workflow.get_status(),
        }
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        match self {
            Self::Work(work) => work.is_terminated(),
            Self::Workflow(sub) => sub.workflow.is_terminated(),
        }
    }

    /// Nested workflows start as soon as they are instantiated.
    #[must_use]
    pub fn is_started(&self) -> bool {
        match self {
            Self::Work(work) => work.is_started(),
            Self::Workflow(_) => true,
        }
    }

    /// Evaluates a check against this node. Custom checks only apply to
    /// plain works.
    #[must_use]
    pub fn check(&self, check: WorkCheck) -> bool {
        match self {
            Self::Work(work) => work.check(check),
            Self::Workflow(sub) => {
                check.matches_status(sub.workflow.get_status(), sub.workflow.is_terminated())
            }
        }
    }

    #[must_use]
    pub fn as_work(&self) -> Option<&Work> {
        match self {
            Self::Work(work) => Some(work),
            Self::Workflow(_) => None,
        }
    }

    pub fn as_work_mut(&mut self) -> Option<&mut Work> {
        match self {
            Self::Work(work) => Some(work),
            Self::Workflow(_) => None,
        }
    }

    pub fn set_num_run(&mut self, num_run: u32) {
        match self {
            Self::Work(work) => work.num_run = num_run,
            Self::Workflow(sub) => sub.num_run = num_run,
        }
    }

    /// Writes parameter link values into the node. Nested workflows accept
    /// them as global parameters.
    pub fn apply_values(&mut self, values: &BTreeMap<String, JsonValue>) {
        match self {
            Self::Work(work) => apply_link_values(values, work),
            Self::Workflow(sub) => {
                for (name, value) in values {
                    if let Err(e) = sub
                        .workflow
                        .global_parameters
                        .set(name.clone(), value.clone())
                    {
                        tracing::warn!(
                            error = %e,
                            workflow = %sub.workflow.metadata.name,
                            "dropping linked value"
                        );
                    }
                }
            }
        }
    }

    pub fn cancel(&mut self) {
        match self {
            Self::Work(work) => work.cancel(),
            Self::Workflow(sub) => sub.workflow.cancel(),
        }
    }

    pub fn suspend(&mut self) {
        match self {
            Self::Work(work) => work.suspend(),
            Self::Workflow(sub) => sub.workflow.suspend(),
        }
    }

    pub fn expire(&mut self) {
        match self {
            Self::Work(work) => work.expire(),
            Self::Workflow(sub) => sub.workflow.expire(),
        }
    }

    pub fn resume(&mut self) {
        match self {
            Self::Work(work) => work.resume(),
            Self::Workflow(sub) => sub.workflow.resume(),
        }
    }
}

impl AttributeSource for WorkNode {
    fn attribute(&self, name: &str) -> Option<JsonValue> {
        match self {
            Self::Work(work) => work.attribute(name),
            Self::Workflow(sub) => match name {
                "name" => Some(JsonValue::from(sub.workflow.metadata.name.clone())),
                "status" => Some(JsonValue::from(sub.workflow.get_status().as_str())),
                "num_run" => Some(JsonValue::from(sub.workflow.num_run)),
                _ => sub.workflow.global_parameters.get(name).cloned(),
            },
        }
    }
}

impl From<Work> for WorkNode {
    fn from(work: Work) -> Self {
        Self::Work(Box::new(work))
    }
}
