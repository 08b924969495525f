//! Workflow definition types.
//!
//! A workflow consists of:
//! - Metadata (name, description, timestamps)
//! - A template of works, conditions and parameter links
//! - One run per loop iteration, each instantiating works from the template
//! - Global parameters shared by every work

use crate::condition::CompositeCondition;
use crate::error::{GraphError, WorkflowError};
use crate::execution::SyncReport;
use crate::graph::DependencyGraph;
use crate::node::{SubWorkflow, WorkNode};
use crate::parameter::{GlobalParameters, ParameterLink};
use crate::run::WorkflowRun;
use crate::status::WorkStatus;
use crate::work::Work;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use workweave_core::{TransformId, WorkId, WorkflowId};

/// Metadata for a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowMetadata {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// The static shape of a workflow: nodes, routing and parameter links.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    nodes: Vec<WorkNode>,
    conditions: Vec<CompositeCondition>,
    parameter_links: Vec<ParameterLink>,
    initial_works: Vec<WorkId>,
    loop_condition: Option<CompositeCondition>,
    /// Order cyclic dependencies instead of rejecting them.
    #[serde(default)]
    pub allow_dependency_cycles: bool,
}

impl WorkflowTemplate {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a work and returns its id.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::DuplicateWork` if the id is already present.
    pub fn add_work(&mut self, work: Work) -> Result<WorkId, WorkflowError> {
        self.add_node(WorkNode::from(work))
    }

    /// Nests a workflow as a single node.
    ///
    /// # Errors
    ///
    /// Never fails for a fresh id; shares the duplicate check with `add_work`.
    pub fn add_workflow(&mut self, workflow: Workflow) -> Result<WorkId, WorkflowError> {
        self.add_node(WorkNode::Workflow(SubWorkflow {
            id: WorkId::new(),
            workflow: Box::new(workflow),
            num_run: 0,
        }))
    }

    fn add_node(&mut self, node: WorkNode) -> Result<WorkId, WorkflowError> {
        let id = node.id();
        if self.node(id).is_some() {
            return Err(GraphError::DuplicateWork { work_id: id }.into());
        }
        self.nodes.push(node);
        Ok(id)
    }

    /// # Errors
    ///
    /// Returns `WorkflowError::WorkNotFound` if the condition reads or routes
    /// to a work outside the template.
    pub fn add_condition(&mut self, condition: CompositeCondition) -> Result<(), WorkflowError> {
        self.require_works(condition.pre_works().iter().chain(&condition.next_work_ids()))?;
        self.conditions.push(condition);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `WorkflowError::InvalidParameterLink` if either end is unknown.
    pub fn add_parameter_link(&mut self, link: ParameterLink) -> Result<(), WorkflowError> {
        if self.node(link.source).is_none() || self.node(link.destination).is_none() {
            return Err(WorkflowError::InvalidParameterLink { link_id: link.id });
        }
        self.parameter_links.push(link);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `WorkflowError::WorkNotFound` for an unknown work.
    pub fn add_initial_work(&mut self, work_id: WorkId) -> Result<(), WorkflowError> {
        self.require_works([&work_id])?;
        if !self.initial_works.contains(&work_id) {
            self.initial_works.push(work_id);
        }
        Ok(())
    }

    /// Sets the condition that decides whether another iteration starts
    /// once a run terminates.
    ///
    /// # Errors
    ///
    /// Returns an error if the condition is not a single predicate with
    /// work destinations, or reads an unknown work.
    pub fn set_loop_condition(&mut self, condition: CompositeCondition) -> Result<(), WorkflowError> {
        condition.validate_template()?;
        self.require_works(condition.pre_works().iter())?;
        self.loop_condition = Some(condition);
        Ok(())
    }

    fn require_works<'a>(&self, ids: impl IntoIterator<Item = &'a WorkId>) -> Result<(), WorkflowError> {
        for id in ids {
            if self.node(*id).is_none() {
                return Err(WorkflowError::WorkNotFound { work_id: *id });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn node(&self, id: WorkId) -> Option<&WorkNode> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    #[must_use]
    pub fn nodes(&self) -> &[WorkNode] {
        &self.nodes
    }

    #[must_use]
    pub fn conditions(&self) -> &[CompositeCondition] {
        &self.conditions
    }

    #[must_use]
    pub fn parameter_links(&self) -> &[ParameterLink] {
        &self.parameter_links
    }

    #[must_use]
    pub fn initial_works(&self) -> &[WorkId] {
        &self.initial_works
    }

    #[must_use]
    pub fn loop_condition(&self) -> Option<&CompositeCondition> {
        self.loop_condition.as_ref()
    }

    /// Works that no condition routes to, in template order.
    #[must_use]
    pub fn independent_works(&self) -> Vec<WorkId> {
        let routed: BTreeSet<WorkId> = self
            .conditions
            .iter()
            .flat_map(CompositeCondition::next_work_ids)
            .collect();
        self.nodes
            .iter()
            .map(WorkNode::id)
            .filter(|id| !routed.contains(id))
            .collect()
    }

    /// Independent works ordered so that every work follows the works it
    /// depends on.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::CycleDetected` unless cycles are allowed.
    pub fn independent_order(&self) -> Result<Vec<WorkId>, GraphError> {
        let independent = self
            .independent_works()
            .into_iter()
            .filter_map(|id| self.node(id));
        DependencyGraph::from_nodes(independent)?.order(self.allow_dependency_cycles)
    }
}

/// A workflow and its iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub metadata: WorkflowMetadata,
    pub template: WorkflowTemplate,
    /// Current iteration, starting at 1 once the first run exists.
    pub num_run: u32,
    runs: BTreeMap<u32, WorkflowRun>,
    pub global_parameters: GlobalParameters,
    pub to_cancel: bool,
}

impl Workflow {
    #[must_use]
    pub fn new(template: WorkflowTemplate) -> Self {
        Self {
            id: WorkflowId::new(),
            metadata: WorkflowMetadata::new(template.name.clone()),
            template,
            num_run: 0,
            runs: BTreeMap::new(),
            global_parameters: GlobalParameters::default(),
            to_cancel: false,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    #[must_use]
    pub fn current_run(&self) -> Option<&WorkflowRun> {
        self.runs.get(&self.num_run)
    }

    #[must_use]
    pub fn runs(&self) -> &BTreeMap<u32, WorkflowRun> {
        &self.runs
    }

    /// Advances the current run and starts the next iteration when the run
    /// has terminated and the loop condition holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the template cannot be instantiated.
    pub fn sync(&mut self) -> Result<SyncReport, WorkflowError> {
        if self.runs.is_empty() {
            self.num_run = 1;
        }
        let num_run = self.num_run;
        let run = self
            .runs
            .entry(num_run)
            .or_insert_with(|| WorkflowRun::new(num_run));
        let mut report = run.sync(&self.template, &mut self.global_parameters)?;

        if !run.is_terminated() || self.to_cancel {
            return Ok(report);
        }
        let Some(condition) = self.template.loop_condition() else {
            return Ok(report);
        };
        match run.evaluate(&self.template, condition) {
            Ok(true) => {}
            Ok(false) => return Ok(report),
            Err(e) => {
                tracing::warn!(error = %e, workflow = %self.metadata.name, "deferring loop condition");
                return Ok(report);
            }
        }

        let carried = run.link_values().clone();
        self.num_run += 1;
        tracing::info!(workflow = %self.metadata.name, num_run = self.num_run, "starting next iteration");
        let mut next = WorkflowRun::new(self.num_run).with_link_values(carried);
        let inner = next.sync(&self.template, &mut self.global_parameters)?;
        self.runs.insert(self.num_run, next);

        report.num_run = self.num_run;
        report.new_iteration = Some(self.num_run);
        report.absorb(inner);
        self.metadata.updated_at = Utc::now();
        Ok(report)
    }

    /// A workflow is terminated when its current run is and no further
    /// iteration will start.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        let Some(run) = self.current_run() else {
            return false;
        };
        if !run.is_terminated() {
            return false;
        }
        match self.template.loop_condition() {
            None => true,
            Some(_) if self.to_cancel => true,
            Some(condition) => matches!(run.evaluate(&self.template, condition), Ok(false)),
        }
    }

    #[must_use]
    pub fn get_status(&self) -> WorkStatus {
        match self.current_run() {
            None => WorkStatus::New,
            Some(run) if self.is_terminated() => run.status(),
            Some(_) => WorkStatus::Transforming,
        }
    }

    /// Syncs and returns every instantiated work the carrier has not picked
    /// up, nested workflows included.
    ///
    /// # Errors
    ///
    /// Returns an error if syncing fails.
    pub fn get_new_works(&mut self) -> Result<Vec<WorkId>, WorkflowError> {
        self.sync()?;
        Ok(self.new_works())
    }

    fn new_works(&self) -> Vec<WorkId> {
        let Some(run) = self.current_run() else {
            return Vec::new();
        };
        let mut works = run.new_works();
        works.extend(self.nested().flat_map(|sub| sub.new_works()));
        works
    }

    /// Works currently running, nested workflows included.
    #[must_use]
    pub fn get_current_works(&self) -> Vec<WorkId> {
        let Some(run) = self.current_run() else {
            return Vec::new();
        };
        let mut works: Vec<WorkId> = run
            .current_works()
            .iter()
            .copied()
            .filter(|id| run.node(*id).is_some_and(|n| n.as_work().is_some()))
            .collect();
        works.extend(self.nested().flat_map(Workflow::get_current_works));
        works
    }

    /// Every instantiated work of the current iteration.
    #[must_use]
    pub fn get_all_works(&self) -> Vec<&Work> {
        let Some(run) = self.current_run() else {
            return Vec::new();
        };
        let mut works: Vec<&Work> = run.works().values().filter_map(WorkNode::as_work).collect();
        works.extend(self.nested().flat_map(Workflow::get_all_works));
        works
    }

    fn nested(&self) -> impl Iterator<Item = &Workflow> {
        self.current_run()
            .into_iter()
            .flat_map(|run| run.works().values())
            .filter_map(|node| match node {
                WorkNode::Workflow(sub) => Some(&*sub.workflow),
                WorkNode::Work(_) => None,
            })
    }

    #[must_use]
    pub fn work(&self, id: WorkId) -> Option<&Work> {
        let run = self.current_run()?;
        if let Some(node) = run.node(id) {
            return node.as_work();
        }
        self.nested().find_map(|sub| sub.work(id))
    }

    pub fn work_mut(&mut self, id: WorkId) -> Option<&mut Work> {
        let run = self.runs.get_mut(&self.num_run)?;
        if run.node(id).is_some() {
            return run.node_mut(id).and_then(WorkNode::as_work_mut);
        }
        run.nodes_mut().find_map(|node| match node {
            WorkNode::Workflow(sub) => sub.workflow.work_mut(id),
            WorkNode::Work(_) => None,
        })
    }

    /// Records that the carrier started a work on a transform.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::WorkNotFound` if the work is not instantiated.
    pub fn start_work(&mut self, id: WorkId, transform_id: TransformId) -> Result<(), WorkflowError> {
        self.work_mut(id)
            .ok_or(WorkflowError::WorkNotFound { work_id: id })?
            .start(transform_id);
        Ok(())
    }

    /// Copies carrier-reported runtime state into an instantiated work.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::WorkNotFound` if the work is not instantiated.
    pub fn update_work(&mut self, id: WorkId, reported: &Work) -> Result<(), WorkflowError> {
        self.work_mut(id)
            .ok_or(WorkflowError::WorkNotFound { work_id: id })?
            .merge_runtime(reported);
        Ok(())
    }

    pub fn cancel(&mut self) {
        self.to_cancel = true;
        if let Some(run) = self.runs.get_mut(&self.num_run) {
            run.cancel();
        }
    }

    pub fn suspend(&mut self) {
        if let Some(run) = self.runs.get_mut(&self.num_run) {
            run.suspend();
        }
    }

    pub fn expire(&mut self) {
        if let Some(run) = self.runs.get_mut(&self.num_run) {
            run.expire();
        }
    }

    pub fn resume(&mut self) {
        self.to_cancel = false;
        if let Some(run) = self.runs.get_mut(&self.num_run) {
            run.resume();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::error::ConditionError;
    use crate::work::{DependencyItem, WorkCheck};
    use serde_json::json;

    fn complete(wf: &mut Workflow, id: WorkId, status: WorkStatus) {
        wf.start_work(id, TransformId::new()).unwrap();
        wf.work_mut(id).unwrap().set_status(status);
    }

    #[test]
    fn linear_three_stage_workflow() {
        let mut template = WorkflowTemplate::new("linear");
        let a = template.add_work(Work::new("a")).unwrap();
        let b = template.add_work(Work::new("b")).unwrap();
        let c = template.add_work(Work::new("c")).unwrap();
        template
            .add_condition(Condition::single(a, WorkCheck::IsFinished).then(b))
            .unwrap();
        template
            .add_condition(Condition::single(b, WorkCheck::IsFinished).then(c))
            .unwrap();
        let mut wf = Workflow::new(template);

        assert_eq!(wf.get_status(), WorkStatus::New);
        assert_eq!(wf.get_new_works().unwrap(), vec![a]);
        complete(&mut wf, a, WorkStatus::Finished);
        assert_eq!(wf.get_new_works().unwrap(), vec![b]);
        assert_eq!(wf.get_status(), WorkStatus::Transforming);
        complete(&mut wf, b, WorkStatus::Finished);
        assert_eq!(wf.get_new_works().unwrap(), vec![c]);
        complete(&mut wf, c, WorkStatus::Finished);
        assert!(wf.get_new_works().unwrap().is_empty());

        assert!(wf.is_terminated());
        assert_eq!(wf.get_status(), WorkStatus::Finished);
        assert_eq!(wf.get_all_works().len(), 3);
    }

    #[test]
    fn loop_starts_new_iteration_until_condition_fails() {
        let mut template = WorkflowTemplate::new("loop");
        let a = template.add_work(Work::new("a")).unwrap();
        let b = template.add_work(Work::new("b")).unwrap();
        template
            .set_loop_condition(Condition::single(b, WorkCheck::IsFinished))
            .unwrap();
        let mut wf = Workflow::new(template);

        assert_eq!(wf.get_new_works().unwrap(), vec![a, b]);
        complete(&mut wf, a, WorkStatus::Finished);
        complete(&mut wf, b, WorkStatus::Finished);

        let new = wf.get_new_works().unwrap();
        assert_eq!(wf.num_run, 2);
        assert_eq!(new, vec![a, b]);
        assert_eq!(wf.work(a).unwrap().num_run, 2);
        assert_eq!(wf.work(a).unwrap().status, WorkStatus::New);
        assert!(!wf.is_terminated());

        complete(&mut wf, a, WorkStatus::Failed);
        complete(&mut wf, b, WorkStatus::Failed);
        assert!(wf.get_new_works().unwrap().is_empty());
        assert!(wf.is_terminated());
        assert_eq!(wf.get_status(), WorkStatus::Failed);
        assert_eq!(wf.runs().len(), 2);
    }

    #[test]
    fn dependency_cycle_is_rejected_unless_allowed() {
        let mut template = WorkflowTemplate::new("cycle");
        let mut a = Work::new("a");
        let b = Work::new("b")
            .with_dependency_map(vec![DependencyItem::new("f1").depends_on("a", "f0")])
            .unwrap();
        a.depends_on.insert(b.id);
        template.add_work(a).unwrap();
        template.add_work(b).unwrap();

        let mut wf = Workflow::new(template.clone());
        assert!(matches!(
            wf.sync(),
            Err(WorkflowError::Graph(GraphError::CycleDetected { .. }))
        ));

        template.allow_dependency_cycles = true;
        let mut wf = Workflow::new(template);
        assert_eq!(wf.get_new_works().unwrap().len(), 2);
    }

    #[test]
    fn dependency_order_drives_starting_works() {
        let mut template = WorkflowTemplate::new("ordered");
        let late = Work::new("late")
            .with_dependency_map(vec![DependencyItem::new("f1").depends_on("early", "f0")])
            .unwrap();
        let late_id = template.add_work(late).unwrap();
        let early_id = template.add_work(Work::new("early")).unwrap();
        let mut wf = Workflow::new(template);

        assert_eq!(wf.get_new_works().unwrap(), vec![early_id, late_id]);
    }

    #[test]
    fn unknown_work_in_condition_defers_routing() {
        let mut template = WorkflowTemplate::new("defer");
        let a = template.add_work(Work::new("a")).unwrap();
        let b = template.add_work(Work::new("b")).unwrap();
        let ghost = WorkId::new();
        template.conditions.push(
            Condition::and()
                .when(a, WorkCheck::IsFinished)
                .when(ghost, WorkCheck::IsFinished)
                .then(b),
        );
        let mut wf = Workflow::new(template);

        wf.get_new_works().unwrap();
        complete(&mut wf, a, WorkStatus::Finished);
        let report = wf.sync().unwrap();

        assert_eq!(report.deferred, vec![a]);
        assert!(wf.get_current_works().contains(&a));
        assert!(!wf.is_terminated());
        assert!(matches!(
            wf.current_run()
                .unwrap()
                .evaluate(&wf.template, &wf.template.conditions[0]),
            Err(ConditionError::UnknownWork { .. })
        ));
    }

    #[test]
    fn global_parameters_flow_between_works() {
        let mut template = WorkflowTemplate::new("globals");
        let a = template.add_work(Work::new("a")).unwrap();
        let b = template.add_work(Work::new("b")).unwrap();
        template
            .add_condition(Condition::single(a, WorkCheck::IsFinished).then(b))
            .unwrap();
        let mut wf = Workflow::new(template);
        wf.global_parameters.set("user_tag", json!("v1")).unwrap();

        wf.get_new_works().unwrap();
        assert_eq!(wf.work(a).unwrap().attribute("user_tag"), Some(json!("v1")));
        complete(&mut wf, a, WorkStatus::Finished);
        wf.work_mut(a)
            .unwrap()
            .output_data
            .insert("user_tag".into(), json!("v2"));
        wf.get_new_works().unwrap();

        assert_eq!(wf.work(b).unwrap().attribute("user_tag"), Some(json!("v2")));
    }

    #[test]
    fn parameter_links_feed_destination_works() {
        let mut template = WorkflowTemplate::new("links");
        let a = template.add_work(Work::new("a").with_output_collection("a.out")).unwrap();
        let b = template.add_work(Work::new("b")).unwrap();
        template
            .add_condition(Condition::single(a, WorkCheck::IsFinished).then(b))
            .unwrap();
        template
            .add_parameter_link(
                ParameterLink::new(a, b).with("output_collections", "input_collections"),
            )
            .unwrap();
        let mut wf = Workflow::new(template);

        wf.get_new_works().unwrap();
        complete(&mut wf, a, WorkStatus::Finished);
        wf.get_new_works().unwrap();

        assert_eq!(wf.work(b).unwrap().input_collections, vec!["a.out".to_string()]);
    }

    #[test]
    fn nested_workflow_gates_parent_routing() {
        let mut inner = WorkflowTemplate::new("inner");
        let x = inner.add_work(Work::new("x")).unwrap();
        let mut outer = WorkflowTemplate::new("outer");
        let sub = outer.add_workflow(Workflow::new(inner)).unwrap();
        let y = outer.add_work(Work::new("y")).unwrap();
        outer
            .add_condition(Condition::single(sub, WorkCheck::IsFinished).then(y))
            .unwrap();
        let mut wf = Workflow::new(outer);

        assert_eq!(wf.get_new_works().unwrap(), vec![x]);
        complete(&mut wf, x, WorkStatus::Finished);
        assert_eq!(wf.get_new_works().unwrap(), vec![y]);
        complete(&mut wf, y, WorkStatus::Finished);
        wf.sync().unwrap();

        assert!(wf.is_terminated());
        assert_eq!(wf.get_status(), WorkStatus::Finished);
    }

    #[test]
    fn cancel_terminates_without_routing() {
        let mut template = WorkflowTemplate::new("cancel");
        let a = template.add_work(Work::new("a")).unwrap();
        let b = template.add_work(Work::new("b")).unwrap();
        template
            .add_condition(Condition::single(a, WorkCheck::IsTerminated).then(b))
            .unwrap();
        let mut wf = Workflow::new(template);
        wf.get_new_works().unwrap();
        wf.start_work(a, TransformId::new()).unwrap();
        wf.sync().unwrap();

        wf.cancel();
        assert_eq!(wf.work(a).unwrap().substatus, WorkStatus::ToCancel);
        wf.work_mut(a).unwrap().set_status(WorkStatus::Cancelled);
        assert!(wf.get_new_works().unwrap().is_empty());
        assert!(wf.is_terminated());
        assert_eq!(wf.get_status(), WorkStatus::Cancelled);
    }

    #[test]
    fn workflow_serde_roundtrip() {
        let mut template = WorkflowTemplate::new("serde");
        template.add_work(Work::new("a")).unwrap();
        let mut wf = Workflow::new(template);
        wf.sync().unwrap();

        let json = serde_json::to_string(&wf).unwrap();
        let parsed: Workflow = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, wf.id);
        assert_eq!(parsed.num_run, 1);
        assert_eq!(parsed.get_all_works().len(), 1);
    }
}
