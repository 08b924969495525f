//! A single iteration of a workflow.
//!
//! Each run instantiates works from the template, promotes them as the
//! carrier starts them, and evaluates conditions when they terminate.
//! Works a condition routes to are instantiated into the same run.

use crate::condition::{CompositeCondition, ConditionContext, TriggerFilter};
use crate::definition::WorkflowTemplate;
use crate::error::{ConditionError, WorkflowError};
use crate::execution::SyncReport;
use crate::node::WorkNode;
use crate::parameter::GlobalParameters;
use crate::status::{TerminalCounts, WorkStatus};
use crate::work::WorkCheck;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use workweave_core::WorkId;

/// Condition view over one run. Template works that have not been
/// instantiated yet read as `New`.
struct RunView<'a> {
    template: &'a WorkflowTemplate,
    works: &'a BTreeMap<WorkId, WorkNode>,
}

impl ConditionContext for RunView<'_> {
    fn check(&self, work_id: WorkId, check: WorkCheck) -> Option<bool> {
        if let Some(node) = self.works.get(&work_id) {
            return Some(node.check(check));
        }
        self.template
            .node(work_id)
            .map(|_| check.matches_status(WorkStatus::New, false))
    }
}

/// State of one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub num_run: u32,
    works: BTreeMap<WorkId, WorkNode>,
    conditions: Vec<CompositeCondition>,
    new_to_run: Vec<WorkId>,
    current_running: Vec<WorkId>,
    terminated: Vec<WorkId>,
    initialized: bool,
    to_cancel: bool,
    /// Values collected from parameter links, keyed by destination work.
    link_values: BTreeMap<WorkId, BTreeMap<String, JsonValue>>,
    last_workload_id: Option<String>,
    counts: TerminalCounts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    #[must_use]
    pub fn new(num_run: u32) -> Self {
        let now = Utc::now();
        Self {
            num_run,
            works: BTreeMap::new(),
            conditions: Vec::new(),
            new_to_run: Vec::new(),
            current_running: Vec::new(),
            terminated: Vec::new(),
            initialized: false,
            to_cancel: false,
            link_values: BTreeMap::new(),
            last_workload_id: None,
            counts: TerminalCounts::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Seeds link values carried over from the previous iteration.
    #[must_use]
    pub fn with_link_values(
        mut self,
        values: BTreeMap<WorkId, BTreeMap<String, JsonValue>>,
    ) -> Self {
        self.link_values = values;
        self
    }

    #[must_use]
    pub fn link_values(&self) -> &BTreeMap<WorkId, BTreeMap<String, JsonValue>> {
        &self.link_values
    }

    #[must_use]
    pub fn works(&self) -> &BTreeMap<WorkId, WorkNode> {
        &self.works
    }

    #[must_use]
    pub fn node(&self, id: WorkId) -> Option<&WorkNode> {
        self.works.get(&id)
    }

    pub fn node_mut(&mut self, id: WorkId) -> Option<&mut WorkNode> {
        self.works.get_mut(&id)
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut WorkNode> {
        self.works.values_mut()
    }

    /// Instantiated works the carrier has not picked up yet.
    #[must_use]
    pub fn new_works(&self) -> Vec<WorkId> {
        self.new_to_run
            .iter()
            .copied()
            .filter(|id| self.works.get(id).is_some_and(|n| !n.is_started()))
            .collect()
    }

    #[must_use]
    pub fn current_works(&self) -> &[WorkId] {
        &self.current_running
    }

    #[must_use]
    pub fn terminated_works(&self) -> &[WorkId] {
        &self.terminated
    }

    #[must_use]
    pub fn counts(&self) -> &TerminalCounts {
        &self.counts
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// A run is terminated once it has started and nothing is left running
    /// or waiting. Cancellation drops the waiting works.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.initialized
            && (self.to_cancel || self.new_to_run.is_empty())
            && self.current_running.is_empty()
    }

    #[must_use]
    pub fn status(&self) -> WorkStatus {
        if self.is_terminated() {
            self.counts.aggregate()
        } else {
            WorkStatus::Transforming
        }
    }

    /// Evaluates a condition against this run's works.
    ///
    /// # Errors
    ///
    /// Returns an error if the condition names a work the template does not
    /// contain.
    pub fn evaluate(
        &self,
        template: &WorkflowTemplate,
        condition: &CompositeCondition,
    ) -> Result<bool, ConditionError> {
        condition.evaluate(&RunView {
            template,
            works: &self.works,
        })
    }

    /// Advances the run: instantiates starting works on first call, promotes
    /// started works, and routes every newly terminated work through the
    /// conditions keyed on it.
    ///
    /// A condition that fails to evaluate leaves its work running so the
    /// next sync retries it.
    ///
    /// # Errors
    ///
    /// Returns an error if the template cannot be ordered or a destination
    /// is missing from it.
    pub fn sync(
        &mut self,
        template: &WorkflowTemplate,
        globals: &mut GlobalParameters,
    ) -> Result<SyncReport, WorkflowError> {
        let mut report = SyncReport::new(self.num_run);

        if !self.initialized {
            self.conditions = template.conditions().to_vec();
            for id in starting_works(template)? {
                self.instantiate(template, globals, id, &mut report)?;
            }
            self.initialized = true;
        }

        self.promote();

        for id in self.current_running.clone() {
            if let Some(WorkNode::Workflow(sub)) = self.works.get_mut(&id) {
                report.absorb(sub.workflow.sync()?);
            }
        }

        for id in self.current_running.clone() {
            let Some(node) = self.works.get(&id) else {
                continue;
            };
            if !node.is_terminated() {
                continue;
            }

            for link in template.parameter_links().iter().filter(|l| l.source == id) {
                let values = link.collect(node);
                self.link_values
                    .entry(link.destination)
                    .or_default()
                    .extend(values);
            }
            if let Some(work) = node.as_work() {
                if globals.sync_from(work) {
                    tracing::debug!(work = %work.name, "global parameters updated");
                }
                if work.workload_id.is_some() {
                    self.last_workload_id.clone_from(&work.workload_id);
                }
            }

            if !self.to_cancel {
                match self.trigger_conditions(template, id) {
                    Ok(next) => {
                        for dest in next {
                            self.instantiate(template, globals, dest, &mut report)?;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, work = %id, "deferring condition evaluation");
                        report.deferred.push(id);
                        continue;
                    }
                }
            }

            self.current_running.retain(|w| *w != id);
            self.terminated.push(id);
            report.terminated.push(id);
        }

        self.promote();
        self.recount();
        self.updated_at = Utc::now();
        Ok(report)
    }

    /// Runs every condition keyed on `id` whose instantiated pre-works have
    /// all terminated. Trigger state only changes if every condition
    /// evaluates cleanly.
    fn trigger_conditions(
        &mut self,
        template: &WorkflowTemplate,
        id: WorkId,
    ) -> Result<Vec<WorkId>, ConditionError> {
        let view = RunView {
            template,
            works: &self.works,
        };
        let mut trials = Vec::new();
        for (index, condition) in self.conditions.iter().enumerate() {
            let pre_works = condition.pre_works();
            if !pre_works.contains(&id) {
                continue;
            }
            let waiting = pre_works
                .iter()
                .any(|w| self.works.get(w).is_some_and(|n| !n.is_terminated()));
            if waiting {
                continue;
            }
            let mut trial = condition.clone();
            let next = trial.next_works(&view, TriggerFilter::ToTrigger)?;
            trials.push((index, trial, next));
        }

        let mut next_works = Vec::new();
        for (index, trial, next) in trials {
            self.conditions[index] = trial;
            next_works.extend(next);
        }
        Ok(next_works)
    }

    fn instantiate(
        &mut self,
        template: &WorkflowTemplate,
        globals: &mut GlobalParameters,
        id: WorkId,
        report: &mut SyncReport,
    ) -> Result<(), WorkflowError> {
        if self.works.contains_key(&id) {
            return Ok(());
        }
        let mut node = template
            .node(id)
            .cloned()
            .ok_or(WorkflowError::WorkNotFound { work_id: id })?;
        node.set_num_run(self.num_run);
        if let Some(work) = node.as_work_mut() {
            globals.apply_to(work);
            work.parent_workload_id.clone_from(&self.last_workload_id);
            work.sequence_id = u32::try_from(self.works.len()).unwrap_or(u32::MAX);
        }
        if let Some(values) = self.link_values.get(&id) {
            node.apply_values(values);
        }
        if let WorkNode::Workflow(sub) = &mut node {
            report.absorb(sub.workflow.sync()?);
        }

        tracing::debug!(work = %node.name(), num_run = self.num_run, "instantiated work");
        self.works.insert(id, node);
        self.new_to_run.push(id);
        report.instantiated.push(id);
        Ok(())
    }

    fn promote(&mut self) {
        let (started, waiting): (Vec<WorkId>, Vec<WorkId>) = self
            .new_to_run
            .iter()
            .copied()
            .partition(|id| self.works.get(id).is_some_and(WorkNode::is_started));
        self.new_to_run = waiting;
        self.current_running.extend(started);
    }

    fn recount(&mut self) {
        self.counts = TerminalCounts::from_statuses(self.works.values().map(WorkNode::status));
    }

    /// Cancels running works and stops routing new ones.
    pub fn cancel(&mut self) {
        self.to_cancel = true;
        for id in &self.current_running {
            if let Some(node) = self.works.get_mut(id) {
                node.cancel();
            }
        }
    }

    pub fn suspend(&mut self) {
        for id in &self.current_running {
            if let Some(node) = self.works.get_mut(id) {
                node.suspend();
            }
        }
    }

    pub fn expire(&mut self) {
        for id in &self.current_running {
            if let Some(node) = self.works.get_mut(id) {
                node.expire();
            }
        }
    }

    /// Resumes running works and moves unfinished terminated works back to
    /// running.
    pub fn resume(&mut self) {
        self.to_cancel = false;
        let (retry, keep): (Vec<WorkId>, Vec<WorkId>) =
            self.terminated.iter().copied().partition(|id| {
                self.works
                    .get(id)
                    .is_some_and(|n| n.status() != WorkStatus::Finished)
            });
        self.terminated = keep;
        self.current_running.extend(retry);
        for id in &self.current_running {
            if let Some(node) = self.works.get_mut(id) {
                node.resume();
            }
        }
        self.recount();
    }
}

/// Explicit initial works, else the dependency-ordered independent works,
/// else the first template node.
fn starting_works(template: &WorkflowTemplate) -> Result<Vec<WorkId>, WorkflowError> {
    if !template.initial_works().is_empty() {
        return Ok(template.initial_works().to_vec());
    }
    let order = template.independent_order()?;
    if !order.is_empty() {
        return Ok(order);
    }
    Ok(template.nodes().first().map(|n| vec![n.id()]).unwrap_or_default())
}
