//! Conditions gating advancement between works.
//!
//! A `CompositeCondition` combines predicates on works (or nested
//! conditions) with AND/OR and routes to a true or a false destination list.
//! Each destination carries a "triggered" flag in the condition's own
//! serializable state, so `next_works(TriggerFilter::ToTrigger)` returns a
//! destination at most once over the condition's lifetime.

use crate::error::ConditionError;
use crate::work::{Work, WorkCheck};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use workweave_core::{ConditionId, WorkId};

/// Read access to work state for predicate evaluation.
pub trait ConditionContext {
    /// Evaluates `check` on a work, or `None` if the work is unknown.
    fn check(&self, work_id: WorkId, check: WorkCheck) -> Option<bool>;
}

impl ConditionContext for BTreeMap<WorkId, Work> {
    fn check(&self, work_id: WorkId, check: WorkCheck) -> Option<bool> {
        self.get(&work_id).map(|work| work.check(check))
    }
}

/// Which destinations `next_works` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerFilter {
    /// Untriggered destinations; marks them triggered.
    ToTrigger,
    /// Untriggered destinations, read-only.
    NotTriggered,
    /// Already triggered destinations, read-only.
    Triggered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    And,
    Or,
}

/// A boolean check bound to one work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub work_id: WorkId,
    pub check: WorkCheck,
}

/// One operand of a composite condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionTerm {
    Predicate(Predicate),
    Composite(Box<CompositeCondition>),
}

/// Where a condition routes once evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Destination {
    Work { work_id: WorkId },
    Condition(Box<CompositeCondition>),
}

/// AND/OR composition of predicates with true and false destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeCondition {
    pub id: ConditionId,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub conditions: Vec<ConditionTerm>,
    #[serde(default)]
    pub true_works: Vec<Destination>,
    #[serde(default)]
    pub false_works: Vec<Destination>,
    /// Trigger state keyed by destination work id.
    #[serde(default)]
    triggered: BTreeMap<String, bool>,
}

/// A single-predicate condition.
pub type Condition = CompositeCondition;

impl CompositeCondition {
    #[must_use]
    pub fn new(operator: ConditionOperator) -> Self {
        Self {
            id: ConditionId::new(),
            operator,
            conditions: Vec::new(),
            true_works: Vec::new(),
            false_works: Vec::new(),
            triggered: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn and() -> Self {
        Self::new(ConditionOperator::And)
    }

    #[must_use]
    pub fn or() -> Self {
        Self::new(ConditionOperator::Or)
    }

    /// A condition with one predicate.
    #[must_use]
    pub fn single(work_id: WorkId, check: WorkCheck) -> Self {
        Self::and().when(work_id, check)
    }

    /// Adds a predicate.
    #[must_use]
    pub fn when(mut self, work_id: WorkId, check: WorkCheck) -> Self {
        self.conditions
            .push(ConditionTerm::Predicate(Predicate { work_id, check }));
        self
    }

    /// Adds a nested condition as an operand.
    #[must_use]
    pub fn when_all(mut self, nested: CompositeCondition) -> Self {
        self.conditions
            .push(ConditionTerm::Composite(Box::new(nested)));
        self
    }

    /// Adds a work to the true branch.
    #[must_use]
    pub fn then(mut self, work_id: WorkId) -> Self {
        self.true_works.push(Destination::Work { work_id });
        self
    }

    /// Adds a work to the false branch.
    #[must_use]
    pub fn otherwise(mut self, work_id: WorkId) -> Self {
        self.false_works.push(Destination::Work { work_id });
        self
    }

    /// Adds a nested condition to the true branch.
    #[must_use]
    pub fn then_condition(mut self, nested: CompositeCondition) -> Self {
        self.true_works
            .push(Destination::Condition(Box::new(nested)));
        self
    }

    /// Adds a nested condition to the false branch.
    #[must_use]
    pub fn otherwise_condition(mut self, nested: CompositeCondition) -> Self {
        self.false_works
            .push(Destination::Condition(Box::new(nested)));
        self
    }

    /// Evaluates the condition. Empty AND is true, empty OR is false.
    ///
    /// # Errors
    ///
    /// Returns an error if a predicate names a work the context does not know.
    pub fn evaluate(&self, ctx: &dyn ConditionContext) -> Result<bool, ConditionError> {
        for term in &self.conditions {
            let value = match term {
                ConditionTerm::Predicate(p) => ctx
                    .check(p.work_id, p.check)
                    .ok_or(ConditionError::UnknownWork { work_id: p.work_id })?,
                ConditionTerm::Composite(nested) => nested.evaluate(ctx)?,
            };
            match self.operator {
                ConditionOperator::And if !value => return Ok(false),
                ConditionOperator::Or if value => return Ok(true),
                _ => {}
            }
        }
        Ok(self.operator == ConditionOperator::And)
    }

    /// Returns the work destinations selected by the current evaluation.
    ///
    /// Nested destination conditions are followed and never returned
    /// themselves.
    ///
    /// # Errors
    ///
    /// Returns an error if evaluation fails; no trigger state is changed.
    pub fn next_works(
        &mut self,
        ctx: &dyn ConditionContext,
        filter: TriggerFilter,
    ) -> Result<Vec<WorkId>, ConditionError> {
        let value = self.evaluate(ctx)?;
        let branch = if value {
            &mut self.true_works
        } else {
            &mut self.false_works
        };

        let mut works = Vec::new();
        for destination in branch.iter_mut() {
            match destination {
                Destination::Work { work_id } => {
                    let key = work_id.to_string();
                    let fired = self.triggered.get(&key).copied().unwrap_or(false);
                    match filter {
                        TriggerFilter::ToTrigger if !fired => {
                            self.triggered.insert(key, true);
                            works.push(*work_id);
                        }
                        TriggerFilter::NotTriggered if !fired => works.push(*work_id),
                        TriggerFilter::Triggered if fired => works.push(*work_id),
                        _ => {}
                    }
                }
                Destination::Condition(nested) => {
                    works.extend(nested.next_works(ctx, filter)?);
                }
            }
        }
        Ok(works)
    }

    /// Returns true if the destination work has been triggered.
    #[must_use]
    pub fn is_triggered(&self, work_id: WorkId) -> bool {
        self.triggered
            .get(&work_id.to_string())
            .copied()
            .unwrap_or(false)
    }

    /// Works whose state this condition reads, including nested conditions.
    #[must_use]
    pub fn pre_works(&self) -> BTreeSet<WorkId> {
        let mut works = BTreeSet::new();
        for term in &self.conditions {
            match term {
                ConditionTerm::Predicate(p) => {
                    works.insert(p.work_id);
                }
                ConditionTerm::Composite(nested) => works.extend(nested.pre_works()),
            }
        }
        for destination in self.true_works.iter().chain(&self.false_works) {
            if let Destination::Condition(nested) = destination {
                works.extend(nested.pre_works());
            }
        }
        works
    }

    /// Every work this condition can route to, at any nesting depth.
    #[must_use]
    pub fn next_work_ids(&self) -> BTreeSet<WorkId> {
        let mut works = BTreeSet::new();
        for destination in self.true_works.iter().chain(&self.false_works) {
            match destination {
                Destination::Work { work_id } => {
                    works.insert(*work_id);
                }
                Destination::Condition(nested) => works.extend(nested.next_work_ids()),
            }
        }
        works
    }

    /// Checks the shape allowed for template (loop) conditions: exactly one
    /// predicate and only work destinations.
    ///
    /// # Errors
    ///
    /// Returns `ConditionError::InvalidTemplate` describing the violation.
    pub fn validate_template(&self) -> Result<(), ConditionError> {
        let invalid = |reason: &str| ConditionError::InvalidTemplate {
            condition_id: self.id,
            reason: reason.to_string(),
        };
        match self.conditions.as_slice() {
            [ConditionTerm::Predicate(_)] => {}
            [_] => return Err(invalid("the operand must be a predicate")),
            _ => return Err(invalid("exactly one predicate is required")),
        }
        let nested = self
            .true_works
            .iter()
            .chain(&self.false_works)
            .any(|d| matches!(d, Destination::Condition(_)));
        if nested {
            return Err(invalid("destinations must be works"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::WorkStatus;

    fn works(names: &[&str]) -> (BTreeMap<WorkId, Work>, Vec<WorkId>) {
        let mut map = BTreeMap::new();
        let mut ids = Vec::new();
        for name in names {
            let work = Work::new(*name);
            ids.push(work.id);
            map.insert(work.id, work);
        }
        (map, ids)
    }

    fn finish(map: &mut BTreeMap<WorkId, Work>, id: WorkId) {
        map.get_mut(&id).unwrap().set_status(WorkStatus::Finished);
    }

    #[test]
    fn trigger_is_idempotent() {
        let (mut map, ids) = works(&["a", "b"]);
        let mut cond = Condition::single(ids[0], WorkCheck::IsFinished).then(ids[1]);
        finish(&mut map, ids[0]);

        assert_eq!(
            cond.next_works(&map, TriggerFilter::ToTrigger).unwrap(),
            vec![ids[1]]
        );
        assert!(
            cond.next_works(&map, TriggerFilter::ToTrigger)
                .unwrap()
                .is_empty()
        );
        assert!(cond.is_triggered(ids[1]));
    }

    #[test]
    fn read_only_filters_do_not_mutate() {
        let (mut map, ids) = works(&["a", "b"]);
        let mut cond = Condition::single(ids[0], WorkCheck::IsFinished).then(ids[1]);
        finish(&mut map, ids[0]);

        assert_eq!(
            cond.next_works(&map, TriggerFilter::NotTriggered).unwrap(),
            vec![ids[1]]
        );
        assert!(
            cond.next_works(&map, TriggerFilter::Triggered)
                .unwrap()
                .is_empty()
        );
        assert!(!cond.is_triggered(ids[1]));

        cond.next_works(&map, TriggerFilter::ToTrigger).unwrap();
        assert_eq!(
            cond.next_works(&map, TriggerFilter::Triggered).unwrap(),
            vec![ids[1]]
        );
        assert!(
            cond.next_works(&map, TriggerFilter::NotTriggered)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn empty_operands() {
        let map: BTreeMap<WorkId, Work> = BTreeMap::new();
        assert!(CompositeCondition::and().evaluate(&map).unwrap());
        assert!(!CompositeCondition::or().evaluate(&map).unwrap());
    }

    #[test]
    fn and_or_semantics() {
        let (mut map, ids) = works(&["a", "b"]);
        finish(&mut map, ids[0]);

        let and = CompositeCondition::and()
            .when(ids[0], WorkCheck::IsFinished)
            .when(ids[1], WorkCheck::IsFinished);
        let or = CompositeCondition::or()
            .when(ids[0], WorkCheck::IsFinished)
            .when(ids[1], WorkCheck::IsFinished);

        assert!(!and.evaluate(&map).unwrap());
        assert!(or.evaluate(&map).unwrap());
    }

    #[test]
    fn false_branch_is_selected() {
        let (mut map, ids) = works(&["a", "ok", "recover"]);
        map.get_mut(&ids[0]).unwrap().set_status(WorkStatus::Failed);
        let mut cond = Condition::single(ids[0], WorkCheck::IsFinished)
            .then(ids[1])
            .otherwise(ids[2]);

        assert_eq!(
            cond.next_works(&map, TriggerFilter::ToTrigger).unwrap(),
            vec![ids[2]]
        );
    }

    #[test]
    fn nested_destination_returns_only_works() {
        let (mut map, ids) = works(&["a", "b", "c"]);
        finish(&mut map, ids[0]);
        finish(&mut map, ids[1]);

        let inner = Condition::single(ids[1], WorkCheck::IsFinished).then(ids[2]);
        let mut outer = Condition::single(ids[0], WorkCheck::IsFinished).then_condition(inner);

        assert_eq!(
            outer.next_works(&map, TriggerFilter::ToTrigger).unwrap(),
            vec![ids[2]]
        );
        assert!(
            outer.next_works(&map, TriggerFilter::ToTrigger)
                .unwrap()
                .is_empty()
        );
        assert_eq!(outer.next_work_ids(), BTreeSet::from([ids[2]]));
        assert_eq!(outer.pre_works(), BTreeSet::from([ids[0], ids[1]]));
    }

    #[test]
    fn nested_operand() {
        let (mut map, ids) = works(&["a", "b", "c"]);
        finish(&mut map, ids[2]);

        let either = CompositeCondition::or()
            .when(ids[0], WorkCheck::IsFinished)
            .when(ids[1], WorkCheck::IsFinished);
        let cond = CompositeCondition::and()
            .when(ids[2], WorkCheck::IsFinished)
            .when_all(either);
        assert!(!cond.evaluate(&map).unwrap());

        finish(&mut map, ids[1]);
        assert!(cond.evaluate(&map).unwrap());
    }

    #[test]
    fn unknown_work_is_an_error() {
        let map: BTreeMap<WorkId, Work> = BTreeMap::new();
        let ghost = WorkId::new();
        let mut cond = Condition::single(ghost, WorkCheck::IsFinished).then(WorkId::new());

        assert_eq!(
            cond.next_works(&map, TriggerFilter::ToTrigger),
            Err(ConditionError::UnknownWork { work_id: ghost })
        );
    }

    #[test]
    fn trigger_state_survives_serialization() {
        let (mut map, ids) = works(&["a", "b"]);
        let mut cond = Condition::single(ids[0], WorkCheck::IsFinished).then(ids[1]);
        finish(&mut map, ids[0]);
        cond.next_works(&map, TriggerFilter::ToTrigger).unwrap();

        let json = serde_json::to_string(&cond).expect("serialize");
        let mut reloaded: CompositeCondition = serde_json::from_str(&json).expect("deserialize");
        assert!(
            reloaded.next_works(&map, TriggerFilter::ToTrigger)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn template_validation() {
        let a = WorkId::new();
        assert!(Condition::single(a, WorkCheck::IsFinished)
            .then(WorkId::new())
            .validate_template()
            .is_ok());

        let two = CompositeCondition::and()
            .when(a, WorkCheck::IsFinished)
            .when(a, WorkCheck::IsFailed);
        assert!(two.validate_template().is_err());

        let nested = Condition::single(a, WorkCheck::IsFinished)
            .then_condition(Condition::single(a, WorkCheck::IsFinished));
        assert!(nested.validate_template().is_err());
    }

    #[test]
    fn linear_three_stage_dag() {
        let (mut map, ids) = works(&["a", "b", "c"]);
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        let mut a_to_b = Condition::single(a, WorkCheck::IsFinished).then(b);
        let mut b_to_c = Condition::single(b, WorkCheck::IsFinished).then(c);

        finish(&mut map, a);
        assert_eq!(a_to_b.next_works(&map, TriggerFilter::ToTrigger).unwrap(), vec![b]);
        assert!(b_to_c.next_works(&map, TriggerFilter::ToTrigger).unwrap().is_empty());

        finish(&mut map, b);
        assert_eq!(b_to_c.next_works(&map, TriggerFilter::ToTrigger).unwrap(), vec![c]);

        assert!(a_to_b.next_works(&map, TriggerFilter::ToTrigger).unwrap().is_empty());
        assert!(b_to_c.next_works(&map, TriggerFilter::ToTrigger).unwrap().is_empty());
    }
}
