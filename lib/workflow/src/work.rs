//! Works: the schedulable units of a workflow.
//!
//! A work is a template description of one computation. The run instantiates
//! a copy per iteration and the carrier keeps a snapshot of it inside each
//! processing, so every field here must serialize.

use crate::error::WorkError;
use crate::status::WorkStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use workweave_core::{ProcessingId, TransformId, WorkId};

/// Longest accepted dependency map item name.
pub const MAX_ITEM_NAME_LENGTH: usize = 4000;

/// Execution backend used when a work does not name one.
pub const DEFAULT_WORK_KIND: &str = "batch";

/// One (producing task, input name) pair an item depends on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskDependency {
    /// Name of the producing work.
    pub task: String,
    /// Name of the output of that work consumed here.
    pub input_name: String,
}

impl TaskDependency {
    #[must_use]
    pub fn new(task: impl Into<String>, input_name: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            input_name: input_name.into(),
        }
    }
}

/// One entry of a work's content-level dependency map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyItem {
    /// Output name produced by this item.
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<TaskDependency>,
    /// Items sharing a group are bundled into one job (event service).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_map_id: Option<u64>,
}

impl DependencyItem {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            group: None,
            sub_map_id: None,
        }
    }

    #[must_use]
    pub fn depends_on(mut self, task: impl Into<String>, input_name: impl Into<String>) -> Self {
        self.dependencies.push(TaskDependency::new(task, input_name));
        self
    }

    #[must_use]
    pub fn in_group(mut self, group: impl Into<String>, sub_map_id: u64) -> Self {
        self.group = Some(group.into());
        self.sub_map_id = Some(sub_map_id);
        self
    }
}

/// Validates a dependency map.
///
/// # Errors
///
/// Returns an error for empty or over-long names, duplicate item names and
/// duplicate (task, input) pairs within an item.
pub fn validate_dependency_map(items: &[DependencyItem]) -> Result<(), WorkError> {
    let mut names = BTreeSet::new();
    for item in items {
        if item.name.is_empty() {
            return Err(WorkError::EmptyItemName);
        }
        if item.name.len() > MAX_ITEM_NAME_LENGTH {
            return Err(WorkError::ItemNameTooLong {
                name: item.name.clone(),
                limit: MAX_ITEM_NAME_LENGTH,
            });
        }
        if !names.insert(item.name.as_str()) {
            return Err(WorkError::DuplicateItem {
                name: item.name.clone(),
            });
        }

        let mut seen = BTreeSet::new();
        for dep in &item.dependencies {
            if !seen.insert((dep.task.as_str(), dep.input_name.as_str())) {
                return Err(WorkError::DuplicateDependency {
                    item: item.name.clone(),
                    task: dep.task.clone(),
                    input_name: dep.input_name.clone(),
                });
            }
        }
    }
    Ok(())
}

/// How a set of custom conditions combines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomMode {
    And,
    Or,
}

/// Named expected values checked against a work's output data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomConditions {
    #[serde(default)]
    pub and: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub or: BTreeMap<String, JsonValue>,
}

/// Predicate a condition can ask of a work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkCheck {
    IsStarted,
    IsTerminated,
    IsFinished,
    IsSubFinished,
    /// Finished or sub-finished.
    IsProcessed,
    IsFailed,
    IsExpired,
    IsCancelled,
    IsSuspended,
    CustomAnd,
    CustomOr,
}

impl WorkCheck {
    /// Evaluates a status-only check.
    ///
    /// Custom checks need the work's data and are always false here.
    #[must_use]
    pub fn matches_status(&self, status: WorkStatus, terminated: bool) -> bool {
        match self {
            Self::IsStarted => status != WorkStatus::New,
            Self::IsTerminated => terminated,
            Self::IsFinished => terminated && status == WorkStatus::Finished,
            Self::IsSubFinished => terminated && status == WorkStatus::SubFinished,
            Self::IsProcessed => {
                terminated && matches!(status, WorkStatus::Finished | WorkStatus::SubFinished)
            }
            Self::IsFailed => {
                terminated && matches!(status, WorkStatus::Failed | WorkStatus::Broken)
            }
            Self::IsExpired => terminated && status == WorkStatus::Expired,
            Self::IsCancelled => terminated && status == WorkStatus::Cancelled,
            Self::IsSuspended => terminated && status == WorkStatus::Suspended,
            Self::CustomAnd | Self::CustomOr => false,
        }
    }
}

/// Named error categories recorded against a work or processing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorAnnotations(BTreeMap<String, String>);

impl ErrorAnnotations {
    /// Records a message under a category, replacing only that category.
    pub fn record(&mut self, category: impl Into<String>, message: impl Into<String>) {
        self.0.insert(category.into(), message.into());
    }

    /// Merges another set in. Categories it does not mention are kept.
    pub fn merge(&mut self, other: &ErrorAnnotations) {
        for (category, message) in &other.0 {
            self.0.insert(category.clone(), message.clone());
        }
    }

    #[must_use]
    pub fn get(&self, category: &str) -> Option<&str> {
        self.0.get(category).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// One schedulable unit of computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub id: WorkId,
    pub name: String,
    /// Selects the execution backend.
    #[serde(default = "default_work_kind")]
    pub work_kind: String,
    /// Persisted transform, set once the work has started.
    pub transform_id: Option<TransformId>,
    /// Remote workload (task) id of the current processing.
    pub workload_id: Option<String>,
    /// Workload id of the work instantiated before this one.
    pub parent_workload_id: Option<String>,
    pub status: WorkStatus,
    pub substatus: WorkStatus,
    /// Set once the work has ever started.
    pub transforming: bool,
    pub processings: Vec<ProcessingId>,
    #[serde(default)]
    pub input_collections: Vec<String>,
    #[serde(default)]
    pub output_collections: Vec<String>,
    #[serde(default)]
    pub log_collections: Vec<String>,
    /// Results visible to downstream conditions and parameter links.
    #[serde(default)]
    pub output_data: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub parameters: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub custom_conditions: CustomConditions,
    /// Loop iteration that instantiated this work.
    pub num_run: u32,
    pub max_attempts: u32,
    #[serde(default)]
    dependency_map: Vec<DependencyItem>,
    /// Explicit ordering dependencies on other works of the template.
    #[serde(default)]
    pub depends_on: BTreeSet<WorkId>,
    /// More inputs remain to be mapped from the dependency map.
    pub has_new_inputs: bool,
    /// The work itself keeps producing inputs.
    pub generating_new_inputs: bool,
    pub sequence_id: u32,
    #[serde(default)]
    pub errors: ErrorAnnotations,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_work_kind() -> String {
    DEFAULT_WORK_KIND.to_string()
}

impl Work {
    /// Creates a new work in `New` status.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkId::new(),
            name: name.into(),
            work_kind: default_work_kind(),
            transform_id: None,
            workload_id: None,
            parent_workload_id: None,
            status: WorkStatus::New,
            substatus: WorkStatus::New,
            transforming: false,
            processings: Vec::new(),
            input_collections: Vec::new(),
            output_collections: Vec::new(),
            log_collections: Vec::new(),
            output_data: BTreeMap::new(),
            parameters: BTreeMap::new(),
            custom_conditions: CustomConditions::default(),
            num_run: 0,
            max_attempts: 3,
            dependency_map: Vec::new(),
            depends_on: BTreeSet::new(),
            has_new_inputs: true,
            generating_new_inputs: false,
            sequence_id: 0,
            errors: ErrorAnnotations::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the execution backend.
    #[must_use]
    pub fn with_kind(mut self, work_kind: impl Into<String>) -> Self {
        self.work_kind = work_kind.into();
        self
    }

    /// Adds an output collection name.
    #[must_use]
    pub fn with_output_collection(mut self, name: impl Into<String>) -> Self {
        self.output_collections.push(name.into());
        self
    }

    /// Adds an input collection name.
    #[must_use]
    pub fn with_input_collection(mut self, name: impl Into<String>) -> Self {
        self.input_collections.push(name.into());
        self
    }

    /// Sets a validated dependency map.
    ///
    /// # Errors
    ///
    /// Returns the validation error; the previous map is kept.
    pub fn with_dependency_map(mut self, items: Vec<DependencyItem>) -> Result<Self, WorkError> {
        self.set_dependency_map(items)?;
        Ok(self)
    }

    /// Replaces the dependency map after validating it.
    ///
    /// # Errors
    ///
    /// Returns the validation error; the previous map is kept.
    pub fn set_dependency_map(&mut self, items: Vec<DependencyItem>) -> Result<(), WorkError> {
        validate_dependency_map(&items)?;
        self.dependency_map = items;
        self.has_new_inputs = true;
        self.touch();
        Ok(())
    }

    #[must_use]
    pub fn dependency_map(&self) -> &[DependencyItem] {
        &self.dependency_map
    }

    /// Names of the works this one consumes outputs from.
    #[must_use]
    pub fn dependency_tasks(&self) -> BTreeSet<&str> {
        self.dependency_map
            .iter()
            .flat_map(|item| item.dependencies.iter().map(|d| d.task.as_str()))
            .collect()
    }

    /// Returns true if this work must run after `other`.
    #[must_use]
    pub fn depends_on_work(&self, other: &Work) -> bool {
        self.depends_on.contains(&other.id) || self.dependency_tasks().contains(other.name.as_str())
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.transforming
    }

    /// Terminal status with no pending operator intent.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.status.is_terminal() && !self.substatus.is_operator_intent()
    }

    /// Evaluates a condition predicate against this work.
    #[must_use]
    pub fn check(&self, check: WorkCheck) -> bool {
        match check {
            WorkCheck::CustomAnd => self.custom_condition_holds(CustomMode::And),
            WorkCheck::CustomOr => self.custom_condition_holds(CustomMode::Or),
            WorkCheck::IsStarted => self.transforming,
            other => other.matches_status(self.status, self.is_terminated()),
        }
    }

    /// Adds an expected value under the given mode.
    pub fn add_custom_condition(
        &mut self,
        key: impl Into<String>,
        value: JsonValue,
        mode: CustomMode,
    ) {
        match mode {
            CustomMode::And => self.custom_conditions.and.insert(key.into(), value),
            CustomMode::Or => self.custom_conditions.or.insert(key.into(), value),
        };
    }

    /// OR holds when any entry matches, AND when all do. Empty is false.
    #[must_use]
    pub fn custom_condition_holds(&self, mode: CustomMode) -> bool {
        let expected = match mode {
            CustomMode::And => &self.custom_conditions.and,
            CustomMode::Or => &self.custom_conditions.or,
        };
        if expected.is_empty() {
            return false;
        }
        let matches = |(key, value): (&String, &JsonValue)| {
            self.attribute(key).as_ref() == Some(value)
        };
        match mode {
            CustomMode::And => expected.iter().all(matches),
            CustomMode::Or => expected.iter().any(matches),
        }
    }

    /// Reads a named value: output data, then parameters, then built-ins.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<JsonValue> {
        if let Some(value) = self.output_data.get(name) {
            return Some(value.clone());
        }
        if let Some(value) = self.parameters.get(name) {
            return Some(value.clone());
        }
        match name {
            "name" => Some(JsonValue::from(self.name.clone())),
            "num_run" => Some(JsonValue::from(self.num_run)),
            "status" => Some(JsonValue::from(self.status.as_str())),
            "workload_id" => self.workload_id.clone().map(JsonValue::from),
            "input_collections" => Some(JsonValue::from(self.input_collections.clone())),
            "output_collections" => Some(JsonValue::from(self.output_collections.clone())),
            _ => None,
        }
    }

    /// Writes a named value. Collection lists are set directly, anything
    /// else becomes a parameter.
    pub fn set_attribute(&mut self, name: &str, value: JsonValue) {
        let as_names = |value: &JsonValue| -> Option<Vec<String>> {
            match value {
                JsonValue::String(s) => Some(vec![s.clone()]),
                JsonValue::Array(items) => items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => None,
            }
        };
        match name {
            "input_collections" if as_names(&value).is_some() => {
                self.input_collections = as_names(&value).unwrap_or_default();
            }
            "output_collections" if as_names(&value).is_some() => {
                self.output_collections = as_names(&value).unwrap_or_default();
            }
            _ => {
                self.parameters.insert(name.to_string(), value);
            }
        }
        self.touch();
    }

    /// Sets status and substatus together.
    pub fn set_status(&mut self, status: WorkStatus) {
        self.status = status;
        self.substatus = status;
        self.touch();
    }

    /// Marks the work as started on the given transform.
    pub fn start(&mut self, transform_id: TransformId) {
        self.transform_id = Some(transform_id);
        self.transforming = true;
        if matches!(self.status, WorkStatus::New | WorkStatus::Ready) {
            self.set_status(WorkStatus::Transforming);
        }
    }

    fn request(&mut self, intent: WorkStatus) {
        if self.is_terminated() {
            return;
        }
        self.substatus = intent;
        self.touch();
    }

    pub fn cancel(&mut self) {
        self.request(WorkStatus::ToCancel);
    }

    pub fn suspend(&mut self) {
        self.request(WorkStatus::ToSuspend);
    }

    pub fn expire(&mut self) {
        self.request(WorkStatus::ToExpire);
    }

    pub fn finish(&mut self) {
        self.request(WorkStatus::ToFinish);
    }

    pub fn force_finish(&mut self) {
        self.request(WorkStatus::ToForceFinish);
    }

    /// Requests a resume and clears stale errors.
    pub fn resume(&mut self) {
        if !matches!(self.status, WorkStatus::New | WorkStatus::Ready) {
            self.status = WorkStatus::Transforming;
        }
        self.substatus = WorkStatus::ToResume;
        self.errors.clear();
        self.touch();
    }

    /// Copies runtime state reported by the carrier into this instance.
    pub fn merge_runtime(&mut self, reported: &Work) {
        self.status = reported.status;
        self.substatus = reported.substatus;
        self.workload_id.clone_from(&reported.workload_id);
        self.has_new_inputs = reported.has_new_inputs;
        for (key, value) in &reported.output_data {
            self.output_data.insert(key.clone(), value.clone());
        }
        for id in &reported.processings {
            if !self.processings.contains(id) {
                self.processings.push(*id);
            }
        }
        self.errors.merge(&reported.errors);
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dependency_map_rejects_duplicate_item() {
        let mut work = Work::new("b");
        let result = work.set_dependency_map(vec![
            DependencyItem::new("out_1"),
            DependencyItem::new("out_1"),
        ]);
        assert_eq!(
            result,
            Err(WorkError::DuplicateItem {
                name: "out_1".to_string()
            })
        );
        assert!(work.dependency_map().is_empty());
    }

    #[test]
    fn dependency_map_rejects_duplicate_dependency() {
        let item = DependencyItem::new("out_1")
            .depends_on("a", "f1")
            .depends_on("a", "f1");
        let err = validate_dependency_map(&[item]).unwrap_err();
        assert!(matches!(err, WorkError::DuplicateDependency { .. }));
    }

    #[test]
    fn dependency_map_rejects_long_names() {
        let item = DependencyItem::new("x".repeat(MAX_ITEM_NAME_LENGTH + 1));
        let err = validate_dependency_map(&[item]).unwrap_err();
        assert!(matches!(err, WorkError::ItemNameTooLong { .. }));
    }

    #[test]
    fn depends_on_via_dependency_map() {
        let a = Work::new("a");
        let b = Work::new("b")
            .with_dependency_map(vec![DependencyItem::new("out").depends_on("a", "f1")])
            .unwrap();

        assert!(b.depends_on_work(&a));
        assert!(!a.depends_on_work(&b));
    }

    #[test]
    fn custom_conditions_or_and() {
        let mut work = Work::new("a");
        assert!(!work.custom_condition_holds(CustomMode::Or));
        assert!(!work.custom_condition_holds(CustomMode::And));

        work.add_custom_condition("quality", json!("good"), CustomMode::Or);
        work.add_custom_condition("retry", json!(true), CustomMode::Or);
        work.add_custom_condition("quality", json!("good"), CustomMode::And);
        work.add_custom_condition("retry", json!(true), CustomMode::And);

        work.output_data.insert("quality".to_string(), json!("good"));
        assert!(work.check(WorkCheck::CustomOr));
        assert!(!work.check(WorkCheck::CustomAnd));

        work.parameters.insert("retry".to_string(), json!(true));
        assert!(work.check(WorkCheck::CustomAnd));
    }

    #[test]
    fn output_data_wins_over_parameters() {
        let mut work = Work::new("a");
        work.parameters.insert("k".to_string(), json!(1));
        work.output_data.insert("k".to_string(), json!(2));
        assert_eq!(work.attribute("k"), Some(json!(2)));
    }

    #[test]
    fn operator_intent_blocks_termination() {
        let mut work = Work::new("a");
        work.set_status(WorkStatus::Running);
        work.cancel();
        work.status = WorkStatus::Cancelled;
        assert!(!work.is_terminated());

        work.substatus = WorkStatus::Cancelled;
        assert!(work.is_terminated());
        assert!(work.check(WorkCheck::IsCancelled));
    }

    #[test]
    fn resume_clears_errors() {
        let mut work = Work::new("a");
        work.set_status(WorkStatus::Failed);
        work.errors.record("submit", "boom");
        work.resume();
        assert_eq!(work.status, WorkStatus::Transforming);
        assert_eq!(work.substatus, WorkStatus::ToResume);
        assert!(work.errors.is_empty());
    }

    #[test]
    fn error_annotations_merge_preserves_untouched() {
        let mut mine = ErrorAnnotations::default();
        mine.record("submit", "first");
        mine.record("poll", "timeout");

        let mut update = ErrorAnnotations::default();
        update.record("poll", "recovered");
        mine.merge(&update);

        assert_eq!(mine.get("submit"), Some("first"));
        assert_eq!(mine.get("poll"), Some("recovered"));
    }

    #[test]
    fn set_attribute_collections() {
        let mut work = Work::new("b");
        work.set_attribute("input_collections", json!(["a.out"]));
        assert_eq!(work.input_collections, vec!["a.out".to_string()]);

        work.set_attribute("threshold", json!(3));
        assert_eq!(work.parameters.get("threshold"), Some(&json!(3)));
    }
}
