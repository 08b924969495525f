//! Status propagation: releasing inputs and declaring outputs unreachable.
//!
//! All functions here are pure. They compare against the current substatus
//! before emitting anything, so running them again on unchanged data
//! yields no updates. A content whose substatus is already terminal is
//! never rewritten.

use crate::content::{Content, ContentRelationType, ContentStatus, ContentUpdate};
use crate::dependency::DependencyMaps;
use crate::io_map::InputOutputMaps;
use std::collections::{BTreeMap, BTreeSet};
use workweave_core::{ContentId, TransformId};

/// Decides what the inputs of a sub-map become given its dependencies.
///
/// All available (vacuously true with no dependencies) releases the inputs.
/// All terminated but not all available makes them `Missing`. Anything
/// still in flight leaves them alone.
#[must_use]
pub fn release_decision(
    dependencies: &[ContentStatus],
    processing_terminated: bool,
) -> Option<ContentStatus> {
    if dependencies.iter().all(ContentStatus::is_available) {
        Some(ContentStatus::Available)
    } else if dependencies
        .iter()
        .all(|s| s.is_terminated(processing_terminated))
    {
        Some(ContentStatus::Missing)
    } else {
        None
    }
}

/// Outputs of a sub-map become `Missing` once every input terminated
/// without all of them being available.
///
/// `Cancelled` and `FinalSubAvailable` inputs count as terminated but not
/// available: neither will ever deliver the whole input, so the outputs
/// cannot be produced either.
#[must_use]
pub fn outputs_unreachable(inputs: &[ContentStatus], processing_terminated: bool) -> bool {
    !inputs.is_empty()
        && !inputs.iter().all(ContentStatus::is_available)
        && inputs.iter().all(|s| s.is_terminated(processing_terminated))
}

/// Collects updates keyed by content so later rules override earlier ones.
#[derive(Debug, Default)]
struct Pending(BTreeMap<ContentId, ContentUpdate>);

impl Pending {
    fn publish(&mut self, content: &Content, status: ContentStatus) {
        if content.substatus.is_terminal() || content.substatus == status {
            return;
        }
        self.0
            .insert(content.id, ContentUpdate::publish(content.id, status));
    }

    fn flush(&mut self, content: &Content) {
        if content.status != content.substatus && content.substatus.is_flushable() {
            self.0
                .entry(content.id)
                .or_insert_with(|| ContentUpdate::publish(content.id, content.substatus));
        }
    }

    /// Substatus a content will have once the pending updates land.
    fn effective(&self, content: &Content) -> ContentStatus {
        self.0
            .get(&content.id)
            .and_then(|u| u.substatus)
            .unwrap_or(content.substatus)
    }

    fn into_updates(self) -> Vec<ContentUpdate> {
        self.0.into_values().collect()
    }
}

/// Computes every update a trigger pass must commit for one transform.
///
/// Per map: flush pending substatus values, then per sub-map release or
/// fail the inputs from their dependencies, then force outputs `Missing`
/// when their inputs can no longer all become available.
#[must_use]
pub fn updated_contents_by_maps(
    maps: &InputOutputMaps,
    processing_terminated: bool,
) -> Vec<ContentUpdate> {
    let mut pending = Pending::default();
    for (_, map) in maps.iter() {
        for content in map.contents() {
            pending.flush(content);
        }

        for (_, sub) in map.sub_maps() {
            let dependencies: Vec<ContentStatus> = sub
                .input_dependencies
                .iter()
                .map(|c| c.substatus)
                .collect();
            if let Some(status) = release_decision(&dependencies, processing_terminated) {
                for input in &sub.inputs {
                    pending.publish(input, status);
                }
            }

            let inputs: Vec<ContentStatus> =
                sub.inputs.iter().map(|c| pending.effective(c)).collect();
            if outputs_unreachable(&inputs, processing_terminated) {
                for output in &sub.outputs {
                    pending.publish(output, ContentStatus::Missing);
                }
            }
        }
    }
    pending.into_updates()
}

/// Releases the inputs of sub-maps that have no dependencies at all.
#[must_use]
pub fn release_inputs_without_dependencies(maps: &InputOutputMaps) -> Vec<ContentUpdate> {
    let mut pending = Pending::default();
    for (_, map) in maps.iter() {
        for (_, sub) in map.sub_maps() {
            if sub.input_dependencies.is_empty() {
                for input in &sub.inputs {
                    pending.publish(input, ContentStatus::Available);
                }
            }
        }
    }
    pending.into_updates()
}

/// Forces outputs `Missing` where their inputs terminated unavailable.
#[must_use]
pub fn poll_missing_outputs(
    maps: &InputOutputMaps,
    processing_terminated: bool,
) -> Vec<ContentUpdate> {
    let mut pending = Pending::default();
    for (_, map) in maps.iter() {
        for (_, sub) in map.sub_maps() {
            let inputs: Vec<ContentStatus> = sub.inputs.iter().map(|c| c.substatus).collect();
            if outputs_unreachable(&inputs, processing_terminated) {
                for output in &sub.outputs {
                    pending.publish(output, ContentStatus::Missing);
                }
            }
        }
    }
    pending.into_updates()
}

/// Updates for dependency contents of other transforms, and the
/// transforms to wake.
#[derive(Debug, Default, PartialEq)]
pub struct DependentUpdates {
    pub updates: Vec<ContentUpdate>,
    pub transforms: BTreeSet<TransformId>,
}

/// Pushes terminal producer outputs into the substatus of the dependency
/// contents consuming them.
///
/// `dependency_maps` supplies the consumers and their last known status;
/// its status map is updated so a repeated call emits nothing.
#[must_use]
pub fn dependent_updates(
    dependency_maps: &mut DependencyMaps,
    outputs: &[Content],
) -> DependentUpdates {
    let mut result = DependentUpdates::default();
    for output in outputs {
        if output.relation_type != ContentRelationType::Output || !output.substatus.is_terminal() {
            continue;
        }
        let dependents = dependency_maps.dependents(output.id).to_vec();
        for dependent in dependents {
            let current = dependency_maps.status(dependent.content_id);
            if current.is_some_and(|s| s.is_terminal() || s == output.substatus) {
                continue;
            }
            result.updates.push(ContentUpdate::substatus(
                dependent.content_id,
                output.substatus,
            ));
            result.transforms.insert(dependent.transform_id);
            dependency_maps.record_status(dependent.content_id, output.substatus);
        }
    }
    result
}

/// Pulls producer statuses into this transform's dependency contents.
///
/// Covers producers that terminated before the consumer mapped its
/// dependencies.
#[must_use]
pub fn pull_dependency_statuses(
    dependency_maps: &DependencyMaps,
    maps: &InputOutputMaps,
) -> Vec<ContentUpdate> {
    let mut updates = Vec::new();
    for (_, map) in maps.iter() {
        for dep in &map.input_dependencies {
            if dep.substatus.is_terminal() {
                continue;
            }
            let producer_status = dependency_maps
                .producer_of(dep.id)
                .and_then(|producer| dependency_maps.status(producer));
            if let Some(status) = producer_status
                && status.is_terminal()
                && status != dep.substatus
            {
                updates.push(ContentUpdate::substatus(dep.id, status));
            }
        }
    }
    updates
}

/// Splits a batch into rounds of at most `size` items. A zero size keeps
/// everything in one round.
#[must_use]
pub fn chunked<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    if size == 0 || items.len() <= size {
        return vec![items];
    }
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size);
    for item in items {
        current.push(item);
        if current.len() == size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
