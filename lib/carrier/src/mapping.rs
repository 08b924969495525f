//! Expansion of a work's dependency map into concrete contents.

use crate::content::{Content, ContentRelationType};
use crate::io_map::InputOutputMaps;
use std::collections::{BTreeMap, BTreeSet};
use workweave_core::{CollectionId, RequestId, TransformId};
use workweave_workflow::{DependencyItem, Work};

/// Collections the expansion writes into.
#[derive(Debug, Clone, Copy)]
pub struct MappingTarget {
    pub request_id: RequestId,
    pub transform_id: TransformId,
    pub input_coll: CollectionId,
    pub output_coll: CollectionId,
}

/// Contents produced by one expansion pass.
#[derive(Debug, Default)]
pub struct Expansion {
    pub contents: Vec<Content>,
    /// Items mapped by this pass.
    pub mapped: Vec<String>,
    /// Items still waiting for a producer.
    pub pending: Vec<String>,
}

impl Expansion {
    /// More items remain to be mapped.
    #[must_use]
    pub fn has_new_inputs(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Maps every dependency map item whose producers have registered an
/// output collection.
///
/// `producers` maps a producing work's name to its output collection. Items
/// already present in `existing` (by output name) are skipped. Items sharing
/// a group are mapped together under one map id, each with its own
/// sub-map id.
#[must_use]
pub fn expand_dependency_map(
    work: &Work,
    target: MappingTarget,
    producers: &BTreeMap<String, CollectionId>,
    existing: &InputOutputMaps,
) -> Expansion {
    let mapped_names: BTreeSet<&str> = existing
        .iter()
        .flat_map(|(_, map)| map.outputs.iter().map(|c| c.name.as_str()))
        .collect();

    // Ungrouped items each form their own group.
    let mut groups: Vec<(Option<&str>, Vec<&DependencyItem>)> = Vec::new();
    for item in work.dependency_map() {
        if mapped_names.contains(item.name.as_str()) {
            continue;
        }
        match item.group.as_deref() {
            Some(group) => match groups.iter_mut().find(|(g, _)| *g == Some(group)) {
                Some((_, items)) => items.push(item),
                None => groups.push((Some(group), vec![item])),
            },
            None => groups.push((None, vec![item])),
        }
    }

    let ready = |item: &DependencyItem| -> bool {
        item.dependencies
            .iter()
            .all(|dep| producers.contains_key(&dep.task))
    };

    let mut expansion = Expansion::default();
    let mut next_map_id = existing.max_map_id() + 1;
    for (_, items) in groups {
        if !items.iter().all(|item| ready(item)) {
            expansion
                .pending
                .extend(items.iter().map(|item| item.name.clone()));
            continue;
        }

        let map_id = next_map_id;
        next_map_id += 1;
        for item in items {
            expansion
                .contents
                .extend(contents_for_item(item, map_id, target, producers));
            expansion.mapped.push(item.name.clone());
        }
    }
    expansion
}

fn contents_for_item(
    item: &DependencyItem,
    map_id: u64,
    target: MappingTarget,
    producers: &BTreeMap<String, CollectionId>,
) -> Vec<Content> {
    let content = |coll_id, name: &str, relation| {
        Content::new(
            target.request_id,
            target.transform_id,
            coll_id,
            map_id,
            name,
            relation,
        )
        .with_sub_map_id(item.sub_map_id)
    };

    let mut contents = vec![
        content(target.input_coll, &item.name, ContentRelationType::Input),
        content(target.output_coll, &item.name, ContentRelationType::Output),
    ];
    for dep in &item.dependencies {
        if let Some(coll_id) = producers.get(&dep.task) {
            contents.push(content(
                *coll_id,
                &dep.input_name,
                ContentRelationType::InputDependency,
            ));
        }
    }
    contents
}
