//! Input/output maps: the contents of a transform grouped by map id.

use crate::content::{Content, ContentRelationType};
use std::collections::BTreeMap;

/// Contents sharing one map id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IoMap {
    pub inputs: Vec<Content>,
    pub outputs: Vec<Content>,
    pub input_dependencies: Vec<Content>,
    pub logs: Vec<Content>,
}

/// The slice of an [`IoMap`] sharing one sub-map id.
#[derive(Debug, Default)]
pub struct SubMap<'a> {
    pub inputs: Vec<&'a Content>,
    pub outputs: Vec<&'a Content>,
    pub input_dependencies: Vec<&'a Content>,
}

impl IoMap {
    fn push(&mut self, content: Content) {
        match content.relation_type {
            ContentRelationType::Input => self.inputs.push(content),
            ContentRelationType::Output => self.outputs.push(content),
            ContentRelationType::InputDependency => self.input_dependencies.push(content),
            ContentRelationType::Log => self.logs.push(content),
        }
    }

    /// Groups the map by sub-map id. Plain works have a single `None` group.
    #[must_use]
    pub fn sub_maps(&self) -> BTreeMap<Option<u64>, SubMap<'_>> {
        let mut groups: BTreeMap<Option<u64>, SubMap<'_>> = BTreeMap::new();
        for content in &self.inputs {
            groups.entry(content.sub_map_id).or_default().inputs.push(content);
        }
        for content in &self.outputs {
            groups.entry(content.sub_map_id).or_default().outputs.push(content);
        }
        for content in &self.input_dependencies {
            groups
                .entry(content.sub_map_id)
                .or_default()
                .input_dependencies
                .push(content);
        }
        groups
    }

    /// Every content of the map except logs.
    pub fn contents(&self) -> impl Iterator<Item = &Content> {
        self.inputs
            .iter()
            .chain(&self.outputs)
            .chain(&self.input_dependencies)
    }
}

/// All maps of one transform, keyed by map id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputOutputMaps(BTreeMap<u64, IoMap>);

impl InputOutputMaps {
    /// Groups contents by map id and relation.
    pub fn from_contents(contents: impl IntoIterator<Item = Content>) -> Self {
        let mut maps: BTreeMap<u64, IoMap> = BTreeMap::new();
        for content in contents {
            maps.entry(content.map_id).or_default().push(content);
        }
        Self(maps)
    }

    /// Largest map id in use, 0 if none.
    #[must_use]
    pub fn max_map_id(&self) -> u64 {
        self.0.keys().next_back().copied().unwrap_or(0)
    }

    #[must_use]
    pub fn get(&self, map_id: u64) -> Option<&IoMap> {
        self.0.get(&map_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &IoMap)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every content across all maps except logs.
    pub fn contents(&self) -> impl Iterator<Item = &Content> {
        self.0.values().flat_map(IoMap::contents)
    }

    /// Outputs whose map consumes an input with the given name.
    #[must_use]
    pub fn outputs_for_input(&self, input_name: &str) -> Vec<&Content> {
        self.0
            .values()
            .filter(|map| map.inputs.iter().any(|c| c.name == input_name))
            .flat_map(|map| map.outputs.iter())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workweave_core::{CollectionId, RequestId, TransformId};

    fn content(map_id: u64, sub: Option<u64>, name: &str, rel: ContentRelationType) -> Content {
        Content::new(
            RequestId::new(),
            TransformId::new(),
            CollectionId::new(),
            map_id,
            name,
            rel,
        )
        .with_sub_map_id(sub)
    }

    #[test]
    fn every_input_lands_in_its_sub_map() {
        let maps = InputOutputMaps::from_contents(vec![
            content(1, Some(0), "e0", ContentRelationType::Input),
            content(1, Some(0), "e0b", ContentRelationType::Input),
            content(1, Some(1), "e1", ContentRelationType::Input),
            content(1, Some(0), "o0", ContentRelationType::Output),
            content(1, Some(1), "d1", ContentRelationType::InputDependency),
        ]);
        let map = maps.get(1).unwrap();
        let subs = map.sub_maps();

        assert_eq!(subs.len(), 2);
        assert_eq!(subs[&Some(0)].inputs.len(), 2);
        assert_eq!(subs[&Some(0)].outputs.len(), 1);
        assert!(subs[&Some(0)].input_dependencies.is_empty());
        assert_eq!(subs[&Some(1)].inputs.len(), 1);
        assert_eq!(subs[&Some(1)].input_dependencies.len(), 1);
    }

    #[test]
    fn outputs_found_by_input_name() {
        let maps = InputOutputMaps::from_contents(vec![
            content(1, None, "a", ContentRelationType::Input),
            content(1, None, "a.out", ContentRelationType::Output),
            content(4, None, "b", ContentRelationType::Input),
            content(4, None, "b.out", ContentRelationType::Output),
        ]);
        assert_eq!(maps.max_map_id(), 4);
        let outputs = maps.outputs_for_input("b");
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].name, "b.out");
        assert!(maps.outputs_for_input("c").is_empty());
    }
}
