//! Parameter links and workflow-global parameters.
//!
//! A link copies named attributes from a terminated source work into a
//! destination work before the destination is instantiated. Global
//! parameters (`user_*`) are refreshed from every terminated work and pushed
//! into every newly instantiated one, across loop iterations.

use crate::error::WorkError;
use crate::work::Work;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use workweave_core::{ParameterLinkId, WorkId};

/// Anything a parameter link can read named values from.
pub trait AttributeSource {
    fn attribute(&self, name: &str) -> Option<JsonValue>;
}

impl AttributeSource for Work {
    fn attribute(&self, name: &str) -> Option<JsonValue> {
        Work::attribute(self, name)
    }
}

/// Prefix required for global parameter names.
pub const GLOBAL_PARAMETER_PREFIX: &str = "user_";

/// Source attribute name mapped to the destination attribute name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedParameter {
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterLink {
    pub id: ParameterLinkId,
    pub source: WorkId,
    pub destination: WorkId,
    pub parameters: Vec<LinkedParameter>,
}

impl ParameterLink {
    #[must_use]
    pub fn new(source: WorkId, destination: WorkId) -> Self {
        Self {
            id: ParameterLinkId::new(),
            source,
            destination,
            parameters: Vec::new(),
        }
    }

    /// Links `source` on the source work to `destination` on the
    /// destination work.
    #[must_use]
    pub fn with(mut self, source: impl Into<String>, destination: impl Into<String>) -> Self {
        self.parameters.push(LinkedParameter {
            source: source.into(),
            destination: destination.into(),
        });
        self
    }

    /// Reads the linked values from the source work, keyed by destination
    /// name. Attributes the work does not have are skipped.
    #[must_use]
    pub fn collect(&self, source: &impl AttributeSource) -> BTreeMap<String, JsonValue> {
        self.parameters
            .iter()
            .filter_map(|p| {
                source
                    .attribute(&p.source)
                    .map(|value| (p.destination.clone(), value))
            })
            .collect()
    }
}

/// Writes collected link values into a work.
pub fn apply_link_values(values: &BTreeMap<String, JsonValue>, work: &mut Work) {
    for (name, value) in values {
        work.set_attribute(name, value.clone());
    }
}

/// Binds element `index` of a list-valued global parameter to a work
/// attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlicedParameter {
    pub index: usize,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalParameters {
    #[serde(default)]
    values: BTreeMap<String, JsonValue>,
    #[serde(default)]
    sliced: BTreeMap<String, SlicedParameter>,
}

impl GlobalParameters {
    /// Sets a global parameter.
    ///
    /// # Errors
    ///
    /// Returns an error if the name lacks the `user_` prefix.
    pub fn set(&mut self, name: impl Into<String>, value: JsonValue) -> Result<(), WorkError> {
        let name = name.into();
        check_name(&name)?;
        self.values.insert(name, value);
        Ok(())
    }

    /// Slices a list-valued global parameter into a work attribute.
    ///
    /// # Errors
    ///
    /// Returns an error if the source name lacks the `user_` prefix.
    pub fn add_sliced(
        &mut self,
        source: impl Into<String>,
        index: usize,
        name: impl Into<String>,
    ) -> Result<(), WorkError> {
        let source = source.into();
        check_name(&source)?;
        self.sliced.insert(
            source,
            SlicedParameter {
                index,
                name: name.into(),
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.values.get(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Refreshes every known parameter from a terminated work.
    ///
    /// Returns true if any value changed.
    pub fn sync_from(&mut self, work: &Work) -> bool {
        let mut changed = false;
        for (name, value) in &mut self.values {
            if let Some(latest) = work.attribute(name)
                && *value != latest
            {
                *value = latest;
                changed = true;
            }
        }
        changed
    }

    /// Pushes the current values into a newly instantiated work.
    pub fn apply_to(&self, work: &mut Work) {
        for (name, value) in &self.values {
            work.set_attribute(name, value.clone());
        }
        for (source, slice) in &self.sliced {
            let element = self
                .values
                .get(source)
                .and_then(|v| v.as_array())
                .and_then(|items| items.get(slice.index));
            match element {
                Some(value) => work.set_attribute(&slice.name, value.clone()),
                None => tracing::warn!(
                    parameter = %source,
                    index = slice.index,
                    work = %work.name,
                    "sliced global parameter has no element at index"
                ),
            }
        }
    }
}

fn check_name(name: &str) -> Result<(), WorkError> {
    if name.starts_with(GLOBAL_PARAMETER_PREFIX) {
        Ok(())
    } else {
        Err(WorkError::InvalidGlobalParameter {
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn link_collects_output_collections() {
        let a = Work::new("a").with_output_collection("a.out");
        let b = Work::new("b");
        let link = ParameterLink::new(a.id, b.id).with("output_collections", "input_collections");

        let values = link.collect(&a);
        let mut b = b;
        apply_link_values(&values, &mut b);
        assert_eq!(b.input_collections, vec!["a.out".to_string()]);
    }

    #[test]
    fn link_skips_missing_attributes() {
        let a = Work::new("a");
        let link = ParameterLink::new(a.id, WorkId::new()).with("nope", "x");
        assert!(link.collect(&a).is_empty());
    }

    #[test]
    fn global_parameters_require_prefix() {
        let mut globals = GlobalParameters::default();
        assert!(globals.set("threshold", json!(1)).is_err());
        assert!(globals.set("user_threshold", json!(1)).is_ok());
    }

    #[test]
    fn global_parameters_sync_and_apply() {
        let mut globals = GlobalParameters::default();
        globals.set("user_step", json!(1)).unwrap();

        let mut done = Work::new("a");
        done.output_data.insert("user_step".to_string(), json!(2));
        assert!(globals.sync_from(&done));
        assert!(!globals.sync_from(&done));

        let mut next = Work::new("b");
        globals.apply_to(&mut next);
        assert_eq!(next.attribute("user_step"), Some(json!(2)));
    }

    #[test]
    fn sliced_parameter_picks_element() {
        let mut globals = GlobalParameters::default();
        globals.set("user_shards", json!(["s0", "s1"])).unwrap();
        globals.add_sliced("user_shards", 1, "shard").unwrap();

        let mut work = Work::new("a");
        globals.apply_to(&mut work);
        assert_eq!(work.parameters.get("shard"), Some(&json!("s1")));
    }
}
