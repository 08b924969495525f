//! Strongly-typed ids for requests, works, transforms and their data.
//!
//! Ids are ULIDs, so they sort by creation time. That ordering is relied on
//! wherever ids key a `BTreeMap`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when parsing an ID from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Macro to generate a strongly-typed ID wrapper around ULID.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Creates a new ID with a randomly generated ULID.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Creates an ID from a ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the prefix used for display formatting.
            #[must_use]
            pub const fn prefix() -> &'static str {
                $prefix
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let prefix_with_underscore = concat!($prefix, "_");
                let ulid_str = if let Some(stripped) = s.strip_prefix(prefix_with_underscore) {
                    stripped
                } else {
                    s
                };

                Ulid::from_str(ulid_str)
                    .map(Self)
                    .map_err(|e| ParseIdError {
                        id_type: stringify!($name),
                        reason: e.to_string(),
                    })
            }
        }

        impl From<Ulid> for $name {
            fn from(ulid: Ulid) -> Self {
                Self(ulid)
            }
        }

        impl From<$name> for Ulid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// A submitted request; owns one workflow and all of its data.
    RequestId,
    "req"
);

define_id!(
    /// A workflow template instance.
    WorkflowId,
    "wf"
);

define_id!(
    /// A work inside a workflow template. Stable across loop iterations.
    WorkId,
    "wk"
);

define_id!(
    /// A condition gating advancement between works.
    ConditionId,
    "cond"
);

define_id!(
    /// A parameter link between two works.
    ParameterLinkId,
    "plink"
);

define_id!(
    /// The persisted transform backing one instantiated work.
    TransformId,
    "tf"
);

define_id!(
    /// One remote submission attempt of a transform.
    ProcessingId,
    "proc"
);

define_id!(
    /// An input, output or log collection.
    CollectionId,
    "coll"
);

define_id!(
    /// A single file or event inside a collection.
    ContentId,
    "cnt"
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn work_id_display_format() {
        let id = WorkId::new();
        assert!(id.to_string().starts_with("wk_"));
    }

    #[test]
    fn content_id_display_format() {
        let id = ContentId::new();
        assert!(id.to_string().starts_with("cnt_"));
    }

    #[test]
    fn parse_with_prefix() {
        let id = TransformId::new();
        let parsed: TransformId = id.to_string().parse().expect("should parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_without_prefix() {
        let ulid = Ulid::new();
        let id: ProcessingId = ulid.to_string().parse().expect("should parse");
        assert_eq!(id.as_ulid(), ulid);
    }

    #[test]
    fn parse_invalid_ulid() {
        let err = "not_a_ulid".parse::<RequestId>().unwrap_err();
        assert_eq!(err.id_type, "RequestId");
    }

    #[test]
    fn ids_order_by_ulid() {
        let low = CollectionId::from_ulid(Ulid::from_parts(1, 0));
        let high = CollectionId::from_ulid(Ulid::from_parts(2, 0));

        let set: BTreeSet<_> = [high, low].into_iter().collect();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![low, high]);
    }

    #[test]
    fn id_serde_roundtrip() {
        let id = ConditionId::new();
        let json = serde_json::to_string(&id).expect("serialize");
        let parsed: ConditionId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, parsed);
    }
}
