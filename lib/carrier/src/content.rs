//! Contents: the files and events flowing between transforms.
//!
//! `substatus` is the writer-local truth; `status` is the value last
//! committed and broadcast. The two are brought together by a flush.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use workweave_core::{CollectionId, ContentId, RequestId, TransformId};

/// Status of a content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    New,
    Activated,
    Processing,
    Available,
    FakeAvailable,
    SubAvailable,
    FinalSubAvailable,
    Failed,
    FinalFailed,
    Missing,
    Lost,
    Deleted,
    Mapped,
    Cancelled,
}

impl ContentStatus {
    /// Every status, in declaration order.
    pub const ALL: [ContentStatus; 14] = [
        Self::New,
        Self::Activated,
        Self::Processing,
        Self::Available,
        Self::FakeAvailable,
        Self::SubAvailable,
        Self::FinalSubAvailable,
        Self::Failed,
        Self::FinalFailed,
        Self::Missing,
        Self::Lost,
        Self::Deleted,
        Self::Mapped,
        Self::Cancelled,
    ];

    /// Usable by downstream consumers.
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available | Self::FakeAvailable)
    }

    /// Reached a classification that no propagation pass may change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Available
                | Self::FakeAvailable
                | Self::FinalFailed
                | Self::FinalSubAvailable
                | Self::Missing
                | Self::Lost
                | Self::Deleted
                | Self::Cancelled
        )
    }

    /// Terminal, or failed for good once the owning processing is over.
    #[must_use]
    pub fn is_terminated(&self, processing_terminated: bool) -> bool {
        self.is_terminal()
            || (processing_terminated && matches!(self, Self::Failed | Self::SubAvailable))
    }

    /// Substatus values that are published by a flush.
    #[must_use]
    pub fn is_flushable(&self) -> bool {
        matches!(
            self,
            Self::Available
                | Self::FakeAvailable
                | Self::FinalFailed
                | Self::Missing
                | Self::Failed
                | Self::Lost
                | Self::Deleted
        )
    }

    /// Counted as processed by collection counters.
    #[must_use]
    pub fn is_processed(&self) -> bool {
        matches!(self, Self::Available | Self::Mapped | Self::FakeAvailable)
    }

    /// Maps a status pushed by the execution service onto a content status.
    #[must_use]
    pub fn from_message_status(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "activated" => Self::Activated,
            "running" => Self::Processing,
            "finished" => Self::Available,
            "failed" => Self::Failed,
            _ => Self::New,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Activated => "activated",
            Self::Processing => "processing",
            Self::Available => "available",
            Self::FakeAvailable => "fake_available",
            Self::SubAvailable => "sub_available",
            Self::FinalSubAvailable => "final_sub_available",
            Self::Failed => "failed",
            Self::FinalFailed => "final_failed",
            Self::Missing => "missing",
            Self::Lost => "lost",
            Self::Deleted => "deleted",
            Self::Mapped => "mapped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a content within its mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentRelationType {
    Input,
    Output,
    /// A consumer-side reference to an output of another transform.
    InputDependency,
    Log,
}

/// Id of a remote job, ordered numerically when both sides are numeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for ExternalId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for ExternalId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExternalId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Where an observed external id ended up after a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalIdMerge {
    /// The id is (now) the current one.
    Current,
    /// The id is older than the current one and was recorded as old.
    Superseded,
}

/// Content metadata, including external job bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<ExternalId>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub old_external_ids: BTreeSet<ExternalId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, JsonValue>,
}

impl ContentMetadata {
    /// Records an observed job id. The largest id seen is kept as current;
    /// every other id is kept once in `old_external_ids`.
    pub fn merge_external_id(&mut self, observed: ExternalId) -> ExternalIdMerge {
        match self.external_id.take() {
            None => {
                self.external_id = Some(observed);
                ExternalIdMerge::Current
            }
            Some(current) => match observed.cmp(&current) {
                Ordering::Equal => {
                    self.external_id = Some(current);
                    ExternalIdMerge::Current
                }
                Ordering::Greater => {
                    self.old_external_ids.insert(current);
                    self.old_external_ids.remove(&observed);
                    self.external_id = Some(observed);
                    ExternalIdMerge::Current
                }
                Ordering::Less => {
                    self.external_id = Some(current);
                    self.old_external_ids.insert(observed);
                    ExternalIdMerge::Superseded
                }
            },
        }
    }
}

/// The atomic unit of data flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub id: ContentId,
    pub request_id: RequestId,
    pub transform_id: TransformId,
    pub coll_id: CollectionId,
    pub map_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_map_id: Option<u64>,
    pub name: String,
    pub relation_type: ContentRelationType,
    pub status: ContentStatus,
    pub substatus: ContentStatus,
    pub bytes: u64,
    #[serde(default)]
    pub metadata: ContentMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Content {
    /// Creates a `New` content.
    #[must_use]
    pub fn new(
        request_id: RequestId,
        transform_id: TransformId,
        coll_id: CollectionId,
        map_id: u64,
        name: impl Into<String>,
        relation_type: ContentRelationType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ContentId::new(),
            request_id,
            transform_id,
            coll_id,
            map_id,
            sub_map_id: None,
            name: name.into(),
            relation_type,
            status: ContentStatus::New,
            substatus: ContentStatus::New,
            bytes: 0,
            metadata: ContentMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_sub_map_id(mut self, sub_map_id: Option<u64>) -> Self {
        self.sub_map_id = sub_map_id;
        self
    }

    /// Status and substatus agree.
    #[must_use]
    pub fn is_flushed(&self) -> bool {
        self.status == self.substatus
    }

    /// Applies an update record in place.
    pub fn apply(&mut self, update: &ContentUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(substatus) = update.substatus {
            self.substatus = substatus;
        }
        if let Some(metadata) = &update.metadata {
            self.metadata = metadata.clone();
        }
        self.updated_at = Utc::now();
    }
}

/// A partial update of one content row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentUpdate {
    pub content_id: ContentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ContentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substatus: Option<ContentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ContentMetadata>,
}

impl ContentUpdate {
    /// Records a new local truth without publishing it.
    #[must_use]
    pub fn substatus(content_id: ContentId, substatus: ContentStatus) -> Self {
        Self {
            content_id,
            status: None,
            substatus: Some(substatus),
            metadata: None,
        }
    }

    /// Sets and publishes a status.
    #[must_use]
    pub fn publish(content_id: ContentId, status: ContentStatus) -> Self {
        Self {
            content_id,
            status: Some(status),
            substatus: Some(status),
            metadata: None,
        }
    }

    /// Returns true if the update publishes a status.
    #[must_use]
    pub fn publishes(&self) -> bool {
        self.status.is_some()
    }
}

/// External bookkeeping row kept for every terminal output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentExt {
    pub content_id: ContentId,
    pub request_id: RequestId,
    pub transform_id: TransformId,
    pub coll_id: CollectionId,
    pub map_id: u64,
    pub status: ContentStatus,
    pub job_id: Option<String>,
    pub attempt_nr: u32,
    pub updated_at: DateTime<Utc>,
}

impl ContentExt {
    /// Builds the row for an output in its current state.
    #[must_use]
    pub fn for_output(content: &Content, attempt_nr: u32) -> Self {
        Self {
            content_id: content.id,
            request_id: content.request_id,
            transform_id: content.transform_id,
            coll_id: content.coll_id,
            map_id: content.map_id,
            status: content.substatus,
            job_id: content
                .metadata
                .external_id
                .as_ref()
                .map(|id| id.as_str().to_string()),
            attempt_nr,
            updated_at: Utc::now(),
        }
    }
}
