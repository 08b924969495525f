//! Collections: named groups of content owned by a work.

use crate::status::{CollectionRelationType, CollectionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use workweave_core::{CollectionId, RequestId, TransformId};

/// File counters kept on a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionCounters {
    pub total_files: u64,
    pub processed_files: u64,
    pub processing_files: u64,
    pub new_files: u64,
    pub failed_files: u64,
    pub missing_files: u64,
    pub bytes: u64,
}

impl CollectionCounters {
    /// Every file reached a terminal classification.
    #[must_use]
    pub fn all_terminated(&self) -> bool {
        self.total_files == self.processed_files + self.failed_files + self.missing_files
    }
}

/// Counters kept by the external bookkeeping rows of output contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtCounters {
    pub ext_files: u64,
    pub processed_ext_files: u64,
    pub failed_ext_files: u64,
    pub missing_ext_files: u64,
}

/// A named group of data (input, output or log) owned by a work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: CollectionId,
    pub request_id: RequestId,
    pub transform_id: TransformId,
    pub name: String,
    pub relation_type: CollectionRelationType,
    pub status: CollectionStatus,
    pub substatus: CollectionStatus,
    #[serde(default)]
    pub counters: CollectionCounters,
    #[serde(default)]
    pub ext: ExtCounters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Collection {
    /// Creates an open collection.
    #[must_use]
    pub fn new(
        request_id: RequestId,
        transform_id: TransformId,
        name: impl Into<String>,
        relation_type: CollectionRelationType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CollectionId::new(),
            request_id,
            transform_id,
            name: name.into(),
            relation_type,
            status: CollectionStatus::Open,
            substatus: CollectionStatus::Open,
            counters: CollectionCounters::default(),
            ext: ExtCounters::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status == CollectionStatus::Closed
    }

    /// External bookkeeping agrees with the content counters.
    #[must_use]
    pub fn ext_reconciled(&self) -> bool {
        self.counters.processed_files == self.ext.processed_ext_files
            && self.counters.failed_files == self.ext.failed_ext_files
    }

    pub fn close(&mut self) {
        self.set_status(CollectionStatus::Closed);
    }

    pub fn reopen(&mut self) {
        self.set_status(CollectionStatus::Open);
    }

    pub fn set_status(&mut self, status: CollectionStatus) {
        self.status = status;
        self.substatus = status;
        self.updated_at = Utc::now();
    }
}
