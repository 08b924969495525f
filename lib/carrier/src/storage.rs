//! Storage contract and an in-memory implementation.
//!
//! Every write may fail with [`StorageError::Conflict`] when optimistic
//! locking loses a race. Callers wrap writes in [`retry_on_conflict`].

use crate::content::{Content, ContentExt, ContentRelationType, ContentStatus, ContentUpdate};
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::warn;
use workweave_core::{CollectionId, ContentId, ProcessingId, RequestId, TransformId};
use workweave_workflow::{
    Collection, CollectionRelationType, Locking, Processing, ProcessingStatus, WorkStatus, Workflow,
};

/// A submitted workflow and its claim state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: RequestId,
    pub workflow: Workflow,
    pub status: WorkStatus,
    pub locking: Locking,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestRecord {
    #[must_use]
    pub fn new(workflow: Workflow) -> Self {
        let now = Utc::now();
        Self {
            id: RequestId::new(),
            workflow,
            status: WorkStatus::New,
            locking: Locking::Idle,
            locked_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Selects contents. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentFilter {
    pub request_id: Option<RequestId>,
    pub transform_id: Option<TransformId>,
    pub coll_id: Option<CollectionId>,
    pub relation_type: Option<ContentRelationType>,
    pub content_ids: Option<BTreeSet<ContentId>>,
}

impl ContentFilter {
    #[must_use]
    pub fn request(request_id: RequestId) -> Self {
        Self {
            request_id: Some(request_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn transform(transform_id: TransformId) -> Self {
        Self {
            transform_id: Some(transform_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn ids(content_ids: impl IntoIterator<Item = ContentId>) -> Self {
        Self {
            content_ids: Some(content_ids.into_iter().collect()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_relation(mut self, relation_type: ContentRelationType) -> Self {
        self.relation_type = Some(relation_type);
        self
    }

    #[must_use]
    pub fn matches(&self, content: &Content) -> bool {
        self.request_id.is_none_or(|id| id == content.request_id)
            && self.transform_id.is_none_or(|id| id == content.transform_id)
            && self.coll_id.is_none_or(|id| id == content.coll_id)
            && self.relation_type.is_none_or(|r| r == content.relation_type)
            && self
                .content_ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&content.id))
    }

    #[must_use]
    pub fn matches_ext(&self, ext: &ContentExt) -> bool {
        self.request_id.is_none_or(|id| id == ext.request_id)
            && self.transform_id.is_none_or(|id| id == ext.transform_id)
            && self.coll_id.is_none_or(|id| id == ext.coll_id)
            && self
                .content_ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&ext.content_id))
    }
}

/// Selects collections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionFilter {
    pub request_id: Option<RequestId>,
    pub transform_id: Option<TransformId>,
    pub relation_type: Option<CollectionRelationType>,
}

impl CollectionFilter {
    #[must_use]
    pub fn request(request_id: RequestId) -> Self {
        Self {
            request_id: Some(request_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn transform(transform_id: TransformId) -> Self {
        Self {
            transform_id: Some(transform_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_relation(mut self, relation_type: CollectionRelationType) -> Self {
        self.relation_type = Some(relation_type);
        self
    }

    #[must_use]
    pub fn matches(&self, coll: &Collection) -> bool {
        self.request_id.is_none_or(|id| id == coll.request_id)
            && self.transform_id.is_none_or(|id| id == coll.transform_id)
            && self.relation_type.is_none_or(|r| r == coll.relation_type)
    }
}

/// Selects processings.
///
/// A processing matches when its status is in `statuses` or its substatus
/// is in `substatuses`. With both lists empty every processing matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingFilter {
    pub processing_id: Option<ProcessingId>,
    pub request_id: Option<RequestId>,
    pub transform_id: Option<TransformId>,
    pub statuses: Vec<ProcessingStatus>,
    pub substatuses: Vec<ProcessingStatus>,
}

impl ProcessingFilter {
    #[must_use]
    pub fn statuses(statuses: impl IntoIterator<Item = ProcessingStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn request(request_id: RequestId) -> Self {
        Self {
            request_id: Some(request_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn id(processing_id: ProcessingId) -> Self {
        Self {
            processing_id: Some(processing_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn transform(transform_id: TransformId) -> Self {
        Self {
            transform_id: Some(transform_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn or_substatuses(mut self, substatuses: impl IntoIterator<Item = ProcessingStatus>) -> Self {
        self.substatuses = substatuses.into_iter().collect();
        self
    }

    #[must_use]
    pub fn matches(&self, processing: &Processing) -> bool {
        let scoped = self.processing_id.is_none_or(|id| id == processing.id)
            && self.request_id.is_none_or(|id| id == processing.request_id)
            && self
                .transform_id
                .is_none_or(|id| id == processing.transform_id);
        let by_status = (self.statuses.is_empty() && self.substatuses.is_empty())
            || self.statuses.contains(&processing.status)
            || self.substatuses.contains(&processing.substatus);
        scoped && by_status
    }
}

/// Durable state of requests, processings, collections and contents.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_contents(&self, filter: &ContentFilter) -> Result<Vec<Content>, StorageError>;

    async fn add_contents(&self, contents: Vec<Content>) -> Result<(), StorageError>;

    /// Applies a batch of updates in one transaction.
    async fn update_contents(&self, updates: &[ContentUpdate]) -> Result<(), StorageError>;

    async fn get_contents_ext(&self, filter: &ContentFilter)
    -> Result<Vec<ContentExt>, StorageError>;

    async fn upsert_contents_ext(&self, rows: &[ContentExt]) -> Result<(), StorageError>;

    async fn get_collections(
        &self,
        filter: &CollectionFilter,
    ) -> Result<Vec<Collection>, StorageError>;

    async fn add_collection(&self, coll: Collection) -> Result<(), StorageError>;

    async fn update_collection(&self, coll: &Collection) -> Result<(), StorageError>;

    async fn add_processing(&self, processing: Processing) -> Result<(), StorageError>;

    /// Fetches a processing, optionally taking its lock.
    async fn get_processing(
        &self,
        id: ProcessingId,
        lock: bool,
    ) -> Result<Option<Processing>, StorageError>;

    async fn get_processings(
        &self,
        filter: &ProcessingFilter,
    ) -> Result<Vec<Processing>, StorageError>;

    /// Locks up to `limit` matching processings that are idle or whose
    /// lease expired.
    async fn claim_processings(
        &self,
        filter: &ProcessingFilter,
        limit: usize,
        lease: ChronoDuration,
    ) -> Result<Vec<Processing>, StorageError>;

    async fn update_processing(&self, processing: &Processing) -> Result<(), StorageError>;

    /// Returns a processing to `Idle`.
    async fn release_processing(&self, id: ProcessingId) -> Result<(), StorageError>;

    async fn add_request(&self, request: RequestRecord) -> Result<(), StorageError>;

    async fn get_request(&self, id: RequestId) -> Result<Option<RequestRecord>, StorageError>;

    /// Locks up to `limit` requests in one of `statuses`.
    async fn claim_requests(
        &self,
        statuses: &[WorkStatus],
        limit: usize,
        lease: ChronoDuration,
    ) -> Result<Vec<RequestRecord>, StorageError>;

    async fn update_request(&self, request: &RequestRecord) -> Result<(), StorageError>;

    async fn release_request(&self, id: RequestId) -> Result<(), StorageError>;
}

/// Bounded retry for serialization conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with 0.8x to 1.2x jitter.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_backoff_ms);
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((ms as f64 * jitter) as u64)
    }
}

/// Runs `op`, retrying it on conflicts.
///
/// # Errors
///
/// Returns the first non-conflict error, or the last conflict once the
/// attempts are used up.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_conflict() && attempt + 1 < policy.max_attempts => {
                let backoff = policy.backoff(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "retrying storage write"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    contents: BTreeMap<ContentId, Content>,
    contents_ext: BTreeMap<ContentId, ContentExt>,
    collections: BTreeMap<CollectionId, Collection>,
    processings: BTreeMap<ProcessingId, Processing>,
    requests: BTreeMap<RequestId, RequestRecord>,
    injected_conflicts: u32,
}

impl MemoryState {
    fn conflict(&mut self, entity: &str) -> Result<(), StorageError> {
        if self.injected_conflicts > 0 {
            self.injected_conflicts -= 1;
            return Err(StorageError::Conflict {
                entity: entity.to_string(),
            });
        }
        Ok(())
    }
}

/// In-memory storage for tests and single-process embedding.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

fn lease_expired(locked_at: Option<DateTime<Utc>>, now: DateTime<Utc>, lease: ChronoDuration) -> bool {
    locked_at.is_none_or(|at| at + lease <= now)
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail with a conflict.
    pub fn inject_conflicts(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.injected_conflicts = count;
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        self.state.lock().map_err(|e| StorageError::Backend {
            message: format!("state lock poisoned: {e}"),
        })
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_contents(&self, filter: &ContentFilter) -> Result<Vec<Content>, StorageError> {
        Ok(self
            .state()?
            .contents
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }

    async fn add_contents(&self, contents: Vec<Content>) -> Result<(), StorageError> {
        let mut state = self.state()?;
        state.conflict("contents")?;
        for content in contents {
            state.contents.insert(content.id, content);
        }
        Ok(())
    }

    async fn update_contents(&self, updates: &[ContentUpdate]) -> Result<(), StorageError> {
        let mut state = self.state()?;
        state.conflict("contents")?;
        if let Some(missing) = updates
            .iter()
            .find(|u| !state.contents.contains_key(&u.content_id))
        {
            return Err(StorageError::NotFound {
                entity: "content".to_string(),
                id: missing.content_id.to_string(),
            });
        }
        for update in updates {
            if let Some(content) = state.contents.get_mut(&update.content_id) {
                content.apply(update);
            }
        }
        Ok(())
    }

    async fn get_contents_ext(
        &self,
        filter: &ContentFilter,
    ) -> Result<Vec<ContentExt>, StorageError> {
        Ok(self
            .state()?
            .contents_ext
            .values()
            .filter(|e| filter.matches_ext(e))
            .cloned()
            .collect())
    }

    async fn upsert_contents_ext(&self, rows: &[ContentExt]) -> Result<(), StorageError> {
        let mut state = self.state()?;
        state.conflict("contents_ext")?;
        for row in rows {
            state.contents_ext.insert(row.content_id, row.clone());
        }
        Ok(())
    }

    async fn get_collections(
        &self,
        filter: &CollectionFilter,
    ) -> Result<Vec<Collection>, StorageError> {
        Ok(self
            .state()?
            .collections
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }

    async fn add_collection(&self, coll: Collection) -> Result<(), StorageError> {
        let mut state = self.state()?;
        state.collections.insert(coll.id, coll);
        Ok(())
    }

    async fn update_collection(&self, coll: &Collection) -> Result<(), StorageError> {
        let mut state = self.state()?;
        state.conflict("collection")?;
        match state.collections.get_mut(&coll.id) {
            Some(existing) => {
                *existing = coll.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound {
                entity: "collection".to_string(),
                id: coll.id.to_string(),
            }),
        }
    }

    async fn add_processing(&self, processing: Processing) -> Result<(), StorageError> {
        let mut state = self.state()?;
        state.processings.insert(processing.id, processing);
        Ok(())
    }

    async fn get_processing(
        &self,
        id: ProcessingId,
        lock: bool,
    ) -> Result<Option<Processing>, StorageError> {
        let mut state = self.state()?;
        let Some(processing) = state.processings.get_mut(&id) else {
            return Ok(None);
        };
        if lock {
            processing.locking = Locking::Locking;
            processing.locked_at = Some(Utc::now());
        }
        Ok(Some(processing.clone()))
    }

    async fn get_processings(
        &self,
        filter: &ProcessingFilter,
    ) -> Result<Vec<Processing>, StorageError> {
        Ok(self
            .state()?
            .processings
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    async fn claim_processings(
        &self,
        filter: &ProcessingFilter,
        limit: usize,
        lease: ChronoDuration,
    ) -> Result<Vec<Processing>, StorageError> {
        let now = Utc::now();
        let mut state = self.state()?;
        let mut claimed = Vec::new();
        for processing in state.processings.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            let free = processing.locking == Locking::Idle
                || lease_expired(processing.locked_at, now, lease);
            if free && filter.matches(processing) {
                processing.locking = Locking::Locking;
                processing.locked_at = Some(now);
                claimed.push(processing.clone());
            }
        }
        Ok(claimed)
    }

    async fn update_processing(&self, processing: &Processing) -> Result<(), StorageError> {
        let mut state = self.state()?;
        state.conflict("processing")?;
        match state.processings.get_mut(&processing.id) {
            Some(existing) => {
                let (locking, locked_at) = (existing.locking, existing.locked_at);
                *existing = processing.clone();
                existing.locking = locking;
                existing.locked_at = locked_at;
                existing.updated_at = Utc::now();
                Ok(())
            }
            None => Err(StorageError::NotFound {
                entity: "processing".to_string(),
                id: processing.id.to_string(),
            }),
        }
    }

    async fn release_processing(&self, id: ProcessingId) -> Result<(), StorageError> {
        let mut state = self.state()?;
        if let Some(processing) = state.processings.get_mut(&id) {
            processing.locking = Locking::Idle;
            processing.locked_at = None;
        }
        Ok(())
    }

    async fn add_request(&self, request: RequestRecord) -> Result<(), StorageError> {
        let mut state = self.state()?;
        state.requests.insert(request.id, request);
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<RequestRecord>, StorageError> {
        Ok(self.state()?.requests.get(&id).cloned())
    }

    async fn claim_requests(
        &self,
        statuses: &[WorkStatus],
        limit: usize,
        lease: ChronoDuration,
    ) -> Result<Vec<RequestRecord>, StorageError> {
        let now = Utc::now();
        let mut state = self.state()?;
        let mut claimed = Vec::new();
        for request in state.requests.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            let free =
                request.locking == Locking::Idle || lease_expired(request.locked_at, now, lease);
            if free && statuses.contains(&request.status) {
                request.locking = Locking::Locking;
                request.locked_at = Some(now);
                claimed.push(request.clone());
            }
        }
        Ok(claimed)
    }

    async fn update_request(&self, request: &RequestRecord) -> Result<(), StorageError> {
        let mut state = self.state()?;
        state.conflict("request")?;
        match state.requests.get_mut(&request.id) {
            Some(existing) => {
                let (locking, locked_at) = (existing.locking, existing.locked_at);
                *existing = request.clone();
                existing.locking = locking;
                existing.locked_at = locked_at;
                existing.updated_at = Utc::now();
                Ok(())
            }
            None => Err(StorageError::NotFound {
                entity: "request".to_string(),
                id: request.id.to_string(),
            }),
        }
    }

    async fn release_request(&self, id: RequestId) -> Result<(), StorageError> {
        let mut state = self.state()?;
        if let Some(request) = state.requests.get_mut(&id) {
            request.locking = Locking::Idle;
            request.locked_at = None;
        }
        Ok(())
    }
}

/// Counts contents per status, for logging.
#[must_use]
pub fn status_histogram<'a>(
    contents: impl IntoIterator<Item = &'a Content>,
) -> BTreeMap<ContentStatus, usize> {
    let mut histogram = BTreeMap::new();
    for content in contents {
        *histogram.entry(content.substatus).or_insert(0) += 1;
    }
    histogram
}
