//! Content-level dependency graph of a request.
//!
//! The graph is derived from content rows and cached. It is never patched
//! incrementally: once stale it is rebuilt from storage for the whole
//! request. Concurrent rebuilds are harmless since a rebuild only reads
//! durable state.

use crate::cache::{Cache, get_json, set_json};
use crate::content::{Content, ContentRelationType, ContentStatus};
use crate::error::{CacheError, StorageError};
use crate::storage::{ContentFilter, Storage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, error, warn};
use workweave_core::{CollectionId, ContentId, RequestId, TransformId};

/// A consumer-side dependency content waiting on a producer output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentRef {
    pub content_id: ContentId,
    pub transform_id: TransformId,
    pub map_id: u64,
}

/// Content ids of one map of a transform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntry {
    pub inputs: Vec<ContentId>,
    pub outputs: Vec<ContentId>,
    pub input_dependencies: Vec<ContentId>,
}

/// Maps of one transform, keyed by map id.
pub type TransformMap = BTreeMap<u64, MapEntry>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ContentEdges {
    dependents: BTreeMap<ContentId, Vec<DependentRef>>,
    producers: BTreeMap<ContentId, ContentId>,
    #[serde(default)]
    unresolved: Vec<ContentId>,
}

fn content_edges_key(request_id: RequestId) -> String {
    format!("workweave:deps:{request_id}:content_edges")
}

fn transforms_key(request_id: RequestId) -> String {
    format!("workweave:deps:{request_id}:transforms")
}

fn collections_key(request_id: RequestId) -> String {
    format!("workweave:deps:{request_id}:collections")
}

fn status_key(request_id: RequestId) -> String {
    format!("workweave:deps:{request_id}:content_status")
}

fn transform_map_key(transform_id: TransformId) -> String {
    format!("workweave:deps:transform:{transform_id}")
}

/// The dependency graph of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyMaps {
    pub request_id: RequestId,
    /// Producer output id to the dependency contents consuming it.
    dependents: BTreeMap<ContentId, Vec<DependentRef>>,
    /// Dependency content id to the producer output it resolved to.
    producers: BTreeMap<ContentId, ContentId>,
    transforms: BTreeMap<TransformId, TransformMap>,
    collections: BTreeSet<CollectionId>,
    content_status: BTreeMap<ContentId, ContentStatus>,
    /// Dependency contents whose producer output is not known yet.
    unresolved: Vec<ContentId>,
}

impl DependencyMaps {
    /// Builds the graph from every content of the request.
    ///
    /// A dependency content is joined to the output with the same name in
    /// the same collection. Dependencies that cannot be joined are logged
    /// and left unresolved; they do not block the other edges.
    #[must_use]
    pub fn build(request_id: RequestId, contents: &[Content]) -> Self {
        let mut maps = Self {
            request_id,
            dependents: BTreeMap::new(),
            producers: BTreeMap::new(),
            transforms: BTreeMap::new(),
            collections: BTreeSet::new(),
            content_status: BTreeMap::new(),
            unresolved: Vec::new(),
        };

        let mut outputs_by_name: BTreeMap<CollectionId, BTreeMap<&str, ContentId>> =
            BTreeMap::new();
        let mut dependencies = Vec::new();
        for content in contents {
            maps.collections.insert(content.coll_id);
            maps.content_status.insert(content.id, content.substatus);
            let entry = maps
                .transforms
                .entry(content.transform_id)
                .or_default()
                .entry(content.map_id)
                .or_default();
            match content.relation_type {
                ContentRelationType::Input => entry.inputs.push(content.id),
                ContentRelationType::Output => {
                    entry.outputs.push(content.id);
                    outputs_by_name
                        .entry(content.coll_id)
                        .or_default()
                        .insert(content.name.as_str(), content.id);
                }
                ContentRelationType::InputDependency => {
                    entry.input_dependencies.push(content.id);
                    dependencies.push(content);
                }
                ContentRelationType::Log => {}
            }
        }

        for dep in dependencies {
            let Some(outputs) = outputs_by_name.get(&dep.coll_id) else {
                warn!(
                    request_id = %request_id,
                    content_id = %dep.id,
                    coll_id = %dep.coll_id,
                    "producer collection has no outputs yet"
                );
                maps.unresolved.push(dep.id);
                continue;
            };
            let Some(producer) = outputs.get(dep.name.as_str()) else {
                error!(
                    request_id = %request_id,
                    content_id = %dep.id,
                    name = %dep.name,
                    "no producer output matches dependency"
                );
                maps.unresolved.push(dep.id);
                continue;
            };
            maps.dependents
                .entry(*producer)
                .or_default()
                .push(DependentRef {
                    content_id: dep.id,
                    transform_id: dep.transform_id,
                    map_id: dep.map_id,
                });
            maps.producers.insert(dep.id, *producer);
        }
        maps
    }

    /// Returns true if the graph must be rebuilt before serving `transform_id`.
    ///
    /// A graph with unresolved dependencies is always stale: their
    /// producer outputs may have been registered since it was built.
    #[must_use]
    pub fn is_stale(&self, transform_id: TransformId, output_colls: &[CollectionId]) -> bool {
        self.content_status.is_empty()
            || !self.unresolved.is_empty()
            || !self.transforms.contains_key(&transform_id)
            || self.transforms.values().any(BTreeMap::is_empty)
            || output_colls.iter().any(|id| !self.collections.contains(id))
    }

    /// Dependency contents fed by a producer output.
    #[must_use]
    pub fn dependents(&self, output_id: ContentId) -> &[DependentRef] {
        self.dependents
            .get(&output_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Producer output a dependency content resolved to.
    #[must_use]
    pub fn producer_of(&self, dependency_id: ContentId) -> Option<ContentId> {
        self.producers.get(&dependency_id).copied()
    }

    #[must_use]
    pub fn status(&self, content_id: ContentId) -> Option<ContentStatus> {
        self.content_status.get(&content_id).copied()
    }

    pub fn record_status(&mut self, content_id: ContentId, status: ContentStatus) {
        self.content_status.insert(content_id, status);
    }

    #[must_use]
    pub fn transform_map(&self, transform_id: TransformId) -> Option<&TransformMap> {
        self.transforms.get(&transform_id)
    }

    #[must_use]
    pub fn unresolved(&self) -> &[ContentId] {
        &self.unresolved
    }

    /// Loads the graph. Any missing piece reads as a miss.
    ///
    /// # Errors
    ///
    /// Returns the cache error; callers treat it as a miss.
    pub async fn load(cache: &dyn Cache, request_id: RequestId) -> Result<Option<Self>, CacheError> {
        let Some(edges) = get_json::<ContentEdges>(cache, &content_edges_key(request_id)).await?
        else {
            return Ok(None);
        };
        let Some(transform_ids) =
            get_json::<Vec<TransformId>>(cache, &transforms_key(request_id)).await?
        else {
            return Ok(None);
        };
        let Some(collections) =
            get_json::<BTreeSet<CollectionId>>(cache, &collections_key(request_id)).await?
        else {
            return Ok(None);
        };
        let Some(content_status) =
            get_json::<BTreeMap<ContentId, ContentStatus>>(cache, &status_key(request_id)).await?
        else {
            return Ok(None);
        };

        let mut transforms = BTreeMap::new();
        for transform_id in transform_ids {
            let map = get_json::<TransformMap>(cache, &transform_map_key(transform_id))
                .await?
                .unwrap_or_default();
            transforms.insert(transform_id, map);
        }

        Ok(Some(Self {
            request_id,
            dependents: edges.dependents,
            producers: edges.producers,
            transforms,
            collections,
            content_status,
            unresolved: edges.unresolved,
        }))
    }

    /// Stores every piece of the graph.
    ///
    /// # Errors
    ///
    /// Returns the first cache error.
    pub async fn store(&self, cache: &dyn Cache, ttl: Duration) -> Result<(), CacheError> {
        let edges = ContentEdges {
            dependents: self.dependents.clone(),
            producers: self.producers.clone(),
            unresolved: self.unresolved.clone(),
        };
        set_json(cache, &content_edges_key(self.request_id), &edges, ttl).await?;
        let transform_ids: Vec<TransformId> = self.transforms.keys().copied().collect();
        set_json(cache, &transforms_key(self.request_id), &transform_ids, ttl).await?;
        set_json(cache, &collections_key(self.request_id), &self.collections, ttl).await?;
        for (transform_id, map) in &self.transforms {
            set_json(cache, &transform_map_key(*transform_id), map, ttl).await?;
        }
        self.store_statuses(cache, ttl).await
    }

    /// Drops the cached graph so the next reader rebuilds it.
    ///
    /// # Errors
    ///
    /// Returns the cache error.
    pub async fn invalidate(cache: &dyn Cache, request_id: RequestId) -> Result<(), CacheError> {
        cache.delete(&content_edges_key(request_id)).await
    }

    /// Stores only the status map.
    ///
    /// # Errors
    ///
    /// Returns the cache error.
    pub async fn store_statuses(&self, cache: &dyn Cache, ttl: Duration) -> Result<(), CacheError> {
        set_json(cache, &status_key(self.request_id), &self.content_status, ttl).await
    }
}

/// Returns the request's graph, rebuilding it from storage when it is
/// missing, unreadable or stale.
///
/// # Errors
///
/// Returns the storage error if the rebuild cannot read contents. Cache
/// failures are logged and only cost a rebuild.
pub async fn get_or_rebuild(
    storage: &dyn Storage,
    cache: &dyn Cache,
    request_id: RequestId,
    transform_id: TransformId,
    output_colls: &[CollectionId],
    ttl: Duration,
) -> Result<DependencyMaps, StorageError> {
    let cached = match DependencyMaps::load(cache, request_id).await {
        Ok(cached) => cached,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "dependency cache unreadable");
            None
        }
    };
    if let Some(maps) = cached
        && !maps.is_stale(transform_id, output_colls)
    {
        return Ok(maps);
    }

    debug!(request_id = %request_id, transform_id = %transform_id, "rebuilding dependency maps");
    let contents = storage.get_contents(&ContentFilter::request(request_id)).await?;
    let maps = DependencyMaps::build(request_id, &contents);
    if let Err(e) = maps.store(cache, ttl).await {
        warn!(request_id = %request_id, error = %e, "failed to cache dependency maps");
    }
    Ok(maps)
}
