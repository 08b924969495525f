//! Processing lifecycle.
//!
//! [`Carrier`] owns the seams (storage, remote service, cache, bus) and
//! runs one step of a processing's life per call. Every step reloads the
//! processing, so a step may be repeated after a crash or a duplicate
//! event without changing the outcome.

use crate::backend::BackendRegistry;
use crate::bus::{BusEvent, EventBus, FileStatus};
use crate::cache::Cache;
use crate::config::CarrierConfig;
use crate::content::{Content, ContentRelationType, ContentStatus, ContentUpdate};
use crate::dependency::{DependencyMaps, get_or_rebuild};
use crate::envelope::Envelope;
use crate::error::CarrierError;
use crate::io_map::InputOutputMaps;
use crate::mapping::{MappingTarget, expand_dependency_map};
use crate::propagation::{
    chunked, dependent_updates, poll_missing_outputs, pull_dependency_statuses,
    release_inputs_without_dependencies, updated_contents_by_maps,
};
use crate::reconcile::poll_processing_updates;
use crate::remote::RemoteClient;
use crate::storage::{
    CollectionFilter, ContentFilter, ProcessingFilter, Storage, retry_on_conflict,
    status_histogram,
};
use crate::sync::{
    CloseRequest, WorkProgress, all_updates_flushed, close_collections, final_processing_status,
    processing_terminating, reactivate_contents, sync_collection_status, sync_ext_counters,
    sync_work_status, work_status_from_collections,
};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use workweave_core::{CollectionId, ProcessingId, RequestId, TransformId};
use workweave_workflow::{
    Collection, CollectionRelationType, Processing, ProcessingStatus, Work, WorkStatus,
};

type CarrierResult<T> = workweave_core::Result<T, CarrierError>;

/// What one lifecycle step left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleOutcome {
    pub processing_id: ProcessingId,
    pub status: ProcessingStatus,
    pub substatus: ProcessingStatus,
    /// Content rows written by the step.
    pub updated_contents: usize,
}

impl HandleOutcome {
    fn of(processing: &Processing, updated_contents: usize) -> Self {
        Self {
            processing_id: processing.id,
            status: processing.status,
            substatus: processing.substatus,
            updated_contents,
        }
    }
}

/// Runs processings against the remote execution service.
pub struct Carrier {
    storage: Arc<dyn Storage>,
    remote: Arc<dyn RemoteClient>,
    cache: Arc<dyn Cache>,
    bus: Arc<dyn EventBus>,
    backends: BackendRegistry,
    config: CarrierConfig,
}

impl Carrier {
    /// Creates a carrier with the default execution backends.
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        remote: Arc<dyn RemoteClient>,
        cache: Arc<dyn Cache>,
        bus: Arc<dyn EventBus>,
        config: CarrierConfig,
    ) -> Self {
        Self {
            storage,
            remote,
            cache,
            bus,
            backends: BackendRegistry::with_defaults(),
            config,
        }
    }

    #[must_use]
    pub fn with_backends(mut self, backends: BackendRegistry) -> Self {
        self.backends = backends;
        self
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    #[must_use]
    pub fn config(&self) -> &CarrierConfig {
        &self.config
    }

    async fn load(&self, processing_id: ProcessingId) -> CarrierResult<Processing> {
        match self
            .storage
            .get_processing(processing_id, false)
            .await
            .map_err(CarrierError::from)?
        {
            Some(processing) => Ok(processing),
            None => Err(CarrierError::ProcessingNotFound { processing_id }.into()),
        }
    }

    async fn save(&self, processing: &Processing) -> CarrierResult<()> {
        retry_on_conflict(self.config.conflict_retry, "update_processing", || {
            self.storage.update_processing(processing)
        })
        .await
        .map_err(CarrierError::from)?;
        Ok(())
    }

    async fn save_collection(&self, collection: &Collection) -> CarrierResult<()> {
        retry_on_conflict(self.config.conflict_retry, "update_collection", || {
            self.storage.update_collection(collection)
        })
        .await
        .map_err(CarrierError::from)?;
        Ok(())
    }

    async fn collections(&self, transform_id: TransformId) -> CarrierResult<Vec<Collection>> {
        let collections = self
            .storage
            .get_collections(&CollectionFilter::transform(transform_id))
            .await
            .map_err(CarrierError::from)?;
        Ok(collections)
    }

    async fn contents(&self, transform_id: TransformId) -> CarrierResult<Vec<Content>> {
        let contents = self
            .storage
            .get_contents(&ContentFilter::transform(transform_id))
            .await
            .map_err(CarrierError::from)?;
        Ok(contents)
    }

    async fn maps(&self, transform_id: TransformId) -> CarrierResult<InputOutputMaps> {
        Ok(InputOutputMaps::from_contents(
            self.contents(transform_id).await?,
        ))
    }

    /// Writes content updates in rounds of at most `max_updates_per_round`.
    async fn commit_contents(&self, updates: Vec<ContentUpdate>) -> CarrierResult<usize> {
        let total = updates.len();
        for round in chunked(updates, self.config.max_updates_per_round) {
            retry_on_conflict(self.config.conflict_retry, "update_contents", || {
                self.storage.update_contents(&round)
            })
            .await
            .map_err(CarrierError::from)?;
        }
        Ok(total)
    }

    async fn add_contents(&self, contents: Vec<Content>) -> CarrierResult<usize> {
        let total = contents.len();
        if total == 0 {
            return Ok(0);
        }
        retry_on_conflict(self.config.conflict_retry, "add_contents", || {
            self.storage.add_contents(contents.clone())
        })
        .await
        .map_err(CarrierError::from)?;
        Ok(total)
    }

    /// Publishes events without failing the step that produced them.
    async fn notify(&self, events: Vec<BusEvent>) {
        if events.is_empty() {
            return;
        }
        let count = events.len();
        let envelopes = events.into_iter().map(Envelope::new).collect();
        if let Err(e) = self.bus.publish_bulk(envelopes).await {
            warn!(count, error = %e, "failed to publish events");
        }
    }

    async fn invalidate_dependencies(&self, request_id: RequestId) {
        if let Err(e) = DependencyMaps::invalidate(self.cache.as_ref(), request_id).await {
            warn!(request_id = %request_id, error = %e, "failed to invalidate dependency maps");
        }
    }

    /// Output collections registered so far, keyed by producing work name.
    async fn registered_outputs(
        &self,
        request_id: RequestId,
    ) -> CarrierResult<BTreeMap<String, CollectionId>> {
        let processings = self
            .storage
            .get_processings(&ProcessingFilter::request(request_id))
            .await
            .map_err(CarrierError::from)?;
        let names: BTreeMap<TransformId, String> = processings
            .into_iter()
            .map(|p| (p.transform_id, p.work.name))
            .collect();

        let outputs = self
            .storage
            .get_collections(
                &CollectionFilter::request(request_id)
                    .with_relation(CollectionRelationType::Output),
            )
            .await
            .map_err(CarrierError::from)?;

        let mut producers = BTreeMap::new();
        for coll in outputs {
            if let Some(name) = names.get(&coll.transform_id) {
                producers.entry(name.clone()).or_insert(coll.id);
            }
        }
        Ok(producers)
    }

    /// Maps dependency-map items whose producers are now registered.
    async fn expand_inputs(
        &self,
        processing: &mut Processing,
        collections: &[Collection],
    ) -> CarrierResult<usize> {
        if !processing.work.has_new_inputs {
            return Ok(0);
        }
        let Some(target) = mapping_target(processing, collections) else {
            warn!(processing_id = %processing.id, "processing has no input or output collection");
            return Ok(0);
        };

        let producers = self.registered_outputs(processing.request_id).await?;
        let existing = self.maps(processing.transform_id).await?;
        let expansion = expand_dependency_map(&processing.work, target, &producers, &existing);
        processing.work.has_new_inputs = expansion.has_new_inputs();

        let mapped = expansion.mapped.len();
        let pending = expansion.pending.len();
        let added = self.add_contents(expansion.contents).await?;
        if added > 0 {
            self.invalidate_dependencies(processing.request_id).await;
            info!(processing_id = %processing.id, mapped, pending, "mapped new inputs");
        }
        Ok(added)
    }

    /// Creates the collections and the processing of a starting work.
    ///
    /// The work is marked started and records the new processing.
    ///
    /// # Errors
    ///
    /// Returns an error if the rows cannot be stored.
    #[instrument(skip(self, work), fields(work = %work.name))]
    pub async fn create_processing(
        &self,
        request_id: RequestId,
        work: &mut Work,
    ) -> CarrierResult<Processing> {
        let transform_id = work.transform_id.unwrap_or_default();
        work.start(transform_id);
        if work.input_collections.is_empty() {
            work.input_collections.push(format!("{}.input", work.name));
        }
        if work.output_collections.is_empty() {
            work.output_collections.push(format!("{}.output", work.name));
        }

        let existing: BTreeSet<String> = self
            .collections(transform_id)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();
        let wanted = work
            .input_collections
            .iter()
            .map(|name| (name, CollectionRelationType::Input))
            .chain(
                work.output_collections
                    .iter()
                    .map(|name| (name, CollectionRelationType::Output)),
            )
            .chain(
                work.log_collections
                    .iter()
                    .map(|name| (name, CollectionRelationType::Log)),
            );
        for (name, relation_type) in wanted {
            if existing.contains(name) {
                continue;
            }
            let coll = Collection::new(request_id, transform_id, name.clone(), relation_type);
            self.storage
                .add_collection(coll)
                .await
                .map_err(CarrierError::from)?;
        }

        let mut processing = Processing::new(request_id, transform_id, work.clone());
        work.processings.push(processing.id);
        processing.work = work.clone();
        self.storage
            .add_processing(processing.clone())
            .await
            .map_err(CarrierError::from)?;

        info!(processing_id = %processing.id, transform_id = %transform_id, "created processing");
        self.notify(vec![BusEvent::NewProcessing {
            processing_id: processing.id,
        }])
        .await;
        Ok(processing)
    }

    /// Registers inputs produced outside any dependency map.
    ///
    /// Each new name gets its own map holding one input and one output.
    /// Names already registered are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the processing or its collections are missing,
    /// or the contents cannot be stored.
    pub async fn register_inputs(
        &self,
        processing_id: ProcessingId,
        names: &[&str],
    ) -> CarrierResult<usize> {
        let processing = self.load(processing_id).await?;
        let collections = self.collections(processing.transform_id).await?;
        let Some(target) = mapping_target(&processing, &collections) else {
            return Err(CarrierError::WorkNotStarted { processing_id }.into());
        };

        let existing = self.maps(processing.transform_id).await?;
        let known: BTreeSet<&str> = existing
            .iter()
            .flat_map(|(_, map)| map.inputs.iter().map(|c| c.name.as_str()))
            .collect();

        let mut next_map_id = existing.max_map_id() + 1;
        let mut contents = Vec::new();
        for name in names.iter().filter(|name| !known.contains(**name)) {
            for (coll_id, relation_type) in [
                (target.input_coll, ContentRelationType::Input),
                (target.output_coll, ContentRelationType::Output),
            ] {
                contents.push(Content::new(
                    target.request_id,
                    target.transform_id,
                    coll_id,
                    next_map_id,
                    *name,
                    relation_type,
                ));
            }
            next_map_id += 1;
        }

        let added = self.add_contents(contents).await?;
        if added > 0 {
            self.invalidate_dependencies(processing.request_id).await;
            self.notify(vec![BusEvent::ContentsUpdated {
                request_id: processing.request_id,
                transform_ids: vec![processing.transform_id],
            }])
            .await;
        }
        Ok(added)
    }

    /// Maps inputs, releases the ones without dependencies and submits
    /// the task.
    ///
    /// A failed submission is retried on the next pass until
    /// `max_polling_retries` is exceeded; then the processing fails.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failures or when no backend serves the
    /// work's kind.
    #[instrument(skip(self))]
    pub async fn handle_new_processing(
        &self,
        processing_id: ProcessingId,
    ) -> CarrierResult<HandleOutcome> {
        let mut processing = self.load(processing_id).await?;
        if processing.status != WorkStatus::New {
            debug!(status = %processing.status, "processing already submitted");
            return Ok(HandleOutcome::of(&processing, 0));
        }

        let backend = self.backends.for_work(&processing.work)?;
        let collections = self.collections(processing.transform_id).await?;
        let mapped = self.expand_inputs(&mut processing, &collections).await?;
        if mapped > 0 {
            // Producers may have finished before these dependencies existed.
            self.notify(vec![BusEvent::ContentsUpdated {
                request_id: processing.request_id,
                transform_ids: vec![processing.transform_id],
            }])
            .await;
        }

        let maps = self.maps(processing.transform_id).await?;
        let released = self
            .commit_contents(release_inputs_without_dependencies(&maps))
            .await?;

        let params = backend.build_submission_params(&processing.work, &maps);
        match self.remote.submit(&params).await {
            Ok(external_id) => {
                info!(external_id = %external_id, inputs = params.inputs.len(), "submitted processing");
                processing.mark_submitted(external_id, Utc::now());
                self.save(&processing).await?;
                self.notify(vec![BusEvent::UpdateProcessing { processing_id }])
                    .await;
            }
            Err(e) => {
                processing.polling_retries += 1;
                processing.errors.record("submit", e.to_string());
                if processing.polling_retries > self.config.max_polling_retries {
                    error!(retries = processing.polling_retries, error = %e, "submission retries exhausted");
                    processing.work.errors.record("submit", e.to_string());
                    processing.set_status(WorkStatus::Failed);
                    self.save(&processing).await?;
                    self.notify(vec![BusEvent::SyncProcessing { processing_id }])
                        .await;
                } else {
                    warn!(retries = processing.polling_retries, error = %e, "submission failed");
                    self.save(&processing).await?;
                }
            }
        }
        Ok(HandleOutcome::of(&processing, released))
    }

    /// Polls the remote task, reconciles outputs and syncs the processing.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failures or when no backend serves the
    /// work's kind. Remote failures are recorded on the processing instead.
    #[instrument(skip(self))]
    pub async fn handle_update_processing(
        &self,
        processing_id: ProcessingId,
    ) -> CarrierResult<HandleOutcome> {
        let mut processing = self.load(processing_id).await?;
        if !processing.status.is_submitted() || processing.is_terminated() {
            return Ok(HandleOutcome::of(&processing, 0));
        }

        let backend = self.backends.for_work(&processing.work)?;
        let collections = self.collections(processing.transform_id).await?;
        let mut updated = self.expand_inputs(&mut processing, &collections).await?;

        let maps = self.maps(processing.transform_id).await?;
        let outcome = poll_processing_updates(
            &processing,
            &maps,
            Arc::clone(&self.remote),
            backend.as_ref(),
            &self.config,
        )
        .await;

        updated += self.commit_contents(outcome.updates).await?;
        if !outcome.ext_rows.is_empty() {
            retry_on_conflict(self.config.conflict_retry, "upsert_contents_ext", || {
                self.storage.upsert_contents_ext(&outcome.ext_rows)
            })
            .await
            .map_err(CarrierError::from)?;
        }

        if let Some(status) = outcome.task_status {
            processing.update_retries = 0;
            if status != processing.status {
                debug!(from = %processing.status, to = %status, "remote task moved");
                if processing.has_pending_operation() {
                    processing.status = status;
                } else {
                    processing.set_status(status);
                }
            }
        }
        if let Some(message) = outcome.error {
            processing.update_retries += 1;
            processing.errors.record("reconcile", message.as_str());
            if processing.update_retries > self.config.max_update_retries {
                error!(retries = processing.update_retries, error = %message, "reconciliation retries exhausted");
                processing.work.errors.record("reconcile", message);
                processing.set_status(WorkStatus::Failed);
            } else {
                warn!(retries = processing.update_retries, error = %message, "reconciliation failed");
            }
        }

        let maps = self.maps(processing.transform_id).await?;
        updated += self
            .commit_contents(poll_missing_outputs(&maps, processing.is_terminated()))
            .await?;

        self.save(&processing).await?;
        if updated > 0 {
            self.notify(vec![BusEvent::ContentsUpdated {
                request_id: processing.request_id,
                transform_ids: vec![processing.transform_id],
            }])
            .await;
        }

        let synced = self.sync_processing(processing_id).await?;
        Ok(HandleOutcome {
            updated_contents: updated,
            ..synced
        })
    }

    /// Propagates content statuses through this transform and into the
    /// transforms that depend on it.
    ///
    /// Pulls producer statuses into the dependency contents, flushes and
    /// releases per map, then pushes terminal outputs to the consumers.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failures.
    #[instrument(skip(self))]
    pub async fn handle_trigger_processing(
        &self,
        processing_id: ProcessingId,
    ) -> CarrierResult<HandleOutcome> {
        let processing = self.load(processing_id).await?;
        let transform_id = processing.transform_id;
        let output_colls: Vec<CollectionId> = self
            .collections(transform_id)
            .await?
            .into_iter()
            .filter(|c| c.relation_type == CollectionRelationType::Output)
            .map(|c| c.id)
            .collect();

        let mut dependency_maps = get_or_rebuild(
            self.storage.as_ref(),
            self.cache.as_ref(),
            processing.request_id,
            transform_id,
            &output_colls,
            self.config.cache_ttl(),
        )
        .await
        .map_err(CarrierError::from)?;

        let maps = self.maps(transform_id).await?;
        let pulled = self
            .commit_contents(pull_dependency_statuses(&dependency_maps, &maps))
            .await?;
        let maps = if pulled > 0 {
            self.maps(transform_id).await?
        } else {
            maps
        };

        let updates = updated_contents_by_maps(&maps, processing.is_terminated());
        let by_id: BTreeMap<_, _> = maps.contents().map(|c| (c.id, c)).collect();
        let files: Vec<FileStatus> = updates
            .iter()
            .filter_map(|u| {
                let content = by_id.get(&u.content_id)?;
                Some(FileStatus {
                    name: content.name.clone(),
                    relation_type: content.relation_type,
                    status: u.status?,
                })
            })
            .collect();
        let flushed = self.commit_contents(updates).await?;

        let contents = self.contents(transform_id).await?;
        debug!(histogram = ?status_histogram(&contents), "content statuses");
        let dependents = dependent_updates(&mut dependency_maps, &contents);
        let pushed = self.commit_contents(dependents.updates).await?;
        if let Err(e) = dependency_maps
            .store_statuses(self.cache.as_ref(), self.config.cache_ttl())
            .await
        {
            warn!(error = %e, "failed to cache dependency statuses");
        }

        let mut events = Vec::new();
        if !files.is_empty() {
            events.push(BusEvent::FileStatus {
                request_id: processing.request_id,
                transform_id,
                files,
            });
        }
        if !dependents.transforms.is_empty() {
            events.push(BusEvent::ContentsUpdated {
                request_id: processing.request_id,
                transform_ids: dependents.transforms.into_iter().collect(),
            });
        }
        if pulled + flushed > 0 {
            events.push(BusEvent::SyncProcessing { processing_id });
        }
        self.notify(events).await;

        debug!(pulled, flushed, pushed, "propagated contents");
        Ok(HandleOutcome::of(&processing, pulled + flushed + pushed))
    }

    /// Recounts collections, closes the ones that are done and derives
    /// the processing and work statuses from them.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failures.
    #[instrument(skip(self))]
    pub async fn sync_processing(
        &self,
        processing_id: ProcessingId,
    ) -> CarrierResult<HandleOutcome> {
        let mut processing = self.load(processing_id).await?;
        let transform_id = processing.transform_id;
        let mut collections = self.collections(transform_id).await?;
        let contents = self.contents(transform_id).await?;
        let ext_rows = self
            .storage
            .get_contents_ext(&ContentFilter::transform(transform_id))
            .await
            .map_err(CarrierError::from)?;

        for coll in &mut collections {
            let coll_id = coll.id;
            sync_collection_status(coll, contents.iter().filter(|c| c.coll_id == coll_id));
            if coll.relation_type == CollectionRelationType::Output {
                sync_ext_counters(coll, ext_rows.iter().filter(|r| r.coll_id == coll_id));
            }
        }

        let own_contents = || {
            contents
                .iter()
                .filter(|c| c.relation_type != ContentRelationType::InputDependency)
        };
        let all_flushed = all_updates_flushed(own_contents());
        let terminating =
            processing.status.is_terminal() || processing_terminating(processing.substatus);
        let request = if terminating {
            CloseRequest::terminate()
        } else {
            CloseRequest::default()
        };

        let open: BTreeSet<CollectionId> = collections
            .iter()
            .filter(|c| !c.is_closed())
            .map(|c| c.id)
            .collect();
        close_collections(
            &mut collections,
            &processing.work,
            request,
            all_flushed,
            self.config.require_ext_reconciled,
        );

        let mut events = Vec::new();
        for coll in &collections {
            self.save_collection(coll).await?;
            if coll.is_closed() && open.contains(&coll.id) {
                info!(collection = %coll.name, "closed collection");
                events.push(BusEvent::CollectionClosed {
                    request_id: processing.request_id,
                    transform_id,
                    collection_id: coll.id,
                    name: coll.name.clone(),
                });
            }
        }

        if terminating
            && !is_operator_outcome(processing.status)
            && let Some(status) = work_status_from_collections(&collections, processing.substatus)
        {
            let status = final_processing_status(status);
            if processing.status != status || processing.substatus != status {
                processing.set_status(status);
            }
        }

        let progress = WorkProgress {
            collections_closed: collections.iter().all(Collection::is_closed),
            pending_releases: own_contents().any(|c| {
                c.relation_type == ContentRelationType::Input && !c.substatus.is_terminal()
            }),
            all_flushed,
        };
        let was_terminal = processing.work.status.is_terminal();
        let snapshot = processing.clone();
        let work_status = sync_work_status(&mut processing.work, &[&snapshot], progress);
        if work_status.is_terminal() && !was_terminal {
            info!(work = %processing.work.name, status = %work_status, "work terminated");
            events.push(BusEvent::WorkTerminated {
                request_id: processing.request_id,
                work_id: processing.work.id,
                status: work_status,
            });
        }

        self.save(&processing).await?;
        self.notify(events).await;
        Ok(HandleOutcome::of(&processing, 0))
    }

    /// Kills the remote task and closes the processing as `Cancelled`.
    ///
    /// Inputs and outputs that are not terminal become `Missing` and every
    /// collection closes.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failures. A failed kill is recorded.
    #[instrument(skip(self))]
    pub async fn handle_abort_processing(
        &self,
        processing_id: ProcessingId,
    ) -> CarrierResult<HandleOutcome> {
        let mut processing = self.load(processing_id).await?;
        if processing.status == WorkStatus::Cancelled && processing.is_terminated() {
            return Ok(HandleOutcome::of(&processing, 0));
        }
        if let Some(external_id) = processing.external_id.clone()
            && let Err(e) = self.remote.kill(&external_id).await
        {
            warn!(external_id = %external_id, error = %e, "failed to kill remote task");
            processing.errors.record("abort", e.to_string());
        }
        let updated = self
            .finalize(&mut processing, WorkStatus::Cancelled, true)
            .await?;
        Ok(HandleOutcome::of(&processing, updated))
    }

    /// Closes a processing with an operator outcome.
    ///
    /// With `abandon`, terminal local statuses are published, unfinished
    /// inputs and outputs turn `Missing` and all collections close; without it they stay as they are so the
    /// processing can resume.
    async fn finalize(
        &self,
        processing: &mut Processing,
        status: ProcessingStatus,
        abandon: bool,
    ) -> CarrierResult<usize> {
        let mut events = Vec::new();
        let mut updated = 0;
        if abandon {
            let contents = self.contents(processing.transform_id).await?;
            let updates = contents
                .iter()
                .filter(|c| {
                    matches!(
                        c.relation_type,
                        ContentRelationType::Input | ContentRelationType::Output
                    )
                })
                .filter_map(|c| {
                    let status = if c.substatus.is_terminal() {
                        c.substatus
                    } else {
                        ContentStatus::Missing
                    };
                    (c.status != status || c.substatus != status)
                        .then(|| ContentUpdate::publish(c.id, status))
                })
                .collect();
            updated = self.commit_contents(updates).await?;

            let mut collections = self.collections(processing.transform_id).await?;
            let open: BTreeSet<CollectionId> = collections
                .iter()
                .filter(|c| !c.is_closed())
                .map(|c| c.id)
                .collect();
            close_collections(
                &mut collections,
                &processing.work,
                CloseRequest::abort(),
                false,
                false,
            );
            for coll in collections.iter().filter(|c| open.contains(&c.id)) {
                self.save_collection(coll).await?;
                events.push(BusEvent::CollectionClosed {
                    request_id: processing.request_id,
                    transform_id: processing.transform_id,
                    collection_id: coll.id,
                    name: coll.name.clone(),
                });
            }
        }

        let was_terminal = processing.work.status.is_terminal();
        processing.set_status(status);
        processing.work.set_status(status);
        if !was_terminal {
            events.push(BusEvent::WorkTerminated {
                request_id: processing.request_id,
                work_id: processing.work.id,
                status,
            });
        }
        if updated > 0 {
            events.push(BusEvent::ContentsUpdated {
                request_id: processing.request_id,
                transform_ids: vec![processing.transform_id],
            });
        }
        self.save(processing).await?;
        info!(processing_id = %processing.id, status = %status, "processing closed by operator");
        self.notify(events).await;
        Ok(updated)
    }

    /// Retries the remote task and reactivates everything not processed.
    ///
    /// Collections reopen, unprocessed inputs and outputs go back to
    /// `New` and the dependency graph is rebuilt on next use.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failures. A failed retry is recorded.
    #[instrument(skip(self))]
    pub async fn handle_resume_processing(
        &self,
        processing_id: ProcessingId,
    ) -> CarrierResult<HandleOutcome> {
        let mut processing = self.load(processing_id).await?;
        processing.errors.clear();
        if let Some(external_id) = processing.external_id.clone()
            && let Err(e) = self.remote.retry(&external_id).await
        {
            warn!(external_id = %external_id, error = %e, "failed to retry remote task");
            processing.errors.record("resume", e.to_string());
        }

        for coll in self.collections(processing.transform_id).await? {
            if coll.is_closed() {
                let mut coll = coll;
                coll.reopen();
                self.save_collection(&coll).await?;
            }
        }
        let contents = self.contents(processing.transform_id).await?;
        let updated = self.commit_contents(reactivate_contents(&contents)).await?;
        self.invalidate_dependencies(processing.request_id).await;

        let submitted = processing.external_id.is_some();
        processing.polling_retries = 0;
        processing.update_retries = 0;
        processing.set_status(if submitted {
            WorkStatus::Running
        } else {
            WorkStatus::New
        });
        processing.work.resume();
        processing.work.set_status(if submitted {
            WorkStatus::Running
        } else {
            WorkStatus::Transforming
        });
        self.save(&processing).await?;

        info!(updated, "resumed processing");
        self.notify(vec![BusEvent::ContentsUpdated {
            request_id: processing.request_id,
            transform_ids: vec![processing.transform_id],
        }])
        .await;
        Ok(HandleOutcome::of(&processing, updated))
    }

    /// Actuates a pending operator request, or completes one whose remote
    /// side has settled.
    ///
    /// Requests are not actuated again within the operation quiet period.
    /// A failed actuation drops the request and records the error.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failures.
    #[instrument(skip(self))]
    pub async fn handle_operator_intent(
        &self,
        processing_id: ProcessingId,
    ) -> CarrierResult<HandleOutcome> {
        let mut processing = self.load(processing_id).await?;
        if !processing.has_pending_operation() {
            return Ok(HandleOutcome::of(&processing, 0));
        }

        if processing.substatus.is_in_operation() {
            return self.settle_operation(processing).await;
        }

        let now = Utc::now();
        if processing.in_operation_quiet_period(now, self.config.operation_quiet_period()) {
            debug!(intent = %processing.substatus, "operator request inside quiet period");
            return Ok(HandleOutcome::of(&processing, 0));
        }

        let intent = processing.substatus;
        let next = match intent {
            WorkStatus::ToResume => return self.handle_resume_processing(processing_id).await,
            WorkStatus::ToCancel => WorkStatus::Cancelling,
            WorkStatus::ToExpire => WorkStatus::Expiring,
            WorkStatus::ToSuspend => WorkStatus::Suspending,
            WorkStatus::ToFinish | WorkStatus::ToForceFinish => WorkStatus::Terminating,
            other => {
                debug!(substatus = %other, "nothing to actuate");
                return Ok(HandleOutcome::of(&processing, 0));
            }
        };

        let Some(external_id) = processing.external_id.clone() else {
            // Never submitted: nothing remote to stop.
            processing.request_operation(next, now);
            return self.settle_operation(processing).await;
        };

        let result = match intent {
            WorkStatus::ToFinish => self.remote.finish(&external_id, true).await,
            WorkStatus::ToForceFinish => self.remote.finish(&external_id, false).await,
            _ => self.remote.kill(&external_id).await,
        };
        match result {
            Ok(()) => {
                info!(intent = %intent, external_id = %external_id, "actuated operator request");
                processing.request_operation(next, now);
            }
            Err(e) => {
                warn!(intent = %intent, external_id = %external_id, error = %e, "operator request failed");
                processing.errors.record(intent.as_str(), e.to_string());
                processing.work.errors.record(intent.as_str(), e.to_string());
                processing.substatus = processing.status;
                processing.touch_operation(now);
            }
        }
        self.save(&processing).await?;
        Ok(HandleOutcome::of(&processing, 0))
    }

    /// Completes an actuated request once the processing can close.
    async fn settle_operation(&self, mut processing: Processing) -> CarrierResult<HandleOutcome> {
        let unsubmitted = processing.external_id.is_none();
        let settled = unsubmitted || processing.status.is_terminal();
        let outcome = match processing.substatus {
            WorkStatus::Cancelling if settled => Some((WorkStatus::Cancelled, true)),
            WorkStatus::Expiring if settled => Some((WorkStatus::Expired, true)),
            WorkStatus::Suspending if settled => Some((WorkStatus::Suspended, false)),
            WorkStatus::Terminating => {
                self.save(&processing).await?;
                return self.sync_processing(processing.id).await;
            }
            _ => None,
        };
        let Some((status, abandon)) = outcome else {
            self.save(&processing).await?;
            return Ok(HandleOutcome::of(&processing, 0));
        };
        let updated = self.finalize(&mut processing, status, abandon).await?;
        Ok(HandleOutcome::of(&processing, updated))
    }
}

impl std::fmt::Debug for Carrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Carrier")
            .field("backends", &self.backends)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Terminal statuses an operator decided; collections never override them.
fn is_operator_outcome(status: ProcessingStatus) -> bool {
    matches!(
        status,
        WorkStatus::Cancelled | WorkStatus::Suspended | WorkStatus::Expired | WorkStatus::Broken
    )
}

fn mapping_target(processing: &Processing, collections: &[Collection]) -> Option<MappingTarget> {
    let input = collections
        .iter()
        .find(|c| c.relation_type == CollectionRelationType::Input)?;
    let output = collections
        .iter()
        .find(|c| c.relation_type == CollectionRelationType::Output)?;
    Some(MappingTarget {
        request_id: processing.request_id,
        transform_id: processing.transform_id,
        input_coll: input.id,
        output_coll: output.id,
    })
}
