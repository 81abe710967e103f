//! Synchronizer: orchestrates inbound sync requests and outbound replay.
//!
//! Inbound work is a queue of [`SyncRequest`]s: synchronizations decomposed
//! by the adapter, flush barriers, and at most one queued change-replay at
//! a time. Requests parked behind a flush resume when the flush completes.
//! Outbound work embeds the [`ChangeReplay`] cursor: revisions are pushed
//! to the source strictly in order, transient source errors halt replay
//! without advancing, permanent ones are logged and skipped.
//!
//! Inbound commands never touch the entity store directly: they accumulate
//! in an outbox and are drained into the durable synchronizer queue on
//! `commit`, from where the command processor applies them like any client
//! command (with the replay-to-source flag cleared).

mod store;

pub use store::SynchronizerStore;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, trace, warn};

use crate::changereplay::{ChangeReplay, ReplayItem};
use crate::commands::{
    enqueueable, CommandId, CreateEntity, DeleteEntity, FlushType, ModifyEntity,
};
use crate::entity::Entity;
use crate::error::{Result, SyncError};
use crate::notifier::{Notification, Notifier};
use crate::query::{Comparator, DataStoreQuery, Query};
use crate::queue::MessageQueue;
use crate::store::EntityStore;
use crate::types::{EntityType, Identifier, Operation, ResourceStatus};

/// Notification codes used by sync notifications.
pub mod codes {
    /// A synchronization request started.
    pub const SYNC_IN_PROGRESS: u32 = 1;
    /// A synchronization request finished successfully.
    pub const SYNC_SUCCESS: u32 = 2;
    /// A synchronization request failed.
    pub const SYNC_ERROR: u32 = 3;
}

/// The kind of work a [`SyncRequest`] names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncRequestType {
    /// Fetch from the remote and feed the synchronizer queue.
    Synchronization,
    /// Replay outstanding local revisions to the source.
    ChangeReplay,
    /// A barrier completing once everything queued before it ran.
    Flush,
}

/// One unit of synchronizer work.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncRequest {
    /// What to do.
    pub request_type: SyncRequestType,
    /// Correlates notifications with the request; doubles as the flush id.
    pub request_id: String,
    /// Scope for synchronizations.
    pub query: Option<Query>,
    /// Entities the request applies to, for notifications.
    pub applicable_entities: Vec<Identifier>,
    /// Barrier class for flush requests.
    pub flush_type: Option<FlushType>,
    /// Run a flush first and park this request until it completes.
    pub request_flush: bool,
}

impl SyncRequest {
    /// A synchronization over the given scope.
    pub fn synchronization(query: Option<Query>) -> Self {
        Self {
            request_type: SyncRequestType::Synchronization,
            request_id: "sync".to_string(),
            query,
            applicable_entities: Vec::new(),
            flush_type: None,
            request_flush: false,
        }
    }

    /// A change-replay request.
    pub fn change_replay() -> Self {
        Self {
            request_type: SyncRequestType::ChangeReplay,
            request_id: "changereplay".to_string(),
            query: None,
            applicable_entities: Vec::new(),
            flush_type: None,
            request_flush: false,
        }
    }

    /// A flush barrier.
    pub fn flush(flush_type: FlushType, id: impl Into<String>) -> Self {
        Self {
            request_type: SyncRequestType::Flush,
            request_id: id.into(),
            query: None,
            applicable_entities: Vec::new(),
            flush_type: Some(flush_type),
            request_flush: false,
        }
    }
}

/// Inbound-side view handed to the adapter while it talks to the source.
///
/// All entity changes go through here so they end up as commands in the
/// synchronizer queue, marked as source-originated.
pub struct SyncContext<'a> {
    store: &'a EntityStore,
    sync_store: &'a SynchronizerStore,
    outbox: &'a mut Vec<(CommandId, Vec<u8>)>,
    notifier: &'a Notifier,
    request_id: String,
    entities_type: Option<EntityType>,
    aborting: bool,
}

impl SyncContext<'_> {
    /// The remote↔local id map.
    pub fn sync_store(&self) -> &SynchronizerStore {
        self.sync_store
    }

    /// Read access to the local entity store.
    pub fn store(&self) -> &EntityStore {
        self.store
    }

    /// True once `abort()` was requested; adapters should bail out at their
    /// next remote-I/O boundary.
    pub fn aborting(&self) -> bool {
        self.aborting
    }

    fn push(&mut self, command: CommandId, bytes: Vec<u8>) {
        self.outbox.push((command, bytes));
    }

    /// Creates or updates the local entity for a remote object.
    ///
    /// A new remote id either allocates a local entity, or — when merge
    /// criteria match an existing local entity — is recorded against that
    /// entity instead of creating a duplicate. Known entities are modified
    /// only if a property actually changed.
    #[instrument(skip(self, entity, merge_criteria), fields(%ty, remote_id))]
    pub fn create_or_modify(
        &mut self,
        ty: EntityType,
        remote_id: &str,
        entity: Entity,
        merge_criteria: &BTreeMap<String, Comparator>,
    ) -> Result<()> {
        let local_id = self
            .sync_store
            .resolve_remote_id(ty, remote_id, true)?
            .expect("resolve with create always yields an id");

        if self.store.contains(ty, local_id)? {
            return self.modify_if_changed(ty, local_id, entity);
        }

        if !merge_criteria.is_empty() {
            let mut query = Query::for_type(ty);
            query.base_filters = merge_criteria.clone();
            let mut compiled = DataStoreQuery::new(&query, self.store)?;
            let results = compiled.execute_batch(self.store, Some(1))?;
            if let Some(first) = results.results.first() {
                debug!(local = %first.entity.id, remote_id, "Merging local entity with remote entity");
                self.sync_store
                    .remove_remote_id(ty, local_id, remote_id)?;
                self.sync_store
                    .record_remote_id(ty, first.entity.id, remote_id)?;
                return Ok(());
            }
        }

        trace!(remote_id, "Found a new entity");
        let body = CreateEntity {
            entity_id: local_id,
            entity_type: ty,
            resource: entity.resource,
            local: entity.local,
            replay_to_source: false,
        };
        let bytes = enqueueable(CommandId::CREATE_ENTITY, &body)?;
        self.push(CommandId::CREATE_ENTITY, bytes);
        Ok(())
    }

    /// Emits a modification when any of the given properties differ from
    /// the stored entity; drops the change otherwise.
    pub fn modify_if_changed(
        &mut self,
        ty: EntityType,
        local_id: Identifier,
        entity: Entity,
    ) -> Result<()> {
        let Some(current) = self.store.read_latest(ty, local_id)? else {
            warn!(%local_id, "Modification for unknown local entity");
            return Ok(());
        };
        let mut delta = crate::entity::Properties::new();
        for (name, value) in &entity.local {
            if current.property(name) != Some(value) {
                delta.insert(name.clone(), value.clone());
            }
        }
        if delta.is_empty() {
            trace!(%local_id, "Entity was not modified");
            return Ok(());
        }
        trace!(%local_id, "Found a modified entity");
        let modified = delta.keys().cloned().collect();
        let body = ModifyEntity {
            revision: current.metadata.revision,
            entity_id: local_id,
            entity_type: ty,
            deletions: Vec::new(),
            delta,
            replay_to_source: false,
            modified_properties: modified,
            target_resource: None,
            remove_entity: false,
        };
        let bytes = enqueueable(CommandId::MODIFY_ENTITY, &body)?;
        self.push(CommandId::MODIFY_ENTITY, bytes);
        Ok(())
    }

    /// Emits a deletion for a local entity.
    pub fn delete_entity(&mut self, ty: EntityType, local_id: Identifier) -> Result<()> {
        let revision = self.store.max_revision()?;
        let body = DeleteEntity {
            revision,
            entity_id: local_id,
            entity_type: ty,
            replay_to_source: false,
        };
        let bytes = enqueueable(CommandId::DELETE_ENTITY, &body)?;
        self.push(CommandId::DELETE_ENTITY, bytes);
        Ok(())
    }

    /// Walks every local entity of a type and emits a deletion for each one
    /// whose remote id the source no longer knows. Entities without a
    /// remote id (not yet replayed) are left alone. Returns the count.
    pub fn scan_for_removals(
        &mut self,
        ty: EntityType,
        exists: impl Fn(&str) -> bool,
    ) -> Result<usize> {
        let mut count = 0;
        for local_id in self.store.read_all_uids(ty)? {
            let Some(remote_id) = self.sync_store.resolve_local_id(ty, local_id)? else {
                continue;
            };
            trace!(%local_id, %remote_id, "Checking for removal");
            if !exists(&remote_id) {
                debug!(%local_id, "Found a removed entity");
                count += 1;
                self.delete_entity(ty, local_id)?;
            }
        }
        Ok(count)
    }

    /// Reports progress, rate-limited for large totals.
    pub fn report_progress(&self, progress: u64, total: u64, entities: Vec<Identifier>) {
        if progress == 0 || total == 0 {
            return;
        }
        if total >= 1000 && progress % 100 != 0 {
            return;
        }
        if (100..1000).contains(&total) && progress % 10 != 0 {
            return;
        }
        self.notifier.notify(Notification::progress(
            progress,
            total,
            self.request_id.clone(),
            self.entities_type,
            entities,
        ));
    }
}

/// The remote side of one resource, implemented per protocol.
///
/// `synchronize_with_source` pulls remote state and records it through the
/// context; `replay` pushes one local revision and returns the (possibly
/// new) remote id.
#[async_trait]
pub trait SourceAdapter: Send {
    /// Decomposes a synchronize call into requests; one per call by
    /// default.
    fn sync_requests(&self, query: Option<&Query>) -> Vec<SyncRequest> {
        vec![SyncRequest::synchronization(query.cloned())]
    }

    /// Fetches from the source, emitting entity commands via the context.
    async fn synchronize_with_source(
        &mut self,
        query: Option<&Query>,
        ctx: &mut SyncContext<'_>,
    ) -> std::result::Result<(), SyncError>;

    /// Replays one local revision to the source.
    ///
    /// Returns the remote id of the object after the operation (`None` when
    /// the source assigned none, e.g. for removals).
    async fn replay(
        &mut self,
        item: &ReplayItem,
        old_remote_id: Option<String>,
        modified_properties: &[String],
    ) -> std::result::Result<Option<String>, SyncError>;
}

/// Orchestrates inbound sync requests and outbound replay for one resource.
pub struct Synchronizer {
    store: EntityStore,
    sync_store: SynchronizerStore,
    change_replay: ChangeReplay,
    adapter: Box<dyn SourceAdapter>,
    notifier: Arc<Notifier>,
    queue: Vec<SyncRequest>,
    pending: HashMap<String, Vec<SyncRequest>>,
    outbox: Vec<(CommandId, Vec<u8>)>,
    status_stack: Vec<ResourceStatus>,
    secret: String,
    sync_in_progress: bool,
    abort_requested: bool,
    flush_counter: u64,
}

impl Synchronizer {
    /// Assembles a synchronizer from its parts.
    pub fn new(
        store: EntityStore,
        sync_store: SynchronizerStore,
        change_replay: ChangeReplay,
        adapter: Box<dyn SourceAdapter>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            store,
            sync_store,
            change_replay,
            adapter,
            notifier,
            queue: Vec::new(),
            pending: HashMap::new(),
            outbox: Vec::new(),
            status_stack: vec![ResourceStatus::NoStatus],
            secret: String::new(),
            sync_in_progress: false,
            abort_requested: false,
            flush_counter: 0,
        }
    }

    /// Supplies the credential material adapters need.
    pub fn set_secret(&mut self, secret: impl Into<String>) {
        self.secret = secret.into();
    }

    /// The current credential material.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// The remote↔local id map, for inspection.
    pub fn sync_store(&self) -> &SynchronizerStore {
        &self.sync_store
    }

    /// The outbound replay cursor.
    pub fn last_replayed_revision(&self) -> Result<u64> {
        self.change_replay.last_replayed_revision()
    }

    /// True while requests are queued or parked behind a flush.
    pub fn has_pending_requests(&self) -> bool {
        !self.queue.is_empty() || !self.pending.is_empty()
    }

    /// True when no request is queued and every revision is replayed.
    pub fn all_changes_replayed(&self) -> Result<bool> {
        if !self.queue.is_empty() {
            trace!("Sync request queue is not empty");
            return Ok(false);
        }
        self.change_replay.all_changes_replayed(&self.store)
    }

    /// Queues the requests a synchronize call decomposes into, collapsing
    /// duplicates already waiting.
    #[instrument(skip(self, query))]
    pub fn synchronize(&mut self, query: Option<Query>) {
        debug!("Synchronizing");
        for request in self.adapter.sync_requests(query.as_ref()) {
            if self.queue.contains(&request) {
                trace!("Merging equal request");
                continue;
            }
            self.queue.push(request);
        }
    }

    /// Queues a flush barrier.
    pub fn flush(&mut self, flush_type: FlushType, id: impl Into<String>) {
        let id = id.into();
        debug_assert!(!id.is_empty());
        trace!(%id, "Flushing the synchronization queue");
        self.queue.push(SyncRequest::flush(flush_type, id));
    }

    /// Resumes requests parked under a completed flush, ahead of everything
    /// else in the queue.
    pub fn flush_complete(&mut self, flush_id: &str) {
        if let Some(requests) = self.pending.remove(flush_id) {
            trace!(flush_id, "Flush complete");
            for request in requests.into_iter().rev() {
                self.queue.insert(0, request);
            }
        }
    }

    /// Queues at most one change-replay request.
    pub fn revision_changed(&mut self) {
        if self
            .queue
            .iter()
            .any(|r| r.request_type == SyncRequestType::ChangeReplay)
        {
            return;
        }
        self.queue.push(SyncRequest::change_replay());
    }

    /// Clears the queue and completes parked flushes so waiters unblock,
    /// then cancels the in-flight request at its next suspension point.
    pub fn abort(&mut self) {
        info!("Aborting all running synchronization requests");
        self.clear_queue();
        self.abort_requested = true;
    }

    fn clear_queue(&mut self) {
        for request in &self.queue {
            if request.request_type == SyncRequestType::Flush {
                trace!(id = %request.request_id, "Emitting flush completion");
                self.notifier
                    .notify(Notification::flush_completion(request.request_id.clone()));
            }
        }
        self.queue.clear();
        for (id, _) in self.pending.drain() {
            self.notifier.notify(Notification::flush_completion(id));
        }
    }

    /// Drains the inbound outbox into the durable synchronizer queue.
    pub fn commit(&mut self, queue: &mut MessageQueue) -> Result<()> {
        if self.outbox.is_empty() {
            return Ok(());
        }
        queue.start_transaction()?;
        for (command, bytes) in self.outbox.drain(..) {
            trace!(command = command.name(), "Enqueuing synchronizer command");
            queue.enqueue(&bytes)?;
        }
        queue.commit()
    }

    // ========================================================================
    // Status
    // ========================================================================

    fn set_status(&mut self, status: ResourceStatus, message: &str, request_id: &str) {
        if matches!(status, ResourceStatus::Offline | ResourceStatus::Error) {
            // Nothing else in the queue can succeed either.
            self.clear_queue();
        }
        let top = *self.status_stack.last().expect("status stack never empty");
        if status == top {
            return;
        }
        if top == ResourceStatus::Busy {
            self.status_stack.pop();
        }
        if self.status_stack.last() != Some(&status) {
            if self.status_stack.len() > 1 && status != ResourceStatus::Busy {
                self.status_stack.pop();
            }
            self.status_stack.push(status);
        }
        self.notifier
            .notify(Notification::status(status, message, request_id));
    }

    fn reset_status(&mut self, request_id: &str) {
        self.status_stack.pop();
        let top = *self.status_stack.last().expect("status stack never empty");
        self.notifier.notify(Notification::status(top, "", request_id));
    }

    fn set_busy(&mut self, busy: bool, message: &str, request_id: &str) {
        if busy {
            self.set_status(ResourceStatus::Busy, message, request_id);
        } else if self.status_stack.last() == Some(&ResourceStatus::Busy) {
            self.reset_status(request_id);
        }
    }

    fn set_status_from_result(
        &mut self,
        result: &std::result::Result<(), SyncError>,
        message: &str,
        request_id: &str,
    ) {
        match result {
            Ok(()) => self.set_status(ResourceStatus::Connected, message, request_id),
            Err(
                SyncError::Connection(_) | SyncError::NoServer(_) | SyncError::ConnectionLost(_),
            ) => self.set_status(ResourceStatus::Offline, message, request_id),
            Err(SyncError::Login(_) | SyncError::Configuration(_)) => {
                self.set_status(ResourceStatus::Error, message, request_id)
            }
            // Unclassified errors are assumed transient; status unchanged.
            Err(_) => {}
        }
    }

    /// The current status, for tests and the resource facade.
    pub fn status(&self) -> ResourceStatus {
        *self.status_stack.last().expect("status stack never empty")
    }

    // ========================================================================
    // Request pump
    // ========================================================================

    /// Processes queued requests until the queue is empty or blocked.
    ///
    /// Inbound commands are committed to the durable queue after every
    /// request; the caller pumps the command processor afterwards.
    pub async fn process_sync_queue(&mut self, queue: &mut MessageQueue) -> Result<()> {
        if self.sync_in_progress {
            trace!("Sync still in progress");
            return Ok(());
        }
        if !self.queue.is_empty() && self.secret.is_empty() {
            trace!("Secret not available but required");
            self.notifier.notify(Notification::warning(
                codes::SYNC_ERROR,
                "Secret is not available.",
                "",
            ));
            return Ok(());
        }

        self.sync_in_progress = true;
        while !self.queue.is_empty() {
            // A pending flush gates everything queued after it; only the
            // flush barrier that will release it may jump the line.
            let index = if self.pending.is_empty() {
                0
            } else {
                match self
                    .queue
                    .iter()
                    .position(|r| r.request_type == SyncRequestType::Flush)
                {
                    Some(index) => index,
                    None => {
                        trace!("Pending sync requests, not executing next request");
                        break;
                    }
                }
            };
            let request = self.queue.remove(index);
            trace!(?request.request_type, "Start processing request");
            let result = self.process_request(&request, queue).await;
            self.set_busy(false, "", &request.request_id);
            self.commit(queue)?;
            if let Err(error) = result {
                warn!(%error, "Error during sync");
                self.notifier.notify(Notification::error(
                    error.code(),
                    error.to_string(),
                    request.request_id.clone(),
                ));
            }
            if self.abort_requested {
                self.abort_requested = false;
                break;
            }
        }
        self.sync_in_progress = false;
        Ok(())
    }

    async fn process_request(
        &mut self,
        request: &SyncRequest,
        queue: &mut MessageQueue,
    ) -> std::result::Result<(), SyncError> {
        if request.request_flush {
            // Trigger a flush and park the original request under it.
            let mut parked = request.clone();
            parked.request_flush = false;
            if parked.request_id.is_empty() {
                self.flush_counter += 1;
                parked.request_id = format!("flush-{}", self.flush_counter);
            }
            let flush_id = parked.request_id.clone();
            trace!(%flush_id, "Enqueuing flush request");
            self.pending.entry(flush_id.clone()).or_default().push(parked);
            let body = crate::commands::Flush {
                id: flush_id,
                flush_type: FlushType::FlushSynchronization,
            };
            let bytes = enqueueable(CommandId::FLUSH, &body)
                .map_err(|e| SyncError::Unknown(e.to_string()))?;
            self.outbox.push((CommandId::FLUSH, bytes));
            return Ok(());
        }

        match request.request_type {
            SyncRequestType::Synchronization => {
                info!("Synchronizing");
                self.set_busy(true, "Synchronization has started.", &request.request_id);
                self.notifier.notify(Notification::info(
                    codes::SYNC_IN_PROGRESS,
                    request.query.as_ref().map(|q| q.ty),
                    request.applicable_entities.clone(),
                ));

                let result = {
                    let Self {
                        ref mut adapter,
                        ref mut outbox,
                        ref store,
                        ref sync_store,
                        ref notifier,
                        abort_requested,
                        ..
                    } = *self;
                    let mut ctx = SyncContext {
                        store,
                        sync_store,
                        outbox,
                        notifier: &**notifier,
                        request_id: request.request_id.clone(),
                        entities_type: request.query.as_ref().map(|q| q.ty),
                        aborting: abort_requested,
                    };
                    adapter
                        .synchronize_with_source(request.query.as_ref(), &mut ctx)
                        .await
                };
                // Commit after every request so implementations only have to
                // commit more if they add a lot of data.
                self.commit(queue)
                    .map_err(|e| SyncError::Unknown(e.to_string()))?;
                self.set_status_from_result(&result, "Synchronization has ended.", &request.request_id);
                match result {
                    Ok(()) => {
                        info!("Done synchronizing");
                        self.notifier.notify(Notification::info(
                            codes::SYNC_SUCCESS,
                            request.query.as_ref().map(|q| q.ty),
                            request.applicable_entities.clone(),
                        ));
                        Ok(())
                    }
                    Err(error) => {
                        warn!(%error, "Synchronization failed");
                        self.notifier.notify(Notification::warning(
                            codes::SYNC_ERROR,
                            error.to_string(),
                            request.request_id.clone(),
                        ));
                        Err(error)
                    }
                }
            }
            SyncRequestType::ChangeReplay => {
                if self
                    .change_replay
                    .all_changes_replayed(&self.store)
                    .unwrap_or(false)
                {
                    return Ok(());
                }
                self.set_busy(true, "ChangeReplay has started.", &request.request_id);
                debug!("Replaying changes");
                let result = self.replay_next_revision().await;
                self.set_status_from_result(&result, "Changereplay has ended.", &request.request_id);
                result
            }
            SyncRequestType::Flush => {
                debug_assert!(!request.request_id.is_empty());
                // All requests queued ahead of the barrier have run.
                trace!(id = %request.request_id, "Emitting flush completion");
                self.notifier
                    .notify(Notification::flush_completion(request.request_id.clone()));
                self.flush_complete(&request.request_id);
                Ok(())
            }
        }
    }

    // ========================================================================
    // Outbound replay
    // ========================================================================

    fn can_replay(&self, item: &ReplayItem) -> bool {
        if !item.entity.metadata.replay_to_source {
            trace!(key = %item.key, "Change is coming from the source");
            return false;
        }
        true
    }

    fn not_replaying(&mut self, item: &ReplayItem) -> Result<()> {
        if item.entity.metadata.operation == Operation::Removal {
            if let Some(old_remote_id) = self.sync_store.resolve_local_id(item.ty, item.key.id)? {
                debug!(remote_id = %old_remote_id, "Cleaning up removal");
                self.sync_store
                    .remove_remote_id(item.ty, item.key.id, &old_remote_id)?;
            }
        }
        Ok(())
    }

    /// Replays revisions in order until done, aborted, or halted by a
    /// transient source error.
    #[instrument(skip(self))]
    pub async fn replay_next_revision(&mut self) -> std::result::Result<(), SyncError> {
        if !self.change_replay.begin() {
            return Ok(());
        }
        let result = self.replay_loop().await;
        self.change_replay.end();
        result
    }

    async fn replay_loop(&mut self) -> std::result::Result<(), SyncError> {
        loop {
            if self.abort_requested {
                return Ok(());
            }
            let item = self
                .change_replay
                .next_revision(&self.store)
                .map_err(|e| SyncError::Unknown(e.to_string()))?;
            let Some(item) = item else {
                trace!("No changes to replay");
                return Ok(());
            };

            if !self.can_replay(&item) {
                self.not_replaying(&item)
                    .map_err(|e| SyncError::Unknown(e.to_string()))?;
                self.change_replay
                    .record_replayed_revision(item.key.revision)
                    .map_err(|e| SyncError::Unknown(e.to_string()))?;
                continue;
            }

            let operation = item.entity.metadata.operation;

            // If the entity has been removed since and this is not the
            // removal, skip over so removals can unblock replay.
            if operation != Operation::Removal {
                let latest = self
                    .store
                    .read_latest(item.ty, item.key.id)
                    .map_err(|e| SyncError::Unknown(e.to_string()))?;
                if latest.is_some_and(|e| e.is_tombstone()) {
                    debug!(key = %item.key, "Skipping over already removed entity");
                    self.change_replay
                        .record_replayed_revision(item.key.revision)
                        .map_err(|e| SyncError::Unknown(e.to_string()))?;
                    continue;
                }
            }

            let old_remote_id = if operation != Operation::Creation {
                self.sync_store
                    .resolve_local_id(item.ty, item.key.id)
                    .map_err(|e| SyncError::Unknown(e.to_string()))?
            } else {
                None
            };
            let modified = item
                .entity
                .metadata
                .modified_properties
                .clone()
                .unwrap_or_default();
            debug!(key = %item.key, ?operation, ?old_remote_id, "Replaying");

            match self.adapter.replay(&item, old_remote_id.clone(), &modified).await {
                Ok(remote_id) => {
                    match operation {
                        Operation::Creation => {
                            if let Some(remote_id) = &remote_id {
                                self.sync_store
                                    .record_remote_id(item.ty, item.key.id, remote_id)
                                    .map_err(|e| SyncError::Unknown(e.to_string()))?;
                            }
                        }
                        Operation::Modification => {
                            if let Some(remote_id) = &remote_id {
                                self.sync_store
                                    .update_remote_id(item.ty, item.key.id, remote_id)
                                    .map_err(|e| SyncError::Unknown(e.to_string()))?;
                            }
                        }
                        Operation::Removal => {
                            if let Some(old) = &old_remote_id {
                                self.sync_store
                                    .remove_remote_id(item.ty, item.key.id, old)
                                    .map_err(|e| SyncError::Unknown(e.to_string()))?;
                            }
                        }
                    }
                    self.change_replay
                        .record_replayed_revision(item.key.revision)
                        .map_err(|e| SyncError::Unknown(e.to_string()))?;
                }
                Err(error) if error.halts_replay() => {
                    // Probably offline; retry from here on the next pulse.
                    debug!(%error, "Change replay failed, postponing retry");
                    return Err(error);
                }
                Err(error) => {
                    warn!(%error, key = %item.key, "Permanent error during changereplay, skipping");
                    self.change_replay
                        .record_replayed_revision(item.key.revision)
                        .map_err(|e| SyncError::Unknown(e.to_string()))?;
                }
            }
        }
    }
}
