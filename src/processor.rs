//! Command processor: drains the durable queues through the pipeline.
//!
//! The client queue always wins over the synchronizer queue; each cycle
//! drains at most one batch before re-checking priorities so neither queue
//! starves. A batch runs inside one pipeline transaction; a storage failure
//! aborts the batch, rolls the queue cursor back and leaves the messages in
//! place for retry. Client-facing enqueues coalesce into one queue
//! transaction that commits after an idle window or every
//! `batch_size` commands, whichever comes first.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, instrument, trace, warn};

use crate::commands::{CommandId, Flush, FlushType, QueuedCommand};
use crate::config::Config;
use crate::error::{Result, SinkError};
use crate::inspector::Inspector;
use crate::notifier::{ClientEvent, Notification, Notifier};
use crate::pipeline::{MovedEntity, Pipeline};
use crate::queue::MessageQueue;
use crate::synchronizer::Synchronizer;
use crate::types::Revision;

/// Which queue a batch came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueueKind {
    User,
    Synchronizer,
}

/// Drains the two command queues into the pipeline, in priority order.
pub struct CommandProcessor {
    pipeline: Pipeline,
    user_queue: MessageQueue,
    synchronizer_queue: MessageQueue,
    inspector: Inspector,
    notifier: Arc<Notifier>,
    revision_tx: watch::Sender<Revision>,
    batch_size: usize,
    commit_interval: Duration,
    client_lower_bound: Option<Revision>,
    complete_flushes: Vec<String>,
    complete_commands: Vec<(u64, bool)>,
    moved: Vec<MovedEntity>,
    pending_user_commands: usize,
    processing_lock: bool,
}

impl CommandProcessor {
    /// Assembles the processor from its parts.
    pub fn new(
        pipeline: Pipeline,
        user_queue: MessageQueue,
        synchronizer_queue: MessageQueue,
        inspector: Inspector,
        notifier: Arc<Notifier>,
        revision_tx: watch::Sender<Revision>,
        config: &Config,
    ) -> Self {
        Self {
            pipeline,
            user_queue,
            synchronizer_queue,
            inspector,
            notifier,
            revision_tx,
            batch_size: config.batch_size,
            commit_interval: config.effective_commit_interval(),
            client_lower_bound: None,
            complete_flushes: Vec::new(),
            complete_commands: Vec::new(),
            moved: Vec::new(),
            pending_user_commands: 0,
            processing_lock: false,
        }
    }

    /// The pipeline's store, for reads.
    pub fn store(&self) -> &crate::store::EntityStore {
        self.pipeline.store()
    }

    /// Mutable pipeline access for maintenance (upgrade, tests).
    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    /// The synchronizer queue, for the synchronizer's commit.
    pub fn synchronizer_queue_mut(&mut self) -> &mut MessageQueue {
        &mut self.synchronizer_queue
    }

    /// Records the oldest revision any client still needs. The caller
    /// recomputes the minimum across clients whenever an acknowledgement
    /// arrives.
    pub fn set_client_lower_bound(&mut self, revision: Revision) {
        self.client_lower_bound = Some(revision);
    }

    /// Creations redirected to other resources by move modifications.
    pub fn take_moved_entities(&mut self) -> Vec<MovedEntity> {
        std::mem::take(&mut self.moved)
    }

    /// True while client commands wait in the coalescing transaction.
    pub fn has_pending_commit(&self) -> bool {
        self.user_queue.in_transaction()
    }

    /// The configured idle window after which pending commands commit.
    pub fn commit_interval(&self) -> Duration {
        self.commit_interval
    }

    /// Commits the coalescing transaction, making pending client commands
    /// visible to the process loop.
    pub fn commit_pending(&mut self) -> Result<()> {
        if self.user_queue.in_transaction() {
            self.user_queue.commit()?;
            self.pending_user_commands = 0;
        }
        Ok(())
    }

    /// Client-facing command entry.
    ///
    /// Flush-synchronization and synchronize commands bypass the user
    /// queue; everything else is enqueued with commit coalescing. The
    /// message id, when given, is answered with a completion event once the
    /// command's pipeline commit lands.
    #[instrument(skip(self, payload, synchronizer), fields(command = command.name()))]
    pub fn process_command(
        &mut self,
        command: CommandId,
        payload: &[u8],
        message_id: Option<u64>,
        synchronizer: &mut Synchronizer,
    ) -> Result<()> {
        match command {
            CommandId::FLUSH => {
                let flush: Flush = bincode::deserialize(payload)
                    .map_err(|e| SinkError::invalid_buffer(e.to_string()))?;
                trace!(id = %flush.id, "Received flush command");
                if flush.flush_type == FlushType::FlushSynchronization {
                    synchronizer.flush(flush.flush_type, flush.id);
                    self.complete_immediately(message_id);
                    return Ok(());
                }
                self.enqueue_user_command(command, payload, message_id)?;
                self.commit_pending()
            }
            CommandId::SYNCHRONIZE => {
                let sync: crate::commands::Synchronize = bincode::deserialize(payload)
                    .map_err(|e| SinkError::invalid_buffer(e.to_string()))?;
                synchronizer.synchronize(sync.query);
                self.complete_immediately(message_id);
                Ok(())
            }
            CommandId::ABORT_SYNCHRONIZATION => {
                synchronizer.abort();
                self.complete_immediately(message_id);
                Ok(())
            }
            _ => self.enqueue_user_command(command, payload, message_id),
        }
    }

    fn complete_immediately(&self, message_id: Option<u64>) {
        if let Some(message_id) = message_id {
            self.notifier.emit(ClientEvent::CommandCompletion {
                message_id,
                success: true,
            });
        }
    }

    fn enqueue_user_command(
        &mut self,
        command: CommandId,
        payload: &[u8],
        message_id: Option<u64>,
    ) -> Result<()> {
        let envelope = match message_id {
            Some(id) => QueuedCommand::with_message_id(command, payload.to_vec(), id),
            None => QueuedCommand::new(command, payload.to_vec()),
        };
        let bytes = envelope.encode()?;
        self.user_queue.start_transaction()?;
        self.user_queue.enqueue(&bytes)?;
        self.pending_user_commands += 1;
        // Bursts coalesce into one commit, but never indefinitely.
        if self.pending_user_commands >= self.batch_size || self.commit_interval.is_zero() {
            self.commit_pending()?;
        }
        Ok(())
    }

    fn messages_available(&self) -> Result<bool> {
        Ok(!self.user_queue.is_empty()? || !self.synchronizer_queue.is_empty()?)
    }

    /// The process loop: while any queue is non-empty, drain one batch from
    /// the first non-empty queue in priority order.
    pub fn process(&mut self, synchronizer: &mut Synchronizer) -> Result<()> {
        if self.processing_lock {
            return Ok(());
        }
        self.processing_lock = true;
        let result = self.process_inner(synchronizer);
        self.processing_lock = false;
        result
    }

    fn process_inner(&mut self, synchronizer: &mut Synchronizer) -> Result<()> {
        while self.messages_available()? {
            // Reclaim space below what replay and clients still need.
            let lower_bound = self.effective_lower_bound(synchronizer)?;
            if lower_bound > 0 {
                self.pipeline.cleanup_revisions(lower_bound)?;
            }

            let kind = if !self.user_queue.is_empty()? {
                QueueKind::User
            } else {
                QueueKind::Synchronizer
            };
            self.process_queue(kind, synchronizer)?;
        }
        Ok(())
    }

    fn effective_lower_bound(&self, synchronizer: &Synchronizer) -> Result<Revision> {
        let replay = synchronizer.last_replayed_revision()?;
        Ok(match self.client_lower_bound {
            Some(client) => client.min(replay),
            None => replay,
        })
    }

    /// Processes one batch from the given queue inside one pipeline
    /// transaction.
    fn process_queue(&mut self, kind: QueueKind, synchronizer: &mut Synchronizer) -> Result<()> {
        let Self {
            ref mut pipeline,
            ref mut user_queue,
            ref mut synchronizer_queue,
            ref mut complete_flushes,
            ref mut complete_commands,
            ref inspector,
            batch_size,
            ..
        } = *self;
        let queue = match kind {
            QueueKind::User => user_queue,
            QueueKind::Synchronizer => synchronizer_queue,
        };
        trace!(queue = queue.name(), "Processing queue");

        let cursor = queue.replayed_revision();
        pipeline.start_transaction()?;
        let batch_result = queue.dequeue_batch(batch_size, |bytes| {
            handle_queued_command(
                pipeline,
                complete_flushes,
                complete_commands,
                inspector,
                synchronizer,
                &bytes,
            )
        });

        let commit_result = match batch_result {
            Ok(count) => {
                trace!(count, "Batch dequeued");
                self.pipeline.commit()
            }
            Err(e) => Err(e),
        };

        match commit_result {
            Ok(revision) => {
                if let Some(revision) = revision {
                    self.revision_updated(revision, synchronizer);
                }
                // The flushed content is persistent; notify the world.
                for flush_id in std::mem::take(&mut self.complete_flushes) {
                    trace!(%flush_id, "Emitting flush completion");
                    synchronizer.flush_complete(&flush_id);
                    self.notifier.notify(Notification::flush_completion(flush_id));
                }
                for (message_id, success) in std::mem::take(&mut self.complete_commands) {
                    self.notifier
                        .emit(ClientEvent::CommandCompletion { message_id, success });
                }
                self.moved.extend(self.pipeline.take_moved_entities());
                let queue = match kind {
                    QueueKind::User => &mut self.user_queue,
                    QueueKind::Synchronizer => &mut self.synchronizer_queue,
                };
                queue.process_removals()?;
                Ok(())
            }
            Err(e) => {
                // Roll everything back; the messages stay queued for retry.
                warn!(error = %e, "Batch failed, rolling back");
                self.pipeline.abort();
                let queue = match kind {
                    QueueKind::User => &mut self.user_queue,
                    QueueKind::Synchronizer => &mut self.synchronizer_queue,
                };
                queue.set_replayed_revision(cursor);
                self.complete_flushes.clear();
                self.complete_commands.clear();
                self.notifier
                    .notify(Notification::warning(0, e.to_string(), ""));
                Err(e)
            }
        }
    }

    fn revision_updated(&self, revision: Revision, synchronizer: &mut Synchronizer) {
        debug!(revision, "Revision updated");
        self.notifier.emit(ClientEvent::RevisionUpdate(revision));
        let _ = self.revision_tx.send(revision);
        synchronizer.revision_changed();
    }

    /// Drains everything: pending client commits, both queues, and the
    /// synchronizer's request queue (including requests those batches
    /// enqueue in turn). Used by flush barriers and tests.
    pub async fn process_all_messages(&mut self, synchronizer: &mut Synchronizer) -> Result<()> {
        self.commit_pending()?;
        loop {
            self.process(synchronizer)?;
            synchronizer
                .process_sync_queue(&mut self.synchronizer_queue)
                .await?;
            let idle = self.user_queue.is_empty()?
                && self.synchronizer_queue.is_empty()?
                && !synchronizer.has_pending_requests()
                && !self.has_pending_commit();
            if idle {
                return Ok(());
            }
        }
    }
}

/// Dispatches one queued command envelope.
///
/// Command-level failures (unknown entity, double removal, bad payload)
/// consume the command with a warning; storage failures propagate and abort
/// the batch.
fn handle_queued_command(
    pipeline: &mut Pipeline,
    complete_flushes: &mut Vec<String>,
    complete_commands: &mut Vec<(u64, bool)>,
    inspector: &Inspector,
    synchronizer: &mut Synchronizer,
    bytes: &[u8],
) -> Result<()> {
    let envelope = match QueuedCommand::decode(bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Invalid buffer in queue, dropping");
            return Ok(());
        }
    };
    trace!(command = envelope.command.name(), "Processing command");

    let result = match envelope.command {
        CommandId::CREATE_ENTITY => pipeline.new_entity(&envelope.payload).map(Some),
        CommandId::MODIFY_ENTITY => pipeline.modified_entity(&envelope.payload).map(Some),
        CommandId::DELETE_ENTITY => pipeline.deleted_entity(&envelope.payload).map(Some),
        CommandId::INSPECTION => inspector.process_command(&envelope.payload).map(|()| None),
        CommandId::FLUSH => {
            let flush: Flush = bincode::deserialize(&envelope.payload)
                .map_err(|e| SinkError::invalid_buffer(e.to_string()))?;
            match flush.flush_type {
                FlushType::FlushReplayQueue => {
                    // Completion is deferred until the batch commits.
                    complete_flushes.push(flush.id);
                }
                FlushType::FlushSynchronization => {
                    synchronizer.flush(flush.flush_type, flush.id);
                }
            }
            Ok(None)
        }
        other => {
            warn!(command = other.0, "Unhandled command, dropping");
            Ok(None)
        }
    };

    match result {
        Ok(revision) => {
            if let Some(revision) = revision {
                trace!(revision, "Command pipeline processed");
            }
            if let Some(message_id) = envelope.message_id {
                complete_commands.push((message_id, true));
            }
            Ok(())
        }
        Err(e) if e.is_storage() => Err(e),
        Err(e) => {
            warn!(error = %e, "Error while processing queue command");
            if let Some(message_id) = envelope.message_id {
                complete_commands.push((message_id, false));
            }
            Ok(())
        }
    }
}
