//! The resource: one long-lived engine instance per external account.
//!
//! Owns the five on-disk environments, the command processor with its two
//! durable queues, the synchronizer, and the notifier, and exposes the
//! client message semantics (handshake, commands, synchronize, flush,
//! queries, shutdown). The on-wire framing of the client channel lives
//! outside the engine; this type consumes decoded messages.
//!
//! On startup the database version is checked: an older on-disk format
//! wipes and recreates all environments. An advisory file lock guarantees a
//! single resource process per instance.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::sync::Arc;
use std::time::Instant;

use fs2::FileExt;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::commands::{self, CommandId, FlushType};
use crate::config::Config;
use crate::error::{Result, StorageError};
use crate::inspector::Inspector;
use crate::notifier::{ClientEvent, EventStream, Notification, Notifier};
use crate::pipeline::{Pipeline, Preprocessor};
use crate::processor::CommandProcessor;
use crate::query::{self, LiveQueryHandle, Query, QueryRunner, ResultSet};
use crate::queue::MessageQueue;
use crate::registry::TypeRegistry;
use crate::changereplay::ChangeReplay;
use crate::storage::{self, schema, Environments};
use crate::store::EntityStore;
use crate::synchronizer::{SourceAdapter, Synchronizer, SynchronizerStore};
use crate::types::{EntityType, Identifier, ResourceStatus, Revision};

/// A decoded client message body.
#[derive(Clone, Debug)]
pub enum ClientCommand {
    /// First message of a client session.
    Handshake {
        /// Client name, for diagnostics.
        name: String,
    },
    /// Credential material for the adapter.
    Secret {
        /// Opaque per-session secret.
        secret: String,
    },
    /// A framed entity or custom command (create, modify, delete,
    /// inspection, custom ids).
    Command {
        /// Command id.
        id: CommandId,
        /// Serialized command body.
        payload: Vec<u8>,
    },
    /// Trigger inbound synchronization.
    Synchronize {
        /// Scope; `None` syncs everything.
        query: Option<Query>,
    },
    /// A flush barrier.
    Flush {
        /// Client-chosen barrier id.
        id: String,
        /// Barrier class.
        flush_type: FlushType,
    },
    /// Abort queued and running synchronization requests.
    AbortSynchronization,
    /// The client has persisted results up to this revision.
    RevisionReplayed {
        /// Acknowledged revision.
        revision: Revision,
    },
    /// Liveness check.
    Ping,
    /// Ask the resource to exit.
    Shutdown,
    /// Ask the resource to delete its data and exit.
    RemoveFromDisk,
    /// Ask the resource to wipe and recreate its databases on next start.
    Upgrade,
}

/// What the caller should do after a handled message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    /// Keep serving.
    None,
    /// Exit cleanly.
    Shutdown,
    /// Exit and delete the instance's data.
    RemoveFromDisk,
    /// Exit; the next start recreates the databases.
    Upgrade,
}

struct ClientState {
    name: String,
    acked_revision: Revision,
}

/// One engine instance bound to a resource's on-disk state.
pub struct Resource {
    config: Config,
    envs: Environments,
    processor: CommandProcessor,
    synchronizer: Synchronizer,
    notifier: Arc<Notifier>,
    revision_rx: watch::Receiver<Revision>,
    clients: HashMap<u64, ClientState>,
    started_at: Instant,
    last_disconnect: Option<Instant>,
    exiting: bool,
    _lock: File,
}

impl Resource {
    /// Opens or creates the resource instance.
    ///
    /// Checks the database version (wiping older formats), acquires the
    /// instance lock, and replays any commands left in the durable queues
    /// by a previous run.
    #[instrument(skip(config, registry, adapter), fields(instance = %config.instance_id))]
    pub async fn open(
        config: Config,
        registry: Arc<TypeRegistry>,
        adapter: Box<dyn SourceAdapter>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage_root)?;

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(config.lock_path())?;
        lock.try_lock_exclusive()
            .map_err(|_| StorageError::Locked)?;

        let envs = Environments::new();
        Self::check_database_version(&config, &envs)?;

        let main_env = envs.open(config.main_path())?;
        let mut store = EntityStore::new(Arc::clone(&main_env), Arc::clone(&registry));
        store.initialize()?;

        let notifier = Arc::new(Notifier::new());
        let initial_revision = store.max_revision()?;
        let (revision_tx, revision_rx) = watch::channel(initial_revision);

        let user_queue = MessageQueue::open(config.user_queue_path(), "userqueue")?;
        let synchronizer_queue =
            MessageQueue::open(config.synchronizer_queue_path(), "synchronizerqueue")?;
        let change_replay = ChangeReplay::open(config.change_replay_path())?;
        let sync_store = SynchronizerStore::open(config.synchronization_path())?;

        let inspector = Inspector::new(store.reader(), Arc::clone(&notifier));
        let synchronizer = Synchronizer::new(
            store.reader(),
            sync_store,
            change_replay,
            adapter,
            Arc::clone(&notifier),
        );
        let pipeline = Pipeline::new(store);
        let processor = CommandProcessor::new(
            pipeline,
            user_queue,
            synchronizer_queue,
            inspector,
            notifier.clone(),
            revision_tx,
            &config,
        );

        let mut resource = Self {
            config,
            envs,
            processor,
            synchronizer,
            notifier,
            revision_rx,
            clients: HashMap::new(),
            started_at: Instant::now(),
            last_disconnect: None,
            exiting: false,
            _lock: lock,
        };

        // Catch up on whatever a previous run left queued.
        resource.pump().await?;
        info!("Resource started");
        Ok(resource)
    }

    fn check_database_version(config: &Config, envs: &Environments) -> Result<()> {
        let main_path = config.main_path();
        if !main_path.exists() {
            return Ok(());
        }
        let version = {
            let env = envs.open(&main_path)?;
            let txn = env.read()?;
            storage::database_version(&txn)?
        };
        match version {
            Some(found) if found < u64::from(schema::DATABASE_VERSION) => {
                warn!(
                    found,
                    latest = schema::DATABASE_VERSION,
                    "Old database version, recreating databases"
                );
                envs.remove_from_disk(&config.environment_paths())?;
                Ok(())
            }
            Some(found) if found > u64::from(schema::DATABASE_VERSION) => {
                Err(StorageError::VersionMismatch {
                    expected: schema::DATABASE_VERSION,
                    found: found as u32,
                }
                .into())
            }
            _ => Ok(()),
        }
    }

    /// Deletes every environment of the instance. The resource must not be
    /// running.
    pub fn wipe(config: &Config) -> Result<()> {
        let envs = Environments::new();
        envs.remove_from_disk(&config.environment_paths())
    }

    /// Subscribes to outbound events (revision updates, completions,
    /// notifications).
    pub fn subscribe(&self) -> EventStream<ClientEvent> {
        self.notifier.subscribe()
    }

    /// Registers a connected client.
    pub fn client_connected(&mut self, client_id: u64) {
        self.clients.insert(
            client_id,
            ClientState {
                name: String::new(),
                acked_revision: 0,
            },
        );
        self.last_disconnect = None;
    }

    /// Unregisters a client; starts the disconnect grace period when it was
    /// the last one.
    pub fn client_disconnected(&mut self, client_id: u64) {
        if let Some(client) = self.clients.remove(&client_id) {
            debug!(name = %client.name, "Client disconnected");
        }
        if self.clients.is_empty() {
            self.last_disconnect = Some(Instant::now());
        }
    }

    /// True once the startup or disconnect grace has elapsed with no
    /// clients. Always false in test mode.
    pub fn idle_exit_due(&self) -> bool {
        if self.config.test_mode || !self.clients.is_empty() {
            return false;
        }
        match self.last_disconnect {
            Some(at) => at.elapsed() >= self.config.disconnect_grace,
            None => self.started_at.elapsed() >= self.config.startup_grace,
        }
    }

    /// Handles one decoded client message.
    ///
    /// Returns what the hosting process should do next. Stray messages
    /// after shutdown are ignored.
    #[instrument(skip(self, command))]
    pub async fn handle_message(
        &mut self,
        client_id: u64,
        message_id: u64,
        command: ClientCommand,
    ) -> Result<Directive> {
        if self.exiting {
            debug!("Ignoring message while exiting");
            return Ok(Directive::None);
        }
        match command {
            ClientCommand::Handshake { name } => {
                debug!(%name, "Client handshake");
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.name = name;
                }
            }
            ClientCommand::Secret { secret } => {
                self.synchronizer.set_secret(secret);
                self.pump().await?;
            }
            ClientCommand::Command { id, payload } => {
                self.processor.process_command(
                    id,
                    &payload,
                    Some(message_id),
                    &mut self.synchronizer,
                )?;
                self.pump().await?;
            }
            ClientCommand::Synchronize { query } => {
                let payload = bincode::serialize(&commands::Synchronize { query })?;
                self.processor.process_command(
                    CommandId::SYNCHRONIZE,
                    &payload,
                    Some(message_id),
                    &mut self.synchronizer,
                )?;
                self.pump().await?;
            }
            ClientCommand::Flush { id, flush_type } => {
                let payload = bincode::serialize(&commands::Flush { id, flush_type })?;
                self.processor.process_command(
                    CommandId::FLUSH,
                    &payload,
                    Some(message_id),
                    &mut self.synchronizer,
                )?;
                self.pump().await?;
            }
            ClientCommand::AbortSynchronization => {
                self.processor.process_command(
                    CommandId::ABORT_SYNCHRONIZATION,
                    &[],
                    Some(message_id),
                    &mut self.synchronizer,
                )?;
            }
            ClientCommand::RevisionReplayed { revision } => {
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.acked_revision = revision;
                }
                let lowest = self
                    .clients
                    .values()
                    .map(|c| c.acked_revision)
                    .min()
                    .unwrap_or(revision);
                self.processor.set_client_lower_bound(lowest);
            }
            ClientCommand::Ping => {
                self.notifier.emit(ClientEvent::CommandCompletion {
                    message_id,
                    success: true,
                });
            }
            ClientCommand::Shutdown => {
                self.begin_shutdown();
                return Ok(Directive::Shutdown);
            }
            ClientCommand::RemoveFromDisk => {
                self.begin_shutdown();
                return Ok(Directive::RemoveFromDisk);
            }
            ClientCommand::Upgrade => {
                self.begin_shutdown();
                return Ok(Directive::Upgrade);
            }
        }
        Ok(Directive::None)
    }

    fn begin_shutdown(&mut self) {
        info!("Shutting down");
        self.exiting = true;
        self.notifier.notify(Notification::shutdown());
    }

    /// Commits pending client commands and drains queues and sync requests
    /// once.
    pub async fn pump(&mut self) -> Result<()> {
        self.processor.commit_pending()?;
        self.processor.process(&mut self.synchronizer)?;
        self.synchronizer
            .process_sync_queue(self.processor.synchronizer_queue_mut())
            .await?;
        self.processor.process(&mut self.synchronizer)?;
        for moved in self.processor.take_moved_entities() {
            // Cross-resource transport is the host's job.
            warn!(
                target = %moved.target_resource,
                id = %moved.create.entity_id,
                "Entity moved to another resource; forwarding not handled here"
            );
        }
        Ok(())
    }

    /// Processes until every queue, request and pending commit has drained.
    ///
    /// This is the barrier flush protocols and tests build on.
    pub async fn process_all_messages(&mut self) -> Result<()> {
        self.processor
            .process_all_messages(&mut self.synchronizer)
            .await
    }

    /// Runs a one-shot query against the current snapshot.
    pub fn query(&self, query: Query) -> Result<ResultSet> {
        let store = self.processor.store().reader();
        let mut runner = QueryRunner::new(query, &store)?;
        runner.initial(&store)
    }

    /// Creates a resumable runner for paginated or incremental queries.
    pub fn query_runner(&self, query: Query) -> Result<(QueryRunner, EntityStore)> {
        let store = self.processor.store().reader();
        let runner = QueryRunner::new(query, &store)?;
        Ok((runner, store))
    }

    /// Spawns a live query following every committed revision.
    pub fn live_query(&self, query: Query) -> LiveQueryHandle {
        query::spawn_live_query(
            query,
            self.processor.store().reader(),
            self.revision_rx.clone(),
        )
    }

    /// Read access to the entity store.
    pub fn store(&self) -> EntityStore {
        self.processor.store().reader()
    }

    /// The current resource status.
    pub fn status(&self) -> ResourceStatus {
        self.synchronizer.status()
    }

    /// The outbound replay cursor, for diagnostics.
    pub fn last_replayed_revision(&self) -> Result<Revision> {
        self.synchronizer.last_replayed_revision()
    }

    /// Direct secret injection, bypassing the message path.
    pub fn set_secret(&mut self, secret: impl Into<String>) {
        self.synchronizer.set_secret(secret);
    }

    /// True iff the latest revision of the id is live.
    pub fn exists(&self, ty: EntityType, id: Identifier) -> Result<bool> {
        self.processor.store().exists(ty, id)
    }

    /// Consumes the resource and deletes all its data from disk.
    pub fn remove_from_disk(self) -> Result<()> {
        let Resource {
            config,
            envs,
            processor,
            synchronizer,
            ..
        } = self;
        // Every environment handle must be gone before the files are.
        drop(processor);
        drop(synchronizer);
        envs.clear();
        envs.remove_from_disk(&config.environment_paths())?;
        let _ = std::fs::remove_file(config.lock_path());
        info!("Removed resource from disk");
        Ok(())
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("instance", &self.config.instance_id)
            .field("clients", &self.clients.len())
            .field("exiting", &self.exiting)
            .finish_non_exhaustive()
    }
}

/// Boxes a preprocessor into the resource's pipeline.
///
/// Must run before the first command is processed.
impl Resource {
    /// Registers a pipeline preprocessor for one entity type.
    pub fn add_preprocessor(&mut self, ty: EntityType, preprocessor: Box<dyn Preprocessor>) {
        self.processor.pipeline_mut().add_preprocessor(ty, preprocessor);
    }
}
