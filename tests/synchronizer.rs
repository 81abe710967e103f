//! Integration tests for inbound synchronization and outbound change
//! replay: retry on transient failures, scan-for-removals, status mapping.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sinkstore::{
    ClientCommand, ClientEvent, CommandId, Config, CreateEntity, Entity, EntityType, Identifier,
    NotificationType, Operation, Properties, PropertyValue, Query, ReplayItem, Resource,
    ResourceStatus, SourceAdapter, SyncContext, SyncError, TypeRegistry,
};
use tempfile::tempdir;

/// What the fake source currently holds, plus scripted failures.
#[derive(Default)]
struct SourceState {
    /// Remote id → subject of objects the source offers on sync.
    remote_objects: BTreeMap<String, String>,
    /// Remote ids that still exist when scanning for removals.
    existing: HashSet<String>,
    /// Errors returned by the next replay calls, in order.
    replay_errors: VecDeque<SyncError>,
    /// Every successfully replayed (operation, identifier) pair.
    replayed: Vec<(Operation, Identifier)>,
    /// Error returned by the next synchronize call.
    sync_error: Option<SyncError>,
}

#[derive(Clone)]
struct FakeSource {
    state: Arc<Mutex<SourceState>>,
}

impl FakeSource {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SourceState::default())),
        }
    }
}

#[async_trait]
impl SourceAdapter for FakeSource {
    async fn synchronize_with_source(
        &mut self,
        _query: Option<&Query>,
        ctx: &mut SyncContext<'_>,
    ) -> Result<(), SyncError> {
        let (objects, existing, error) = {
            let mut state = self.state.lock().unwrap();
            (
                state.remote_objects.clone(),
                state.existing.clone(),
                state.sync_error.take(),
            )
        };
        if let Some(error) = error {
            return Err(error);
        }
        for (remote_id, subject) in objects {
            let mut entity = Entity::new(Identifier::nil());
            entity.set_property("subject", subject.as_str());
            entity.set_property(
                "messageId",
                PropertyValue::Bytes(remote_id.as_bytes().to_vec()),
            );
            ctx.create_or_modify(EntityType::Mail, &remote_id, entity, &BTreeMap::new())
                .map_err(|e| SyncError::Unknown(e.to_string()))?;
        }
        ctx.scan_for_removals(EntityType::Mail, |remote_id| existing.contains(remote_id))
            .map_err(|e| SyncError::Unknown(e.to_string()))?;
        Ok(())
    }

    async fn replay(
        &mut self,
        item: &ReplayItem,
        old_remote_id: Option<String>,
        _modified: &[String],
    ) -> Result<Option<String>, SyncError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.replay_errors.pop_front() {
            return Err(error);
        }
        state
            .replayed
            .push((item.entity.metadata.operation, item.key.id));
        match item.entity.metadata.operation {
            Operation::Removal => Ok(old_remote_id),
            _ => Ok(Some(format!("remote-{}", item.key.id))),
        }
    }
}

fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::new(dir, "dummy.instance1");
    config.test_mode = true;
    config
}

async fn open_resource(dir: &std::path::Path, source: FakeSource) -> Resource {
    let mut resource = Resource::open(
        test_config(dir),
        Arc::new(TypeRegistry::standard()),
        Box::new(source),
    )
    .await
    .unwrap();
    resource.set_secret("test-secret");
    resource.client_connected(1);
    resource
}

async fn create_mail(resource: &mut Resource, message_id: u64, subject: &str) -> Identifier {
    let id = Identifier::new();
    let mut local = Properties::new();
    local.insert("subject".into(), PropertyValue::Text(subject.into()));
    local.insert(
        "messageId".into(),
        PropertyValue::Bytes(subject.as_bytes().to_vec()),
    );
    resource
        .handle_message(
            1,
            message_id,
            ClientCommand::Command {
                id: CommandId::CREATE_ENTITY,
                payload: bincode::serialize(&CreateEntity {
                    entity_id: id,
                    entity_type: EntityType::Mail,
                    resource: Properties::new(),
                    local,
                    replay_to_source: true,
                })
                .unwrap(),
            },
        )
        .await
        .unwrap();
    id
}

// ============================================================================
// S5 — Outbound replay retry
// ============================================================================

#[tokio::test]
async fn transient_replay_error_halts_then_retries() {
    let dir = tempdir().unwrap();
    let source = FakeSource::new();
    source
        .state
        .lock()
        .unwrap()
        .replay_errors
        .push_back(SyncError::Connection("refused".into()));

    let mut resource = open_resource(dir.path(), source.clone()).await;
    create_mail(&mut resource, 1, "first").await;
    resource.process_all_messages().await.unwrap();

    // The transient failure left the cursor untouched.
    assert_eq!(resource.last_replayed_revision().unwrap(), 0);
    assert!(source.state.lock().unwrap().replayed.is_empty());
    assert_eq!(resource.status(), ResourceStatus::Offline);

    // The next revision pulse retries from the same spot.
    create_mail(&mut resource, 2, "second").await;
    resource.process_all_messages().await.unwrap();

    assert_eq!(resource.last_replayed_revision().unwrap(), 2);
    let replayed = source.state.lock().unwrap().replayed.clone();
    assert_eq!(replayed.len(), 2);
    assert!(replayed.iter().all(|(op, _)| *op == Operation::Creation));
    assert_eq!(resource.status(), ResourceStatus::Connected);
}

#[tokio::test]
async fn permanent_replay_error_is_skipped() {
    let dir = tempdir().unwrap();
    let source = FakeSource::new();
    source
        .state
        .lock()
        .unwrap()
        .replay_errors
        .push_back(SyncError::Transmission("payload rejected".into()));

    let mut resource = open_resource(dir.path(), source.clone()).await;
    create_mail(&mut resource, 1, "poison").await;
    create_mail(&mut resource, 2, "fine").await;
    resource.process_all_messages().await.unwrap();

    // The poison pill was skipped, the next revision went through.
    assert_eq!(resource.last_replayed_revision().unwrap(), 2);
    assert_eq!(source.state.lock().unwrap().replayed.len(), 1);
}

// ============================================================================
// S6 — Inbound scan-for-removals
// ============================================================================

#[tokio::test]
async fn scan_for_removals_deletes_vanished_entities() {
    let dir = tempdir().unwrap();
    let source = FakeSource::new();
    {
        let mut state = source.state.lock().unwrap();
        state.remote_objects.insert("ra".into(), "mail a".into());
        state.remote_objects.insert("rb".into(), "mail b".into());
        state.existing.insert("ra".into());
        state.existing.insert("rb".into());
    }

    let mut resource = open_resource(dir.path(), source.clone()).await;
    resource
        .handle_message(1, 1, ClientCommand::Synchronize { query: None })
        .await
        .unwrap();
    resource.process_all_messages().await.unwrap();

    let store = resource.store();
    assert_eq!(store.read_all_uids(EntityType::Mail).unwrap().len(), 2);

    // The source dropped rb.
    {
        let mut state = source.state.lock().unwrap();
        state.remote_objects.remove("rb");
        state.existing.remove("rb");
    }
    resource
        .handle_message(1, 2, ClientCommand::Synchronize { query: None })
        .await
        .unwrap();
    resource.process_all_messages().await.unwrap();

    let store = resource.store();
    let remaining = store.read_all_uids(EntityType::Mail).unwrap();
    assert_eq!(remaining.len(), 1);
    let survivor = store
        .read_latest(EntityType::Mail, remaining[0])
        .unwrap()
        .unwrap();
    assert_eq!(survivor.property("subject").unwrap().as_text(), Some("mail a"));
}

// ============================================================================
// Inbound behavior
// ============================================================================

#[tokio::test]
async fn source_changes_are_not_replayed_back() {
    let dir = tempdir().unwrap();
    let source = FakeSource::new();
    source
        .state
        .lock()
        .unwrap()
        .remote_objects
        .insert("ra".into(), "inbound".into());

    let mut resource = open_resource(dir.path(), source.clone()).await;
    resource
        .handle_message(1, 1, ClientCommand::Synchronize { query: None })
        .await
        .unwrap();
    resource.process_all_messages().await.unwrap();

    // The cursor advanced past the inbound revision without replaying it.
    assert_eq!(resource.last_replayed_revision().unwrap(), 1);
    assert!(source.state.lock().unwrap().replayed.is_empty());
}

#[tokio::test]
async fn unchanged_inbound_modification_is_dropped() {
    let dir = tempdir().unwrap();
    let source = FakeSource::new();
    source
        .state
        .lock()
        .unwrap()
        .remote_objects
        .insert("ra".into(), "same".into());

    let mut resource = open_resource(dir.path(), source.clone()).await;
    resource
        .handle_message(1, 1, ClientCommand::Synchronize { query: None })
        .await
        .unwrap();
    resource.process_all_messages().await.unwrap();
    let after_first = resource.store().max_revision().unwrap();

    // Same content again: no new revision.
    resource
        .handle_message(1, 2, ClientCommand::Synchronize { query: None })
        .await
        .unwrap();
    resource.process_all_messages().await.unwrap();
    assert_eq!(resource.store().max_revision().unwrap(), after_first);

    // Changed content: a modification lands.
    source
        .state
        .lock()
        .unwrap()
        .remote_objects
        .insert("ra".into(), "changed".into());
    resource
        .handle_message(1, 3, ClientCommand::Synchronize { query: None })
        .await
        .unwrap();
    resource.process_all_messages().await.unwrap();
    assert_eq!(resource.store().max_revision().unwrap(), after_first + 1);
}

// ============================================================================
// Status and notifications
// ============================================================================

#[tokio::test]
async fn login_error_maps_to_error_status() {
    let dir = tempdir().unwrap();
    let source = FakeSource::new();
    source.state.lock().unwrap().sync_error = Some(SyncError::Login("bad password".into()));

    let mut resource = open_resource(dir.path(), source).await;
    let events = resource.subscribe();
    resource
        .handle_message(1, 1, ClientCommand::Synchronize { query: None })
        .await
        .unwrap();
    resource.process_all_messages().await.unwrap();

    assert_eq!(resource.status(), ResourceStatus::Error);
    let warnings: Vec<_> = events
        .drain()
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                ClientEvent::Notification(n) if n.notification_type == NotificationType::Warning
            )
        })
        .collect();
    assert!(!warnings.is_empty());
}

#[tokio::test]
async fn missing_secret_emits_warning_and_keeps_queue() {
    let dir = tempdir().unwrap();
    let source = FakeSource::new();
    source
        .state
        .lock()
        .unwrap()
        .remote_objects
        .insert("ra".into(), "locked out".into());

    let mut resource = Resource::open(
        test_config(dir.path()),
        Arc::new(TypeRegistry::standard()),
        Box::new(source),
    )
    .await
    .unwrap();
    resource.client_connected(1);
    let events = resource.subscribe();

    resource
        .handle_message(1, 1, ClientCommand::Synchronize { query: None })
        .await
        .unwrap();
    resource.pump().await.unwrap();

    assert!(events.drain().iter().any(|e| matches!(
        e,
        ClientEvent::Notification(n) if n.notification_type == NotificationType::Warning
    )));
    // Nothing was synchronized without the secret.
    assert_eq!(resource.store().max_revision().unwrap(), 0);

    // Supplying the secret releases the queued request.
    resource
        .handle_message(1, 2, ClientCommand::Secret { secret: "s3cret".into() })
        .await
        .unwrap();
    resource.process_all_messages().await.unwrap();
    assert_eq!(resource.store().max_revision().unwrap(), 1);
}

#[tokio::test]
async fn abort_completes_queued_flushes() {
    let dir = tempdir().unwrap();
    let source = FakeSource::new();
    // No secret: the sync queue stays blocked, so the flush is still queued
    // when the abort arrives.
    let mut resource = Resource::open(
        test_config(dir.path()),
        Arc::new(TypeRegistry::standard()),
        Box::new(source),
    )
    .await
    .unwrap();
    resource.client_connected(1);
    let events = resource.subscribe();

    resource
        .handle_message(
            1,
            1,
            ClientCommand::Flush {
                id: "fsync".into(),
                flush_type: sinkstore::FlushType::FlushSynchronization,
            },
        )
        .await
        .unwrap();
    resource
        .handle_message(1, 2, ClientCommand::AbortSynchronization)
        .await
        .unwrap();

    let completions: Vec<String> = events
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            ClientEvent::Notification(n)
                if n.notification_type == NotificationType::FlushCompletion =>
            {
                Some(n.id)
            }
            _ => None,
        })
        .collect();
    assert_eq!(completions, vec!["fsync".to_string()]);
}
