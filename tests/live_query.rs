//! Live queries: snapshot first, then incremental result sets on every
//! committed revision, ending when the resource goes away.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sinkstore::{
    ClientCommand, CommandId, Config, CreateEntity, EntityType, Identifier, Operation, Properties,
    PropertyValue, Query, Resource, SourceAdapter, SyncContext, SyncError, TypeRegistry,
};
use tempfile::tempdir;
use tokio::time::timeout;

struct NullAdapter;

#[async_trait]
impl SourceAdapter for NullAdapter {
    async fn synchronize_with_source(
        &mut self,
        _query: Option<&Query>,
        _ctx: &mut SyncContext<'_>,
    ) -> Result<(), SyncError> {
        Ok(())
    }

    async fn replay(
        &mut self,
        _item: &sinkstore::ReplayItem,
        _old_remote_id: Option<String>,
        _modified: &[String],
    ) -> Result<Option<String>, SyncError> {
        Ok(None)
    }
}

async fn open_resource(dir: &std::path::Path) -> Resource {
    let mut config = Config::new(dir, "dummy.instance1");
    config.test_mode = true;
    let mut resource = Resource::open(
        config,
        Arc::new(TypeRegistry::standard()),
        Box::new(NullAdapter),
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
    resource.process_all_messages().await.unwrap();
    id
}

#[tokio::test]
async fn live_query_emits_snapshot_then_increments() {
    let dir = tempdir().unwrap();
    let mut resource = open_resource(dir.path()).await;
    let first = create_mail(&mut resource, 1, "first").await;

    let mut handle = resource.live_query(Query::for_type(EntityType::Mail).live());

    let snapshot = timeout(Duration::from_secs(5), handle.results.next())
        .await
        .expect("snapshot in time")
        .expect("snapshot present");
    assert_eq!(snapshot.ids(), vec![first]);
    assert!(snapshot
        .results
        .iter()
        .all(|r| r.operation == Operation::Creation));

    let second = create_mail(&mut resource, 2, "second").await;
    let increment = timeout(Duration::from_secs(5), handle.results.next())
        .await
        .expect("increment in time")
        .expect("increment present");
    assert_eq!(increment.ids(), vec![second]);
    assert_eq!(increment.results[0].operation, Operation::Creation);
}

#[tokio::test]
async fn live_query_ends_when_resource_drops() {
    let dir = tempdir().unwrap();
    let resource = open_resource(dir.path()).await;
    let mut handle = resource.live_query(Query::for_type(EntityType::Mail).live());

    // Snapshot of the empty store.
    let snapshot = timeout(Duration::from_secs(5), handle.results.next())
        .await
        .expect("snapshot in time")
        .expect("snapshot present");
    assert!(snapshot.is_empty());

    drop(resource);
    let end = timeout(Duration::from_secs(5), handle.results.next())
        .await
        .expect("stream end in time");
    assert!(end.is_none());
}
