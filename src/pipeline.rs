//! The command pipeline: applies create/modify/delete commands to the
//! entity store in strict arrival order.
//!
//! Preprocessors run per type before the store write and may enrich the
//! entity, reject the command, or redirect a modification to another
//! resource (delete here, create there). Their property edits are persisted
//! as part of the same revision, and the recorded `modifiedProperties` set
//! is the union of the client-supplied and preprocessor-set properties.

use std::collections::HashMap;

use tracing::{debug, instrument, trace, warn};

use crate::commands::{CreateEntity, DeleteEntity, ModifyEntity};
use crate::entity::Entity;
use crate::error::{NotFoundError, Result, SinkError};
use crate::store::EntityStore;
use crate::types::{EntityType, Identifier, Revision};

/// What a preprocessor wants done with the command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreprocessorAction {
    /// Continue with the local write.
    PassThrough,
    /// Do not write locally; emit delete-here plus create-there commands
    /// targeting the entity's new resource.
    MoveToResource,
}

/// Context handed to deletion hooks so they can garbage-collect child
/// entities in the same batch.
#[derive(Debug, Default)]
pub struct DeletionContext {
    child_deletions: Vec<(EntityType, Identifier)>,
}

impl DeletionContext {
    /// Requests removal of a child entity after the main removal.
    pub fn delete_child(&mut self, ty: EntityType, id: Identifier) {
        self.child_deletions.push((ty, id));
    }
}

/// An ordered per-type hook into the pipeline.
///
/// Default implementations pass everything through unchanged.
pub trait Preprocessor: Send {
    /// Runs before a creation is written; may enrich or reject.
    fn new_entity(&mut self, _ty: EntityType, _entity: &mut Entity) -> Result<PreprocessorAction> {
        Ok(PreprocessorAction::PassThrough)
    }

    /// Runs before a modification is written; may enrich, reject, or move
    /// the entity to another resource.
    fn modified_entity(
        &mut self,
        _ty: EntityType,
        _old: &Entity,
        _new: &mut Entity,
    ) -> Result<PreprocessorAction> {
        Ok(PreprocessorAction::PassThrough)
    }

    /// Runs before a removal is written; may schedule child removals.
    fn deleted_entity(
        &mut self,
        _ty: EntityType,
        _old: &Entity,
        _ctx: &mut DeletionContext,
    ) -> Result<()> {
        Ok(())
    }
}

/// A creation redirected to another resource instance.
#[derive(Clone, Debug)]
pub struct MovedEntity {
    /// Target resource instance id.
    pub target_resource: String,
    /// The creation command the target should apply.
    pub create: CreateEntity,
}

/// Applies commands to the entity store; the single writer of a resource.
pub struct Pipeline {
    store: EntityStore,
    preprocessors: HashMap<EntityType, Vec<Box<dyn Preprocessor>>>,
    moved: Vec<MovedEntity>,
    last_committed: Revision,
}

impl Pipeline {
    /// Creates a pipeline over the store.
    pub fn new(store: EntityStore) -> Self {
        Self {
            store,
            preprocessors: HashMap::new(),
            moved: Vec::new(),
            last_committed: 0,
        }
    }

    /// Appends a preprocessor for one type; order of registration is order
    /// of execution.
    pub fn add_preprocessor(&mut self, ty: EntityType, preprocessor: Box<dyn Preprocessor>) {
        self.preprocessors.entry(ty).or_default().push(preprocessor);
    }

    /// The underlying store.
    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Mutable access for maintenance operations (cleanup, upgrade).
    pub fn store_mut(&mut self) -> &mut EntityStore {
        &mut self.store
    }

    /// Begins a batch transaction.
    pub fn start_transaction(&mut self) -> Result<()> {
        self.store.start_transaction()
    }

    /// True while a batch transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.store.has_transaction()
    }

    /// Commits the batch. Returns the new top revision when the batch
    /// advanced it, so the caller can signal `revisionUpdated`.
    pub fn commit(&mut self) -> Result<Option<Revision>> {
        if !self.store.has_transaction() {
            return Ok(None);
        }
        let revision = self.store.max_revision()?;
        self.store.commit_transaction()?;
        if revision > self.last_committed {
            self.last_committed = revision;
            trace!(revision, "Pipeline commit advanced revision");
            Ok(Some(revision))
        } else {
            Ok(None)
        }
    }

    /// Rolls the batch back; its messages stay queued for retry.
    pub fn abort(&mut self) {
        self.store.abort_transaction();
    }

    /// Drains creations redirected to other resources.
    pub fn take_moved_entities(&mut self) -> Vec<MovedEntity> {
        std::mem::take(&mut self.moved)
    }

    /// Batched revision cleanup below the given lower bound.
    pub fn cleanup_revisions(&mut self, lower_bound: Revision) -> Result<bool> {
        self.store.cleanup_revisions(lower_bound)
    }

    fn run_new_preprocessors(&mut self, ty: EntityType, entity: &mut Entity) -> Result<PreprocessorAction> {
        if let Some(list) = self.preprocessors.get_mut(&ty) {
            for preprocessor in list {
                if preprocessor.new_entity(ty, entity)? == PreprocessorAction::MoveToResource {
                    return Ok(PreprocessorAction::MoveToResource);
                }
            }
        }
        Ok(PreprocessorAction::PassThrough)
    }

    fn run_modify_preprocessors(
        &mut self,
        ty: EntityType,
        old: &Entity,
        new: &mut Entity,
    ) -> Result<PreprocessorAction> {
        if let Some(list) = self.preprocessors.get_mut(&ty) {
            for preprocessor in list {
                if preprocessor.modified_entity(ty, old, new)? == PreprocessorAction::MoveToResource {
                    return Ok(PreprocessorAction::MoveToResource);
                }
            }
        }
        Ok(PreprocessorAction::PassThrough)
    }

    fn run_delete_preprocessors(
        &mut self,
        ty: EntityType,
        old: &Entity,
    ) -> Result<DeletionContext> {
        let mut ctx = DeletionContext::default();
        if let Some(list) = self.preprocessors.get_mut(&ty) {
            for preprocessor in list {
                preprocessor.deleted_entity(ty, old, &mut ctx)?;
            }
        }
        Ok(ctx)
    }

    /// Applies a creation command.
    #[instrument(skip(self, payload))]
    pub fn new_entity(&mut self, payload: &[u8]) -> Result<Revision> {
        let command: CreateEntity = bincode::deserialize(payload)
            .map_err(|e| SinkError::invalid_buffer(e.to_string()))?;
        let id = if command.entity_id.is_nil() {
            Identifier::new()
        } else {
            command.entity_id
        };
        let ty = command.entity_type;
        let mut entity = Entity::new(id);
        entity.resource = command.resource;
        entity.local = command.local;

        self.run_new_preprocessors(ty, &mut entity)?;
        let revision = self.store.add(ty, entity, command.replay_to_source)?;
        trace!(%id, revision, "Created entity");
        Ok(revision)
    }

    /// Applies a modification command.
    ///
    /// A modification carrying a target resource (or turned into one by a
    /// preprocessor) emits an equivalent creation for the target. With the
    /// remove flag set that is a move and the local entity becomes a
    /// tombstone; without it the entity is copied and the modification
    /// still applies locally.
    #[instrument(skip(self, payload))]
    pub fn modified_entity(&mut self, payload: &[u8]) -> Result<Revision> {
        let command: ModifyEntity = bincode::deserialize(payload)
            .map_err(|e| SinkError::invalid_buffer(e.to_string()))?;
        let ty = command.entity_type;
        let id = command.entity_id;

        let current = self
            .store
            .read_latest(ty, id)?
            .filter(|e| !e.is_tombstone())
            .ok_or_else(|| NotFoundError::entity(ty, id))?;

        let mut new_entity = current.clone();
        new_entity.apply_diff(&command.delta, &command.deletions);

        let action = self.run_modify_preprocessors(ty, &current, &mut new_entity)?;
        let relocating =
            command.target_resource.is_some() || action == PreprocessorAction::MoveToResource;
        if relocating {
            let target = command
                .target_resource
                .clone()
                .unwrap_or_default();
            self.moved.push(MovedEntity {
                target_resource: target.clone(),
                create: CreateEntity {
                    entity_id: id,
                    entity_type: ty,
                    resource: new_entity.resource.clone(),
                    local: new_entity.local.clone(),
                    replay_to_source: true,
                },
            });
            // A preprocessor-initiated move always deletes here; a command
            // decides through its remove flag whether this is a move or a
            // copy that keeps the local entity.
            if command.remove_entity || action == PreprocessorAction::MoveToResource {
                debug!(%id, %target, "Moving entity to another resource");
                return self.store.remove(ty, &current, command.replay_to_source);
            }
            debug!(%id, %target, "Copying entity to another resource");
        }

        let mut modified = changed_properties(&current, &new_entity);
        for name in command
            .modified_properties
            .iter()
            .chain(command.deletions.iter())
        {
            if !modified.contains(name) {
                modified.push(name.clone());
            }
        }
        let revision =
            self.store
                .modify_entity(ty, &current, new_entity, modified, command.replay_to_source)?;
        trace!(%id, revision, "Modified entity");
        Ok(revision)
    }

    /// Applies a deletion command, then any child removals the hooks
    /// scheduled.
    #[instrument(skip(self, payload))]
    pub fn deleted_entity(&mut self, payload: &[u8]) -> Result<Revision> {
        let command: DeleteEntity = bincode::deserialize(payload)
            .map_err(|e| SinkError::invalid_buffer(e.to_string()))?;
        let ty = command.entity_type;
        let id = command.entity_id;

        let current = self
            .store
            .read_latest(ty, id)?
            .ok_or_else(|| NotFoundError::entity(ty, id))?;
        if current.is_tombstone() {
            return Err(SinkError::AlreadyRemoved { ty, id });
        }

        let ctx = self.run_delete_preprocessors(ty, &current)?;
        let revision = self.store.remove(ty, &current, command.replay_to_source)?;

        for (child_ty, child_id) in ctx.child_deletions {
            match self.store.read_latest(child_ty, child_id)? {
                Some(child) if !child.is_tombstone() => {
                    self.store.remove(child_ty, &child, command.replay_to_source)?;
                }
                _ => warn!(%child_id, "Deletion hook named a missing child"),
            }
        }
        debug!(%id, revision, "Deleted entity");
        Ok(revision)
    }
}

/// Property names whose values differ between two entity versions, either
/// direction (set, changed, or dropped).
fn changed_properties(old: &Entity, new: &Entity) -> Vec<String> {
    let mut out = Vec::new();
    for (name, value) in &new.local {
        if old.property(name) != Some(value) {
            out.push(name.clone());
        }
    }
    for name in old.local.keys() {
        if !new.local.contains_key(name) && !out.contains(name) {
            out.push(name.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CreateEntity;
    use crate::entity::{Properties, PropertyValue};
    use crate::registry::TypeRegistry;
    use crate::storage::Environment;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn open_pipeline(dir: &std::path::Path) -> Pipeline {
        let env = Arc::new(Environment::open(dir.join("instance1")).unwrap());
        let registry = Arc::new(TypeRegistry::standard());
        let mut store = EntityStore::new(env, registry);
        store.initialize().unwrap();
        Pipeline::new(store)
    }

    fn create_command(subject: &str) -> Vec<u8> {
        let mut local = Properties::new();
        local.insert("subject".into(), PropertyValue::Text(subject.into()));
        local.insert(
            "messageId".into(),
            PropertyValue::Bytes(subject.as_bytes().to_vec()),
        );
        bincode::serialize(&CreateEntity {
            entity_id: Identifier::new(),
            entity_type: EntityType::Mail,
            resource: Properties::new(),
            local,
            replay_to_source: true,
        })
        .unwrap()
    }

    struct Stamp;
    impl Preprocessor for Stamp {
        fn new_entity(&mut self, _ty: EntityType, entity: &mut Entity) -> Result<PreprocessorAction> {
            entity.set_property("unread", true);
            Ok(PreprocessorAction::PassThrough)
        }
        fn modified_entity(
            &mut self,
            _ty: EntityType,
            _old: &Entity,
            new: &mut Entity,
        ) -> Result<PreprocessorAction> {
            new.set_property("important", true);
            Ok(PreprocessorAction::PassThrough)
        }
    }

    #[test]
    fn create_allocates_sequential_revisions() {
        let dir = tempdir().unwrap();
        let mut pipeline = open_pipeline(dir.path());
        pipeline.start_transaction().unwrap();
        assert_eq!(pipeline.new_entity(&create_command("a")).unwrap(), 1);
        assert_eq!(pipeline.new_entity(&create_command("b")).unwrap(), 2);
        assert_eq!(pipeline.commit().unwrap(), Some(2));
        // No new writes, no new signal.
        pipeline.start_transaction().unwrap();
        assert_eq!(pipeline.commit().unwrap(), None);
    }

    #[test]
    fn preprocessor_enrichment_is_persisted() {
        let dir = tempdir().unwrap();
        let mut pipeline = open_pipeline(dir.path());
        pipeline.add_preprocessor(EntityType::Mail, Box::new(Stamp));

        pipeline.start_transaction().unwrap();
        pipeline.new_entity(&create_command("a")).unwrap();
        pipeline.commit().unwrap();

        let store = pipeline.store().reader();
        let entities = store.read_all(EntityType::Mail).unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(
            entities[0].property("unread"),
            Some(&PropertyValue::Bool(true))
        );
    }

    #[test]
    fn modification_records_union_of_changed_properties() {
        let dir = tempdir().unwrap();
        let mut pipeline = open_pipeline(dir.path());
        pipeline.add_preprocessor(EntityType::Mail, Box::new(Stamp));

        pipeline.start_transaction().unwrap();
        pipeline.new_entity(&create_command("a")).unwrap();
        pipeline.commit().unwrap();
        let id = pipeline.store().read_all_uids(EntityType::Mail).unwrap()[0];

        let mut delta = Properties::new();
        delta.insert("subject".into(), PropertyValue::Text("updated".into()));
        let payload = bincode::serialize(&ModifyEntity {
            revision: 1,
            entity_id: id,
            entity_type: EntityType::Mail,
            deletions: vec![],
            delta,
            replay_to_source: true,
            modified_properties: vec!["subject".into()],
            target_resource: None,
            remove_entity: false,
        })
        .unwrap();

        pipeline.start_transaction().unwrap();
        pipeline.modified_entity(&payload).unwrap();
        pipeline.commit().unwrap();

        let entity = pipeline
            .store()
            .read_latest(EntityType::Mail, id)
            .unwrap()
            .unwrap();
        let modified = entity.metadata.modified_properties.clone().unwrap();
        // Client change and preprocessor change both recorded.
        assert!(modified.contains(&"subject".to_string()));
        assert!(modified.contains(&"important".to_string()));
    }

    #[test]
    fn modify_missing_entity_fails_without_state_change() {
        let dir = tempdir().unwrap();
        let mut pipeline = open_pipeline(dir.path());
        let payload = bincode::serialize(&ModifyEntity {
            revision: 1,
            entity_id: Identifier::new(),
            entity_type: EntityType::Mail,
            deletions: vec![],
            delta: Properties::new(),
            replay_to_source: true,
            modified_properties: vec![],
            target_resource: None,
            remove_entity: false,
        })
        .unwrap();
        pipeline.start_transaction().unwrap();
        assert!(pipeline.modified_entity(&payload).unwrap_err().is_not_found());
        pipeline.abort();
        assert_eq!(pipeline.store().max_revision().unwrap(), 0);
    }

    #[test]
    fn move_to_resource_deletes_here_and_emits_create_there() {
        let dir = tempdir().unwrap();
        let mut pipeline = open_pipeline(dir.path());
        pipeline.start_transaction().unwrap();
        pipeline.new_entity(&create_command("movable")).unwrap();
        pipeline.commit().unwrap();
        let id = pipeline.store().read_all_uids(EntityType::Mail).unwrap()[0];

        let payload = bincode::serialize(&ModifyEntity {
            revision: 1,
            entity_id: id,
            entity_type: EntityType::Mail,
            deletions: vec![],
            delta: Properties::new(),
            replay_to_source: true,
            modified_properties: vec![],
            target_resource: Some("other.instance".into()),
            remove_entity: true,
        })
        .unwrap();

        pipeline.start_transaction().unwrap();
        pipeline.modified_entity(&payload).unwrap();
        pipeline.commit().unwrap();

        assert!(!pipeline.store().exists(EntityType::Mail, id).unwrap());
        let moved = pipeline.take_moved_entities();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].target_resource, "other.instance");
        assert_eq!(moved[0].create.entity_id, id);
    }

    #[test]
    fn copy_to_resource_keeps_local_entity() {
        let dir = tempdir().unwrap();
        let mut pipeline = open_pipeline(dir.path());
        pipeline.start_transaction().unwrap();
        pipeline.new_entity(&create_command("copied")).unwrap();
        pipeline.commit().unwrap();
        let id = pipeline.store().read_all_uids(EntityType::Mail).unwrap()[0];

        let mut delta = Properties::new();
        delta.insert("subject".into(), PropertyValue::Text("copied out".into()));
        let payload = bincode::serialize(&ModifyEntity {
            revision: 1,
            entity_id: id,
            entity_type: EntityType::Mail,
            deletions: vec![],
            delta,
            replay_to_source: true,
            modified_properties: vec!["subject".into()],
            target_resource: Some("other.instance".into()),
            remove_entity: false,
        })
        .unwrap();

        pipeline.start_transaction().unwrap();
        pipeline.modified_entity(&payload).unwrap();
        pipeline.commit().unwrap();

        // The creation for the target went out, the local entity stayed and
        // took the modification.
        let moved = pipeline.take_moved_entities();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].target_resource, "other.instance");
        assert!(pipeline.store().exists(EntityType::Mail, id).unwrap());
        let entity = pipeline
            .store()
            .read_latest(EntityType::Mail, id)
            .unwrap()
            .unwrap();
        assert_eq!(
            entity.property("subject").unwrap().as_text(),
            Some("copied out")
        );
        assert_eq!(entity.metadata.revision, 2);
    }

    struct FolderGc;
    impl Preprocessor for FolderGc {
        fn deleted_entity(
            &mut self,
            _ty: EntityType,
            old: &Entity,
            ctx: &mut DeletionContext,
        ) -> Result<()> {
            if let Some(PropertyValue::Reference(child)) = old.property("firstChild") {
                ctx.delete_child(EntityType::Mail, *child);
            }
            Ok(())
        }
    }

    #[test]
    fn deletion_hooks_remove_children() {
        let dir = tempdir().unwrap();
        let mut pipeline = open_pipeline(dir.path());
        pipeline.add_preprocessor(EntityType::Folder, Box::new(FolderGc));

        pipeline.start_transaction().unwrap();
        pipeline.new_entity(&create_command("child")).unwrap();
        pipeline.commit().unwrap();
        let child_id = pipeline.store().read_all_uids(EntityType::Mail).unwrap()[0];

        let mut local = Properties::new();
        local.insert("name".into(), PropertyValue::Text("inbox".into()));
        local.insert("firstChild".into(), PropertyValue::Reference(child_id));
        let folder_create = bincode::serialize(&CreateEntity {
            entity_id: Identifier::new(),
            entity_type: EntityType::Folder,
            resource: Properties::new(),
            local,
            replay_to_source: true,
        })
        .unwrap();

        pipeline.start_transaction().unwrap();
        pipeline.new_entity(&folder_create).unwrap();
        pipeline.commit().unwrap();
        let folder_id = pipeline.store().read_all_uids(EntityType::Folder).unwrap()[0];

        let delete = bincode::serialize(&DeleteEntity {
            revision: 2,
            entity_id: folder_id,
            entity_type: EntityType::Folder,
            replay_to_source: true,
        })
        .unwrap();
        pipeline.start_transaction().unwrap();
        pipeline.deleted_entity(&delete).unwrap();
        pipeline.commit().unwrap();

        assert!(!pipeline.store().exists(EntityType::Folder, folder_id).unwrap());
        assert!(!pipeline.store().exists(EntityType::Mail, child_id).unwrap());
    }
}
