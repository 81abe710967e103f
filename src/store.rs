//! Entity store: the sole writer to a resource's entity environment.
//!
//! The store keeps an append-only revision log per type plus the shared
//! revision bookkeeping tables, and maintains all declared indexes in the
//! same transaction as the entity write. Readers take their own snapshot
//! transactions and never block the writer.
//!
//! Every mutating call requires an explicit transaction
//! ([`EntityStore::start_transaction`]); the command pipeline batches many
//! commands into one.

use std::sync::Arc;

use redb::{ReadableMultimapTable, ReadableTable, WriteTransaction};
use tracing::{debug, error, instrument, trace, warn};

use crate::entity::{self, Entity, Metadata, Properties, PropertyValue};
use crate::error::{NotFoundError, Result, SinkError, StorageError};
use crate::query::{Comparator, Query};
use crate::registry::{IndexTransaction, TypeRegistry};
use crate::storage::schema::{
    self, DEFAULT_TABLE, META_CLEANED_UP_REVISION, META_DATABASE_VERSION, META_MAX_REVISION,
    REVISIONS_TABLE, REVISION_TYPE_TABLE, UIDS_TO_REVISIONS_TABLE,
};
use crate::storage::{self, Environment};
use crate::types::{EntityType, Identifier, Key, Operation, Revision};

/// Result of an index-backed query source lookup.
///
/// Reports which base filters the indexes consumed and whether the returned
/// ids already follow the requested sort, so the executor knows what work
/// remains.
#[derive(Debug, Default)]
pub struct IndexLookup {
    /// Identifiers produced by the index scan.
    pub ids: Vec<Identifier>,
    /// Filter properties fully applied by the lookup.
    pub applied_filters: Vec<String>,
    /// Sort property the id order already satisfies, if any.
    pub applied_sorting: Option<String>,
}

impl IndexLookup {
    /// True if the lookup used any index at all.
    pub fn used_index(&self) -> bool {
        !self.applied_filters.is_empty() || self.applied_sorting.is_some()
    }
}

/// Handle to one resource's entity environment.
///
/// Cheap to construct; several instances may exist over the same
/// environment, but only one (the pipeline's) may ever open write
/// transactions. Readers get snapshot isolation per call.
pub struct EntityStore {
    env: Arc<Environment>,
    registry: Arc<TypeRegistry>,
    txn: Option<WriteTransaction>,
}

impl EntityStore {
    /// Creates a store over the given environment.
    pub fn new(env: Arc<Environment>, registry: Arc<TypeRegistry>) -> Self {
        Self {
            env,
            registry,
            txn: None,
        }
    }

    /// A read-only sibling over the same environment.
    pub fn reader(&self) -> EntityStore {
        EntityStore::new(Arc::clone(&self.env), Arc::clone(&self.registry))
    }

    /// The registry this store indexes with.
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Creates all declared tables and stamps the database version if the
    /// environment is fresh. Called once by the resource on startup.
    #[instrument(skip(self))]
    pub fn initialize(&mut self) -> Result<()> {
        let txn = self.env.write()?;
        {
            let mut meta = txn.open_table(DEFAULT_TABLE).map_err(StorageError::from)?;
            if storage::meta_value(&meta, META_DATABASE_VERSION)?.is_none() {
                debug!("Creating resource database");
                meta.insert(META_DATABASE_VERSION, u64::from(schema::DATABASE_VERSION))
                    .map_err(StorageError::from)?;
            }
        }
        txn.open_table(REVISION_TYPE_TABLE)
            .map_err(StorageError::from)?;
        txn.open_table(REVISIONS_TABLE).map_err(StorageError::from)?;
        txn.open_multimap_table(UIDS_TO_REVISIONS_TABLE)
            .map_err(StorageError::from)?;
        for ty in EntityType::ALL {
            txn.open_table(schema::main_table(ty))
                .map_err(StorageError::from)?;
        }
        for name in self.registry.all_databases() {
            if !name.ends_with(".main") {
                txn.open_multimap_table(schema::index_table(&name))
                    .map_err(StorageError::from)?;
            }
        }
        txn.commit().map_err(StorageError::from)?;
        Ok(())
    }

    /// The database version stamped into the environment, if any.
    pub fn database_version(&self) -> Result<Option<u64>> {
        match &self.txn {
            Some(txn) => {
                let meta = txn.open_table(DEFAULT_TABLE).map_err(StorageError::from)?;
                storage::meta_value(&meta, META_DATABASE_VERSION)
            }
            None => {
                let txn = self.env.read()?;
                storage::database_version(&txn)
            }
        }
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begins the write transaction. At most one may be open.
    pub fn start_transaction(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(StorageError::Transaction("transaction already open".into()).into());
        }
        trace!("Starting transaction");
        self.txn = Some(self.env.write()?);
        Ok(())
    }

    /// Commits the open write transaction.
    pub fn commit_transaction(&mut self) -> Result<()> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| StorageError::Transaction("no transaction to commit".into()))?;
        txn.commit().map_err(StorageError::from)?;
        trace!("Committed transaction");
        Ok(())
    }

    /// Aborts the open write transaction, discarding its writes.
    pub fn abort_transaction(&mut self) {
        if let Some(txn) = self.txn.take() {
            let _ = txn.abort();
            trace!("Aborted transaction");
        }
    }

    /// True while a write transaction is open.
    pub fn has_transaction(&self) -> bool {
        self.txn.is_some()
    }

    fn write_txn(&self) -> Result<&WriteTransaction> {
        self.txn
            .as_ref()
            .ok_or_else(|| StorageError::Transaction("operation requires a transaction".into()).into())
    }

    // ========================================================================
    // Revision bookkeeping
    // ========================================================================

    /// The largest revision written, 0 for an empty store.
    pub fn max_revision(&self) -> Result<Revision> {
        match &self.txn {
            Some(txn) => {
                let meta = txn.open_table(DEFAULT_TABLE).map_err(StorageError::from)?;
                Ok(storage::meta_value(&meta, META_MAX_REVISION)?.unwrap_or(0))
            }
            None => {
                let txn = self.env.read()?;
                storage::max_revision(&txn)
            }
        }
    }

    /// The revision up to which cleanup has run.
    pub fn cleaned_up_revision(&self) -> Result<Revision> {
        match &self.txn {
            Some(txn) => {
                let meta = txn.open_table(DEFAULT_TABLE).map_err(StorageError::from)?;
                Ok(storage::meta_value(&meta, META_CLEANED_UP_REVISION)?.unwrap_or(0))
            }
            None => {
                let txn = self.env.read()?;
                storage::cleaned_up_revision(&txn)
            }
        }
    }

    fn bump_revision(&self, txn: &WriteTransaction, revision: Revision) -> Result<()> {
        let mut meta = txn.open_table(DEFAULT_TABLE).map_err(StorageError::from)?;
        meta.insert(META_MAX_REVISION, revision)
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn record_revision(
        &self,
        txn: &WriteTransaction,
        revision: Revision,
        id: Identifier,
        ty: EntityType,
    ) -> Result<()> {
        {
            let mut revisions = txn.open_table(REVISIONS_TABLE).map_err(StorageError::from)?;
            revisions
                .insert(revision, id.as_bytes().as_slice())
                .map_err(StorageError::from)?;
        }
        {
            let mut types = txn
                .open_table(REVISION_TYPE_TABLE)
                .map_err(StorageError::from)?;
            types.insert(revision, ty.tag()).map_err(StorageError::from)?;
        }
        {
            let mut uids = txn
                .open_multimap_table(UIDS_TO_REVISIONS_TABLE)
                .map_err(StorageError::from)?;
            uids.insert(id.as_bytes().as_slice(), revision)
                .map_err(StorageError::from)?;
        }
        Ok(())
    }

    /// The identifier a revision wrote, if the revision still exists.
    pub fn uid_from_revision(&self, revision: Revision) -> Result<Option<Identifier>> {
        fn get<T: ReadableTable<u64, &'static [u8]>>(
            t: &T,
            revision: u64,
        ) -> Result<Option<Identifier>> {
            Ok(t.get(revision)
                .map_err(StorageError::from)?
                .and_then(|v| Identifier::from_slice(v.value())))
        }
        match &self.txn {
            Some(txn) => {
                let t = txn.open_table(REVISIONS_TABLE).map_err(StorageError::from)?;
                get(&t, revision)
            }
            None => {
                let txn = self.env.read()?;
                match storage::read_table(&txn, REVISIONS_TABLE)? {
                    Some(t) => get(&t, revision),
                    None => Ok(None),
                }
            }
        }
    }

    /// The type a revision wrote, if the revision still exists.
    pub fn type_from_revision(&self, revision: Revision) -> Result<Option<EntityType>> {
        fn get<T: ReadableTable<u64, u8>>(t: &T, revision: u64) -> Result<Option<EntityType>> {
            Ok(t.get(revision)
                .map_err(StorageError::from)?
                .and_then(|v| EntityType::from_tag(v.value())))
        }
        match &self.txn {
            Some(txn) => {
                let t = txn
                    .open_table(REVISION_TYPE_TABLE)
                    .map_err(StorageError::from)?;
                get(&t, revision)
            }
            None => {
                let txn = self.env.read()?;
                match storage::read_table(&txn, REVISION_TYPE_TABLE)? {
                    Some(t) => get(&t, revision),
                    None => Ok(None),
                }
            }
        }
    }

    fn revisions_of(&self, id: Identifier) -> Result<Vec<Revision>> {
        fn collect<T: ReadableMultimapTable<&'static [u8], u64>>(
            t: &T,
            id: Identifier,
        ) -> Result<Vec<Revision>> {
            let mut out = Vec::new();
            for value in t.get(id.as_bytes().as_slice()).map_err(StorageError::from)? {
                out.push(value.map_err(StorageError::from)?.value());
            }
            out.sort_unstable();
            Ok(out)
        }
        match &self.txn {
            Some(txn) => {
                let t = txn
                    .open_multimap_table(UIDS_TO_REVISIONS_TABLE)
                    .map_err(StorageError::from)?;
                collect(&t, id)
            }
            None => {
                let txn = self.env.read()?;
                match storage::read_multimap_table(&txn, UIDS_TO_REVISIONS_TABLE)? {
                    Some(t) => collect(&t, id),
                    None => Ok(Vec::new()),
                }
            }
        }
    }

    /// The latest revision recorded for an identifier.
    pub fn latest_revision(&self, id: Identifier) -> Result<Option<Revision>> {
        Ok(self.revisions_of(id)?.into_iter().next_back())
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Writes a new entity at revision `maxRevision + 1`.
    ///
    /// # Errors
    ///
    /// [`SinkError::InvalidId`] for a nil identifier; storage errors abort
    /// the caller's transaction.
    #[instrument(skip(self, entity), fields(%ty, id = %entity.id))]
    pub fn add(
        &mut self,
        ty: EntityType,
        mut entity: Entity,
        replay_to_source: bool,
    ) -> Result<Revision> {
        if entity.id.is_nil() {
            return Err(SinkError::invalid_id("can't write entity with a nil identifier"));
        }
        let definition = self.registry.definition(ty);
        definition.validate(&entity)?;
        let registry = Arc::clone(&self.registry);
        registry.strip_index_properties(ty, &mut entity);

        let revision = self.max_revision()? + 1;
        entity.metadata = Metadata {
            revision,
            operation: Operation::Creation,
            replay_to_source,
            modified_properties: None,
        };

        let txn = self.write_txn()?;
        definition.index_added(&entity, &IndexTransaction::new(txn))?;

        let buffer = entity::encode(&entity)?;
        {
            let mut main = txn
                .open_table(schema::main_table(ty))
                .map_err(StorageError::from)?;
            main.insert(revision, buffer.as_slice())
                .map_err(StorageError::from)?;
        }
        self.bump_revision(txn, revision)?;
        self.record_revision(txn, revision, entity.id, ty)?;
        trace!(revision, "Wrote entity");
        Ok(revision)
    }

    /// Applies a diff to the current version of `diff.id` and writes a new
    /// revision.
    ///
    /// `modified_properties` in the new revision's metadata is the union of
    /// the diff keys and the declared deletions.
    pub fn modify(
        &mut self,
        ty: EntityType,
        id: Identifier,
        diff: &Properties,
        deletions: &[String],
        replay_to_source: bool,
    ) -> Result<Revision> {
        let current = self
            .read_latest(ty, id)?
            .filter(|e| !e.is_tombstone())
            .ok_or_else(|| NotFoundError::entity(ty, id))?;
        let mut new_entity = current.clone();
        let touched = new_entity.apply_diff(diff, deletions);
        self.modify_entity(ty, &current, new_entity, touched, replay_to_source)
    }

    /// Writes a new revision given the known current entity, skipping the
    /// read. `modified_properties` records which properties changed (the
    /// preprocessor-touched set included).
    #[instrument(skip(self, current, new_entity, modified_properties), fields(%ty, id = %current.id))]
    pub fn modify_entity(
        &mut self,
        ty: EntityType,
        current: &Entity,
        mut new_entity: Entity,
        modified_properties: Vec<String>,
        replay_to_source: bool,
    ) -> Result<Revision> {
        let definition = self.registry.definition(ty);
        definition.validate(&new_entity)?;
        let registry = Arc::clone(&self.registry);
        registry.strip_index_properties(ty, &mut new_entity);
        let mut old = current.clone();
        registry.strip_index_properties(ty, &mut old);

        let revision = self.max_revision()? + 1;
        new_entity.metadata = Metadata {
            revision,
            operation: Operation::Modification,
            replay_to_source,
            modified_properties: Some(modified_properties),
        };

        let txn = self.write_txn()?;
        definition.index_modified(&old, &new_entity, &IndexTransaction::new(txn))?;

        let buffer = entity::encode(&new_entity)?;
        {
            let mut main = txn
                .open_table(schema::main_table(ty))
                .map_err(StorageError::from)?;
            main.insert(revision, buffer.as_slice())
                .map_err(StorageError::from)?;
        }
        self.bump_revision(txn, revision)?;
        self.record_revision(txn, revision, new_entity.id, ty)?;
        trace!(revision, "Wrote modified entity");
        Ok(revision)
    }

    /// Writes a tombstone revision for the entity.
    ///
    /// # Errors
    ///
    /// [`NotFoundError::Entity`] if the id was never written,
    /// [`SinkError::AlreadyRemoved`] if the latest revision is already a
    /// tombstone.
    #[instrument(skip(self, current), fields(%ty, id = %current.id))]
    pub fn remove(
        &mut self,
        ty: EntityType,
        current: &Entity,
        replay_to_source: bool,
    ) -> Result<Revision> {
        let id = current.id;
        match self.read_latest(ty, id)? {
            None => return Err(NotFoundError::entity(ty, id).into()),
            Some(latest) if latest.is_tombstone() => {
                return Err(SinkError::AlreadyRemoved { ty, id });
            }
            Some(_) => {}
        }

        let definition = self.registry.definition(ty);
        let revision = self.max_revision()? + 1;
        let metadata = Metadata {
            revision,
            operation: Operation::Removal,
            replay_to_source,
            modified_properties: None,
        };

        let txn = self.write_txn()?;
        definition.index_removed(current, &IndexTransaction::new(txn))?;

        let buffer = entity::encode_entity(&metadata, &Properties::new(), &Properties::new())?;
        {
            let mut main = txn
                .open_table(schema::main_table(ty))
                .map_err(StorageError::from)?;
            main.insert(revision, buffer.as_slice())
                .map_err(StorageError::from)?;
        }
        self.bump_revision(txn, revision)?;
        self.record_revision(txn, revision, id, ty)?;
        debug!(revision, "Removed entity");
        Ok(revision)
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    fn cleanup_revision(&self, txn: &WriteTransaction, revision: Revision) -> Result<()> {
        let (id, ty) = {
            let revisions = txn.open_table(REVISIONS_TABLE).map_err(StorageError::from)?;
            let types = txn
                .open_table(REVISION_TYPE_TABLE)
                .map_err(StorageError::from)?;
            let id = revisions
                .get(revision)
                .map_err(StorageError::from)?
                .and_then(|v| Identifier::from_slice(v.value()));
            let ty = types
                .get(revision)
                .map_err(StorageError::from)?
                .and_then(|v| EntityType::from_tag(v.value()));
            match (id, ty) {
                (Some(id), Some(ty)) => (id, ty),
                // Already dropped by an earlier pass.
                _ => return Ok(()),
            }
        };

        // Drop every older revision of this entity.
        let superseded: Vec<Revision> = {
            let uids = txn
                .open_multimap_table(UIDS_TO_REVISIONS_TABLE)
                .map_err(StorageError::from)?;
            let mut revs = Vec::new();
            for value in uids.get(id.as_bytes().as_slice()).map_err(StorageError::from)? {
                let r = value.map_err(StorageError::from)?.value();
                if r < revision {
                    revs.push(r);
                }
            }
            revs
        };
        for r in &superseded {
            self.drop_revision(txn, ty, id, *r)?;
        }

        // Drop the revision itself if it is a tombstone.
        let is_tombstone = {
            let main = txn
                .open_table(schema::main_table(ty))
                .map_err(StorageError::from)?;
            let result = match main.get(revision).map_err(StorageError::from)? {
                Some(buffer) => match entity::decode_metadata(buffer.value()) {
                    Ok(metadata) => metadata.operation == Operation::Removal,
                    Err(e) => {
                        warn!(revision, error = %e, "Read invalid buffer during cleanup");
                        false
                    }
                },
                None => false,
            };
            result
        };
        if is_tombstone {
            self.drop_revision(txn, ty, id, revision)?;
        }
        Ok(())
    }

    fn drop_revision(
        &self,
        txn: &WriteTransaction,
        ty: EntityType,
        id: Identifier,
        revision: Revision,
    ) -> Result<()> {
        {
            let mut main = txn
                .open_table(schema::main_table(ty))
                .map_err(StorageError::from)?;
            main.remove(revision).map_err(StorageError::from)?;
        }
        {
            let mut revisions = txn.open_table(REVISIONS_TABLE).map_err(StorageError::from)?;
            revisions.remove(revision).map_err(StorageError::from)?;
        }
        {
            let mut types = txn
                .open_table(REVISION_TYPE_TABLE)
                .map_err(StorageError::from)?;
            types.remove(revision).map_err(StorageError::from)?;
        }
        {
            let mut uids = txn
                .open_multimap_table(UIDS_TO_REVISIONS_TABLE)
                .map_err(StorageError::from)?;
            uids.remove(id.as_bytes().as_slice(), revision)
                .map_err(StorageError::from)?;
        }
        Ok(())
    }

    /// Drops superseded and tombstone revisions up to `revision` and
    /// advances `cleanedUpRevision`. Opens an implicit transaction when none
    /// is active. Returns whether anything was cleaned.
    #[instrument(skip(self))]
    pub fn cleanup_revisions(&mut self, revision: Revision) -> Result<bool> {
        let implicit = self.txn.is_none();
        if implicit {
            self.start_transaction()?;
        }
        let result = (|| {
            let txn = self.write_txn()?;
            let first = {
                let meta = txn.open_table(DEFAULT_TABLE).map_err(StorageError::from)?;
                storage::meta_value(&meta, META_CLEANED_UP_REVISION)?.unwrap_or(0) + 1
            };
            if first > revision {
                return Ok(false);
            }
            debug!(from = first, to = revision, "Cleaning up revisions");
            for rev in first..=revision {
                self.cleanup_revision(txn, rev)?;
            }
            let mut meta = txn.open_table(DEFAULT_TABLE).map_err(StorageError::from)?;
            meta.insert(META_CLEANED_UP_REVISION, revision)
                .map_err(StorageError::from)?;
            Ok(true)
        })();
        match (&result, implicit) {
            (Ok(_), true) => self.commit_transaction()?,
            (Err(_), true) => self.abort_transaction(),
            _ => {}
        }
        result
    }

    // ========================================================================
    // Reads
    // ========================================================================

    fn read_buffer(&self, ty: EntityType, revision: Revision) -> Result<Option<Vec<u8>>> {
        fn get<T: ReadableTable<u64, &'static [u8]>>(
            t: &T,
            revision: u64,
        ) -> Result<Option<Vec<u8>>> {
            Ok(t.get(revision)
                .map_err(StorageError::from)?
                .map(|v| v.value().to_vec()))
        }
        match &self.txn {
            Some(txn) => {
                let t = txn
                    .open_table(schema::main_table(ty))
                    .map_err(StorageError::from)?;
                get(&t, revision)
            }
            None => {
                let txn = self.env.read()?;
                match storage::read_table(&txn, schema::main_table(ty))? {
                    Some(t) => get(&t, revision),
                    None => Ok(None),
                }
            }
        }
    }

    fn decode_with_index_properties(
        &self,
        ty: EntityType,
        id: Identifier,
        buffer: &[u8],
    ) -> Result<Entity> {
        let mut entity = entity::decode_entity(id, buffer)?;
        if entity.is_tombstone() {
            return Ok(entity);
        }
        for prop in self.registry.definition(ty).index_properties() {
            let Some(source) = entity.property(prop.source_property).and_then(|v| v.as_bytes())
            else {
                continue;
            };
            let source = source.to_vec();
            let table = schema::secondary_index_name(ty, prop.left, prop.right);
            let values = self.index_table_lookup(&table, &source)?;
            if let Some(first) = values.into_iter().next() {
                entity
                    .local
                    .insert(prop.name.to_string(), PropertyValue::Bytes(first));
            }
        }
        Ok(entity)
    }

    /// Reads the entity at its latest revision, tombstone included.
    pub fn read_latest(&self, ty: EntityType, id: Identifier) -> Result<Option<Entity>> {
        let Some(revision) = self.latest_revision(id)? else {
            return Ok(None);
        };
        let Some(buffer) = self.read_buffer(ty, revision)? else {
            return Ok(None);
        };
        Ok(Some(self.decode_with_index_properties(ty, id, &buffer)?))
    }

    /// Reads exactly the revision named by `key`.
    pub fn read_entity(&self, ty: EntityType, key: Key) -> Result<Entity> {
        let buffer = self
            .read_buffer(ty, key.revision)?
            .ok_or(NotFoundError::Revision(key.revision))?;
        self.decode_with_index_properties(ty, key.id, &buffer)
    }

    /// Reads the latest revision strictly below `revision`.
    pub fn read_previous(&self, ty: EntityType, id: Identifier, revision: Revision) -> Result<Entity> {
        let previous = self
            .revisions_of(id)?
            .into_iter()
            .filter(|r| *r < revision)
            .next_back()
            .ok_or(NotFoundError::PreviousRevision { id, revision })?;
        self.read_entity(ty, Key::new(id, previous))
    }

    /// Iterates the identifiers of all live entities of a type, in
    /// unspecified order.
    pub fn read_all_uids(&self, ty: EntityType) -> Result<Vec<Identifier>> {
        fn collect<U, M>(uids: &U, main: &M, ty_match: impl Fn(u64) -> Result<bool>) -> Result<Vec<(Identifier, u64)>>
        where
            U: ReadableMultimapTable<&'static [u8], u64>,
            M: ReadableTable<u64, &'static [u8]>,
        {
            let mut out = Vec::new();
            for entry in uids.iter().map_err(StorageError::from)? {
                let (key, values) = entry.map_err(StorageError::from)?;
                let Some(id) = Identifier::from_slice(key.value()) else {
                    continue;
                };
                let mut latest = None;
                for value in values {
                    let r = value.map_err(StorageError::from)?.value();
                    latest = Some(latest.map_or(r, |l: u64| l.max(r)));
                }
                let Some(latest) = latest else { continue };
                if !ty_match(latest)? {
                    continue;
                }
                if let Some(buffer) = main.get(latest).map_err(StorageError::from)? {
                    let metadata = entity::decode_metadata(buffer.value())?;
                    if metadata.operation != Operation::Removal {
                        out.push((id, latest));
                    }
                }
            }
            Ok(out)
        }

        let pairs = match &self.txn {
            Some(txn) => {
                let uids = txn
                    .open_multimap_table(UIDS_TO_REVISIONS_TABLE)
                    .map_err(StorageError::from)?;
                let main = txn
                    .open_table(schema::main_table(ty))
                    .map_err(StorageError::from)?;
                let types = txn
                    .open_table(REVISION_TYPE_TABLE)
                    .map_err(StorageError::from)?;
                collect(&uids, &main, |rev| {
                    Ok(types
                        .get(rev)
                        .map_err(StorageError::from)?
                        .is_some_and(|v| v.value() == ty.tag()))
                })?
            }
            None => {
                let txn = self.env.read()?;
                let Some(uids) = storage::read_multimap_table(&txn, UIDS_TO_REVISIONS_TABLE)?
                else {
                    return Ok(Vec::new());
                };
                let Some(main) = storage::read_table(&txn, schema::main_table(ty))? else {
                    return Ok(Vec::new());
                };
                let Some(types) = storage::read_table(&txn, REVISION_TYPE_TABLE)? else {
                    return Ok(Vec::new());
                };
                collect(&uids, &main, |rev| {
                    Ok(types
                        .get(rev)
                        .map_err(StorageError::from)?
                        .is_some_and(|v| v.value() == ty.tag()))
                })?
            }
        };
        Ok(pairs.into_iter().map(|(id, _)| id).collect())
    }

    /// Reads all live entities of a type at their latest revision.
    pub fn read_all(&self, ty: EntityType) -> Result<Vec<Entity>> {
        let mut out = Vec::new();
        for id in self.read_all_uids(ty)? {
            if let Some(entity) = self.read_latest(ty, id)? {
                if !entity.is_tombstone() {
                    out.push(entity);
                }
            }
        }
        Ok(out)
    }

    /// Emits the keys of all revisions strictly greater than `since` of the
    /// given type, in revision order.
    pub fn read_revisions(&self, since: Revision, ty: EntityType) -> Result<Vec<Key>> {
        let top = self.max_revision()?;
        let mut out = Vec::new();
        for revision in (since + 1)..=top {
            let Some(entry_ty) = self.type_from_revision(revision)? else {
                // Cleaned up concurrently with iteration.
                continue;
            };
            if entry_ty != ty {
                continue;
            }
            match self.uid_from_revision(revision)? {
                Some(id) => out.push(Key::new(id, revision)),
                None => error!(revision, "Revision has a type but no identifier"),
            }
        }
        Ok(out)
    }

    /// True iff the latest revision of the id exists and is not a tombstone.
    pub fn exists(&self, ty: EntityType, id: Identifier) -> Result<bool> {
        match self.latest_revision(id)? {
            None => Ok(false),
            Some(revision) => match self.read_buffer(ty, revision)? {
                None => Ok(false),
                Some(buffer) => Ok(entity::decode_metadata(&buffer)?.operation != Operation::Removal),
            },
        }
    }

    /// True iff any revision of the id exists, tombstones included.
    pub fn contains(&self, _ty: EntityType, id: Identifier) -> Result<bool> {
        Ok(!self.revisions_of(id)?.is_empty())
    }

    // ========================================================================
    // Index lookups
    // ========================================================================

    fn index_table_lookup(&self, table: &str, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        fn collect<T: ReadableMultimapTable<&'static [u8], &'static [u8]>>(
            t: &T,
            key: &[u8],
        ) -> Result<Vec<Vec<u8>>> {
            let mut out = Vec::new();
            for value in t.get(key).map_err(StorageError::from)? {
                out.push(value.map_err(StorageError::from)?.value().to_vec());
            }
            Ok(out)
        }
        match &self.txn {
            Some(txn) => {
                let t = txn
                    .open_multimap_table(schema::index_table(table))
                    .map_err(StorageError::from)?;
                collect(&t, key)
            }
            None => {
                let txn = self.env.read()?;
                match storage::read_multimap_table(&txn, schema::index_table(table))? {
                    Some(t) => collect(&t, key),
                    None => Ok(Vec::new()),
                }
            }
        }
    }

    fn index_prefix_scan(&self, table: &str, prefix: &[u8]) -> Result<Vec<Identifier>> {
        fn collect<T: ReadableMultimapTable<&'static [u8], &'static [u8]>>(
            t: &T,
            prefix: &[u8],
        ) -> Result<Vec<Identifier>> {
            let mut out = Vec::new();
            for entry in t.range(prefix..).map_err(StorageError::from)? {
                let (key, values) = entry.map_err(StorageError::from)?;
                if !key.value().starts_with(prefix) {
                    break;
                }
                for value in values {
                    if let Some(id) = Identifier::from_slice(value.map_err(StorageError::from)?.value()) {
                        out.push(id);
                    }
                }
            }
            Ok(out)
        }
        match &self.txn {
            Some(txn) => {
                let t = txn
                    .open_multimap_table(schema::index_table(table))
                    .map_err(StorageError::from)?;
                collect(&t, prefix)
            }
            None => {
                let txn = self.env.read()?;
                match storage::read_multimap_table(&txn, schema::index_table(table))? {
                    Some(t) => collect(&t, prefix),
                    None => Ok(Vec::new()),
                }
            }
        }
    }

    /// Resolves the ids matching `property == value` through the declared
    /// indexes: a value index directly, or a secondary index chain (e.g.
    /// threadId → messageId → ids). `filter` restricts fulltext lookups to
    /// the candidate set.
    pub fn index_lookup_property(
        &self,
        ty: EntityType,
        property: &str,
        value: &PropertyValue,
        filter: &[Identifier],
    ) -> Result<Vec<Identifier>> {
        if property == "fulltext" {
            return self.fulltext_lookup(ty, value.as_text().unwrap_or_default(), filter);
        }
        let definition = self.registry.definition(ty);
        if let Some(table) = definition.value_index(property) {
            let key = schema::index_value_bytes(value);
            let ids = self
                .index_table_lookup(&table, &key)?
                .into_iter()
                .filter_map(|v| Identifier::from_slice(&v))
                .collect();
            return Ok(ids);
        }
        if let Some((table, right)) = definition.secondary_index(property) {
            let key = schema::index_value_bytes(value);
            let mut out = Vec::new();
            for right_value in self.index_table_lookup(&table, &key)? {
                let resolved = self.index_lookup_property(
                    ty,
                    right,
                    &PropertyValue::Bytes(right_value),
                    filter,
                )?;
                out.extend(resolved);
            }
            out.sort_unstable();
            out.dedup();
            return Ok(out);
        }
        Ok(Vec::new())
    }

    /// Intersection-friendly fulltext lookup: every whitespace-separated
    /// term must match.
    pub fn fulltext_lookup(
        &self,
        ty: EntityType,
        text: &str,
        filter: &[Identifier],
    ) -> Result<Vec<Identifier>> {
        let table = format!("{}.index.fulltext", ty.name());
        let mut result: Option<Vec<Identifier>> = None;
        for term in crate::registry::fulltext_terms(text) {
            let ids: Vec<Identifier> = self
                .index_table_lookup(&table, term.as_bytes())?
                .into_iter()
                .filter_map(|v| Identifier::from_slice(&v))
                .collect();
            result = Some(match result {
                None => ids,
                Some(prev) => prev.into_iter().filter(|id| ids.contains(id)).collect(),
            });
        }
        let mut ids = result.unwrap_or_default();
        if !filter.is_empty() {
            ids.retain(|id| filter.contains(id));
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Builds the initial id set of a query from the declared indexes and
    /// reports which filters and sorting the lookup already satisfied.
    pub fn index_lookup(&self, ty: EntityType, query: &Query) -> Result<IndexLookup> {
        let definition = self.registry.definition(ty);
        let sort = query.sort.as_deref();

        // A sorted index that covers both an equality filter and the
        // requested sort wins.
        if let Some(sort_property) = sort {
            for (property, comparator) in &query.base_filters {
                let values = match comparator {
                    Comparator::Equals(v) => vec![v.clone()],
                    Comparator::In(vs) => vs.clone(),
                    _ => continue,
                };
                if let Some((table, s)) = definition.sorted_index(property, Some(sort_property)) {
                    if s != sort_property {
                        continue;
                    }
                    let mut ids = Vec::new();
                    for value in &values {
                        let prefix = schema::index_value_bytes(value);
                        ids.extend(self.index_prefix_scan(&table, &prefix)?);
                    }
                    return Ok(IndexLookup {
                        ids,
                        applied_filters: vec![property.clone()],
                        applied_sorting: Some(sort_property.to_string()),
                    });
                }
            }
            // No filter: a whole-type sorted index may still provide order.
            if query.base_filters.is_empty() {
                if let Some((table, s)) = definition.sorted_index("", Some(sort_property)) {
                    if s == sort_property {
                        let ids = self.index_prefix_scan(&table, &[])?;
                        return Ok(IndexLookup {
                            ids,
                            applied_filters: Vec::new(),
                            applied_sorting: Some(sort_property.to_string()),
                        });
                    }
                }
            }
        }

        // Fall back to the first filter a value index or the fulltext index
        // can answer.
        for (property, comparator) in &query.base_filters {
            match comparator {
                Comparator::Equals(value) => {
                    let ids = self.index_lookup_property(ty, property, value, &[])?;
                    if definition.value_index(property).is_some()
                        || definition.secondary_index(property).is_some()
                    {
                        return Ok(IndexLookup {
                            ids,
                            applied_filters: vec![property.clone()],
                            applied_sorting: None,
                        });
                    }
                }
                Comparator::In(values) => {
                    if definition.value_index(property).is_some() {
                        let mut ids = Vec::new();
                        for value in values {
                            ids.extend(self.index_lookup_property(ty, property, value, &[])?);
                        }
                        ids.sort_unstable();
                        ids.dedup();
                        return Ok(IndexLookup {
                            ids,
                            applied_filters: vec![property.clone()],
                            applied_sorting: None,
                        });
                    }
                }
                Comparator::Fulltext(term) => {
                    let ids = self.fulltext_lookup(ty, term, &[])?;
                    return Ok(IndexLookup {
                        ids,
                        // The initial set is exactly the matches; incremental
                        // runs re-check the filter per id.
                        applied_filters: vec![property.clone()],
                        applied_sorting: None,
                    });
                }
                _ => {}
            }
        }

        Ok(IndexLookup::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &std::path::Path) -> EntityStore {
        let env = Arc::new(Environment::open(dir.join("instance1")).unwrap());
        let registry = Arc::new(TypeRegistry::standard());
        let mut store = EntityStore::new(env, registry);
        store.initialize().unwrap();
        store
    }

    fn mail(subject: &str) -> Entity {
        let mut e = Entity::new(Identifier::new());
        e.set_property("subject", subject);
        e.set_property("messageId", PropertyValue::Bytes(subject.as_bytes().to_vec()));
        e.set_property("date", PropertyValue::DateTime(1_000));
        e
    }

    #[test]
    fn add_and_read_latest() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let entity = mail("hello");
        let id = entity.id;

        store.start_transaction().unwrap();
        let rev = store.add(EntityType::Mail, entity, true).unwrap();
        store.commit_transaction().unwrap();

        assert_eq!(rev, 1);
        assert_eq!(store.max_revision().unwrap(), 1);
        let read = store.read_latest(EntityType::Mail, id).unwrap().unwrap();
        assert_eq!(read.property("subject").unwrap().as_text(), Some("hello"));
        assert_eq!(read.metadata.revision, 1);
        assert!(read.metadata.replay_to_source);
        assert!(store.exists(EntityType::Mail, id).unwrap());
    }

    #[test]
    fn add_rejects_nil_identifier() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store.start_transaction().unwrap();
        let err = store
            .add(EntityType::Mail, Entity::new(Identifier::nil()), true)
            .unwrap_err();
        assert!(matches!(err, SinkError::InvalidId(_)));
        store.abort_transaction();
    }

    #[test]
    fn modify_merges_diff_and_records_modified_properties() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let entity = mail("hello");
        let id = entity.id;

        store.start_transaction().unwrap();
        store.add(EntityType::Mail, entity, true).unwrap();
        let mut diff = Properties::new();
        diff.insert("subject".into(), PropertyValue::Text("hi".into()));
        let rev = store
            .modify(EntityType::Mail, id, &diff, &["date".to_string()], true)
            .unwrap();
        store.commit_transaction().unwrap();

        assert_eq!(rev, 2);
        let read = store.read_latest(EntityType::Mail, id).unwrap().unwrap();
        assert_eq!(read.property("subject").unwrap().as_text(), Some("hi"));
        assert_eq!(read.property("date"), None);
        let modified = read.metadata.modified_properties.unwrap();
        assert!(modified.contains(&"subject".to_string()));
        assert!(modified.contains(&"date".to_string()));
    }

    #[test]
    fn modify_unknown_id_is_not_found() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store.start_transaction().unwrap();
        let err = store
            .modify(EntityType::Mail, Identifier::new(), &Properties::new(), &[], true)
            .unwrap_err();
        assert!(err.is_not_found());
        store.abort_transaction();
        assert_eq!(store.max_revision().unwrap(), 0);
    }

    #[test]
    fn remove_writes_tombstone_and_double_remove_fails() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let entity = mail("bye");
        let id = entity.id;

        store.start_transaction().unwrap();
        store.add(EntityType::Mail, entity.clone(), true).unwrap();
        store.remove(EntityType::Mail, &entity, true).unwrap();
        let err = store.remove(EntityType::Mail, &entity, true).unwrap_err();
        assert!(err.is_already_removed());
        store.commit_transaction().unwrap();

        assert!(!store.exists(EntityType::Mail, id).unwrap());
        assert!(store.contains(EntityType::Mail, id).unwrap());
        let latest = store.read_latest(EntityType::Mail, id).unwrap().unwrap();
        assert!(latest.is_tombstone());
        assert!(latest.local.is_empty());
    }

    #[test]
    fn read_previous_returns_older_revision() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let entity = mail("v1");
        let id = entity.id;

        store.start_transaction().unwrap();
        store.add(EntityType::Mail, entity, true).unwrap();
        let mut diff = Properties::new();
        diff.insert("subject".into(), PropertyValue::Text("v2".into()));
        store.modify(EntityType::Mail, id, &diff, &[], true).unwrap();
        store.commit_transaction().unwrap();

        let previous = store.read_previous(EntityType::Mail, id, 2).unwrap();
        assert_eq!(previous.property("subject").unwrap().as_text(), Some("v1"));
        assert!(store.read_previous(EntityType::Mail, id, 1).is_err());
    }

    #[test]
    fn cleanup_drops_superseded_and_tombstones() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let entity = mail("hello");
        let id = entity.id;

        store.start_transaction().unwrap();
        store.add(EntityType::Mail, entity.clone(), true).unwrap();
        let mut diff = Properties::new();
        diff.insert("subject".into(), PropertyValue::Text("hi".into()));
        store.modify(EntityType::Mail, id, &diff, &[], true).unwrap();
        store.remove(EntityType::Mail, &entity, true).unwrap();
        store.commit_transaction().unwrap();

        assert_eq!(store.max_revision().unwrap(), 3);
        store.cleanup_revisions(3).unwrap();

        assert_eq!(store.cleaned_up_revision().unwrap(), 3);
        assert!(!store.contains(EntityType::Mail, id).unwrap());
        assert!(store.read_revisions(0, EntityType::Mail).unwrap().is_empty());
    }

    #[test]
    fn cleanup_keeps_live_entities() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let entity = mail("keep");
        let id = entity.id;

        store.start_transaction().unwrap();
        store.add(EntityType::Mail, entity, true).unwrap();
        let mut diff = Properties::new();
        diff.insert("subject".into(), PropertyValue::Text("kept".into()));
        store.modify(EntityType::Mail, id, &diff, &[], true).unwrap();
        store.commit_transaction().unwrap();

        store.cleanup_revisions(2).unwrap();

        // Only the latest revision survives.
        assert_eq!(store.revisions_of(id).unwrap(), vec![2]);
        let read = store.read_latest(EntityType::Mail, id).unwrap().unwrap();
        assert_eq!(read.property("subject").unwrap().as_text(), Some("kept"));
    }

    #[test]
    fn read_revisions_filters_by_type_and_base() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        store.start_transaction().unwrap();
        store.add(EntityType::Mail, mail("one"), true).unwrap();
        let mut folder = Entity::new(Identifier::new());
        folder.set_property("name", "inbox");
        store.add(EntityType::Folder, folder, true).unwrap();
        store.add(EntityType::Mail, mail("two"), true).unwrap();
        store.commit_transaction().unwrap();

        let mail_keys = store.read_revisions(0, EntityType::Mail).unwrap();
        assert_eq!(
            mail_keys.iter().map(|k| k.revision).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(store.read_revisions(1, EntityType::Mail).unwrap().len(), 1);
        assert_eq!(store.read_revisions(3, EntityType::Mail).unwrap().len(), 0);
    }

    #[test]
    fn value_index_lookup_finds_by_message_id() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let entity = mail("indexed");
        let id = entity.id;

        store.start_transaction().unwrap();
        store.add(EntityType::Mail, entity, true).unwrap();
        store.commit_transaction().unwrap();

        let ids = store
            .index_lookup_property(
                EntityType::Mail,
                "messageId",
                &PropertyValue::Bytes(b"indexed".to_vec()),
                &[],
            )
            .unwrap();
        assert_eq!(ids, vec![id]);
    }

    #[test]
    fn thread_id_is_resolved_at_read() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let entity = mail("threaded");
        let id = entity.id;

        store.start_transaction().unwrap();
        store.add(EntityType::Mail, entity, true).unwrap();
        store.commit_transaction().unwrap();

        let read = store.read_latest(EntityType::Mail, id).unwrap().unwrap();
        let thread = read.property("threadId").unwrap();
        assert!(matches!(thread, PropertyValue::Bytes(b) if b.len() == 16));
    }

    #[test]
    fn sorted_index_returns_date_order() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let folder_id = Identifier::new();

        store.start_transaction().unwrap();
        for (subject, date) in [("b", 200), ("a", 100), ("c", 300)] {
            let mut e = mail(subject);
            e.set_property("date", PropertyValue::DateTime(date));
            e.set_property("folder", folder_id);
            store.add(EntityType::Mail, e, true).unwrap();
        }
        store.commit_transaction().unwrap();

        let mut query = Query::for_type(EntityType::Mail);
        query
            .base_filters
            .insert("folder".into(), Comparator::Equals(folder_id.into()));
        query.sort = Some("date".into());
        let lookup = store.index_lookup(EntityType::Mail, &query).unwrap();

        assert_eq!(lookup.applied_sorting.as_deref(), Some("date"));
        assert_eq!(lookup.applied_filters, vec!["folder".to_string()]);
        let subjects: Vec<String> = lookup
            .ids
            .iter()
            .map(|id| {
                store
                    .read_latest(EntityType::Mail, *id)
                    .unwrap()
                    .unwrap()
                    .property("subject")
                    .unwrap()
                    .as_text()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(subjects, vec!["a", "b", "c"]);
    }

    #[test]
    fn fulltext_lookup_intersects_terms() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        let a = mail("quarterly budget review");
        let b = mail("budget overrun");
        let a_id = a.id;

        store.start_transaction().unwrap();
        store.add(EntityType::Mail, a, true).unwrap();
        store.add(EntityType::Mail, b, true).unwrap();
        store.commit_transaction().unwrap();

        let both = store
            .fulltext_lookup(EntityType::Mail, "budget", &[])
            .unwrap();
        assert_eq!(both.len(), 2);
        let one = store
            .fulltext_lookup(EntityType::Mail, "quarterly budget", &[])
            .unwrap();
        assert_eq!(one, vec![a_id]);
    }
}
