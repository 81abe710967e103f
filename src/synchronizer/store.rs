//! Synchronizer scratch store: the remote↔local id map and per-source
//! values (etags, ctags, request flags).
//!
//! Lives in its own environment so inbound bookkeeping commits
//! independently of the entity store. Mappings are kept in both directions;
//! type tags prefix every key so the same remote id may exist for
//! different entity types.

use redb::TableDefinition;
use tracing::trace;

use crate::error::{Result, StorageError};
use crate::storage::Environment;
use crate::types::{EntityType, Identifier};

const REMOTE_TO_LOCAL: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sink.mapping.remote");
const LOCAL_TO_REMOTE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sink.mapping.local");
const VALUES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("values");

fn remote_key(ty: EntityType, remote_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + remote_id.len());
    key.push(ty.tag());
    key.extend_from_slice(remote_id.as_bytes());
    key
}

fn local_key(ty: EntityType, id: Identifier) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(ty.tag());
    key.extend_from_slice(id.as_bytes());
    key
}

/// The synchronizer's durable scratch state.
pub struct SynchronizerStore {
    env: Environment,
}

impl SynchronizerStore {
    /// Opens or creates the scratch environment.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self {
            env: Environment::open(path)?,
        })
    }

    /// Returns the local id mapped to a remote id, allocating and recording
    /// a fresh random id when `create` is set.
    pub fn resolve_remote_id(
        &self,
        ty: EntityType,
        remote_id: &str,
        create: bool,
    ) -> Result<Option<Identifier>> {
        {
            let txn = self.env.read()?;
            if let Some(table) = crate::storage::read_table(&txn, REMOTE_TO_LOCAL)? {
                use redb::ReadableTable;
                if let Some(value) = table
                    .get(remote_key(ty, remote_id).as_slice())
                    .map_err(StorageError::from)?
                {
                    return Ok(Identifier::from_slice(value.value()));
                }
            }
        }
        if !create {
            return Ok(None);
        }
        let id = Identifier::new();
        self.record_remote_id(ty, id, remote_id)?;
        trace!(%ty, remote_id, %id, "Allocated local id for remote id");
        Ok(Some(id))
    }

    /// Returns the remote id recorded for a local id, if any.
    pub fn resolve_local_id(&self, ty: EntityType, id: Identifier) -> Result<Option<String>> {
        let txn = self.env.read()?;
        let Some(table) = crate::storage::read_table(&txn, LOCAL_TO_REMOTE)? else {
            return Ok(None);
        };
        use redb::ReadableTable;
        Ok(table
            .get(local_key(ty, id).as_slice())
            .map_err(StorageError::from)?
            .map(|v| String::from_utf8_lossy(v.value()).into_owned()))
    }

    /// Records a mapping in both directions.
    pub fn record_remote_id(&self, ty: EntityType, id: Identifier, remote_id: &str) -> Result<()> {
        let txn = self.env.write()?;
        {
            let mut remote = txn.open_table(REMOTE_TO_LOCAL).map_err(StorageError::from)?;
            remote
                .insert(remote_key(ty, remote_id).as_slice(), id.as_bytes().as_slice())
                .map_err(StorageError::from)?;
            let mut local = txn.open_table(LOCAL_TO_REMOTE).map_err(StorageError::from)?;
            local
                .insert(local_key(ty, id).as_slice(), remote_id.as_bytes())
                .map_err(StorageError::from)?;
        }
        txn.commit().map_err(StorageError::from)?;
        Ok(())
    }

    /// Replaces the remote id recorded for a local id.
    pub fn update_remote_id(&self, ty: EntityType, id: Identifier, remote_id: &str) -> Result<()> {
        if let Some(old) = self.resolve_local_id(ty, id)? {
            if old == remote_id {
                return Ok(());
            }
            self.remove_remote_id(ty, id, &old)?;
        }
        self.record_remote_id(ty, id, remote_id)
    }

    /// Drops the mapping in both directions.
    pub fn remove_remote_id(&self, ty: EntityType, id: Identifier, remote_id: &str) -> Result<()> {
        let txn = self.env.write()?;
        {
            let mut remote = txn.open_table(REMOTE_TO_LOCAL).map_err(StorageError::from)?;
            remote
                .remove(remote_key(ty, remote_id).as_slice())
                .map_err(StorageError::from)?;
            let mut local = txn.open_table(LOCAL_TO_REMOTE).map_err(StorageError::from)?;
            local
                .remove(local_key(ty, id).as_slice())
                .map_err(StorageError::from)?;
        }
        txn.commit().map_err(StorageError::from)?;
        Ok(())
    }

    /// Stores an opaque per-source value (etag, ctag, request flag).
    pub fn set_value(&self, key: &str, value: &[u8]) -> Result<()> {
        let txn = self.env.write()?;
        {
            let mut table = txn.open_table(VALUES).map_err(StorageError::from)?;
            table
                .insert(key.as_bytes(), value)
                .map_err(StorageError::from)?;
        }
        txn.commit().map_err(StorageError::from)?;
        Ok(())
    }

    /// Reads an opaque per-source value.
    pub fn value(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let txn = self.env.read()?;
        let Some(table) = crate::storage::read_table(&txn, VALUES)? else {
            return Ok(None);
        };
        use redb::ReadableTable;
        Ok(table
            .get(key.as_bytes())
            .map_err(StorageError::from)?
            .map(|v| v.value().to_vec()))
    }

    /// Deletes an opaque per-source value.
    pub fn remove_value(&self, key: &str) -> Result<()> {
        let txn = self.env.write()?;
        {
            let mut table = txn.open_table(VALUES).map_err(StorageError::from)?;
            table.remove(key.as_bytes()).map_err(StorageError::from)?;
        }
        txn.commit().map_err(StorageError::from)?;
        Ok(())
    }
}
