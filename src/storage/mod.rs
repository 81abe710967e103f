//! Storage layer: on-disk environments and access helpers.
//!
//! Each resource instance owns several sibling environments on disk (entity
//! store, the two command queues, change-replay progress, synchronizer
//! scratch). An [`Environment`] wraps one [redb](https://docs.rs/redb)
//! database file; redb gives us single-writer transactions with
//! snapshot-isolated readers and crash recovery, which is exactly the
//! discipline the engine's single-writer / many-readers model needs.

pub mod schema;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use redb::{
    Database, MultimapTableDefinition, ReadOnlyMultimapTable, ReadOnlyTable, ReadTransaction,
    ReadableTable, TableDefinition, WriteTransaction,
};
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError};

/// One on-disk environment.
///
/// Holds the redb database handle. Only one process may have an environment
/// open for writing; within the process, one write transaction may exist at
/// a time while readers observe a consistent snapshot.
#[derive(Debug)]
pub struct Environment {
    db: Database,
    path: PathBuf,
}

impl Environment {
    /// Opens or creates the environment at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another writer holds the file,
    /// [`StorageError::Env`] for any other open failure.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let existed = path.exists();
        let db = Database::create(path).map_err(|e| {
            let msg = e.to_string();
            if msg.contains("lock") || msg.contains("already open") {
                StorageError::Locked
            } else {
                StorageError::Env(msg)
            }
        })?;
        debug!(path = %path.display(), existed, "Opened environment");
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    /// Begins a snapshot-isolated read transaction.
    pub fn read(&self) -> Result<ReadTransaction> {
        Ok(self.db.begin_read().map_err(StorageError::from)?)
    }

    /// Begins the single write transaction.
    pub fn write(&self) -> Result<WriteTransaction> {
        Ok(self.db.begin_write().map_err(StorageError::from)?)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Cache of open environments for one resource instance.
///
/// Environments are opened lazily and shared; [`Environments::clear`] drops
/// every cached handle, which must happen before the files are removed from
/// disk.
#[derive(Debug, Default)]
pub struct Environments {
    open: Mutex<HashMap<PathBuf, Arc<Environment>>>,
}

impl Environments {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the environment at `path`, opening it on first use.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<Arc<Environment>> {
        let path = path.as_ref().to_path_buf();
        let mut open = self.open.lock().expect("environment cache poisoned");
        if let Some(env) = open.get(&path) {
            return Ok(Arc::clone(env));
        }
        let env = Arc::new(Environment::open(&path)?);
        open.insert(path, Arc::clone(&env));
        Ok(env)
    }

    /// Drops all cached environment handles.
    ///
    /// Outstanding [`Arc`] clones keep their environment alive; the caller
    /// is responsible for releasing those before deleting files.
    pub fn clear(&self) {
        let mut open = self.open.lock().expect("environment cache poisoned");
        let count = open.len();
        open.clear();
        debug!(count, "Cleared environment cache");
    }

    /// Deletes the given environment files from disk.
    ///
    /// The cache is cleared first so no handle in this registry keeps a
    /// deleted file open.
    pub fn remove_from_disk(&self, paths: &[PathBuf]) -> Result<()> {
        self.clear();
        for path in paths {
            match std::fs::remove_file(path) {
                Ok(()) => info!(path = %path.display(), "Removed environment"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove environment");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

/// Opens a table for reading, treating a missing table as empty.
pub fn read_table<K, V>(
    txn: &ReadTransaction,
    def: TableDefinition<'_, K, V>,
) -> Result<Option<ReadOnlyTable<K, V>>>
where
    K: redb::Key + 'static,
    V: redb::Value + 'static,
{
    match txn.open_table(def) {
        Ok(table) => Ok(Some(table)),
        Err(redb::TableError::TableDoesNotExist(_)) => Ok(None),
        Err(e) => Err(StorageError::from(e).into()),
    }
}

/// Opens a multimap table for reading, treating a missing table as empty.
pub fn read_multimap_table<K, V>(
    txn: &ReadTransaction,
    def: MultimapTableDefinition<'_, K, V>,
) -> Result<Option<ReadOnlyMultimapTable<K, V>>>
where
    K: redb::Key + 'static,
    V: redb::Key + 'static,
{
    match txn.open_multimap_table(def) {
        Ok(table) => Ok(Some(table)),
        Err(redb::TableError::TableDoesNotExist(_)) => Ok(None),
        Err(e) => Err(StorageError::from(e).into()),
    }
}

/// Reads a flag from an open `default` table.
pub fn meta_value<T>(table: &T, key: &str) -> Result<Option<u64>>
where
    T: ReadableTable<&'static str, u64>,
{
    Ok(table.get(key).map_err(StorageError::from)?.map(|v| v.value()))
}

/// Reads the max revision recorded in the environment, 0 if none.
pub fn max_revision(txn: &ReadTransaction) -> Result<u64> {
    match read_table(txn, schema::DEFAULT_TABLE)? {
        Some(table) => Ok(meta_value(&table, schema::META_MAX_REVISION)?.unwrap_or(0)),
        None => Ok(0),
    }
}

/// Reads the cleaned-up revision recorded in the environment, 0 if none.
pub fn cleaned_up_revision(txn: &ReadTransaction) -> Result<u64> {
    match read_table(txn, schema::DEFAULT_TABLE)? {
        Some(table) => Ok(meta_value(&table, schema::META_CLEANED_UP_REVISION)?.unwrap_or(0)),
        None => Ok(0),
    }
}

/// Reads the database version recorded in the environment, if any.
pub fn database_version(txn: &ReadTransaction) -> Result<Option<u64>> {
    match read_table(txn, schema::DEFAULT_TABLE)? {
        Some(table) => meta_value(&table, schema::META_DATABASE_VERSION),
        None => Ok(None),
    }
}
