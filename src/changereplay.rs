//! Change replay: ordered outbound iteration over entity-store revisions.
//!
//! Replay progress is one durable value, `lastReplayedRevision`, in its own
//! environment. The engine hands out revisions strictly in order; the
//! consumer records progress after each successfully replayed revision in a
//! small separate transaction, so a crash can repeat at most the revision
//! in flight and the cursor never moves backwards.

use redb::TableDefinition;
use tracing::{debug, trace, warn};

use crate::entity::Entity;
use crate::error::{Result, StorageError};
use crate::storage::{self, Environment};
use crate::store::EntityStore;
use crate::types::{EntityType, Key, Revision};

const PROGRESS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("progress");
const LAST_REPLAYED_REVISION: &str = "lastReplayedRevision";

/// One revision due for replay.
#[derive(Clone, Debug)]
pub struct ReplayItem {
    /// Type of the entity the revision wrote.
    pub ty: EntityType,
    /// The (identifier, revision) pair.
    pub key: Key,
    /// The entity at exactly that revision.
    pub entity: Entity,
}

/// Durable outbound-replay cursor over one resource's entity environment.
pub struct ChangeReplay {
    progress: Environment,
    replay_in_progress: bool,
}

impl ChangeReplay {
    /// Opens or creates the progress environment.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self {
            progress: Environment::open(path)?,
            replay_in_progress: false,
        })
    }

    /// The revision up to which replay has completed; 0 initially.
    pub fn last_replayed_revision(&self) -> Result<Revision> {
        let txn = self.progress.read()?;
        match storage::read_table(&txn, PROGRESS_TABLE)? {
            Some(table) => Ok(storage::meta_value(&table, LAST_REPLAYED_REVISION)?.unwrap_or(0)),
            None => Ok(0),
        }
    }

    /// Durably records replay progress. The cursor never decreases.
    pub fn record_replayed_revision(&self, revision: Revision) -> Result<()> {
        if revision <= self.last_replayed_revision()? {
            return Ok(());
        }
        let txn = self.progress.write()?;
        {
            let mut table = txn.open_table(PROGRESS_TABLE).map_err(StorageError::from)?;
            table
                .insert(LAST_REPLAYED_REVISION, revision)
                .map_err(StorageError::from)?;
        }
        txn.commit().map_err(StorageError::from)?;
        trace!(revision, "Recorded replayed revision");
        Ok(())
    }

    /// True when every committed revision has been replayed.
    pub fn all_changes_replayed(&self, store: &EntityStore) -> Result<bool> {
        let top = store.max_revision()?;
        let last = self.last_replayed_revision()?;
        trace!(top, last, "All changes replayed check");
        Ok(last >= top)
    }

    /// The next revision due for replay, or `None` when the engine is idle.
    ///
    /// A revision whose bookkeeping is gone (which cleanup bounds should
    /// prevent) is logged and skipped so replay cannot wedge.
    pub fn next_revision(&self, store: &EntityStore) -> Result<Option<ReplayItem>> {
        let top = store.max_revision()?;
        loop {
            let revision = self.last_replayed_revision()? + 1;
            if revision > top {
                return Ok(None);
            }
            let ty = store.type_from_revision(revision)?;
            let id = store.uid_from_revision(revision)?;
            let (Some(ty), Some(id)) = (ty, id) else {
                warn!(revision, "Failed to look up revision for replay, skipping");
                self.record_replayed_revision(revision)?;
                continue;
            };
            let key = Key::new(id, revision);
            let entity = store.read_entity(ty, key)?;
            debug!(%key, %ty, "Replaying revision");
            return Ok(Some(ReplayItem { ty, key, entity }));
        }
    }

    /// Marks a replay pass as running; returns false if one already is.
    pub fn begin(&mut self) -> bool {
        if self.replay_in_progress {
            return false;
        }
        self.replay_in_progress = true;
        true
    }

    /// Marks the replay pass as finished.
    pub fn end(&mut self) {
        self.replay_in_progress = false;
    }

    /// True while a replay pass runs.
    pub fn in_progress(&self) -> bool {
        self.replay_in_progress
    }
}
