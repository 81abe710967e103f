//! Per-query runner: snapshots, pagination and live updates.
//!
//! A [`QueryRunner`] owns one compiled pipeline and the last revision its
//! caller has observed. [`spawn_live_query`] wraps a runner in a background
//! task that re-runs `update` whenever the resource commits a revision;
//! overlapping revision pulses coalesce because the watch channel only ever
//! holds the newest value. Dropping the result stream cancels the task on
//! its next emission.

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Result;
use crate::notifier::{event_channel, EventStream};
use crate::query::{DataStoreQuery, Query, ResultSet};
use crate::store::EntityStore;
use crate::types::Revision;

/// Drives one query across its lifetime: initial snapshot, paging, and
/// incremental updates from a base revision.
pub struct QueryRunner {
    query: Query,
    state: DataStoreQuery,
    last_revision: Revision,
}

impl QueryRunner {
    /// Compiles the query against the store.
    pub fn new(query: Query, store: &EntityStore) -> Result<Self> {
        let state = DataStoreQuery::new(&query, store)?;
        Ok(Self {
            query,
            state,
            last_revision: 0,
        })
    }

    /// Runs the initial snapshot, bounded by the query limit.
    ///
    /// The base revision for later updates is taken before execution, so a
    /// write racing the snapshot is observed again by the next update
    /// rather than lost.
    pub fn initial(&mut self, store: &EntityStore) -> Result<ResultSet> {
        self.last_revision = store.max_revision()?;
        self.state.execute_batch(store, self.query.limit)
    }

    /// Continues the initial snapshot where the previous batch stopped.
    pub fn fetch_more(&mut self, store: &EntityStore) -> Result<ResultSet> {
        self.state.execute_batch(store, self.query.limit)
    }

    /// Runs changed identifiers since the last observed revision through
    /// the pipeline. Returns an empty set when nothing changed.
    pub fn update(&mut self, store: &EntityStore) -> Result<ResultSet> {
        let top = store.max_revision()?;
        if top <= self.last_revision {
            return Ok(ResultSet::default());
        }
        let results = self.state.update(store, self.last_revision)?;
        self.last_revision = top;
        Ok(results)
    }

    /// The last revision the caller has observed through this runner.
    pub fn last_revision(&self) -> Revision {
        self.last_revision
    }
}

/// Handle to a live query task.
pub struct LiveQueryHandle {
    /// Result batches: the snapshot first, then one set per update.
    pub results: EventStream<ResultSet>,
}

/// Spawns a background task executing the query and re-running updates on
/// every revision pulse.
///
/// Must be called within a tokio runtime. The task exits when the resource
/// drops the revision sender or the caller drops the handle.
pub fn spawn_live_query(
    query: Query,
    store: EntityStore,
    mut revisions: watch::Receiver<Revision>,
) -> LiveQueryHandle {
    let (tx, rx) = event_channel();
    tokio::spawn(async move {
        let mut runner = match QueryRunner::new(query, &store) {
            Ok(runner) => runner,
            Err(e) => {
                warn!(error = %e, "Failed to compile live query");
                return;
            }
        };
        match runner.initial(&store) {
            Ok(snapshot) => {
                if !tx.send(snapshot) {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "Initial query execution failed");
                return;
            }
        }
        loop {
            if revisions.changed().await.is_err() {
                debug!("Resource gone, stopping live query");
                return;
            }
            match runner.update(&store) {
                Ok(results) => {
                    if !results.is_empty() && !tx.send(results) {
                        // Client dropped the stream; the runner goes with it.
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "Incremental query update failed"),
            }
        }
    });
    LiveQueryHandle { results: rx }
}
