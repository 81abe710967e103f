//! Durable command queues.
//!
//! Each resource has two of these: the client command queue and the
//! synchronizer command queue. A queue is one environment holding framed
//! commands keyed by a monotonic per-queue revision. Dequeuing advances an
//! in-memory cursor only; physical removal of replayed entries is batched
//! and only confirmed after the consumer committed its work, so a failed
//! batch leaves the messages in place for retry.

use std::sync::Arc;

use redb::{ReadableTable, TableDefinition, WriteTransaction};
use tokio::sync::Notify;
use tracing::{instrument, trace, warn};

use crate::error::{Result, StorageError};
use crate::storage::schema::{
    DEFAULT_TABLE, META_CLEANED_UP_REVISION, META_MAX_REVISION, QUEUE_BACKLOG_WARNING,
};
use crate::storage::{self, Environment};

/// The single table holding queued command frames.
const QUEUE_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("queue");

/// A durable FIFO of framed commands.
pub struct MessageQueue {
    env: Environment,
    name: String,
    txn: Option<WriteTransaction>,
    replayed_revision: Option<u64>,
    ready: Arc<Notify>,
    drained: Arc<Notify>,
}

impl MessageQueue {
    /// Opens or creates the queue environment at `path`.
    pub fn open(path: impl AsRef<std::path::Path>, name: impl Into<String>) -> Result<Self> {
        let env = Environment::open(path)?;
        Ok(Self {
            env,
            name: name.into(),
            txn: None,
            replayed_revision: None,
            ready: Arc::new(Notify::new()),
            drained: Arc::new(Notify::new()),
        })
    }

    /// Queue name, for logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signalled after every commit that appended messages.
    pub fn ready_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.ready)
    }

    /// Signalled when a dequeue leaves the queue empty.
    pub fn drained_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.drained)
    }

    /// Begins an explicit enqueue transaction so bursts commit together.
    pub fn start_transaction(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Ok(());
        }
        self.process_removals()?;
        self.txn = Some(self.env.write()?);
        Ok(())
    }

    /// True while an enqueue transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Commits the open enqueue transaction and signals readiness.
    pub fn commit(&mut self) -> Result<()> {
        if let Some(txn) = self.txn.take() {
            txn.commit().map_err(StorageError::from)?;
        }
        self.process_removals()?;
        self.ready.notify_waiters();
        Ok(())
    }

    /// Appends a command at `maxRevision + 1`.
    ///
    /// Without an open transaction the append commits immediately.
    pub fn enqueue(&mut self, value: &[u8]) -> Result<()> {
        let implicit = self.txn.is_none();
        if implicit {
            self.start_transaction()?;
        }
        {
            let txn = self.txn.as_ref().expect("transaction just opened");
            let revision = {
                let meta = txn.open_table(DEFAULT_TABLE).map_err(StorageError::from)?;
                storage::meta_value(&meta, META_MAX_REVISION)?.unwrap_or(0) + 1
            };
            {
                let mut queue = txn.open_table(QUEUE_TABLE).map_err(StorageError::from)?;
                queue.insert(revision, value).map_err(StorageError::from)?;
            }
            {
                let mut meta = txn.open_table(DEFAULT_TABLE).map_err(StorageError::from)?;
                meta.insert(META_MAX_REVISION, revision)
                    .map_err(StorageError::from)?;
            }
            trace!(queue = %self.name, revision, "Enqueued command");
        }
        if implicit {
            self.commit()?;
        }
        Ok(())
    }

    /// Yields up to `max` commands in revision order to the handler.
    ///
    /// The in-memory cursor advances past each entry only after the handler
    /// returns success; the first failure stops the batch and leaves the
    /// cursor before the failed entry. An empty queue returns 0 without
    /// calling the handler.
    #[instrument(skip(self, handler), fields(queue = %self.name))]
    pub fn dequeue_batch<F>(&mut self, max: usize, mut handler: F) -> Result<usize>
    where
        F: FnMut(Vec<u8>) -> Result<()>,
    {
        let cursor = self.replayed_revision.unwrap_or(0);
        let batch: Vec<(u64, Vec<u8>)> = {
            let txn = self.env.read()?;
            match storage::read_table(&txn, QUEUE_TABLE)? {
                None => Vec::new(),
                Some(table) => {
                    let mut out = Vec::new();
                    for entry in table.range((cursor + 1)..).map_err(StorageError::from)? {
                        let (key, value) = entry.map_err(StorageError::from)?;
                        out.push((key.value(), value.value().to_vec()));
                        if out.len() >= max {
                            break;
                        }
                    }
                    out
                }
            }
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let mut count = 0;
        for (revision, value) in batch {
            handler(value)?;
            self.replayed_revision = Some(revision);
            count += 1;
        }
        if self.is_empty()? {
            self.drained.notify_waiters();
        }
        Ok(count)
    }

    /// The current in-memory replay cursor.
    pub fn replayed_revision(&self) -> Option<u64> {
        self.replayed_revision
    }

    /// Rolls the replay cursor back, e.g. after the consumer failed to
    /// commit a batch.
    pub fn set_replayed_revision(&mut self, revision: Option<u64>) {
        self.replayed_revision = revision;
    }

    /// Physically deletes entries up to the replay cursor.
    ///
    /// With an enqueue transaction open only the backlog is checked; actual
    /// removal happens on the next call without one.
    pub fn process_removals(&mut self) -> Result<()> {
        if self.txn.is_some() {
            if let Some(replayed) = self.replayed_revision {
                let cleaned = {
                    let txn = self.env.read()?;
                    storage::cleaned_up_revision(&txn)?
                };
                let backlog = replayed.saturating_sub(cleaned);
                if backlog > QUEUE_BACKLOG_WARNING {
                    warn!(queue = %self.name, backlog, "Large backlog of dequeued revisions");
                }
            }
            return Ok(());
        }
        let Some(replayed) = self.replayed_revision else {
            return Ok(());
        };
        let txn = self.env.write()?;
        {
            let cleaned = {
                let meta = txn.open_table(DEFAULT_TABLE).map_err(StorageError::from)?;
                storage::meta_value(&meta, META_CLEANED_UP_REVISION)?.unwrap_or(0)
            };
            let mut queue = txn.open_table(QUEUE_TABLE).map_err(StorageError::from)?;
            for revision in (cleaned + 1)..=replayed {
                queue.remove(revision).map_err(StorageError::from)?;
            }
            let mut meta = txn.open_table(DEFAULT_TABLE).map_err(StorageError::from)?;
            meta.insert(META_CLEANED_UP_REVISION, replayed)
                .map_err(StorageError::from)?;
        }
        txn.commit().map_err(StorageError::from)?;
        trace!(queue = %self.name, up_to = replayed, "Removed replayed queue entries");
        self.replayed_revision = None;
        Ok(())
    }

    /// True iff no entry lies past the replay cursor.
    pub fn is_empty(&self) -> Result<bool> {
        let cursor = self.replayed_revision.unwrap_or(0);
        let txn = self.env.read()?;
        match storage::read_table(&txn, QUEUE_TABLE)? {
            None => Ok(true),
            Some(table) => {
                let mut range = table.range((cursor + 1)..).map_err(StorageError::from)?;
                Ok(range.next().is_none())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_queue(dir: &std::path::Path) -> MessageQueue {
        MessageQueue::open(dir.join("test.userqueue"), "userqueue").unwrap()
    }

    #[test]
    fn enqueue_dequeue_in_order() {
        let dir = tempdir().unwrap();
        let mut queue = open_queue(dir.path());
        queue.enqueue(b"one").unwrap();
        queue.enqueue(b"two").unwrap();
        assert!(!queue.is_empty().unwrap());

        let mut seen = Vec::new();
        let count = queue
            .dequeue_batch(10, |value| {
                seen.push(value);
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn dequeue_on_empty_queue_does_not_call_handler() {
        let dir = tempdir().unwrap();
        let mut queue = open_queue(dir.path());
        let count = queue
            .dequeue_batch(10, |_| panic!("handler must not run"))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn batch_size_limits_dequeue() {
        let dir = tempdir().unwrap();
        let mut queue = open_queue(dir.path());
        for i in 0..5u8 {
            queue.enqueue(&[i]).unwrap();
        }
        let mut seen = 0;
        queue
            .dequeue_batch(2, |_| {
                seen += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 2);
        assert!(!queue.is_empty().unwrap());
    }

    #[test]
    fn failed_handler_keeps_messages() {
        let dir = tempdir().unwrap();
        let mut queue = open_queue(dir.path());
        queue.enqueue(b"ok").unwrap();
        queue.enqueue(b"bad").unwrap();

        let result = queue.dequeue_batch(10, |value| {
            if value == b"bad" {
                Err(StorageError::corrupt("boom").into())
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());
        // The failed entry is still pending.
        assert!(!queue.is_empty().unwrap());
        let mut seen = Vec::new();
        queue
            .dequeue_batch(10, |value| {
                seen.push(value);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![b"bad".to_vec()]);
    }

    #[test]
    fn cursor_rollback_replays_batch() {
        let dir = tempdir().unwrap();
        let mut queue = open_queue(dir.path());
        queue.enqueue(b"a").unwrap();
        let snapshot = queue.replayed_revision();
        queue.dequeue_batch(10, |_| Ok(())).unwrap();
        assert!(queue.is_empty().unwrap());

        queue.set_replayed_revision(snapshot);
        let mut seen = 0;
        queue
            .dequeue_batch(10, |_| {
                seen += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn removals_are_deferred_until_confirmed() {
        let dir = tempdir().unwrap();
        let mut queue = open_queue(dir.path());
        queue.enqueue(b"a").unwrap();
        queue.dequeue_batch(10, |_| Ok(())).unwrap();

        queue.process_removals().unwrap();
        assert!(queue.is_empty().unwrap());
        // Cursor reset after physical removal; nothing reappears.
        assert_eq!(queue.replayed_revision(), None);
        let count = queue.dequeue_batch(10, |_| Ok(())).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn explicit_transaction_groups_enqueues() {
        let dir = tempdir().unwrap();
        let mut queue = open_queue(dir.path());
        queue.start_transaction().unwrap();
        queue.enqueue(b"a").unwrap();
        queue.enqueue(b"b").unwrap();
        queue.commit().unwrap();

        let mut seen = 0;
        queue
            .dequeue_batch(10, |_| {
                seen += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn queue_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut queue = open_queue(dir.path());
            queue.enqueue(b"persisted").unwrap();
        }
        let mut queue = open_queue(dir.path());
        let mut seen = Vec::new();
        queue
            .dequeue_batch(10, |value| {
                seen.push(value);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![b"persisted".to_vec()]);
    }
}
