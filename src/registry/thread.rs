//! Mail threading indexer.
//!
//! Maintains two secondary databases mapping message ids to thread ids and
//! back. Threads are discovered incrementally: a mail joins its parent's
//! thread when the parent is known, adopts a thread a child already
//! registered for it, or starts a new one. When a mail connects two threads
//! (its children registered one, its parent owns another) the child thread
//! is merged into the parent thread.

use tracing::{debug, warn};
use uuid::Uuid;

use super::{CustomIndexer, IndexTransaction};
use crate::entity::Entity;
use crate::error::Result;

const MESSAGE_ID_TO_THREAD_ID: &str = "mail.index.messageIdthreadId";
const THREAD_ID_TO_MESSAGE_ID: &str = "mail.index.threadIdmessageId";

/// Custom secondary indexer grouping mails into threads.
#[derive(Debug, Default)]
pub struct ThreadIndexer;

impl ThreadIndexer {
    fn update_threading_index(&self, entity: &Entity, txn: &IndexTransaction<'_>) -> Result<()> {
        let message_id = match entity.property("messageId").and_then(|v| v.as_bytes()) {
            Some(m) if !m.is_empty() => m.to_vec(),
            _ => {
                warn!(id = %entity.id, "Mail without messageId; threading will break");
                return Ok(());
            }
        };
        let parent_message_id = entity
            .property("parentMessageId")
            .and_then(|v| v.as_bytes())
            .filter(|m| !m.is_empty())
            .map(<[u8]>::to_vec);

        // A child may already have registered a thread for us.
        let mut thread = txn.lookup(MESSAGE_ID_TO_THREAD_ID, &message_id)?;

        if let (Some(child_thread), Some(parent)) = (thread.first().cloned(), &parent_message_id) {
            let parent_thread = txn.lookup(MESSAGE_ID_TO_THREAD_ID, parent)?;
            if let Some(parent_thread) = parent_thread.first() {
                if *parent_thread != child_thread {
                    debug!("Merging child thread into parent thread");
                    // Ensure this mail ends up in the parent thread.
                    txn.index_remove(MESSAGE_ID_TO_THREAD_ID, &message_id, &child_thread)?;
                    thread = vec![parent_thread.clone()];

                    // Move every message of the child thread over.
                    let child_messages = txn.lookup(THREAD_ID_TO_MESSAGE_ID, &child_thread)?;
                    for msg in child_messages {
                        txn.index_remove(MESSAGE_ID_TO_THREAD_ID, &msg, &child_thread)?;
                        txn.index_remove(THREAD_ID_TO_MESSAGE_ID, &child_thread, &msg)?;
                        txn.index_add(MESSAGE_ID_TO_THREAD_ID, &msg, parent_thread)?;
                        txn.index_add(THREAD_ID_TO_MESSAGE_ID, parent_thread, &msg)?;
                    }
                }
            }
        }

        // If the parent is known, join its thread.
        if thread.is_empty() {
            if let Some(parent) = &parent_message_id {
                thread = txn.lookup(MESSAGE_ID_TO_THREAD_ID, parent)?;
            }
        }
        if thread.is_empty() {
            thread = vec![Uuid::new_v4().as_bytes().to_vec()];
            debug!("Created a new thread");
        }

        let thread_id = &thread[0];
        if let Some(parent) = &parent_message_id {
            // Register the parent so it lands in this thread once it arrives.
            txn.index_add(MESSAGE_ID_TO_THREAD_ID, parent, thread_id)?;
        }
        txn.index_add(MESSAGE_ID_TO_THREAD_ID, &message_id, thread_id)?;
        txn.index_add(THREAD_ID_TO_MESSAGE_ID, thread_id, &message_id)?;
        Ok(())
    }
}

impl CustomIndexer for ThreadIndexer {
    fn add(&self, entity: &Entity, txn: &IndexTransaction<'_>) -> Result<()> {
        self.update_threading_index(entity, txn)
    }

    fn modify(&self, _old: &Entity, _new: &Entity, _txn: &IndexTransaction<'_>) -> Result<()> {
        // Message ids are immutable, so the thread membership is too.
        Ok(())
    }

    fn remove(&self, entity: &Entity, txn: &IndexTransaction<'_>) -> Result<()> {
        let Some(message_id) = entity.property("messageId").and_then(|v| v.as_bytes()) else {
            return Ok(());
        };
        // Only the membership direction is dropped. The message-to-thread
        // mapping stays so the thread of a removed mail remains resolvable
        // from its previous revision (reductions shrink their group through
        // it), and a re-arriving copy rejoins its old thread.
        let thread = txn.lookup(MESSAGE_ID_TO_THREAD_ID, message_id)?;
        if let Some(thread_id) = thread.first() {
            txn.index_remove(THREAD_ID_TO_MESSAGE_ID, thread_id, message_id)?;
        }
        Ok(())
    }

    fn databases(&self) -> Vec<String> {
        vec![
            MESSAGE_ID_TO_THREAD_ID.to_string(),
            THREAD_ID_TO_MESSAGE_ID.to_string(),
        ]
    }
}
