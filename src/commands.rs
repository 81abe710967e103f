//! Command envelope and body schemas.
//!
//! Everything that travels through the durable queues is a
//! [`QueuedCommand`]: a command id plus the serialized body. The bodies
//! mirror the client protocol: create/modify/delete carry an entity delta,
//! flush carries a client-chosen barrier id, synchronize carries a query.

use serde::{Deserialize, Serialize};

use crate::entity::Properties;
use crate::error::{QueueError, Result, SinkError};
use crate::query::Query;
use crate::types::{EntityType, Identifier, Revision};

/// Numeric command ids; stable across versions, user-defined commands start
/// at [`CommandId::CUSTOM_COMMAND`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandId(pub i32);

impl CommandId {
    /// Create an entity.
    pub const CREATE_ENTITY: CommandId = CommandId(1);
    /// Modify an entity.
    pub const MODIFY_ENTITY: CommandId = CommandId(2);
    /// Delete an entity.
    pub const DELETE_ENTITY: CommandId = CommandId(3);
    /// Flush barrier.
    pub const FLUSH: CommandId = CommandId(4);
    /// Trigger inbound synchronization.
    pub const SYNCHRONIZE: CommandId = CommandId(5);
    /// Inspect stored state.
    pub const INSPECTION: CommandId = CommandId(6);
    /// Abort running synchronization requests.
    pub const ABORT_SYNCHRONIZATION: CommandId = CommandId(7);
    /// First id available to resource-specific commands.
    pub const CUSTOM_COMMAND: CommandId = CommandId(100);

    /// Human-readable name for logs.
    pub fn name(&self) -> &'static str {
        match *self {
            CommandId::CREATE_ENTITY => "CreateEntity",
            CommandId::MODIFY_ENTITY => "ModifyEntity",
            CommandId::DELETE_ENTITY => "DeleteEntity",
            CommandId::FLUSH => "Flush",
            CommandId::SYNCHRONIZE => "Synchronize",
            CommandId::INSPECTION => "Inspection",
            CommandId::ABORT_SYNCHRONIZATION => "AbortSynchronization",
            _ => "Custom",
        }
    }
}

/// The envelope stored in the durable queues.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedCommand {
    /// Which command the payload encodes.
    pub command: CommandId,
    /// Client message id to answer with a completion, if any.
    pub message_id: Option<u64>,
    /// The serialized command body.
    pub payload: Vec<u8>,
}

impl QueuedCommand {
    /// Wraps a command body.
    pub fn new(command: CommandId, payload: Vec<u8>) -> Self {
        Self {
            command,
            message_id: None,
            payload,
        }
    }

    /// Wraps a command body that wants a completion event.
    pub fn with_message_id(command: CommandId, payload: Vec<u8>, message_id: u64) -> Self {
        Self {
            command,
            message_id: Some(message_id),
            payload,
        }
    }

    /// Serializes the envelope for the queue.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes an envelope; a malformed frame is a queue error so the entry
    /// can be dropped with a warning instead of wedging the queue.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| {
            SinkError::Queue(QueueError::InvalidEntry {
                revision: 0,
                reason: e.to_string(),
            })
        })
    }
}

/// Body of [`CommandId::CREATE_ENTITY`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateEntity {
    /// Identifier of the new entity; a nil id asks the pipeline to
    /// allocate one.
    pub entity_id: Identifier,
    /// Entity type.
    pub entity_type: EntityType,
    /// Initial property set (resource section, local section).
    pub resource: Properties,
    /// Canonical typed properties.
    pub local: Properties,
    /// False for source-originated creations.
    pub replay_to_source: bool,
}

/// Body of [`CommandId::MODIFY_ENTITY`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModifyEntity {
    /// Revision the client based the modification on.
    pub revision: Revision,
    /// Entity to modify.
    pub entity_id: Identifier,
    /// Entity type.
    pub entity_type: EntityType,
    /// Properties to remove.
    pub deletions: Vec<String>,
    /// Properties to set.
    pub delta: Properties,
    /// False for source-originated modifications.
    pub replay_to_source: bool,
    /// Changed property names the sender already knows about.
    pub modified_properties: Vec<String>,
    /// Relocation target: a creation is emitted for that resource.
    pub target_resource: Option<String>,
    /// With `target_resource`: true is a move (the local entity is
    /// removed), false is a copy (the local entity stays and the delta
    /// still applies locally).
    pub remove_entity: bool,
}

/// Body of [`CommandId::DELETE_ENTITY`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteEntity {
    /// Revision the client based the deletion on.
    pub revision: Revision,
    /// Entity to delete.
    pub entity_id: Identifier,
    /// Entity type.
    pub entity_type: EntityType,
    /// False for source-originated deletions.
    pub replay_to_source: bool,
}

/// Which class of work a flush waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushType {
    /// Completes once all prior commands are pipelined and committed.
    FlushReplayQueue,
    /// Completes once the synchronizer's outbound queue drained past this
    /// point.
    FlushSynchronization,
}

/// Body of [`CommandId::FLUSH`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flush {
    /// Client-chosen barrier id echoed in the completion notification.
    pub id: String,
    /// Barrier class.
    pub flush_type: FlushType,
}

/// Body of [`CommandId::SYNCHRONIZE`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Synchronize {
    /// Scope of the synchronization; an unfiltered query syncs everything.
    pub query: Option<Query>,
}

/// Body of [`CommandId::INSPECTION`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Inspection {
    /// Correlates the result notification with the request.
    pub id: String,
    /// Entity to inspect.
    pub entity_id: Identifier,
    /// Entity type.
    pub entity_type: EntityType,
    /// What to check.
    pub check: InspectionCheck,
}

/// The checks an inspection can run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum InspectionCheck {
    /// The entity exists (or does not).
    Existence {
        /// Expected existence.
        exists: bool,
    },
    /// A property has the expected value.
    Property {
        /// Property to read.
        property: String,
        /// Expected value.
        expected: crate::entity::PropertyValue,
    },
}

/// Serializes a body and wraps it into an envelope in one step.
pub fn enqueueable<T: Serialize>(command: CommandId, body: &T) -> Result<Vec<u8>> {
    QueuedCommand::new(command, bincode::serialize(body)?).encode()
}
