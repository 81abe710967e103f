//! # Sink Store
//!
//! Offline-first personal-information-store engine. Each external account
//! (mail server, CardDAV addressbook, CalDAV calendar, ...) is served by a
//! long-lived resource instance that owns a local database, synchronizes
//! with the remote source, answers queries from local clients, and replays
//! local changes back to the source.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sinkstore::{ClientCommand, Config, Resource, TypeRegistry};
//! use std::sync::Arc;
//!
//! // Open a resource instance backed by an adapter for its protocol
//! let config = Config::new("/var/lib/sink", "imap.account1");
//! let mut resource = Resource::open(
//!     config,
//!     Arc::new(TypeRegistry::standard()),
//!     Box::new(my_imap_adapter),
//! ).await?;
//!
//! // Feed it client commands and queries
//! resource.handle_message(client, msg_id, ClientCommand::Synchronize { query: None }).await?;
//! let mails = resource.query(Query::for_type(EntityType::Mail))?;
//! ```
//!
//! ## Key Concepts
//!
//! ### Revisions
//!
//! Every mutation allocates the next value of a resource-global 64-bit
//! counter. The entity store is an append-only revision log; superseded and
//! tombstone revisions are garbage-collected once replay and every client
//! have moved past them.
//!
//! ### Command queues
//!
//! Commands reach the store through two durable queues (client and
//! synchronizer), applied by a single-writer pipeline in batches. A flush
//! is a barrier through those queues.
//!
//! ### Change replay
//!
//! Committed revisions flagged for replay are pushed to the source strictly
//! in order. Transient source errors halt replay without losing the
//! position; the cursor survives restarts.
//!
//! ### Queries
//!
//! Queries are a closed algebraic form (filters, reduce, bloom, reference
//! resolution) compiled into a pipeline over index lookups or full scans.
//! Live queries re-run incrementally on every committed revision.
//!
//! ## Concurrency
//!
//! One process owns a resource instance (advisory file lock); within it a
//! single writer mutates the entity environment while readers observe
//! snapshots. CPU work may move to background tasks, but results are always
//! published back through channels, never shared mutable state.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod changereplay;
mod commands;
mod config;
mod entity;
mod error;
mod inspector;
mod notifier;
mod pipeline;
mod processor;
mod queue;
mod resource;
mod store;
mod synchronizer;
mod types;

pub mod query;
pub mod registry;
pub mod storage;

// Main engine interface
pub use resource::{ClientCommand, Directive, Resource};

// Configuration
pub use config::{Config, TESTMODE_ENV};

// Error handling
pub use error::{NotFoundError, QueueError, Result, SinkError, StorageError, SyncError};

// Core types
pub use entity::{Entity, Metadata, Properties, PropertyValue};
pub use types::{EntityType, Identifier, Key, Operation, ResourceStatus, Revision};

// Commands and events
pub use commands::{
    CommandId, CreateEntity, DeleteEntity, Flush, FlushType, Inspection, InspectionCheck,
    ModifyEntity, QueuedCommand, Synchronize,
};
pub use notifier::{ClientEvent, EventStream, Notification, NotificationType, Notifier};

// Engine internals (for adapters and advanced embedding)
pub use changereplay::{ChangeReplay, ReplayItem};
pub use inspector::Inspector;
pub use pipeline::{DeletionContext, MovedEntity, Pipeline, Preprocessor, PreprocessorAction};
pub use processor::CommandProcessor;
pub use queue::MessageQueue;
pub use registry::TypeRegistry;
pub use store::{EntityStore, IndexLookup};
pub use synchronizer::{
    SourceAdapter, SyncContext, SyncRequest, SyncRequestType, Synchronizer, SynchronizerStore,
};

// Queries
pub use query::{
    AggregateValue, Aggregator, AggregationOperation, Comparator, DataStoreQuery, FilterStage,
    LiveQueryHandle, PropertySelector, Query, QueryResult, QueryRunner, Reduce, ResultSet,
    SelectionComparator, Selector,
};

/// Convenient imports for common usage.
///
/// ```rust
/// use sinkstore::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::entity::{Entity, Properties, PropertyValue};
    pub use crate::error::{Result, SinkError};
    pub use crate::query::{Comparator, Query};
    pub use crate::resource::{ClientCommand, Resource};
    pub use crate::types::{EntityType, Identifier, Operation, Revision};
}
