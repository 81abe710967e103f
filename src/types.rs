//! Core type definitions for identifiers, revisions and entity types.
//!
//! This module defines the fundamental types used throughout the engine.
//! An [`Identifier`] names an entity across its whole revision history, a
//! [`Revision`] names a single write into the entity store, and a [`Key`]
//! combines the two.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Entity identifier: an opaque 16-byte value, unique per entity for its
/// lifetime.
///
/// Identifiers are random (UUID v4); any ordering between entities comes
/// from revisions, never from the id itself. The binary form is used as a
/// fixed-width storage key, the display form for external interfaces.
///
/// # Example
/// ```
/// use sinkstore::Identifier;
///
/// let id = Identifier::new();
/// println!("Created entity: {}", id);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier(pub Uuid);

impl Identifier {
    /// Creates a new random identifier.
    #[inline]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a nil (all zeros) identifier. Useful as a sentinel in tests.
    #[inline]
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Returns true if this is the nil identifier.
    #[inline]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Returns the raw bytes for storage.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Creates an identifier from raw bytes.
    #[inline]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Creates an identifier from a byte slice, if it is exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self::from_bytes(arr))
    }

    /// Parses the printable form produced by [`fmt::Display`].
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for Identifier {
    /// Returns the nil identifier. For a new unique id use
    /// [`Identifier::new()`].
    fn default() -> Self {
        Self::nil()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Revision number: a resource-global, strictly monotonic 64-bit counter.
///
/// Every mutation of the entity store allocates the next revision; revisions
/// are dense (no gaps, no reuse).
pub type Revision = u64;

/// A (identifier, revision) pair naming one concrete write.
///
/// The binary encoding is identifier-first so that all revisions of one
/// entity are adjacent when keys are compared lexicographically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    /// The entity the revision belongs to.
    pub id: Identifier,
    /// The revision number.
    pub revision: Revision,
}

impl Key {
    /// Creates a key from an identifier and a revision.
    #[inline]
    pub fn new(id: Identifier, revision: Revision) -> Self {
        Self { id, revision }
    }

    /// Returns the 24-byte binary form: id bytes followed by the revision in
    /// big-endian so lexicographic order matches numeric order.
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[..16].copy_from_slice(self.id.as_bytes());
        out[16..].copy_from_slice(&self.revision.to_be_bytes());
        out
    }

    /// Decodes the 24-byte binary form.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 24 {
            return None;
        }
        let id = Identifier::from_slice(&bytes[..16])?;
        let revision = u64::from_be_bytes(bytes[16..].try_into().ok()?);
        Some(Self { id, revision })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.revision)
    }
}

/// The operation a revision records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// The entity came into existence with this revision.
    Creation,
    /// An existing entity was changed.
    Modification,
    /// The entity was removed; the revision is a tombstone.
    Removal,
}

/// The closed set of entity types a resource can store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    /// An email message.
    Mail,
    /// A mail folder.
    Folder,
    /// An addressbook contact.
    Contact,
    /// A contact container.
    Addressbook,
    /// A calendar event.
    Event,
    /// A task.
    Todo,
    /// An event/todo container.
    Calendar,
    /// A configured resource instance.
    SinkResource,
    /// An account grouping several resources.
    SinkAccount,
    /// A sending identity.
    Identity,
}

impl EntityType {
    /// All entity types, in declaration order.
    pub const ALL: [EntityType; 10] = [
        EntityType::Mail,
        EntityType::Folder,
        EntityType::Contact,
        EntityType::Addressbook,
        EntityType::Event,
        EntityType::Todo,
        EntityType::Calendar,
        EntityType::SinkResource,
        EntityType::SinkAccount,
        EntityType::Identity,
    ];

    /// The lowercase name used in database names and external interfaces.
    pub const fn name(&self) -> &'static str {
        match self {
            EntityType::Mail => "mail",
            EntityType::Folder => "folder",
            EntityType::Contact => "contact",
            EntityType::Addressbook => "addressbook",
            EntityType::Event => "event",
            EntityType::Todo => "todo",
            EntityType::Calendar => "calendar",
            EntityType::SinkResource => "sinkresource",
            EntityType::SinkAccount => "sinkaccount",
            EntityType::Identity => "identity",
        }
    }

    /// The compact tag persisted in the revision-type database.
    pub const fn tag(&self) -> u8 {
        match self {
            EntityType::Mail => 0,
            EntityType::Folder => 1,
            EntityType::Contact => 2,
            EntityType::Addressbook => 3,
            EntityType::Event => 4,
            EntityType::Todo => 5,
            EntityType::Calendar => 6,
            EntityType::SinkResource => 7,
            EntityType::SinkAccount => 8,
            EntityType::Identity => 9,
        }
    }

    /// Resolves a persisted tag back to the entity type.
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(EntityType::Mail),
            1 => Some(EntityType::Folder),
            2 => Some(EntityType::Contact),
            3 => Some(EntityType::Addressbook),
            4 => Some(EntityType::Event),
            5 => Some(EntityType::Todo),
            6 => Some(EntityType::Calendar),
            7 => Some(EntityType::SinkResource),
            8 => Some(EntityType::SinkAccount),
            9 => Some(EntityType::Identity),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resource status as surfaced to clients.
///
/// The synchronizer keeps a small stack of these; `Busy` is transient and is
/// pushed while a request runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceStatus {
    /// Nothing known yet.
    NoStatus,
    /// The last operation against the source succeeded.
    Connected,
    /// The source could not be reached.
    Offline,
    /// A request is currently executing.
    Busy,
    /// The configuration or credentials are broken.
    Error,
}
