//! Entity representation and buffer framing.
//!
//! An entity on disk is a tagged, length-prefixed composite of three
//! sections: *metadata* (revision, operation, replay flag, modified
//! properties), *resource* (resource-specific properties) and *local* (the
//! canonical typed properties). Tombstones carry metadata only; their
//! resource and local sections are empty.
//!
//! Framing is hand-encoded (tag plus little-endian section lengths) so the
//! layout is stable; the field payloads inside each section are bincode.
//! Property maps are `BTreeMap`s, which keeps the encoded field order fixed
//! per type.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SinkError};
use crate::types::{Identifier, Operation, Revision};

/// Magic tag at the start of every entity buffer.
pub const BUFFER_TAG: u32 = 0x534e_4b45;

/// A single typed property value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PropertyValue {
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes (mime payloads, vcards, ical blobs).
    Bytes(Vec<u8>),
    /// Milliseconds since the Unix epoch.
    DateTime(i64),
    /// Boolean flag.
    Bool(bool),
    /// List of byte-strings (recipient lists, categories).
    ByteList(Vec<Vec<u8>>),
    /// Reference to another entity of this resource.
    Reference(Identifier),
}

impl PropertyValue {
    /// Returns the text content, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the byte content of byte-like values.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PropertyValue::Bytes(b) => Some(b),
            PropertyValue::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Returns the timestamp, if this is a datetime value.
    pub fn as_datetime(&self) -> Option<i64> {
        match self {
            PropertyValue::DateTime(ms) => Some(*ms),
            _ => None,
        }
    }

    /// Returns the referenced identifier, if this is a reference.
    pub fn as_reference(&self) -> Option<Identifier> {
        match self {
            PropertyValue::Reference(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Text(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::Text(s)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

impl From<Identifier> for PropertyValue {
    fn from(id: Identifier) -> Self {
        PropertyValue::Reference(id)
    }
}

/// Ordered property map of one entity section.
pub type Properties = BTreeMap<String, PropertyValue>;

/// The metadata section of an entity buffer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// The revision this buffer was written at.
    pub revision: Revision,
    /// What the revision records.
    pub operation: Operation,
    /// Whether the change must be replayed to the source (false for
    /// source-originated changes).
    pub replay_to_source: bool,
    /// The properties this revision changed, including preprocessor edits.
    /// `None` for creations and removals.
    pub modified_properties: Option<Vec<String>>,
}

/// A decoded entity: identifier plus the three buffer sections.
#[derive(Clone, Debug, PartialEq)]
pub struct Entity {
    /// The identifier naming this entity across revisions.
    pub id: Identifier,
    /// Metadata of the revision this instance was read at.
    pub metadata: Metadata,
    /// Resource-specific properties; may be empty for generic types.
    pub resource: Properties,
    /// The canonical typed properties.
    pub local: Properties,
}

impl Entity {
    /// Creates an entity shell with the given id and empty sections.
    pub fn new(id: Identifier) -> Self {
        Self {
            id,
            metadata: Metadata {
                revision: 0,
                operation: Operation::Creation,
                replay_to_source: true,
                modified_properties: None,
            },
            resource: Properties::new(),
            local: Properties::new(),
        }
    }

    /// Looks up a property, local section first, then resource section.
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.local.get(name).or_else(|| self.resource.get(name))
    }

    /// Sets a local property, returning the previous value.
    pub fn set_property(
        &mut self,
        name: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Option<PropertyValue> {
        self.local.insert(name.into(), value.into())
    }

    /// Removes a property from both sections.
    pub fn remove_property(&mut self, name: &str) -> Option<PropertyValue> {
        let local = self.local.remove(name);
        let resource = self.resource.remove(name);
        local.or(resource)
    }

    /// True if the revision this entity was read at is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.metadata.operation == Operation::Removal
    }

    /// Merges a diff into this entity: changed properties override, declared
    /// deletions are dropped. Returns the set of property names touched.
    pub fn apply_diff(&mut self, diff: &Properties, deletions: &[String]) -> Vec<String> {
        let mut touched = Vec::with_capacity(diff.len() + deletions.len());
        for (name, value) in diff {
            self.local.insert(name.clone(), value.clone());
            touched.push(name.clone());
        }
        for name in deletions {
            if self.remove_property(name).is_some() {
                touched.push(name.clone());
            }
        }
        touched
    }
}

// ============================================================================
// Buffer framing
// ============================================================================

fn push_section(out: &mut Vec<u8>, section: &[u8]) {
    out.extend_from_slice(&(section.len() as u32).to_le_bytes());
    out.extend_from_slice(section);
}

fn take_section<'a>(bytes: &mut &'a [u8]) -> Result<&'a [u8]> {
    if bytes.len() < 4 {
        return Err(SinkError::invalid_buffer("truncated section length"));
    }
    let len = u32::from_le_bytes(bytes[..4].try_into().expect("sliced 4 bytes")) as usize;
    *bytes = &bytes[4..];
    if bytes.len() < len {
        return Err(SinkError::invalid_buffer("truncated section payload"));
    }
    let (section, rest) = bytes.split_at(len);
    *bytes = rest;
    Ok(section)
}

/// Assembles an entity buffer from its three sections.
///
/// Pass empty property maps for a tombstone; the corresponding sections are
/// written with zero length.
pub fn encode_entity(metadata: &Metadata, resource: &Properties, local: &Properties) -> Result<Vec<u8>> {
    let metadata_bytes = bincode::serialize(metadata)?;
    let resource_bytes = if resource.is_empty() {
        Vec::new()
    } else {
        bincode::serialize(resource)?
    };
    let local_bytes = if local.is_empty() {
        Vec::new()
    } else {
        bincode::serialize(local)?
    };

    let mut out = Vec::with_capacity(
        16 + metadata_bytes.len() + resource_bytes.len() + local_bytes.len(),
    );
    out.extend_from_slice(&BUFFER_TAG.to_le_bytes());
    push_section(&mut out, &metadata_bytes);
    push_section(&mut out, &resource_bytes);
    push_section(&mut out, &local_bytes);
    Ok(out)
}

/// Convenience wrapper encoding a full entity.
pub fn encode(entity: &Entity) -> Result<Vec<u8>> {
    encode_entity(&entity.metadata, &entity.resource, &entity.local)
}

/// Verifies the frame and decodes all three sections.
pub fn decode_entity(id: Identifier, bytes: &[u8]) -> Result<Entity> {
    let (metadata, resource, local) = split_buffer(bytes)?;
    let metadata: Metadata = bincode::deserialize(metadata)?;
    let resource: Properties = if resource.is_empty() {
        Properties::new()
    } else {
        bincode::deserialize(resource)?
    };
    let local: Properties = if local.is_empty() {
        Properties::new()
    } else {
        bincode::deserialize(local)?
    };
    Ok(Entity {
        id,
        metadata,
        resource,
        local,
    })
}

/// Decodes only the metadata section.
///
/// Replay and cleanup use this to inspect a revision without paying for the
/// property sections.
pub fn decode_metadata(bytes: &[u8]) -> Result<Metadata> {
    let (metadata, _, _) = split_buffer(bytes)?;
    Ok(bincode::deserialize(metadata)?)
}

fn split_buffer(bytes: &[u8]) -> Result<(&[u8], &[u8], &[u8])> {
    if bytes.len() < 4 {
        return Err(SinkError::invalid_buffer("buffer shorter than tag"));
    }
    let tag = u32::from_le_bytes(bytes[..4].try_into().expect("sliced 4 bytes"));
    if tag != BUFFER_TAG {
        return Err(SinkError::invalid_buffer(format!("bad tag {tag:#x}")));
    }
    let mut rest = &bytes[4..];
    let metadata = take_section(&mut rest)?;
    let resource = take_section(&mut rest)?;
    let local = take_section(&mut rest)?;
    if !rest.is_empty() {
        return Err(SinkError::invalid_buffer("trailing bytes after sections"));
    }
    if metadata.is_empty() {
        return Err(SinkError::invalid_buffer("empty metadata section"));
    }
    Ok((metadata, resource, local))
}
