//! Type registry: per-entity-type index and property declarations.
//!
//! Every entity type declares its property set, its value/sorted/secondary
//! indexes and any custom secondary indexers (threading, fulltext). The
//! entity store consults these declarations on every write so that index
//! maintenance stays declarative: entity and index updates always land in
//! the same transaction.
//!
//! Entity-type handling is data, not templates: a [`TypeRegistry`] maps each
//! [`EntityType`] tag to its [`TypeDefinition`].

mod definitions;
mod fulltext;
mod thread;

pub use fulltext::{terms as fulltext_terms, FulltextIndexer};
pub use thread::ThreadIndexer;

use std::collections::HashMap;

use redb::{ReadableMultimapTable, WriteTransaction};
use tracing::warn;

use crate::entity::{Entity, PropertyValue};
use crate::error::{Result, SinkError, StorageError};
use crate::storage::schema;
use crate::types::EntityType;

/// The declared kind of a property.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyKind {
    /// UTF-8 text.
    Text,
    /// Opaque bytes.
    Bytes,
    /// Milliseconds since the Unix epoch.
    DateTime,
    /// Boolean flag.
    Bool,
    /// List of byte-strings.
    ByteList,
    /// Reference to another entity.
    Reference,
}

impl PropertyKind {
    fn matches(&self, value: &PropertyValue) -> bool {
        matches!(
            (self, value),
            (PropertyKind::Text, PropertyValue::Text(_))
                | (PropertyKind::Bytes, PropertyValue::Bytes(_))
                | (PropertyKind::Bytes, PropertyValue::Text(_))
                | (PropertyKind::DateTime, PropertyValue::DateTime(_))
                | (PropertyKind::Bool, PropertyValue::Bool(_))
                | (PropertyKind::ByteList, PropertyValue::ByteList(_))
                | (PropertyKind::Reference, PropertyValue::Reference(_))
                | (PropertyKind::Reference, PropertyValue::Bytes(_))
        )
    }
}

/// A declared property: name plus kind.
#[derive(Clone, Copy, Debug)]
pub struct PropertyDecl {
    /// Property name as it appears in buffers and queries.
    pub name: &'static str,
    /// Declared kind.
    pub kind: PropertyKind,
}

/// One declared index.
#[derive(Clone, Debug)]
pub enum IndexKind {
    /// `property value -> identifier` duplicate entries.
    Value {
        /// Indexed property.
        property: &'static str,
    },
    /// `property value || sort value -> identifier`, range-scannable so ids
    /// come back ordered by the sort property.
    Sorted {
        /// Indexed property; empty groups everything under one prefix.
        property: &'static str,
        /// Property providing the order.
        sort_property: &'static str,
    },
    /// `left value -> right value`, resolving `right` without loading the
    /// entity.
    Secondary {
        /// Lookup key property.
        left: &'static str,
        /// Resolved property.
        right: &'static str,
    },
}

/// A property that is not persisted but resolved from a secondary index at
/// read time (e.g. mail `threadId` from the message-id index).
#[derive(Clone, Copy, Debug)]
pub struct IndexProperty {
    /// Name the property surfaces under.
    pub name: &'static str,
    /// Property of the entity used as the lookup key.
    pub source_property: &'static str,
    /// Left side of the secondary index to consult.
    pub left: &'static str,
    /// Right side of the secondary index to consult.
    pub right: &'static str,
}

/// Write-transaction view handed to indexers.
///
/// Wraps the entity environment's write transaction and exposes the three
/// operations indexers need. All writes land in the caller's transaction.
pub struct IndexTransaction<'a> {
    txn: &'a WriteTransaction,
}

impl<'a> IndexTransaction<'a> {
    /// Wraps a write transaction.
    pub fn new(txn: &'a WriteTransaction) -> Self {
        Self { txn }
    }

    /// Adds an entry to the named index database.
    pub fn index_add(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let mut t = self
            .txn
            .open_multimap_table(schema::index_table(table))
            .map_err(StorageError::from)?;
        t.insert(key, value).map_err(StorageError::from)?;
        Ok(())
    }

    /// Removes an entry from the named index database.
    pub fn index_remove(&self, table: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let mut t = self
            .txn
            .open_multimap_table(schema::index_table(table))
            .map_err(StorageError::from)?;
        t.remove(key, value).map_err(StorageError::from)?;
        Ok(())
    }

    /// Returns all values stored under `key` in the named index database.
    pub fn lookup(&self, table: &str, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let t = self
            .txn
            .open_multimap_table(schema::index_table(table))
            .map_err(StorageError::from)?;
        let mut out = Vec::new();
        for value in t.get(key).map_err(StorageError::from)? {
            out.push(value.map_err(StorageError::from)?.value().to_vec());
        }
        Ok(out)
    }
}

/// A custom secondary indexer with full control over its databases.
pub trait CustomIndexer: Send + Sync {
    /// Called when an entity is created.
    fn add(&self, entity: &Entity, txn: &IndexTransaction<'_>) -> Result<()>;

    /// Called when an entity is modified. Defaults to remove-then-add.
    fn modify(&self, old: &Entity, new: &Entity, txn: &IndexTransaction<'_>) -> Result<()> {
        self.remove(old, txn)?;
        self.add(new, txn)
    }

    /// Called when an entity is removed.
    fn remove(&self, entity: &Entity, txn: &IndexTransaction<'_>) -> Result<()>;

    /// Names of the databases this indexer maintains.
    fn databases(&self) -> Vec<String>;
}

/// The full declaration of one entity type.
pub struct TypeDefinition {
    ty: EntityType,
    properties: Vec<PropertyDecl>,
    indexes: Vec<IndexKind>,
    index_properties: Vec<IndexProperty>,
    custom_indexers: Vec<Box<dyn CustomIndexer>>,
}

impl TypeDefinition {
    /// Creates a definition with no indexes.
    pub fn new(ty: EntityType, properties: Vec<PropertyDecl>) -> Self {
        Self {
            ty,
            properties,
            indexes: Vec::new(),
            index_properties: Vec::new(),
            custom_indexers: Vec::new(),
        }
    }

    /// Declares an index.
    pub fn with_index(mut self, index: IndexKind) -> Self {
        self.indexes.push(index);
        self
    }

    /// Declares an index-backed read-time property.
    pub fn with_index_property(mut self, prop: IndexProperty) -> Self {
        self.index_properties.push(prop);
        self
    }

    /// Attaches a custom indexer.
    pub fn with_custom_indexer(mut self, indexer: Box<dyn CustomIndexer>) -> Self {
        self.custom_indexers.push(indexer);
        self
    }

    /// The entity type this definition describes.
    pub fn entity_type(&self) -> EntityType {
        self.ty
    }

    /// The declared property set.
    pub fn properties(&self) -> &[PropertyDecl] {
        &self.properties
    }

    /// The declared indexes.
    pub fn indexes(&self) -> &[IndexKind] {
        &self.indexes
    }

    /// The index-backed read-time properties.
    pub fn index_properties(&self) -> &[IndexProperty] {
        &self.index_properties
    }

    /// Looks up the declared value index for a property.
    pub fn value_index(&self, property: &str) -> Option<String> {
        self.indexes.iter().find_map(|i| match i {
            IndexKind::Value { property: p } if *p == property => {
                Some(schema::value_index_name(self.ty, p))
            }
            _ => None,
        })
    }

    /// Looks up a sorted index on `property`; prefers one sorted by
    /// `sort_property` when given.
    pub fn sorted_index(&self, property: &str, sort_property: Option<&str>) -> Option<(String, &'static str)> {
        let mut fallback = None;
        for index in &self.indexes {
            if let IndexKind::Sorted {
                property: p,
                sort_property: s,
            } = index
            {
                if *p != property {
                    continue;
                }
                if sort_property.is_none() || sort_property == Some(*s) {
                    return Some((schema::sorted_index_name(self.ty, p, s), *s));
                }
                fallback = Some((schema::sorted_index_name(self.ty, p, s), *s));
            }
        }
        fallback
    }

    /// Looks up the declared secondary index with the given left side.
    pub fn secondary_index(&self, left: &str) -> Option<(String, &'static str)> {
        self.indexes.iter().find_map(|i| match i {
            IndexKind::Secondary { left: l, right } if *l == left => {
                Some((schema::secondary_index_name(self.ty, l, right), *right))
            }
            _ => None,
        })
    }

    /// All database names this type uses, the main table included.
    pub fn databases(&self) -> Vec<String> {
        let mut out = vec![schema::main_table_name(self.ty).to_string()];
        for index in &self.indexes {
            match index {
                IndexKind::Value { property } => {
                    out.push(schema::value_index_name(self.ty, property));
                }
                IndexKind::Sorted {
                    property,
                    sort_property,
                } => out.push(schema::sorted_index_name(self.ty, property, sort_property)),
                IndexKind::Secondary { left, right } => {
                    out.push(schema::secondary_index_name(self.ty, left, right));
                }
            }
        }
        for indexer in &self.custom_indexers {
            out.extend(indexer.databases());
        }
        out
    }

    /// Validates declared properties against their kinds.
    ///
    /// Unknown properties are allowed (resource-specific extensions), but a
    /// declared property with a mismatched kind is rejected.
    pub fn validate(&self, entity: &Entity) -> Result<()> {
        for decl in &self.properties {
            if let Some(value) = entity.property(decl.name) {
                if !decl.kind.matches(value) {
                    return Err(SinkError::invalid_buffer(format!(
                        "property '{}' of {} has wrong kind",
                        decl.name, self.ty
                    )));
                }
            }
        }
        Ok(())
    }

    /// Applies all index updates for a creation.
    pub fn index_added(&self, entity: &Entity, txn: &IndexTransaction<'_>) -> Result<()> {
        self.update_plain_indexes(true, entity, txn)?;
        for indexer in &self.custom_indexers {
            indexer.add(entity, txn)?;
        }
        Ok(())
    }

    /// Applies all index updates for a modification.
    pub fn index_modified(
        &self,
        old: &Entity,
        new: &Entity,
        txn: &IndexTransaction<'_>,
    ) -> Result<()> {
        self.update_plain_indexes(false, old, txn)?;
        self.update_plain_indexes(true, new, txn)?;
        for indexer in &self.custom_indexers {
            indexer.modify(old, new, txn)?;
        }
        Ok(())
    }

    /// Applies all index updates for a removal.
    pub fn index_removed(&self, entity: &Entity, txn: &IndexTransaction<'_>) -> Result<()> {
        self.update_plain_indexes(false, entity, txn)?;
        for indexer in &self.custom_indexers {
            indexer.remove(entity, txn)?;
        }
        Ok(())
    }

    fn update_plain_indexes(
        &self,
        add: bool,
        entity: &Entity,
        txn: &IndexTransaction<'_>,
    ) -> Result<()> {
        let id = entity.id.as_bytes();
        for index in &self.indexes {
            match index {
                IndexKind::Value { property } => {
                    let Some(value) = entity.property(property) else {
                        continue;
                    };
                    let table = schema::value_index_name(self.ty, property);
                    let key = schema::index_value_bytes(value);
                    if add {
                        txn.index_add(&table, &key, id)?;
                    } else {
                        txn.index_remove(&table, &key, id)?;
                    }
                }
                IndexKind::Sorted {
                    property,
                    sort_property,
                } => {
                    let value = if property.is_empty() {
                        PropertyValue::Bytes(Vec::new())
                    } else {
                        match entity.property(property) {
                            Some(v) => v.clone(),
                            None => continue,
                        }
                    };
                    let table = schema::sorted_index_name(self.ty, property, sort_property);
                    let key = schema::sorted_index_key(&value, entity.property(sort_property));
                    if add {
                        txn.index_add(&table, &key, id)?;
                    } else {
                        txn.index_remove(&table, &key, id)?;
                    }
                }
                // Secondary indexes are filled by custom indexers or not at
                // all; the declaration only provides the lookup path.
                IndexKind::Secondary { .. } => {}
            }
        }
        Ok(())
    }
}

/// Registry of all entity-type declarations of one resource.
pub struct TypeRegistry {
    types: HashMap<EntityType, TypeDefinition>,
}

impl TypeRegistry {
    /// Builds a registry from explicit definitions. Missing types get an
    /// empty declaration.
    pub fn new(definitions: Vec<TypeDefinition>) -> Self {
        let mut types: HashMap<_, _> = definitions
            .into_iter()
            .map(|d| (d.entity_type(), d))
            .collect();
        for ty in EntityType::ALL {
            types
                .entry(ty)
                .or_insert_with(|| TypeDefinition::new(ty, Vec::new()));
        }
        Self { types }
    }

    /// The standard registry covering all ten entity types.
    pub fn standard() -> Self {
        Self::new(definitions::standard_definitions())
    }

    /// The definition of one type.
    pub fn definition(&self, ty: EntityType) -> &TypeDefinition {
        self.types.get(&ty).expect("registry covers all types")
    }

    /// All database names across all types.
    pub fn all_databases(&self) -> Vec<String> {
        let mut out: Vec<String> = self.types.values().flat_map(|d| d.databases()).collect();
        out.sort();
        out.dedup();
        out
    }

    /// Strips index-backed properties before persistence so derived state
    /// never lands in an entity buffer.
    pub fn strip_index_properties(&self, ty: EntityType, entity: &mut Entity) {
        for prop in self.definition(ty).index_properties() {
            if entity.remove_property(prop.name).is_some() {
                warn!(property = prop.name, %ty, "Dropped index-backed property from write");
            }
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
