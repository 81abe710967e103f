//! Database schema definitions and key encoding.
//!
//! This module defines the table structure of the entity environment and the
//! byte-level encodings that make lexicographic key order match the logical
//! order. All fixed table definitions are compile-time constants; per-type
//! and per-index tables derive their names from the type registry.
//!
//! # Table Layout (entity environment)
//!
//! ```text
//! {type}.main                      u64 revision     -> entity buffer
//! revisionType                     u64 revision     -> u8 type tag
//! revisions                        u64 revision     -> 16-byte identifier
//! uidsToRevisions                  identifier       -> u64 revision (multimap)
//! {type}.index.{prop}              value bytes      -> identifier (multimap)
//! {type}.index.{prop}.sort.{sort}  value||sort key  -> identifier (multimap)
//! default                          &str             -> u64 flags
//! ```
//!
//! Integer keys are stored as native `u64` (redb orders them numerically);
//! composite byte keys embed integers big-endian so byte order equals
//! numeric order.

use redb::{MultimapTableDefinition, TableDefinition};

use crate::entity::PropertyValue;
use crate::types::EntityType;

/// Current on-disk format version.
///
/// Stored under [`META_DATABASE_VERSION`]; a resource that finds an older
/// version on startup wipes and recreates all five environments.
pub const DATABASE_VERSION: u32 = 1;

/// Backlog threshold above which queue cleanup logs a warning.
pub const QUEUE_BACKLOG_WARNING: u64 = 500;

// ============================================================================
// Table Definitions
// ============================================================================

/// Maps every revision to the tag of the entity type it belongs to, so
/// replay can dispatch without parsing the entity buffer.
pub const REVISION_TYPE_TABLE: TableDefinition<u64, u8> = TableDefinition::new("revisionType");

/// Maps every revision to the identifier it wrote.
pub const REVISIONS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("revisions");

/// Maps an identifier to all revisions written for it (one entry per
/// revision; the entry for a tombstone is removed so exists-checks fail).
pub const UIDS_TO_REVISIONS_TABLE: MultimapTableDefinition<&[u8], u64> =
    MultimapTableDefinition::new("uidsToRevisions");

/// Small flag storage: max revision, cleaned-up revision, database version.
pub const DEFAULT_TABLE: TableDefinition<&str, u64> = TableDefinition::new("default");

/// Key of the largest revision ever written, in [`DEFAULT_TABLE`].
pub const META_MAX_REVISION: &str = "maxRevision";

/// Key of the revision up to which cleanup ran, in [`DEFAULT_TABLE`].
pub const META_CLEANED_UP_REVISION: &str = "cleanedUpRevision";

/// Key of the on-disk format version, in [`DEFAULT_TABLE`].
pub const META_DATABASE_VERSION: &str = "databaseVersion";

/// The `{type}.main` table holding entity buffers keyed by revision.
pub const fn main_table(ty: EntityType) -> TableDefinition<'static, u64, &'static [u8]> {
    TableDefinition::new(main_table_name(ty))
}

/// Name of the `{type}.main` table.
pub const fn main_table_name(ty: EntityType) -> &'static str {
    match ty {
        EntityType::Mail => "mail.main",
        EntityType::Folder => "folder.main",
        EntityType::Contact => "contact.main",
        EntityType::Addressbook => "addressbook.main",
        EntityType::Event => "event.main",
        EntityType::Todo => "todo.main",
        EntityType::Calendar => "calendar.main",
        EntityType::SinkResource => "sinkresource.main",
        EntityType::SinkAccount => "sinkaccount.main",
        EntityType::Identity => "identity.main",
    }
}

/// An index table resolved from a registry-derived name.
///
/// Covers value indexes (`{type}.index.{prop}`), sorted indexes
/// (`{type}.index.{prop}.sort.{sort}`) and custom secondary databases.
pub fn index_table(name: &str) -> MultimapTableDefinition<'_, &'static [u8], &'static [u8]> {
    MultimapTableDefinition::new(name)
}

/// Name of a value index table.
pub fn value_index_name(ty: EntityType, property: &str) -> String {
    format!("{}.index.{}", ty.name(), property)
}

/// Name of a sorted index table.
pub fn sorted_index_name(ty: EntityType, property: &str, sort_property: &str) -> String {
    format!("{}.index.{}.sort.{}", ty.name(), property, sort_property)
}

/// Name of a secondary (left-to-right) index table.
pub fn secondary_index_name(ty: EntityType, left: &str, right: &str) -> String {
    format!("{}.index.{}{}", ty.name(), left, right)
}

// ============================================================================
// Key Encoding Helpers
// ============================================================================

/// Encodes a property value as an index key.
///
/// Integers embed big-endian with the sign bit flipped so lexicographic
/// order equals numeric order across negative values.
pub fn index_value_bytes(value: &PropertyValue) -> Vec<u8> {
    match value {
        PropertyValue::Text(s) => s.as_bytes().to_vec(),
        PropertyValue::Bytes(b) => b.clone(),
        PropertyValue::Bool(b) => vec![u8::from(*b)],
        PropertyValue::DateTime(ms) => order_preserving_i64(*ms).to_vec(),
        PropertyValue::Reference(id) => id.as_bytes().to_vec(),
        PropertyValue::ByteList(items) => {
            let mut out = Vec::new();
            for item in items {
                out.extend_from_slice(&(item.len() as u32).to_be_bytes());
                out.extend_from_slice(item);
            }
            out
        }
    }
}

/// Encodes the key of a sorted index entry: the indexed value followed by
/// the fixed-width sort value, so a prefix scan yields ids in sort order.
pub fn sorted_index_key(value: &PropertyValue, sort_value: Option<&PropertyValue>) -> Vec<u8> {
    let mut key = index_value_bytes(value);
    key.extend_from_slice(&sort_suffix(sort_value));
    key
}

/// The fixed-width suffix a sort value contributes to a sorted index key.
///
/// Absent sort values order first.
pub fn sort_suffix(sort_value: Option<&PropertyValue>) -> [u8; 8] {
    match sort_value {
        Some(PropertyValue::DateTime(ms)) => order_preserving_i64(*ms),
        Some(PropertyValue::Bool(b)) => {
            let mut out = [0u8; 8];
            out[7] = u8::from(*b);
            out
        }
        Some(other) => {
            // Truncate/pad textual sort values to the fixed width.
            let bytes = index_value_bytes(other);
            let mut out = [0u8; 8];
            let n = bytes.len().min(8);
            out[..n].copy_from_slice(&bytes[..n]);
            out
        }
        None => [0u8; 8],
    }
}

/// Big-endian encoding of an `i64` with the sign bit flipped, preserving
/// numeric order under byte comparison.
pub fn order_preserving_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ (1 << 63)).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn version_is_current() {
        assert_eq!(DATABASE_VERSION, 1);
    }

    #[test]
    fn table_names_follow_layout() {
        assert_eq!(main_table_name(EntityType::Mail), "mail.main");
        assert_eq!(value_index_name(EntityType::Mail, "messageId"), "mail.index.messageId");
        assert_eq!(
            sorted_index_name(EntityType::Mail, "folder", "date"),
            "mail.index.folder.sort.date"
        );
        assert_eq!(
            secondary_index_name(EntityType::Mail, "messageId", "threadId"),
            "mail.index.messageIdthreadId"
        );
    }

    #[test]
    fn datetime_index_bytes_order() {
        let early = index_value_bytes(&PropertyValue::DateTime(-1000));
        let epoch = index_value_bytes(&PropertyValue::DateTime(0));
        let late = index_value_bytes(&PropertyValue::DateTime(1000));
        assert!(early < epoch);
        assert!(epoch < late);
    }

    #[test]
    fn sorted_index_key_groups_by_value_then_sort() {
        let folder = PropertyValue::Bytes(vec![7; 16]);
        let k1 = sorted_index_key(&folder, Some(&PropertyValue::DateTime(100)));
        let k2 = sorted_index_key(&folder, Some(&PropertyValue::DateTime(200)));
        assert!(k1 < k2);
        assert!(k1.starts_with(&index_value_bytes(&folder)));
    }

    #[test]
    fn missing_sort_value_orders_first() {
        let v = PropertyValue::Text("a".into());
        let none = sorted_index_key(&v, None);
        let some = sorted_index_key(&v, Some(&PropertyValue::DateTime(0)));
        assert!(none < some);
    }

    proptest! {
        #[test]
        fn order_preserving_i64_matches_numeric_order(a in any::<i64>(), b in any::<i64>()) {
            prop_assert_eq!(a.cmp(&b), order_preserving_i64(a).cmp(&order_preserving_i64(b)));
        }
    }
}
