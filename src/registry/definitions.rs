//! Standard entity-type declarations.
//!
//! One declaration per entity type: property set, indexes, custom indexers.
//! Mail carries the interesting configuration (date and folder-by-date
//! sorted indexes, threading, fulltext); most other types only index their
//! natural lookup key.

use super::{
    FulltextIndexer, IndexKind, IndexProperty, PropertyDecl, PropertyKind, ThreadIndexer,
    TypeDefinition,
};
use crate::types::EntityType;

const fn prop(name: &'static str, kind: PropertyKind) -> PropertyDecl {
    PropertyDecl { name, kind }
}

fn mail() -> TypeDefinition {
    TypeDefinition::new(
        EntityType::Mail,
        vec![
            prop("sender", PropertyKind::Text),
            prop("to", PropertyKind::ByteList),
            prop("cc", PropertyKind::ByteList),
            prop("bcc", PropertyKind::ByteList),
            prop("subject", PropertyKind::Text),
            prop("date", PropertyKind::DateTime),
            prop("unread", PropertyKind::Bool),
            prop("important", PropertyKind::Bool),
            prop("folder", PropertyKind::Reference),
            prop("mimeMessage", PropertyKind::Bytes),
            prop("fullPayloadAvailable", PropertyKind::Bool),
            prop("draft", PropertyKind::Bool),
            prop("trash", PropertyKind::Bool),
            prop("sent", PropertyKind::Bool),
            prop("messageId", PropertyKind::Bytes),
            prop("parentMessageId", PropertyKind::Bytes),
        ],
    )
    .with_index(IndexKind::Sorted {
        property: "",
        sort_property: "date",
    })
    .with_index(IndexKind::Value { property: "folder" })
    .with_index(IndexKind::Value {
        property: "parentMessageId",
    })
    .with_index(IndexKind::Value {
        property: "messageId",
    })
    .with_index(IndexKind::Value { property: "draft" })
    .with_index(IndexKind::Sorted {
        property: "folder",
        sort_property: "date",
    })
    .with_index(IndexKind::Secondary {
        left: "messageId",
        right: "threadId",
    })
    .with_index(IndexKind::Secondary {
        left: "threadId",
        right: "messageId",
    })
    .with_index_property(IndexProperty {
        name: "threadId",
        source_property: "messageId",
        left: "messageId",
        right: "threadId",
    })
    .with_custom_indexer(Box::new(ThreadIndexer))
    .with_custom_indexer(Box::new(FulltextIndexer))
}

fn folder() -> TypeDefinition {
    TypeDefinition::new(
        EntityType::Folder,
        vec![
            prop("parent", PropertyKind::Reference),
            prop("name", PropertyKind::Text),
            prop("icon", PropertyKind::Text),
            prop("specialpurpose", PropertyKind::ByteList),
            prop("enabled", PropertyKind::Bool),
        ],
    )
    .with_index(IndexKind::Value { property: "name" })
    .with_index(IndexKind::Value { property: "parent" })
}

fn contact() -> TypeDefinition {
    TypeDefinition::new(
        EntityType::Contact,
        vec![
            prop("uid", PropertyKind::Bytes),
            prop("fn", PropertyKind::Text),
            prop("emails", PropertyKind::ByteList),
            prop("vcard", PropertyKind::Bytes),
            prop("addressbook", PropertyKind::Reference),
            prop("firstname", PropertyKind::Text),
            prop("lastname", PropertyKind::Text),
            prop("photo", PropertyKind::Bytes),
        ],
    )
    .with_index(IndexKind::Value { property: "uid" })
}

fn addressbook() -> TypeDefinition {
    TypeDefinition::new(
        EntityType::Addressbook,
        vec![
            prop("parent", PropertyKind::Reference),
            prop("name", PropertyKind::Text),
        ],
    )
    .with_index(IndexKind::Value { property: "parent" })
}

fn event() -> TypeDefinition {
    TypeDefinition::new(
        EntityType::Event,
        vec![
            prop("summary", PropertyKind::Text),
            prop("description", PropertyKind::Text),
            prop("uid", PropertyKind::Bytes),
            prop("startTime", PropertyKind::DateTime),
            prop("endTime", PropertyKind::DateTime),
            prop("allDay", PropertyKind::Bool),
            prop("ical", PropertyKind::Bytes),
            prop("calendar", PropertyKind::Reference),
        ],
    )
    .with_index(IndexKind::Value { property: "uid" })
    .with_index(IndexKind::Sorted {
        property: "",
        sort_property: "startTime",
    })
}

fn todo() -> TypeDefinition {
    TypeDefinition::new(
        EntityType::Todo,
        vec![
            prop("uid", PropertyKind::Bytes),
            prop("summary", PropertyKind::Text),
            prop("description", PropertyKind::Text),
            prop("completedDate", PropertyKind::DateTime),
            prop("dueDate", PropertyKind::DateTime),
            prop("startDate", PropertyKind::DateTime),
            prop("status", PropertyKind::Text),
            prop("priority", PropertyKind::Text),
            prop("categories", PropertyKind::ByteList),
            prop("ical", PropertyKind::Bytes),
            prop("calendar", PropertyKind::Reference),
        ],
    )
    .with_index(IndexKind::Value { property: "uid" })
}

fn calendar() -> TypeDefinition {
    TypeDefinition::new(
        EntityType::Calendar,
        vec![prop("name", PropertyKind::Text)],
    )
    .with_index(IndexKind::Value { property: "name" })
}

fn sink_resource() -> TypeDefinition {
    TypeDefinition::new(
        EntityType::SinkResource,
        vec![
            prop("resourceType", PropertyKind::Bytes),
            prop("account", PropertyKind::Reference),
            prop("capabilities", PropertyKind::ByteList),
        ],
    )
    .with_index(IndexKind::Value { property: "account" })
}

fn sink_account() -> TypeDefinition {
    TypeDefinition::new(
        EntityType::SinkAccount,
        vec![
            prop("accountType", PropertyKind::Text),
            prop("name", PropertyKind::Text),
            prop("icon", PropertyKind::Text),
        ],
    )
    .with_index(IndexKind::Value {
        property: "accountType",
    })
}

fn identity() -> TypeDefinition {
    TypeDefinition::new(
        EntityType::Identity,
        vec![
            prop("name", PropertyKind::Text),
            prop("address", PropertyKind::Text),
            prop("account", PropertyKind::Reference),
        ],
    )
    .with_index(IndexKind::Value { property: "account" })
}

/// All ten standard declarations.
pub fn standard_definitions() -> Vec<TypeDefinition> {
    vec![
        mail(),
        folder(),
        contact(),
        addressbook(),
        event(),
        todo(),
        calendar(),
        sink_resource(),
        sink_account(),
        identity(),
    ]
}
