//! Integration tests for the query executor: initial runs, incremental
//! updates, reduction (threading), bloom, reference resolution, pagination.

use std::sync::Arc;

use sinkstore::registry::TypeRegistry;
use sinkstore::storage::Environment;
use sinkstore::{
    AggregateValue, Aggregator, Comparator, Entity, EntityStore, EntityType, FilterStage,
    Identifier, Operation, Properties, PropertyValue, Query, QueryRunner, Reduce, Selector,
};
use tempfile::{tempdir, TempDir};

struct Fixture {
    store: EntityStore,
    _dir: TempDir,
}

fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let env = Arc::new(Environment::open(dir.path().join("instance1")).unwrap());
    let registry = Arc::new(TypeRegistry::standard());
    let mut store = EntityStore::new(env, registry);
    store.initialize().unwrap();
    Fixture { store, _dir: dir }
}

fn add_mail(
    store: &mut EntityStore,
    message_id: &str,
    parent: Option<&str>,
    date: i64,
    folder: Option<Identifier>,
) -> Identifier {
    let mut entity = Entity::new(Identifier::new());
    entity.set_property("subject", format!("mail {message_id}"));
    entity.set_property(
        "messageId",
        PropertyValue::Bytes(message_id.as_bytes().to_vec()),
    );
    if let Some(parent) = parent {
        entity.set_property(
            "parentMessageId",
            PropertyValue::Bytes(parent.as_bytes().to_vec()),
        );
    }
    entity.set_property("date", PropertyValue::DateTime(date));
    if let Some(folder) = folder {
        entity.set_property("folder", folder);
    }
    let id = entity.id;
    store.start_transaction().unwrap();
    store.add(EntityType::Mail, entity, true).unwrap();
    store.commit_transaction().unwrap();
    id
}

fn threaded_query() -> Query {
    Query::for_type(EntityType::Mail).reduce(Reduce {
        property: "threadId".into(),
        selector: Selector::max("date"),
        aggregators: vec![Aggregator::count("count")],
        property_selectors: vec![],
    })
}

fn count_of(result: &sinkstore::QueryResult) -> u64 {
    match result.aggregates.get("count") {
        Some(AggregateValue::Count(n)) => *n,
        other => panic!("missing count aggregate: {other:?}"),
    }
}

// ============================================================================
// Threading (reduction)
// ============================================================================

#[test]
fn reduction_collapses_thread_to_representative() {
    let mut f = fixture();
    add_mail(&mut f.store, "a", None, 1, None);
    add_mail(&mut f.store, "b", Some("a"), 2, None);
    let c = add_mail(&mut f.store, "c", Some("b"), 3, None);

    let mut runner = QueryRunner::new(threaded_query(), &f.store).unwrap();
    let results = runner.initial(&f.store).unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results.results[0].entity.id, c);
    assert_eq!(count_of(&results.results[0]), 3);
    assert_eq!(results.results[0].aggregate_ids.len(), 3);
}

#[test]
fn incremental_reduction_with_newer_representative() {
    let mut f = fixture();
    add_mail(&mut f.store, "a", None, 1, None);
    add_mail(&mut f.store, "b", Some("a"), 2, None);
    let c = add_mail(&mut f.store, "c", Some("b"), 3, None);

    let mut runner = QueryRunner::new(threaded_query(), &f.store).unwrap();
    runner.initial(&f.store).unwrap();

    // A newer sibling takes over as representative.
    let d = add_mail(&mut f.store, "d", Some("a"), 4, None);
    let update = runner.update(&f.store).unwrap();

    // Representative identity changed: removal of the old, creation of the
    // new, with the grown aggregate.
    let ops: Vec<(Identifier, Operation)> = update
        .results
        .iter()
        .map(|r| (r.entity.id, r.operation))
        .collect();
    assert!(ops.contains(&(c, Operation::Removal)));
    assert!(ops.contains(&(d, Operation::Creation)));
    let creation = update
        .results
        .iter()
        .find(|r| r.operation == Operation::Creation)
        .unwrap();
    assert_eq!(count_of(creation), 4);
}

#[test]
fn incremental_reduction_with_older_sibling() {
    let mut f = fixture();
    add_mail(&mut f.store, "a", None, 10, None);
    let b = add_mail(&mut f.store, "b", Some("a"), 20, None);

    let mut runner = QueryRunner::new(threaded_query(), &f.store).unwrap();
    runner.initial(&f.store).unwrap();

    // An older mail joins; the representative stays put.
    add_mail(&mut f.store, "c", Some("a"), 5, None);
    let update = runner.update(&f.store).unwrap();

    assert_eq!(update.len(), 1);
    assert_eq!(update.results[0].entity.id, b);
    assert_eq!(update.results[0].operation, Operation::Modification);
    assert_eq!(count_of(&update.results[0]), 3);
}

#[test]
fn removing_representative_reselects() {
    let mut f = fixture();
    add_mail(&mut f.store, "a", None, 1, None);
    let b = add_mail(&mut f.store, "b", Some("a"), 2, None);

    let mut runner = QueryRunner::new(threaded_query(), &f.store).unwrap();
    let initial = runner.initial(&f.store).unwrap();
    assert_eq!(initial.results[0].entity.id, b);

    let current = f.store.read_latest(EntityType::Mail, b).unwrap().unwrap();
    f.store.start_transaction().unwrap();
    f.store.remove(EntityType::Mail, &current, true).unwrap();
    f.store.commit_transaction().unwrap();

    let update = runner.update(&f.store).unwrap();
    let ops: Vec<Operation> = update.results.iter().map(|r| r.operation).collect();
    assert!(ops.contains(&Operation::Removal));
    assert!(ops.contains(&Operation::Creation));
    let creation = update
        .results
        .iter()
        .find(|r| r.operation == Operation::Creation)
        .unwrap();
    assert_eq!(count_of(creation), 1);
}

#[test]
fn thread_merge_joins_disjoint_threads() {
    let mut f = fixture();
    // Two threads start independently: "a" on its own, "c" referencing the
    // not-yet-seen "b".
    let a = add_mail(&mut f.store, "a", None, 1, None);
    let c = add_mail(&mut f.store, "c", Some("b"), 3, None);

    let thread_of = |store: &EntityStore, id: Identifier| {
        store
            .read_latest(EntityType::Mail, id)
            .unwrap()
            .unwrap()
            .property("threadId")
            .cloned()
            .unwrap()
    };
    assert_ne!(thread_of(&f.store, a), thread_of(&f.store, c));

    // "b" connects them: child of "a", parent of "c".
    let b = add_mail(&mut f.store, "b", Some("a"), 2, None);

    let thread = thread_of(&f.store, a);
    assert_eq!(thread_of(&f.store, b), thread);
    assert_eq!(thread_of(&f.store, c), thread);
}

#[test]
fn thread_merge_retracts_orphaned_group() {
    let mut f = fixture();
    let a = add_mail(&mut f.store, "a", None, 1, None);
    let c = add_mail(&mut f.store, "c", Some("b"), 3, None);

    let mut runner = QueryRunner::new(threaded_query(), &f.store).unwrap();
    let initial = runner.initial(&f.store).unwrap();
    // Two disjoint threads, one representative each.
    assert_eq!(initial.len(), 2);

    // The connecting mail merges the child thread into the parent thread
    // without giving "a" or "c" a new revision.
    add_mail(&mut f.store, "b", Some("a"), 2, None);
    let update = runner.update(&f.store).unwrap();

    // The absorbed thread's representative is retracted before the merged
    // thread emits it again as its own representative.
    let removals: Vec<Identifier> = update
        .results
        .iter()
        .filter(|r| r.operation == Operation::Removal)
        .map(|r| r.entity.id)
        .collect();
    assert!(removals.contains(&a));
    assert!(removals.contains(&c));

    let creations: Vec<&sinkstore::QueryResult> = update
        .results
        .iter()
        .filter(|r| r.operation == Operation::Creation)
        .collect();
    assert_eq!(creations.len(), 1);
    assert_eq!(creations[0].entity.id, c);
    assert_eq!(count_of(creations[0]), 3);
    assert_eq!(creations[0].aggregate_ids.len(), 3);

    // The shared representative ends up present: its retraction precedes
    // its re-emission for the merged thread.
    let c_removal = update
        .results
        .iter()
        .position(|r| r.entity.id == c && r.operation == Operation::Removal)
        .unwrap();
    let c_creation = update
        .results
        .iter()
        .position(|r| r.entity.id == c && r.operation == Operation::Creation)
        .unwrap();
    assert!(c_removal < c_creation);
}

#[test]
fn moving_entity_between_groups_updates_both() {
    let mut f = fixture();
    let folder_a = Identifier::new();
    let folder_b = Identifier::new();
    let m1 = add_mail(&mut f.store, "m1", None, 1, Some(folder_a));
    let m2 = add_mail(&mut f.store, "m2", None, 2, Some(folder_a));
    let m3 = add_mail(&mut f.store, "m3", None, 3, Some(folder_b));

    let query = Query::for_type(EntityType::Mail).reduce(Reduce {
        property: "folder".into(),
        selector: Selector::max("date"),
        aggregators: vec![Aggregator::count("count")],
        property_selectors: vec![],
    });
    let mut runner = QueryRunner::new(query, &f.store).unwrap();
    assert_eq!(runner.initial(&f.store).unwrap().len(), 2);

    // m2 changes folder; both the group it left and the one it joined
    // re-reduce.
    let mut delta = Properties::new();
    delta.insert("folder".into(), PropertyValue::Reference(folder_b));
    f.store.start_transaction().unwrap();
    f.store
        .modify(EntityType::Mail, m2, &delta, &[], true)
        .unwrap();
    f.store.commit_transaction().unwrap();

    let update = runner.update(&f.store).unwrap();
    let changes: Vec<(Identifier, Operation, u64)> = update
        .results
        .iter()
        .map(|r| {
            let count = match r.aggregates.get("count") {
                Some(AggregateValue::Count(n)) => *n,
                _ => 0,
            };
            (r.entity.id, r.operation, count)
        })
        .collect();

    // Joined group: representative m3 stays, membership grew to two.
    assert!(changes.contains(&(m3, Operation::Modification, 2)));
    // Left group: old representative m2 retracted, m1 takes over alone.
    assert!(changes.contains(&(m1, Operation::Creation, 1)));
    assert!(update
        .results
        .iter()
        .any(|r| r.entity.id == m2 && r.operation == Operation::Removal));
}

// ============================================================================
// Filters
// ============================================================================

#[test]
fn filter_mismatch_emits_synthetic_removal() {
    let mut f = fixture();
    let folder_a = Identifier::new();
    let folder_b = Identifier::new();
    let id = add_mail(&mut f.store, "m", None, 1, Some(folder_a));

    let query = Query::for_type(EntityType::Mail)
        .filter("folder", Comparator::Equals(folder_a.into()));
    let mut runner = QueryRunner::new(query, &f.store).unwrap();
    assert_eq!(runner.initial(&f.store).unwrap().len(), 1);

    // Move the mail to another folder; the live set must shrink.
    let mut delta = Properties::new();
    delta.insert("folder".into(), PropertyValue::Reference(folder_b));
    f.store.start_transaction().unwrap();
    f.store
        .modify(EntityType::Mail, id, &delta, &[], true)
        .unwrap();
    f.store.commit_transaction().unwrap();

    let update = runner.update(&f.store).unwrap();
    assert_eq!(update.len(), 1);
    assert_eq!(update.results[0].operation, Operation::Removal);
    assert_eq!(update.results[0].entity.id, id);
}

#[test]
fn initial_and_incremental_from_zero_agree() {
    let mut f = fixture();
    let folder = Identifier::new();
    add_mail(&mut f.store, "x", None, 1, Some(folder));
    add_mail(&mut f.store, "y", None, 2, Some(folder));
    add_mail(&mut f.store, "z", None, 3, None);

    let query = Query::for_type(EntityType::Mail)
        .filter("folder", Comparator::Equals(folder.into()));

    let mut initial = QueryRunner::new(query.clone(), &f.store).unwrap();
    let mut ids_initial = initial.initial(&f.store).unwrap().ids();
    ids_initial.sort();

    // An incremental run over the full history sees the same set.
    let mut from_zero = sinkstore::DataStoreQuery::new(&query, &f.store).unwrap();
    let mut ids_incremental: Vec<Identifier> = from_zero
        .update(&f.store, 0)
        .unwrap()
        .results
        .iter()
        .filter(|r| r.operation != Operation::Removal)
        .map(|r| r.entity.id)
        .collect();
    ids_incremental.sort();

    assert_eq!(ids_initial, ids_incremental);
}

// ============================================================================
// Bloom
// ============================================================================

#[test]
fn bloom_expands_to_whole_thread() {
    let mut f = fixture();
    add_mail(&mut f.store, "a", None, 1, None);
    let b = add_mail(&mut f.store, "b", Some("a"), 2, None);
    add_mail(&mut f.store, "c", Some("b"), 3, None);
    add_mail(&mut f.store, "other", None, 9, None);

    let mut query = Query::for_type(EntityType::Mail).bloom("threadId");
    query.ids = vec![b];
    let mut runner = QueryRunner::new(query, &f.store).unwrap();
    let results = runner.initial(&f.store).unwrap();

    assert_eq!(results.len(), 3);
}

// ============================================================================
// Reference resolution
// ============================================================================

#[test]
fn reference_resolver_collects_ancestor_names() {
    let mut f = fixture();

    let mut root = Entity::new(Identifier::new());
    root.set_property("name", "root");
    let root_id = root.id;
    let mut child = Entity::new(Identifier::new());
    child.set_property("name", "child");
    child.set_property("parent", root_id);
    let child_id = child.id;
    let mut leaf = Entity::new(Identifier::new());
    leaf.set_property("name", "leaf");
    leaf.set_property("parent", child_id);
    let leaf_id = leaf.id;

    f.store.start_transaction().unwrap();
    f.store.add(EntityType::Folder, root, true).unwrap();
    f.store.add(EntityType::Folder, child, true).unwrap();
    f.store.add(EntityType::Folder, leaf, true).unwrap();
    f.store.commit_transaction().unwrap();

    let mut query = Query::for_type(EntityType::Folder);
    query.ids = vec![leaf_id];
    query.stages.push(FilterStage::ReferenceResolver {
        reference_property: "parent".into(),
        aggregators: vec![Aggregator::collect("name", "ancestorNames")],
    });

    let mut runner = QueryRunner::new(query, &f.store).unwrap();
    let results = runner.initial(&f.store).unwrap();
    assert_eq!(results.len(), 1);
    match results.results[0].aggregates.get("ancestorNames") {
        Some(AggregateValue::Collect(names)) => {
            assert_eq!(
                names,
                &vec![
                    PropertyValue::Text("child".into()),
                    PropertyValue::Text("root".into())
                ]
            );
        }
        other => panic!("missing ancestor names: {other:?}"),
    }
}

// ============================================================================
// Sorting and pagination
// ============================================================================

#[test]
fn sorted_index_orders_results_by_date() {
    let mut f = fixture();
    let folder = Identifier::new();
    let m2 = add_mail(&mut f.store, "m2", None, 200, Some(folder));
    let m1 = add_mail(&mut f.store, "m1", None, 100, Some(folder));
    let m3 = add_mail(&mut f.store, "m3", None, 300, Some(folder));

    let query = Query::for_type(EntityType::Mail)
        .filter("folder", Comparator::Equals(folder.into()))
        .sorted_by("date");
    let mut runner = QueryRunner::new(query, &f.store).unwrap();
    let results = runner.initial(&f.store).unwrap();

    assert_eq!(results.ids(), vec![m1, m2, m3]);
}

#[test]
fn limit_batches_and_fetch_more_continues() {
    let mut f = fixture();
    for i in 0..5 {
        add_mail(&mut f.store, &format!("m{i}"), None, i, None);
    }

    let query = Query::for_type(EntityType::Mail).with_limit(2);
    let mut runner = QueryRunner::new(query, &f.store).unwrap();

    let first = runner.initial(&f.store).unwrap();
    let second = runner.fetch_more(&f.store).unwrap();
    let third = runner.fetch_more(&f.store).unwrap();
    let fourth = runner.fetch_more(&f.store).unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    assert_eq!(third.len(), 1);
    assert_eq!(fourth.len(), 0);

    let mut all: Vec<Identifier> = first
        .ids()
        .into_iter()
        .chain(second.ids())
        .chain(third.ids())
        .collect();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 5);
}

// ============================================================================
// Fulltext
// ============================================================================

#[test]
fn fulltext_initial_and_incremental_agree() {
    let mut f = fixture();
    let mut hit = Entity::new(Identifier::new());
    hit.set_property("subject", "quarterly budget review");
    hit.set_property("messageId", PropertyValue::Bytes(b"h".to_vec()));
    let hit_id = hit.id;
    let mut miss = Entity::new(Identifier::new());
    miss.set_property("subject", "lunch plans");
    miss.set_property("messageId", PropertyValue::Bytes(b"m".to_vec()));

    f.store.start_transaction().unwrap();
    f.store.add(EntityType::Mail, hit, true).unwrap();
    f.store.add(EntityType::Mail, miss, true).unwrap();
    f.store.commit_transaction().unwrap();

    let query = Query::for_type(EntityType::Mail)
        .filter("subject", Comparator::Fulltext("budget".into()));
    let mut runner = QueryRunner::new(query.clone(), &f.store).unwrap();
    assert_eq!(runner.initial(&f.store).unwrap().ids(), vec![hit_id]);

    // The incremental path goes through per-id fulltext lookups and must
    // agree with the scan.
    let mut from_zero = sinkstore::DataStoreQuery::new(&query, &f.store).unwrap();
    let incremental = from_zero.update(&f.store, 0).unwrap();
    let live: Vec<Identifier> = incremental
        .results
        .iter()
        .filter(|r| r.operation != Operation::Removal)
        .map(|r| r.entity.id)
        .collect();
    assert_eq!(live, vec![hit_id]);
}

// ============================================================================
// Subqueries
// ============================================================================

#[test]
fn subquery_resolves_to_id_set() {
    let mut f = fixture();
    let mut inbox = Entity::new(Identifier::new());
    inbox.set_property("name", "inbox");
    let inbox_id = inbox.id;
    let mut spam = Entity::new(Identifier::new());
    spam.set_property("name", "spam");
    let spam_id = spam.id;

    f.store.start_transaction().unwrap();
    f.store.add(EntityType::Folder, inbox, true).unwrap();
    f.store.add(EntityType::Folder, spam, true).unwrap();
    f.store.commit_transaction().unwrap();

    let wanted = add_mail(&mut f.store, "w", None, 1, Some(inbox_id));
    add_mail(&mut f.store, "u", None, 2, Some(spam_id));

    let folder_query = Query::for_type(EntityType::Folder)
        .filter("name", Comparator::Equals(PropertyValue::Text("inbox".into())));
    let query = Query::for_type(EntityType::Mail)
        .filter("folder", Comparator::Subquery(Box::new(folder_query)));

    let mut runner = QueryRunner::new(query, &f.store).unwrap();
    assert_eq!(runner.initial(&f.store).unwrap().ids(), vec![wanted]);
}
