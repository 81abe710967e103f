//! Query execution: a linear pipeline of filter nodes over a source.
//!
//! The compiled form is a [`SourceNode`] (fixed ids, index lookup result or
//! full scan) followed by stage nodes. The source pulls one identifier at a
//! time; every stage transforms the stream, so a single input may produce
//! zero, one or several outputs (a reduce emitting a removal plus a
//! creation, a bloom expanding to a whole group).
//!
//! The same compiled pipeline serves the initial run and every incremental
//! update; [`DataStoreQuery`] is the externalized state, so a paginated or
//! long-lived query resumes without recompiling.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::trace;

use crate::entity::{Entity, PropertyValue};
use crate::error::Result;
use crate::query::{
    Aggregator, AggregationOperation, Comparator, FilterStage, Query, Reduce, Selector,
};
use crate::store::EntityStore;
use crate::storage::schema;
use crate::types::{EntityType, Identifier, Key, Operation};

/// An aggregate attached to a query result.
#[derive(Clone, Debug, PartialEq)]
pub enum AggregateValue {
    /// Number of group members.
    Count(u64),
    /// Collected property values of the group members.
    Collect(Vec<PropertyValue>),
    /// A single selected value.
    Value(PropertyValue),
}

/// One emission of the pipeline.
#[derive(Clone, Debug)]
pub struct QueryResult {
    /// The entity, read at its latest revision.
    pub entity: Entity,
    /// What the emission means relative to the caller's result set.
    pub operation: Operation,
    /// Aggregates from reduce/reference stages.
    pub aggregates: BTreeMap<String, AggregateValue>,
    /// Group member ids contributing to the aggregates.
    pub aggregate_ids: Vec<Identifier>,
}

impl QueryResult {
    fn plain(entity: Entity, operation: Operation) -> Self {
        Self {
            entity,
            operation,
            aggregates: BTreeMap::new(),
            aggregate_ids: Vec::new(),
        }
    }
}

/// A drained batch of results.
#[derive(Clone, Debug, Default)]
pub struct ResultSet {
    /// Results in emission order.
    pub results: Vec<QueryResult>,
}

impl ResultSet {
    /// Number of results.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// True if nothing was emitted.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Identifiers in emission order.
    pub fn ids(&self) -> Vec<Identifier> {
        self.results.iter().map(|r| r.entity.id).collect()
    }
}

struct QueryContext<'a> {
    store: &'a EntityStore,
    ty: EntityType,
    incremental: bool,
}

impl QueryContext<'_> {
    fn read_latest(&self, id: Identifier) -> Result<Option<Entity>> {
        self.store.read_latest(self.ty, id)
    }

    fn read_previous(&self, entity: &Entity) -> Result<Option<Entity>> {
        match self
            .store
            .read_previous(self.ty, entity.id, entity.metadata.revision)
        {
            Ok(previous) => Ok(Some(previous)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn index_lookup(
        &self,
        property: &str,
        value: &PropertyValue,
        filter: &[Identifier],
    ) -> Result<Vec<Identifier>> {
        self.store
            .index_lookup_property(self.ty, property, value, filter)
    }
}

// ============================================================================
// Source
// ============================================================================

struct SourceNode {
    ids: Vec<Identifier>,
    cursor: usize,
    ids_are_final: bool,
    incremental_ids: Vec<Identifier>,
    incremental_cursor: usize,
    have_incremental: bool,
}

impl SourceNode {
    fn new(ids: Vec<Identifier>, ids_are_final: bool) -> Self {
        Self {
            ids,
            cursor: 0,
            ids_are_final,
            incremental_ids: Vec::new(),
            incremental_cursor: 0,
            have_incremental: false,
        }
    }

    /// Feeds the changed keys of an incremental update. When the initial id
    /// set was final, changes outside it are pre-filtered away.
    fn add(&mut self, keys: &[Key]) {
        self.incremental_ids.clear();
        let mut seen = HashSet::new();
        for key in keys {
            if self.ids_are_final && !self.ids.contains(&key.id) {
                continue;
            }
            // Each changed identifier is observed exactly once, at its
            // latest revision.
            if seen.insert(key.id) {
                self.incremental_ids.push(key.id);
            }
        }
        self.incremental_cursor = 0;
        self.have_incremental = true;
    }

    fn reset_incremental(&mut self) {
        self.incremental_ids.clear();
        self.incremental_cursor = 0;
        self.have_incremental = false;
    }

    fn next(&mut self, ctx: &QueryContext<'_>) -> Result<Option<QueryResult>> {
        loop {
            let id = if self.have_incremental {
                let Some(id) = self.incremental_ids.get(self.incremental_cursor) else {
                    return Ok(None);
                };
                self.incremental_cursor += 1;
                *id
            } else {
                let Some(id) = self.ids.get(self.cursor) else {
                    return Ok(None);
                };
                self.cursor += 1;
                *id
            };
            match ctx.read_latest(id)? {
                Some(entity) => {
                    let operation = entity.metadata.operation;
                    trace!(%id, ?operation, "Source read entity");
                    return Ok(Some(QueryResult::plain(entity, operation)));
                }
                // Cleaned up under us; nothing to report for this id.
                None => continue,
            }
        }
    }
}

// ============================================================================
// Stages
// ============================================================================

fn property_of(entity: &Entity, path: &str) -> Option<PropertyValue> {
    entity.property(path).cloned()
}

fn matches_filters(
    filters: &BTreeMap<String, Comparator>,
    entity: &Entity,
    ctx: &QueryContext<'_>,
) -> Result<bool> {
    for (property, comparator) in filters {
        if let Comparator::Fulltext(term) = comparator {
            // The fulltext index was the initial source set; only
            // incremental runs must re-check it, per id.
            if ctx.incremental {
                let matches = ctx.store.fulltext_lookup(ctx.ty, term, &[entity.id])?;
                if !matches.contains(&entity.id) {
                    return Ok(false);
                }
            }
            continue;
        }
        let value = property_of(entity, property);
        if !comparator.matches(value.as_ref()) {
            return Ok(false);
        }
    }
    Ok(true)
}

struct FilterNode {
    filters: BTreeMap<String, Comparator>,
}

impl FilterNode {
    fn feed(
        &mut self,
        input: QueryResult,
        ctx: &QueryContext<'_>,
        out: &mut Vec<QueryResult>,
    ) -> Result<()> {
        // Removals always pass; the data they would be matched against is
        // gone.
        if input.operation == Operation::Removal {
            out.push(input);
            return Ok(());
        }
        if matches_filters(&self.filters, &input.entity, ctx)? {
            out.push(input);
        } else {
            // The caller may hold this entity from an earlier revision, so
            // report a removal to let live result sets shrink.
            out.push(QueryResult {
                operation: Operation::Removal,
                ..input
            });
        }
        Ok(())
    }
}

struct ReductionOutcome {
    selection: Option<Identifier>,
    aggregate_ids: Vec<Identifier>,
    aggregates: BTreeMap<String, AggregateValue>,
}

struct SelectedGroup {
    value: PropertyValue,
    representative: Identifier,
}

struct ReduceNode {
    reduction_property: String,
    selector: Selector,
    aggregators: Vec<Aggregator>,
    property_selectors: Vec<crate::query::PropertySelector>,
    filters: BTreeMap<String, Comparator>,
    reduced_values: HashSet<Vec<u8>>,
    incrementally_reduced: HashSet<Vec<u8>>,
    selected_values: HashMap<Vec<u8>, SelectedGroup>,
}

impl ReduceNode {
    fn new(reduce: Reduce, filters: BTreeMap<String, Comparator>) -> Self {
        Self {
            reduction_property: reduce.property,
            selector: reduce.selector,
            aggregators: reduce.aggregators,
            property_selectors: reduce.property_selectors,
            filters,
            reduced_values: HashSet::new(),
            incrementally_reduced: HashSet::new(),
            selected_values: HashMap::new(),
        }
    }

    fn reduce_on_value(
        &self,
        reduction_value: &PropertyValue,
        ctx: &QueryContext<'_>,
    ) -> Result<ReductionOutcome> {
        let mut aggregate_ids = Vec::new();
        let mut counts: HashMap<&str, u64> = HashMap::new();
        let mut collections: HashMap<&str, Vec<PropertyValue>> = HashMap::new();
        let mut selection: Option<(Identifier, PropertyValue)> = None;
        let mut property_selections: HashMap<&str, (PropertyValue, PropertyValue)> = HashMap::new();

        let members = ctx.index_lookup(&self.reduction_property, reduction_value, &[])?;
        for member in members {
            let Some(entity) = ctx.read_latest(member)? else {
                continue;
            };
            if entity.is_tombstone() {
                continue;
            }
            // The index lookup was unfiltered, so every filter up to the
            // reduction applies here.
            if !matches_filters(&self.filters, &entity, ctx)? {
                continue;
            }
            aggregate_ids.push(member);

            for aggregator in &self.aggregators {
                match aggregator.operation {
                    AggregationOperation::Count => {
                        *counts.entry(aggregator.result_property.as_str()).or_default() += 1;
                    }
                    AggregationOperation::Collect => {
                        if let Some(property) = &aggregator.property {
                            if let Some(value) = property_of(&entity, property) {
                                collections
                                    .entry(aggregator.result_property.as_str())
                                    .or_default()
                                    .push(value);
                            }
                        }
                    }
                }
            }

            let selection_value = property_of(&entity, &self.selector.property);
            if let Some(selection_value) = selection_value {
                for ps in &self.property_selectors {
                    if let Some(candidate) = property_of(&entity, &ps.property) {
                        match property_selections.get(ps.result_property.as_str()) {
                            Some((_, current))
                                if !ps.comparator.prefers(&selection_value, current) => {}
                            _ => {
                                property_selections.insert(
                                    ps.result_property.as_str(),
                                    (candidate, selection_value.clone()),
                                );
                            }
                        }
                    }
                }
                let replace = match &selection {
                    None => true,
                    Some((_, current)) => self.selector.comparator.prefers(&selection_value, current),
                };
                if replace {
                    selection = Some((entity.id, selection_value));
                }
            }
        }

        let mut aggregates = BTreeMap::new();
        for aggregator in &self.aggregators {
            let value = match aggregator.operation {
                AggregationOperation::Count => AggregateValue::Count(
                    counts.get(aggregator.result_property.as_str()).copied().unwrap_or(0),
                ),
                AggregationOperation::Collect => AggregateValue::Collect(
                    collections
                        .remove(aggregator.result_property.as_str())
                        .unwrap_or_default(),
                ),
            };
            aggregates.insert(aggregator.result_property.clone(), value);
        }
        for ps in &self.property_selectors {
            if let Some((value, _)) = property_selections.remove(ps.result_property.as_str()) {
                aggregates.insert(ps.result_property.clone(), AggregateValue::Value(value));
            }
        }

        Ok(ReductionOutcome {
            selection: selection.map(|(id, _)| id),
            aggregate_ids,
            aggregates,
        })
    }

    /// The group values an input touches: the entity's current group, and
    /// the group its previous revision belonged to when that differs.
    ///
    /// Removed entities no longer carry the property at all, so only the
    /// previous revision names the group they left. A modification that
    /// changed the grouping property leaves its old group behind the same
    /// way, so incremental runs always consult the previous revision too.
    fn reduction_values_of(
        &self,
        input: &QueryResult,
        ctx: &QueryContext<'_>,
    ) -> Result<Vec<PropertyValue>> {
        let mut values = Vec::new();
        if let Some(current) = property_of(&input.entity, &self.reduction_property) {
            values.push(current);
        }
        if ctx.incremental || input.operation == Operation::Removal {
            if let Some(previous) = ctx.read_previous(&input.entity)? {
                if let Some(value) = property_of(&previous, &self.reduction_property) {
                    if !values.contains(&value) {
                        values.push(value);
                    }
                }
            }
        }
        Ok(values)
    }

    fn emit_representative(
        &self,
        id: Identifier,
        operation: Option<Operation>,
        outcome: &ReductionOutcome,
        ctx: &QueryContext<'_>,
        out: &mut Vec<QueryResult>,
    ) -> Result<()> {
        if let Some(entity) = ctx.read_latest(id)? {
            let operation = operation.unwrap_or(entity.metadata.operation);
            out.push(QueryResult {
                entity,
                operation,
                aggregates: outcome.aggregates.clone(),
                aggregate_ids: outcome.aggregate_ids.clone(),
            });
        }
        Ok(())
    }

    fn feed(
        &mut self,
        input: QueryResult,
        ctx: &QueryContext<'_>,
        out: &mut Vec<QueryResult>,
    ) -> Result<()> {
        let values = self.reduction_values_of(&input, ctx)?;
        if values.is_empty() {
            // No group to reduce on; the entity was already removed and no
            // previous revision survives.
            trace!(id = %input.entity.id, "No reduction value");
            return Ok(());
        }
        for reduction_value in values {
            self.feed_group(reduction_value, ctx, out)?;
        }
        Ok(())
    }

    fn feed_group(
        &mut self,
        reduction_value: PropertyValue,
        ctx: &QueryContext<'_>,
        out: &mut Vec<QueryResult>,
    ) -> Result<()> {
        let value_bytes = schema::index_value_bytes(&reduction_value);

        if !self.reduced_values.contains(&value_bytes) {
            // Reduce every group only once per run.
            self.reduced_values.insert(value_bytes.clone());
            let outcome = self.reduce_on_value(&reduction_value, ctx)?;
            if ctx.incremental {
                self.retract_absorbed_groups(&value_bytes, &outcome, ctx, out)?;
            }
            let Some(selection) = outcome.selection else {
                // All members of the group are filtered out.
                return Ok(());
            };
            self.selected_values.insert(
                value_bytes,
                SelectedGroup {
                    value: reduction_value,
                    representative: selection,
                },
            );
            self.emit_representative(selection, None, &outcome, ctx, out)?;
            return Ok(());
        }

        if ctx.incremental && !self.incrementally_reduced.contains(&value_bytes) {
            self.incrementally_reduced.insert(value_bytes.clone());
            self.apply_group_change(value_bytes, reduction_value, ctx, out)?;
        }
        Ok(())
    }

    /// Re-reduces one group and reports the difference against what the
    /// caller already holds.
    fn apply_group_change(
        &mut self,
        value_bytes: Vec<u8>,
        reduction_value: PropertyValue,
        ctx: &QueryContext<'_>,
        out: &mut Vec<QueryResult>,
    ) -> Result<()> {
        let outcome = self.reduce_on_value(&reduction_value, ctx)?;
        // Groups whose members this one absorbed are retracted first, so a
        // representative both groups share ends up present, not removed.
        self.retract_absorbed_groups(&value_bytes, &outcome, ctx, out)?;
        let old_selection = self
            .selected_values
            .remove(&value_bytes)
            .map(|group| group.representative);

        match (old_selection, outcome.selection) {
            // The group was filtered before and still is.
            (None, None) => {}
            (old, Some(new)) if old == Some(new) => {
                self.selected_values.insert(
                    value_bytes,
                    SelectedGroup {
                        value: reduction_value,
                        representative: new,
                    },
                );
                self.emit_representative(new, Some(Operation::Modification), &outcome, ctx, out)?;
            }
            (old, new) => {
                if let Some(old) = old {
                    if let Some(entity) = ctx.read_latest(old)? {
                        out.push(QueryResult::plain(entity, Operation::Removal));
                    }
                }
                if let Some(new) = new {
                    self.selected_values.insert(
                        value_bytes,
                        SelectedGroup {
                            value: reduction_value,
                            representative: new,
                        },
                    );
                    self.emit_representative(new, Some(Operation::Creation), &outcome, ctx, out)?;
                }
            }
        }
        Ok(())
    }

    /// Retracts groups that lost their members to the one just reduced.
    ///
    /// A thread merge rewrites the threading index for every message of the
    /// child thread without giving any of them a new revision, so the
    /// orphaned group never shows up in the changed-id set. It is still
    /// detectable: its tracked representative is now a member of the
    /// absorbing group. Re-reducing it finds the emptied membership and
    /// emits the retraction.
    fn retract_absorbed_groups(
        &mut self,
        group_key: &[u8],
        outcome: &ReductionOutcome,
        ctx: &QueryContext<'_>,
        out: &mut Vec<QueryResult>,
    ) -> Result<()> {
        let absorbed: Vec<(Vec<u8>, PropertyValue)> = self
            .selected_values
            .iter()
            .filter(|(key, group)| {
                key.as_slice() != group_key
                    && outcome.aggregate_ids.contains(&group.representative)
            })
            .map(|(key, group)| (key.clone(), group.value.clone()))
            .collect();
        for (key, value) in absorbed {
            if self.incrementally_reduced.contains(&key) {
                continue;
            }
            trace!("Retracting absorbed reduction group");
            self.incrementally_reduced.insert(key.clone());
            self.apply_group_change(key, value, ctx, out)?;
        }
        Ok(())
    }

    fn update_complete(&mut self) {
        self.incrementally_reduced.clear();
    }
}

struct BloomNode {
    property: String,
    bloomed: bool,
    filter: FilterNode,
}

impl BloomNode {
    fn new(property: String) -> Self {
        Self {
            property,
            bloomed: false,
            filter: FilterNode {
                filters: BTreeMap::new(),
            },
        }
    }

    fn feed(
        &mut self,
        input: QueryResult,
        ctx: &QueryContext<'_>,
        out: &mut Vec<QueryResult>,
    ) -> Result<()> {
        if self.bloomed {
            // After the initial expansion only same-group entities pass.
            return self.filter.feed(input, ctx, out);
        }
        // Bloom on the first value seen, then turn into a plain filter.
        let Some(value) = property_of(&input.entity, &self.property) else {
            return Ok(());
        };
        let members = ctx.index_lookup(&self.property, &value, &[])?;
        for member in members {
            if let Some(entity) = ctx.read_latest(member)? {
                if !entity.is_tombstone() {
                    out.push(QueryResult::plain(entity, Operation::Creation));
                }
            }
        }
        self.bloomed = true;
        self.filter
            .filters
            .insert(self.property.clone(), Comparator::Equals(value));
        Ok(())
    }
}

struct ReferenceNode {
    reference_property: String,
    aggregators: Vec<Aggregator>,
}

impl ReferenceNode {
    fn feed(
        &mut self,
        mut input: QueryResult,
        ctx: &QueryContext<'_>,
        out: &mut Vec<QueryResult>,
    ) -> Result<()> {
        let mut counts: HashMap<&str, u64> = HashMap::new();
        let mut collections: HashMap<&str, Vec<PropertyValue>> = HashMap::new();

        let mut parent = property_of(&input.entity, &self.reference_property)
            .and_then(|v| v.as_reference());
        let mut hops = 0usize;
        while let Some(parent_id) = parent {
            // A reference cycle would never terminate otherwise.
            hops += 1;
            if hops > 64 {
                break;
            }
            let Some(ancestor) = ctx.read_latest(parent_id)? else {
                break;
            };
            for aggregator in &self.aggregators {
                match aggregator.operation {
                    AggregationOperation::Count => {
                        *counts.entry(aggregator.result_property.as_str()).or_default() += 1;
                    }
                    AggregationOperation::Collect => {
                        if let Some(property) = &aggregator.property {
                            if let Some(value) = property_of(&ancestor, property) {
                                collections
                                    .entry(aggregator.result_property.as_str())
                                    .or_default()
                                    .push(value);
                            }
                        }
                    }
                }
            }
            parent = property_of(&ancestor, &self.reference_property).and_then(|v| v.as_reference());
        }

        for aggregator in &self.aggregators {
            let value = match aggregator.operation {
                AggregationOperation::Count => AggregateValue::Count(
                    counts.get(aggregator.result_property.as_str()).copied().unwrap_or(0),
                ),
                AggregationOperation::Collect => AggregateValue::Collect(
                    collections
                        .remove(aggregator.result_property.as_str())
                        .unwrap_or_default(),
                ),
            };
            input.aggregates.insert(aggregator.result_property.clone(), value);
        }
        out.push(input);
        Ok(())
    }
}

enum StageNode {
    Filter(FilterNode),
    Reduce(ReduceNode),
    Bloom(BloomNode),
    Reference(ReferenceNode),
}

impl StageNode {
    fn feed(
        &mut self,
        input: QueryResult,
        ctx: &QueryContext<'_>,
        out: &mut Vec<QueryResult>,
    ) -> Result<()> {
        match self {
            StageNode::Filter(node) => node.feed(input, ctx, out),
            StageNode::Reduce(node) => node.feed(input, ctx, out),
            StageNode::Bloom(node) => node.feed(input, ctx, out),
            StageNode::Reference(node) => node.feed(input, ctx, out),
        }
    }

    fn update_complete(&mut self) {
        if let StageNode::Reduce(node) = self {
            node.update_complete();
        }
    }
}

// ============================================================================
// The compiled query
// ============================================================================

/// A compiled query pipeline with externalized state.
///
/// `execute` drains the initial snapshot (batched by the query limit,
/// resumable via repeated calls); `update` runs only the identifiers
/// changed since a base revision through the same pipeline.
pub struct DataStoreQuery {
    ty: EntityType,
    source: SourceNode,
    stages: Vec<StageNode>,
}

impl DataStoreQuery {
    /// Compiles a query against the store.
    ///
    /// Subqueries inside comparators are executed eagerly and replaced by
    /// `In(ids)`, so the pipeline only sees primitive comparators.
    pub fn new(query: &Query, store: &EntityStore) -> Result<Self> {
        let mut query = query.clone();

        // Resolve subqueries first.
        let mut resolved = BTreeMap::new();
        for (property, comparator) in &query.base_filters {
            let comparator = match comparator {
                Comparator::Subquery(inner) => {
                    trace!(%property, "Executing subquery");
                    let mut sub = DataStoreQuery::new(inner, store)?;
                    let results = sub.execute(store)?;
                    Comparator::In(
                        results
                            .ids()
                            .into_iter()
                            .map(PropertyValue::Reference)
                            .collect(),
                    )
                }
                other => other.clone(),
            };
            resolved.insert(property.clone(), comparator);
        }
        query.base_filters = resolved;

        let source = if !query.ids.is_empty() {
            // With no regrouping stage the id set is final and incremental
            // changes outside it are rejected up front.
            SourceNode::new(query.ids.clone(), !query.has_regrouping_stage())
        } else {
            let lookup = store.index_lookup(query.ty, &query)?;
            if lookup.used_index() {
                SourceNode::new(lookup.ids, false)
            } else {
                // Full scan fallback; expensive for large stores.
                SourceNode::new(store.read_all_uids(query.ty)?, false)
            }
        };

        let mut stages = Vec::new();
        if !query.base_filters.is_empty() {
            // Index-applied filters are re-checked too: incremental runs do
            // not repeat the index lookup.
            stages.push(StageNode::Filter(FilterNode {
                filters: query.base_filters.clone(),
            }));
        }
        for stage in &query.stages {
            match stage {
                FilterStage::Filter { filters } => {
                    stages.push(StageNode::Filter(FilterNode {
                        filters: filters.clone(),
                    }));
                }
                FilterStage::Reduce(reduce) => {
                    stages.push(StageNode::Reduce(ReduceNode::new(
                        reduce.clone(),
                        query.base_filters.clone(),
                    )));
                }
                FilterStage::ReferenceResolver {
                    reference_property,
                    aggregators,
                } => {
                    stages.push(StageNode::Reference(ReferenceNode {
                        reference_property: reference_property.clone(),
                        aggregators: aggregators.clone(),
                    }));
                }
                FilterStage::Bloom { property } => {
                    stages.push(StageNode::Bloom(BloomNode::new(property.clone())));
                }
            }
        }

        Ok(Self {
            ty: query.ty,
            source,
            stages,
        })
    }

    fn step(&mut self, ctx: &QueryContext<'_>) -> Result<Option<Vec<QueryResult>>> {
        let Some(seed) = self.source.next(ctx)? else {
            return Ok(None);
        };
        let mut items = vec![seed];
        for stage in &mut self.stages {
            let mut produced = Vec::new();
            for item in items {
                stage.feed(item, ctx, &mut produced)?;
            }
            items = produced;
            if items.is_empty() {
                break;
            }
        }
        Ok(Some(items))
    }

    /// Drains the initial pipeline.
    ///
    /// Emits only creations; removals are meaningless for a caller that
    /// holds nothing yet. With a limit, at most that many creations are
    /// returned and a subsequent call continues where this one stopped.
    pub fn execute(&mut self, store: &EntityStore) -> Result<ResultSet> {
        self.execute_batch(store, None)
    }

    /// `execute` with an explicit batch limit.
    pub fn execute_batch(&mut self, store: &EntityStore, limit: Option<usize>) -> Result<ResultSet> {
        let ctx = QueryContext {
            store,
            ty: self.ty,
            incremental: false,
        };
        let mut results = Vec::new();
        while let Some(items) = self.step(&ctx)? {
            for item in items {
                if item.operation == Operation::Removal {
                    continue;
                }
                results.push(QueryResult {
                    operation: Operation::Creation,
                    ..item
                });
            }
            if limit.is_some_and(|l| results.len() >= l) {
                break;
            }
        }
        Ok(ResultSet { results })
    }

    /// Runs the identifiers of all revisions past `base_revision` through
    /// the pipeline and reports creations, modifications and removals
    /// relative to what the caller already holds.
    pub fn update(&mut self, store: &EntityStore, base_revision: u64) -> Result<ResultSet> {
        let changed = store.read_revisions(base_revision, self.ty)?;
        trace!(
            base_revision,
            changed = changed.len(),
            "Executing query update"
        );
        self.source.add(&changed);
        let ctx = QueryContext {
            store,
            ty: self.ty,
            incremental: true,
        };
        let mut results = Vec::new();
        while let Some(items) = self.step(&ctx)? {
            results.extend(items);
        }
        self.source.reset_incremental();
        for stage in &mut self.stages {
            stage.update_complete();
        }
        Ok(ResultSet { results })
    }
}
