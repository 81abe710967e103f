//! Query model and executor.
//!
//! Queries are a closed algebraic form: a base filter map, an ordered list
//! of stages (filter, reduce, reference-resolver, bloom), optional sort and
//! limit. There is no general query language; clients compose these
//! structures and the executor compiles them into a linear pipeline over
//! index lookups or full scans.

mod executor;
mod runner;

pub use executor::{AggregateValue, DataStoreQuery, QueryResult, ResultSet};
pub use runner::{spawn_live_query, LiveQueryHandle, QueryRunner};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entity::PropertyValue;
use crate::types::{EntityType, Identifier};

/// A property comparator.
///
/// `Subquery` is resolved into `In(ids)` before execution, so stages only
/// ever see primitive comparators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Comparator {
    /// The property equals the value.
    Equals(PropertyValue),
    /// The property equals one of the values.
    In(Vec<PropertyValue>),
    /// A list property contains the value, or a text property contains the
    /// substring.
    Contains(PropertyValue),
    /// The entity matches the fulltext index for the given term(s).
    Fulltext(String),
    /// The property lies in the inclusive range.
    Range(PropertyValue, PropertyValue),
    /// The property equals one of the identifiers the inner query yields.
    Subquery(Box<Query>),
}

impl Comparator {
    /// Evaluates the comparator against a property value.
    ///
    /// `Fulltext` always matches here; it is evaluated against the index by
    /// the executor. An unresolved `Subquery` never matches.
    pub fn matches(&self, value: Option<&PropertyValue>) -> bool {
        match self {
            Comparator::Equals(expected) => value == Some(expected),
            Comparator::In(values) => value.is_some_and(|v| values.contains(v)),
            Comparator::Contains(needle) => match (value, needle) {
                (Some(PropertyValue::ByteList(items)), PropertyValue::Bytes(b)) => {
                    items.iter().any(|i| i == b)
                }
                (Some(PropertyValue::ByteList(items)), PropertyValue::Text(t)) => {
                    items.iter().any(|i| i == t.as_bytes())
                }
                (Some(PropertyValue::Text(haystack)), PropertyValue::Text(t)) => {
                    haystack.contains(t.as_str())
                }
                _ => false,
            },
            Comparator::Fulltext(_) => true,
            Comparator::Range(low, high) => {
                value.is_some_and(|v| low <= v && v <= high)
            }
            Comparator::Subquery(_) => false,
        }
    }
}

/// Min/Max choice of a reduction selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionComparator {
    /// Pick the entity with the smallest selector value.
    Min,
    /// Pick the entity with the largest selector value.
    Max,
}

impl SelectionComparator {
    /// True if `candidate` beats `current` under this comparator.
    pub fn prefers(&self, candidate: &PropertyValue, current: &PropertyValue) -> bool {
        match self {
            SelectionComparator::Min => candidate < current,
            SelectionComparator::Max => candidate > current,
        }
    }
}

/// Picks one representative per reduction group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    /// Property compared across group members.
    pub property: String,
    /// Whether the smallest or largest value wins.
    pub comparator: SelectionComparator,
}

impl Selector {
    /// A max-by selector.
    pub fn max(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            comparator: SelectionComparator::Max,
        }
    }

    /// A min-by selector.
    pub fn min(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            comparator: SelectionComparator::Min,
        }
    }
}

/// How an aggregator folds group members.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationOperation {
    /// Collect the property values of all members into a list.
    Collect,
    /// Count the members.
    Count,
}

/// An aggregate computed over a reduction group or a reference chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aggregator {
    /// The fold operation.
    pub operation: AggregationOperation,
    /// Property to fold; irrelevant for `Count`.
    pub property: Option<String>,
    /// Name the result surfaces under on the query result.
    pub result_property: String,
}

impl Aggregator {
    /// A `Count` aggregator.
    pub fn count(result_property: impl Into<String>) -> Self {
        Self {
            operation: AggregationOperation::Count,
            property: None,
            result_property: result_property.into(),
        }
    }

    /// A `Collect` aggregator over the given property.
    pub fn collect(property: impl Into<String>, result_property: impl Into<String>) -> Self {
        Self {
            operation: AggregationOperation::Collect,
            property: Some(property.into()),
            result_property: result_property.into(),
        }
    }
}

/// A selector whose winning value is attached to the result as a property.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertySelector {
    /// Property to report from the winning entity.
    pub property: String,
    /// Whether the smallest or largest selection value wins.
    pub comparator: SelectionComparator,
    /// Name the value surfaces under on the query result.
    pub result_property: String,
}

/// A reduction stage: group by a property, pick one representative per
/// group, compute aggregates over the group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reduce {
    /// Property whose value defines the groups (e.g. thread id).
    pub property: String,
    /// How the representative is chosen.
    pub selector: Selector,
    /// Aggregates over the group.
    pub aggregators: Vec<Aggregator>,
    /// Extra per-group property selections.
    pub property_selectors: Vec<PropertySelector>,
}

/// One stage of the query pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FilterStage {
    /// Property filters applied after the source.
    Filter {
        /// Property path to comparator.
        filters: BTreeMap<String, Comparator>,
    },
    /// Collapse entities sharing a property value to one representative.
    Reduce(Reduce),
    /// Follow a self-reference chain collecting aggregates from ancestors.
    ReferenceResolver {
        /// The self-reference property (e.g. folder parent).
        reference_property: String,
        /// Aggregates over the ancestor chain.
        aggregators: Vec<Aggregator>,
    },
    /// Expand the seed entity to all entities sharing a property value.
    Bloom {
        /// The shared property (e.g. thread id).
        property: String,
    },
}

/// The closed query form the executor understands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Entity type queried.
    pub ty: EntityType,
    /// Fixed id set; when non-empty the source is exactly these ids.
    pub ids: Vec<Identifier>,
    /// Filters the source and the first filter stage evaluate.
    pub base_filters: BTreeMap<String, Comparator>,
    /// Pipeline stages applied on top of the filtered source.
    pub stages: Vec<FilterStage>,
    /// Property to sort by; honored by sorted indexes.
    pub sort: Option<String>,
    /// Maximum number of creations per batch; `fetch_more` continues.
    pub limit: Option<usize>,
    /// Whether the caller wants incremental updates after the snapshot.
    pub live: bool,
    /// Properties the client cares about (advisory).
    pub requested_properties: Vec<String>,
}

impl Query {
    /// An unfiltered query over one type.
    pub fn for_type(ty: EntityType) -> Self {
        Self {
            ty,
            ids: Vec::new(),
            base_filters: BTreeMap::new(),
            stages: Vec::new(),
            sort: None,
            limit: None,
            live: false,
            requested_properties: Vec::new(),
        }
    }

    /// Adds a base filter.
    pub fn filter(mut self, property: impl Into<String>, comparator: Comparator) -> Self {
        self.base_filters.insert(property.into(), comparator);
        self
    }

    /// Appends a reduction stage.
    pub fn reduce(mut self, reduce: Reduce) -> Self {
        self.stages.push(FilterStage::Reduce(reduce));
        self
    }

    /// Appends a bloom stage.
    pub fn bloom(mut self, property: impl Into<String>) -> Self {
        self.stages.push(FilterStage::Bloom {
            property: property.into(),
        });
        self
    }

    /// Sets the sort property.
    pub fn sorted_by(mut self, property: impl Into<String>) -> Self {
        self.sort = Some(property.into());
        self
    }

    /// Sets the batch limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Marks the query live.
    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }

    /// True if any stage regroups entities, in which case a fixed id set is
    /// not final and incremental ids outside it must still be considered.
    pub fn has_regrouping_stage(&self) -> bool {
        self.stages
            .iter()
            .any(|s| matches!(s, FilterStage::Reduce(_) | FilterStage::Bloom { .. }))
    }
}
