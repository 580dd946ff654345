//! Query builder and predicate compiler.
//!
//! A [`Query`] accumulates a typed predicate tree plus result options and is
//! consumed exactly once by a scheduler drain. Compilation lowers the tree
//! into an evaluatable form with pre-parsed needles and regexes; compiled
//! queries are cached on the database handle, keyed by the user-supplied
//! [`Query::id`] or a structural hash of the tree.

mod compile;
mod filter;

pub use filter::{CompareOp, DatePart, LikeWhere};

pub(crate) use compile::{compile, fingerprint, CompiledQuery};
pub(crate) use filter::{value_cmp, value_eq, FilterNode};

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Sort order for query results.
#[derive(Clone)]
pub enum SortSpec {
    /// Sort by a field, ascending or descending.
    Field {
        /// Field name.
        name: String,
        /// Ascending when true.
        asc: bool,
    },
    /// Shuffle the results.
    Random,
    /// Sort with a caller-supplied comparator.
    Custom(Arc<dyn Fn(&Value, &Value) -> Ordering + Send + Sync>),
}

impl std::fmt::Debug for SortSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Field { name, asc } => write!(f, "Field({name}, asc={asc})"),
            Self::Random => write!(f, "Random"),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Reduction applied instead of returning documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    /// Number of matching documents.
    Count,
    /// Sum of a numeric field.
    Sum,
    /// Minimum of a field.
    Min,
    /// Maximum of a field.
    Max,
    /// Average of a numeric field.
    Avg,
    /// Value frequency map of a field.
    Group,
}

/// Result of a scalar query.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarResult {
    /// Matching document count.
    Count(usize),
    /// Field sum.
    Sum(f64),
    /// Field minimum, `None` when nothing matched.
    Min(Option<Value>),
    /// Field maximum, `None` when nothing matched.
    Max(Option<Value>),
    /// Field average, `None` when nothing matched.
    Avg(Option<f64>),
    /// Field value frequencies.
    Group(BTreeMap<String, usize>),
}

/// A paginated result page.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Listing {
    /// 1-based page number derived from `skip` and `take`.
    pub page: usize,
    /// Total number of pages.
    pub pages: usize,
    /// Page size.
    pub limit: usize,
    /// Total number of matching documents.
    pub count: usize,
    /// The documents of this page.
    pub items: Vec<Value>,
}

/// Join resolved against a sibling database after the main pass.
#[derive(Debug, Clone)]
pub struct JoinSpec {
    pub(crate) field: String,
    pub(crate) database: String,
    pub(crate) local: String,
    pub(crate) foreign: String,
    pub(crate) first: bool,
    pub(crate) scalar: Option<(ScalarKind, Option<String>)>,
}

impl JoinSpec {
    /// Creates a join that stores its result under `field`, reading from
    /// the registered database `database`.
    pub fn new(field: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            database: database.into(),
            local: String::new(),
            foreign: String::new(),
            first: false,
            scalar: None,
        }
    }

    /// Joins documents whose `foreign` field equals this document's `local`
    /// field.
    #[must_use]
    pub fn on(mut self, local: impl Into<String>, foreign: impl Into<String>) -> Self {
        self.local = local.into();
        self.foreign = foreign.into();
        self
    }

    /// Stores a single joined document instead of an array.
    #[must_use]
    pub const fn first(mut self) -> Self {
        self.first = true;
        self
    }

    /// Stores a scalar reduction of the joined documents.
    #[must_use]
    pub fn scalar(mut self, kind: ScalarKind, field: Option<&str>) -> Self {
        self.scalar = Some((kind, field.map(str::to_string)));
        self
    }
}

/// Fluent query builder.
///
/// Predicates accumulate conjunctively; an [`Query::or`] ... [`Query::end`]
/// section folds its members disjunctively.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub(crate) nodes: Vec<FilterNode>,
    scopes: Vec<Vec<FilterNode>>,
    pub(crate) take: Option<usize>,
    pub(crate) skip: usize,
    pub(crate) first: bool,
    pub(crate) sort: Option<SortSpec>,
    pub(crate) keep: Option<Vec<String>>,
    pub(crate) drop: Option<Vec<String>>,
    pub(crate) scalar: Option<(ScalarKind, Option<String>)>,
    pub(crate) listing: bool,
    pub(crate) id: Option<String>,
    pub(crate) empty_error: Option<String>,
    pub(crate) joins: Vec<JoinSpec>,
}

impl Query {
    /// Creates an empty query matching every document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: FilterNode) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(node);
        } else {
            self.nodes.push(node);
        }
    }

    /// Adds a comparison predicate. `op` is one of `==`, `!=`, `<`, `<=`,
    /// `>`, `>=`; dates compare by epoch milliseconds.
    #[must_use]
    pub fn where_(mut self, field: impl Into<String>, op: &str, value: impl Into<Value>) -> Self {
        self.push(FilterNode::Compare {
            field: field.into(),
            op: CompareOp::parse(op),
            value: value.into(),
        });
        self
    }

    /// Matches documents whose field value (scalar or array) intersects
    /// `values`.
    #[must_use]
    pub fn in_(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.push(FilterNode::In {
            field: field.into(),
            values,
            negate: false,
        });
        self
    }

    /// Negation of [`Query::in_`].
    #[must_use]
    pub fn not_in(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.push(FilterNode::In {
            field: field.into(),
            values,
            negate: true,
        });
        self
    }

    /// Matches field values between `low` and `high`, inclusive.
    #[must_use]
    pub fn between(
        mut self,
        field: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        self.push(FilterNode::Between {
            field: field.into(),
            low: low.into(),
            high: high.into(),
        });
        self
    }

    /// Case-insensitive substring predicate. Array values join with spaces.
    #[must_use]
    pub fn like(
        mut self,
        field: impl Into<String>,
        value: impl Into<Value>,
        position: LikeWhere,
    ) -> Self {
        let needle = match value.into() {
            Value::Array(items) => items
                .iter()
                .filter_map(filter::as_text)
                .collect::<Vec<_>>()
                .join(" "),
            other => filter::as_text(&other).unwrap_or_default(),
        };
        self.push(FilterNode::Like {
            field: field.into(),
            needle: needle.to_lowercase(),
            position,
        });
        self
    }

    /// Alias for [`Query::like`] matching anywhere.
    #[must_use]
    pub fn search(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.like(field, value, LikeWhere::Anywhere)
    }

    /// Matches field values against a regular expression.
    #[must_use]
    pub fn regexp(mut self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.push(FilterNode::Regexp {
            field: field.into(),
            pattern: pattern.into(),
        });
        self
    }

    /// Token-based text search.
    ///
    /// Both sides are lowercased; `weight` is the percentage of query tokens
    /// that must be present (default semantics: 100). CJK characters
    /// tokenize individually.
    #[must_use]
    pub fn fulltext(
        mut self,
        field: impl Into<String>,
        value: impl Into<String>,
        weight: u8,
    ) -> Self {
        self.push(FilterNode::Fulltext {
            field: field.into(),
            needle: value.into(),
            weight: weight.min(100),
        });
        self
    }

    /// Matches documents whose field holds a non-empty value.
    #[must_use]
    pub fn contains(mut self, field: impl Into<String>) -> Self {
        self.push(FilterNode::Contains {
            field: field.into(),
        });
        self
    }

    /// Matches documents whose field is missing or empty.
    #[must_use]
    pub fn empty(mut self, field: impl Into<String>) -> Self {
        self.push(FilterNode::Empty {
            field: field.into(),
        });
        self
    }

    /// Compares the day-of-month of a date field.
    #[must_use]
    pub fn day(self, field: impl Into<String>, op: &str, value: i64) -> Self {
        self.date_part(field, DatePart::Day, op, value)
    }

    /// Compares the month of a date field.
    #[must_use]
    pub fn month(self, field: impl Into<String>, op: &str, value: i64) -> Self {
        self.date_part(field, DatePart::Month, op, value)
    }

    /// Compares the year of a date field.
    #[must_use]
    pub fn year(self, field: impl Into<String>, op: &str, value: i64) -> Self {
        self.date_part(field, DatePart::Year, op, value)
    }

    fn date_part(mut self, field: impl Into<String>, part: DatePart, op: &str, value: i64) -> Self {
        self.push(FilterNode::DatePart {
            field: field.into(),
            part,
            op: CompareOp::parse(op),
            value,
        });
        self
    }

    /// Adds a caller-supplied predicate function.
    #[must_use]
    pub fn custom<F>(mut self, func: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.push(FilterNode::Custom {
            func: Arc::new(func),
        });
        self
    }

    /// Opens a disjunctive group; members added until [`Query::end`] fold
    /// with OR.
    #[must_use]
    pub fn or(mut self) -> Self {
        self.scopes.push(Vec::new());
        self
    }

    /// Closes the innermost disjunctive group.
    #[must_use]
    pub fn end(mut self) -> Self {
        if let Some(children) = self.scopes.pop() {
            self.push(FilterNode::Group { or: true, children });
        }
        self
    }

    /// Limits the number of returned documents.
    #[must_use]
    pub const fn take(mut self, n: usize) -> Self {
        self.take = Some(n);
        self
    }

    /// Skips the first `n` matching documents.
    #[must_use]
    pub const fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Stops the scan at the first match and returns at most one document.
    #[must_use]
    pub const fn first(mut self) -> Self {
        self.first = true;
        self
    }

    /// Sorts by a field.
    #[must_use]
    pub fn sort(mut self, field: impl Into<String>, asc: bool) -> Self {
        self.sort = Some(SortSpec::Field {
            name: field.into(),
            asc,
        });
        self
    }

    /// Shuffles the results.
    #[must_use]
    pub fn sort_random(mut self) -> Self {
        self.sort = Some(SortSpec::Random);
        self
    }

    /// Sorts with a caller-supplied comparator.
    #[must_use]
    pub fn sort_by<F>(mut self, cmp: F) -> Self
    where
        F: Fn(&Value, &Value) -> Ordering + Send + Sync + 'static,
    {
        self.sort = Some(SortSpec::Custom(Arc::new(cmp)));
        self
    }

    /// Keeps only the named fields in returned documents.
    ///
    /// The sort field, when set, is always retained.
    #[must_use]
    pub fn fields(mut self, names: &[&str]) -> Self {
        self.keep = Some(names.iter().map(|s| (*s).to_string()).collect());
        self
    }

    /// Drops the named fields from returned documents.
    #[must_use]
    pub fn without(mut self, names: &[&str]) -> Self {
        self.drop = Some(names.iter().map(|s| (*s).to_string()).collect());
        self
    }

    /// Replaces the document list result with a scalar reduction.
    #[must_use]
    pub fn scalar(mut self, kind: ScalarKind, field: Option<&str>) -> Self {
        self.scalar = Some((kind, field.map(str::to_string)));
        self
    }

    /// Requests the paginated listing result shape.
    #[must_use]
    pub const fn listing(mut self) -> Self {
        self.listing = true;
        self
    }

    /// Sets the compiled-predicate cache key.
    #[must_use]
    pub fn id(mut self, key: impl Into<String>) -> Self {
        self.id = Some(key.into());
        self
    }

    /// Fails the query with [`crate::CoreError::EmptyResult`] when nothing
    /// matches.
    #[must_use]
    pub fn error_on_empty(mut self, message: impl Into<String>) -> Self {
        self.empty_error = Some(message.into());
        self
    }

    /// Adds a join resolved after the main pass.
    #[must_use]
    pub fn join(mut self, spec: JoinSpec) -> Self {
        self.joins.push(spec);
        self
    }

    /// Closes any unterminated `or` groups.
    ///
    /// Called when the builder is consumed by a drain.
    pub(crate) fn seal(&mut self) {
        while let Some(children) = self.scopes.pop() {
            self.nodes.push(FilterNode::Group { or: true, children });
        }
    }

    /// The sort field name, when field sorting is requested.
    pub(crate) fn sort_field(&self) -> Option<&str> {
        match &self.sort {
            Some(SortSpec::Field { name, .. }) => Some(name),
            _ => None,
        }
    }

    /// Every field the predicate tree references, or `None` when a custom
    /// node makes the set unknowable.
    pub(crate) fn referenced_fields(&self) -> Option<Vec<String>> {
        fn walk(nodes: &[FilterNode], out: &mut Vec<String>) -> bool {
            for node in nodes {
                match node {
                    FilterNode::Compare { field, .. }
                    | FilterNode::In { field, .. }
                    | FilterNode::Between { field, .. }
                    | FilterNode::Like { field, .. }
                    | FilterNode::Regexp { field, .. }
                    | FilterNode::Fulltext { field, .. }
                    | FilterNode::Contains { field }
                    | FilterNode::Empty { field }
                    | FilterNode::DatePart { field, .. } => out.push(field.clone()),
                    FilterNode::Custom { .. } => return false,
                    FilterNode::Group { children, .. } => {
                        if !walk(children, out) {
                            return false;
                        }
                    }
                }
            }
            true
        }

        let mut fields = Vec::new();
        if !walk(&self.nodes, &mut fields) {
            return None;
        }
        for scope in &self.scopes {
            if !walk(scope, &mut fields) {
                return None;
            }
        }
        Some(fields)
    }
}
