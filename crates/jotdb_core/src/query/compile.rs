//! Lowering of predicate trees into cached, evaluatable form.

use crate::error::{CoreError, CoreResult};
use crate::query::filter::{
    as_text, as_timestamp, date_component, fulltext_tokens, is_empty_value, value_cmp, value_eq,
    FilterNode,
};
use crate::query::{CompareOp, DatePart, LikeWhere, Query};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A lowered predicate node: needles lowercased, regexes and token lists
/// built once.
enum CompiledNode {
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
        negate: bool,
    },
    Between {
        field: String,
        low: Value,
        high: Value,
    },
    Like {
        field: String,
        needle: String,
        position: LikeWhere,
    },
    Regexp {
        field: String,
        regex: Regex,
    },
    Fulltext {
        field: String,
        tokens: Vec<String>,
        required: usize,
    },
    Contains {
        field: String,
    },
    Empty {
        field: String,
    },
    DatePart {
        field: String,
        part: DatePart,
        op: CompareOp,
        value: i64,
    },
    Custom {
        func: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
    },
    Group {
        or: bool,
        children: Vec<CompiledNode>,
    },
}

/// A compiled predicate plus projection, shared through the query cache.
pub(crate) struct CompiledQuery {
    root: CompiledNode,
    keep: Option<Vec<String>>,
    drop: Option<Vec<String>>,
    sort_field: Option<String>,
}

impl CompiledQuery {
    /// Evaluates the predicate against a document.
    pub fn matches(&self, doc: &Value) -> bool {
        eval(&self.root, doc)
    }

    /// Applies the keep-list or drop-set projection.
    ///
    /// The sort field is always retained so post-pass sorting still sees
    /// its key.
    pub fn project(&self, doc: &Value) -> Value {
        if let Some(keep) = &self.keep {
            let mut out = Map::new();
            if let Some(fields) = doc.as_object() {
                for name in keep {
                    if let Some(value) = fields.get(name) {
                        out.insert(name.clone(), value.clone());
                    }
                }
                if let Some(sort_field) = &self.sort_field {
                    if !out.contains_key(sort_field) {
                        if let Some(value) = fields.get(sort_field) {
                            out.insert(sort_field.clone(), value.clone());
                        }
                    }
                }
            }
            return Value::Object(out);
        }

        if let Some(drop) = &self.drop {
            let mut out = doc.clone();
            if let Some(fields) = out.as_object_mut() {
                for name in drop {
                    if self.sort_field.as_deref() != Some(name.as_str()) {
                        fields.remove(name);
                    }
                }
            }
            return out;
        }

        doc.clone()
    }
}

fn field_of<'a>(doc: &'a Value, name: &str) -> Option<&'a Value> {
    doc.as_object().and_then(|fields| fields.get(name))
}

fn eval(node: &CompiledNode, doc: &Value) -> bool {
    match node {
        CompiledNode::Compare { field, op, value } => {
            let actual = field_of(doc, field).unwrap_or(&Value::Null);
            match op {
                CompareOp::Eq => value_eq(actual, value),
                CompareOp::Ne => !value_eq(actual, value),
                _ => op.check(value_cmp(actual, value)),
            }
        }
        CompiledNode::In {
            field,
            values,
            negate,
        } => {
            let actual = field_of(doc, field).unwrap_or(&Value::Null);
            let found = match actual {
                Value::Array(items) => items
                    .iter()
                    .any(|item| values.iter().any(|v| value_eq(item, v))),
                scalar => values.iter().any(|v| value_eq(scalar, v)),
            };
            found != *negate
        }
        CompiledNode::Between { field, low, high } => {
            let actual = field_of(doc, field).unwrap_or(&Value::Null);
            CompareOp::Ge.check(value_cmp(actual, low)) && CompareOp::Le.check(value_cmp(actual, high))
        }
        CompiledNode::Like {
            field,
            needle,
            position,
        } => {
            let Some(text) = field_of(doc, field).and_then(as_text) else {
                return false;
            };
            let text = text.to_lowercase();
            match position {
                LikeWhere::Beg => text.starts_with(needle),
                LikeWhere::End => text.ends_with(needle),
                LikeWhere::Anywhere => text.contains(needle),
            }
        }
        CompiledNode::Regexp { field, regex } => field_of(doc, field)
            .and_then(as_text)
            .is_some_and(|text| regex.is_match(&text)),
        CompiledNode::Fulltext {
            field,
            tokens,
            required,
        } => {
            let Some(text) = field_of(doc, field).and_then(as_text) else {
                return false;
            };
            let text = text.to_lowercase();
            let found = tokens.iter().filter(|t| text.contains(t.as_str())).count();
            found >= *required
        }
        CompiledNode::Contains { field } => !is_empty_value(field_of(doc, field)),
        CompiledNode::Empty { field } => is_empty_value(field_of(doc, field)),
        CompiledNode::DatePart {
            field,
            part,
            op,
            value,
        } => field_of(doc, field)
            .and_then(as_timestamp)
            .and_then(|millis| date_component(millis, *part))
            .is_some_and(|component| op.check(Some(component.cmp(value)))),
        CompiledNode::Custom { func } => func(doc),
        CompiledNode::Group { or, children } => {
            if children.is_empty() {
                return true;
            }
            if *or {
                children.iter().any(|child| eval(child, doc))
            } else {
                children.iter().all(|child| eval(child, doc))
            }
        }
    }
}

fn lower(node: &FilterNode) -> CoreResult<CompiledNode> {
    Ok(match node {
        FilterNode::Compare { field, op, value } => CompiledNode::Compare {
            field: field.clone(),
            op: *op,
            value: value.clone(),
        },
        FilterNode::In {
            field,
            values,
            negate,
        } => CompiledNode::In {
            field: field.clone(),
            values: values.clone(),
            negate: *negate,
        },
        FilterNode::Between { field, low, high } => CompiledNode::Between {
            field: field.clone(),
            low: low.clone(),
            high: high.clone(),
        },
        FilterNode::Like {
            field,
            needle,
            position,
        } => CompiledNode::Like {
            field: field.clone(),
            needle: needle.clone(),
            position: *position,
        },
        FilterNode::Regexp { field, pattern } => CompiledNode::Regexp {
            field: field.clone(),
            regex: Regex::new(pattern)
                .map_err(|e| CoreError::invalid_operation(format!("invalid regexp: {e}")))?,
        },
        FilterNode::Fulltext {
            field,
            needle,
            weight,
        } => {
            let tokens = fulltext_tokens(needle);
            let required = (tokens.len() * usize::from(*weight)).div_ceil(100);
            CompiledNode::Fulltext {
                field: field.clone(),
                tokens,
                required,
            }
        }
        FilterNode::Contains { field } => CompiledNode::Contains {
            field: field.clone(),
        },
        FilterNode::Empty { field } => CompiledNode::Empty {
            field: field.clone(),
        },
        FilterNode::DatePart {
            field,
            part,
            op,
            value,
        } => CompiledNode::DatePart {
            field: field.clone(),
            part: *part,
            op: *op,
            value: *value,
        },
        FilterNode::Custom { func } => CompiledNode::Custom { func: func.clone() },
        FilterNode::Group { or, children } => CompiledNode::Group {
            or: *or,
            children: children.iter().map(lower).collect::<CoreResult<_>>()?,
        },
    })
}

/// Compiles a sealed query into its evaluatable form.
pub(crate) fn compile(query: &Query) -> CoreResult<CompiledQuery> {
    let children = query.nodes.iter().map(lower).collect::<CoreResult<_>>()?;
    Ok(CompiledQuery {
        root: CompiledNode::Group {
            or: false,
            children,
        },
        keep: query.keep.clone(),
        drop: query.drop.clone(),
        sort_field: query.sort_field().map(str::to_string),
    })
}

fn hash_node(node: &FilterNode, hasher: &mut DefaultHasher) -> bool {
    match node {
        FilterNode::Compare { field, op, value } => {
            (0u8, field, op).hash(hasher);
            value.to_string().hash(hasher);
        }
        FilterNode::In {
            field,
            values,
            negate,
        } => {
            (1u8, field, negate).hash(hasher);
            for value in values {
                value.to_string().hash(hasher);
            }
        }
        FilterNode::Between { field, low, high } => {
            (2u8, field).hash(hasher);
            low.to_string().hash(hasher);
            high.to_string().hash(hasher);
        }
        FilterNode::Like {
            field,
            needle,
            position,
        } => (3u8, field, needle, position).hash(hasher),
        FilterNode::Regexp { field, pattern } => (4u8, field, pattern).hash(hasher),
        FilterNode::Fulltext {
            field,
            needle,
            weight,
        } => (5u8, field, needle, weight).hash(hasher),
        FilterNode::Contains { field } => (6u8, field).hash(hasher),
        FilterNode::Empty { field } => (7u8, field).hash(hasher),
        FilterNode::DatePart {
            field,
            part,
            op,
            value,
        } => (8u8, field, part, op, value).hash(hasher),
        FilterNode::Custom { .. } => return false,
        FilterNode::Group { or, children } => {
            (9u8, or).hash(hasher);
            for child in children {
                if !hash_node(child, hasher) {
                    return false;
                }
            }
        }
    }
    true
}

/// Returns the cache key for a sealed query.
///
/// The user-supplied id wins; otherwise a structural hash of the predicate
/// tree and projection. Queries holding caller closures have no structural
/// identity and are only cacheable under an explicit id.
pub(crate) fn fingerprint(query: &Query) -> Option<String> {
    if let Some(id) = &query.id {
        return Some(id.clone());
    }

    let mut hasher = DefaultHasher::new();
    for node in &query.nodes {
        if !hash_node(node, &mut hasher) {
            return None;
        }
    }
    query.keep.hash(&mut hasher);
    query.drop.hash(&mut hasher);
    query.sort_field().hash(&mut hasher);

    Some(format!("q{:016x}", hasher.finish()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ScalarKind;
    use serde_json::json;

    fn compiled(query: Query) -> CompiledQuery {
        let mut query = query;
        query.seal();
        compile(&query).unwrap()
    }

    #[test]
    fn comparison_predicates() {
        let q = compiled(Query::new().where_("n", ">", 1));
        assert!(!q.matches(&json!({"n": 1})));
        assert!(q.matches(&json!({"n": 2})));
        assert!(!q.matches(&json!({"missing": true})));
    }

    #[test]
    fn equality_is_type_coercing_for_dates() {
        let q = compiled(Query::new().where_("dt", "==", "2024-05-01T00:00:00.000Z"));
        assert!(q.matches(&json!({"dt": "2024-05-01T02:00:00.000+02:00"})));
        assert!(!q.matches(&json!({"dt": "2024-05-02T00:00:00.000Z"})));
    }

    #[test]
    fn or_group_folds_disjunctively() {
        let q = compiled(
            Query::new()
                .where_("kind", "==", "fruit")
                .or()
                .where_("name", "==", "apple")
                .where_("name", "==", "pear")
                .end(),
        );
        assert!(q.matches(&json!({"kind": "fruit", "name": "apple"})));
        assert!(q.matches(&json!({"kind": "fruit", "name": "pear"})));
        assert!(!q.matches(&json!({"kind": "fruit", "name": "plum"})));
        assert!(!q.matches(&json!({"kind": "veg", "name": "apple"})));
    }

    #[test]
    fn in_and_not_in() {
        let q = compiled(Query::new().in_("tag", vec![json!("a"), json!("b")]));
        assert!(q.matches(&json!({"tag": "a"})));
        assert!(q.matches(&json!({"tag": ["x", "b"]})));
        assert!(!q.matches(&json!({"tag": "c"})));

        let q = compiled(Query::new().not_in("tag", vec![json!("a")]));
        assert!(!q.matches(&json!({"tag": "a"})));
        assert!(q.matches(&json!({"tag": "b"})));
    }

    #[test]
    fn between_is_inclusive() {
        let q = compiled(Query::new().between("n", 2, 4));
        assert!(!q.matches(&json!({"n": 1})));
        assert!(q.matches(&json!({"n": 2})));
        assert!(q.matches(&json!({"n": 4})));
        assert!(!q.matches(&json!({"n": 5})));
    }

    #[test]
    fn like_positions() {
        let beg = compiled(Query::new().like("s", "He", LikeWhere::Beg));
        assert!(beg.matches(&json!({"s": "hello"})));
        assert!(!beg.matches(&json!({"s": "the"})));

        let end = compiled(Query::new().like("s", "LO", LikeWhere::End));
        assert!(end.matches(&json!({"s": "Hello"})));

        let any = compiled(Query::new().search("s", "ell"));
        assert!(any.matches(&json!({"s": "HELLO"})));
        assert!(!any.matches(&json!({"s": 12})));
    }

    #[test]
    fn regexp_matching() {
        let q = compiled(Query::new().regexp("code", "^[A-Z]{2}-\\d+$"));
        assert!(q.matches(&json!({"code": "AB-123"})));
        assert!(!q.matches(&json!({"code": "ab-123"})));
    }

    #[test]
    fn invalid_regexp_fails_compile() {
        let mut q = Query::new().regexp("x", "(");
        q.seal();
        assert!(compile(&q).is_err());
    }

    #[test]
    fn fulltext_weight() {
        let all = compiled(Query::new().fulltext("text", "quick brown fox", 100));
        assert!(all.matches(&json!({"text": "The Quick Brown Fox Jumps"})));
        assert!(!all.matches(&json!({"text": "the quick red fox"})));

        let half = compiled(Query::new().fulltext("text", "quick brown fox", 50));
        assert!(half.matches(&json!({"text": "the quick red fox"})));
        assert!(!half.matches(&json!({"text": "nothing relevant"})));
    }

    #[test]
    fn fulltext_cjk_characters() {
        let q = compiled(Query::new().fulltext("text", "数据", 100));
        assert!(q.matches(&json!({"text": "这是数据库"})));
        assert!(!q.matches(&json!({"text": "没有匹配"})));
    }

    #[test]
    fn contains_and_empty() {
        let has = compiled(Query::new().contains("tags"));
        assert!(has.matches(&json!({"tags": ["a"]})));
        assert!(!has.matches(&json!({"tags": []})));
        assert!(!has.matches(&json!({})));

        let none = compiled(Query::new().empty("tags"));
        assert!(none.matches(&json!({})));
        assert!(none.matches(&json!({"tags": ""})));
        assert!(!none.matches(&json!({"tags": "x"})));
    }

    #[test]
    fn date_part_predicates() {
        let doc = json!({"created": "2024-03-15T08:30:00.000Z"});
        assert!(compiled(Query::new().year("created", "==", 2024)).matches(&doc));
        assert!(compiled(Query::new().month("created", "==", 3)).matches(&doc));
        assert!(compiled(Query::new().day("created", ">", 10)).matches(&doc));
        assert!(!compiled(Query::new().month("created", "==", 4)).matches(&doc));

        // Millisecond timestamps coerce too.
        let millis = json!({"created": 1_710_490_200_000i64});
        assert!(compiled(Query::new().year("created", "==", 2024)).matches(&millis));
    }

    #[test]
    fn custom_predicate() {
        let q = compiled(Query::new().custom(|doc| doc["n"].as_i64().unwrap_or(0) % 2 == 0));
        assert!(q.matches(&json!({"n": 4})));
        assert!(!q.matches(&json!({"n": 3})));
    }

    #[test]
    fn projection_keep_retains_sort_field() {
        let q = compiled(Query::new().fields(&["id"]).sort("n", true));
        let projected = q.project(&json!({"id": "a", "n": 3, "x": true}));
        assert_eq!(projected, json!({"id": "a", "n": 3}));
    }

    #[test]
    fn projection_drop_spares_sort_field() {
        let q = compiled(Query::new().without(&["n", "x"]).sort("n", false));
        let projected = q.project(&json!({"id": "a", "n": 3, "x": true}));
        assert_eq!(projected, json!({"id": "a", "n": 3}));
    }

    #[test]
    fn fingerprint_stable_and_distinct() {
        let a = {
            let mut q = Query::new().where_("n", ">", 1).fields(&["id"]);
            q.seal();
            fingerprint(&q).unwrap()
        };
        let b = {
            let mut q = Query::new().where_("n", ">", 1).fields(&["id"]);
            q.seal();
            fingerprint(&q).unwrap()
        };
        let c = {
            let mut q = Query::new().where_("n", ">", 2).fields(&["id"]);
            q.seal();
            fingerprint(&q).unwrap()
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn custom_queries_cacheable_only_by_id() {
        let mut anon = Query::new().custom(|_| true);
        anon.seal();
        assert!(fingerprint(&anon).is_none());

        let mut named = Query::new().custom(|_| true).id("evens");
        named.seal();
        assert_eq!(fingerprint(&named).as_deref(), Some("evens"));
    }

    #[test]
    fn scalar_option_is_carried() {
        let q = Query::new().scalar(ScalarKind::Sum, Some("n"));
        assert_eq!(q.scalar, Some((ScalarKind::Sum, Some("n".to_string()))));
    }
}
