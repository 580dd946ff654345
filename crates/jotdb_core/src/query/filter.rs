//! Predicate tree nodes and value comparison semantics.

use chrono::{DateTime, Datelike, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

/// Comparison operator for `where` style predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CompareOp {
    /// Parses an operator token. Unknown tokens fall back to equality.
    #[must_use]
    pub fn parse(token: &str) -> Self {
        match token.trim() {
            "!=" | "<>" => Self::Ne,
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "==" | "=" => Self::Eq,
            other => {
                tracing::warn!(op = other, "unknown comparison operator, using ==");
                Self::Eq
            }
        }
    }

    /// Applies the operator to a comparison outcome.
    ///
    /// Incomparable values (`None`) only satisfy `!=`.
    #[must_use]
    pub fn check(self, ordering: Option<Ordering>) -> bool {
        match (self, ordering) {
            (Self::Eq, Some(Ordering::Equal)) => true,
            (Self::Ne, Some(Ordering::Equal)) => false,
            (Self::Ne, _) => true,
            (Self::Lt, Some(Ordering::Less)) => true,
            (Self::Le, Some(Ordering::Less | Ordering::Equal)) => true,
            (Self::Gt, Some(Ordering::Greater)) => true,
            (Self::Ge, Some(Ordering::Greater | Ordering::Equal)) => true,
            _ => false,
        }
    }
}

/// Position constraint for `like` predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LikeWhere {
    /// Match at the beginning of the value.
    Beg,
    /// Match at the end of the value.
    End,
    /// Match anywhere.
    Anywhere,
}

/// Date component extracted by `month`/`day`/`year` predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatePart {
    /// Day of month, 1-31.
    Day,
    /// Month, 1-12.
    Month,
    /// Calendar year.
    Year,
}

/// One node of the predicate tree.
///
/// Nodes accumulate in builder order. Groups fold their children
/// disjunctively when `or` is set, conjunctively otherwise.
#[derive(Clone)]
pub(crate) enum FilterNode {
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
        pattern: String,
    },
    Fulltext {
        field: String,
        needle: String,
        weight: u8,
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
        children: Vec<FilterNode>,
    },
}

impl std::fmt::Debug for FilterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compare { field, op, value } => {
                write!(f, "Compare({field} {op:?} {value})")
            }
            Self::In { field, negate, .. } => {
                write!(f, "{}({field})", if *negate { "NotIn" } else { "In" })
            }
            Self::Between { field, .. } => write!(f, "Between({field})"),
            Self::Like { field, .. } => write!(f, "Like({field})"),
            Self::Regexp { field, .. } => write!(f, "Regexp({field})"),
            Self::Fulltext { field, .. } => write!(f, "Fulltext({field})"),
            Self::Contains { field } => write!(f, "Contains({field})"),
            Self::Empty { field } => write!(f, "Empty({field})"),
            Self::DatePart { field, part, .. } => write!(f, "DatePart({field} {part:?})"),
            Self::Custom { .. } => write!(f, "Custom"),
            Self::Group { or, children } => {
                write!(f, "Group(or={or}, {} children)", children.len())
            }
        }
    }
}

/// Parses a date-shaped ISO-8601 string to epoch milliseconds.
///
/// The cheap shape check keeps ordinary strings off the full parser.
#[must_use]
pub(crate) fn date_millis(value: &Value) -> Option<i64> {
    let s = value.as_str()?;
    let b = s.as_bytes();
    if b.len() < 10 || b[4] != b'-' || b[7] != b'-' {
        return None;
    }
    if b.len() == 10 {
        // Plain date: midnight UTC.
        let date = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis());
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Coerces a value to epoch milliseconds for the date predicates.
#[must_use]
pub(crate) fn as_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(_) => date_millis(value),
        _ => None,
    }
}

/// Compares two document values.
///
/// Numbers compare numerically, date-shaped strings by epoch milliseconds
/// (also against numbers), strings lexicographically, booleans as
/// `false < true`. Mismatched types are incomparable.
#[must_use]
pub(crate) fn value_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Value::Number(x), Value::Number(y)) = (a, b) {
        return x.as_f64()?.partial_cmp(&y.as_f64()?);
    }

    match (date_millis(a), date_millis(b)) {
        (Some(x), Some(y)) => return Some(x.cmp(&y)),
        (Some(x), None) => {
            if let Value::Number(n) = b {
                return Some(x.cmp(&n.as_i64()?));
            }
        }
        (None, Some(y)) => {
            if let Value::Number(n) = a {
                return Some(n.as_i64()?.cmp(&y));
            }
        }
        (None, None) => {}
    }

    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Equality with the same coercions as [`value_cmp`].
#[must_use]
pub(crate) fn value_eq(a: &Value, b: &Value) -> bool {
    value_cmp(a, b) == Some(Ordering::Equal) || a == b
}

/// Whether a field value counts as empty.
///
/// Missing fields, `null`, empty strings, and empty arrays or objects are
/// empty.
#[must_use]
pub(crate) fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        _ => false,
    }
}

/// Coerces a field value to text for the substring predicates.
#[must_use]
pub(crate) fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Extracts a date component from a coerced timestamp.
#[must_use]
pub(crate) fn date_component(millis: i64, part: DatePart) -> Option<i64> {
    let dt = DateTime::<Utc>::from_timestamp_millis(millis)?;
    Some(match part {
        DatePart::Day => i64::from(dt.day()),
        DatePart::Month => i64::from(dt.month()),
        DatePart::Year => i64::from(dt.year()),
    })
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{30FF}'     // Hiragana, Katakana
        | '\u{3400}'..='\u{4DBF}'   // CJK extension A
        | '\u{4E00}'..='\u{9FFF}'   // CJK unified ideographs
        | '\u{AC00}'..='\u{D7AF}'   // Hangul syllables
        | '\u{F900}'..='\u{FAFF}'   // CJK compatibility ideographs
    )
}

/// Splits a lowercased full-text needle into tokens.
///
/// CJK characters tokenize individually; everything else splits on
/// whitespace.
#[must_use]
pub(crate) fn fulltext_tokens(needle: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for c in needle.to_lowercase().chars() {
        if is_cjk(c) {
            if !word.is_empty() {
                tokens.push(std::mem::take(&mut word));
            }
            tokens.push(c.to_string());
        } else if c.is_whitespace() {
            if !word.is_empty() {
                tokens.push(std::mem::take(&mut word));
            }
        } else {
            word.push(c);
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operator_parsing() {
        assert_eq!(CompareOp::parse(">"), CompareOp::Gt);
        assert_eq!(CompareOp::parse("<="), CompareOp::Le);
        assert_eq!(CompareOp::parse("="), CompareOp::Eq);
        assert_eq!(CompareOp::parse("<>"), CompareOp::Ne);
        assert_eq!(CompareOp::parse("???"), CompareOp::Eq);
    }

    #[test]
    fn incomparable_satisfies_only_ne() {
        assert!(CompareOp::Ne.check(None));
        assert!(!CompareOp::Eq.check(None));
        assert!(!CompareOp::Lt.check(None));
    }

    #[test]
    fn numbers_compare_numerically() {
        assert_eq!(value_cmp(&json!(1), &json!(1.0)), Some(Ordering::Equal));
        assert_eq!(value_cmp(&json!(2), &json!(10)), Some(Ordering::Less));
    }

    #[test]
    fn date_strings_compare_by_epoch() {
        let a = json!("2024-01-02T00:00:00.000Z");
        let b = json!("2024-01-10T00:00:00.000Z");
        assert_eq!(value_cmp(&a, &b), Some(Ordering::Less));

        // Same instant, different textual offsets.
        let utc = json!("2024-01-02T10:00:00.000Z");
        let offset = json!("2024-01-02T12:00:00.000+02:00");
        assert_eq!(value_cmp(&utc, &offset), Some(Ordering::Equal));
    }

    #[test]
    fn date_string_compares_against_millis() {
        let date = json!("1970-01-01T00:00:01.000Z");
        assert_eq!(value_cmp(&date, &json!(1000)), Some(Ordering::Equal));
        assert_eq!(value_cmp(&json!(500), &date), Some(Ordering::Less));
    }

    #[test]
    fn plain_dates_parse_at_midnight() {
        assert_eq!(date_millis(&json!("1970-01-02")), Some(86_400_000));
        assert_eq!(date_millis(&json!("not a date")), None);
        assert_eq!(date_millis(&json!("12345-not")), None);
    }

    #[test]
    fn mismatched_types_incomparable() {
        assert_eq!(value_cmp(&json!("a"), &json!(1)), None);
        assert_eq!(value_cmp(&json!(true), &json!("true")), None);
    }

    #[test]
    fn emptiness() {
        assert!(is_empty_value(None));
        assert!(is_empty_value(Some(&Value::Null)));
        assert!(is_empty_value(Some(&json!(""))));
        assert!(is_empty_value(Some(&json!([]))));
        assert!(is_empty_value(Some(&json!({}))));
        assert!(!is_empty_value(Some(&json!(0))));
        assert!(!is_empty_value(Some(&json!(false))));
        assert!(!is_empty_value(Some(&json!("x"))));
    }

    #[test]
    fn date_components() {
        let millis = date_millis(&json!("2024-03-15T12:00:00.000Z")).unwrap();
        assert_eq!(date_component(millis, DatePart::Year), Some(2024));
        assert_eq!(date_component(millis, DatePart::Month), Some(3));
        assert_eq!(date_component(millis, DatePart::Day), Some(15));
    }

    #[test]
    fn fulltext_tokenization() {
        assert_eq!(fulltext_tokens("Hello  World"), vec!["hello", "world"]);
        assert_eq!(fulltext_tokens("数据库引擎"), vec!["数", "据", "库", "引", "擎"]);
        assert_eq!(fulltext_tokens("rust数据"), vec!["rust", "数", "据"]);
        assert!(fulltext_tokens("").is_empty());
    }
}
