//! Query operator evaluation.
//!
//! One evaluation table shared by the table-scan executor, the live-query
//! monitors, and the `test` method of every index. Specialized operators
//! (anything containing `:`) are owned by their index type and are not
//! evaluated here.

use regex::Regex;

use crate::index::key::{compare_indexable, same_kind};
use crate::value::Value;

use super::QueryError;

/// The standard operator set. Anything else must be a specialized
/// `<indextype>:<op>` operator backed by an index.
pub const STANDARD_OPERATORS: &[&str] = &[
    "<", "<=", "==", "!=", ">=", ">", "like", "!like", "in", "!in", "matches", "!matches",
    "between", "!between", "has", "!has", "contains", "!contains", "exists", "!exists",
];

/// True for operators every backend can table-scan.
pub fn is_standard(op: &str) -> bool {
    STANDARD_OPERATORS.contains(&op)
}

/// True for `<indextype>:<op>` operators that require a matching index.
pub fn is_specialized(op: &str) -> bool {
    op.contains(':')
}

/// Validates an operator's compare operand.
pub fn validate_operand(op: &str, compare: &Value) -> Result<(), QueryError> {
    match op {
        "in" | "!in" => match compare.as_array() {
            Some(list) if !list.is_empty() => Ok(()),
            _ => Err(QueryError::InvalidCompareValue {
                op: op.to_string(),
                reason: "expected a non-empty list".to_string(),
            }),
        },
        "between" | "!between" => match compare.as_array() {
            Some(list) if list.len() == 2 => Ok(()),
            _ => Err(QueryError::InvalidCompareValue {
                op: op.to_string(),
                reason: "expected a two-element list".to_string(),
            }),
        },
        "matches" | "!matches" => {
            let source = compare
                .as_text()
                .ok_or_else(|| QueryError::InvalidCompareValue {
                    op: op.to_string(),
                    reason: "expected a regular expression source string".to_string(),
                })?;
            Regex::new(source).map_err(|e| QueryError::InvalidCompareValue {
                op: op.to_string(),
                reason: e.to_string(),
            })?;
            Ok(())
        }
        "has" | "!has" => compare
            .as_text()
            .map(|_| ())
            .ok_or_else(|| QueryError::InvalidCompareValue {
                op: op.to_string(),
                reason: "expected a property name".to_string(),
            }),
        _ if is_standard(op) || is_specialized(op) => Ok(()),
        _ => Err(QueryError::UnknownOperator { op: op.to_string() }),
    }
}

/// Evaluates a standard operator against a node's property value.
///
/// `value` is `None` when the property is absent. Operands are assumed to be
/// validated; a malformed operand simply fails the match.
pub fn evaluate(value: Option<&Value>, op: &str, compare: &Value) -> bool {
    match op {
        "exists" => value.is_some(),
        "!exists" => value.is_none(),
        "==" => {
            value.is_some()
                && same_kind(value, Some(compare))
                && compare_indexable(value, Some(compare)).is_eq()
        }
        "!=" => !(value.is_some()
            && same_kind(value, Some(compare))
            && compare_indexable(value, Some(compare)).is_eq()),
        "<" => ordered(value, compare, |o| o.is_lt()),
        "<=" => ordered(value, compare, |o| o.is_le()),
        ">" => ordered(value, compare, |o| o.is_gt()),
        ">=" => ordered(value, compare, |o| o.is_ge()),
        "like" => like(value, compare),
        "!like" => !like(value, compare),
        "matches" => regex_match(value, compare),
        "!matches" => !regex_match(value, compare),
        "in" => in_list(value, compare),
        "!in" => !in_list(value, compare),
        "between" => between(value, compare),
        "!between" => value.is_some() && !between(value, compare),
        "has" => has(value, compare),
        "!has" => !has(value, compare),
        "contains" => contains(value, compare),
        "!contains" => !contains(value, compare),
        _ => false,
    }
}

fn ordered(
    value: Option<&Value>,
    compare: &Value,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    value.is_some()
        && same_kind(value, Some(compare))
        && accept(compare_indexable(value, Some(compare)))
}

fn like(value: Option<&Value>, compare: &Value) -> bool {
    let (Some(Value::Text(text)), Some(pattern)) = (value, compare.as_text()) else {
        return false;
    };
    like_match(&text.to_lowercase(), &pattern.to_lowercase())
}

/// Case-insensitive `*`-wildcard matcher.
fn like_match(text: &str, pattern: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return text == pattern;
    }
    let mut rest = text;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            let Some(after) = rest.strip_prefix(segment) else {
                return false;
            };
            rest = after;
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            let Some(at) = rest.find(segment) else {
                return false;
            };
            rest = &rest[at + segment.len()..];
        }
    }
    true
}

fn regex_match(value: Option<&Value>, compare: &Value) -> bool {
    let (Some(Value::Text(text)), Some(source)) = (value, compare.as_text()) else {
        return false;
    };
    Regex::new(source).map(|re| re.is_match(text)).unwrap_or(false)
}

fn in_list(value: Option<&Value>, compare: &Value) -> bool {
    let (Some(value), Some(list)) = (value, compare.as_array()) else {
        return false;
    };
    list.iter()
        .any(|candidate| same_kind(Some(value), Some(candidate))
            && compare_indexable(Some(value), Some(candidate)).is_eq())
}

fn between(value: Option<&Value>, compare: &Value) -> bool {
    let (Some(_), Some(bounds)) = (value, compare.as_array()) else {
        return false;
    };
    let [low, high] = bounds.as_slice() else {
        return false;
    };
    same_kind(value, Some(low))
        && same_kind(value, Some(high))
        && compare_indexable(value, Some(low)).is_ge()
        && compare_indexable(value, Some(high)).is_le()
}

fn has(value: Option<&Value>, compare: &Value) -> bool {
    let (Some(Value::Object(map)), Some(key)) = (value, compare.as_text()) else {
        return false;
    };
    map.contains_key(key)
}

fn contains(value: Option<&Value>, compare: &Value) -> bool {
    let Some(Value::Array(elements)) = value else {
        return false;
    };
    let holds = |needle: &Value| {
        elements.iter().any(|e| {
            same_kind(Some(e), Some(needle)) && compare_indexable(Some(e), Some(needle)).is_eq()
        })
    };
    match compare {
        Value::Array(needles) => needles.iter().all(holds),
        single => holds(single),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(v: f64) -> Value {
        Value::Number(v)
    }

    #[test]
    fn test_comparison_operators() {
        assert!(evaluate(Some(&n(5.0)), "==", &n(5.0)));
        assert!(!evaluate(Some(&n(5.0)), "==", &n(6.0)));
        assert!(evaluate(Some(&n(5.0)), "!=", &n(6.0)));
        assert!(evaluate(None, "!=", &n(6.0)));
        assert!(evaluate(Some(&n(5.0)), "<", &n(10.0)));
        assert!(evaluate(Some(&n(5.0)), "<=", &n(5.0)));
        assert!(evaluate(Some(&n(11.0)), ">", &n(10.0)));
        assert!(!evaluate(None, ">", &n(10.0)));
    }

    #[test]
    fn test_kind_mismatch_fails_ordered_ops() {
        assert!(!evaluate(Some(&Value::Text("5".into())), "<", &n(10.0)));
        assert!(!evaluate(Some(&Value::Text("5".into())), "==", &n(5.0)));
    }

    #[test]
    fn test_exists() {
        assert!(evaluate(Some(&n(0.0)), "exists", &Value::Null));
        assert!(evaluate(None, "!exists", &Value::Null));
    }

    #[test]
    fn test_like() {
        let name = Value::Text("Alice Cooper".into());
        assert!(evaluate(Some(&name), "like", &Value::Text("alice*".into())));
        assert!(evaluate(Some(&name), "like", &Value::Text("*cooper".into())));
        assert!(evaluate(Some(&name), "like", &Value::Text("*ice*".into())));
        assert!(!evaluate(Some(&name), "like", &Value::Text("bob*".into())));
        assert!(evaluate(Some(&name), "!like", &Value::Text("bob*".into())));
        // No wildcard means exact (case-insensitive) match.
        assert!(evaluate(Some(&name), "like", &Value::Text("alice cooper".into())));
    }

    #[test]
    fn test_matches() {
        let name = Value::Text("post_42".into());
        assert!(evaluate(Some(&name), "matches", &Value::Text(r"^post_\d+$".into())));
        assert!(evaluate(Some(&name), "!matches", &Value::Text(r"^user_".into())));
    }

    #[test]
    fn test_in_and_between() {
        assert!(evaluate(Some(&n(2.0)), "in", &Value::array([1, 2, 3])));
        assert!(evaluate(Some(&n(9.0)), "!in", &Value::array([1, 2, 3])));
        assert!(evaluate(Some(&n(5.0)), "between", &Value::array([1, 10])));
        assert!(!evaluate(Some(&n(11.0)), "between", &Value::array([1, 10])));
        assert!(evaluate(Some(&n(11.0)), "!between", &Value::array([1, 10])));
        // Absent values match neither between nor !between.
        assert!(!evaluate(None, "between", &Value::array([1, 10])));
        assert!(!evaluate(None, "!between", &Value::array([1, 10])));
    }

    #[test]
    fn test_has_and_contains() {
        let user = Value::object([("name", "Alice")]);
        assert!(evaluate(Some(&user), "has", &Value::Text("name".into())));
        assert!(evaluate(Some(&user), "!has", &Value::Text("age".into())));

        let tags = Value::array(["rust", "db"]);
        assert!(evaluate(Some(&tags), "contains", &Value::Text("rust".into())));
        assert!(evaluate(Some(&tags), "contains", &Value::array(["rust", "db"])));
        assert!(!evaluate(Some(&tags), "contains", &Value::array(["rust", "js"])));
        assert!(evaluate(Some(&tags), "!contains", &Value::Text("js".into())));
    }

    #[test]
    fn test_validate_operand() {
        assert!(validate_operand("in", &Value::array([1])).is_ok());
        assert!(validate_operand("in", &Value::Array(Vec::new())).is_err());
        assert!(validate_operand("between", &Value::array([1, 2])).is_ok());
        assert!(validate_operand("between", &Value::array([1])).is_err());
        assert!(validate_operand("matches", &Value::Text("[a-z]+".into())).is_ok());
        assert!(validate_operand("matches", &Value::Text("[unclosed".into())).is_err());
        assert!(validate_operand("matches", &n(1.0)).is_err());
        assert!(validate_operand("bogus", &Value::Null).is_err());
        assert!(validate_operand("fulltext:contains", &Value::Text("x".into())).is_ok());
    }
}
