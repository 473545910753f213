//! `$previous` references in step inputs.
//!
//! A string value in a step input that starts with `$previous` is an
//! expression over the prior step's output:
//!
//! ```text
//! $previous                 the whole output
//! $previous.results         field of a record
//! $previous.results[0]      array element
//! $previous.results[0:3]    array slice (either bound may be omitted)
//! $previous.results.url     field access on an array projects over it
//! ```
//!
//! Records and arrays in the input are walked recursively. A string that
//! mentions `$previous` anywhere but at its start is rejected rather than
//! interpolated; any other string is passed through untouched.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::errors::ErrorKind;
use crate::value::Value;

pub const PREVIOUS_TOKEN: &str = "$previous";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReferenceError {
    /// The expression does not follow the reference grammar.
    #[error("invalid reference '{expression}': {reason}")]
    Syntax { expression: String, reason: String },

    /// There is no prior output to resolve against.
    #[error("reference '{expression}' has no previous output to resolve against")]
    NoPreviousOutput { expression: String },

    /// A record lacks the named field.
    #[error("reference '{expression}': field '{field}' not found at '{path}'")]
    MissingField {
        expression: String,
        field: String,
        path: String,
    },

    /// An index or slice bound lies outside the array.
    #[error("reference '{expression}': index {index} out of range at '{path}' (length {len})")]
    IndexOutOfRange {
        expression: String,
        index: usize,
        len: usize,
        path: String,
    },

    /// `$previous` appears inside a larger string.
    #[error("reference embedded in text '{text}': a reference must be the whole string value")]
    Embedded { text: String },

    /// A segment was applied to a value of the wrong shape.
    #[error("reference '{expression}': cannot apply '{segment}' to {found} at '{path}'")]
    TypeMismatch {
        expression: String,
        segment: String,
        found: String,
        path: String,
    },
}

impl ReferenceError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ReferenceResolutionError
    }
}

// ─── Parsing ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
    Slice(Option<usize>, Option<usize>),
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Field(name) => write!(f, ".{name}"),
            Segment::Index(i) => write!(f, "[{i}]"),
            Segment::Slice(a, b) => {
                let bound = |x: &Option<usize>| x.map(|v| v.to_string()).unwrap_or_default();
                write!(f, "[{}:{}]", bound(a), bound(b))
            }
        }
    }
}

fn is_field_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

fn parse(expression: &str) -> Result<Vec<Segment>, ReferenceError> {
    let syntax = |reason: String| ReferenceError::Syntax {
        expression: expression.to_string(),
        reason,
    };

    let Some(mut rest) = expression.strip_prefix(PREVIOUS_TOKEN) else {
        return Err(syntax(format!("must start with {PREVIOUS_TOKEN}")));
    };

    let mut segments = Vec::new();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after
                .find(|c: char| !is_field_char(c))
                .unwrap_or(after.len());
            if end == 0 {
                return Err(syntax("empty field name".into()));
            }
            segments.push(Segment::Field(after[..end].to_string()));
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let close = after
                .find(']')
                .ok_or_else(|| syntax("unclosed '['".into()))?;
            segments.push(parse_bracket(&after[..close]).map_err(syntax)?);
            rest = &after[close + 1..];
        } else {
            return Err(syntax(format!("unexpected '{rest}'")));
        }
    }
    Ok(segments)
}

fn parse_bracket(inner: &str) -> Result<Segment, String> {
    let bound = |s: &str| -> Result<Option<usize>, String> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }
        s.parse::<usize>()
            .map(Some)
            .map_err(|_| format!("'{s}' is not a non-negative integer"))
    };

    match inner.split_once(':') {
        Some((a, b)) => Ok(Segment::Slice(bound(a)?, bound(b)?)),
        None => bound(inner)?
            .map(Segment::Index)
            .ok_or_else(|| "empty index".to_string()),
    }
}

// ─── Evaluation ─────────────────────────────────────────────────────────────

struct Eval<'a> {
    expression: &'a str,
    path: String,
}

impl Eval<'_> {
    fn apply(&self, value: &Value, segment: &Segment) -> Result<Value, ReferenceError> {
        match (segment, value) {
            (Segment::Field(name), Value::Record(fields)) => {
                fields.get(name).cloned().ok_or_else(|| ReferenceError::MissingField {
                    expression: self.expression.to_string(),
                    field: name.clone(),
                    path: self.path.clone(),
                })
            }
            (Segment::Field(_), Value::Array(items)) => items
                .iter()
                .map(|item| self.apply(item, segment))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            (Segment::Index(i), Value::Array(items)) => {
                items
                    .get(*i)
                    .cloned()
                    .ok_or_else(|| self.out_of_range(*i, items.len()))
            }
            (Segment::Slice(a, b), Value::Array(items)) => {
                let start = a.unwrap_or(0);
                let end = b.unwrap_or(items.len());
                if start > items.len() {
                    return Err(self.out_of_range(start, items.len()));
                }
                if end > items.len() {
                    return Err(self.out_of_range(end, items.len()));
                }
                Ok(Value::Array(items[start..end.max(start)].to_vec()))
            }
            (segment, other) => Err(ReferenceError::TypeMismatch {
                expression: self.expression.to_string(),
                segment: segment.to_string(),
                found: other.kind_name().to_string(),
                path: self.path.clone(),
            }),
        }
    }

    fn out_of_range(&self, index: usize, len: usize) -> ReferenceError {
        ReferenceError::IndexOutOfRange {
            expression: self.expression.to_string(),
            index,
            len,
            path: self.path.clone(),
        }
    }
}

/// Evaluate a single reference expression against `previous`.
pub fn resolve_reference(
    expression: &str,
    previous: Option<&Value>,
) -> Result<Value, ReferenceError> {
    let segments = parse(expression)?;
    let Some(previous) = previous else {
        return Err(ReferenceError::NoPreviousOutput {
            expression: expression.to_string(),
        });
    };

    let mut eval = Eval {
        expression,
        path: PREVIOUS_TOKEN.to_string(),
    };
    let mut current = previous.clone();
    for segment in &segments {
        current = eval.apply(&current, segment)?;
        eval.path.push_str(&segment.to_string());
    }
    Ok(current)
}

pub fn is_reference(s: &str) -> bool {
    s.starts_with(PREVIOUS_TOKEN)
}

fn mentions_reference(s: &str) -> bool {
    s.contains(PREVIOUS_TOKEN)
}

/// Replace every reference in `input` with what it points to.
pub fn resolve_input(input: &Value, previous: Option<&Value>) -> Result<Value, ReferenceError> {
    match input {
        Value::String(s) if is_reference(s) => resolve_reference(s, previous),
        Value::String(s) if mentions_reference(s) => {
            Err(ReferenceError::Embedded { text: s.clone() })
        }
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_input(item, previous))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Record(fields) => fields
            .iter()
            .map(|(k, v)| resolve_input(v, previous).map(|v| (k.clone(), v)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(Value::Record),
        other => Ok(other.clone()),
    }
}

/// Whether `input` contains any reference.
pub fn has_references(input: &Value) -> bool {
    match input {
        Value::String(s) => mentions_reference(s),
        Value::Array(items) => items.iter().any(has_references),
        Value::Record(fields) => fields.values().any(has_references),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_output() -> Value {
        Value::from(json!({
            "results": [
                {"url": "a", "rank": 1},
                {"url": "b", "rank": 2},
                {"url": "c", "rank": 3},
                {"url": "d", "rank": 4}
            ],
            "meta": {"total": 4}
        }))
    }

    #[test]
    fn test_slice_then_project() {
        let out = resolve_reference("$previous.results[0:3].url", Some(&search_output())).unwrap();
        assert_eq!(out, Value::from(json!(["a", "b", "c"])));
    }

    #[test]
    fn test_index_and_nested_field() {
        let prev = search_output();
        assert_eq!(
            resolve_reference("$previous.results[1].url", Some(&prev)).unwrap(),
            Value::from("b")
        );
        assert_eq!(
            resolve_reference("$previous.meta.total", Some(&prev)).unwrap(),
            Value::Integer(4)
        );
        assert_eq!(resolve_reference("$previous", Some(&prev)).unwrap(), prev);
    }

    #[test]
    fn test_open_slice_bounds() {
        let prev = search_output();
        let tail = resolve_reference("$previous.results[2:].rank", Some(&prev)).unwrap();
        assert_eq!(tail, Value::from(json!([3, 4])));
        let head = resolve_reference("$previous.results[:1].url", Some(&prev)).unwrap();
        assert_eq!(head, Value::from(json!(["a"])));
    }

    #[test]
    fn test_missing_field() {
        let err = resolve_reference("$previous.items", Some(&search_output())).unwrap_err();
        assert!(matches!(
            err,
            ReferenceError::MissingField { ref field, .. } if field == "items"
        ));
        assert_eq!(err.kind(), ErrorKind::ReferenceResolutionError);
    }

    #[test]
    fn test_projection_requires_field_on_every_element() {
        let prev = Value::from(json!([{"url": "a"}, {"name": "b"}]));
        let err = resolve_reference("$previous.url", Some(&prev)).unwrap_err();
        assert!(matches!(err, ReferenceError::MissingField { .. }));
    }

    #[test]
    fn test_index_out_of_range() {
        let err = resolve_reference("$previous.results[9]", Some(&search_output())).unwrap_err();
        assert!(matches!(
            err,
            ReferenceError::IndexOutOfRange { index: 9, len: 4, .. }
        ));
        let err = resolve_reference("$previous.results[1:9]", Some(&search_output())).unwrap_err();
        assert!(matches!(err, ReferenceError::IndexOutOfRange { .. }));
    }

    #[test]
    fn test_type_mismatch() {
        let err = resolve_reference("$previous.meta[0]", Some(&search_output())).unwrap_err();
        assert!(matches!(
            err,
            ReferenceError::TypeMismatch { ref found, .. } if found == "record"
        ));
        let err = resolve_reference("$previous.meta.total.x", Some(&search_output())).unwrap_err();
        assert!(err.to_string().contains("$previous.meta.total"));
    }

    #[test]
    fn test_syntax_errors() {
        for bad in [
            "$previous.",
            "$previous[",
            "$previous[-1]",
            "$previous[]",
            "$previousfoo",
            "$previous..a",
        ] {
            let err = resolve_reference(bad, Some(&Value::Null)).unwrap_err();
            assert!(
                matches!(err, ReferenceError::Syntax { .. }),
                "{bad}: {err:?}"
            );
        }
    }

    #[test]
    fn test_no_previous_output() {
        let err = resolve_reference("$previous.x", None).unwrap_err();
        assert!(matches!(err, ReferenceError::NoPreviousOutput { .. }));
    }

    #[test]
    fn test_resolve_input_walks_structure() {
        let input = Value::from(json!({
            "urls": "$previous.results[0:2].url",
            "limit": 5,
            "nested": [{"first": "$previous.results[0].url"}],
            "note": "literal text"
        }));
        assert!(has_references(&input));
        let out = resolve_input(&input, Some(&search_output())).unwrap();
        assert_eq!(
            out,
            Value::from(json!({
                "urls": ["a", "b"],
                "limit": 5,
                "nested": [{"first": "a"}],
                "note": "literal text"
            }))
        );
    }

    #[test]
    fn test_embedded_reference_is_rejected() {
        let input = Value::from(json!({"prompt": "Summarize: $previous.meta"}));
        assert!(has_references(&input));
        let err = resolve_input(&input, Some(&search_output())).unwrap_err();
        assert!(matches!(err, ReferenceError::Embedded { .. }), "{err:?}");
        assert_eq!(err.kind(), ErrorKind::ReferenceResolutionError);

        let previous = search_output();
        let err = resolve_input(&Value::from("$previous text"), Some(&previous)).unwrap_err();
        assert!(matches!(err, ReferenceError::Syntax { .. }), "{err:?}");
    }

    #[test]
    fn test_input_without_references_needs_no_previous() {
        let input = Value::from(json!({"q": "rust"}));
        assert!(!has_references(&input));
        assert_eq!(resolve_input(&input, None).unwrap(), input);
    }
}
