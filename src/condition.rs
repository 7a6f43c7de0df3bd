//! Conditions select the records a bulk request acts upon.
//!
//! Evaluation never fails: absent fields, non-numeric operands for ordering
//! operators and dangling relations all simply make the predicate false.
//! Relational conditions follow relations through a [`RecordLookup`] and, on
//! success, leave `related` and `parent` bindings behind for the actions.

use std::collections::HashMap;
use std::sync::Mutex;

use lazy_static::lazy_static;
use regex::Regex;
use seahash::SeaHasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::hash::BuildHasherDefault;
use tracing::debug;

use crate::binding::{Bindings, Bound, PARENT, RELATED};
use crate::error::{BulkError, Result};
use crate::path::{self, Path};
use crate::record::Record;
use crate::store::RecordLookup;

type PatternHasher = BuildHasherDefault<SeaHasher>;

/// Distinct patterns kept compiled at once. The cache starts over when full.
const MAX_CACHED_PATTERNS: usize = 256;

lazy_static! {
    // compiled patterns keyed by their source text
    static ref PATTERNS: Mutex<HashMap<String, Regex, PatternHasher>> = Mutex::new(HashMap::default());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Equals,
    NotEquals,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    IsEmpty,
    IsNotEmpty,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    NotIn,
}

impl Op {
    pub fn needs_value(self) -> bool {
        !matches!(self, Op::IsEmpty | Op::IsNotEmpty)
    }
}

/// How the targets of a relational condition or copy are found: by relation
/// type, or through a field of the record that holds target ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationSelector {
    Type(String),
    TargetInField(Path),
}

impl RelationSelector {
    pub fn from_parts(relation_type: Option<&String>, target_in_field: Option<&Path>) -> Result<Self> {
        match (relation_type, target_in_field) {
            (Some(kind), None) if !kind.is_empty() => Ok(Self::Type(kind.clone())),
            (None, Some(path)) => Ok(Self::TargetInField(path.clone())),
            (Some(_), Some(_)) => Err(BulkError::Request(
                "give either relation_type or target_in_field, not both".into(),
            )),
            _ => Err(BulkError::Request(
                "relation_type or target_in_field is required".into(),
            )),
        }
    }

    /// Candidate target ids in relation order. A field may hold a single id
    /// or a list of ids.
    pub fn candidates<L: RecordLookup + ?Sized>(&self, record: &Record, lookup: &L) -> Vec<String> {
        match self {
            RelationSelector::Type(kind) => lookup
                .relations_of(record)
                .into_iter()
                .filter(|r| &r.kind == kind)
                .map(|r| r.target_id)
                .collect(),
            RelationSelector::TargetInField(path) => match record.get(path) {
                Some(Value::String(id)) if !id.is_empty() => vec![id],
                Some(Value::Array(ids)) => ids
                    .into_iter()
                    .filter_map(|id| match id {
                        Value::String(id) if !id.is_empty() => Some(id),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Field {
        path: Path,
        op: Op,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    Relational {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relation_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_in_field: Option<Path>,
        nested: Box<Condition>,
    },
    And {
        #[serde(default)]
        items: Vec<Condition>,
    },
    Or {
        #[serde(default)]
        items: Vec<Condition>,
    },
    Not {
        item: Box<Condition>,
    },
}

impl Condition {
    pub fn field(path: &str, op: Op, value: Option<Value>) -> Result<Self> {
        Ok(Condition::Field {
            path: path.parse()?,
            op,
            value,
        })
    }
    pub fn related(relation_type: &str, nested: Condition) -> Self {
        Condition::Relational {
            relation_type: Some(relation_type.to_string()),
            target_in_field: None,
            nested: Box::new(nested),
        }
    }
    pub fn related_through(target_in_field: Path, nested: Condition) -> Self {
        Condition::Relational {
            relation_type: None,
            target_in_field: Some(target_in_field),
            nested: Box::new(nested),
        }
    }
    /// Matches every record.
    pub fn always() -> Self {
        Condition::And { items: Vec::new() }
    }

    pub fn depth(&self) -> usize {
        match self {
            Condition::Field { .. } => 1,
            Condition::Relational { nested, .. } => 1 + nested.depth(),
            Condition::Not { item } => 1 + item.depth(),
            Condition::And { items } | Condition::Or { items } => {
                1 + items.iter().map(Condition::depth).max().unwrap_or(0)
            }
        }
    }

    /// Checks everything that can be checked without touching a record.
    pub fn validate(&self, max_depth: usize) -> Result<()> {
        let depth = self.depth();
        if depth > max_depth {
            return Err(BulkError::Request(format!(
                "condition depth {} exceeds maximum allowed depth of {}",
                depth, max_depth
            )));
        }
        self.validate_node()
    }

    fn validate_node(&self) -> Result<()> {
        match self {
            Condition::Field { path, op, value } => {
                if op.needs_value() && value.is_none() {
                    return Err(BulkError::Request(format!("operator {:?} on '{}' needs a value", op, path)));
                }
                match (op, value) {
                    (Op::In | Op::NotIn, Some(v)) if !v.is_array() => Err(BulkError::Request(format!(
                        "operator {:?} on '{}' needs a list value",
                        op, path
                    ))),
                    (Op::Regex, Some(v)) => compiled(&path::stringify(v))
                        .map(|_| ())
                        .ok_or_else(|| BulkError::Request(format!("invalid regex on '{}'", path))),
                    _ => Ok(()),
                }
            }
            Condition::Relational {
                relation_type,
                target_in_field,
                nested,
            } => {
                RelationSelector::from_parts(relation_type.as_ref(), target_in_field.as_ref())?;
                nested.validate_node()
            }
            Condition::And { items } | Condition::Or { items } => {
                items.iter().try_for_each(Condition::validate_node)
            }
            Condition::Not { item } => item.validate_node(),
        }
    }
}

/// Evaluates without keeping any bindings.
pub fn matches<L: RecordLookup + ?Sized>(condition: &Condition, record: &Record, lookup: &L) -> bool {
    evaluate(condition, record, lookup, &mut Bindings::new())
}

/// Evaluates `condition` against `record`. Bindings are only extended when the
/// condition holds; a failing branch leaves them as they were.
pub fn evaluate<L: RecordLookup + ?Sized>(
    condition: &Condition,
    record: &Record,
    lookup: &L,
    bindings: &mut Bindings,
) -> bool {
    match condition {
        Condition::Field { path, op, value } => compare(record.get(path).as_ref(), *op, value.as_ref()),
        Condition::Relational {
            relation_type,
            target_in_field,
            nested,
        } => {
            let selector = match RelationSelector::from_parts(relation_type.as_ref(), target_in_field.as_ref()) {
                Ok(selector) => selector,
                Err(_) => return false,
            };
            for target_id in selector.candidates(record, lookup) {
                let Some(target) = lookup.lookup(&target_id) else {
                    debug!(entry_id = %record.id, target_id = %target_id, "skipping dangling relation");
                    continue;
                };
                let mut scratch = bindings.clone();
                scratch.bind_if_absent(RELATED, Bound::Record(target.clone()));
                scratch.bind_if_absent(PARENT, Bound::Record(record.clone()));
                if evaluate(nested, &target, lookup, &mut scratch) {
                    *bindings = scratch;
                    return true;
                }
            }
            false
        }
        Condition::And { items } => {
            let mut scratch = bindings.clone();
            for item in items {
                if !evaluate(item, record, lookup, &mut scratch) {
                    return false;
                }
            }
            *bindings = scratch;
            true
        }
        Condition::Or { items } => {
            for item in items {
                let mut scratch = bindings.clone();
                if evaluate(item, record, lookup, &mut scratch) {
                    *bindings = scratch;
                    return true;
                }
            }
            false
        }
        Condition::Not { item } => !evaluate(item, record, lookup, &mut bindings.clone()),
    }
}

fn compiled(pattern: &str) -> Option<Regex> {
    let mut patterns = PATTERNS.lock().ok()?;
    if let Some(regex) = patterns.get(pattern) {
        return Some(regex.clone());
    }
    let regex = Regex::new(pattern).ok()?;
    if patterns.len() >= MAX_CACHED_PATTERNS {
        debug!(cached = patterns.len(), "regex cache full, clearing");
        patterns.clear();
    }
    patterns.insert(pattern.to_string(), regex.clone());
    Some(regex)
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (path::as_number(actual), path::as_number(expected)) {
        (Some(a), Some(b)) if actual.is_number() || expected.is_number() => a == b,
        _ => path::stringify(actual) == path::stringify(expected),
    }
}

fn ordering(actual: Option<&Value>, expected: Option<&Value>, accept: fn(f64, f64) -> bool) -> bool {
    match (actual.and_then(path::as_number), expected.and_then(path::as_number)) {
        (Some(a), Some(b)) => accept(a, b),
        _ => false,
    }
}

fn member(actual: &Value, expected: Option<&Value>) -> bool {
    match expected {
        Some(Value::Array(options)) => options.iter().any(|option| values_equal(actual, option)),
        _ => false,
    }
}

/// The operator table for field conditions.
pub fn compare(actual: Option<&Value>, op: Op, expected: Option<&Value>) -> bool {
    let text = |v: Option<&Value>| v.map(path::stringify);
    match op {
        Op::IsEmpty => path::is_empty(actual),
        Op::IsNotEmpty => !path::is_empty(actual),
        Op::Equals => matches!((actual, expected), (Some(a), Some(e)) if values_equal(a, e)),
        Op::NotEquals => !matches!((actual, expected), (Some(a), Some(e)) if values_equal(a, e)),
        Op::Contains => matches!((text(actual), text(expected)), (Some(a), Some(e)) if a.contains(&e)),
        Op::StartsWith => matches!((text(actual), text(expected)), (Some(a), Some(e)) if a.starts_with(&e)),
        Op::EndsWith => matches!((text(actual), text(expected)), (Some(a), Some(e)) if a.ends_with(&e)),
        Op::Regex => match (text(actual), text(expected).and_then(|p| compiled(&p))) {
            (Some(a), Some(regex)) => regex.is_match(&a),
            _ => false,
        },
        Op::Gt => ordering(actual, expected, |a, b| a > b),
        Op::Lt => ordering(actual, expected, |a, b| a < b),
        Op::Gte => ordering(actual, expected, |a, b| a >= b),
        Op::Lte => ordering(actual, expected, |a, b| a <= b),
        Op::In => actual.is_some_and(|a| member(a, expected)),
        Op::NotIn => !actual.is_some_and(|a| member(a, expected)),
    }
}
