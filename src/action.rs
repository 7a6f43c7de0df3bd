//! Actions mutate one record at a time.
//!
//! The applier works on a private copy of the record. The caller's record is
//! replaced by that copy only when every action in the list succeeded, so a
//! failure half way through a pipeline leaves the record exactly as it was.
//! Templates in action parameters are rendered step by step against the
//! bindings, which grow as field actions record `old` and `new`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

use crate::binding::{self, Bindings, Bound, TemplateError, ENTRY, NEW, OLD, RELATED};
use crate::condition::RelationSelector;
use crate::error::{BulkError, Result};
use crate::path::{self, Path, PathError};
use crate::record::{Record, Relation};
use crate::store::RecordLookup;

/// Diff path used for relation changes.
pub const RELATIONS: &str = "relations";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApplyError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("{0}")]
    Selector(String),
    #[error("no related record found through {0}")]
    NoRelatedRecord(String),
    #[error("field '{field}' is absent on related record '{related_id}'")]
    MissingSourceField { field: String, related_id: String },
    #[error("cannot append to '{path}': it holds {kind}")]
    NotAppendable { path: String, kind: &'static str },
    #[error("pipeline step {index} failed: {source}")]
    Step { index: usize, source: Box<ApplyError> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Set {
        path: Path,
        value: Value,
    },
    Clear {
        path: Path,
    },
    Append {
        path: Path,
        value: Value,
    },
    Prepend {
        path: Path,
        value: Value,
    },
    AddRelation {
        relation_type: String,
        target_id: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        traits: BTreeMap<String, String>,
    },
    RemoveRelation {
        relation_type: String,
        target_id: String,
    },
    ReplaceRelation {
        relation_type: String,
        old_target: String,
        new_target: String,
    },
    CopyFromRelated {
        from_field: Path,
        to_field: Path,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relation_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_in_field: Option<Path>,
    },
    Pipeline {
        steps: Vec<Action>,
    },
}

impl Action {
    /// Number of leaf actions, counting through pipelines.
    pub fn weight(&self) -> usize {
        match self {
            Action::Pipeline { steps } => steps.iter().map(Action::weight).sum(),
            _ => 1,
        }
    }

    /// Request-time checks: selectors are well formed, every template token
    /// names a known binding and no written path reaches past
    /// `max_list_index`, since writes pad lists up to the index.
    pub fn validate(&self, max_list_index: usize) -> Result<()> {
        let tokens = |texts: &[&String]| -> Result<()> {
            texts
                .iter()
                .try_for_each(|t| binding::check_str(t.as_str()))
                .map_err(BulkError::from)
        };
        let reach = |path: &Path| -> Result<()> {
            match path.max_index() {
                Some(index) if index > max_list_index => Err(BulkError::Request(format!(
                    "index {} in '{}' exceeds the maximum list index of {}",
                    index, path, max_list_index
                ))),
                _ => Ok(()),
            }
        };
        match self {
            Action::Set { path, value } | Action::Append { path, value } | Action::Prepend { path, value } => {
                reach(path)?;
                binding::check_value(value).map_err(BulkError::from)
            }
            Action::Clear { .. } => Ok(()),
            Action::AddRelation {
                relation_type,
                target_id,
                traits,
            } => {
                tokens(&[relation_type, target_id])?;
                tokens(&traits.values().collect::<Vec<_>>())
            }
            Action::RemoveRelation {
                relation_type,
                target_id,
            } => tokens(&[relation_type, target_id]),
            Action::ReplaceRelation {
                relation_type,
                old_target,
                new_target,
            } => tokens(&[relation_type, old_target, new_target]),
            Action::CopyFromRelated {
                to_field,
                relation_type,
                target_in_field,
                ..
            } => {
                reach(to_field)?;
                RelationSelector::from_parts(relation_type.as_ref(), target_in_field.as_ref()).map(|_| ())
            }
            Action::Pipeline { steps } => steps.iter().try_for_each(|step| step.validate(max_list_index)),
        }
    }
}

/// One observed change to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub path: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

impl Diff {
    fn field(path: &Path, old_value: Option<Value>, new_value: Option<Value>) -> Self {
        Self {
            path: path.to_string(),
            old_value,
            new_value,
        }
    }
    fn relation(old: Option<&Relation>, new: Option<&Relation>) -> Self {
        let as_value = |r: &Relation| serde_json::to_value(r).unwrap_or_default();
        Self {
            path: RELATIONS.to_string(),
            old_value: old.map(as_value),
            new_value: new.map(as_value),
        }
    }
}

pub struct Applier<'l, L: RecordLookup + ?Sized> {
    lookup: &'l L,
}

impl<'l, L: RecordLookup + ?Sized> Applier<'l, L> {
    pub fn new(lookup: &'l L) -> Self {
        Self { lookup }
    }

    /// Applies `actions` in order. On success `record` holds the new state and
    /// the accumulated diffs are returned; on failure `record` is untouched.
    pub fn apply(&self, actions: &[Action], record: &mut Record, bindings: &Bindings) -> std::result::Result<Vec<Diff>, ApplyError> {
        let mut working = record.clone();
        let mut scope = bindings.clone();
        scope.bind(ENTRY, Bound::Record(record.clone()));
        let mut diffs = Vec::new();
        for action in actions {
            self.apply_one(action, &mut working, &mut scope, &mut diffs)?;
        }
        *record = working;
        Ok(diffs)
    }

    fn apply_one(
        &self,
        action: &Action,
        working: &mut Record,
        scope: &mut Bindings,
        diffs: &mut Vec<Diff>,
    ) -> std::result::Result<(), ApplyError> {
        trace!(entry_id = %working.id, ?action, "applying");
        match action {
            Action::Set { path, value } => {
                let value = scope.render_value(value)?;
                let old = working.set(path, value.clone())?;
                note_field(path, old, Some(value), scope, diffs);
            }
            Action::Clear { path } => {
                if let Some(old) = working.clear(path)? {
                    note_field(path, Some(old), None, scope, diffs);
                }
            }
            Action::Append { path, value } => self.extend(path, value, false, working, scope, diffs)?,
            Action::Prepend { path, value } => self.extend(path, value, true, working, scope, diffs)?,
            Action::AddRelation {
                relation_type,
                target_id,
                traits,
            } => {
                let mut relation = Relation::new(scope.render_str(relation_type)?, scope.render_str(target_id)?);
                for (name, value) in traits {
                    relation.traits.insert(name.clone(), scope.render_str(value)?);
                }
                add_relation(working, relation, diffs);
            }
            Action::RemoveRelation {
                relation_type,
                target_id,
            } => {
                let kind = scope.render_str(relation_type)?;
                let target = scope.render_str(target_id)?;
                remove_relations(working, &kind, &target, diffs);
            }
            Action::ReplaceRelation {
                relation_type,
                old_target,
                new_target,
            } => {
                let kind = scope.render_str(relation_type)?;
                let old_target = scope.render_str(old_target)?;
                let new_target = scope.render_str(new_target)?;
                if old_target == new_target {
                    if !working.relations.iter().any(|r| r.matches(&kind, &new_target)) {
                        add_relation(working, Relation::new(kind, new_target), diffs);
                    }
                    return Ok(());
                }
                let removed = remove_relations(working, &kind, &old_target, diffs);
                let mut relation = Relation::new(kind, new_target);
                if let Some(first) = removed.into_iter().next() {
                    relation.traits = first.traits;
                }
                add_relation(working, relation, diffs);
            }
            Action::CopyFromRelated {
                from_field,
                to_field,
                relation_type,
                target_in_field,
            } => {
                let selector = RelationSelector::from_parts(relation_type.as_ref(), target_in_field.as_ref())
                    .map_err(|e| ApplyError::Selector(e.to_string()))?;
                let related = selector
                    .candidates(working, self.lookup)
                    .iter()
                    .find_map(|id| self.lookup.lookup(id))
                    .ok_or_else(|| ApplyError::NoRelatedRecord(describe(&selector)))?;
                let value = related.get(from_field).ok_or_else(|| ApplyError::MissingSourceField {
                    field: from_field.to_string(),
                    related_id: related.id.clone(),
                })?;
                let old = working.set(to_field, value.clone())?;
                scope.bind_if_absent(RELATED, Bound::Record(related));
                note_field(to_field, old, Some(value), scope, diffs);
            }
            Action::Pipeline { steps } => {
                for (index, step) in steps.iter().enumerate() {
                    self.apply_one(step, working, scope, diffs)
                        .map_err(|source| ApplyError::Step {
                            index,
                            source: Box::new(source),
                        })?;
                }
            }
        }
        Ok(())
    }

    fn extend(
        &self,
        path: &Path,
        value: &Value,
        front: bool,
        working: &mut Record,
        scope: &mut Bindings,
        diffs: &mut Vec<Diff>,
    ) -> std::result::Result<(), ApplyError> {
        let value = scope.render_value(value)?;
        let extended = match path::get(&working.fields, path) {
            None | Some(Value::Null) => value,
            Some(Value::String(current)) => {
                let addition = path::stringify(&value);
                Value::String(if front {
                    addition + current
                } else {
                    current.clone() + &addition
                })
            }
            Some(Value::Array(current)) => {
                let mut list = current.clone();
                if front {
                    list.insert(0, value);
                } else {
                    list.push(value);
                }
                Value::Array(list)
            }
            Some(other) => {
                return Err(ApplyError::NotAppendable {
                    path: path.to_string(),
                    kind: kind_of(other),
                });
            }
        };
        let old = working.set(path, extended.clone())?;
        note_field(path, old, Some(extended), scope, diffs);
        Ok(())
    }
}

fn note_field(path: &Path, old: Option<Value>, new: Option<Value>, scope: &mut Bindings, diffs: &mut Vec<Diff>) {
    scope.bind(OLD, Bound::Value(old.clone().unwrap_or(Value::Null)));
    scope.bind(NEW, Bound::Value(new.clone().unwrap_or(Value::Null)));
    if old != new {
        diffs.push(Diff::field(path, old, new));
    }
}

fn add_relation(working: &mut Record, relation: Relation, diffs: &mut Vec<Diff>) {
    if working.position_of(&relation).is_none() {
        diffs.push(Diff::relation(None, Some(&relation)));
        working.relations.push(relation);
    }
}

fn remove_relations(working: &mut Record, kind: &str, target: &str, diffs: &mut Vec<Diff>) -> Vec<Relation> {
    let (removed, kept): (Vec<Relation>, Vec<Relation>) = working
        .relations
        .drain(..)
        .partition(|r| r.matches(kind, target));
    working.relations = kept;
    for relation in &removed {
        diffs.push(Diff::relation(Some(relation), None));
    }
    removed
}

fn describe(selector: &RelationSelector) -> String {
    match selector {
        RelationSelector::Type(kind) => format!("relation '{}'", kind),
        RelationSelector::TargetInField(path) => format!("field '{}'", path),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a map",
    }
}
