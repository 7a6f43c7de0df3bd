//! The request and result shapes exchanged with whoever drives the engine.

use serde::{Deserialize, Serialize};

use crate::action::{Action, Diff};
use crate::binding::Bindings;
use crate::condition::Condition;
use crate::error::{BulkError, Result};

/// Request-time bounds, taken from the engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_condition_depth: usize,
    pub max_actions: usize,
    /// Largest list index a written path may address; writes pad lists up
    /// to the index.
    pub max_list_index: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_condition_depth: 32, max_actions: 256, max_list_index: 1024 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkRequest {
    /// Ignored when `entry_ids` is given, but still validated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub dry_run: bool,
    /// An explicit workset; bypasses the matching pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_ids: Option<Vec<String>>,
}

impl BulkRequest {
    pub fn new(condition: Condition, actions: Vec<Action>) -> Self {
        Self {
            condition: Some(condition),
            actions,
            dry_run: false,
            entry_ids: None,
        }
    }
    pub fn for_ids(entry_ids: Vec<String>, actions: Vec<Action>) -> Self {
        Self {
            condition: None,
            actions,
            dry_run: false,
            entry_ids: Some(entry_ids),
        }
    }
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn validate(&self, limits: &Limits) -> Result<()> {
        let Limits { max_condition_depth, max_actions, max_list_index } = *limits;
        match (&self.condition, &self.entry_ids) {
            (Some(condition), _) => condition.validate(max_condition_depth)?,
            (None, None) => {
                return Err(BulkError::Request(
                    "either a condition or entry_ids is required".into(),
                ));
            }
            (None, Some(_)) => (),
        }
        if self.actions.is_empty() {
            return Err(BulkError::Request("no actions given".into()));
        }
        let weight: usize = self.actions.iter().map(Action::weight).sum();
        if weight > max_actions {
            return Err(BulkError::Request(format!(
                "{} actions exceed the maximum of {}",
                weight, max_actions
            )));
        }
        self.actions.iter().try_for_each(|action| action.validate(max_list_index))
    }
}

/// A matched record id plus whatever the match bound. Lives for one run only.
///
/// A record the store failed to load while matching still gets an item, with
/// `error` set, so the failure is reported instead of silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkItem {
    pub entry_id: String,
    pub bindings: Bindings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkItem {
    pub fn bare(entry_id: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            bindings: Bindings::new(),
            error: None,
        }
    }
    pub fn matched(entry_id: impl Into<String>, bindings: Bindings) -> Self {
        Self { bindings, ..Self::bare(entry_id) }
    }
    pub fn unreadable(entry_id: impl Into<String>, error: impl ToString) -> Self {
        Self { error: Some(error.to_string()), ..Self::bare(entry_id) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Success,
    Error,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryResult {
    pub entry_id: String,
    pub status: EntryStatus,
    pub diff: Vec<Diff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EntryResult {
    pub fn success(entry_id: String, diff: Vec<Diff>) -> Self {
        Self { entry_id, status: EntryStatus::Success, diff, error: None }
    }
    pub fn error(entry_id: String, error: impl ToString) -> Self {
        Self { entry_id, status: EntryStatus::Error, diff: Vec::new(), error: Some(error.to_string()) }
    }
    pub fn skipped(entry_id: String) -> Self {
        Self { entry_id, status: EntryStatus::Skipped, diff: Vec::new(), error: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub dry_run: bool,
    pub cancelled: bool,
    pub elapsed_ms: f64,
    pub per_entry: Vec<EntryResult>,
}

impl BulkResult {
    pub fn from_entries(per_entry: Vec<EntryResult>, dry_run: bool, cancelled: bool, elapsed_ms: f64) -> Self {
        let count = |status| per_entry.iter().filter(|e| e.status == status).count();
        Self {
            total: per_entry.len(),
            succeeded: count(EntryStatus::Success),
            failed: count(EntryStatus::Error),
            skipped: count(EntryStatus::Skipped),
            dry_run,
            cancelled,
            elapsed_ms,
            per_entry,
        }
    }
    pub fn entry(&self, entry_id: &str) -> Option<&EntryResult> {
        self.per_entry.iter().find(|e| e.entry_id == entry_id)
    }
    /// Digest of the per-entry results; equal for runs that did the same thing.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(&self.per_entry).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Op;
    use serde_json::json;

    #[test]
    fn parses_wire_shape() {
        let request: BulkRequest = serde_json::from_value(json!({
            "condition": {"type": "field", "path": "grammatical_info.trait", "op": "equals", "value": "verb"},
            "actions": [{"type": "set", "path": "grammatical_info.trait", "value": "noun"}],
            "dry_run": true
        }))
        .unwrap();
        assert!(request.dry_run);
        assert!(request.entry_ids.is_none());
        assert!(request.validate(&Limits::default()).is_ok());
        assert!(serde_json::from_value::<BulkRequest>(json!({"actions": [{"type": "explode"}]})).is_err());
    }

    fn limits(max_actions: usize) -> Limits {
        Limits { max_actions, ..Limits::default() }
    }

    #[test]
    fn validation_limits() {
        let set = Action::Set { path: "a".parse().unwrap(), value: json!(1) };
        let request = BulkRequest::new(Condition::always(), vec![set.clone(), set.clone(), set]);
        assert!(request.validate(&limits(3)).is_ok());
        assert!(request.validate(&limits(2)).is_err());
        let empty = BulkRequest::new(Condition::always(), vec![]);
        assert!(empty.validate(&limits(3)).is_err());
        let neither = BulkRequest { condition: None, entry_ids: None, ..request.clone() };
        assert!(neither.validate(&limits(3)).is_err());
        let bad_condition = BulkRequest {
            condition: Some(Condition::field("a", Op::Gt, None).unwrap()),
            entry_ids: Some(vec!["a".into()]),
            ..request
        };
        assert!(bad_condition.validate(&limits(3)).is_err());
    }

    #[test]
    fn huge_list_indices_are_rejected() {
        let far = BulkRequest::new(
            Condition::always(),
            vec![Action::Set { path: "senses.99999999999.gloss".parse().unwrap(), value: json!("x") }],
        );
        assert!(matches!(far.validate(&Limits::default()), Err(BulkError::Request(_))));
        let near = BulkRequest::new(
            Condition::always(),
            vec![Action::Set { path: "senses.1024.gloss".parse().unwrap(), value: json!("x") }],
        );
        assert!(near.validate(&Limits::default()).is_ok());
    }

    #[test]
    fn summary_counts() {
        let result = BulkResult::from_entries(
            vec![
                EntryResult::success("a".into(), vec![]),
                EntryResult::error("b".into(), "boom"),
                EntryResult::skipped("c".into()),
            ],
            false,
            true,
            1.0,
        );
        assert_eq!((result.total, result.succeeded, result.failed, result.skipped), (3, 1, 1, 1));
        assert_eq!(result.entry("b").and_then(|e| e.error.as_deref()), Some("boom"));
        assert_eq!(result.fingerprint().len(), 64);
    }
}
