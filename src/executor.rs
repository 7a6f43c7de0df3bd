//! Two-pass execution of a bulk request.
//!
//! Pass 1 (collecting) walks the store in ascending id order, evaluates the
//! condition against each record and keeps a [`WorkItem`] per match. It never
//! writes. Pass 2 (applying) reloads every matched record, runs the actions on
//! it and, unless the run is a dry run, writes it back. Pass 2 may fan out over
//! a bounded number of worker threads; results are always reported in the
//! order established by pass 1.
//!
//! A failing record never stops the run. Cancellation is observed between
//! work items only, so every record ends up either fully applied or skipped.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::action::{Action, Applier, Diff};
use crate::binding::Bindings;
use crate::condition::{self, Condition};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::interface::CancelToken;
use crate::request::{BulkRequest, BulkResult, EntryResult, Limits, WorkItem};
use crate::store::{RecordStore, StoreError, StoreLookup};

/// Receives the diff of every record written by a run, e.g. to keep an
/// operation history that can undo it.
pub trait HistorySink: Send + Sync {
    fn record(&self, entry_id: &str, diff: &[Diff]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Collecting,
    Applying,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Phase::Collecting => write!(f, "collecting"),
            Phase::Applying => write!(f, "applying"),
            Phase::Done => write!(f, "done"),
        }
    }
}

pub struct Executor<'s, S: RecordStore + ?Sized> {
    store: &'s S,
    concurrency: usize,
    limits: Limits,
    cancel: CancelToken,
    history: Option<Arc<dyn HistorySink>>,
}

impl<'s, S: RecordStore + ?Sized> Executor<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self::from_config(store, &EngineConfig::default())
    }
    pub fn from_config(store: &'s S, config: &EngineConfig) -> Self {
        Self {
            store,
            concurrency: config.concurrency.max(1),
            limits: config.limits(),
            cancel: CancelToken::new(),
            history: None,
        }
    }
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    /// Runs both passes. Only a malformed request, or a store that cannot be
    /// scanned at all, fails the call; per-record trouble lands in the result.
    pub fn execute(&self, request: &BulkRequest) -> Result<BulkResult> {
        let started = Instant::now();
        request.validate(&self.limits)?;
        let items = match (&request.entry_ids, &request.condition) {
            (Some(ids), _) => explicit_items(ids),
            (None, Some(condition)) => self.collect_unchecked(condition)?,
            (None, None) => Vec::new(),
        };
        info!(phase = %Phase::Applying, matched = items.len(), dry_run = request.dry_run, "applying actions");
        let (per_entry, cancelled) = self.apply(&items, &request.actions, request.dry_run);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let result = BulkResult::from_entries(per_entry, request.dry_run, cancelled, elapsed_ms);
        info!(
            phase = %Phase::Done,
            total = result.total,
            succeeded = result.succeeded,
            failed = result.failed,
            skipped = result.skipped,
            elapsed_ms,
            "bulk run complete"
        );
        Ok(result)
    }

    /// Pass 1 on its own, for building reusable worksets.
    pub fn collect(&self, condition: &Condition) -> Result<Vec<WorkItem>> {
        condition.validate(self.limits.max_condition_depth)?;
        self.collect_unchecked(condition)
    }

    fn collect_unchecked(&self, condition: &Condition) -> Result<Vec<WorkItem>> {
        info!(phase = %Phase::Collecting, "scanning store");
        let mut ids = self.store.scan()?;
        ids.sort();
        let lookup = StoreLookup::new(self.store);
        let mut items = Vec::new();
        for id in ids {
            let record = match self.store.get(&id) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    debug!(entry_id = %id, "record vanished during scan");
                    continue;
                }
                Err(e) => {
                    warn!(entry_id = %id, error = %e, "could not load record for matching");
                    items.push(WorkItem::unreadable(id, e));
                    continue;
                }
            };
            let mut bindings = Bindings::new();
            if condition::evaluate(condition, &record, &lookup, &mut bindings) {
                items.push(WorkItem::matched(id, bindings));
            }
        }
        Ok(items)
    }

    /// Pass 2. Returns one result per item, in item order, and whether the
    /// run was cancelled. Related records are read as they were before the
    /// pass started, so neither worker timing nor `dry_run` changes what a
    /// record copies from another.
    pub fn apply(&self, items: &[WorkItem], actions: &[Action], dry_run: bool) -> (Vec<EntryResult>, bool) {
        let workers = self.concurrency.min(items.len()).max(1);
        let next = AtomicUsize::new(0);
        let view = StoreLookup::new(self.store);
        let claim = || -> Vec<(usize, EntryResult)> {
            let mut done = Vec::new();
            loop {
                let index = next.fetch_add(1, Ordering::SeqCst);
                let Some(item) = items.get(index) else { break };
                let result = if self.cancel.is_cancelled() {
                    EntryResult::skipped(item.entry_id.clone())
                } else {
                    self.apply_item(item, actions, dry_run, &view)
                };
                done.push((index, result));
            }
            done
        };
        let mut indexed = if workers == 1 {
            claim()
        } else {
            std::thread::scope(|scope| {
                let handles: Vec<_> = (0..workers).map(|_| scope.spawn(&claim)).collect();
                let mut all = Vec::with_capacity(items.len());
                for handle in handles {
                    match handle.join() {
                        Ok(done) => all.extend(done),
                        Err(_) => warn!("bulk worker panicked"),
                    }
                }
                all
            })
        };
        indexed.sort_by_key(|(index, _)| *index);
        // items claimed by a panicked worker have no result yet
        let mut results = Vec::with_capacity(items.len());
        let mut indexed = indexed.into_iter().peekable();
        for (index, item) in items.iter().enumerate() {
            match indexed.next_if(|(i, _)| *i == index) {
                Some((_, result)) => results.push(result),
                None => results.push(EntryResult::error(item.entry_id.clone(), "worker panicked")),
            }
        }
        (results, self.cancel.is_cancelled())
    }

    fn apply_item(&self, item: &WorkItem, actions: &[Action], dry_run: bool, view: &StoreLookup<'_, S>) -> EntryResult {
        let id = item.entry_id.clone();
        if let Some(error) = &item.error {
            return EntryResult::error(id, error);
        }
        let original = match self.store.get(&id) {
            Ok(Some(record)) => record,
            Ok(None) => return EntryResult::error(id.clone(), StoreError::NotFound(id)),
            Err(e) => {
                warn!(entry_id = %id, error = %e, "reload failed");
                return EntryResult::error(id, e);
            }
        };
        let mut record = original.clone();
        let diff = match Applier::new(view).apply(actions, &mut record, &item.bindings) {
            Ok(diff) => diff,
            Err(e) => {
                warn!(entry_id = %id, error = %e, "actions failed, entry left untouched");
                return EntryResult::error(id, e);
            }
        };
        if !dry_run && !diff.is_empty() {
            view.remember(&original);
            if let Err(e) = self.store.put(&record) {
                warn!(entry_id = %id, error = %e, "write failed");
                return EntryResult::error(id, e);
            }
            if let Some(history) = &self.history {
                history.record(&id, &diff);
            }
        }
        debug!(entry_id = %id, changes = diff.len(), dry_run, "entry done");
        EntryResult::success(id, diff)
    }
}

fn explicit_items(ids: &[String]) -> Vec<WorkItem> {
    let mut ids = ids.to_vec();
    ids.sort();
    ids.dedup();
    ids.into_iter().map(WorkItem::bare).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Op;
    use crate::record::Record;
    use crate::request::EntryStatus;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Mutex;

    fn store(n: usize) -> MemoryStore {
        MemoryStore::with_records((0..n).map(|i| Record::new(format!("e{:03}", i)).with_fields(json!({"n": i}))))
    }

    fn bump() -> Vec<Action> {
        vec![Action::Set { path: "touched".parse().unwrap(), value: json!(true) }]
    }

    #[test]
    fn parallel_results_keep_id_order() {
        let store = store(40);
        let request = BulkRequest::new(Condition::field("n", Op::Gte, Some(json!(0))).unwrap(), bump());
        let serial = Executor::new(&store).execute(&request.clone().dry_run(true)).unwrap();
        let parallel = Executor::new(&store).with_concurrency(6).execute(&request.dry_run(true)).unwrap();
        assert_eq!(serial.per_entry, parallel.per_entry);
        let ids: Vec<&str> = parallel.per_entry.iter().map(|e| e.entry_id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(store.puts(), 0);
    }

    #[test]
    fn cancelled_run_skips_everything_left() {
        let store = store(5);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = Executor::new(&store)
            .with_cancel(cancel)
            .execute(&BulkRequest::new(Condition::always(), bump()))
            .unwrap();
        assert!(result.cancelled);
        assert_eq!(result.skipped, 5);
        assert!(result.per_entry.iter().all(|e| e.status == EntryStatus::Skipped));
        assert_eq!(store.puts(), 0);
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);
    impl HistorySink for Recorder {
        fn record(&self, entry_id: &str, _diff: &[Diff]) {
            if let Ok(mut seen) = self.0.lock() {
                seen.push(entry_id.to_string());
            }
        }
    }

    #[test]
    fn history_sees_written_entries_only() {
        let store = store(3);
        let recorder = Arc::new(Recorder::default());
        let executor = Executor::new(&store).with_history(recorder.clone());
        let request = BulkRequest::new(Condition::field("n", Op::Lt, Some(json!(2))).unwrap(), bump());
        executor.execute(&request.clone().dry_run(true)).unwrap();
        assert!(recorder.0.lock().unwrap().is_empty());
        executor.execute(&request).unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec!["e000", "e001"]);
        // nothing left to change, so nothing is written or recorded
        executor.execute(&request).unwrap();
        assert_eq!(recorder.0.lock().unwrap().len(), 2);
        assert_eq!(store.puts(), 2);
    }

    #[test]
    fn copies_read_related_records_as_they_were_before_the_run() {
        let store = MemoryStore::with_records(vec![
            Record::new("e1")
                .with_fields(json!({"word": "run"}))
                .with_relation(crate::record::Relation::new("synonym", "e2")),
            Record::new("e2")
                .with_fields(json!({"word": "sprint"}))
                .with_relation(crate::record::Relation::new("synonym", "e1")),
        ]);
        let request = BulkRequest::new(
            Condition::always(),
            vec![
                Action::Append { path: "word".parse().unwrap(), value: json!("!") },
                Action::CopyFromRelated {
                    from_field: "word".parse().unwrap(),
                    to_field: "see".parse().unwrap(),
                    relation_type: Some("synonym".into()),
                    target_in_field: None,
                },
            ],
        );
        let preview = Executor::new(&store).execute(&request.clone().dry_run(true)).unwrap();
        let applied = Executor::new(&store).execute(&request).unwrap();
        assert_eq!(preview.per_entry, applied.per_entry);
        let e2 = store.get("e2").unwrap().unwrap();
        assert_eq!(e2.fields, json!({"word": "sprint!", "see": "run"}));
    }

    #[test]
    fn explicit_ids_are_sorted_and_deduplicated() {
        let items = explicit_items(&["b".into(), "a".into(), "b".into()]);
        let ids: Vec<&str> = items.iter().map(|i| i.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
