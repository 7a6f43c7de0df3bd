//! The record store as seen by the engine, plus an in-memory implementation.
//!
//! The engine never caches records between its two passes and holds no locks
//! of its own; exclusivity per record is the store's business. Every method
//! may block, and the executor may call them from several worker threads at
//! once, hence the `Send + Sync` bound.

use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasherDefault;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use seahash::SeaHasher;
use thiserror::Error;

use crate::record::{Record, Relation};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record '{0}' not found")]
    NotFound(String),
    #[error("backend failure: {0}")]
    Backend(String),
    #[error("corrupt record '{id}': {message}")]
    Corrupt { id: String, message: String },
    #[error("lock poisoned: {0}")]
    Lock(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self { Self::Backend(e.to_string()) }
}

pub trait RecordStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Record>, StoreError>;
    fn put(&self, record: &Record) -> Result<(), StoreError>;
    /// All ids, ascending.
    fn scan(&self) -> Result<Vec<String>, StoreError>;
    fn relations_of(&self, record: &Record) -> Vec<Relation> {
        record.relations_of()
    }
}

/// Read access to records other than the one being evaluated.
pub trait RecordLookup {
    fn lookup(&self, id: &str) -> Option<Record>;
    fn relations_of(&self, record: &Record) -> Vec<Relation> {
        record.relations_of()
    }
}

/// Adapts a store to [`RecordLookup`] for the duration of one run. Lookup
/// failures other than absence are logged and treated like a dangling
/// relation.
///
/// Records written during the run are [remembered](StoreLookup::remember) in
/// their pre-run state, and lookups keep returning that state. Related reads
/// therefore see the store as it was before the run, whatever order the
/// workers write in, and a real run reads the same values as its dry run.
pub struct StoreLookup<'s, S: RecordStore + ?Sized> {
    store: &'s S,
    originals: Mutex<HashMap<String, Record, BuildHasherDefault<SeaHasher>>>,
}
impl<'s, S: RecordStore + ?Sized> StoreLookup<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self { store, originals: Mutex::new(HashMap::default()) }
    }
    /// Must be called before `original` is overwritten in the store.
    pub fn remember(&self, original: &Record) {
        match self.originals.lock() {
            Ok(mut originals) => {
                originals.entry(original.id.clone()).or_insert_with(|| original.clone());
            }
            Err(e) => tracing::warn!(entry_id = %original.id, error = %e, "pre-run view poisoned"),
        }
    }
    fn original(&self, id: &str) -> Option<Record> {
        self.originals.lock().ok()?.get(id).cloned()
    }
}
impl<S: RecordStore + ?Sized> RecordLookup for StoreLookup<'_, S> {
    fn lookup(&self, id: &str) -> Option<Record> {
        if let Some(original) = self.original(id) {
            return Some(original);
        }
        let current = match self.store.get(id) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(target_id = id, error = %e, "related record lookup failed");
                None
            }
        };
        // a write may have landed between the two reads; its original is
        // remembered before the put, so checking again settles it
        self.original(id).or(current)
    }
    fn relations_of(&self, record: &Record) -> Vec<Relation> {
        self.store.relations_of(record)
    }
}

// ------------- MemoryStore -------------
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, Record>>,
    puts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        let store = Self::new();
        if let Ok(mut kept) = store.records.lock() {
            for record in records {
                kept.insert(record.id.clone(), record);
            }
        }
        store
    }
    /// Number of successful `put` calls, used to verify dry runs.
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
    pub fn remove(&self, id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.kept()?.remove(id))
    }
    pub fn len(&self) -> usize {
        self.kept().map(|k| k.len()).unwrap_or(0)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn kept(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Record>>, StoreError> {
        self.records
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.kept()?.get(id).cloned())
    }
    fn put(&self, record: &Record) -> Result<(), StoreError> {
        self.kept()?.insert(record.id.clone(), record.clone());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn scan(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.kept()?.keys().cloned().collect())
    }
}

impl RecordLookup for MemoryStore {
    fn lookup(&self, id: &str) -> Option<Record> {
        self.get(id).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_is_ascending() {
        let store = MemoryStore::with_records(vec![Record::new("c"), Record::new("a"), Record::new("b")]);
        assert_eq!(store.scan().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn put_counts_and_replaces() {
        let store = MemoryStore::new();
        store.put(&Record::new("a")).unwrap();
        store.put(&Record::new("a")).unwrap();
        assert_eq!(store.puts(), 2);
        assert_eq!(store.len(), 1);
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn lookup_keeps_pre_run_state_of_written_records() {
        let store = MemoryStore::with_records(vec![Record::new("a").with_fields(serde_json::json!({"v": 1}))]);
        let lookup = StoreLookup::new(&store);
        let before = store.get("a").unwrap().unwrap();
        lookup.remember(&before);
        store.put(&Record::new("a").with_fields(serde_json::json!({"v": 2}))).unwrap();
        assert_eq!(lookup.lookup("a"), Some(before.clone()));
        // only the first remembered state counts
        lookup.remember(&store.get("a").unwrap().unwrap());
        assert_eq!(lookup.lookup("a"), Some(before));
        assert_eq!(lookup.lookup("missing"), None);
    }
}
