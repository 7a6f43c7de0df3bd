//! Threaded interface for submitting and controlling bulk runs.
//!
//! This module provides a minimal, thread-per-run runner that accepts bulk
//! requests, executes them on a background thread (or on the caller's thread)
//! and lets callers cancel them by id. Cancellation is cooperative via an
//! `Arc<AtomicBool>` that the executor checks between entries.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::condition::Condition;
use crate::config::EngineConfig;
use crate::error::{BulkError, Result};
use crate::executor::{Executor, HistorySink};
use crate::request::{BulkRequest, BulkResult, WorkItem};
use crate::store::RecordStore;

/// Cancellation token shared with the worker threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self { Self(Arc::new(AtomicBool::new(false))) }
    pub fn cancel(&self) { self.0.store(true, Ordering::SeqCst); }
    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::Relaxed) }
}

/// Opaque run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RunId(pub u64);

/// Handle to a running or completed background run.
pub struct RunHandle {
    pub id: RunId,
    cancel: CancelToken,
    started: Instant,
    join: Option<JoinHandle<Result<BulkResult>>>,
}
impl RunHandle {
    /// Request cancellation (cooperative). Entries already being applied finish first.
    pub fn cancel(&self) { self.cancel.cancel(); }
    /// Wait for the run to finish.
    pub fn join(mut self) -> Result<BulkResult> {
        match self.join.take() {
            Some(j) => j
                .join()
                .map_err(|_| BulkError::Lock("bulk run thread panicked".into()))?,
            None => Err(BulkError::Lock("bulk run already joined".into())),
        }
    }
    /// Elapsed time since start.
    pub fn elapsed(&self) -> Duration { self.started.elapsed() }
}

type Active = Arc<Mutex<HashMap<RunId, CancelToken>>>;

/// Outcomes of detached runs not yet fetched. Only the most recent ones are
/// retained.
type Finished = Arc<Mutex<BTreeMap<RunId, RunOutcome>>>;
const RETAINED_OUTCOMES: usize = 64;

/// What a detached run ended with, kept until someone fetches it.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(BulkResult),
    Failed(String),
}

/// Registry managing run lifecycles.
pub struct BulkInterface<S: RecordStore + ?Sized + 'static> {
    store: Arc<S>, // shared store
    config: EngineConfig,
    history: Option<Arc<dyn HistorySink>>,
    next_id: AtomicU64,
    active: Active, // for external cancellation
    finished: Finished,
}

impl<S: RecordStore + ?Sized + 'static> BulkInterface<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self { store, config, history: None, next_id: AtomicU64::new(0), active: Arc::new(Mutex::new(HashMap::new())), finished: Arc::new(Mutex::new(BTreeMap::new())) }
    }
    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }
    pub fn store(&self) -> &Arc<S> { &self.store }
    pub fn config(&self) -> &EngineConfig { &self.config }

    fn allocate_id(&self) -> RunId {
        RunId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn register(&self) -> Result<(RunId, CancelToken)> {
        let id = self.allocate_id();
        let cancel = CancelToken::new();
        self.active
            .lock()
            .map_err(|e| BulkError::Lock(e.to_string()))?
            .insert(id, cancel.clone());
        Ok((id, cancel))
    }

    /// Submit a request for execution on a background thread.
    pub fn start_run(&self, request: BulkRequest) -> Result<RunHandle> {
        self.spawn(request, None)
    }

    /// Validates the request, then runs it in the background and returns its
    /// id at once. The outcome is fetched later with [`Self::take_outcome`].
    pub fn start_detached(&self, request: BulkRequest) -> Result<RunId> {
        request.validate(&self.config.limits())?;
        let handle = self.spawn(request, Some(Arc::clone(&self.finished)))?;
        Ok(handle.id)
    }

    /// Removes and returns the outcome of a finished detached run.
    pub fn take_outcome(&self, id: RunId) -> Option<RunOutcome> {
        self.finished.lock().ok()?.remove(&id)
    }

    /// Whether a run is still in flight.
    pub fn is_active(&self, id: RunId) -> bool {
        self.active.lock().map(|a| a.contains_key(&id)).unwrap_or(false)
    }

    fn spawn(&self, request: BulkRequest, keep: Option<Finished>) -> Result<RunHandle> {
        let (id, cancel) = self.register()?;
        let store = Arc::clone(&self.store);
        let config = self.config.clone();
        let history = self.history.clone();
        let active = Arc::clone(&self.active);
        let cancel_for_thread = cancel.clone();
        let join = std::thread::spawn(move || {
            let result = run(&*store, &config, history, cancel_for_thread, &request);
            // kept before unregistering, so a run is never neither active nor finished
            if let Some(finished) = keep {
                let outcome = match &result {
                    Ok(done) => RunOutcome::Completed(done.clone()),
                    Err(e) => RunOutcome::Failed(e.to_string()),
                };
                retain(&finished, id, outcome);
            }
            unregister(&active, id);
            result
        });
        info!(run = id.0, "bulk run started in background");
        Ok(RunHandle { id, cancel, started: Instant::now(), join: Some(join) })
    }

    /// Run a request synchronously on the current thread. The run stays
    /// cancellable by id from other threads while it executes.
    pub fn run_sync(&self, request: &BulkRequest) -> (RunId, Result<BulkResult>) {
        let (id, cancel) = match self.register() {
            Ok(registered) => registered,
            Err(e) => return (RunId(0), Err(e)),
        };
        let result = run(&*self.store, &self.config, self.history.clone(), cancel, request);
        unregister(&self.active, id);
        (id, result)
    }

    /// Pass 1 only: the ids (and bindings) a condition currently selects.
    pub fn collect(&self, condition: &Condition) -> Result<Vec<WorkItem>> {
        Executor::from_config(&*self.store, &self.config).collect(condition)
    }

    /// Cancel a run by id.
    pub fn cancel(&self, id: RunId) -> bool {
        match self.active.lock() {
            Ok(active) => match active.get(&id) {
                Some(tok) => {
                    tok.cancel();
                    true
                }
                None => false,
            },
            Err(e) => {
                warn!(error = %e, "run registry poisoned");
                false
            }
        }
    }

    /// Ids of runs still in flight, ascending.
    pub fn active(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.active.lock().map(|a| a.keys().copied().collect()).unwrap_or_default();
        ids.sort();
        ids
    }
}

fn run<S: RecordStore + ?Sized>(
    store: &S,
    config: &EngineConfig,
    history: Option<Arc<dyn HistorySink>>,
    cancel: CancelToken,
    request: &BulkRequest,
) -> Result<BulkResult> {
    let mut executor = Executor::from_config(store, config).with_cancel(cancel);
    if let Some(history) = history {
        executor = executor.with_history(history);
    }
    executor.execute(request)
}

fn retain(finished: &Finished, id: RunId, outcome: RunOutcome) {
    match finished.lock() {
        Ok(mut finished) => {
            finished.insert(id, outcome);
            while finished.len() > RETAINED_OUTCOMES {
                finished.pop_first();
            }
        }
        Err(e) => warn!(run = id.0, error = %e, "outcome store poisoned"),
    }
}

fn unregister(active: &Active, id: RunId) {
    if let Ok(mut active) = active.lock() {
        active.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::record::Record;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn interface() -> BulkInterface<MemoryStore> {
        let store = MemoryStore::with_records(vec![Record::new("a"), Record::new("b")]);
        BulkInterface::new(Arc::new(store), EngineConfig::default())
    }

    fn touch() -> BulkRequest {
        BulkRequest::new(
            Condition::always(),
            vec![Action::Set { path: "touched".parse().unwrap(), value: json!(true) }],
        )
    }

    #[test]
    fn background_run_completes_and_unregisters() {
        let iface = interface();
        let handle = iface.start_run(touch()).unwrap();
        let result = handle.join().unwrap();
        assert_eq!(result.succeeded, 2);
        assert!(iface.active().is_empty());
        assert_eq!(iface.store().puts(), 2);
    }

    #[test]
    fn sync_runs_get_fresh_ids() {
        let iface = interface();
        let (first, _) = iface.run_sync(&touch().dry_run(true));
        let (second, result) = iface.run_sync(&touch().dry_run(true));
        assert!(second > first);
        assert_eq!(result.unwrap().total, 2);
        assert!(!iface.cancel(first));
    }

    #[test]
    fn detached_run_returns_id_then_outcome() {
        let iface = interface();
        let id = iface.start_detached(touch()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while iface.is_active(id) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        match iface.take_outcome(id) {
            Some(RunOutcome::Completed(result)) => assert_eq!(result.succeeded, 2),
            other => panic!("unexpected outcome {:?}", other),
        }
        // fetched once only
        assert!(iface.take_outcome(id).is_none());
        let bad = BulkRequest::new(Condition::always(), vec![]);
        assert!(matches!(iface.start_detached(bad), Err(BulkError::Request(_))));
    }

    #[test]
    fn only_recent_outcomes_are_retained() {
        let finished: Finished = Arc::new(Mutex::new(BTreeMap::new()));
        for i in 0..(RETAINED_OUTCOMES as u64 + 3) {
            retain(&finished, RunId(i), RunOutcome::Failed("x".into()));
        }
        let kept = finished.lock().unwrap();
        assert_eq!(kept.len(), RETAINED_OUTCOMES);
        assert_eq!(kept.keys().next(), Some(&RunId(3)));
    }

    #[test]
    fn request_errors_surface_synchronously() {
        let iface = interface();
        let bad = BulkRequest::new(Condition::always(), vec![]);
        let (_, result) = iface.run_sync(&bad);
        assert!(matches!(result, Err(BulkError::Request(_))));
    }
}
