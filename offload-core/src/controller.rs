//! Drives one bulk offload run at a time through an explicit state machine.
//!
//! `start` selects a batch and takes the run lock, each `tick` processes one
//! item and persists progress, and the terminal tick releases the lock. The
//! pending queue lives in the state store, so a restarted process resumes the
//! run for as long as the lock is still recorded under the same run id.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::auth::{Caller, Capability, TokenIssuer, random_id};
use crate::catalog::WorkItemSource;
use crate::clock::Clock;
use crate::config::OffloadConfig;
use crate::error::{OffloadError, Result};
use crate::select::CandidateSelector;
use crate::state::job::{JobState, JobStatePatch, JobStateRepo, JobStatus};
use crate::state::lock::RunLock;
use crate::state::{StateStore, put_record};
use crate::worker::OffloadWorker;

pub const CANCELLED_MESSAGE: &str = "Bulk offload cancelled successfully.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub total: u64,
}

/// Snapshot returned to pollers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub processed: u64,
    pub total: u64,
    pub status: JobStatus,
    pub errors: u64,
    pub oversized_skipped: u64,
}

impl Progress {
    /// Completion in percent, clamped to 0..=100; `None` when there is no work.
    pub fn percent(&self) -> Option<u8> {
        if self.total == 0 {
            return None;
        }
        let pct = self.processed.min(self.total) * 100 / self.total;
        Some(pct as u8)
    }
}

/// What a single tick did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TickEvent {
    Processed { item_id: String, ok: bool },
    Completed { processed: u64, errors: u64 },
    Cancelled { processed: u64 },
    /// No run is active, or the run was reclaimed by the stall monitor.
    Idle,
}

impl TickEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TickEvent::Processed { .. })
    }
}

/// Items still to process in the active run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PendingBatch {
    pub run_id: String,
    pub items: VecDeque<String>,
}

pub struct JobController {
    config: OffloadConfig,
    store: Arc<dyn StateStore>,
    source: Arc<dyn WorkItemSource>,
    worker: Arc<dyn OffloadWorker>,
    clock: Arc<dyn Clock>,
    tokens: TokenIssuer,
    selector: CandidateSelector,
    jobs: JobStateRepo,
    lock: RunLock,
}

impl JobController {
    pub fn new(
        config: OffloadConfig,
        store: Arc<dyn StateStore>,
        source: Arc<dyn WorkItemSource>,
        worker: Arc<dyn OffloadWorker>,
        clock: Arc<dyn Clock>,
        tokens: TokenIssuer,
    ) -> Self {
        let jobs = JobStateRepo::new(store.clone(), config.data_key());
        let lock = RunLock::new(store.clone(), config.lock_key(), config.lock_ttl());
        Self {
            selector: CandidateSelector::new(source.clone()),
            config,
            store,
            source,
            worker,
            clock,
            tokens,
            jobs,
            lock,
        }
    }

    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }

    /// Token action every control request is checked against.
    pub fn action(&self) -> &str {
        &self.config.job_id
    }

    pub fn issue_token(&self, user: &str) -> String {
        self.tokens.issue(self.action(), user, self.clock.now())
    }

    fn check_token(&self, caller: &Caller) -> Result<()> {
        self.tokens.check(caller, self.action(), self.clock.now())
    }

    fn cancel_requested(&self) -> Result<bool> {
        Ok(self.store.get(&self.config.cancel_key())?.is_some())
    }

    /// The stored batch together with its exact bytes, for compare-and-swap.
    fn pending(&self) -> Result<Option<(Vec<u8>, PendingBatch)>> {
        match self.store.get(&self.config.batch_key())? {
            Some(raw) => {
                let batch = serde_cbor::from_slice(&raw)?;
                Ok(Some((raw, batch)))
            }
            None => Ok(None),
        }
    }

    /// Select a batch and begin a run. Returns `total = 0` when nothing is eligible.
    pub fn start(&self, caller: &Caller) -> Result<StartOutcome> {
        caller.require(Capability::ManageOffload)?;
        self.check_token(caller)?;

        let now = self.clock.now();
        let run_id = random_id()?;
        if !self.lock.acquire(&run_id, now)? {
            return Err(OffloadError::AlreadyRunning);
        }

        match self.begin(&run_id, now) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(release) = self.lock.release(&run_id) {
                    tracing::error!(run = %run_id, error = %release, "could not release run lock");
                }
                Err(e)
            }
        }
    }

    /// Selection and bookkeeping for a run whose lock is already held.
    fn begin(&self, run_id: &str, now: OffsetDateTime) -> Result<StartOutcome> {
        let selection = self.selector.select_batch(&self.config.batch)?;
        for item in &selection.oversized {
            let msg = format!(
                "File exceeds maximum size ({} MB) for bulk processing",
                self.config.batch.per_item_max_mb
            );
            self.source.mark_error(&item.id, &msg)?;
        }

        // A stale request from before this run must not cancel it.
        self.store.delete(&self.config.cancel_key())?;

        if selection.is_empty() {
            self.jobs.clear()?;
            self.store.delete(&self.config.batch_key())?;
            self.lock.release(run_id)?;
            tracing::info!(
                oversized = selection.oversized_count(),
                "no eligible media to offload"
            );
            return Ok(StartOutcome { total: 0 });
        }

        let total = selection.items.len() as u64;
        self.jobs.update(
            JobStatePatch {
                total: Some(total),
                processed: Some(0),
                errors: Some(0),
                oversized_skipped: Some(selection.oversized_count() as u64),
                status: Some(JobStatus::Ready),
            },
            now,
        )?;
        let batch = PendingBatch {
            run_id: run_id.to_string(),
            items: selection.items.into_iter().map(|i| i.id).collect(),
        };
        put_record(self.store.as_ref(), &self.config.batch_key(), &batch)?;
        self.jobs
            .update(JobStatePatch::status(JobStatus::Processing), now)?;

        tracing::info!(run = %run_id, total, total_mb = selection.total_mb, "bulk offload started");
        Ok(StartOutcome { total })
    }

    /// Process at most one item of the active run.
    ///
    /// Ownership is checked again after the item: a run reclaimed while the
    /// item was in flight writes neither the queue nor the counters.
    pub fn tick(&self) -> Result<TickEvent> {
        let Some((raw, mut batch)) = self.pending()? else {
            return Ok(TickEvent::Idle);
        };
        let key = self.config.batch_key();

        if !self.lock.refresh(&batch.run_id, self.clock.now())? {
            tracing::warn!(run = %batch.run_id, "run lock lost, abandoning batch");
            self.store.compare_and_swap(&key, Some(&raw), None)?;
            return Ok(TickEvent::Idle);
        }

        if self.cancel_requested()? {
            return self.finish_cancelled(&batch);
        }

        let Some(item_id) = batch.items.pop_front() else {
            return self.finish_completed(&batch);
        };

        let ok = match self.source.get(&item_id)? {
            Some(item) => self.worker.offload(&item),
            None => {
                tracing::warn!(item = %item_id, "work item disappeared before processing");
                false
            }
        };

        let next = serde_cbor::to_vec(&batch)?;
        if !self.lock.refresh(&batch.run_id, self.clock.now())?
            || !self.store.compare_and_swap(&key, Some(&raw), Some(&next))?
        {
            tracing::warn!(
                run = %batch.run_id,
                item = %item_id,
                "run was reclaimed while the item was in flight, dropping its result"
            );
            return Ok(TickEvent::Idle);
        }

        let state = self.jobs.load()?;
        self.jobs.update(
            JobStatePatch {
                processed: Some(state.processed + 1),
                errors: Some(state.errors + u64::from(!ok)),
                ..Default::default()
            },
            self.clock.now(),
        )?;

        Ok(TickEvent::Processed { item_id, ok })
    }

    /// Tick until the run reaches a terminal event.
    pub fn run(&self) -> Result<TickEvent> {
        loop {
            let ev = self.tick()?;
            if ev.is_terminal() {
                return Ok(ev);
            }
        }
    }

    fn finish_cancelled(&self, batch: &PendingBatch) -> Result<TickEvent> {
        let state = self
            .jobs
            .update(JobStatePatch::status(JobStatus::Cancelled), self.clock.now())?;
        self.store.delete(&self.config.cancel_key())?;
        self.store.delete(&self.config.batch_key())?;
        self.lock.release(&batch.run_id)?;
        tracing::info!(run = %batch.run_id, processed = state.processed, "bulk offload cancelled");
        Ok(TickEvent::Cancelled {
            processed: state.processed,
        })
    }

    fn finish_completed(&self, batch: &PendingBatch) -> Result<TickEvent> {
        let state = self
            .jobs
            .update(JobStatePatch::status(JobStatus::Completed), self.clock.now())?;
        self.store.delete(&self.config.batch_key())?;
        self.lock.release(&batch.run_id)?;
        tracing::info!(
            run = %batch.run_id,
            processed = state.processed,
            errors = state.errors,
            "bulk offload finished"
        );
        Ok(TickEvent::Completed {
            processed: state.processed,
            errors: state.errors,
        })
    }

    pub fn progress(&self, caller: &Caller) -> Result<Progress> {
        self.check_token(caller)?;
        caller.require(Capability::ViewProgress)?;

        let JobState {
            total,
            processed,
            errors,
            oversized_skipped,
            status,
            ..
        } = self.jobs.load()?;
        let status = if self.cancel_requested()? {
            JobStatus::Cancelled
        } else {
            status
        };
        Ok(Progress {
            processed,
            total,
            status,
            errors,
            oversized_skipped,
        })
    }

    /// Request cancellation; observed at the next item boundary. Idempotent.
    pub fn cancel(&self, caller: &Caller) -> Result<&'static str> {
        self.check_token(caller)?;
        self.store.set(&self.config.cancel_key(), &[1])?;
        tracing::info!(user = %caller.user, "bulk offload cancellation requested");
        Ok(CANCELLED_MESSAGE)
    }

    pub fn job_state(&self) -> Result<JobState> {
        self.jobs.load()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use time::macros::datetime;

    use super::*;
    use crate::catalog::{LibraryCounts, OffloadRecord, WorkItem};
    use crate::clock::ManualClock;
    use crate::stall::{StallCheck, StallMonitor};
    use crate::state::get_record;
    use crate::state::mem::MemStateStore;

    struct FakeSource {
        items: Mutex<Vec<WorkItem>>,
        errors: Mutex<Vec<(String, String)>>,
    }

    impl FakeSource {
        fn new(ids: &[&str]) -> Self {
            let items = ids
                .iter()
                .enumerate()
                .map(|(n, id)| WorkItem {
                    id: id.to_string(),
                    local_path: PathBuf::from(id),
                    created_at: n as i64,
                    derived: Vec::new(),
                    failed: false,
                    offloaded: false,
                })
                .collect();
            Self {
                items: Mutex::new(items),
                errors: Mutex::new(Vec::new()),
            }
        }
    }

    impl WorkItemSource for FakeSource {
        fn list_pending(&self, limit: usize, only_failed: bool) -> Result<Vec<WorkItem>> {
            Ok(self
                .items
                .lock()
                .unwrap()
                .iter()
                .filter(|i| !i.offloaded && i.failed == only_failed)
                .take(limit)
                .cloned()
                .collect())
        }

        fn get(&self, id: &str) -> Result<Option<WorkItem>> {
            Ok(self.items.lock().unwrap().iter().find(|i| i.id == id).cloned())
        }

        fn file_size_mb(&self, item: &WorkItem) -> Option<f64> {
            item.id.contains("huge").then_some(50.0).or(Some(1.0))
        }

        fn mark_offloaded(&self, id: &str, _record: OffloadRecord) -> Result<()> {
            for i in self.items.lock().unwrap().iter_mut().filter(|i| i.id == id) {
                i.offloaded = true;
            }
            Ok(())
        }

        fn mark_error(&self, id: &str, message: &str) -> Result<()> {
            self.errors
                .lock()
                .unwrap()
                .push((id.to_string(), message.to_string()));
            for i in self.items.lock().unwrap().iter_mut().filter(|i| i.id == id) {
                i.failed = true;
            }
            Ok(())
        }

        fn offload_record(&self, _id: &str) -> Result<Option<OffloadRecord>> {
            Ok(None)
        }

        fn clear(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        fn counts(&self) -> Result<LibraryCounts> {
            Ok(LibraryCounts::default())
        }
    }

    /// Fails items whose id contains "bad"; can request a cancel mid-item.
    struct FakeWorker {
        source: Arc<FakeSource>,
        seen: Mutex<Vec<String>>,
        cancel_on: Option<(String, Arc<dyn StateStore>, String)>,
    }

    impl OffloadWorker for FakeWorker {
        fn offload(&self, item: &WorkItem) -> bool {
            self.seen.lock().unwrap().push(item.id.clone());
            if let Some((id, store, key)) = &self.cancel_on {
                if *id == item.id {
                    store.set(key, &[1]).unwrap();
                }
            }
            if item.id.contains("bad") {
                self.source.mark_error(&item.id, "upload refused").unwrap();
                return false;
            }
            let record = OffloadRecord {
                remote_dir: String::new(),
                url: item.id.clone(),
                provider: "Fake".into(),
                bucket: "fake".into(),
                offloaded_at: 0,
            };
            self.source.mark_offloaded(&item.id, record).unwrap();
            true
        }
    }

    /// Runs `hook` once in the middle of the first item, then defers to `inner`.
    struct HookWorker {
        inner: Arc<FakeWorker>,
        hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl OffloadWorker for HookWorker {
        fn offload(&self, item: &WorkItem) -> bool {
            let hook = self.hook.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            self.inner.offload(item)
        }
    }

    struct Harness {
        ctl: JobController,
        store: Arc<MemStateStore>,
        worker: Arc<FakeWorker>,
        source: Arc<FakeSource>,
        clock: ManualClock,
    }

    fn harness(ids: &[&str], cancel_on: Option<&str>) -> Harness {
        let config = OffloadConfig::default();
        let store = Arc::new(MemStateStore::new());
        let source = Arc::new(FakeSource::new(ids));
        let worker = Arc::new(FakeWorker {
            source: source.clone(),
            seen: Mutex::new(Vec::new()),
            cancel_on: cancel_on
                .map(|id| (id.to_string(), store.clone() as Arc<dyn StateStore>, config.cancel_key())),
        });
        let clock = ManualClock::new(datetime!(2024-05-01 10:00 UTC));
        let ctl = JobController::new(
            config,
            store.clone(),
            source.clone(),
            worker.clone(),
            Arc::new(clock.clone()),
            TokenIssuer::new([1u8; 32], 86_400),
        );
        Harness {
            ctl,
            store,
            worker,
            source,
            clock,
        }
    }

    fn admin(h: &Harness) -> Caller {
        Caller {
            user: "admin".into(),
            capabilities: vec![Capability::ManageOffload, Capability::ViewProgress],
            token: h.ctl.issue_token("admin"),
        }
    }

    #[test]
    fn full_run_counts_every_item_and_completes() {
        let h = harness(&["a.jpg", "bad.jpg", "c.jpg"], None);
        let caller = admin(&h);
        assert_eq!(h.ctl.start(&caller).unwrap(), StartOutcome { total: 3 });
        assert_eq!(h.ctl.progress(&caller).unwrap().status, JobStatus::Processing);

        let mut processed_seen = Vec::new();
        loop {
            let ev = h.ctl.tick().unwrap();
            let p = h.ctl.progress(&caller).unwrap();
            assert!(p.processed <= p.total);
            processed_seen.push(p.processed);
            if ev.is_terminal() {
                assert_eq!(ev, TickEvent::Completed { processed: 3, errors: 1 });
                break;
            }
        }
        assert_eq!(processed_seen, vec![1, 2, 3, 3]);

        let p = h.ctl.progress(&caller).unwrap();
        assert_eq!(p.status, JobStatus::Completed);
        assert_eq!(p.errors, 1);
        assert_eq!(p.percent(), Some(100));
        // lock is free again; only the failed item is left, via the retry lane
        assert_eq!(h.ctl.start(&caller).unwrap(), StartOutcome { total: 1 });
    }

    #[test]
    fn second_start_while_processing_is_rejected() {
        let h = harness(&["a.jpg", "b.jpg"], None);
        let caller = admin(&h);
        h.ctl.start(&caller).unwrap();
        assert!(matches!(
            h.ctl.start(&caller),
            Err(OffloadError::AlreadyRunning)
        ));
        let batch: PendingBatch = get_record(h.store.as_ref(), &h.ctl.config().batch_key())
            .unwrap()
            .unwrap();
        assert_eq!(batch.items.len(), 2);
    }

    #[test]
    fn cancel_stops_after_in_flight_item() {
        let h = harness(&["a.jpg", "b.jpg", "c.jpg"], Some("a.jpg"));
        let caller = admin(&h);
        h.ctl.start(&caller).unwrap();

        let ev = h.ctl.run().unwrap();
        assert_eq!(ev, TickEvent::Cancelled { processed: 1 });
        assert_eq!(*h.worker.seen.lock().unwrap(), vec!["a.jpg".to_string()]);

        let p = h.ctl.progress(&caller).unwrap();
        assert_eq!(p.status, JobStatus::Cancelled);
        assert_eq!(p.processed, 1);
        assert!(h.store.get(&h.ctl.config().cancel_key()).unwrap().is_none());

        // lock free: a new run selects what is left
        assert_eq!(h.ctl.start(&caller).unwrap(), StartOutcome { total: 2 });
    }

    #[test]
    fn cancel_request_is_reported_before_it_is_observed() {
        let h = harness(&["a.jpg"], None);
        let caller = admin(&h);
        h.ctl.start(&caller).unwrap();
        assert_eq!(h.ctl.cancel(&caller).unwrap(), CANCELLED_MESSAGE);
        assert_eq!(h.ctl.cancel(&caller).unwrap(), CANCELLED_MESSAGE);
        assert_eq!(h.ctl.progress(&caller).unwrap().status, JobStatus::Cancelled);
        assert_eq!(h.ctl.tick().unwrap(), TickEvent::Cancelled { processed: 0 });
        assert!(h.worker.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_selection_clears_state() {
        let h = harness(&[], None);
        let caller = admin(&h);
        h.ctl
            .jobs
            .update(
                JobStatePatch {
                    total: Some(9),
                    status: Some(JobStatus::Completed),
                    ..Default::default()
                },
                h.clock.now(),
            )
            .unwrap();
        assert_eq!(h.ctl.start(&caller).unwrap(), StartOutcome { total: 0 });
        let p = h.ctl.progress(&caller).unwrap();
        assert_eq!(p.total, 0);
        assert_eq!(p.status, JobStatus::None);
        assert_eq!(p.percent(), None);
        assert_eq!(h.ctl.tick().unwrap(), TickEvent::Idle);
    }

    #[test]
    fn oversized_items_are_marked_and_reported() {
        let h = harness(&["huge.mov", "a.jpg"], None);
        let caller = admin(&h);
        assert_eq!(h.ctl.start(&caller).unwrap(), StartOutcome { total: 1 });
        assert_eq!(h.ctl.progress(&caller).unwrap().oversized_skipped, 1);
        let errors = h.source.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "huge.mov");
    }

    #[test]
    fn auth_failures_surface_immediately() {
        let h = harness(&["a.jpg"], None);
        let mut caller = admin(&h);
        caller.token = "0".repeat(64);
        assert!(matches!(h.ctl.start(&caller), Err(OffloadError::InvalidToken)));
        assert!(matches!(h.ctl.cancel(&caller), Err(OffloadError::InvalidToken)));
        assert!(matches!(h.ctl.progress(&caller), Err(OffloadError::InvalidToken)));

        let author = Caller {
            user: "author".into(),
            capabilities: vec![Capability::ViewProgress],
            token: h.ctl.issue_token("author"),
        };
        assert!(matches!(
            h.ctl.start(&author),
            Err(OffloadError::PermissionDenied)
        ));
        assert!(h.ctl.progress(&author).is_ok());
        assert!(h.ctl.cancel(&author).is_ok());
    }

    #[test]
    fn tick_after_lock_was_taken_away_abandons_batch() {
        let h = harness(&["a.jpg", "b.jpg"], None);
        let caller = admin(&h);
        h.ctl.start(&caller).unwrap();
        h.ctl.lock.force_release().unwrap();
        assert_eq!(h.ctl.tick().unwrap(), TickEvent::Idle);
        assert!(h.worker.seen.lock().unwrap().is_empty());
        assert!(h.ctl.pending().unwrap().is_none());
    }

    #[test]
    fn run_reclaimed_mid_item_leaves_its_successor_alone() {
        let h = harness(&["a.jpg", "b.jpg", "c.jpg"], None);
        let build = |worker: Arc<dyn OffloadWorker>| {
            JobController::new(
                OffloadConfig::default(),
                h.store.clone(),
                h.source.clone(),
                worker,
                Arc::new(h.clock.clone()),
                TokenIssuer::new([1u8; 32], 86_400),
            )
        };
        let successor = Arc::new(build(h.worker.clone() as Arc<dyn OffloadWorker>));
        let slow = Arc::new(HookWorker {
            inner: h.worker.clone(),
            hook: Mutex::new(None),
        });
        let ctl = build(slow.clone() as Arc<dyn OffloadWorker>);
        let caller = admin(&h);
        assert_eq!(ctl.start(&caller).unwrap(), StartOutcome { total: 3 });

        let (store, clock, next, next_caller) =
            (h.store.clone(), h.clock.clone(), successor.clone(), caller.clone());
        *slow.hook.lock().unwrap() = Some(Box::new(move || {
            clock.advance(std::time::Duration::from_secs(11 * 60));
            let monitor = StallMonitor::new(OffloadConfig::default(), store, Arc::new(clock));
            assert!(matches!(
                monitor.check().unwrap(),
                StallCheck::Recovered { .. }
            ));
            assert_eq!(next.start(&next_caller).unwrap(), StartOutcome { total: 3 });
        }));

        assert_eq!(ctl.tick().unwrap(), TickEvent::Idle);
        let state = successor.job_state().unwrap();
        assert_eq!(
            (state.total, state.processed, state.status),
            (3, 0, JobStatus::Processing)
        );

        assert_eq!(
            successor.run().unwrap(),
            TickEvent::Completed {
                processed: 3,
                errors: 0
            }
        );
        assert!(!successor.lock.is_held(h.clock.now()).unwrap());
    }

    #[test]
    fn losing_the_lock_race_records_nothing() {
        let h = harness(&["huge.mov", "a.jpg"], None);
        assert!(h.ctl.lock.acquire("other-run", h.clock.now()).unwrap());
        assert!(matches!(
            h.ctl.start(&admin(&h)),
            Err(OffloadError::AlreadyRunning)
        ));
        assert!(h.source.errors.lock().unwrap().is_empty());
        assert_eq!(h.ctl.job_state().unwrap(), JobState::default());
    }

    #[test]
    fn only_oversized_items_are_marked_and_lock_is_freed() {
        let h = harness(&["huge.mov"], None);
        assert_eq!(h.ctl.start(&admin(&h)).unwrap(), StartOutcome { total: 0 });
        assert_eq!(h.source.errors.lock().unwrap().len(), 1);
        assert!(!h.ctl.lock.is_held(h.clock.now()).unwrap());
    }
}
