use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::OffloadConfig;
use crate::error::Result;
use crate::state::job::{JobStatePatch, JobStateRepo, JobStatus};
use crate::state::lock::RunLock;
use crate::state::StateStore;

/// Result of one stall check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StallCheck {
    /// No run is active.
    Idle,
    /// A run is active and made progress recently.
    Healthy,
    /// The run had not progressed for `stalled_for`; its lock was reclaimed.
    Recovered { stalled_for: Duration },
    /// The previous check was less than one check interval ago.
    NotDue,
}

/// Reclaims runs that stopped updating their progress.
pub struct StallMonitor {
    config: OffloadConfig,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    jobs: JobStateRepo,
    lock: RunLock,
}

impl StallMonitor {
    pub fn new(config: OffloadConfig, store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        let jobs = JobStateRepo::new(store.clone(), config.data_key());
        let lock = RunLock::new(store.clone(), config.lock_key(), config.lock_ttl());
        Self {
            config,
            store,
            clock,
            jobs,
            lock,
        }
    }

    /// Reclaims a run whose lock is held without recent progress, and a run
    /// still marked processing after its lock expired or vanished.
    pub fn check(&self) -> Result<StallCheck> {
        let now = self.clock.now();
        let held = self.lock.is_held(now)?;
        let state = self.jobs.load()?;
        let last = state.last_update.unwrap_or(0);
        let idle_secs = (now.unix_timestamp() - last).max(0) as u64;

        if held {
            if idle_secs <= self.config.stall.timeout_secs {
                return Ok(StallCheck::Healthy);
            }
            self.lock.force_release()?;
        } else if state.status != JobStatus::Processing {
            return Ok(StallCheck::Idle);
        }

        self.store.delete(&self.config.cancel_key())?;
        self.store.delete(&self.config.batch_key())?;
        self.jobs
            .update(JobStatePatch::status(JobStatus::Ready), now)?;

        tracing::warn!(
            job = %self.config.job_id,
            idle_secs,
            processed = state.processed,
            total = state.total,
            "bulk offload stalled, lock released"
        );
        Ok(StallCheck::Recovered {
            stalled_for: Duration::from_secs(idle_secs),
        })
    }

    /// Run `check` at most once per check interval.
    pub fn run_if_due(&self) -> Result<StallCheck> {
        let now = self.clock.now().unix_timestamp();
        let key = self.config.stall_check_key();
        let last = match self.store.get(&key)? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_slice().try_into().unwrap_or([0; 8]);
                i64::from_le_bytes(bytes)
            }
            None => i64::MIN,
        };
        if last != i64::MIN && now.saturating_sub(last) < self.config.stall.check_interval_secs as i64 {
            return Ok(StallCheck::NotDue);
        }
        self.store.set(&key, &now.to_le_bytes())?;
        self.check()
    }
}
