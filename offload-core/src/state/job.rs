use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{StateStore, get_record, put_record};
use crate::error::Result;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "processing")]
    Processing,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "completed")]
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::None => "",
            JobStatus::Ready => "ready",
            JobStatus::Processing => "processing",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate progress of the current (or last) run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub total: u64,
    pub processed: u64,
    pub errors: u64,
    pub oversized_skipped: u64,
    pub status: JobStatus,
    /// Unix seconds of the last write.
    pub last_update: Option<i64>,
}

/// Partial update; `None` fields keep their stored value.
#[derive(Clone, Debug, Default)]
pub struct JobStatePatch {
    pub total: Option<u64>,
    pub processed: Option<u64>,
    pub errors: Option<u64>,
    pub oversized_skipped: Option<u64>,
    pub status: Option<JobStatus>,
}

impl JobStatePatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct JobStateRepo {
    store: Arc<dyn StateStore>,
    key: String,
}

impl JobStateRepo {
    pub fn new(store: Arc<dyn StateStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Stored state, or defaults (`total=0`, `status=""`) when nothing is stored.
    pub fn load(&self) -> Result<JobState> {
        Ok(get_record(self.store.as_ref(), &self.key)?.unwrap_or_default())
    }

    /// Merge `patch` into the stored state and stamp `last_update`.
    pub fn update(&self, patch: JobStatePatch, now: OffsetDateTime) -> Result<JobState> {
        let mut state = self.load()?;
        if let Some(v) = patch.total {
            state.total = v;
        }
        if let Some(v) = patch.processed {
            state.processed = v;
        }
        if let Some(v) = patch.errors {
            state.errors = v;
        }
        if let Some(v) = patch.oversized_skipped {
            state.oversized_skipped = v;
        }
        if let Some(v) = patch.status {
            state.status = v;
        }
        state.processed = state.processed.min(state.total);
        state.errors = state.errors.min(state.processed);

        let ts = now.unix_timestamp();
        state.last_update = Some(state.last_update.map_or(ts, |prev| prev.max(ts)));

        put_record(self.store.as_ref(), &self.key, &state)?;
        Ok(state)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.delete(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::mem::MemStateStore;
    use time::macros::datetime;

    fn repo() -> JobStateRepo {
        JobStateRepo::new(Arc::new(MemStateStore::new()), "job_data")
    }

    #[test]
    fn missing_record_loads_defaults() {
        let s = repo().load().unwrap();
        assert_eq!(s.total, 0);
        assert_eq!(s.status, JobStatus::None);
        assert_eq!(s.status.as_str(), "");
        assert_eq!(s.last_update, None);
    }

    #[test]
    fn update_merges_and_stamps() {
        let r = repo();
        let t0 = datetime!(2024-05-01 10:00 UTC);
        r.update(
            JobStatePatch {
                total: Some(4),
                status: Some(JobStatus::Processing),
                ..Default::default()
            },
            t0,
        )
        .unwrap();
        let s = r
            .update(
                JobStatePatch {
                    processed: Some(1),
                    ..Default::default()
                },
                t0 + time::Duration::seconds(5),
            )
            .unwrap();
        assert_eq!(s.total, 4);
        assert_eq!(s.processed, 1);
        assert_eq!(s.status, JobStatus::Processing);
        assert_eq!(s.last_update, Some(t0.unix_timestamp() + 5));
    }

    #[test]
    fn processed_never_exceeds_total() {
        let r = repo();
        let t0 = datetime!(2024-05-01 10:00 UTC);
        let s = r
            .update(
                JobStatePatch {
                    total: Some(2),
                    processed: Some(5),
                    errors: Some(5),
                    ..Default::default()
                },
                t0,
            )
            .unwrap();
        assert_eq!(s.processed, 2);
        assert_eq!(s.errors, 2);
    }

    #[test]
    fn last_update_does_not_move_backwards() {
        let r = repo();
        let t0 = datetime!(2024-05-01 10:00 UTC);
        r.update(JobStatePatch::status(JobStatus::Ready), t0).unwrap();
        let s = r
            .update(
                JobStatePatch::status(JobStatus::Processing),
                t0 - time::Duration::minutes(3),
            )
            .unwrap();
        assert_eq!(s.last_update, Some(t0.unix_timestamp()));
    }

    #[test]
    fn clear_resets_to_defaults() {
        let r = repo();
        r.update(
            JobStatePatch {
                total: Some(3),
                ..Default::default()
            },
            datetime!(2024-05-01 10:00 UTC),
        )
        .unwrap();
        r.clear().unwrap();
        assert_eq!(r.load().unwrap(), JobState::default());
    }
}
