use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::StateStore;
use crate::error::Result;

/// Persisted form of the run lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

impl LockRecord {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now.unix_timestamp() >= self.expires_at
    }
}

/// Mutually exclusive, expiring flag keyed by job identifier.
///
/// Every transition is a compare-and-swap against the exact stored bytes, so
/// two processes racing for the lock cannot both win.
#[derive(Clone)]
pub struct RunLock {
    store: Arc<dyn StateStore>,
    key: String,
    ttl: Duration,
}

impl RunLock {
    pub fn new(store: Arc<dyn StateStore>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            ttl,
        }
    }

    fn read(&self) -> Result<Option<(Vec<u8>, LockRecord)>> {
        match self.store.get(&self.key)? {
            Some(raw) => {
                let rec: LockRecord = serde_cbor::from_slice(&raw)?;
                Ok(Some((raw, rec)))
            }
            None => Ok(None),
        }
    }

    fn record_for(&self, holder: &str, acquired_at: i64, now: OffsetDateTime) -> LockRecord {
        LockRecord {
            holder: holder.to_string(),
            acquired_at,
            expires_at: now.unix_timestamp() + self.ttl.as_secs() as i64,
        }
    }

    /// Take the lock when it is free or expired.
    pub fn acquire(&self, holder: &str, now: OffsetDateTime) -> Result<bool> {
        let current = self.read()?;
        if let Some((_, rec)) = &current {
            if !rec.is_expired(now) {
                return Ok(false);
            }
        }
        let next = serde_cbor::to_vec(&self.record_for(holder, now.unix_timestamp(), now))?;
        self.store.compare_and_swap(
            &self.key,
            current.as_ref().map(|(raw, _)| raw.as_slice()),
            Some(&next),
        )
    }

    /// Push the expiry forward. Only the recorded holder may refresh; an
    /// expired lock that nobody else took over is still ours to refresh.
    pub fn refresh(&self, holder: &str, now: OffsetDateTime) -> Result<bool> {
        let Some((raw, rec)) = self.read()? else {
            return Ok(false);
        };
        if rec.holder != holder {
            return Ok(false);
        }
        let next = serde_cbor::to_vec(&self.record_for(holder, rec.acquired_at, now))?;
        self.store.compare_and_swap(&self.key, Some(&raw), Some(&next))
    }

    /// Release by the holder; a lock held by someone else is left alone.
    pub fn release(&self, holder: &str) -> Result<bool> {
        let Some((raw, rec)) = self.read()? else {
            return Ok(false);
        };
        if rec.holder != holder {
            return Ok(false);
        }
        self.store.compare_and_swap(&self.key, Some(&raw), None)
    }

    pub fn force_release(&self) -> Result<()> {
        self.store.delete(&self.key)
    }

    pub fn peek(&self) -> Result<Option<LockRecord>> {
        Ok(self.read()?.map(|(_, rec)| rec))
    }

    pub fn is_held(&self, now: OffsetDateTime) -> Result<bool> {
        Ok(self.peek()?.is_some_and(|rec| !rec.is_expired(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::mem::MemStateStore;
    use time::macros::datetime;

    fn lock() -> RunLock {
        RunLock::new(
            Arc::new(MemStateStore::new()),
            "job_process_lock",
            Duration::from_secs(60),
        )
    }

    #[test]
    fn single_holder_at_a_time() {
        let l = lock();
        let t0 = datetime!(2024-05-01 10:00 UTC);
        assert!(l.acquire("run-a", t0).unwrap());
        assert!(!l.acquire("run-b", t0).unwrap());
        assert!(l.is_held(t0).unwrap());
        assert!(!l.release("run-b").unwrap());
        assert!(l.release("run-a").unwrap());
        assert!(!l.is_held(t0).unwrap());
        assert!(l.acquire("run-b", t0).unwrap());
    }

    #[test]
    fn expired_lock_can_be_taken_over() {
        let l = lock();
        let t0 = datetime!(2024-05-01 10:00 UTC);
        assert!(l.acquire("run-a", t0).unwrap());
        let later = t0 + time::Duration::seconds(61);
        assert!(!l.is_held(later).unwrap());
        assert!(l.acquire("run-b", later).unwrap());
        assert!(!l.refresh("run-a", later).unwrap());
        assert_eq!(l.peek().unwrap().unwrap().holder, "run-b");
    }

    #[test]
    fn refresh_extends_expiry_for_holder() {
        let l = lock();
        let t0 = datetime!(2024-05-01 10:00 UTC);
        l.acquire("run-a", t0).unwrap();
        let t1 = t0 + time::Duration::seconds(50);
        assert!(l.refresh("run-a", t1).unwrap());
        let rec = l.peek().unwrap().unwrap();
        assert_eq!(rec.acquired_at, t0.unix_timestamp());
        assert_eq!(rec.expires_at, t1.unix_timestamp() + 60);
    }

    #[test]
    fn force_release_drops_any_holder() {
        let l = lock();
        let t0 = datetime!(2024-05-01 10:00 UTC);
        l.acquire("run-a", t0).unwrap();
        l.force_release().unwrap();
        assert!(l.peek().unwrap().is_none());
    }
}
