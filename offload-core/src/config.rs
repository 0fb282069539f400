use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{OffloadError, Result};

/// Object-storage batch-delete request limit.
pub const MAX_DELETE_CHUNK: usize = 1000;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchLimits {
    pub max_count: usize,
    pub max_batch_mb: f64,
    /// Fresh items above this size are skipped and marked with a permanent error.
    pub per_item_max_mb: f64,
    /// Looser cap applied to previously failed items.
    pub retry_per_item_max_mb: f64,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_count: 50,
            max_batch_mb: 150.0,
            per_item_max_mb: 10.0,
            retry_per_item_max_mb: 100.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StallSettings {
    pub timeout_secs: u64,
    pub check_interval_secs: u64,
}

impl Default for StallSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            check_interval_secs: 900,
        }
    }
}

impl StallSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    pub job_id: String,
    pub batch: BatchLimits,
    pub stall: StallSettings,
    pub lock_ttl_secs: u64,
    pub delete_chunk_size: usize,
    pub path_prefix: String,
    pub public_base_url: String,
    pub notice_ttl_secs: u64,
    pub token_lifetime_secs: u64,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            job_id: "advmo_bulk_offload".to_string(),
            batch: BatchLimits::default(),
            stall: StallSettings::default(),
            lock_ttl_secs: 3600,
            delete_chunk_size: MAX_DELETE_CHUNK,
            path_prefix: String::new(),
            public_base_url: String::new(),
            notice_ttl_secs: 120,
            token_lifetime_secs: 86_400,
        }
    }
}

impl OffloadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.job_id.trim().is_empty() {
            return Err(OffloadError::Config("job_id must not be empty".into()));
        }
        if self.batch.max_count == 0 {
            return Err(OffloadError::Config("batch.max_count must be > 0".into()));
        }
        if !(self.batch.max_batch_mb > 0.0) {
            return Err(OffloadError::Config("batch.max_batch_mb must be > 0".into()));
        }
        if !(self.batch.per_item_max_mb > 0.0) || !(self.batch.retry_per_item_max_mb > 0.0) {
            return Err(OffloadError::Config(
                "per-item size caps must be > 0".into(),
            ));
        }
        if self.stall.timeout_secs == 0 || self.stall.check_interval_secs == 0 {
            return Err(OffloadError::Config("stall settings must be > 0".into()));
        }
        if self.lock_ttl_secs == 0 || self.token_lifetime_secs < 2 {
            return Err(OffloadError::Config(
                "lock_ttl_secs and token_lifetime_secs must be set".into(),
            ));
        }
        Ok(())
    }

    /// Chunk size actually used for batch deletes.
    pub fn delete_chunk(&self) -> usize {
        self.delete_chunk_size.clamp(1, MAX_DELETE_CHUNK)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_key(&self) -> String {
        format!("{}_process_lock", self.job_id)
    }

    pub fn cancel_key(&self) -> String {
        format!("{}_cancelled", self.job_id)
    }

    pub fn data_key(&self) -> String {
        format!("{}_data", self.job_id)
    }

    pub fn batch_key(&self) -> String {
        format!("{}_batch", self.job_id)
    }

    pub fn stall_check_key(&self) -> String {
        format!("{}_stall_checked", self.job_id)
    }
}
