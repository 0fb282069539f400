use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DerivedKind {
    /// Resized rendition (`name-300x200.jpg`).
    Size,
    /// Rendition kept from before an edit (`name-e1700000000.jpg`).
    BackupSize,
    /// Pre-scale source behind a `-scaled` primary.
    Original,
    /// Modern-format copy of the same image (`.webp`, `.avif`).
    ModernSibling,
}

/// A file derived from a primary media file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DerivedFile {
    /// Object key relative to the primary object's directory.
    pub key: String,
    pub kind: DerivedKind,
}

/// One offload-able media file. Immutable from the engine's point of view.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WorkItem {
    /// `/`-separated path of the primary file relative to the media root.
    pub id: String,
    pub local_path: PathBuf,
    /// Unix seconds; candidates are ordered oldest-first on this.
    pub created_at: i64,
    pub derived: Vec<DerivedFile>,
    pub failed: bool,
    pub offloaded: bool,
}

impl WorkItem {
    pub fn file_name(&self) -> &str {
        self.id.rsplit_once('/').map_or(self.id.as_str(), |(_, f)| f)
    }

    /// Directory part of `id`, `""` at the media root.
    pub fn dir(&self) -> &str {
        self.id.rsplit_once('/').map_or("", |(d, _)| d)
    }
}

/// Where and when an item was offloaded.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OffloadRecord {
    /// Remote directory holding the primary and its derived files.
    pub remote_dir: String,
    pub url: String,
    pub provider: String,
    pub bucket: String,
    pub offloaded_at: i64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LibraryCounts {
    pub total: u64,
    pub offloaded: u64,
    pub pending: u64,
    pub failed: u64,
}

/// Enumerates work items and records their offload outcome.
pub trait WorkItemSource: Send + Sync {
    /// Items not yet offloaded, oldest first. `only_previously_failed`
    /// selects the retry lane (items with a recorded error) instead of fresh ones.
    fn list_pending(&self, limit: usize, only_previously_failed: bool) -> Result<Vec<WorkItem>>;

    fn get(&self, id: &str) -> Result<Option<WorkItem>>;

    /// Size on disk in MB, `None` when the file cannot be found.
    fn file_size_mb(&self, item: &WorkItem) -> Option<f64> {
        std::fs::metadata(&item.local_path)
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len() as f64 / (1024.0 * 1024.0))
    }

    fn mark_offloaded(&self, id: &str, record: OffloadRecord) -> Result<()>;

    fn mark_error(&self, id: &str, message: &str) -> Result<()>;

    fn offload_record(&self, id: &str) -> Result<Option<OffloadRecord>>;

    /// Forget everything recorded for `id`.
    fn clear(&self, id: &str) -> Result<()>;

    fn counts(&self) -> Result<LibraryCounts>;
}
