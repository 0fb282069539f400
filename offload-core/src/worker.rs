use std::sync::Arc;

use crate::catalog::{OffloadRecord, WorkItem, WorkItemSource};
use crate::clock::Clock;
use crate::error::{OffloadError, Result};
use crate::storage::ObjectStore;
use crate::util::sanitize::{join_key, sanitize_path};

/// Offloads a single work item. Records the outcome on the item as a side
/// effect; the return value only feeds the run's counters.
pub trait OffloadWorker: Send + Sync {
    fn offload(&self, item: &WorkItem) -> bool;
}

/// Uploads the primary file and its derived files, then marks the item.
pub struct UploadWorker {
    store: Arc<dyn ObjectStore>,
    source: Arc<dyn WorkItemSource>,
    clock: Arc<dyn Clock>,
    prefix: String,
}

impl UploadWorker {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        source: Arc<dyn WorkItemSource>,
        clock: Arc<dyn Clock>,
        path_prefix: &str,
    ) -> Self {
        Self {
            store,
            source,
            clock,
            prefix: sanitize_path(path_prefix),
        }
    }

    /// Remote directory for `item`: sanitized prefix + the item's local directory.
    pub fn remote_dir(&self, item: &WorkItem) -> String {
        join_key([self.prefix.as_str(), item.dir()])
    }

    fn upload(&self, item: &WorkItem) -> Result<OffloadRecord> {
        let remote_dir = self.remote_dir(item);
        let key = join_key([remote_dir.as_str(), item.file_name()]);

        let url = self.store.put_object(&item.local_path, &key)?;
        if !self.store.head_object(&key)? {
            return Err(OffloadError::Storage {
                key,
                message: "object missing after upload".into(),
            });
        }

        let local_dir = item.local_path.parent();
        for d in &item.derived {
            let Some(local) = local_dir.map(|p| p.join(&d.key)) else {
                continue;
            };
            if !local.is_file() {
                tracing::debug!(item = %item.id, derived = %d.key, "derived file vanished, skipping");
                continue;
            }
            self.store
                .put_object(&local, &join_key([remote_dir.as_str(), d.key.as_str()]))?;
        }

        Ok(OffloadRecord {
            remote_dir,
            url,
            provider: self.store.provider_name().to_string(),
            bucket: self.store.bucket().to_string(),
            offloaded_at: self.clock.now().unix_timestamp(),
        })
    }
}

impl OffloadWorker for UploadWorker {
    fn offload(&self, item: &WorkItem) -> bool {
        match self.upload(item) {
            Ok(record) => match self.source.mark_offloaded(&item.id, record) {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(item = %item.id, error = %e, "uploaded but could not record offload");
                    false
                }
            },
            Err(e) => {
                tracing::warn!(item = %item.id, error = %e, "offload failed");
                if let Err(mark) = self.source.mark_error(&item.id, &e.to_string()) {
                    tracing::error!(item = %item.id, error = %mark, "could not record offload error");
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fs::FsCatalog;
    use crate::clock::SystemClock;
    use crate::storage::fs::FsObjectStore;

    #[test]
    fn uploads_primary_and_variants_under_prefix() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let bucket = tempfile::tempdir().unwrap();
        let dir = media.path().join("2024/05");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.jpg"), b"full").unwrap();
        std::fs::write(dir.join("a-150x150.jpg"), b"thumb").unwrap();

        let clock = Arc::new(SystemClock);
        let catalog = Arc::new(
            FsCatalog::open(media.path(), &state.path().join("catalog.log"), clock.clone())
                .unwrap(),
        );
        let store = Arc::new(FsObjectStore::open(bucket.path(), "https://cdn.test").unwrap());
        let worker = UploadWorker::new(store.clone(), catalog.clone(), clock, " /Media/ ");

        let item = catalog.get("2024/05/a.jpg").unwrap().unwrap();
        assert!(worker.offload(&item));
        assert!(store.head_object("media/2024/05/a.jpg").unwrap());
        assert!(store.head_object("media/2024/05/a-150x150.jpg").unwrap());

        let rec = catalog.offload_record("2024/05/a.jpg").unwrap().unwrap();
        assert_eq!(rec.remote_dir, "media/2024/05");
        assert_eq!(rec.url, "https://cdn.test/media/2024/05/a.jpg");
    }

    #[test]
    fn missing_local_file_is_recorded_as_error() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let bucket = tempfile::tempdir().unwrap();
        std::fs::write(media.path().join("gone.jpg"), b"x").unwrap();

        let clock = Arc::new(SystemClock);
        let catalog = Arc::new(
            FsCatalog::open(media.path(), &state.path().join("catalog.log"), clock.clone())
                .unwrap(),
        );
        let store = Arc::new(FsObjectStore::open(bucket.path(), "").unwrap());
        let worker = UploadWorker::new(store, catalog.clone(), clock, "");

        let item = catalog.get("gone.jpg").unwrap().unwrap();
        std::fs::remove_file(media.path().join("gone.jpg")).unwrap();
        assert!(!worker.offload(&item));
        assert!(catalog.offload_record("gone.jpg").unwrap().is_none());
    }
}
