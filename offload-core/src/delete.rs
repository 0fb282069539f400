use std::collections::HashSet;
use std::sync::Arc;

use crate::catalog::DerivedFile;
use crate::config::MAX_DELETE_CHUNK;
use crate::storage::ObjectStore;

/// Remote keys belonging to one logical file. Computed per delete request,
/// never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteKeySet {
    keys: Vec<String>,
}

impl DeleteKeySet {
    /// The primary key plus every derived key, all rooted under the primary's
    /// directory (`""` when the primary sits at the storage root).
    pub fn for_object(primary_key: &str, derived: &[DerivedFile]) -> Self {
        let prefix = primary_key
            .rfind('/')
            .map_or("", |i| &primary_key[..=i]);
        let mut keys = Vec::with_capacity(derived.len() + 1);
        keys.push(primary_key.to_string());
        keys.extend(derived.iter().map(|d| format!("{prefix}{}", d.key)));
        Self { keys }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

/// Deletes remote objects in chunked batch calls, falling back to
/// single-object deletes for any chunk that fails.
pub struct BulkDeleter {
    store: Arc<dyn ObjectStore>,
    chunk_size: usize,
}

impl BulkDeleter {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_chunk_size(store, MAX_DELETE_CHUNK)
    }

    pub fn with_chunk_size(store: Arc<dyn ObjectStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.clamp(1, MAX_DELETE_CHUNK),
        }
    }

    /// `true` only when every batch call succeeded without per-key errors.
    /// Never aborts early: every key gets at least one delete attempt.
    pub fn delete_all(&self, keys: &[String]) -> bool {
        let keys = dedupe(keys);
        if keys.is_empty() {
            return true;
        }

        let mut ok = true;
        for (n, chunk) in keys.chunks(self.chunk_size).enumerate() {
            match self.store.delete_objects(chunk) {
                Ok(failures) if failures.is_empty() => {}
                Ok(failures) => {
                    ok = false;
                    for f in &failures {
                        tracing::warn!(chunk = n, key = %f.key, error = %f.message, "batch delete reported a failure");
                    }
                    self.delete_one_by_one(chunk);
                }
                Err(e) => {
                    ok = false;
                    tracing::error!(chunk = n, keys = chunk.len(), error = %e, "batch delete call failed, deleting individually");
                    self.delete_one_by_one(chunk);
                }
            }
        }
        ok
    }

    fn delete_one_by_one(&self, chunk: &[String]) {
        for key in chunk {
            if let Err(e) = self.store.delete_object(key) {
                tracing::error!(key = %key, error = %e, "single delete failed");
            }
        }
    }
}

/// Drop empty keys and duplicates, keeping first-seen order.
fn dedupe(keys: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.iter()
        .filter(|k| !k.trim().is_empty())
        .filter(|k| seen.insert(k.as_str()))
        .cloned()
        .collect()
}
