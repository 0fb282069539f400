use std::path::Path;

use crate::error::Result;

/// A key the provider refused to delete during a batch call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteFailure {
    pub key: String,
    pub message: String,
}

/// Narrow object-storage contract the engine relies on.
pub trait ObjectStore: Send + Sync {
    fn provider_name(&self) -> &str;

    fn bucket(&self) -> &str;

    /// Upload `local_path` under `key`; returns the public URL.
    fn put_object(&self, local_path: &Path, key: &str) -> Result<String>;

    fn head_object(&self, key: &str) -> Result<bool>;

    fn delete_object(&self, key: &str) -> Result<()>;

    /// Batch delete with quiet semantics: only failing keys come back.
    /// `Err` means the call itself failed and nothing is known per key.
    fn delete_objects(&self, keys: &[String]) -> Result<Vec<DeleteFailure>>;
}
