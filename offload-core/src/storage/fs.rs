use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use super::{DeleteFailure, ObjectStore};
use crate::error::{OffloadError, Result};

/// A local directory acting as a bucket.
pub struct FsObjectStore {
    root: PathBuf,
    bucket: String,
    base_url: String,
}

impl FsObjectStore {
    pub fn open(root: &Path, base_url: &str) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let bucket = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Self {
            root: root.to_path_buf(),
            bucket,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let clean = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(OffloadError::Storage {
                key: key.to_string(),
                message: "object key must be a relative path without traversal".into(),
            });
        }
        Ok(self.root.join(rel))
    }

    fn url_for(&self, key: &str, path: &Path) -> String {
        if self.base_url.is_empty() {
            format!("file://{}", path.display())
        } else {
            format!("{}/{}", self.base_url, key)
        }
    }
}

impl ObjectStore for FsObjectStore {
    fn provider_name(&self) -> &str {
        "Filesystem"
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put_object(&self, local_path: &Path, key: &str) -> Result<String> {
        let dest = self.object_path(key)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(local_path, &dest)?;
        Ok(self.url_for(key, &dest))
    }

    fn head_object(&self, key: &str) -> Result<bool> {
        Ok(self.object_path(key)?.is_file())
    }

    fn delete_object(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OffloadError::Storage {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    fn delete_objects(&self, keys: &[String]) -> Result<Vec<DeleteFailure>> {
        let mut failures = Vec::new();
        for key in keys {
            if let Err(e) = self.delete_object(key) {
                failures.push(DeleteFailure {
                    key: key.clone(),
                    message: e.to_string(),
                });
            }
        }
        Ok(failures)
    }
}
