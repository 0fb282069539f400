use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tempfile::NamedTempFile;

use super::StateStore;
use crate::error::Result;

const GUARD_NAME: &str = ".cas.guard";
const GUARD_STALE_AFTER: Duration = Duration::from_secs(30);
const GUARD_ATTEMPTS: u32 = 500;
const GUARD_BACKOFF: Duration = Duration::from_millis(10);

/// One file per key inside `dir`. Every write lands through a temp file and an
/// atomic rename, so readers see either the old or the new value after a crash.
pub struct FsStateStore {
    dir: PathBuf,
    local: Mutex<()>,
}

impl FsStateStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            local: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
        if !valid {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid state key {key:?}"),
            )
            .into());
        }
        Ok(self.dir.join(key))
    }

    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match std::fs::read(path) {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, path: &Path, value: &[u8]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(value)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl StateStore for FsStateStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        self.read(&path)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        self.write(&path, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        self.remove(&path)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool> {
        let path = self.path_for(key)?;
        let _local = self
            .local
            .lock()
            .map_err(|_| std::io::Error::other("state store mutex poisoned"))?;
        let _guard = GuardFile::acquire(&self.dir.join(GUARD_NAME))?;

        let current = self.read(&path)?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        match new {
            Some(v) => self.write(&path, v)?,
            None => self.remove(&path)?,
        }
        Ok(true)
    }
}

/// Cross-process mutex: an exclusively created file, removed on drop.
struct GuardFile {
    path: PathBuf,
}

impl GuardFile {
    fn acquire(path: &Path) -> Result<Self> {
        for _ in 0..GUARD_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(path) {
                        tracing::warn!(guard = %path.display(), "reclaiming stale state guard");
                        let _ = std::fs::remove_file(path);
                        continue;
                    }
                    std::thread::sleep(GUARD_BACKOFF);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(std::io::Error::new(ErrorKind::WouldBlock, "state guard is busy").into())
    }
}

impl Drop for GuardFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .is_some_and(|age| age > GUARD_STALE_AFTER)
}
