use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::UNIX_EPOCH;

use walkdir::{DirEntry, WalkDir};

use super::index::LedgerIndex;
use super::journal::{Ledger, LedgerRecord};
use super::variants::resolve_primary;
use super::{DerivedFile, LibraryCounts, OffloadRecord, WorkItem, WorkItemSource};
use crate::clock::Clock;
use crate::error::{OffloadError, Result};
use crate::util::sanitize::join_key;

struct Inner {
    ledger: Ledger,
    index: LedgerIndex,
}

/// Media library rooted at a local directory, with offload outcomes kept in
/// an append-only ledger.
pub struct FsCatalog {
    media_root: PathBuf,
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|s| s.starts_with('.'))
}

fn modified_secs(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as i64)
}

/// Visible regular files directly inside `dir`.
fn sibling_names(dir: &Path) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                names.insert(name.to_string());
            }
        }
    }
    Ok(names)
}

impl FsCatalog {
    pub fn open(media_root: &Path, ledger_path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        if !media_root.is_dir() {
            return Err(OffloadError::Catalog(format!(
                "media root {} is not a directory",
                media_root.display()
            )));
        }
        let mut ledger = Ledger::open(ledger_path)?;
        let index = LedgerIndex::from_records(&ledger.replay()?);
        Ok(Self {
            media_root: media_root.to_path_buf(),
            inner: Mutex::new(Inner { ledger, index }),
            clock,
        })
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    fn inner(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| OffloadError::Catalog("catalog mutex poisoned".into()))
    }

    fn append(&self, rec: LedgerRecord) -> Result<()> {
        let mut inner = self.inner()?;
        inner.ledger.append(&rec)?;
        inner.index.apply(&rec);
        Ok(())
    }

    /// File names per directory (relative, `/`-separated).
    fn walk(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let mut dirs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let walker = WalkDir::new(&self.media_root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_hidden(e));
        for entry in walker {
            let entry = entry.map_err(|e| OffloadError::Catalog(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.media_root)
                .map_err(|e| OffloadError::Catalog(e.to_string()))?;
            let Some(name) = rel.file_name().and_then(|n| n.to_str()) else {
                tracing::warn!(path = %entry.path().display(), "skipping non UTF-8 file name");
                continue;
            };
            let dir = rel
                .parent()
                .map(|p| {
                    p.components()
                        .map(|c| c.as_os_str().to_string_lossy().to_string())
                        .collect::<Vec<_>>()
                        .join("/")
                })
                .unwrap_or_default();
            dirs.entry(dir).or_default().insert(name.to_string());
        }
        Ok(dirs)
    }

    /// Every primary file with its derived files and outcome, oldest first.
    pub fn scan(&self) -> Result<Vec<WorkItem>> {
        let dirs = self.walk()?;
        let inner = self.inner()?;
        let mut items = Vec::new();

        for (dir, names) in &dirs {
            let mut primaries: BTreeMap<String, Vec<DerivedFile>> = BTreeMap::new();
            for name in names {
                match resolve_primary(name, names) {
                    Some((primary, kind)) => primaries.entry(primary).or_default().push(DerivedFile {
                        key: name.clone(),
                        kind,
                    }),
                    None => {
                        primaries.entry(name.clone()).or_default();
                    }
                }
            }

            for (name, derived) in primaries {
                let id = join_key([dir.as_str(), name.as_str()]);
                let local_path = self.media_root.join(&id);
                let status = inner.index.status(&id);
                items.push(WorkItem {
                    created_at: modified_secs(&local_path),
                    failed: status.is_some_and(|s| s.has_error()),
                    offloaded: status.is_some_and(|s| s.is_offloaded()),
                    id,
                    local_path,
                    derived,
                });
            }
        }

        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }
}

impl WorkItemSource for FsCatalog {
    fn list_pending(&self, limit: usize, only_previously_failed: bool) -> Result<Vec<WorkItem>> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|i| !i.offloaded && i.failed == only_previously_failed)
            .take(limit)
            .collect())
    }

    /// Looks only at the item's own directory.
    fn get(&self, id: &str) -> Result<Option<WorkItem>> {
        let rel = Path::new(id);
        let clean = !id.is_empty() && rel.components().all(|c| matches!(c, Component::Normal(_)));
        let Some(name) = rel.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        if !clean || name.starts_with('.') {
            return Ok(None);
        }
        let local_path = self.media_root.join(rel);
        if !local_path.is_file() {
            return Ok(None);
        }

        let names = sibling_names(local_path.parent().unwrap_or(&self.media_root))?;
        if resolve_primary(name, &names).is_some() {
            // a derived rendition, not an item of its own
            return Ok(None);
        }
        let derived = names
            .iter()
            .filter_map(|n| match resolve_primary(n, &names) {
                Some((primary, kind)) if primary == name => Some(DerivedFile {
                    key: n.clone(),
                    kind,
                }),
                _ => None,
            })
            .collect();

        let inner = self.inner()?;
        let status = inner.index.status(id);
        Ok(Some(WorkItem {
            id: id.to_string(),
            created_at: modified_secs(&local_path),
            failed: status.is_some_and(|s| s.has_error()),
            offloaded: status.is_some_and(|s| s.is_offloaded()),
            local_path,
            derived,
        }))
    }

    fn mark_offloaded(&self, id: &str, record: OffloadRecord) -> Result<()> {
        self.append(LedgerRecord::Offloaded {
            id: id.to_string(),
            record,
        })
    }

    fn mark_error(&self, id: &str, message: &str) -> Result<()> {
        self.append(LedgerRecord::Failed {
            id: id.to_string(),
            message: message.to_string(),
            at: self.clock.now().unix_timestamp(),
        })
    }

    fn offload_record(&self, id: &str) -> Result<Option<OffloadRecord>> {
        Ok(self
            .inner()?
            .index
            .status(id)
            .and_then(|s| s.offloaded.clone()))
    }

    fn clear(&self, id: &str) -> Result<()> {
        self.append(LedgerRecord::Cleared { id: id.to_string() })
    }

    fn counts(&self) -> Result<LibraryCounts> {
        let mut c = LibraryCounts::default();
        for item in self.scan()? {
            c.total += 1;
            if item.offloaded {
                c.offloaded += 1;
            } else {
                c.pending += 1;
                if item.failed {
                    c.failed += 1;
                }
            }
        }
        Ok(c)
    }
}
