use std::collections::BTreeMap;

use super::OffloadRecord;
use super::journal::LedgerRecord;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ItemStatus {
    pub offloaded: Option<OffloadRecord>,
    pub error: Option<String>,
}

impl ItemStatus {
    pub fn is_offloaded(&self) -> bool {
        self.offloaded.is_some()
    }

    pub fn has_error(&self) -> bool {
        self.error.as_deref().is_some_and(|m| !m.is_empty())
    }
}

/// Current outcome per item, folded from the ledger.
#[derive(Clone, Debug, Default)]
pub struct LedgerIndex {
    pub by_id: BTreeMap<String, ItemStatus>,
}

impl LedgerIndex {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a LedgerRecord>) -> Self {
        let mut index = Self::default();
        for rec in records {
            index.apply(rec);
        }
        index
    }

    pub fn apply(&mut self, rec: &LedgerRecord) {
        match rec {
            LedgerRecord::Offloaded { id, record } => {
                let e = self.by_id.entry(id.clone()).or_default();
                e.offloaded = Some(record.clone());
                e.error = None;
            }
            LedgerRecord::Failed { id, message, .. } => {
                let e = self.by_id.entry(id.clone()).or_default();
                e.error = Some(message.clone());
            }
            LedgerRecord::Cleared { id } => {
                self.by_id.remove(id);
            }
        }
    }

    pub fn status(&self, id: &str) -> Option<&ItemStatus> {
        self.by_id.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offloaded(id: &str) -> LedgerRecord {
        LedgerRecord::Offloaded {
            id: id.into(),
            record: OffloadRecord {
                remote_dir: "2024/05".into(),
                url: format!("https://cdn/{id}"),
                provider: "Filesystem".into(),
                bucket: "media".into(),
                offloaded_at: 10,
            },
        }
    }

    #[test]
    fn offload_clears_previous_error() {
        let recs = vec![
            LedgerRecord::Failed {
                id: "a.jpg".into(),
                message: "timeout".into(),
                at: 1,
            },
            offloaded("a.jpg"),
        ];
        let idx = LedgerIndex::from_records(&recs);
        let st = idx.status("a.jpg").unwrap();
        assert!(st.is_offloaded());
        assert!(!st.has_error());
    }

    #[test]
    fn cleared_items_are_forgotten() {
        let recs = vec![offloaded("a.jpg"), LedgerRecord::Cleared { id: "a.jpg".into() }];
        let idx = LedgerIndex::from_records(&recs);
        assert!(idx.status("a.jpg").is_none());
    }
}
