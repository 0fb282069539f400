use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::catalog::{WorkItem, WorkItemSource};
use crate::clock::Clock;
use crate::delete::{BulkDeleter, DeleteKeySet};
use crate::error::Result;
use crate::state::{StateStore, get_record, put_record};
use crate::util::sanitize::join_key;

const NOTICE_PREFIX: &str = "advmo_delete_error_";

/// Short-lived, per-user notice that remote cleanup failed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DeleteNotice {
    pub item_id: String,
    pub message: String,
    pub expires_at: i64,
}

/// Removes an item's remote objects when the item is deleted locally.
pub struct RemovalHandler {
    source: Arc<dyn WorkItemSource>,
    deleter: BulkDeleter,
    state: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    notice_ttl: Duration,
}

impl RemovalHandler {
    pub fn new(
        source: Arc<dyn WorkItemSource>,
        deleter: BulkDeleter,
        state: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        notice_ttl_secs: u64,
    ) -> Self {
        Self {
            source,
            deleter,
            state,
            clock,
            notice_ttl: Duration::seconds(notice_ttl_secs as i64),
        }
    }

    fn notice_key(user: &str) -> String {
        format!("{NOTICE_PREFIX}{}", hex::encode(user.as_bytes()))
    }

    /// Delete the remote copies of `item` and forget its offload record.
    ///
    /// Returns whether remote cleanup fully succeeded. A failed cleanup does
    /// not block the local removal; `user` gets a notice instead.
    pub fn on_remove(&self, user: &str, item: &WorkItem) -> Result<bool> {
        let Some(record) = self.source.offload_record(&item.id)? else {
            self.source.clear(&item.id)?;
            return Ok(true);
        };

        let primary = join_key([record.remote_dir.as_str(), item.file_name()]);
        let keys = DeleteKeySet::for_object(&primary, &item.derived);
        let ok = self.deleter.delete_all(keys.keys());
        if !ok {
            tracing::error!(item = %item.id, keys = keys.keys().len(), "failed to delete remote copies");
            let notice = DeleteNotice {
                item_id: item.id.clone(),
                message: format!(
                    "Could not delete {} from {}; remove it manually.",
                    item.file_name(),
                    record.provider
                ),
                expires_at: (self.clock.now() + self.notice_ttl).unix_timestamp(),
            };
            put_record(self.state.as_ref(), &Self::notice_key(user), &notice)?;
        }

        self.source.clear(&item.id)?;
        Ok(ok)
    }

    /// Pending notice for `user`, shown once.
    pub fn take_notice(&self, user: &str) -> Result<Option<DeleteNotice>> {
        let key = Self::notice_key(user);
        let notice: Option<DeleteNotice> = get_record(self.state.as_ref(), &key)?;
        if notice.is_some() {
            self.state.delete(&key)?;
        }
        let now = self.clock.now().unix_timestamp();
        Ok(notice.filter(|n| n.expires_at > now))
    }
}
