use std::sync::Arc;

use crate::catalog::{WorkItem, WorkItemSource};
use crate::config::BatchLimits;
use crate::error::Result;

/// Outcome of one selection pass.
#[derive(Clone, Debug, Default)]
pub struct Selection {
    pub items: Vec<WorkItem>,
    /// Fresh items over the per-item cap; the caller marks them with a
    /// permanent error so they move to the retry lane.
    pub oversized: Vec<WorkItem>,
    pub total_mb: f64,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn oversized_count(&self) -> usize {
        self.oversized.len()
    }
}

/// Builds the next bounded batch of work under count and byte budgets.
pub struct CandidateSelector {
    source: Arc<dyn WorkItemSource>,
}

enum Lane {
    Fresh,
    Retry,
}

impl CandidateSelector {
    pub fn new(source: Arc<dyn WorkItemSource>) -> Self {
        Self { source }
    }

    /// Fresh items first (up to `2 * max_count` candidates), then previously
    /// failed items fill whatever capacity is left under a looser per-item cap.
    pub fn select_batch(&self, limits: &BatchLimits) -> Result<Selection> {
        let mut sel = Selection::default();

        let fresh = self
            .source
            .list_pending(limits.max_count.saturating_mul(2), false)?;
        self.fill(&mut sel, fresh, limits, Lane::Fresh);

        let remaining = limits.max_count.saturating_sub(sel.items.len());
        if remaining > 0 {
            let retry = self.source.list_pending(remaining.saturating_mul(2), true)?;
            self.fill(&mut sel, retry, limits, Lane::Retry);
        }

        tracing::debug!(
            selected = sel.items.len(),
            oversized = sel.oversized.len(),
            total_mb = sel.total_mb,
            "selected offload batch"
        );
        Ok(sel)
    }

    fn fill(&self, sel: &mut Selection, candidates: Vec<WorkItem>, limits: &BatchLimits, lane: Lane) {
        let per_item_cap = match lane {
            Lane::Fresh => limits.per_item_max_mb,
            Lane::Retry => limits.retry_per_item_max_mb,
        };

        for item in candidates {
            if sel.items.len() >= limits.max_count {
                break;
            }

            // Unresolvable size: admit at zero cost, the worker fails it fast.
            let Some(size_mb) = self.source.file_size_mb(&item) else {
                sel.items.push(item);
                continue;
            };

            if size_mb > per_item_cap {
                if let Lane::Fresh = lane {
                    tracing::info!(item = %item.id, size_mb, "skipping oversized file");
                    sel.oversized.push(item);
                }
                continue;
            }

            if sel.total_mb + size_mb > limits.max_batch_mb {
                break;
            }
            sel.total_mb += size_mb;
            sel.items.push(item);
        }
    }
}
