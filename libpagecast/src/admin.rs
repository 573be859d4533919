//! Operator surface over the queue: inspection and manual recovery

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::db::{Database, QueueLog, StatusCounts};
use crate::error::Result;
use crate::types::QueueItem;

pub const DEFAULT_STATS_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_LOG_LIMIT: usize = 50;
pub const DEFAULT_FAILED_LIMIT: usize = 20;
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Upper bound on items touched by one bulk re-queue
const BULK_REQUEUE_LIMIT: usize = 1000;

/// Snapshot of queue health
#[derive(Debug, Clone, Serialize)]
pub struct QueueOverview {
    pub window_secs: u64,
    pub counts: StatusCounts,
    pub recent_logs: Vec<QueueLog>,
    pub retryable_failures: Vec<QueueItem>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkRequeueReport {
    pub requeued: usize,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct AdminService {
    db: Database,
}

impl AdminService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn cutoff(window: Duration) -> i64 {
        let secs = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
        Self::now().saturating_sub(secs)
    }

    /// Counts by status of items created within `window`
    pub async fn stats(&self, window: Duration) -> Result<StatusCounts> {
        self.db.queue_stats(Self::cutoff(window)).await
    }

    pub async fn recent_logs(&self, limit: usize) -> Result<Vec<QueueLog>> {
        self.db.recent_logs(limit).await
    }

    /// Failed items still under their attempt budget.
    ///
    /// Selection is by attempt count alone, whatever the failure kind: a
    /// policy rejection on the first attempt is listed, a network failure
    /// that exhausted its attempts is not.
    pub async fn retryable_failures(&self, limit: usize) -> Result<Vec<QueueItem>> {
        self.db.retryable_failures(limit).await
    }

    pub async fn overview(&self, window: Duration) -> Result<QueueOverview> {
        Ok(QueueOverview {
            window_secs: window.as_secs(),
            counts: self.stats(window).await?,
            recent_logs: self.recent_logs(DEFAULT_LOG_LIMIT).await?,
            retryable_failures: self.retryable_failures(DEFAULT_FAILED_LIMIT).await?,
        })
    }

    /// Re-queue one failed item with a fresh attempt budget
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id; `InvalidTransition` when the item is not failed.
    pub async fn retry_item(&self, queue_id: &str) -> Result<QueueItem> {
        self.db.requeue_item(queue_id, Self::now()).await
    }

    /// Re-queue every retryable failed item
    ///
    /// Items that cannot be re-queued are reported and skipped.
    pub async fn retry_all(&self) -> Result<BulkRequeueReport> {
        let candidates = self.db.retryable_failures(BULK_REQUEUE_LIMIT).await?;
        let mut report = BulkRequeueReport::default();

        for item in candidates {
            match self.db.requeue_item(&item.queue_id, Self::now()).await {
                Ok(_) => report.requeued += 1,
                Err(e) => {
                    warn!(queue_id = %item.queue_id, error = %e, "Could not re-queue item");
                    report.errors.push(format!("{}: {}", item.queue_id, e));
                }
            }
        }

        info!(requeued = report.requeued, errors = report.errors.len(), "Bulk re-queue finished");
        Ok(report)
    }

    /// Return items stuck in `processing` for longer than `older_than` to `pending`
    pub async fn reclaim_stuck(&self, older_than: Duration) -> Result<u64> {
        self.db.reclaim_stuck(Self::cutoff(older_than), Self::now()).await
    }

    /// Delete completed items finished more than `older_than` ago
    pub async fn clear_completed(&self, older_than: Duration) -> Result<u64> {
        let removed = self.db.clear_completed(Self::cutoff(older_than)).await?;
        info!(removed, "Cleared completed queue items");
        Ok(removed)
    }
}
