//! Storage seam used by the queue processor

use async_trait::async_trait;

use crate::db::Database;
use crate::error::Result;
use crate::outcome::{self, Resolution};
use crate::types::{Post, QueueItem};

/// Queue operations the processor depends on.
///
/// [`Database`] is the production implementation; tests wrap it to inject
/// store failures.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn enqueue_due_posts(&self, now: i64, max_attempts: u32) -> Result<u64>;

    async fn rearm_due_retries(&self, now: i64) -> Result<u64>;

    async fn reclaim_stuck(&self, claimed_before: i64, now: i64) -> Result<u64>;

    async fn claim_batch(&self, limit: usize, now: i64) -> Result<Vec<QueueItem>>;

    async fn load_post(&self, post_id: &str) -> Result<Option<Post>>;

    /// `Ok(false)` when this attempt was already recorded
    async fn record_outcome(
        &self,
        item: &QueueItem,
        resolution: &Resolution,
        processing_time_ms: i64,
    ) -> Result<bool>;

    /// Fail a claimed item terminally without a publish attempt
    async fn fail_item(&self, item: &QueueItem, reason: &str) -> Result<bool> {
        let resolution = outcome::terminal(item, reason, chrono::Utc::now().timestamp());
        self.record_outcome(item, &resolution, 0).await
    }

    async fn requeue(&self, queue_id: &str, now: i64) -> Result<QueueItem>;
}

#[async_trait]
impl QueueRepository for Database {
    async fn enqueue_due_posts(&self, now: i64, max_attempts: u32) -> Result<u64> {
        Database::enqueue_due_posts(self, now, max_attempts).await
    }

    async fn rearm_due_retries(&self, now: i64) -> Result<u64> {
        Database::rearm_due_retries(self, now).await
    }

    async fn reclaim_stuck(&self, claimed_before: i64, now: i64) -> Result<u64> {
        Database::reclaim_stuck(self, claimed_before, now).await
    }

    async fn claim_batch(&self, limit: usize, now: i64) -> Result<Vec<QueueItem>> {
        Database::claim_batch(self, limit, now).await
    }

    async fn load_post(&self, post_id: &str) -> Result<Option<Post>> {
        self.get_post(post_id).await
    }

    async fn record_outcome(
        &self,
        item: &QueueItem,
        resolution: &Resolution,
        processing_time_ms: i64,
    ) -> Result<bool> {
        Database::record_outcome(self, item, resolution, processing_time_ms).await
    }

    async fn requeue(&self, queue_id: &str, now: i64) -> Result<QueueItem> {
        self.requeue_item(queue_id, now).await
    }
}
