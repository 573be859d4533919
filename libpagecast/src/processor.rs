//! Queue processor: one bounded processing cycle per trigger
//!
//! A cycle enqueues due posts, re-arms retries whose backoff elapsed, reclaims
//! abandoned claims, then claims a batch and publishes each item. Items run
//! with bounded parallelism; the platforms of one post run concurrently.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::config::{Config, QueueConfig};
use crate::credentials::{CredentialProvider, DbCredentialProvider};
use crate::db::Database;
use crate::error::Result;
use crate::outcome::{self, AttemptResults};
use crate::platforms::facebook::FacebookPublisher;
use crate::platforms::graph::GraphClient;
use crate::platforms::instagram::InstagramPublisher;
use crate::platforms::Publisher;
use crate::repository::QueueRepository;
use crate::retry::RetryPolicy;
use crate::types::{
    FailureKind, Platform, Post, PostStatus, PublishFailure, PublishResult, QueueItem, QueueStatus,
    MAX_BATCH_SIZE,
};

/// Per-item result of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Completed,
    Retrying,
    Failed,
    /// Outcome for this claim was already recorded elsewhere
    Skipped,
    /// Store error; the item stays claimed until reclaimed
    Error,
    /// Cycle deadline hit before the item finished
    TimedOut,
}

impl ItemStatus {
    /// Report status for a recorded outcome.
    ///
    /// Outcomes only end in `completed`, `retrying` or `failed`; anything else
    /// was never a recordable outcome and is reported as an error.
    fn for_outcome(status: QueueStatus) -> Self {
        match status {
            QueueStatus::Completed => ItemStatus::Completed,
            QueueStatus::Retrying => ItemStatus::Retrying,
            QueueStatus::Failed => ItemStatus::Failed,
            QueueStatus::Pending | QueueStatus::Processing => ItemStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub queue_id: String,
    pub post_id: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub processed: usize,
    pub results: Vec<ItemReport>,
    pub processing_time_ms: u64,
    pub enqueued: u64,
    pub rearmed: u64,
    pub reclaimed: u64,
}

impl CycleReport {
    pub fn count(&self, status: ItemStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

pub struct QueueProcessor {
    repo: Arc<dyn QueueRepository>,
    credentials: Arc<dyn CredentialProvider>,
    publishers: BTreeMap<Platform, Arc<dyn Publisher>>,
    policy: RetryPolicy,
    config: QueueConfig,
}

impl QueueProcessor {
    pub fn new(
        repo: Arc<dyn QueueRepository>,
        credentials: Arc<dyn CredentialProvider>,
        policy: RetryPolicy,
        config: QueueConfig,
    ) -> Self {
        Self {
            repo,
            credentials,
            publishers: BTreeMap::new(),
            policy,
            config,
        }
    }

    /// Register a publisher, replacing any previous one for the same platform
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publishers.insert(publisher.platform(), publisher);
        self
    }

    /// Production wiring: Graph API publishers and database-backed credentials
    pub fn from_config(config: &Config, db: Database) -> Result<Self> {
        let client = GraphClient::new(&config.graph)?;
        let credentials = Arc::new(DbCredentialProvider::new(db.clone()));

        Ok(Self::new(
            Arc::new(db),
            credentials,
            RetryPolicy::from_config(&config.retry),
            config.queue.clone(),
        )
        .with_publisher(Arc::new(FacebookPublisher::new(client.clone())))
        .with_publisher(Arc::new(InstagramPublisher::new(client, &config.graph))))
    }

    /// Run one processing cycle claiming at most `batch_size` items.
    ///
    /// `batch_size` is clamped to `1..=MAX_BATCH_SIZE`. Failures of single
    /// items are reported in the result list; only errors in the maintenance
    /// steps or the claim itself abort the cycle.
    pub async fn run_cycle(&self, batch_size: usize) -> Result<CycleReport> {
        let started = Instant::now();
        let now = chrono::Utc::now().timestamp();
        let batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);

        let enqueued = self
            .repo
            .enqueue_due_posts(now, self.config.max_attempts)
            .await?;
        let rearmed = self.repo.rearm_due_retries(now).await?;
        let stuck_cutoff = now.saturating_sub(self.config.stuck_timeout_secs as i64);
        let reclaimed = self.repo.reclaim_stuck(stuck_cutoff, now).await?;

        let items = self.repo.claim_batch(batch_size, now).await?;
        info!(
            claimed = items.len(),
            enqueued, rearmed, reclaimed, batch_size, "Processing cycle started"
        );

        let claimed: Vec<(String, String)> = items
            .iter()
            .map(|i| (i.queue_id.clone(), i.post_id.clone()))
            .collect();

        let mut results: Vec<ItemReport> = Vec::with_capacity(items.len());
        let work = async {
            let mut reports = stream::iter(items)
                .map(|item| self.process_item(item))
                .buffer_unordered(self.config.concurrency.max(1));
            while let Some(report) = reports.next().await {
                results.push(report);
            }
        };

        if tokio::time::timeout(self.config.cycle_timeout(), work).await.is_err() {
            warn!(
                timeout_secs = self.config.cycle_timeout_secs,
                "Cycle deadline reached, unfinished items stay claimed"
            );
            for (queue_id, post_id) in claimed {
                if !results.iter().any(|r| r.queue_id == queue_id) {
                    results.push(ItemReport {
                        queue_id,
                        post_id,
                        status: ItemStatus::TimedOut,
                        error: Some("cycle deadline reached".to_string()),
                    });
                }
            }
        }

        let report = CycleReport {
            processed: results.len(),
            results,
            processing_time_ms: started.elapsed().as_millis() as u64,
            enqueued,
            rearmed,
            reclaimed,
        };

        info!(
            processed = report.processed,
            completed = report.count(ItemStatus::Completed),
            retrying = report.count(ItemStatus::Retrying),
            failed = report.count(ItemStatus::Failed),
            duration_ms = report.processing_time_ms,
            "Processing cycle finished"
        );

        Ok(report)
    }

    #[instrument(skip_all, fields(queue_id = %item.queue_id, post_id = %item.post_id, attempts = item.attempts))]
    async fn process_item(&self, item: QueueItem) -> ItemReport {
        match self.try_process(&item).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Queue item aborted, left for reclaim");
                ItemReport {
                    queue_id: item.queue_id,
                    post_id: item.post_id,
                    status: ItemStatus::Error,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn try_process(&self, item: &QueueItem) -> Result<ItemReport> {
        let started = Instant::now();

        let post = match self.repo.load_post(&item.post_id).await? {
            Some(post) if post.status == PostStatus::Processing => post,
            Some(post) => {
                let reason = format!("post is {} instead of processing", post.status);
                return self.fail(item, &reason).await;
            }
            None => return self.fail(item, "post not found").await,
        };

        let attempt = self.dispatch(&post).await?;
        let resolution = outcome::resolve(
            item,
            &post,
            &attempt,
            &self.policy,
            chrono::Utc::now().timestamp(),
        );

        let elapsed_ms = started.elapsed().as_millis() as i64;
        if !self.repo.record_outcome(item, &resolution, elapsed_ms).await? {
            return Ok(self.report(item, ItemStatus::Skipped, None));
        }

        let status = ItemStatus::for_outcome(resolution.queue_status);
        match status {
            ItemStatus::Completed => info!(elapsed_ms, "Post published"),
            ItemStatus::Retrying => warn!(
                attempts = resolution.attempts,
                next_run_at = resolution.next_run_at,
                error = resolution.last_error.as_deref().unwrap_or_default(),
                "Publish failed, retry scheduled"
            ),
            ItemStatus::Failed => warn!(
                attempts = resolution.attempts,
                error = resolution.last_error.as_deref().unwrap_or_default(),
                "Publish failed permanently"
            ),
            _ => error!(status = %resolution.queue_status, "Outcome recorded with a non-final status"),
        }

        Ok(self.report(item, status, resolution.last_error))
    }

    async fn fail(&self, item: &QueueItem, reason: &str) -> Result<ItemReport> {
        warn!(reason = %reason, "Failing queue item without publishing");
        let status = if self.repo.fail_item(item, reason).await? {
            ItemStatus::Failed
        } else {
            ItemStatus::Skipped
        };
        Ok(self.report(item, status, Some(reason.to_string())))
    }

    fn report(&self, item: &QueueItem, status: ItemStatus, error: Option<String>) -> ItemReport {
        ItemReport {
            queue_id: item.queue_id.clone(),
            post_id: item.post_id.clone(),
            status,
            error,
        }
    }

    /// Publish to every targeted platform that has not succeeded yet
    async fn dispatch(&self, post: &Post) -> Result<AttemptResults> {
        let pending = post.pending_platforms();
        if pending.is_empty() {
            return Ok(AttemptResults::new());
        }

        let Some(credentials) = self.credentials.credentials(&post.owner_id).await? else {
            return Ok(pending
                .into_iter()
                .map(|platform| {
                    let failure = PublishFailure::terminal(
                        FailureKind::AccountNotConnected,
                        format!("no linked {} account for owner", platform),
                    );
                    (platform, PublishResult::Failure(failure))
                })
                .collect());
        };

        let credentials = &credentials;
        let publishers = &self.publishers;
        let calls = pending.into_iter().map(|platform| async move {
            let result = match publishers.get(&platform) {
                Some(publisher) => publisher.publish(post, credentials).await,
                None => PublishResult::Failure(PublishFailure::terminal(
                    FailureKind::InvalidRequest,
                    format!("no publisher configured for {}", platform),
                )),
            };
            (platform, result)
        });

        Ok(join_all(calls).await.into_iter().collect())
    }
}
