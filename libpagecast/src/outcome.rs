//! Resolution of one processing attempt into new post and queue state.
//!
//! This is the pure half of the outcome recorder: it merges the attempt's
//! per-platform results into the post's existing ones and decides the next
//! statuses. [`crate::db::Database::record_outcome`] persists the result.

use std::collections::BTreeMap;

use crate::retry::{NextAction, RetryPolicy};
use crate::types::{
    FailureKind, Platform, PlatformOutcome, PlatformResults, Post, PostStatus, PublishFailure,
    PublishResult, QueueItem, QueueStatus,
};

/// Per-platform results of a single attempt.
pub type AttemptResults = BTreeMap<Platform, PublishResult>;

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Outcomes produced by this attempt, to be merged into the stored map
    pub outcomes: PlatformResults,
    pub post_status: PostStatus,
    pub queue_status: QueueStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// New `scheduled_for` when the item is re-armed
    pub next_run_at: Option<i64>,
    pub published_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Resolution {
    pub fn is_retry(&self) -> bool {
        self.queue_status == QueueStatus::Retrying
    }
}

/// Merge an attempt into the post's results and decide what happens next.
///
/// Platforms that had already published keep their outcome even if a result
/// for them shows up again. A targeted platform that is neither published nor
/// reported by this attempt counts as an unknown failure.
pub fn resolve(
    item: &QueueItem,
    post: &Post,
    attempt: &AttemptResults,
    policy: &RetryPolicy,
    now: i64,
) -> Resolution {
    let attempts = item.attempts.saturating_add(1).min(item.max_attempts.max(1));

    let mut outcomes = PlatformResults::new();
    for (platform, result) in attempt {
        if post.results.get(platform).is_some_and(PlatformOutcome::is_published) {
            continue;
        }
        outcomes.insert(*platform, PlatformOutcome::from_result(result.clone(), now));
    }

    let mut merged = post.results.clone();
    merged.extend(outcomes.clone());

    let mut failures: Vec<(Platform, PublishFailure)> = Vec::new();
    for platform in post.platform_target.platforms() {
        match merged.get(platform) {
            Some(PlatformOutcome::Published { .. }) => {}
            Some(PlatformOutcome::Failed { failure, .. }) => {
                failures.push((*platform, failure.clone()));
            }
            None => {
                let failure = PublishFailure::new(FailureKind::Unknown, "no result reported");
                outcomes.insert(
                    *platform,
                    PlatformOutcome::Failed {
                        failure: failure.clone(),
                        failed_at: now,
                    },
                );
                failures.push((*platform, failure));
            }
        }
    }

    if failures.is_empty() {
        return Resolution {
            outcomes,
            post_status: PostStatus::Published,
            queue_status: QueueStatus::Completed,
            attempts,
            last_error: None,
            next_run_at: None,
            published_at: Some(now),
            completed_at: Some(now),
        };
    }

    let last_error = Some(summarize(&failures));

    // One terminal platform decides for the whole post
    let deciding = failures
        .iter()
        .find(|(_, f)| !f.retryable)
        .unwrap_or(&failures[0]);

    match policy.next_action(attempts, item.max_attempts, &deciding.1) {
        NextAction::RetryAfter(delay) => {
            let delay_secs = i64::try_from(delay.as_secs()).unwrap_or(i64::MAX);
            Resolution {
                outcomes,
                post_status: PostStatus::Scheduled,
                queue_status: QueueStatus::Retrying,
                attempts,
                last_error,
                next_run_at: Some(now.saturating_add(delay_secs)),
                published_at: None,
                completed_at: None,
            }
        }
        NextAction::GiveUp => Resolution {
            outcomes,
            post_status: PostStatus::Failed,
            queue_status: QueueStatus::Failed,
            attempts,
            last_error,
            next_run_at: None,
            published_at: None,
            completed_at: Some(now),
        },
    }
}

/// Terminal failure that does not consume a publish attempt on any platform,
/// such as a missing post.
pub fn terminal(item: &QueueItem, reason: &str, now: i64) -> Resolution {
    Resolution {
        outcomes: PlatformResults::new(),
        post_status: PostStatus::Failed,
        queue_status: QueueStatus::Failed,
        attempts: item.attempts.saturating_add(1).min(item.max_attempts.max(1)),
        last_error: Some(reason.to_string()),
        next_run_at: None,
        published_at: None,
        completed_at: Some(now),
    }
}

fn summarize(failures: &[(Platform, PublishFailure)]) -> String {
    failures
        .iter()
        .map(|(platform, failure)| format!("{}: {}", platform, failure))
        .collect::<Vec<_>>()
        .join("; ")
}
