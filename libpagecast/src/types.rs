//! Core types for Pagecast

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PagecastError, Result};

/// Hard ceiling on the number of items one cycle may claim.
pub const MAX_BATCH_SIZE: usize = 20;

/// Default ceiling on publish attempts per queue item.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// ============================================================================
// Platforms
// ============================================================================

/// A publishing destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Facebook,
    Instagram,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Facebook => "facebook",
            Platform::Instagram => "instagram",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "facebook" => Ok(Platform::Facebook),
            "instagram" => Ok(Platform::Instagram),
            _ => Err(format!("Unknown platform: '{}'", s)),
        }
    }
}

/// Which platforms a post should be published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformTarget {
    Facebook,
    Instagram,
    Both,
}

impl PlatformTarget {
    pub fn platforms(&self) -> &'static [Platform] {
        match self {
            PlatformTarget::Facebook => &[Platform::Facebook],
            PlatformTarget::Instagram => &[Platform::Instagram],
            PlatformTarget::Both => &[Platform::Facebook, Platform::Instagram],
        }
    }

    pub fn includes(&self, platform: Platform) -> bool {
        self.platforms().contains(&platform)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformTarget::Facebook => "facebook",
            PlatformTarget::Instagram => "instagram",
            PlatformTarget::Both => "both",
        }
    }
}

impl fmt::Display for PlatformTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformTarget {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "facebook" => Ok(PlatformTarget::Facebook),
            "instagram" => Ok(PlatformTarget::Instagram),
            "both" => Ok(PlatformTarget::Both),
            _ => Err(format!("Unknown platform target: '{}'", s)),
        }
    }
}

// ============================================================================
// Status state machines
// ============================================================================

/// Lifecycle of a post as seen by users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Processing,
    Published,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Processing => "processing",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PostStatus::Published | PostStatus::Failed)
    }

    /// Transitions the queue may perform on its own.
    ///
    /// `Draft -> Scheduled` belongs to the authoring flow and `Failed -> Scheduled`
    /// to the explicit admin re-queue, so neither is listed here.
    pub fn can_transition_to(&self, next: PostStatus) -> bool {
        use PostStatus::*;
        matches!(
            (self, next),
            (Scheduled, Processing)
                | (Processing, Published)
                | (Processing, Failed)
                | (Processing, Scheduled)
        )
    }

    pub fn transition(self, next: PostStatus) -> Result<PostStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(PagecastError::InvalidTransition {
                entity: "post",
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Admin re-queue of a failed post.
    pub fn requeue(self) -> Result<PostStatus> {
        match self {
            PostStatus::Failed => Ok(PostStatus::Scheduled),
            other => Err(PagecastError::InvalidTransition {
                entity: "post",
                from: other.to_string(),
                to: PostStatus::Scheduled.to_string(),
            }),
        }
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "draft" => Ok(PostStatus::Draft),
            "scheduled" => Ok(PostStatus::Scheduled),
            "processing" => Ok(PostStatus::Processing),
            "published" => Ok(PostStatus::Published),
            "failed" => Ok(PostStatus::Failed),
            _ => Err(format!("Unknown post status: '{}'", s)),
        }
    }
}

/// Process-control state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 5] = [
        QueueStatus::Pending,
        QueueStatus::Processing,
        QueueStatus::Completed,
        QueueStatus::Failed,
        QueueStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Retrying => "retrying",
        }
    }

    /// Active items hold the post's single queue slot.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            QueueStatus::Pending | QueueStatus::Processing | QueueStatus::Retrying
        )
    }

    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Retrying)
                | (Processing, Pending)
                | (Retrying, Pending)
        )
    }

    pub fn transition(self, next: QueueStatus) -> Result<QueueStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(PagecastError::InvalidTransition {
                entity: "queue item",
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Admin re-queue of a failed item.
    pub fn requeue(self) -> Result<QueueStatus> {
        match self {
            QueueStatus::Failed => Ok(QueueStatus::Pending),
            other => Err(PagecastError::InvalidTransition {
                entity: "queue item",
                from: other.to_string(),
                to: QueueStatus::Pending.to_string(),
            }),
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            "retrying" => Ok(QueueStatus::Retrying),
            _ => Err(format!("Unknown queue status: '{}'", s)),
        }
    }
}

// ============================================================================
// Publish results
// ============================================================================

/// Classification of a failed publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimited,
    Network,
    PlatformUnavailable,
    MediaProcessing,
    InvalidMedia,
    PermissionDenied,
    AccountNotConnected,
    PolicyViolation,
    InvalidRequest,
    Unknown,
}

impl FailureKind {
    /// Whether a failure of this kind is worth another attempt.
    ///
    /// Unknown failures are retried; the attempt ceiling bounds them.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::RateLimited
                | FailureKind::Network
                | FailureKind::PlatformUnavailable
                | FailureKind::MediaProcessing
                | FailureKind::Unknown
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Network => "network",
            FailureKind::PlatformUnavailable => "platform_unavailable",
            FailureKind::MediaProcessing => "media_processing",
            FailureKind::InvalidMedia => "invalid_media",
            FailureKind::PermissionDenied => "permission_denied",
            FailureKind::AccountNotConnected => "account_not_connected",
            FailureKind::PolicyViolation => "policy_violation",
            FailureKind::InvalidRequest => "invalid_request",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "rate_limited" => Ok(FailureKind::RateLimited),
            "network" => Ok(FailureKind::Network),
            "platform_unavailable" => Ok(FailureKind::PlatformUnavailable),
            "media_processing" => Ok(FailureKind::MediaProcessing),
            "invalid_media" => Ok(FailureKind::InvalidMedia),
            "permission_denied" => Ok(FailureKind::PermissionDenied),
            "account_not_connected" => Ok(FailureKind::AccountNotConnected),
            "policy_violation" => Ok(FailureKind::PolicyViolation),
            "invalid_request" => Ok(FailureKind::InvalidRequest),
            "unknown" => Ok(FailureKind::Unknown),
            _ => Err(format!("Unknown failure kind: '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishFailure {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
}

impl PublishFailure {
    /// Failure whose retryability follows its kind.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
        }
    }

    pub fn terminal(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for PublishFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// What a publisher reports for one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PublishResult {
    Success { external_id: String },
    Failure(PublishFailure),
}

impl PublishResult {
    pub fn success(external_id: impl Into<String>) -> Self {
        PublishResult::Success {
            external_id: external_id.into(),
        }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        PublishResult::Failure(PublishFailure::new(kind, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PublishResult::Success { .. })
    }
}

/// Latest recorded outcome for one platform of a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PlatformOutcome {
    Published {
        external_id: String,
        published_at: i64,
    },
    Failed {
        #[serde(flatten)]
        failure: PublishFailure,
        failed_at: i64,
    },
}

impl PlatformOutcome {
    pub fn from_result(result: PublishResult, at: i64) -> Self {
        match result {
            PublishResult::Success { external_id } => PlatformOutcome::Published {
                external_id,
                published_at: at,
            },
            PublishResult::Failure(failure) => PlatformOutcome::Failed {
                failure,
                failed_at: at,
            },
        }
    }

    pub fn is_published(&self) -> bool {
        matches!(self, PlatformOutcome::Published { .. })
    }
}

pub type PlatformResults = BTreeMap<Platform, PlatformOutcome>;

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub owner_id: String,
    pub caption: String,
    pub hashtags: Vec<String>,
    pub media_url: Option<String>,
    /// Carousel items in display order; empty for single-media posts
    pub media_urls: Vec<String>,
    pub platform_target: PlatformTarget,
    pub page_id: String,
    pub status: PostStatus,
    pub scheduled_for: Option<i64>,
    pub published_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub results: PlatformResults,
}

impl Post {
    /// A new draft post.
    pub fn new(
        owner_id: impl Into<String>,
        caption: impl Into<String>,
        platform_target: PlatformTarget,
        page_id: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            caption: caption.into(),
            hashtags: Vec::new(),
            media_url: None,
            media_urls: Vec::new(),
            platform_target,
            page_id: page_id.into(),
            status: PostStatus::Draft,
            scheduled_for: None,
            published_at: None,
            created_at: now,
            updated_at: now,
            results: PlatformResults::new(),
        }
    }

    /// Mark the post as scheduled for the given Unix timestamp.
    pub fn scheduled_at(mut self, timestamp: i64) -> Self {
        self.status = PostStatus::Scheduled;
        self.scheduled_for = Some(timestamp);
        self
    }

    pub fn with_hashtags<I, S>(mut self, hashtags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hashtags = hashtags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_media(mut self, media_url: impl Into<String>) -> Self {
        self.media_url = Some(media_url.into());
        self
    }

    /// Attach several media items. The first also becomes `media_url`.
    pub fn with_media_items<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.media_urls = urls.into_iter().map(Into::into).collect();
        self.media_url = self.media_urls.first().cloned();
        self
    }

    /// Every media URL of the post: the carousel items when present,
    /// otherwise the single `media_url`.
    pub fn media_items(&self) -> Vec<&str> {
        if self.media_urls.is_empty() {
            self.media_url.as_deref().into_iter().collect()
        } else {
            self.media_urls.iter().map(String::as_str).collect()
        }
    }

    /// Ids of the platforms that accepted the post.
    pub fn external_post_ids(&self) -> BTreeMap<Platform, String> {
        self.results
            .iter()
            .filter_map(|(platform, outcome)| match outcome {
                PlatformOutcome::Published { external_id, .. } => {
                    Some((*platform, external_id.clone()))
                }
                PlatformOutcome::Failed { .. } => None,
            })
            .collect()
    }

    /// Latest failure description for each platform that has not succeeded.
    pub fn platform_errors(&self) -> BTreeMap<Platform, String> {
        self.results
            .iter()
            .filter_map(|(platform, outcome)| match outcome {
                PlatformOutcome::Failed { failure, .. } => Some((*platform, failure.to_string())),
                PlatformOutcome::Published { .. } => None,
            })
            .collect()
    }

    /// Targeted platforms without a successful outcome yet.
    pub fn pending_platforms(&self) -> Vec<Platform> {
        self.platform_target
            .platforms()
            .iter()
            .copied()
            .filter(|p| !self.results.get(p).is_some_and(PlatformOutcome::is_published))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub queue_id: String,
    pub post_id: String,
    pub owner_id: String,
    pub scheduled_for: i64,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    /// Identifies the claim that moved the item to `processing`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_token: Option<String>,
}

impl QueueItem {
    /// A pending item for a due post.
    pub fn for_post(post: &Post, scheduled_for: i64, max_attempts: u32) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            queue_id: Uuid::new_v4().to_string(),
            post_id: post.id.clone(),
            owner_id: post.owner_id.clone(),
            scheduled_for,
            status: QueueStatus::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
            processing_time_ms: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            claim_token: None,
        }
    }
}
