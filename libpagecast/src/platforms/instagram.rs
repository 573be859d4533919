//! Instagram Business publisher
//!
//! Publishing is two-phase: create a media container, then publish it. Video
//! containers are transcoded asynchronously, so their `status_code` is polled
//! a bounded number of times before publishing. A container still in progress
//! after the last poll becomes a retryable media-processing failure.
//!
//! Posts with several media items become a carousel: one item container per
//! child (`is_carousel_item`), then a `CAROUSEL` parent listing the children.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::instrument;

use crate::config::GraphConfig;
use crate::credentials::MetaCredentials;
use crate::platforms::graph::{id_field, GraphClient};
use crate::platforms::{format_message, instagram_media_kind, is_inline_data, MediaKind, Publisher};
use crate::types::{FailureKind, Platform, Post, PublishFailure, PublishResult};

/// Graph API limit on carousel children
pub const MAX_CAROUSEL_ITEMS: usize = 10;

pub struct InstagramPublisher {
    client: GraphClient,
    status_checks: u32,
    status_interval: Duration,
}

impl InstagramPublisher {
    pub fn new(client: GraphClient, config: &GraphConfig) -> Self {
        Self {
            client,
            status_checks: config.media_status_checks,
            status_interval: Duration::from_millis(config.media_status_interval_ms),
        }
    }

    async fn create_container(
        &self,
        account_id: &str,
        params: &[(&str, &str)],
    ) -> Result<String, PublishFailure> {
        let response = self
            .client
            .post(&format!("{}/media", account_id), params)
            .await?;

        id_field(&response, "id").ok_or_else(|| {
            PublishFailure::new(FailureKind::Unknown, "media container response did not include an id")
        })
    }

    async fn wait_until_finished(&self, container_id: &str, token: &str) -> Result<(), PublishFailure> {
        for check in 1..=self.status_checks {
            let response = self
                .client
                .get(container_id, &[("fields", "status_code"), ("access_token", token)])
                .await?;
            let status = response
                .get("status_code")
                .and_then(|s| s.as_str())
                .unwrap_or("IN_PROGRESS");

            tracing::debug!(container_id = %container_id, check, status = %status, "Media container status");

            match status {
                "FINISHED" | "PUBLISHED" => return Ok(()),
                "ERROR" | "EXPIRED" => {
                    return Err(PublishFailure::new(
                        FailureKind::InvalidMedia,
                        format!("media container {} ended with status {}", container_id, status),
                    ))
                }
                _ => {
                    if check < self.status_checks {
                        tokio::time::sleep(self.status_interval).await;
                    }
                }
            }
        }

        Err(PublishFailure::new(
            FailureKind::MediaProcessing,
            format!(
                "media container {} still processing after {} checks",
                container_id, self.status_checks
            ),
        ))
    }

    /// Container for a post with exactly one media item
    async fn single_container(
        &self,
        account_id: &str,
        media_url: &str,
        caption: &str,
        token: &str,
    ) -> Result<String, PublishFailure> {
        let kind = instagram_media_kind(media_url);
        let mut params = match kind {
            MediaKind::Image => vec![("image_url", media_url)],
            MediaKind::Video => vec![("media_type", "REELS"), ("video_url", media_url)],
        };
        params.push(("caption", caption));
        params.push(("access_token", token));

        let container_id = self.create_container(account_id, &params).await?;
        if kind == MediaKind::Video {
            self.wait_until_finished(&container_id, token).await?;
        }
        Ok(container_id)
    }

    /// Child containers first, each video finished, then the parent
    async fn carousel_container(
        &self,
        account_id: &str,
        media_urls: &[&str],
        caption: &str,
        token: &str,
    ) -> Result<String, PublishFailure> {
        let mut children = Vec::with_capacity(media_urls.len());
        for media_url in media_urls {
            let kind = instagram_media_kind(media_url);
            let mut params = match kind {
                MediaKind::Image => vec![("image_url", *media_url)],
                MediaKind::Video => vec![("media_type", "VIDEO"), ("video_url", *media_url)],
            };
            params.push(("is_carousel_item", "true"));
            params.push(("access_token", token));

            let child_id = self.create_container(account_id, &params).await?;
            if kind == MediaKind::Video {
                self.wait_until_finished(&child_id, token).await?;
            }
            children.push(child_id);
        }

        tracing::debug!(children = children.len(), "Creating carousel container");

        let children = children.join(",");
        let parent_id = self
            .create_container(
                account_id,
                &[
                    ("media_type", "CAROUSEL"),
                    ("children", children.as_str()),
                    ("caption", caption),
                    ("access_token", token),
                ],
            )
            .await?;
        self.wait_until_finished(&parent_id, token).await?;
        Ok(parent_id)
    }

    async fn publish_inner(
        &self,
        post: &Post,
        credentials: &MetaCredentials,
    ) -> Result<String, PublishFailure> {
        let account_id = credentials
            .instagram_business_account_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                PublishFailure::new(
                    FailureKind::AccountNotConnected,
                    "no Instagram business account linked",
                )
            })?;

        let media = post.media_items();
        if media.is_empty() {
            return Err(PublishFailure::new(
                FailureKind::InvalidMedia,
                "Instagram posts require an image or video",
            ));
        }
        if media.len() > MAX_CAROUSEL_ITEMS {
            return Err(PublishFailure::new(
                FailureKind::InvalidRequest,
                format!(
                    "carousel posts are limited to {} items, got {}",
                    MAX_CAROUSEL_ITEMS,
                    media.len()
                ),
            ));
        }
        if media.iter().any(|url| is_inline_data(url)) {
            return Err(PublishFailure::new(
                FailureKind::InvalidMedia,
                "inline data URLs cannot be published, upload the media first",
            ));
        }

        let token = credentials.access_token.expose_secret();
        let caption = format_message(&post.caption, &post.hashtags);

        let container_id = match media.as_slice() {
            [single] => self.single_container(account_id, single, &caption, token).await?,
            items => self.carousel_container(account_id, items, &caption, token).await?,
        };

        let response = self
            .client
            .post(
                &format!("{}/media_publish", account_id),
                &[("creation_id", container_id.as_str()), ("access_token", token)],
            )
            .await?;

        id_field(&response, "id").ok_or_else(|| {
            PublishFailure::new(FailureKind::Unknown, "media_publish response did not include an id")
        })
    }
}

#[async_trait]
impl Publisher for InstagramPublisher {
    fn platform(&self) -> Platform {
        Platform::Instagram
    }

    #[instrument(skip_all, fields(post_id = %post.id, platform = "instagram"))]
    async fn publish(&self, post: &Post, credentials: &MetaCredentials) -> PublishResult {
        match self.publish_inner(post, credentials).await {
            Ok(external_id) => {
                tracing::info!(external_id = %external_id, "Published to Instagram");
                PublishResult::Success { external_id }
            }
            Err(failure) => {
                tracing::warn!(kind = %failure.kind, error = %failure.message, "Instagram publish failed");
                PublishResult::Failure(failure)
            }
        }
    }
}
