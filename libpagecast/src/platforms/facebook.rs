//! Facebook Page publisher

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::instrument;

use crate::credentials::MetaCredentials;
use crate::platforms::graph::{id_field, GraphClient};
use crate::platforms::{format_message, is_inline_data, media_kind, MediaKind, Publisher};
use crate::types::{FailureKind, Platform, Post, PublishFailure, PublishResult};

pub struct FacebookPublisher {
    client: GraphClient,
}

impl FacebookPublisher {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    /// Exchange the user token for the page's own token via `me/accounts`
    async fn page_access_token(
        &self,
        user_token: &str,
        page_id: &str,
    ) -> Result<String, PublishFailure> {
        let response = self
            .client
            .get(
                "me/accounts",
                &[
                    ("fields", "id,access_token"),
                    ("limit", "100"),
                    ("access_token", user_token),
                ],
            )
            .await?;

        response
            .get("data")
            .and_then(|d| d.as_array())
            .into_iter()
            .flatten()
            .find(|page| id_field(page, "id").as_deref() == Some(page_id))
            .and_then(|page| id_field(page, "access_token"))
            .ok_or_else(|| {
                PublishFailure::new(
                    FailureKind::AccountNotConnected,
                    format!("page {} is not managed by the linked account", page_id),
                )
            })
    }

    async fn publish_inner(
        &self,
        post: &Post,
        credentials: &MetaCredentials,
    ) -> Result<String, PublishFailure> {
        let page_id = Some(post.page_id.as_str())
            .filter(|p| !p.is_empty())
            .or(credentials.page_id.as_deref())
            .ok_or_else(|| {
                PublishFailure::new(FailureKind::AccountNotConnected, "no Facebook page linked")
            })?;

        if let Some(url) = post.media_url.as_deref() {
            if is_inline_data(url) {
                return Err(PublishFailure::new(
                    FailureKind::InvalidMedia,
                    "inline data URLs cannot be published, upload the media first",
                ));
            }
        }

        let page_token = self
            .page_access_token(credentials.access_token.expose_secret(), page_id)
            .await?;
        let message = format_message(&post.caption, &post.hashtags);

        let (endpoint, id_key, response) = match post.media_url.as_deref() {
            None => {
                let endpoint = format!("{}/feed", page_id);
                let response = self
                    .client
                    .post(
                        &endpoint,
                        &[
                            ("message", message.as_str()),
                            ("access_token", page_token.as_str()),
                        ],
                    )
                    .await?;
                (endpoint, "id", response)
            }
            Some(url) if media_kind(url) == MediaKind::Video => {
                let endpoint = format!("{}/videos", page_id);
                let response = self
                    .client
                    .post(
                        &endpoint,
                        &[
                            ("file_url", url),
                            ("description", message.as_str()),
                            ("access_token", page_token.as_str()),
                        ],
                    )
                    .await?;
                (endpoint, "id", response)
            }
            Some(url) => {
                let endpoint = format!("{}/photos", page_id);
                let response = self
                    .client
                    .post(
                        &endpoint,
                        &[
                            ("url", url),
                            ("message", message.as_str()),
                            ("access_token", page_token.as_str()),
                        ],
                    )
                    .await?;
                (endpoint, "post_id", response)
            }
        };

        id_field(&response, id_key)
            .or_else(|| id_field(&response, "id"))
            .ok_or_else(|| {
                PublishFailure::new(
                    FailureKind::Unknown,
                    format!("{} response did not include an id", endpoint),
                )
            })
    }
}

#[async_trait]
impl Publisher for FacebookPublisher {
    fn platform(&self) -> Platform {
        Platform::Facebook
    }

    #[instrument(skip_all, fields(post_id = %post.id, platform = "facebook"))]
    async fn publish(&self, post: &Post, credentials: &MetaCredentials) -> PublishResult {
        match self.publish_inner(post, credentials).await {
            Ok(external_id) => {
                tracing::info!(external_id = %external_id, "Published to Facebook");
                PublishResult::Success { external_id }
            }
            Err(failure) => {
                tracing::warn!(kind = %failure.kind, error = %failure.message, "Facebook publish failed");
                PublishResult::Failure(failure)
            }
        }
    }
}
