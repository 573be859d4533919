//! Platform publishers
//!
//! A publisher performs the remote publish call for one platform and reports a
//! typed [`PublishResult`]. Remote failures are values, never `Err`: the
//! processor records them and lets the retry controller decide what follows.
//!
//! ```no_run
//! use std::sync::Arc;
//! use libpagecast::config::GraphConfig;
//! use libpagecast::platforms::{facebook::FacebookPublisher, graph::GraphClient, Publisher};
//!
//! # fn example() -> libpagecast::error::Result<()> {
//! let client = GraphClient::new(&GraphConfig::default())?;
//! let facebook: Arc<dyn Publisher> = Arc::new(FacebookPublisher::new(client));
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;

use crate::credentials::MetaCredentials;
use crate::types::{Platform, Post, PublishResult};

pub mod facebook;
pub mod graph;
pub mod instagram;

// Public so integration tests can drive the processor without a network
pub mod mock;

#[cfg(test)]
pub(crate) mod stub;

#[async_trait]
pub trait Publisher: Send + Sync {
    fn platform(&self) -> Platform;

    /// Publish `post` with the owner's credentials.
    ///
    /// Must not touch local state; the outcome recorder owns all writes.
    async fn publish(&self, post: &Post, credentials: &MetaCredentials) -> PublishResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

/// Video extensions Facebook's `/videos` endpoint accepts
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "wmv", "flv", "webm", "mkv"];

/// Instagram only ingests these as video; anything else goes up as an image
const INSTAGRAM_VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "webm"];

/// Classify a media URL for Facebook by file extension
pub fn media_kind(url: &str) -> MediaKind {
    kind_by_extension(url, VIDEO_EXTENSIONS)
}

/// Classify a media URL for Instagram by file extension
pub fn instagram_media_kind(url: &str) -> MediaKind {
    kind_by_extension(url, INSTAGRAM_VIDEO_EXTENSIONS)
}

/// Extension lookup ignoring query and fragment
fn kind_by_extension(url: &str, video_extensions: &[&str]) -> MediaKind {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let extension = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());

    match extension {
        Some(ext) if video_extensions.contains(&ext.as_str()) => MediaKind::Video,
        _ => MediaKind::Image,
    }
}

/// Inline `data:` URLs cannot be fetched by the Graph API
pub fn is_inline_data(url: &str) -> bool {
    url.trim_start().to_ascii_lowercase().starts_with("data:")
}

/// Caption followed by a blank line and the hashtags.
///
/// Each hashtag gets exactly one leading `#`. Blank hashtags are dropped and
/// the hashtag line is omitted when none remain.
pub fn format_message(caption: &str, hashtags: &[String]) -> String {
    let tags: Vec<String> = hashtags
        .iter()
        .map(|tag| tag.trim().trim_start_matches('#'))
        .filter(|tag| !tag.is_empty())
        .map(|tag| format!("#{}", tag))
        .collect();

    if tags.is_empty() {
        caption.to_string()
    } else {
        format!("{}\n\n{}", caption, tags.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_format_message_with_hashtags() {
        assert_eq!(
            format_message("Grand opening", &tags(&["bakery", "#fresh"])),
            "Grand opening\n\n#bakery #fresh"
        );
    }

    #[test]
    fn test_format_message_without_hashtags() {
        assert_eq!(format_message("Just text", &[]), "Just text");
        assert_eq!(format_message("Just text", &tags(&["", "  #"])), "Just text");
    }

    #[test]
    fn test_format_message_does_not_double_hash() {
        let message = format_message("x", &tags(&["##sale"]));
        assert_eq!(message, "x\n\n#sale");
    }

    #[test]
    fn test_media_kind_by_extension() {
        assert_eq!(media_kind("https://cdn.example.com/a/clip.MP4"), MediaKind::Video);
        assert_eq!(media_kind("https://cdn.example.com/reel.webm?sig=abc"), MediaKind::Video);
        assert_eq!(media_kind("https://cdn.example.com/photo.jpg"), MediaKind::Image);
        assert_eq!(media_kind("https://cdn.example.com/no-extension"), MediaKind::Image);
        assert_eq!(media_kind("https://cdn.example.com/movies.mp4/cover.png"), MediaKind::Image);
    }

    #[test]
    fn test_instagram_video_extensions_are_narrower() {
        assert_eq!(media_kind("https://cdn.example.com/clip.avi"), MediaKind::Video);
        assert_eq!(instagram_media_kind("https://cdn.example.com/clip.avi"), MediaKind::Image);
        assert_eq!(instagram_media_kind("https://cdn.example.com/clip.MOV"), MediaKind::Video);
        assert_eq!(instagram_media_kind("https://cdn.example.com/clip.webm?x=1"), MediaKind::Video);
    }

    #[test]
    fn test_inline_data_detection() {
        assert!(is_inline_data("data:image/png;base64,iVBOR"));
        assert!(is_inline_data("DATA:image/jpeg;base64,/9j"));
        assert!(!is_inline_data("https://cdn.example.com/photo.jpg"));
    }
}
