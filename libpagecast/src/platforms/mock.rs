//! Scripted publisher for tests
//!
//! Results are taken from a script in order; once it runs out every call
//! returns the fallback result. Clones share the script and the call log, so a
//! test can keep a handle after handing the publisher to the processor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::credentials::MetaCredentials;
use crate::platforms::Publisher;
use crate::types::{FailureKind, Platform, Post, PublishResult};

#[derive(Clone)]
pub struct MockPublisher {
    platform: Platform,
    script: Arc<Mutex<VecDeque<PublishResult>>>,
    fallback: PublishResult,
    delay: Duration,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockPublisher {
    /// Always succeeds with a generated id
    pub fn success(platform: Platform) -> Self {
        Self::scripted(platform, Vec::new())
    }

    /// Always fails with the given kind
    pub fn failing(platform: Platform, kind: FailureKind, message: &str) -> Self {
        let mut mock = Self::success(platform);
        mock.fallback = PublishResult::failure(kind, message);
        mock
    }

    /// Returns `results` in order, then succeeds
    pub fn scripted(platform: Platform, results: Vec<PublishResult>) -> Self {
        Self {
            platform,
            script: Arc::new(Mutex::new(results.into())),
            fallback: PublishResult::success(format!("{}_mock", platform)),
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Ids of the posts this publisher was called with, in call order
    pub fn published_posts(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn publish(&self, post: &Post, _credentials: &MetaCredentials) -> PublishResult {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Ok(mut calls) = self.calls.lock() {
            calls.push(post.id.clone());
        }

        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}
