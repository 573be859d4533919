//! Pagecast - scheduled publishing to Facebook Pages and Instagram
//!
//! This library holds the durable publish queue: it claims due posts, hands
//! them to platform publishers, records per-platform outcomes and schedules
//! retries. The `pagecast-send` and `pagecast-queue` binaries are thin shells
//! over [`processor::QueueProcessor`] and [`admin::AdminService`].

pub mod admin;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod logging;
pub mod outcome;
pub mod platforms;
pub mod processor;
pub mod repository;
pub mod retry;
pub mod types;

// Re-export commonly used types
pub use admin::AdminService;
pub use config::Config;
pub use credentials::{CredentialProvider, MetaCredentials};
pub use db::Database;
pub use error::{PagecastError, Result};
pub use processor::{CycleReport, ItemStatus, QueueProcessor};
pub use repository::QueueRepository;
pub use retry::{NextAction, RetryPolicy};
pub use types::{
    FailureKind, Platform, PlatformOutcome, PlatformTarget, Post, PostStatus, PublishFailure,
    PublishResult, QueueItem, QueueStatus,
};
