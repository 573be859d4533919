//! SQLite persistence for posts, queue items and processing logs

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use uuid::Uuid;

use crate::error::{DbError, PagecastError, Result};
use crate::outcome::Resolution;
use crate::types::{
    FailureKind, Platform, PlatformOutcome, PlatformResults, Post, PostStatus, PublishFailure,
    QueueItem, QueueStatus, MAX_BATCH_SIZE,
};

const QUEUE_COLUMNS: &str = "id, post_id, owner_id, scheduled_for, status, attempts, max_attempts, \
     last_error, processing_time_ms, created_at, updated_at, completed_at, claim_token";

/// One row of the append-only processing log
#[derive(Debug, Clone, Serialize)]
pub struct QueueLog {
    pub id: i64,
    pub queue_id: String,
    pub post_id: String,
    pub status: String,
    pub message: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub created_at: i64,
}

/// Queue item counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub retrying: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.retrying
    }

    fn add(&mut self, status: QueueStatus, count: u64) {
        match status {
            QueueStatus::Pending => self.pending += count,
            QueueStatus::Processing => self.processing += count,
            QueueStatus::Completed => self.completed += count,
            QueueStatus::Failed => self.failed += count,
            QueueStatus::Retrying => self.retrying += count,
        }
    }
}

/// Raw credential row; wrapped into secrets by the credential provider
#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub owner_id: String,
    pub access_token: String,
    pub page_id: Option<String>,
    pub instagram_business_account_id: Option<String>,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Posts
    // ------------------------------------------------------------------

    /// Insert a post together with any per-platform results it carries
    pub async fn create_post(&self, post: &Post) -> Result<()> {
        let hashtags = serde_json::to_string(&post.hashtags)
            .map_err(|e| PagecastError::InvalidInput(format!("hashtags: {}", e)))?;
        let media_urls = serde_json::to_string(&post.media_urls)
            .map_err(|e| PagecastError::InvalidInput(format!("media_urls: {}", e)))?;

        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            INSERT INTO posts (id, owner_id, caption, hashtags, media_url, media_urls,
                               platform_target, page_id, status, scheduled_for, published_at,
                               created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.owner_id)
        .bind(&post.caption)
        .bind(hashtags)
        .bind(&post.media_url)
        .bind(media_urls)
        .bind(post.platform_target.as_str())
        .bind(&post.page_id)
        .bind(post.status.as_str())
        .bind(post.scheduled_for)
        .bind(post.published_at)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        upsert_outcomes(&mut tx, &post.id, &post.results).await?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Get a post by ID, with its per-platform results
    pub async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, caption, hashtags, media_url, media_urls, platform_target, page_id,
                   status, scheduled_for, published_at, created_at, updated_at
            FROM posts WHERE id = ?
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut post = row_to_post(&row)?;
        post.results = self.get_platform_results(post_id).await?;
        Ok(Some(post))
    }

    async fn get_platform_results(&self, post_id: &str) -> Result<PlatformResults> {
        let rows = sqlx::query(
            r#"
            SELECT platform, success, external_id, error_kind, error_message, retryable, recorded_at
            FROM post_platform_results WHERE post_id = ?
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut results = PlatformResults::new();
        for row in rows {
            let platform: Platform = parse_column(&row, "post_platform_results", "platform")?;
            let recorded_at: i64 = row.get("recorded_at");
            let outcome = if row.get::<bool, _>("success") {
                PlatformOutcome::Published {
                    external_id: row
                        .get::<Option<String>, _>("external_id")
                        .unwrap_or_default(),
                    published_at: recorded_at,
                }
            } else {
                let kind = row
                    .get::<Option<String>, _>("error_kind")
                    .and_then(|k| FailureKind::from_str(&k).ok())
                    .unwrap_or(FailureKind::Unknown);
                PlatformOutcome::Failed {
                    failure: PublishFailure {
                        kind,
                        message: row
                            .get::<Option<String>, _>("error_message")
                            .unwrap_or_default(),
                        retryable: row.get("retryable"),
                    },
                    failed_at: recorded_at,
                }
            };
            results.insert(platform, outcome);
        }
        Ok(results)
    }

    // ------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------

    /// Write credentials for an owner, replacing existing ones
    pub async fn store_credentials(&self, row: &CredentialRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO owner_credentials (owner_id, access_token, page_id,
                                           instagram_business_account_id, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(owner_id) DO UPDATE SET
                access_token = excluded.access_token,
                page_id = excluded.page_id,
                instagram_business_account_id = excluded.instagram_business_account_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&row.owner_id)
        .bind(&row.access_token)
        .bind(&row.page_id)
        .bind(&row.instagram_business_account_id)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_credentials(&self, owner_id: &str) -> Result<Option<CredentialRow>> {
        let row = sqlx::query(
            r#"
            SELECT owner_id, access_token, page_id, instagram_business_account_id
            FROM owner_credentials WHERE owner_id = ?
            "#,
        )
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| CredentialRow {
            owner_id: r.get("owner_id"),
            access_token: r.get("access_token"),
            page_id: r.get("page_id"),
            instagram_business_account_id: r.get("instagram_business_account_id"),
        }))
    }

    // ------------------------------------------------------------------
    // Queue maintenance
    // ------------------------------------------------------------------

    /// Create a pending queue item for every due scheduled post that has none.
    ///
    /// Returns the number of items created. Posts that already hold an active
    /// item are skipped by the partial unique index.
    pub async fn enqueue_due_posts(&self, now: i64, max_attempts: u32) -> Result<u64> {
        let due: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT p.id FROM posts p
            WHERE p.status = 'scheduled'
              AND p.scheduled_for IS NOT NULL
              AND p.scheduled_for <= ?
              AND NOT EXISTS (
                  SELECT 1 FROM post_queue q
                  WHERE q.post_id = p.id AND q.status IN ('pending', 'processing', 'retrying')
              )
            ORDER BY p.scheduled_for, p.created_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut created = 0;
        for post_id in due {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO post_queue
                    (id, post_id, owner_id, scheduled_for, status, attempts, max_attempts,
                     created_at, updated_at)
                SELECT ?, id, owner_id, scheduled_for, 'pending', 0, ?, ?, ?
                FROM posts
                WHERE id = ? AND status = 'scheduled' AND scheduled_for <= ?
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(i64::from(max_attempts))
            .bind(now)
            .bind(now)
            .bind(&post_id)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

            if result.rows_affected() > 0 {
                tracing::debug!(post_id = %post_id, "Enqueued due post");
                created += result.rows_affected();
            }
        }

        Ok(created)
    }

    /// Promote `retrying` items whose backoff has elapsed back to `pending`
    pub async fn rearm_due_retries(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE post_queue SET status = 'pending', updated_at = ?
            WHERE status = 'retrying' AND scheduled_for <= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    /// Return items claimed at or before `claimed_before` to `pending`.
    ///
    /// Attempts are left unchanged and the owning posts go back to `scheduled`.
    /// The claim token is dropped, so outcomes from the abandoned claim no
    /// longer match.
    pub async fn reclaim_stuck(&self, claimed_before: i64, now: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let rows = sqlx::query(
            r#"
            UPDATE post_queue SET status = 'pending', claim_token = NULL, updated_at = ?
            WHERE status = 'processing' AND updated_at <= ?
            RETURNING id, post_id
            "#,
        )
        .bind(now)
        .bind(claimed_before)
        .fetch_all(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        for row in &rows {
            let queue_id: String = row.get("id");
            let post_id: String = row.get("post_id");
            sqlx::query(
                r#"
                UPDATE posts SET status = 'scheduled', updated_at = ?
                WHERE id = ? AND status = 'processing'
                "#,
            )
            .bind(now)
            .bind(&post_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

            tracing::warn!(queue_id = %queue_id, post_id = %post_id, "Reclaimed stuck queue item");
        }

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(rows.len() as u64)
    }

    // ------------------------------------------------------------------
    // Claim and record
    // ------------------------------------------------------------------

    /// Atomically claim up to `limit` due pending items.
    ///
    /// Claimed items move to `processing` and their posts from `scheduled` to
    /// `processing` in the same transaction. Concurrent callers receive
    /// disjoint sets, each stamped with a fresh claim token. `limit` is
    /// clamped to `1..=MAX_BATCH_SIZE`.
    pub async fn claim_batch(&self, limit: usize, now: i64) -> Result<Vec<QueueItem>> {
        let limit = limit.clamp(1, MAX_BATCH_SIZE) as i64;

        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        // The write comes first so the transaction holds the write lock from the start
        let sql = format!(
            r#"
            UPDATE post_queue SET status = 'processing', claim_token = ?, updated_at = ?
            WHERE id IN (
                SELECT id FROM post_queue
                WHERE status = 'pending' AND scheduled_for <= ?
                ORDER BY scheduled_for, created_at, id
                LIMIT ?
            )
            RETURNING {}
            "#,
            QUEUE_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(now)
            .bind(now)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        let mut items = rows
            .iter()
            .map(row_to_queue_item)
            .collect::<Result<Vec<_>>>()?;

        for item in &items {
            sqlx::query(
                r#"
                UPDATE posts SET status = 'processing', updated_at = ?
                WHERE id = ? AND status = 'scheduled'
                "#,
            )
            .bind(now)
            .bind(&item.post_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
        }

        tx.commit().await.map_err(DbError::SqlxError)?;

        // RETURNING order is unspecified
        items.sort_by(|a, b| {
            (a.scheduled_for, a.created_at, &a.queue_id).cmp(&(b.scheduled_for, b.created_at, &b.queue_id))
        });

        Ok(items)
    }

    /// Persist a resolved attempt.
    ///
    /// Returns `false` without writing anything when the item is no longer the
    /// `processing` row of the claim `item` came from (same claim token and
    /// attempt count). Repeated calls for the same attempt are harmless, and
    /// a late result from a reclaimed claim cannot overwrite a newer one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the resolution names a status that
    /// cannot follow `processing`.
    pub async fn record_outcome(
        &self,
        item: &QueueItem,
        resolution: &Resolution,
        processing_time_ms: i64,
    ) -> Result<bool> {
        QueueStatus::Processing.transition(resolution.queue_status)?;
        PostStatus::Processing.transition(resolution.post_status)?;

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let updated = sqlx::query(
            r#"
            UPDATE post_queue
            SET status = ?,
                attempts = ?,
                last_error = ?,
                scheduled_for = COALESCE(?, scheduled_for),
                processing_time_ms = ?,
                completed_at = ?,
                claim_token = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'processing' AND attempts = ? AND claim_token = ?
            "#,
        )
        .bind(resolution.queue_status.as_str())
        .bind(i64::from(resolution.attempts))
        .bind(&resolution.last_error)
        .bind(resolution.next_run_at)
        .bind(processing_time_ms)
        .bind(resolution.completed_at)
        .bind(now)
        .bind(&item.queue_id)
        .bind(i64::from(item.attempts))
        .bind(&item.claim_token)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if updated.rows_affected() == 0 {
            tracing::debug!(
                queue_id = %item.queue_id,
                attempts = item.attempts,
                "Outcome already recorded, skipping"
            );
            return Ok(false);
        }

        upsert_outcomes(&mut tx, &item.post_id, &resolution.outcomes).await?;

        sqlx::query(
            r#"
            UPDATE posts
            SET status = ?, published_at = COALESCE(?, published_at), updated_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(resolution.post_status.as_str())
        .bind(resolution.published_at)
        .bind(now)
        .bind(&item.post_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        let message = match &resolution.last_error {
            Some(error) => error.clone(),
            None => {
                let platforms: Vec<&str> = resolution.outcomes.keys().map(Platform::as_str).collect();
                format!("Published to {}", platforms.join(", "))
            }
        };

        sqlx::query(
            r#"
            INSERT INTO queue_processing_logs (queue_id, post_id, status, message, processing_time_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.queue_id)
        .bind(&item.post_id)
        .bind(resolution.queue_status.as_str())
        .bind(message)
        .bind(processing_time_ms)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(true)
    }

    /// Admin re-queue of one failed item: attempts reset, due now.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `InvalidTransition` when the item is not `failed`.
    pub async fn requeue_item(&self, queue_id: &str, now: i64) -> Result<QueueItem> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let sql = format!(
            r#"
            UPDATE post_queue
            SET status = 'pending', attempts = 0, last_error = NULL, completed_at = NULL,
                scheduled_for = ?, updated_at = ?
            WHERE id = ? AND status = 'failed'
            RETURNING {}
            "#,
            QUEUE_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(now)
            .bind(now)
            .bind(queue_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        let Some(row) = row else {
            drop(tx);
            return match self.get_queue_item(queue_id).await? {
                None => Err(PagecastError::NotFound(format!("queue item {}", queue_id))),
                Some(existing) => existing.status.requeue().map(|_| existing),
            };
        };

        let item = row_to_queue_item(&row)?;

        sqlx::query(
            r#"
            UPDATE posts SET status = 'scheduled', updated_at = ?
            WHERE id = ? AND status = 'failed'
            "#,
        )
        .bind(now)
        .bind(&item.post_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;

        tracing::info!(queue_id = %item.queue_id, post_id = %item.post_id, "Re-queued failed item");
        Ok(item)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_queue_item(&self, queue_id: &str) -> Result<Option<QueueItem>> {
        let sql = format!("SELECT {} FROM post_queue WHERE id = ?", QUEUE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(queue_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_queue_item).transpose()
    }

    /// All queue items of a post, oldest first
    pub async fn queue_items_for_post(&self, post_id: &str) -> Result<Vec<QueueItem>> {
        let sql = format!(
            "SELECT {} FROM post_queue WHERE post_id = ? ORDER BY created_at, id",
            QUEUE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(post_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_queue_item).collect()
    }

    /// Counts by status of items created at or after `since`
    pub async fn queue_stats(&self, since: i64) -> Result<StatusCounts> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count FROM post_queue
            WHERE created_at >= ?
            GROUP BY status
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: QueueStatus = parse_column(&row, "post_queue", "status")?;
            let count: i64 = row.get("count");
            counts.add(status, count.max(0) as u64);
        }
        Ok(counts)
    }

    /// Most recent processing log entries, newest first
    pub async fn recent_logs(&self, limit: usize) -> Result<Vec<QueueLog>> {
        let rows = sqlx::query(
            r#"
            SELECT id, queue_id, post_id, status, message, processing_time_ms, created_at
            FROM queue_processing_logs
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| QueueLog {
                id: r.get("id"),
                queue_id: r.get("queue_id"),
                post_id: r.get("post_id"),
                status: r.get("status"),
                message: r.get("message"),
                processing_time_ms: r.get("processing_time_ms"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    /// Failed items still under their attempt budget (any failure kind), most
    /// recently updated first
    pub async fn retryable_failures(&self, limit: usize) -> Result<Vec<QueueItem>> {
        let sql = format!(
            r#"
            SELECT {} FROM post_queue
            WHERE status = 'failed' AND attempts < max_attempts
            ORDER BY updated_at DESC, id
            LIMIT ?
            "#,
            QUEUE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_queue_item).collect()
    }

    /// Delete completed items that finished before `completed_before`
    pub async fn clear_completed(&self, completed_before: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM post_queue
            WHERE status = 'completed' AND completed_at IS NOT NULL AND completed_at < ?
            "#,
        )
        .bind(completed_before)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }
}

async fn upsert_outcomes(
    tx: &mut Transaction<'_, Sqlite>,
    post_id: &str,
    outcomes: &PlatformResults,
) -> Result<()> {
    for (platform, outcome) in outcomes {
        let (success, external_id, error_kind, error_message, retryable, recorded_at) = match outcome {
            PlatformOutcome::Published {
                external_id,
                published_at,
            } => (true, Some(external_id.as_str()), None, None, false, *published_at),
            PlatformOutcome::Failed { failure, failed_at } => (
                false,
                None,
                Some(failure.kind.as_str()),
                Some(failure.message.as_str()),
                failure.retryable,
                *failed_at,
            ),
        };

        // A published outcome is never replaced
        sqlx::query(
            r#"
            INSERT INTO post_platform_results
                (post_id, platform, success, external_id, error_kind, error_message, retryable, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(post_id, platform) DO UPDATE SET
                success = excluded.success,
                external_id = excluded.external_id,
                error_kind = excluded.error_kind,
                error_message = excluded.error_message,
                retryable = excluded.retryable,
                recorded_at = excluded.recorded_at
            WHERE post_platform_results.success = 0
            "#,
        )
        .bind(post_id)
        .bind(platform.as_str())
        .bind(success)
        .bind(external_id)
        .bind(error_kind)
        .bind(error_message)
        .bind(retryable)
        .bind(recorded_at)
        .execute(&mut **tx)
        .await
        .map_err(DbError::SqlxError)?;
    }
    Ok(())
}

fn parse_column<T>(row: &SqliteRow, table: &'static str, column: &str) -> Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(column);
    raw.parse::<T>()
        .map_err(|reason| DbError::CorruptRow { table, reason }.into())
}

fn to_u32(value: i64, table: &'static str, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        DbError::CorruptRow {
            table,
            reason: format!("{} out of range: {}", column, value),
        }
        .into()
    })
}

fn row_to_queue_item(row: &SqliteRow) -> Result<QueueItem> {
    Ok(QueueItem {
        queue_id: row.get("id"),
        post_id: row.get("post_id"),
        owner_id: row.get("owner_id"),
        scheduled_for: row.get("scheduled_for"),
        status: parse_column(row, "post_queue", "status")?,
        attempts: to_u32(row.get("attempts"), "post_queue", "attempts")?,
        max_attempts: to_u32(row.get("max_attempts"), "post_queue", "max_attempts")?,
        last_error: row.get("last_error"),
        processing_time_ms: row.get("processing_time_ms"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        completed_at: row.get("completed_at"),
        claim_token: row.get("claim_token"),
    })
}

fn row_to_post(row: &SqliteRow) -> Result<Post> {
    let hashtags: String = row.get("hashtags");
    let hashtags: Vec<String> = serde_json::from_str(&hashtags).map_err(|e| DbError::CorruptRow {
        table: "posts",
        reason: format!("hashtags: {}", e),
    })?;
    let media_urls: String = row.get("media_urls");
    let media_urls: Vec<String> =
        serde_json::from_str(&media_urls).map_err(|e| DbError::CorruptRow {
            table: "posts",
            reason: format!("media_urls: {}", e),
        })?;

    Ok(Post {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        caption: row.get("caption"),
        hashtags,
        media_url: row.get("media_url"),
        media_urls,
        platform_target: parse_column(row, "posts", "platform_target")?,
        page_id: row.get("page_id"),
        status: parse_column(row, "posts", "status")?,
        scheduled_for: row.get("scheduled_for"),
        published_at: row.get("published_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        results: PlatformResults::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{self, AttemptResults};
    use crate::retry::RetryPolicy;
    use crate::types::{PlatformTarget, PublishResult};
    use tempfile::TempDir;

    async fn setup_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        (db, temp_dir)
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    async fn due_post(db: &Database, target: PlatformTarget) -> Post {
        let post = Post::new("owner-1", "Hello from the queue", target, "page-1")
            .with_hashtags(["launch", "#news"])
            .scheduled_at(now() - 60);
        db.create_post(&post).await.unwrap();
        post
    }

    #[tokio::test]
    async fn test_create_and_get_post() {
        let (db, _temp) = setup_test_db().await;
        let post = due_post(&db, PlatformTarget::Both).await;

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.caption, "Hello from the queue");
        assert_eq!(loaded.hashtags, vec!["launch", "#news"]);
        assert_eq!(loaded.platform_target, PlatformTarget::Both);
        assert_eq!(loaded.status, PostStatus::Scheduled);
        assert!(loaded.results.is_empty());

        assert!(db.get_post("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_carousel_media_persisted_in_order() {
        let (db, _temp) = setup_test_db().await;
        let post = Post::new("owner-1", "Lookbook", PlatformTarget::Instagram, "page-1")
            .with_media_items(["https://cdn.example.com/2.jpg", "https://cdn.example.com/1.jpg"])
            .scheduled_at(now() - 60);
        db.create_post(&post).await.unwrap();

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.media_urls,
            vec!["https://cdn.example.com/2.jpg", "https://cdn.example.com/1.jpg"]
        );
        assert_eq!(loaded.media_url.as_deref(), Some("https://cdn.example.com/2.jpg"));

        let plain = due_post(&db, PlatformTarget::Facebook).await;
        assert!(db.get_post(&plain.id).await.unwrap().unwrap().media_urls.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let (db, _temp) = setup_test_db().await;
        let post = due_post(&db, PlatformTarget::Facebook).await;

        // Not yet due
        let future = Post::new("owner-1", "Later", PlatformTarget::Facebook, "page-1")
            .scheduled_at(now() + 3600);
        db.create_post(&future).await.unwrap();

        assert_eq!(db.enqueue_due_posts(now(), 3).await.unwrap(), 1);
        assert_eq!(db.enqueue_due_posts(now(), 3).await.unwrap(), 0);

        let items = db.queue_items_for_post(&post.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, QueueStatus::Pending);
        assert_eq!(items[0].attempts, 0);
        assert_eq!(items[0].max_attempts, 3);
        assert!(db.queue_items_for_post(&future.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_moves_item_and_post_to_processing() {
        let (db, _temp) = setup_test_db().await;
        let post = due_post(&db, PlatformTarget::Facebook).await;
        db.enqueue_due_posts(now(), 3).await.unwrap();

        let claimed = db.claim_batch(5, now()).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, QueueStatus::Processing);
        assert_eq!(claimed[0].attempts, 0);

        let post = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Processing);

        // Nothing left to claim
        assert!(db.claim_batch(5, now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_respects_order_and_limit() {
        let (db, _temp) = setup_test_db().await;
        let base = now() - 600;
        let mut ids = Vec::new();
        for offset in [30, 10, 20] {
            let post = Post::new("owner-1", "ordered", PlatformTarget::Facebook, "page-1")
                .scheduled_at(base + offset);
            db.create_post(&post).await.unwrap();
            ids.push((offset, post.id));
        }
        db.enqueue_due_posts(now(), 3).await.unwrap();

        let claimed = db.claim_batch(2, now()).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].scheduled_for, base + 10);
        assert_eq!(claimed[1].scheduled_for, base + 20);
    }

    #[tokio::test]
    async fn test_claim_limit_is_clamped() {
        let (db, _temp) = setup_test_db().await;
        for _ in 0..25 {
            due_post(&db, PlatformTarget::Facebook).await;
        }
        db.enqueue_due_posts(now(), 3).await.unwrap();

        assert_eq!(db.claim_batch(100, now()).await.unwrap().len(), MAX_BATCH_SIZE);
        assert_eq!(db.claim_batch(0, now()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_outcome_is_idempotent() {
        let (db, _temp) = setup_test_db().await;
        let post = due_post(&db, PlatformTarget::Facebook).await;
        db.enqueue_due_posts(now(), 3).await.unwrap();
        let item = db.claim_batch(1, now()).await.unwrap().remove(0);
        let post = db.get_post(&post.id).await.unwrap().unwrap();

        let attempt: AttemptResults =
            [(Platform::Facebook, PublishResult::success("fb_42"))].into_iter().collect();
        let resolution = outcome::resolve(&item, &post, &attempt, &RetryPolicy::default(), now());

        assert!(db.record_outcome(&item, &resolution, 12).await.unwrap());
        assert!(!db.record_outcome(&item, &resolution, 12).await.unwrap());

        let stored = db.get_queue_item(&item.queue_id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Completed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.processing_time_ms, Some(12));

        let post = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Published);
        assert!(post.published_at.is_some());
        assert_eq!(post.external_post_ids()[&Platform::Facebook], "fb_42");

        let logs = db.recent_logs(10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "completed");
    }

    #[tokio::test]
    async fn test_retry_then_rearm() {
        let (db, _temp) = setup_test_db().await;
        let post = due_post(&db, PlatformTarget::Instagram).await;
        db.enqueue_due_posts(now(), 3).await.unwrap();
        let item = db.claim_batch(1, now()).await.unwrap().remove(0);
        let loaded = db.get_post(&post.id).await.unwrap().unwrap();

        let attempt: AttemptResults = [(
            Platform::Instagram,
            PublishResult::failure(FailureKind::MediaProcessing, "container not ready"),
        )]
        .into_iter()
        .collect();
        let resolution = outcome::resolve(&item, &loaded, &attempt, &RetryPolicy::default(), now());
        db.record_outcome(&item, &resolution, 5).await.unwrap();

        let stored = db.get_queue_item(&item.queue_id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Retrying);
        assert!(stored.scheduled_for >= now() + 59);
        assert_eq!(
            db.get_post(&post.id).await.unwrap().unwrap().status,
            PostStatus::Scheduled
        );

        // Backoff not elapsed
        assert_eq!(db.rearm_due_retries(now()).await.unwrap(), 0);
        // Post with a retrying item does not get a second one
        assert_eq!(db.enqueue_due_posts(now(), 3).await.unwrap(), 0);

        assert_eq!(db.rearm_due_retries(now() + 120).await.unwrap(), 1);
        let stored = db.get_queue_item(&item.queue_id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Pending);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_published_result_is_never_overwritten() {
        let (db, _temp) = setup_test_db().await;
        let mut post = Post::new("owner-1", "seeded", PlatformTarget::Both, "page-1")
            .scheduled_at(now() - 10);
        post.results.insert(
            Platform::Facebook,
            PlatformOutcome::Published {
                external_id: "fb_1".to_string(),
                published_at: now() - 5,
            },
        );
        db.create_post(&post).await.unwrap();

        let mut tx = db.pool.begin().await.unwrap();
        let mut failed = PlatformResults::new();
        failed.insert(
            Platform::Facebook,
            PlatformOutcome::Failed {
                failure: PublishFailure::new(FailureKind::Network, "late"),
                failed_at: now(),
            },
        );
        upsert_outcomes(&mut tx, &post.id, &failed).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert!(loaded.results[&Platform::Facebook].is_published());
    }

    #[tokio::test]
    async fn test_reclaim_stuck_items() {
        let (db, _temp) = setup_test_db().await;
        let post = due_post(&db, PlatformTarget::Facebook).await;
        db.enqueue_due_posts(now(), 3).await.unwrap();
        let item = db.claim_batch(1, now()).await.unwrap().remove(0);

        // Claimed just now, so a cutoff in the past reclaims nothing
        assert_eq!(db.reclaim_stuck(now() - 900, now()).await.unwrap(), 0);
        assert_eq!(db.reclaim_stuck(now() + 1, now()).await.unwrap(), 1);

        let stored = db.get_queue_item(&item.queue_id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Pending);
        assert_eq!(stored.attempts, 0);
        assert_eq!(
            db.get_post(&post.id).await.unwrap().unwrap().status,
            PostStatus::Scheduled
        );

        // A late outcome for the reclaimed claim is ignored
        let resolution = outcome::terminal(&item, "late", now());
        assert!(!db.record_outcome(&item, &resolution, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_reclaimed_claim_cannot_overwrite_new_claim() {
        let (db, _temp) = setup_test_db().await;
        let post = due_post(&db, PlatformTarget::Facebook).await;
        db.enqueue_due_posts(now(), 3).await.unwrap();
        let stale = db.claim_batch(1, now()).await.unwrap().remove(0);
        assert!(stale.claim_token.is_some());

        // Reclaimed and claimed again within the same second
        assert_eq!(db.reclaim_stuck(now() + 1, now()).await.unwrap(), 1);
        let fresh = db.claim_batch(1, now()).await.unwrap().remove(0);
        assert_eq!(fresh.queue_id, stale.queue_id);
        assert_eq!(fresh.attempts, stale.attempts);
        assert_ne!(fresh.claim_token, stale.claim_token);

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        let late = outcome::terminal(&stale, "late", now());
        assert!(!db.record_outcome(&stale, &late, 0).await.unwrap());

        let attempt: AttemptResults =
            [(Platform::Facebook, PublishResult::success("fb_7"))].into_iter().collect();
        let resolution = outcome::resolve(&fresh, &loaded, &attempt, &RetryPolicy::default(), now());
        assert!(db.record_outcome(&fresh, &resolution, 3).await.unwrap());

        let stored = db.get_queue_item(&fresh.queue_id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Completed);
        assert!(stored.claim_token.is_none());
        assert_eq!(
            db.get_post(&post.id).await.unwrap().unwrap().status,
            PostStatus::Published
        );
    }

    #[tokio::test]
    async fn test_requeue_item_errors() {
        let (db, _temp) = setup_test_db().await;
        let err = db.requeue_item("missing", now()).await.unwrap_err();
        assert!(matches!(err, PagecastError::NotFound(_)));

        due_post(&db, PlatformTarget::Facebook).await;
        db.enqueue_due_posts(now(), 3).await.unwrap();
        let item = db.claim_batch(1, now()).await.unwrap().remove(0);
        let err = db.requeue_item(&item.queue_id, now()).await.unwrap_err();
        assert!(matches!(err, PagecastError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_credentials_round_trip() {
        let (db, _temp) = setup_test_db().await;
        assert!(db.get_credentials("owner-1").await.unwrap().is_none());

        let row = CredentialRow {
            owner_id: "owner-1".to_string(),
            access_token: "EAAB-token".to_string(),
            page_id: Some("page-1".to_string()),
            instagram_business_account_id: None,
        };
        db.store_credentials(&row).await.unwrap();

        let stored = db.get_credentials("owner-1").await.unwrap().unwrap();
        assert_eq!(stored.access_token, "EAAB-token");
        assert_eq!(stored.page_id.as_deref(), Some("page-1"));
        assert!(stored.instagram_business_account_id.is_none());
    }
}
