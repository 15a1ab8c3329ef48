//! Catalog persistence (sqlx/SQLite) + HTTP client utilities for GCR.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gcr_core::{MergedItem, StoredItem, SyncAuditRecord, SyncCounts, SyncStatus};
use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

pub const CRATE_NAME: &str = "gcr-storage";

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row for game {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

/// Counts carried into the final page's transaction so the success audit row
/// commits together with the last batch.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub source: String,
    pub started_at: DateTime<Utc>,
    /// `fetched`/`skipped` for the whole run, `inserted`/`updated` for pages already committed.
    pub prior: SyncCounts,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub removed_duplicates: Vec<i64>,
    pub audit: Option<SyncAuditRecord>,
}

#[derive(Debug, Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
}

impl CatalogStore {
    /// Open (creating if missing) the database at `database_url` and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let in_memory = database_url.contains(":memory:");

        // every pooled connection to `sqlite::memory:` is its own database
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Takes the write lock up front. A deferred transaction that reads before
    /// writing gets SQLITE_BUSY without waiting when another writer holds the lock.
    async fn begin_write(&self) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>, StoreError> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Upsert `items`, restore slug uniqueness over the whole table and, when
    /// `finalize` is given, append the success audit row. One transaction.
    pub async fn apply_batch(
        &self,
        items: &[MergedItem],
        finalize: Option<AuditDraft>,
    ) -> Result<BatchOutcome, StoreError> {
        let span = info_span!("apply_batch", items = items.len(), finalize = finalize.is_some());
        async move {
            let now = Utc::now();
            let mut tx = self.begin_write().await?;
            let mut inserted = 0u64;
            let mut updated = 0u64;

            for item in items {
                let existing: Option<DateTime<Utc>> =
                    sqlx::query_scalar("SELECT fetched_at FROM games WHERE id = ?")
                        .bind(item.external_id)
                        .fetch_optional(&mut *tx)
                        .await?;

                match existing {
                    Some(fetched_at) => {
                        update_item(&mut tx, item, now.max(fetched_at)).await?;
                        updated += 1;
                    }
                    None => {
                        insert_item(&mut tx, item, now).await?;
                        inserted += 1;
                    }
                }
            }

            let removed_duplicates = dedup_slugs_in(&mut tx).await?;

            let audit = match finalize {
                Some(draft) => {
                    let counts = SyncCounts {
                        fetched: draft.prior.fetched,
                        inserted: draft.prior.inserted + inserted,
                        updated: draft.prior.updated + updated,
                        skipped: draft.prior.skipped,
                    };
                    let row = NewAudit {
                        source: &draft.source,
                        started_at: draft.started_at,
                        finished_at: Utc::now(),
                        counts,
                        status: SyncStatus::Success,
                        message: None,
                    };
                    Some(insert_audit(&mut tx, row).await?)
                }
                None => None,
            };

            tx.commit().await?;
            info!(inserted, updated, removed = removed_duplicates.len(), "batch committed");

            Ok(BatchOutcome {
                inserted,
                updated,
                removed_duplicates,
                audit,
            })
        }
        .instrument(span)
        .await
    }

    /// Standalone dedup pass in its own transaction. Returns the removed ids.
    pub async fn dedup_slugs(&self) -> Result<Vec<i64>, StoreError> {
        let mut tx = self.begin_write().await?;
        let removed = dedup_slugs_in(&mut tx).await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Append an error audit row with zeroed counts.
    pub async fn record_failure(
        &self,
        source: &str,
        started_at: DateTime<Utc>,
        message: &str,
    ) -> Result<SyncAuditRecord, StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_audit(
            &mut conn,
            NewAudit {
                source,
                started_at,
                finished_at: Utc::now(),
                counts: SyncCounts::default(),
                status: SyncStatus::Error,
                message: Some(message),
            },
        )
        .await
    }

    pub async fn last_audit(&self, source: &str) -> Result<Option<SyncAuditRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, source, started_at, finished_at,
                   records_fetched, records_inserted, records_updated, records_skipped,
                   status, message
              FROM sync_logs
             WHERE source = ?
             ORDER BY started_at DESC, id DESC
             LIMIT 1
            "#,
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_audit).transpose()
    }

    pub async fn list_items(&self) -> Result<Vec<StoredItem>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_GAMES} ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_item).collect()
    }

    pub async fn get_item(&self, external_id: i64) -> Result<Option<StoredItem>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_GAMES} WHERE id = ?"))
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_item).transpose()
    }
}

/// Ids to delete so each slug keeps only its largest id.
pub fn plan_slug_dedup<I>(rows: I) -> Vec<i64>
where
    I: IntoIterator<Item = (i64, String)>,
{
    let rows: Vec<(i64, String)> = rows.into_iter().collect();
    let mut keep: HashMap<&str, i64> = HashMap::new();
    for (id, slug) in &rows {
        keep.entry(slug.as_str())
            .and_modify(|kept| *kept = (*kept).max(*id))
            .or_insert(*id);
    }

    let mut doomed = rows
        .iter()
        .filter(|(id, slug)| keep.get(slug.as_str()) != Some(id))
        .map(|(id, _)| *id)
        .collect::<Vec<_>>();
    doomed.sort_unstable();
    doomed
}

const SELECT_GAMES: &str = r#"
    SELECT id, slug, name, released, genre, rating, ratings_count, metacritic,
           background_image, platforms, price_cheap, price_external, cheapshark_game_id,
           fetched_at, updated_at
      FROM games
"#;

struct NewAudit<'a> {
    source: &'a str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    counts: SyncCounts,
    status: SyncStatus,
    message: Option<&'a str>,
}

async fn insert_item(
    conn: &mut SqliteConnection,
    item: &MergedItem,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO games (
            id, slug, name, released, genre, rating, ratings_count, metacritic,
            background_image, platforms, price_cheap, price_external, cheapshark_game_id,
            fetched_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(item.external_id)
    .bind(&item.slug)
    .bind(&item.name)
    .bind(item.released)
    .bind(&item.genre)
    .bind(item.rating)
    .bind(item.ratings_count)
    .bind(item.metacritic)
    .bind(&item.background_image)
    .bind(platforms_json(item))
    .bind(item.price_cheap)
    .bind(item.price_external)
    .bind(&item.cheapshark_game_id)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn update_item(
    conn: &mut SqliteConnection,
    item: &MergedItem,
    updated_at: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE games
           SET slug = ?, name = ?, released = ?, genre = ?, rating = ?, ratings_count = ?,
               metacritic = ?, background_image = ?, platforms = ?, price_cheap = ?,
               price_external = ?, cheapshark_game_id = ?, updated_at = ?
         WHERE id = ?
        "#,
    )
    .bind(&item.slug)
    .bind(&item.name)
    .bind(item.released)
    .bind(&item.genre)
    .bind(item.rating)
    .bind(item.ratings_count)
    .bind(item.metacritic)
    .bind(&item.background_image)
    .bind(platforms_json(item))
    .bind(item.price_cheap)
    .bind(item.price_external)
    .bind(&item.cheapshark_game_id)
    .bind(updated_at)
    .bind(item.external_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn dedup_slugs_in(conn: &mut SqliteConnection) -> Result<Vec<i64>, StoreError> {
    let rows = sqlx::query("SELECT id, slug FROM games")
        .fetch_all(&mut *conn)
        .await?;
    let pairs = rows
        .iter()
        .map(|row| Ok((row.try_get::<i64, _>("id")?, row.try_get::<String, _>("slug")?)))
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

    let doomed = plan_slug_dedup(pairs);
    for id in &doomed {
        sqlx::query("DELETE FROM games WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }
    if !doomed.is_empty() {
        debug!(?doomed, "removed duplicate slugs");
    }
    Ok(doomed)
}

async fn insert_audit(
    conn: &mut SqliteConnection,
    row: NewAudit<'_>,
) -> Result<SyncAuditRecord, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO sync_logs (
            source, started_at, finished_at,
            records_fetched, records_inserted, records_updated, records_skipped,
            status, message
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(row.source)
    .bind(row.started_at)
    .bind(row.finished_at)
    .bind(row.counts.fetched as i64)
    .bind(row.counts.inserted as i64)
    .bind(row.counts.updated as i64)
    .bind(row.counts.skipped as i64)
    .bind(row.status.as_str())
    .bind(row.message)
    .execute(&mut *conn)
    .await?;

    Ok(SyncAuditRecord {
        id: result.last_insert_rowid(),
        source: row.source.to_string(),
        started_at: row.started_at,
        finished_at: row.finished_at,
        records_fetched: row.counts.fetched,
        records_inserted: row.counts.inserted,
        records_updated: row.counts.updated,
        records_skipped: row.counts.skipped,
        status: row.status,
        message: row.message.map(ToString::to_string),
    })
}

fn platforms_json(item: &MergedItem) -> String {
    serde_json::Value::from(item.platforms.clone()).to_string()
}

fn row_to_item(row: &SqliteRow) -> Result<StoredItem, StoreError> {
    let id: i64 = row.try_get("id")?;
    let platforms_text: String = row.try_get("platforms")?;
    let platforms: Vec<String> =
        serde_json::from_str(&platforms_text).map_err(|err| StoreError::Corrupt {
            id,
            reason: format!("platforms column: {err}"),
        })?;

    Ok(StoredItem {
        item: MergedItem {
            external_id: id,
            slug: row.try_get("slug")?,
            name: row.try_get("name")?,
            released: row.try_get("released")?,
            genre: row.try_get("genre")?,
            rating: row.try_get("rating")?,
            ratings_count: row.try_get("ratings_count")?,
            metacritic: row.try_get("metacritic")?,
            background_image: row.try_get("background_image")?,
            platforms,
            cheapshark_game_id: row.try_get("cheapshark_game_id")?,
            price_cheap: row.try_get("price_cheap")?,
            price_external: row.try_get("price_external")?,
        },
        fetched_at: row.try_get("fetched_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_audit(row: &SqliteRow) -> Result<SyncAuditRecord, StoreError> {
    let id: i64 = row.try_get("id")?;
    let status_text: String = row.try_get("status")?;
    let status = SyncStatus::parse(&status_text).ok_or_else(|| StoreError::Corrupt {
        id,
        reason: format!("unknown sync status {status_text:?}"),
    })?;
    let count = |column: &str| -> Result<u64, StoreError> {
        let value: i64 = row.try_get(column)?;
        Ok(value.max(0) as u64)
    };

    Ok(SyncAuditRecord {
        id,
        source: row.try_get("source")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        records_fetched: count("records_fetched")?,
        records_inserted: count("records_inserted")?,
        records_updated: count("records_updated")?,
        records_skipped: count("records_skipped")?,
        status,
        message: row.try_get("message")?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only the provider's explicit throttle signal is worth waiting out.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Linear backoff: the n-th wait (1-based) is `retry_delay * n`.
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl LinearBackoff {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(attempt)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

impl HttpClientConfig {
    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);

        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use gcr_core::SYNC_SOURCE;

    async fn memory_store() -> CatalogStore {
        CatalogStore::connect("sqlite::memory:")
            .await
            .expect("in-memory store")
    }

    fn item(id: i64, slug: &str, price: f64) -> MergedItem {
        MergedItem {
            external_id: id,
            slug: slug.to_string(),
            name: slug.replace('-', " "),
            released: NaiveDate::from_ymd_opt(2020, 1, 2),
            genre: Some("Action".into()),
            rating: Some(4.1),
            ratings_count: Some(120),
            metacritic: None,
            background_image: None,
            platforms: vec!["PC".into(), "Nintendo Switch".into()],
            cheapshark_game_id: format!("cs-{id}"),
            price_cheap: price,
            price_external: None,
        }
    }

    async fn insert_raw(store: &CatalogStore, id: i64, slug: &str) {
        let mut conn = store.pool().acquire().await.expect("conn");
        insert_item(&mut conn, &item(id, slug, 1.0), Utc::now())
            .await
            .expect("raw insert");
    }

    #[test]
    fn dedup_plan_keeps_largest_id_per_slug() {
        let doomed = plan_slug_dedup(vec![
            (10, "hades".to_string()),
            (42, "hades".to_string()),
            (7, "celeste".to_string()),
            (3, "hades".to_string()),
            (8, "celeste".to_string()),
            (99, "inside".to_string()),
        ]);
        assert_eq!(doomed, vec![3, 7, 10]);
        assert!(plan_slug_dedup(Vec::<(i64, String)>::new()).is_empty());
    }

    #[test]
    fn linear_backoff_grows_by_one_delay_per_attempt() {
        let policy = LinearBackoff {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1500));
    }

    #[test]
    fn only_429_is_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::NonRetryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = memory_store().await;
        let batch = vec![item(1, "hades", 9.99), item(2, "celeste", 4.99)];

        let first = store.apply_batch(&batch, None).await.expect("first batch");
        assert_eq!((first.inserted, first.updated), (2, 0));
        let before = store.list_items().await.expect("list");

        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = store.apply_batch(&batch, None).await.expect("second batch");
        assert_eq!((second.inserted, second.updated), (0, 2));
        let after = store.list_items().await.expect("list");

        assert_eq!(after.len(), 2);
        for (old, new) in before.iter().zip(after.iter()) {
            assert_eq!(old.item, new.item);
            assert_eq!(old.fetched_at, new.fetched_at);
            assert!(new.updated_at > old.updated_at);
            assert!(new.updated_at >= new.fetched_at);
        }
    }

    #[tokio::test]
    async fn update_overwrites_mutable_fields() {
        let store = memory_store().await;
        store.apply_batch(&[item(5, "hades", 24.99)], None).await.expect("insert");

        let mut changed = item(5, "hades", 12.49);
        changed.platforms = vec!["PC".into()];
        changed.metacritic = Some(93);
        store.apply_batch(&[changed.clone()], None).await.expect("update");

        let stored = store.get_item(5).await.expect("get").expect("present");
        assert_eq!(stored.item, changed);
        assert!(store.get_item(6).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn dedup_pass_leaves_one_row_per_slug() {
        let store = memory_store().await;
        insert_raw(&store, 10, "hades").await;
        insert_raw(&store, 42, "hades").await;
        insert_raw(&store, 3, "hades").await;
        insert_raw(&store, 7, "celeste").await;
        insert_raw(&store, 8, "celeste").await;
        insert_raw(&store, 99, "inside").await;

        let removed = store.dedup_slugs().await.expect("dedup");
        assert_eq!(removed, vec![3, 7, 10]);

        let rows = store.list_items().await.expect("list");
        let slugs = rows
            .iter()
            .map(|r| r.item.slug.clone())
            .collect::<std::collections::HashSet<_>>();
        assert_eq!(slugs.len(), rows.len());
        let ids = rows.iter().map(|r| r.item.external_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![8, 42, 99]);
    }

    #[tokio::test]
    async fn batch_dedup_covers_rows_from_earlier_runs() {
        let store = memory_store().await;
        insert_raw(&store, 50, "portal-2").await;

        let outcome = store
            .apply_batch(&[item(4, "portal-2", 1.99)], None)
            .await
            .expect("batch");
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.removed_duplicates, vec![4]);
        assert!(store.get_item(4).await.expect("get").is_none());
        assert!(store.get_item(50).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn final_batch_writes_success_audit() {
        let store = memory_store().await;
        let started_at = Utc::now();
        let outcome = store
            .apply_batch(
                &[item(1, "hades", 9.99)],
                Some(AuditDraft {
                    source: SYNC_SOURCE.to_string(),
                    started_at,
                    prior: SyncCounts {
                        fetched: 4,
                        inserted: 1,
                        updated: 1,
                        skipped: 1,
                    },
                }),
            )
            .await
            .expect("batch");

        let audit = outcome.audit.expect("audit row");
        assert_eq!(audit.status, SyncStatus::Success);
        assert_eq!(audit.counts(), SyncCounts { fetched: 4, inserted: 2, updated: 1, skipped: 1 });
        assert!(audit.counts().is_balanced());

        let last = store.last_audit(SYNC_SOURCE).await.expect("last").expect("present");
        assert_eq!(last, audit);
    }

    #[tokio::test]
    async fn failure_audit_has_zero_counts_and_is_latest() {
        let store = memory_store().await;
        assert!(store.last_audit(SYNC_SOURCE).await.expect("last").is_none());

        store
            .apply_batch(
                &[],
                Some(AuditDraft {
                    source: SYNC_SOURCE.to_string(),
                    started_at: Utc::now(),
                    prior: SyncCounts::default(),
                }),
            )
            .await
            .expect("empty batch");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let failed = store
            .record_failure(SYNC_SOURCE, Utc::now(), "rawg returned 502")
            .await
            .expect("failure row");

        assert_eq!(failed.status, SyncStatus::Error);
        assert_eq!(failed.counts(), SyncCounts::default());
        assert_eq!(failed.message.as_deref(), Some("rawg returned 502"));

        let last = store.last_audit(SYNC_SOURCE).await.expect("last").expect("present");
        assert_eq!(last.id, failed.id);
        assert!(store.last_audit("other").await.expect("last").is_none());
    }

    #[tokio::test]
    async fn failed_audit_insert_rolls_back_the_whole_batch() {
        let store = memory_store().await;
        sqlx::query("DROP TABLE sync_logs")
            .execute(store.pool())
            .await
            .expect("drop audit table");

        let result = store
            .apply_batch(
                &[item(1, "hades", 9.99), item(2, "celeste", 4.99)],
                Some(AuditDraft {
                    source: SYNC_SOURCE.to_string(),
                    started_at: Utc::now(),
                    prior: SyncCounts {
                        fetched: 2,
                        ..SyncCounts::default()
                    },
                }),
            )
            .await;

        assert!(matches!(result, Err(StoreError::Database(_))));
        assert!(store.list_items().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn concurrent_batches_on_a_file_database_both_commit() {
        let path = std::env::temp_dir().join(format!(
            "gcr-storage-concurrent-{}-{}.db",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let store = CatalogStore::connect(&url).await.expect("file store");

        for round in 0..5i64 {
            let left = [item(round * 10 + 1, "left", 1.0), item(round * 10 + 2, "left-2", 2.0)];
            let right = [item(round * 10 + 3, "right", 3.0), item(round * 10 + 4, "right-2", 4.0)];
            let (a, b) = tokio::join!(store.apply_batch(&left, None), store.apply_batch(&right, None));
            a.expect("left batch");
            b.expect("right batch");
        }

        // slugs repeat across rounds, so only the last round's rows survive dedup
        let ids: Vec<i64> = store
            .list_items()
            .await
            .expect("list")
            .iter()
            .map(|stored| stored.item.external_id)
            .collect();
        assert_eq!(ids, vec![41, 42, 43, 44]);

        store.pool().close().await;
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
        }
    }
}
