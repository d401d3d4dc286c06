//! Catalog journal
//!
//! SQLite-backed lifecycle record of every artifact ever listed. A listing
//! is merged per source page inside one transaction: the fresh rows are
//! staged in a temporary table, rows of that source that disappeared are
//! tombstoned, and the staged rows are upserted.

use chrono::NaiveDateTime;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::str::FromStr;
use tracing::{debug, info};

use super::models::{ArtifactDescriptor, CatalogEntry};
use super::{timestamp, Result};

const STAGING_CHUNK: usize = 100;

const SELECT_ENTRY: &str = r#"
    SELECT url, source, kind, name, href, size, last_modified, is_historical,
           first_seen, last_downloaded, last_processed, needs_processing, active
    FROM catalog
"#;

/// Counts reported by a merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub listed: usize,
    pub inserted: u64,
    pub tombstoned: u64,
    pub pending: u64,
}

/// Catalog journal backed by SQLite
#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Open (creating if needed) the catalog at `url` and run migrations
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory catalog
    pub async fn in_memory() -> Result<Self> {
        // Every in-memory connection is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Merge a fresh listing of `source` observed at `now`
    pub async fn merge(
        &self,
        source: &str,
        artifacts: &[ArtifactDescriptor],
        now: NaiveDateTime,
    ) -> Result<MergeStats> {
        let now = timestamp::format(now);
        let mut tx = self.pool.begin().await?;

        sqlx::query("DROP TABLE IF EXISTS temp.catalog_staging")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            CREATE TEMP TABLE catalog_staging (
                url TEXT PRIMARY KEY NOT NULL,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                href TEXT NOT NULL,
                size INTEGER,
                last_modified TEXT NOT NULL,
                is_historical INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        for chunk in artifacts.chunks(STAGING_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT OR REPLACE INTO catalog_staging \
                 (url, kind, name, href, size, last_modified, is_historical) ",
            );
            builder.push_values(chunk, |mut b, artifact| {
                b.push_bind(artifact.url.clone())
                    .push_bind(artifact.kind.as_str())
                    .push_bind(artifact.name.clone())
                    .push_bind(artifact.href.clone())
                    .push_bind(artifact.size)
                    .push_bind(timestamp::format(artifact.last_modified))
                    .push_bind(artifact.is_historical);
            });
            builder.build().execute(&mut *tx).await?;
        }

        let inserted: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM catalog_staging s \
             WHERE NOT EXISTS (SELECT 1 FROM catalog c WHERE c.url = s.url)",
        )
        .fetch_one(&mut *tx)
        .await?
        .get("n");

        let tombstoned = sqlx::query(
            r#"
            UPDATE catalog
            SET active = 0, needs_processing = 0
            WHERE source = ?1
              AND active = 1
              AND url NOT IN (SELECT url FROM catalog_staging)
            "#,
        )
        .bind(source)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            INSERT INTO catalog (
                url, source, kind, name, href, size, last_modified, is_historical,
                first_seen, last_downloaded, last_processed, needs_processing, active
            )
            SELECT url, ?1, kind, name, href, size, last_modified, is_historical,
                   ?2, NULL, NULL, 1, 1
            FROM catalog_staging
            WHERE true
            ON CONFLICT(url) DO UPDATE SET
                source = excluded.source,
                kind = excluded.kind,
                name = excluded.name,
                href = excluded.href,
                size = excluded.size,
                is_historical = excluded.is_historical,
                last_modified = MAX(catalog.last_modified, excluded.last_modified),
                needs_processing = CASE
                    WHEN catalog.last_downloaded IS NULL
                      OR excluded.last_modified > catalog.last_downloaded
                      OR catalog.active = 0
                    THEN 1
                    ELSE catalog.needs_processing
                END,
                active = 1
            "#,
        )
        .bind(source)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DROP TABLE temp.catalog_staging")
            .execute(&mut *tx)
            .await?;

        let pending: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM catalog WHERE source = ?1 AND needs_processing = 1",
        )
        .bind(source)
        .fetch_one(&mut *tx)
        .await?
        .get("n");

        tx.commit().await?;

        let stats = MergeStats {
            listed: artifacts.len(),
            inserted: inserted as u64,
            tombstoned,
            pending: pending as u64,
        };
        info!(
            source,
            listed = stats.listed,
            inserted = stats.inserted,
            tombstoned = stats.tombstoned,
            pending = stats.pending,
            "Merged listing into catalog"
        );
        Ok(stats)
    }

    /// Active entries that must be fetched and processed
    pub async fn pending(&self) -> Result<Vec<CatalogEntry>> {
        let sql = format!(
            "{} WHERE needs_processing = 1 AND active = 1 ORDER BY kind, url",
            SELECT_ENTRY
        );
        Ok(sqlx::query_as::<_, CatalogEntry>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn get(&self, url: &str) -> Result<Option<CatalogEntry>> {
        let sql = format!("{} WHERE url = ?1", SELECT_ENTRY);
        Ok(sqlx::query_as::<_, CatalogEntry>(&sql)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn all(&self) -> Result<Vec<CatalogEntry>> {
        let sql = format!("{} ORDER BY kind, url", SELECT_ENTRY);
        Ok(sqlx::query_as::<_, CatalogEntry>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Record successful fetches: (url, fetch instant)
    pub async fn mark_downloaded(&self, fetched: &[(String, NaiveDateTime)]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for (url, instant) in fetched {
            updated += sqlx::query(
                "UPDATE catalog SET last_downloaded = ?2 WHERE url = ?1 AND active = 1",
            )
            .bind(url)
            .bind(timestamp::format(*instant))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;

        debug!(updated, "Recorded downloads");
        Ok(updated)
    }

    /// Record successful loads: (url, fetch instant of the loaded data)
    pub async fn mark_processed(&self, processed: &[(String, NaiveDateTime)]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for (url, instant) in processed {
            updated += sqlx::query(
                "UPDATE catalog SET last_processed = ?2, needs_processing = 0 WHERE url = ?1",
            )
            .bind(url)
            .bind(timestamp::format(*instant))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;

        debug!(updated, "Recorded processed artifacts");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cvm::models::ArtifactKind;
    use chrono::{Duration, NaiveDate};

    const SOURCE: &str = "https://example.test/DOC/INF_DIARIO/DADOS/";

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn artifact(name: &str, modified: NaiveDateTime) -> ArtifactDescriptor {
        ArtifactDescriptor {
            kind: ArtifactKind::Position,
            name: name.to_string(),
            href: format!("{}.zip", name),
            url: format!("{}{}.zip", SOURCE, name),
            size: Some(1024),
            last_modified: modified,
            is_historical: false,
        }
    }

    #[tokio::test]
    async fn test_fresh_catalog_marks_everything_pending() {
        let catalog = Catalog::in_memory().await.unwrap();
        let listing = vec![
            artifact("inf_diario_fi_202312", at(2, 9)),
            artifact("inf_diario_fi_202401", at(16, 7)),
        ];

        let stats = catalog.merge(SOURCE, &listing, at(17, 0)).await.unwrap();
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.pending, 2);

        let pending = catalog.pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|e| e.active && e.last_downloaded.is_none()));
        assert_eq!(pending[0].first_seen, "2024-01-17 00:00:00");
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let catalog = Catalog::in_memory().await.unwrap();
        let listing = vec![artifact("inf_diario_fi_202401", at(16, 7))];

        catalog.merge(SOURCE, &listing, at(17, 0)).await.unwrap();
        let first = catalog.all().await.unwrap();
        catalog.merge(SOURCE, &listing, at(18, 0)).await.unwrap();
        let second = catalog.all().await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_current_entries_stay_settled() {
        let catalog = Catalog::in_memory().await.unwrap();
        let listing = vec![artifact("inf_diario_fi_202401", at(16, 7))];
        let url = listing[0].url.clone();

        catalog.merge(SOURCE, &listing, at(17, 0)).await.unwrap();
        catalog.mark_downloaded(&[(url.clone(), at(17, 1))]).await.unwrap();
        catalog.mark_processed(&[(url.clone(), at(17, 1))]).await.unwrap();

        let stats = catalog.merge(SOURCE, &listing, at(18, 0)).await.unwrap();
        assert_eq!(stats.pending, 0);
        assert!(catalog.pending().await.unwrap().is_empty());

        let entry = catalog.get(&url).await.unwrap().unwrap();
        assert_eq!(entry.last_downloaded.as_deref(), Some("2024-01-17 01:00:00"));
        assert!(entry.last_processed_at().unwrap() <= entry.last_downloaded_at().unwrap());
    }

    #[tokio::test]
    async fn test_upstream_update_requeues_entry() {
        let catalog = Catalog::in_memory().await.unwrap();
        let mut listing = vec![artifact("inf_diario_fi_202401", at(16, 7))];
        let url = listing[0].url.clone();

        catalog.merge(SOURCE, &listing, at(17, 0)).await.unwrap();
        catalog.mark_downloaded(&[(url.clone(), at(17, 1))]).await.unwrap();
        catalog.mark_processed(&[(url.clone(), at(17, 1))]).await.unwrap();

        listing[0].last_modified = at(18, 7);
        catalog.merge(SOURCE, &listing, at(18, 8)).await.unwrap();

        let entry = catalog.get(&url).await.unwrap().unwrap();
        assert!(entry.needs_processing);
        assert_eq!(entry.last_modified, "2024-01-18 07:00:00");
        assert_eq!(entry.last_downloaded.as_deref(), Some("2024-01-17 01:00:00"));
    }

    #[tokio::test]
    async fn test_older_listing_does_not_rewind_last_modified() {
        let catalog = Catalog::in_memory().await.unwrap();
        let mut listing = vec![artifact("inf_diario_fi_202401", at(16, 7))];
        catalog.merge(SOURCE, &listing, at(17, 0)).await.unwrap();

        listing[0].last_modified = at(16, 7) - Duration::days(3);
        catalog.merge(SOURCE, &listing, at(17, 1)).await.unwrap();

        let entry = catalog.get(&listing[0].url).await.unwrap().unwrap();
        assert_eq!(entry.last_modified, "2024-01-16 07:00:00");
    }

    #[tokio::test]
    async fn test_tombstone_and_reactivation() {
        let catalog = Catalog::in_memory().await.unwrap();
        let a = artifact("inf_diario_fi_202312", at(2, 9));
        let b = artifact("inf_diario_fi_202401", at(16, 7));
        catalog.merge(SOURCE, &[a.clone(), b.clone()], at(17, 0)).await.unwrap();
        catalog.mark_downloaded(&[(a.url.clone(), at(17, 1))]).await.unwrap();
        catalog.mark_processed(&[(a.url.clone(), at(17, 1))]).await.unwrap();

        // Another source never tombstones rows it did not list
        catalog
            .merge("https://example.test/CAD/DADOS/", &[], at(17, 2))
            .await
            .unwrap();
        assert_eq!(catalog.all().await.unwrap().iter().filter(|e| e.active).count(), 2);

        let stats = catalog.merge(SOURCE, &[b.clone()], at(18, 0)).await.unwrap();
        assert_eq!(stats.tombstoned, 1);
        let gone = catalog.get(&a.url).await.unwrap().unwrap();
        assert!(!gone.active);
        assert!(!gone.needs_processing);
        assert_eq!(gone.last_processed.as_deref(), Some("2024-01-17 01:00:00"));

        catalog.merge(SOURCE, &[a.clone(), b], at(19, 0)).await.unwrap();
        let back = catalog.get(&a.url).await.unwrap().unwrap();
        assert!(back.active);
        assert!(back.needs_processing);
    }

    #[tokio::test]
    async fn test_download_without_processing_stays_pending() {
        let catalog = Catalog::in_memory().await.unwrap();
        let listing = vec![artifact("inf_diario_fi_202401", at(16, 7))];
        catalog.merge(SOURCE, &listing, at(17, 0)).await.unwrap();
        catalog
            .mark_downloaded(&[(listing[0].url.clone(), at(17, 1))])
            .await
            .unwrap();

        catalog.merge(SOURCE, &listing, at(18, 0)).await.unwrap();
        assert_eq!(catalog.pending().await.unwrap().len(), 1);
    }
}
