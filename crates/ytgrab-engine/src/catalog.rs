//! Append-only media catalog.
//!
//! One SQLite row per successful item, written by a single task. The
//! engine only ever inserts; browsing and pruning belong to external
//! tooling.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::error::DownloadError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS downloads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    item_id TEXT NOT NULL,
    source_url TEXT NOT NULL,
    output_path TEXT NOT NULL,
    title TEXT NOT NULL,
    container TEXT NOT NULL,
    itag TEXT NOT NULL,
    bytes INTEGER NOT NULL,
    duration_secs INTEGER,
    tag_error TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// One catalog row.
#[derive(Debug, Clone)]
pub struct CatalogRecord {
    pub job_id: String,
    pub item_id: String,
    pub source_url: String,
    pub output_path: String,
    pub title: String,
    pub container: String,
    pub itag: String,
    pub bytes: u64,
    pub duration_secs: Option<u64>,
    /// Set when tag embedding failed; the item itself still succeeded.
    pub tag_error: Option<String>,
}

/// Insert-only SQLite store.
#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Open (and create) the catalog under the state directory.
    pub async fn open(path: &Path) -> Result<Self, DownloadError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        // A single connection serializes inserts by construction.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory catalog for tests.
    pub async fn open_in_memory() -> Result<Self, DownloadError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn record(&self, record: &CatalogRecord) -> Result<(), DownloadError> {
        sqlx::query(
            r#"
            INSERT INTO downloads
                (job_id, item_id, source_url, output_path, title, container,
                 itag, bytes, duration_secs, tag_error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&record.job_id)
        .bind(&record.item_id)
        .bind(&record.source_url)
        .bind(&record.output_path)
        .bind(&record.title)
        .bind(&record.container)
        .bind(&record.itag)
        .bind(record.bytes as i64)
        .bind(record.duration_secs.map(|d| d as i64))
        .bind(&record.tag_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Row count, used by tests and the status endpoint.
    pub async fn len(&self) -> Result<u64, DownloadError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM downloads")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }

    pub async fn is_empty(&self) -> Result<bool, DownloadError> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CatalogRecord {
        CatalogRecord {
            job_id: "j1".to_string(),
            item_id: "vid123".to_string(),
            source_url: "https://tube.example/watch?v=vid123".to_string(),
            output_path: "/out/Title.mp4".to_string(),
            title: "Title".to_string(),
            container: "mp4".to_string(),
            itag: "22".to_string(),
            bytes: 1 << 20,
            duration_secs: Some(212),
            tag_error: None,
        }
    }

    #[tokio::test]
    async fn inserts_accumulate() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        assert!(catalog.is_empty().await.unwrap());

        catalog.record(&record()).await.unwrap();
        catalog.record(&record()).await.unwrap();
        assert_eq!(catalog.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn tag_errors_are_stored_without_failing() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        let mut rec = record();
        rec.tag_error = Some("helper exited with 1".to_string());
        catalog.record(&rec).await.unwrap();
        assert_eq!(catalog.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn open_creates_the_state_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/catalog.db");
        let catalog = Catalog::open(&path).await.unwrap();
        catalog.record(&record()).await.unwrap();
        assert!(path.exists());
    }
}
