//! SQLite persistence (rusqlite + r2d2, schema managed by refinery).

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::core::error::{AppError, AppResult};
use crate::storage::models::{
    AnalyticsEvent, Download, DownloadStatus, DownloadUpdate, NewDownload, User, UserStatus, UserUpdate,
};
use crate::storage::persistence::{start_of_today, Persistence};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

mod embedded {
    use refinery::embed_migrations;

    embed_migrations!("./migrations");
}

const DOWNLOAD_COLUMNS: &str = "id, user_id, url, title, status, progress, file_size, duration, format, quality, \
     message_id, file_id, created_at, started_at, completed_at, error_message, retry_count, metadata";

/// Create a new database connection pool and bring the schema up to date
///
/// Initializes a pool with up to 10 connections, each in WAL mode with a
/// busy timeout, and runs the embedded migrations on the first connection.
pub fn create_pool(database_path: &Path) -> AppResult<DbPool> {
    let manager = SqliteConnectionManager::file(database_path).with_init(|conn| {
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
    });
    let pool = Pool::builder()
        .max_size(10)
        .connection_timeout(Duration::from_secs(30))
        .build(manager)?;

    let mut conn = pool.get()?;
    embedded::migrations::runner()
        .run(&mut *conn)
        .map_err(|e| AppError::Configuration(format!("apply migrations: {}", e)))?;

    log::info!("Database ready at {}", database_path.display());
    Ok(pool)
}

/// Persistence backed by a pooled SQLite database.
///
/// Queries run on the blocking thread pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn open(database_path: &Path) -> AppResult<Self> {
        Ok(Self::new(create_pool(database_path)?))
    }

    async fn with_conn<T, F>(&self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&DbConnection) -> AppResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| AppError::Storage(format!("blocking task failed: {}", e)))?
    }
}

fn parse_column<T: FromStr>(value: String, idx: usize) -> rusqlite::Result<T> {
    T::from_str(&value).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unexpected value '{}'", value).into(),
        )
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        status: parse_column::<UserStatus>(row.get(2)?, 2)?,
        is_admin: row.get(3)?,
        plan: row.get(4)?,
        credits: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn download_from_row(row: &Row<'_>) -> rusqlite::Result<Download> {
    let metadata: String = row.get(17)?;
    Ok(Download {
        id: row.get(0)?,
        user_id: row.get(1)?,
        url: row.get(2)?,
        title: row.get(3)?,
        status: parse_column::<DownloadStatus>(row.get(4)?, 4)?,
        progress: row.get(5)?,
        file_size: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
        duration: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
        format: row.get(8)?,
        quality: row.get(9)?,
        message_id: row.get(10)?,
        file_id: row.get(11)?,
        created_at: row.get(12)?,
        started_at: row.get(13)?,
        completed_at: row.get(14)?,
        error_message: row.get(15)?,
        retry_count: row.get(16)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    })
}

fn select_download(conn: &DbConnection, download_id: i64) -> AppResult<Option<Download>> {
    let sql = format!("SELECT {} FROM downloads WHERE id = ?1", DOWNLOAD_COLUMNS);
    Ok(conn
        .query_row(&sql, params![download_id], download_from_row)
        .optional()?)
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn get_user(&self, user_id: i64) -> AppResult<Option<User>> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, username, status, is_admin, plan, credits, created_at FROM users WHERE id = ?1",
                    params![user_id],
                    user_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn create_user(&self, user: User) -> AppResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO users (id, username, status, is_admin, plan, credits, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    user.id,
                    user.username,
                    user.status.to_string(),
                    user.is_admin,
                    user.plan,
                    user.credits,
                    user.created_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_user(&self, user_id: i64, update: UserUpdate) -> AppResult<Option<User>> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE users SET
                    plan = COALESCE(?2, plan),
                    credits = COALESCE(?3, credits),
                    status = COALESCE(?4, status)
                 WHERE id = ?1",
                params![
                    user_id,
                    update.plan,
                    update.credits,
                    update.status.map(|s| s.to_string())
                ],
            )?;
            Ok(conn
                .query_row(
                    "SELECT id, username, status, is_admin, plan, credits, created_at FROM users WHERE id = ?1",
                    params![user_id],
                    user_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn get_user_daily_download_count(&self, user_id: i64, excluding_failed: bool) -> AppResult<u32> {
        let since = start_of_today();
        self.with_conn(move |conn| {
            let count: u32 = conn.query_row(
                "SELECT COUNT(*) FROM downloads
                 WHERE user_id = ?1 AND created_at >= ?2 AND (?3 = 0 OR status != 'failed')",
                params![user_id, since, excluding_failed],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    async fn get_user_downloads(
        &self,
        user_id: i64,
        limit: usize,
        status: Option<DownloadStatus>,
    ) -> AppResult<Vec<Download>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM downloads
                 WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at DESC, id DESC LIMIT ?3",
                DOWNLOAD_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![user_id, status.map(|s| s.to_string()), limit as i64],
                download_from_row,
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn count_active_downloads(&self, user_id: i64) -> AppResult<u32> {
        self.with_conn(move |conn| {
            let count: u32 = conn.query_row(
                "SELECT COUNT(*) FROM downloads
                 WHERE user_id = ?1 AND status IN ('pending', 'downloading', 'processing', 'uploading')",
                params![user_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    async fn create_download(&self, new: NewDownload) -> AppResult<i64> {
        self.with_conn(move |conn| {
            let metadata = serde_json::to_string(&new.metadata)?;
            conn.execute(
                "INSERT INTO downloads (user_id, url, status, quality, retry_count, metadata, created_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6)",
                params![
                    new.user_id,
                    new.url,
                    new.quality,
                    new.retry_count,
                    metadata,
                    chrono::Utc::now()
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn update_download(&self, download_id: i64, update: DownloadUpdate) -> AppResult<()> {
        // One statement, so concurrent writers to the same row only ever wait on the lock.
        self.with_conn(move |conn| {
            let metadata = update.metadata.as_ref().map(serde_json::to_string).transpose()?;
            let changed = conn.execute(
                "UPDATE downloads SET
                    status = COALESCE(?2, status),
                    progress = COALESCE(?3, progress),
                    title = COALESCE(?4, title),
                    file_size = COALESCE(?5, file_size),
                    duration = COALESCE(?6, duration),
                    format = COALESCE(?7, format),
                    message_id = COALESCE(?8, message_id),
                    file_id = COALESCE(?9, file_id),
                    started_at = COALESCE(?10, started_at),
                    completed_at = COALESCE(?11, completed_at),
                    error_message = COALESCE(?12, error_message),
                    metadata = CASE WHEN ?13 IS NULL THEN metadata ELSE json_patch(metadata, ?13) END
                 WHERE id = ?1",
                params![
                    download_id,
                    update.status.map(|s| s.to_string()),
                    update.progress,
                    update.title,
                    update.file_size.map(|v| v as i64),
                    update.duration.map(|v| v as i64),
                    update.format,
                    update.message_id,
                    update.file_id,
                    update.started_at,
                    update.completed_at,
                    update.error_message,
                    metadata
                ],
            )?;
            if changed == 0 {
                log::warn!("update_download: download {} does not exist", download_id);
            }
            Ok(())
        })
        .await
    }

    async fn get_download(&self, download_id: i64) -> AppResult<Option<Download>> {
        self.with_conn(move |conn| select_download(conn, download_id)).await
    }

    async fn create_analytics_event(&self, event: AnalyticsEvent) -> AppResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO analytics (event_type, user_id, data, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![
                    event.event_type,
                    event.user_id,
                    serde_json::to_string(&event.data)?,
                    event.timestamp
                ],
            )?;
            Ok(())
        })
        .await
    }
}
