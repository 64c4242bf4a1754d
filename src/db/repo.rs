use super::model::PendingRow;
use crate::config::Config;
use crate::model::{PendingRequest, RequestDescriptor};
use crate::storage::{KeyValueStore, PendingStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

/// Open (creating if absent) the local database. Any failure is reported as
/// `StoreError::Unavailable` so callers can run with queuing disabled.
pub async fn init_pool(database_url: &str) -> StoreResult<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.starts_with("sqlite::memory");
    let mut options = SqliteConnectOptions::from_str(&normalized)
        .map_err(|err| StoreError::Unavailable(err.to_string()))?
        .create_if_missing(true);
    if !in_memory {
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
    }
    // Every connection to `sqlite::memory:` is a separate database.
    let max_connections = if in_memory { 1 } else { 4 };
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(|err| StoreError::Unavailable(err.to_string()))
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> StoreResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|err| StoreError::Unavailable(err.to_string()))?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn enqueue_request(pool: &Pool, request: &RequestDescriptor) -> StoreResult<i64> {
    let headers = serde_json::to_string(&request.headers)?;
    let body = request.body.as_ref().map(serde_json::to_string).transpose()?;
    let rec = sqlx::query(
        "INSERT INTO pending_requests (url, method, headers, body, synced, created_at) VALUES (?, ?, ?, ?, 0, ?) RETURNING id",
    )
    .bind(&request.url)
    .bind(&request.method)
    .bind(headers)
    .bind(body)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

fn pending_from_row(row: &SqliteRow) -> StoreResult<PendingRequest> {
    let raw = PendingRow {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        method: row.try_get("method")?,
        headers: row.try_get("headers")?,
        body: row.try_get::<Option<String>, _>("body")?,
        synced: row.try_get("synced")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    };
    Ok(raw.into_request()?)
}

#[instrument(skip_all)]
pub async fn list_pending_requests(pool: &Pool) -> StoreResult<Vec<PendingRequest>> {
    let rows = sqlx::query(
        "SELECT id, url, method, headers, body, synced, created_at FROM pending_requests WHERE synced = 0 ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;
    let mut pending = Vec::with_capacity(rows.len());
    for row in &rows {
        match pending_from_row(row) {
            Ok(record) => pending.push(record),
            Err(err) => {
                let id = row.try_get::<i64, _>("id").ok();
                warn!(?id, ?err, "skipping undecodable pending request");
            }
        }
    }
    Ok(pending)
}

#[instrument(skip_all)]
pub async fn mark_request_synced(pool: &Pool, id: i64) -> StoreResult<()> {
    sqlx::query("UPDATE pending_requests SET synced = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn purge_synced_requests(pool: &Pool) -> StoreResult<u64> {
    let res = sqlx::query("DELETE FROM pending_requests WHERE synced = 1")
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn count_pending_requests(pool: &Pool) -> StoreResult<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_requests WHERE synced = 0")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn kv_get(pool: &Pool, key: &str) -> StoreResult<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

#[instrument(skip_all)]
pub async fn kv_set(pool: &Pool, key: &str, value: &str) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO kv (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn kv_delete(pool: &Pool, key: &str) -> StoreResult<()> {
    sqlx::query("DELETE FROM kv WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn kv_keys(pool: &Pool) -> StoreResult<Vec<String>> {
    let keys = sqlx::query_scalar::<_, String>("SELECT key FROM kv ORDER BY key")
        .fetch_all(pool)
        .await?;
    Ok(keys)
}

/// SQLite implementation of both storage capabilities.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open the database at `database_url` and bring its schema up to date.
    pub async fn open(database_url: &str) -> StoreResult<Self> {
        let pool = init_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

/// Open the store described by `cfg`. Failures are logged and yield `None`,
/// which callers treat as "offline queuing disabled".
pub async fn open_local_store(cfg: &Config) -> Option<SqliteStore> {
    open_local_store_at(cfg, &cfg.database_url()).await
}

async fn open_local_store_at(cfg: &Config, database_url: &str) -> Option<SqliteStore> {
    if let Err(err) = cfg.ensure_dirs() {
        warn!(?err, data_dir = %cfg.app.data_dir, "cannot create data directory");
    }
    match SqliteStore::open(database_url).await {
        Ok(store) => Some(store),
        Err(err) => {
            warn!(?err, "local store unavailable; offline queuing disabled");
            None
        }
    }
}

#[async_trait]
impl PendingStore for SqliteStore {
    async fn enqueue(&self, request: &RequestDescriptor) -> StoreResult<i64> {
        enqueue_request(&self.pool, request).await
    }

    async fn list_pending(&self) -> StoreResult<Vec<PendingRequest>> {
        list_pending_requests(&self.pool).await
    }

    async fn mark_synced(&self, id: i64) -> StoreResult<()> {
        mark_request_synced(&self.pool, id).await
    }

    async fn purge_synced(&self) -> StoreResult<u64> {
        purge_synced_requests(&self.pool).await
    }

    async fn count_pending(&self) -> StoreResult<i64> {
        count_pending_requests(&self.pool).await
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        kv_get(&self.pool, key).await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        kv_set(&self.pool, key, value).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        kv_delete(&self.pool, key).await
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        kv_keys(&self.pool).await
    }
}
