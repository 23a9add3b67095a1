use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool, migrate::Migrator};
use taskmaster_core::{EntityKind, UnknownEntityKind, entity_id};
use thiserror::Error;
use time::OffsetDateTime;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidEntityKind(#[from] UnknownEntityKind),
    #[error("invalid sync status: {0}")]
    InvalidSyncStatus(String),
    #[error("invalid action type: {0}")]
    InvalidActionType(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Synced,
    Pending,
}

impl SyncState {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::Pending => "pending",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "synced" => Ok(SyncState::Synced),
            "pending" => Ok(SyncState::Pending),
            other => Err(StoreError::InvalidSyncStatus(other.to_string())),
        }
    }
}

/// Cached copy of one entity. `deleted` rows are tombstones awaiting their DELETE.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub kind: EntityKind,
    pub id: String,
    pub data: Value,
    pub sync_status: SyncState,
    pub deleted: bool,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkPutOutcome {
    pub written: usize,
    pub skipped_pending: usize,
    pub missing_id: usize,
}

#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Single-connection in-memory database; more connections would each see their own copy.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Live copy of an entity; tombstones read as absent.
    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>, StoreError> {
        Ok(self
            .get_record(kind, id)
            .await?
            .filter(|record| !record.deleted))
    }

    pub async fn get_record(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> Result<Option<EntityRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        get_record_in(&mut conn, kind, id).await
    }

    pub async fn list(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT kind, id, data, sync_status, deleted, updated_at
             FROM entities
             WHERE kind = ?1 AND deleted = 0
             ORDER BY id ASC",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Writes a synced copy, replacing whatever is cached under the key.
    pub async fn put(&self, kind: EntityKind, id: &str, data: &Value) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        write_in(&mut conn, kind, id, data, SyncState::Synced, false).await
    }

    /// Pull-phase write. Pending rows are left alone so unsynced local edits survive.
    pub async fn bulk_put(
        &self,
        kind: EntityKind,
        entities: &[Value],
    ) -> Result<BulkPutOutcome, StoreError> {
        let now = now_millis();
        let mut outcome = BulkPutOutcome::default();
        let mut tx = self.pool.begin().await?;
        for entity in entities {
            let Some(id) = entity_id(entity) else {
                outcome.missing_id += 1;
                continue;
            };
            let result = sqlx::query(
                "INSERT INTO entities (kind, id, data, sync_status, deleted, updated_at)
                 VALUES (?1, ?2, ?3, 'synced', 0, ?4)
                 ON CONFLICT(kind, id) DO UPDATE SET
                    data = excluded.data,
                    sync_status = 'synced',
                    deleted = 0,
                    updated_at = excluded.updated_at
                 WHERE entities.sync_status = 'synced'",
            )
            .bind(kind.as_str())
            .bind(&id)
            .bind(serde_json::to_string(entity)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                outcome.skipped_pending += 1;
            } else {
                outcome.written += 1;
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    /// Drops synced rows of `kind` whose id is not in `keep`. Returns the number removed.
    pub async fn prune_synced(&self, kind: EntityKind, keep: &[String]) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM entities
             WHERE kind = ?1
                AND sync_status = 'synced'
                AND id NOT IN (SELECT value FROM json_each(?2))",
        )
        .bind(kind.as_str())
        .bind(serde_json::to_string(keep)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Marks the row synced once no unsynced action references it, optionally storing
    /// the server's copy. Returns false while newer local actions are still queued.
    pub async fn settle(
        &self,
        kind: EntityKind,
        id: &str,
        server_copy: Option<&Value>,
    ) -> Result<bool, StoreError> {
        let data = server_copy.map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            "UPDATE entities
             SET sync_status = 'synced',
                data = COALESCE(?3, data),
                updated_at = ?4
             WHERE kind = ?1 AND id = ?2
                AND NOT EXISTS (
                    SELECT 1 FROM actions
                    WHERE entity = ?1 AND entity_id = ?2 AND synced = 0
                )",
        )
        .bind(kind.as_str())
        .bind(id)
        .bind(data)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Removes an acknowledged tombstone unless the entity was touched again meanwhile.
    pub async fn remove_settled(&self, kind: EntityKind, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM entities
             WHERE kind = ?1 AND id = ?2 AND deleted = 1
                AND NOT EXISTS (
                    SELECT 1 FROM actions
                    WHERE entity = ?1 AND entity_id = ?2 AND synced = 0
                )",
        )
        .bind(kind.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Moves a row to the id the server assigned, dropping any cached row already there.
    pub async fn rekey(&self, kind: EntityKind, from: &str, to: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM entities WHERE kind = ?1 AND id = ?2")
            .bind(kind.as_str())
            .bind(to)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE entities
             SET id = ?3, data = json_set(data, '$.id', ?3)
             WHERE kind = ?1 AND id = ?2",
        )
        .bind(kind.as_str())
        .bind(from)
        .bind(to)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn count(&self, kind: EntityKind) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM entities WHERE kind = ?1 AND deleted = 0")
                .bind(kind.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    pub async fn count_pending(&self, kind: EntityKind) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM entities WHERE kind = ?1 AND sync_status = 'pending'",
        )
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}

async fn get_record_in(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: &str,
) -> Result<Option<EntityRecord>, StoreError> {
    let row = sqlx::query(
        "SELECT kind, id, data, sync_status, deleted, updated_at
         FROM entities
         WHERE kind = ?1 AND id = ?2",
    )
    .bind(kind.as_str())
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(record_from_row).transpose()
}

pub(crate) async fn write_in(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: &str,
    data: &Value,
    sync_status: SyncState,
    deleted: bool,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO entities (kind, id, data, sync_status, deleted, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(kind, id) DO UPDATE SET
            data = excluded.data,
            sync_status = excluded.sync_status,
            deleted = excluded.deleted,
            updated_at = excluded.updated_at",
    )
    .bind(kind.as_str())
    .bind(id)
    .bind(serde_json::to_string(data)?)
    .bind(sync_status.as_str())
    .bind(if deleted { 1 } else { 0 })
    .bind(now_millis())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<EntityRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    let data: String = row.try_get("data")?;
    let sync_status: String = row.try_get("sync_status")?;
    let deleted: i64 = row.try_get("deleted")?;
    Ok(EntityRecord {
        kind: EntityKind::from_str(&kind)?,
        id: row.try_get("id")?,
        data: serde_json::from_str(&data)?,
        sync_status: SyncState::parse(&sync_status)?,
        deleted: deleted != 0,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

pub(crate) fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_millis(value: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value) * 1_000_000)
        .map_err(|_| StoreError::InvalidTimestamp(value))
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("taskmaster");
    path.push("sync.db");
    Ok(path)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
