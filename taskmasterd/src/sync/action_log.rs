use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, SqliteConnection, SqlitePool};
use taskmaster_core::EntityKind;
use time::OffsetDateTime;
use uuid::Uuid;

use super::store::{StoreError, from_millis, now_millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

impl ActionType {
    fn as_str(&self) -> &'static str {
        match self {
            ActionType::Create => "CREATE",
            ActionType::Update => "UPDATE",
            ActionType::Delete => "DELETE",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "CREATE" => Ok(ActionType::Create),
            "UPDATE" => Ok(ActionType::Update),
            "DELETE" => Ok(ActionType::Delete),
            other => Err(StoreError::InvalidActionType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
    pub action_type: ActionType,
    pub entity: EntityKind,
    pub entity_id: String,
    pub data: Value,
}

/// One pending or replayed local mutation. Only `synced` changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub entity: EntityKind,
    #[serde(rename = "entityId")]
    pub entity_id: String,
    pub data: Value,
    #[serde(rename = "createdAt", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub synced: bool,
}

/// Append-only log of local mutations, replayed in creation order.
#[derive(Clone)]
pub struct ActionLog {
    pool: SqlitePool,
}

impl ActionLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, action: NewAction) -> Result<ActionRecord, StoreError> {
        let mut conn = self.pool.acquire().await?;
        record_in(&mut conn, action).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ActionRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, action_type, entity, entity_id, data, created_at, synced
             FROM actions WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn list_unsynced(&self) -> Result<Vec<ActionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, action_type, entity, entity_id, data, created_at, synced
             FROM actions
             WHERE synced = 0
             ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Flips the synced flag. The record itself is kept for auditing.
    pub async fn mark_synced(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE actions SET synced = 1, synced_at = ?2 WHERE id = ?1 AND synced = 0",
        )
        .bind(id)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn pending_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM actions WHERE synced = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Points unsynced actions of a locally created entity at the id the server assigned.
    pub async fn rewrite_entity_id(
        &self,
        entity: EntityKind,
        from: &str,
        to: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE actions
             SET entity_id = ?3,
                data = CASE
                    WHEN json_extract(data, '$.id') IS NOT NULL THEN json_set(data, '$.id', ?3)
                    ELSE data
                END
             WHERE entity = ?1 AND entity_id = ?2 AND synced = 0",
        )
        .bind(entity.as_str())
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Deletes synced records older than `cutoff`. Unsynced records are never purged.
    pub async fn purge_synced_before(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError> {
        let cutoff_ms = (cutoff.unix_timestamp_nanos() / 1_000_000) as i64;
        let result = sqlx::query("DELETE FROM actions WHERE synced = 1 AND synced_at < ?1")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

pub(crate) async fn record_in(
    conn: &mut SqliteConnection,
    action: NewAction,
) -> Result<ActionRecord, StoreError> {
    let id = Uuid::new_v4().to_string();
    let created_ms = now_millis();
    sqlx::query(
        "INSERT INTO actions (id, action_type, entity, entity_id, data, created_at, synced)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
    )
    .bind(&id)
    .bind(action.action_type.as_str())
    .bind(action.entity.as_str())
    .bind(&action.entity_id)
    .bind(serde_json::to_string(&action.data)?)
    .bind(created_ms)
    .execute(&mut *conn)
    .await?;

    Ok(ActionRecord {
        id,
        action_type: action.action_type,
        entity: action.entity,
        entity_id: action.entity_id,
        data: action.data,
        created_at: from_millis(created_ms)?,
        synced: false,
    })
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ActionRecord, StoreError> {
    let action_type: String = row.try_get("action_type")?;
    let entity: String = row.try_get("entity")?;
    let data: String = row.try_get("data")?;
    let synced: i64 = row.try_get("synced")?;
    Ok(ActionRecord {
        id: row.try_get("id")?,
        action_type: ActionType::parse(&action_type)?,
        entity: EntityKind::from_str(&entity)?,
        entity_id: row.try_get("entity_id")?,
        data: serde_json::from_str(&data)?,
        created_at: from_millis(row.try_get("created_at")?)?,
        synced: synced != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::store::LocalStore;
    use serde_json::json;
    use time::Duration;

    async fn make_log() -> ActionLog {
        let store = LocalStore::open_in_memory().await.unwrap();
        ActionLog::new(store.pool().clone())
    }

    fn update(id: &str, title: &str) -> NewAction {
        NewAction {
            action_type: ActionType::Update,
            entity: EntityKind::Task,
            entity_id: id.into(),
            data: json!({"id": id, "title": title}),
        }
    }

    #[tokio::test]
    async fn record_appends_unsynced_entries_in_creation_order() {
        let log = make_log().await;
        let first = log.record(update("t1", "a")).await.unwrap();
        let second = log.record(update("t2", "b")).await.unwrap();
        let third = log.record(update("t1", "c")).await.unwrap();

        let unsynced = log.list_unsynced().await.unwrap();
        let ids: Vec<&str> = unsynced.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec![first.id.as_str(), second.id.as_str(), third.id.as_str()]);
        assert!(unsynced.iter().all(|a| !a.synced));
        assert_eq!(log.pending_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn mark_synced_keeps_the_record() {
        let log = make_log().await;
        let action = log.record(update("t1", "a")).await.unwrap();

        assert!(log.mark_synced(&action.id).await.unwrap());
        assert!(!log.mark_synced(&action.id).await.unwrap());

        assert!(log.list_unsynced().await.unwrap().is_empty());
        assert_eq!(log.pending_count().await.unwrap(), 0);
        let stored = log.get(&action.id).await.unwrap().unwrap();
        assert!(stored.synced);
        assert_eq!(stored.data, json!({"id": "t1", "title": "a"}));
    }

    #[tokio::test]
    async fn rewrite_entity_id_touches_only_unsynced_actions() {
        let log = make_log().await;
        let done = log.record(update("local", "a")).await.unwrap();
        log.mark_synced(&done.id).await.unwrap();
        let queued = log.record(update("local", "b")).await.unwrap();
        let other = log.record(update("t9", "c")).await.unwrap();

        let rewritten = log
            .rewrite_entity_id(EntityKind::Task, "local", "srv-7")
            .await
            .unwrap();

        assert_eq!(rewritten, 1);
        let queued = log.get(&queued.id).await.unwrap().unwrap();
        assert_eq!(queued.entity_id, "srv-7");
        assert_eq!(queued.data["id"], "srv-7");
        assert_eq!(log.get(&done.id).await.unwrap().unwrap().entity_id, "local");
        assert_eq!(log.get(&other.id).await.unwrap().unwrap().entity_id, "t9");
    }

    #[tokio::test]
    async fn purge_only_drops_old_synced_records() {
        let log = make_log().await;
        let synced = log.record(update("t1", "a")).await.unwrap();
        log.mark_synced(&synced.id).await.unwrap();
        let pending = log.record(update("t2", "b")).await.unwrap();

        let purged = log
            .purge_synced_before(OffsetDateTime::now_utc() - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(purged, 0);

        let purged = log
            .purge_synced_before(OffsetDateTime::now_utc() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(log.get(&synced.id).await.unwrap().is_none());
        assert!(log.get(&pending.id).await.unwrap().is_some());
    }

    #[test]
    fn record_serializes_with_wire_field_names() {
        let record = ActionRecord {
            id: "a1".into(),
            action_type: ActionType::Delete,
            entity: EntityKind::Habit,
            entity_id: "h1".into(),
            data: json!({"id": "h1"}),
            created_at: OffsetDateTime::UNIX_EPOCH,
            synced: false,
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "DELETE");
        assert_eq!(value["entity"], "habit");
        assert_eq!(value["entityId"], "h1");
        assert_eq!(value["createdAt"], "1970-01-01T00:00:00Z");
        assert_eq!(value["synced"], false);
    }
}
