use std::sync::Arc;

use serde_json::{Map, Value};
use taskmaster_core::{EntityKind, entity_id};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::action_log::{ActionRecord, ActionType, NewAction, record_in};
use super::manager::SyncManager;
use super::store::{EntityRecord, StoreError, SyncState, write_in};

#[derive(Debug, Error)]
pub enum EntityError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },
    #[error("{0} payload must be a JSON object")]
    NotAnObject(EntityKind),
}

/// Local CRUD surface. Every write lands in the store and the action log in one
/// transaction.
#[derive(Clone)]
pub struct EntityService {
    manager: Arc<SyncManager>,
}

impl EntityService {
    pub fn new(manager: Arc<SyncManager>) -> Self {
        Self { manager }
    }

    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Value>, EntityError> {
        Ok(self
            .manager
            .store()
            .get(kind, id)
            .await?
            .map(|record| record.data))
    }

    pub async fn list(&self, kind: EntityKind) -> Result<Vec<Value>, EntityError> {
        Ok(self
            .manager
            .store()
            .list(kind)
            .await?
            .into_iter()
            .map(|record| record.data)
            .collect())
    }

    /// Cached row including tombstones and its sync state.
    pub async fn record(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> Result<Option<EntityRecord>, EntityError> {
        Ok(self.manager.store().get_record(kind, id).await?)
    }

    /// Stores a new entity, assigning a client id when the payload has none.
    pub async fn create(&self, kind: EntityKind, data: Value) -> Result<Value, EntityError> {
        let mut data = data;
        let id = match (entity_id(&data), data.as_object_mut()) {
            (_, None) => return Err(EntityError::NotAnObject(kind)),
            (Some(id), Some(_)) => id,
            (None, Some(object)) => {
                let id = Uuid::new_v4().to_string();
                object.insert("id".into(), Value::String(id.clone()));
                id
            }
        };
        self.write(ActionType::Create, kind, &id, data.clone(), false)
            .await?;
        Ok(data)
    }

    /// Shallow-merges `patch` into the cached copy. The id field cannot be changed.
    pub async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        patch: Value,
    ) -> Result<Value, EntityError> {
        let Value::Object(patch) = patch else {
            return Err(EntityError::NotAnObject(kind));
        };
        let current = self
            .manager
            .store()
            .get(kind, id)
            .await?
            .ok_or_else(|| EntityError::NotFound {
                kind,
                id: id.to_string(),
            })?;
        let merged = merge(current, patch, id);
        self.write(ActionType::Update, kind, id, merged.clone(), false)
            .await?;
        Ok(merged)
    }

    /// Hides the entity locally and queues its DELETE.
    pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), EntityError> {
        let current = self
            .manager
            .store()
            .get(kind, id)
            .await?
            .ok_or_else(|| EntityError::NotFound {
                kind,
                id: id.to_string(),
            })?;
        self.write(ActionType::Delete, kind, id, current.data, true)
            .await?;
        Ok(())
    }

    async fn write(
        &self,
        action_type: ActionType,
        kind: EntityKind,
        id: &str,
        data: Value,
        deleted: bool,
    ) -> Result<ActionRecord, EntityError> {
        let mut tx = self.manager.store().pool().begin().await?;
        write_in(&mut *tx, kind, id, &data, SyncState::Pending, deleted).await?;
        let action = record_in(
            &mut *tx,
            NewAction {
                action_type,
                entity: kind,
                entity_id: id.to_string(),
                data,
            },
        )
        .await?;
        tx.commit().await?;
        debug!(action = %action.id, entity = %kind, id, ?action_type, "recorded local change");
        self.manager.refresh_pending().await?;
        Ok(action)
    }
}

fn merge(current: EntityRecord, patch: Map<String, Value>, id: &str) -> Value {
    let mut object = match current.data {
        Value::Object(object) => object,
        _ => Map::new(),
    };
    for (key, value) in patch {
        if key != "id" {
            object.insert(key, value);
        }
    }
    if !object.contains_key("id") {
        object.insert("id".into(), Value::String(id.to_string()));
    }
    Value::Object(object)
}
