use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Entity collections exposed by the TaskMaster API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Task,
    Project,
    Note,
    Habit,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown entity kind: {0}")]
pub struct UnknownEntityKind(pub String);

impl EntityKind {
    /// Pull order: projects first so tasks referencing them land after their parent.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Project,
        EntityKind::Task,
        EntityKind::Note,
        EntityKind::Habit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::Project => "project",
            EntityKind::Note => "note",
            EntityKind::Habit => "habit",
        }
    }

    /// REST collection segment, e.g. `tasks` for `/api/tasks`.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Task => "tasks",
            EntityKind::Project => "projects",
            EntityKind::Note => "notes",
            EntityKind::Habit => "habits",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = UnknownEntityKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "task" => Ok(EntityKind::Task),
            "project" => Ok(EntityKind::Project),
            "note" => Ok(EntityKind::Note),
            "habit" => Ok(EntityKind::Habit),
            other => Err(UnknownEntityKind(other.to_string())),
        }
    }
}

/// Reads the `id` field of an entity payload. Numeric ids are normalized to strings.
pub fn entity_id(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert_eq!(
            "calendar".parse::<EntityKind>(),
            Err(UnknownEntityKind("calendar".into()))
        );
    }

    #[test]
    fn collection_is_plural_segment() {
        assert_eq!(EntityKind::Habit.collection(), "habits");
        assert_eq!(EntityKind::Task.collection(), "tasks");
    }

    #[test]
    fn entity_id_accepts_strings_and_numbers() {
        assert_eq!(entity_id(&json!({"id": "t-1"})), Some("t-1".into()));
        assert_eq!(entity_id(&json!({"id": 42})), Some("42".into()));
        assert_eq!(entity_id(&json!({"id": ""})), None);
        assert_eq!(entity_id(&json!({"title": "x"})), None);
    }
}
