use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::api::errors::DeliveryError;
use crate::flags::flag_models::{Flag, FlagType};
use crate::flags::override_models::Override;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagEventType {
    Connected,
    FlagCreated,
    FlagUpdated,
    FlagDeleted,
    OverrideSet,
    OverrideRemoved,
}

impl FlagEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagEventType::Connected => "connected",
            FlagEventType::FlagCreated => "flag_created",
            FlagEventType::FlagUpdated => "flag_updated",
            FlagEventType::FlagDeleted => "flag_deleted",
            FlagEventType::OverrideSet => "override_set",
            FlagEventType::OverrideRemoved => "override_removed",
        }
    }
}

impl fmt::Display for FlagEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagPayload {
    pub id: Uuid,
    pub key: String,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    pub default_value: String,
    pub description: Option<String>,
    pub actor_user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagDeletedPayload {
    pub id: Uuid,
    pub actor_user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverridePayload {
    pub flag_id: Uuid,
    pub user_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub actor_user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FlagEventPayload {
    Flag(FlagPayload),
    FlagDeleted(FlagDeletedPayload),
    Override(OverridePayload),
    Connected(ConnectedPayload),
}

/// A named event with its payload, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlagChangeEvent {
    #[serde(rename = "type")]
    pub event_type: FlagEventType,
    pub data: FlagEventPayload,
}

impl FlagChangeEvent {
    pub fn flag_created(flag: &Flag, actor_user_id: Uuid) -> Self {
        Self::for_flag(FlagEventType::FlagCreated, flag, actor_user_id)
    }

    pub fn flag_updated(flag: &Flag, actor_user_id: Uuid) -> Self {
        Self::for_flag(FlagEventType::FlagUpdated, flag, actor_user_id)
    }

    pub fn flag_deleted(flag_id: Uuid, actor_user_id: Uuid) -> Self {
        Self {
            event_type: FlagEventType::FlagDeleted,
            data: FlagEventPayload::FlagDeleted(FlagDeletedPayload {
                id: flag_id,
                actor_user_id,
            }),
        }
    }

    pub fn override_set(flag_override: &Override, actor_user_id: Uuid) -> Self {
        Self {
            event_type: FlagEventType::OverrideSet,
            data: FlagEventPayload::Override(OverridePayload {
                flag_id: flag_override.flag_id,
                user_id: flag_override.user_id,
                value: Some(flag_override.value.clone()),
                actor_user_id,
            }),
        }
    }

    pub fn override_removed(flag_id: Uuid, user_id: Uuid, actor_user_id: Uuid) -> Self {
        Self {
            event_type: FlagEventType::OverrideRemoved,
            data: FlagEventPayload::Override(OverridePayload {
                flag_id,
                user_id,
                value: None,
                actor_user_id,
            }),
        }
    }

    pub fn connected(connection_id: &str) -> Self {
        Self {
            event_type: FlagEventType::Connected,
            data: FlagEventPayload::Connected(ConnectedPayload {
                connection_id: connection_id.to_string(),
            }),
        }
    }

    fn for_flag(event_type: FlagEventType, flag: &Flag, actor_user_id: Uuid) -> Self {
        Self {
            event_type,
            data: FlagEventPayload::Flag(FlagPayload {
                id: flag.id,
                key: flag.key.clone(),
                flag_type: flag.flag_type,
                default_value: flag.default_value.clone(),
                description: flag.description.clone(),
                actor_user_id,
            }),
        }
    }

    /// The wire payload: just the data object, the event name travels separately.
    pub fn data_json(&self) -> Result<String, DeliveryError> {
        serde_json::to_string(&self.data).map_err(|e| DeliveryError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::flag_models::OwnerScope;
    use assert_json_diff::assert_json_eq;
    use chrono::Utc;
    use serde_json::{json, Value};

    #[test]
    fn test_flag_created_payload_shape() {
        let actor = Uuid::now_v7();
        let flag = Flag {
            id: Uuid::now_v7(),
            key: "beta".to_string(),
            flag_type: FlagType::Boolean,
            default_value: "false".to_string(),
            description: None,
            owner: OwnerScope::Personal { user_id: actor },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let event = FlagChangeEvent::flag_created(&flag, actor);
        let data: Value = serde_json::from_str(&event.data_json().unwrap()).unwrap();

        assert_eq!(event.event_type.as_str(), "flag_created");
        assert_json_eq!(
            data,
            json!({
                "id": flag.id,
                "key": "beta",
                "type": "boolean",
                "defaultValue": "false",
                "description": null,
                "actorUserId": actor,
            })
        );
    }

    #[test]
    fn test_flag_deleted_payload_shape() {
        let id = Uuid::now_v7();
        let actor = Uuid::now_v7();
        let event = FlagChangeEvent::flag_deleted(id, actor);
        let data: Value = serde_json::from_str(&event.data_json().unwrap()).unwrap();

        assert_eq!(event.event_type, FlagEventType::FlagDeleted);
        assert_json_eq!(data, json!({"id": id, "actorUserId": actor}));
    }

    #[test]
    fn test_override_removed_omits_value() {
        let flag_id = Uuid::now_v7();
        let user_id = Uuid::now_v7();
        let actor = Uuid::now_v7();
        let event = FlagChangeEvent::override_removed(flag_id, user_id, actor);
        let data: Value = serde_json::from_str(&event.data_json().unwrap()).unwrap();

        assert_json_eq!(
            data,
            json!({"flagId": flag_id, "userId": user_id, "actorUserId": actor})
        );
    }
}
