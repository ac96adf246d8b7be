use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::errors::FlagError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntryType {
    Created,
    Updated,
    Deleted,
    OverrideSet,
    OverrideRemoved,
}

impl AuditEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEntryType::Created => "created",
            AuditEntryType::Updated => "updated",
            AuditEntryType::Deleted => "deleted",
            AuditEntryType::OverrideSet => "override_set",
            AuditEntryType::OverrideRemoved => "override_removed",
        }
    }
}

impl fmt::Display for AuditEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEntryType {
    type Err = FlagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(AuditEntryType::Created),
            "updated" => Ok(AuditEntryType::Updated),
            "deleted" => Ok(AuditEntryType::Deleted),
            "override_set" => Ok(AuditEntryType::OverrideSet),
            "override_removed" => Ok(AuditEntryType::OverrideRemoved),
            invalid => Err(FlagError::Internal(format!(
                "{invalid} is not a valid audit entry type"
            ))),
        }
    }
}

/// An immutable fact about something that happened to a flag. Fields are read-only
/// once constructed; the only way to remove an entry is deleting its flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    id: Uuid,
    #[serde(rename = "type")]
    entry_type: AuditEntryType,
    message: String,
    flag_id: Uuid,
    user_id: Uuid,
    created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(entry: NewAuditEntry, id: Uuid, created_at: DateTime<Utc>) -> Self {
        AuditLogEntry {
            id,
            entry_type: entry.entry_type,
            message: entry.message,
            flag_id: entry.flag_id,
            user_id: entry.user_id,
            created_at,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn entry_type(&self) -> AuditEntryType {
        self.entry_type
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn flag_id(&self) -> Uuid {
        self.flag_id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct AuditLogRow {
    pub id: Uuid,
    pub entry_type: String,
    pub message: String,
    pub flag_id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<AuditLogRow> for AuditLogEntry {
    type Error = FlagError;

    fn try_from(row: AuditLogRow) -> Result<Self, Self::Error> {
        Ok(AuditLogEntry {
            id: row.id,
            entry_type: row.entry_type.parse()?,
            message: row.message,
            flag_id: row.flag_id,
            user_id: row.user_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAuditEntry {
    pub entry_type: AuditEntryType,
    pub message: String,
    pub flag_id: Uuid,
    pub user_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    #[test]
    fn test_audit_entry_serializes_to_record_shape() {
        let flag_id = Uuid::now_v7();
        let user_id = Uuid::now_v7();
        let id = Uuid::now_v7();
        let created_at = Utc::now();
        let entry = AuditLogEntry::new(
            NewAuditEntry {
                entry_type: AuditEntryType::OverrideSet,
                message: "override set".to_string(),
                flag_id,
                user_id,
            },
            id,
            created_at,
        );

        assert_json_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({
                "id": id,
                "type": "override_set",
                "message": "override set",
                "flagId": flag_id,
                "userId": user_id,
                "createdAt": created_at,
            })
        );
    }

    #[test]
    fn test_row_with_unknown_entry_type_is_rejected() {
        let row = AuditLogRow {
            id: Uuid::now_v7(),
            entry_type: "renamed".to_string(),
            message: "flag renamed".to_string(),
            flag_id: Uuid::now_v7(),
            user_id: Uuid::now_v7(),
            created_at: Utc::now(),
        };
        assert!(matches!(
            AuditLogEntry::try_from(row),
            Err(FlagError::Internal(_))
        ));
    }
}
